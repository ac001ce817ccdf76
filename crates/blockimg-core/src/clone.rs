//! Clone chains
//!
//! A clone is a format-2 image whose parent spec names a protected snapshot
//! of another image. The parent never points at its clones; instead every
//! pool keeps a child index mapping parent specs to the clones living in
//! that pool, and lookups fan out across the cluster.

use crate::create::MirrorProvision;
use crate::directory::ensure_absent;
use crate::image::ImageHandle;
use crate::manager::ImageManager;
use crate::mirror::EnableRequest;
use crate::options::{ImageOption, ImageOptions};
use crate::progress::{NoOpProgress, Progress};
use crate::rollback::RollbackStack;
use crate::data_object_name;

use blockimg_common::{
    Error, Features, ImageId, MirrorMode, ParentInfo, ParentSpec, PoolId, ProtectionStatus,
    Result, SnapshotId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const METADATA_PAGE: usize = 64;

/// Clones of one parent snapshot, by pool
pub type ChildrenByPool = BTreeMap<PoolId, BTreeSet<ImageId>>;

impl ImageManager {
    /// Clone `parent_name@parent_snap` into `child_name`
    pub async fn clone_image(
        &self,
        parent_pool: PoolId,
        parent_name: &str,
        parent_snap: Option<&str>,
        child_pool: PoolId,
        child_name: &str,
        opts: &mut ImageOptions,
    ) -> Result<()> {
        self.clone_with_provision(
            parent_pool,
            parent_name,
            parent_snap,
            child_pool,
            child_name,
            opts,
            None,
        )
        .await
    }

    /// Clone, optionally as a non-primary image of a mirroring peer
    #[allow(clippy::too_many_arguments)]
    pub async fn clone_with_provision(
        &self,
        parent_pool: PoolId,
        parent_name: &str,
        parent_snap: Option<&str>,
        child_pool: PoolId,
        child_name: &str,
        opts: &mut ImageOptions,
        provision: Option<&MirrorProvision>,
    ) -> Result<()> {
        debug!(
            parent = parent_name,
            snap = ?parent_snap,
            child = child_name,
            opts = %opts,
            "Cloning image"
        );

        let Some(snap_name) = parent_snap.filter(|s| !s.is_empty()) else {
            return Err(Error::invalid_argument(
                "parent snapshot must be specified",
            ));
        };

        match opts.get_u64(ImageOption::Format) {
            None => opts.set_u64(ImageOption::Format, 2)?,
            Some(format) if format < 2 => {
                return Err(Error::invalid_argument(
                    "clones must use format 2 or later",
                ));
            }
            Some(_) => {}
        }

        if let Some(bits) = opts.get_u64(ImageOption::Features) {
            if !Features::from_bits(bits).is_subset_of(Features::ALL) {
                return Err(Error::unsupported(format!(
                    "features {bits:#x} not supported"
                )));
            }
        }

        ensure_absent(&self.directory(), child_pool, child_name).await?;

        let parent = self.open(parent_pool, parent_name, Some(snap_name)).await?;
        let result = self
            .clone_from(&parent, child_pool, child_name, opts, provision)
            .await;
        if let Err(e) = parent.close().await {
            warn!("Failed to close parent {}: {}", parent_name, e);
        }
        result
    }

    async fn clone_from(
        &self,
        parent: &ImageHandle,
        child_pool: PoolId,
        child_name: &str,
        opts: &mut ImageOptions,
        provision: Option<&MirrorProvision>,
    ) -> Result<()> {
        if parent.format().is_legacy() {
            return Err(Error::invalid_argument(
                "legacy images cannot be cloned",
            ));
        }
        let Some((snap_id, snap_name)) = parent.snap() else {
            return Err(Error::invalid_argument(
                "parent snapshot must be specified",
            ));
        };

        // Features, order, size and protection in one consistent read.
        let (parent_features, parent_order, snapshot) = parent.read_meta(|m| {
            (
                m.features,
                m.order,
                m.snapshot(snap_id)
                    .map(|s| (s.size, s.protection == ProtectionStatus::Protected)),
            )
        });
        let (size, protected) = snapshot
            .ok_or_else(|| Error::not_found(format!("snapshot {snap_name}")))?;

        if !parent_features.contains(Features::LAYERING) {
            return Err(Error::unsupported(format!(
                "parent {} does not support layering",
                parent.name()
            )));
        }
        if !protected {
            error!("Parent snapshot {}@{} must be protected", parent.name(), snap_name);
            return Err(Error::invalid_argument(format!(
                "parent snapshot {snap_name} is not protected"
            )));
        }

        if parent_features.contains(Features::JOURNALING) {
            let primary = self
                .journal()
                .is_tag_owner(parent.pool().id, parent.id())
                .await?;
            if !primary && provision.is_none() {
                return Err(Error::invalid_argument(format!(
                    "parent {} is a non-primary mirrored image",
                    parent.name()
                )));
            }
        }

        let features = opts
            .get_u64(ImageOption::Features)
            .map_or(parent_features, Features::from_bits);
        if !opts.is_set(ImageOption::Order) {
            opts.set_u64(ImageOption::Order, u64::from(parent_order))?;
        }
        if !features.contains(Features::LAYERING) {
            return Err(Error::invalid_argument("clones require layering"));
        }
        opts.set_u64(ImageOption::Features, features.bits())?;

        self.create_image(child_pool, child_name, size, opts, true, provision)
            .await?;

        let spec = ParentSpec::new(parent.pool().id, parent.id().clone(), snap_id);
        let mut rollback = RollbackStack::new();
        {
            let manager = self.clone();
            let name = child_name.to_string();
            rollback.push("remove child image", move || async move {
                manager.remove(child_pool, &name, false, &NoOpProgress).await
            });
        }

        match self
            .link_child(parent, &spec, size, child_pool, child_name, provision, &mut rollback)
            .await
        {
            Ok(child) => {
                rollback.commit();
                if let Err(e) = child.close().await {
                    warn!("Failed to close child {}: {}", child_name, e);
                }
                info!(parent = %spec, child = child_name, "Cloned image");
                Ok(())
            }
            Err(e) => {
                error!("Failed to clone {} into {}: {}", spec, child_name, e);
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn link_child(
        &self,
        parent: &ImageHandle,
        spec: &ParentSpec,
        overlap: u64,
        child_pool: PoolId,
        child_name: &str,
        provision: Option<&MirrorProvision>,
        rollback: &mut RollbackStack,
    ) -> Result<Arc<ImageHandle>> {
        let store = self.store().clone();
        let child = self.open(child_pool, child_name, None).await?;
        {
            let child = child.clone();
            rollback.push("close child image", move || async move { child.close().await });
        }

        store
            .set_parent(
                child_pool,
                child.id(),
                ParentInfo {
                    spec: spec.clone(),
                    overlap,
                },
            )
            .await?;
        store.add_child(child_pool, spec, child.id()).await?;
        {
            let store = store.clone();
            let spec = spec.clone();
            let child_id = child.id().clone();
            rollback.push("remove from child index", move || async move {
                store.remove_child(child_pool, &spec, &child_id).await
            });
        }

        // An unprotect may have started since the first check.
        parent.refresh().await?;
        let still_protected = parent.read_meta(|m| {
            m.snapshot(spec.snap_id)
                .is_some_and(|s| s.protection == ProtectionStatus::Protected)
        });
        if !still_protected {
            return Err(Error::invalid_argument(format!(
                "parent snapshot {spec} was unprotected during clone"
            )));
        }

        self.copy_metadata(parent, &child).await?;

        let child_journaling = child.read_meta(|m| m.features.contains(Features::JOURNALING));
        if child_journaling {
            let mode = match store.mirror_mode_get(child_pool).await {
                Ok(mode) => mode,
                Err(e) if e.is_unsupported() => MirrorMode::Disabled,
                Err(e) => return Err(e),
            };
            if mode == MirrorMode::Pool || provision.is_some() {
                EnableRequest {
                    store: store.as_ref(),
                    journal: self.journal().as_ref(),
                    pool: child_pool,
                    image_id: child.id(),
                    non_primary_global_id: provision.map(|p| p.global_image_id.as_str()),
                }
                .send()
                .await?;
            }
        }
        Ok(child)
    }

    async fn copy_metadata(&self, parent: &ImageHandle, child: &ImageHandle) -> Result<()> {
        let store = self.store();
        let mut last = String::new();
        loop {
            let pairs = match store
                .metadata_list(parent.pool().id, parent.id(), &last, METADATA_PAGE)
                .await
            {
                Ok(pairs) => pairs,
                Err(e) if e.is_unsupported() => {
                    debug!("Metadata not supported, skipping copy: {}", e);
                    return Ok(());
                }
                Err(e) => {
                    error!("Failed to list metadata of {}: {}", parent.name(), e);
                    return Err(e);
                }
            };
            let count = pairs.len();
            if count == 0 {
                return Ok(());
            }
            if let Some(key) = pairs.keys().next_back() {
                last.clone_from(key);
            }
            match store.metadata_set(child.pool().id, child.id(), pairs).await {
                Ok(()) => {}
                Err(e) if e.is_unsupported() => return Ok(()),
                Err(e) => {
                    error!("Failed to copy metadata to {}: {}", child.name(), e);
                    return Err(e);
                }
            }
            if count < METADATA_PAGE {
                return Ok(());
            }
        }
    }

    /// Clones of `spec` in every base pool of the cluster
    pub async fn list_children_info(&self, spec: &ParentSpec) -> Result<ChildrenByPool> {
        let store = self.store();
        let mut children = ChildrenByPool::new();
        for pool in store.pool_list().await? {
            let base = match store.pool_base_tier(pool.id).await {
                Ok(base) => base,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    error!("Failed to get base tier of pool {}: {}", pool.name, e);
                    return Err(e);
                }
            };
            if base != pool.id {
                debug!(pool = %pool.name, "Skipping cache tier");
                continue;
            }
            match store.get_children(pool.id, spec).await {
                Ok(ids) if !ids.is_empty() => {
                    children.insert(pool.id, ids);
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!("Failed to list children of {} in pool {}: {}", spec, pool.name, e);
                    return Err(e);
                }
            }
        }
        Ok(children)
    }
}

impl ImageHandle {
    fn spec_at(&self, snap_id: SnapshotId) -> ParentSpec {
        ParentSpec::new(self.pool().id, self.id().clone(), snap_id)
    }

    /// `(pool name, image name)` of every clone of the snapshot this handle
    /// is open at
    pub async fn list_children(&self) -> Result<BTreeSet<(String, String)>> {
        let Some((snap_id, _)) = self.snap() else {
            return Ok(BTreeSet::new());
        };
        let children = self
            .manager()
            .list_children_info(&self.spec_at(snap_id))
            .await?;

        let store = self.store();
        let mut names = BTreeSet::new();
        for (pool, ids) in children {
            let pool_name = store.pool_name(pool).await?;
            for id in ids {
                let name = store.dir_get_name(pool, &id).await?;
                names.insert((pool_name.clone(), name));
            }
        }
        Ok(names)
    }

    /// Flatten every clone of snapshot `snap_name`
    pub async fn flatten_children(&self, snap_name: &str, progress: &dyn Progress) -> Result<()> {
        self.refresh_if_required().await?;
        let snap_id = self
            .read_meta(|m| m.snapshot_by_name(snap_name).map(|s| s.id))
            .ok_or_else(|| Error::not_found(format!("snapshot {snap_name}")))?;
        let spec = self.spec_at(snap_id);
        let children = self.manager().list_children_info(&spec).await?;
        let total: u64 = children.values().map(|ids| ids.len() as u64).sum();

        let mut processed = 0;
        for (pool, ids) in children {
            for id in ids {
                let child = self.manager().open_by_id(pool, &id, None).await?;
                let result = self.flatten_child(&child, &spec).await;
                if let Err(e) = child.close().await {
                    warn!("Failed to close child {}: {}", child.name(), e);
                }
                if let Err(e) = result {
                    error!("Failed to flatten child {}: {}", child.name(), e);
                    return Err(e);
                }
                processed += 1;
                progress.update_progress(processed, total);
            }
        }
        Ok(())
    }

    async fn flatten_child(&self, child: &ImageHandle, spec: &ParentSpec) -> Result<()> {
        child.flatten(&NoOpProgress).await?;
        let (features, snapshots) = child.read_meta(|m| (m.features, m.snapshots.len()));
        if !features.contains(Features::DEEP_FLATTEN) && snapshots > 0 {
            match self
                .store()
                .remove_child(child.pool().id, spec, child.id())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Copy inherited data into this image and detach it from its parent
    pub async fn flatten(&self, progress: &dyn Progress) -> Result<()> {
        self.ensure_head()?;
        self.refresh_if_required().await?;
        self.prepare_image_update().await?;

        let (parent, prefix, order, features, snapshots) = self.read_meta(|m| {
            (
                m.parent.clone(),
                m.object_prefix.clone(),
                m.order,
                m.features,
                m.snapshots.len(),
            )
        });
        let Some(parent) = parent else {
            return Err(Error::invalid_argument(format!(
                "image {} has no parent",
                self.name()
            )));
        };

        let store = self.store();
        let parent_header = store
            .get_header(parent.spec.pool_id, &parent.spec.image_id)
            .await?;
        let objects = parent.overlap.div_ceil(1u64 << order);
        for index in 0..objects {
            let target = data_object_name(&prefix, index);
            match store.stat(self.pool().id, &target).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    let source = data_object_name(&parent_header.object_prefix, index);
                    match store.read(parent.spec.pool_id, &source).await {
                        Ok(data) => store.write_full(self.pool().id, &target, data).await?,
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
            progress.update_progress(index + 1, objects);
        }

        store.remove_parent(self.pool().id, self.id()).await?;
        if features.contains(Features::DEEP_FLATTEN) || snapshots == 0 {
            match store
                .remove_child(self.pool().id, &parent.spec, self.id())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!("Failed to remove {} from child index: {}", self.name(), e);
                    return Err(e);
                }
            }
        }

        self.notify_update().await;
        self.refresh().await?;
        info!(image = %self.name(), parent = %parent.spec, "Flattened image");
        Ok(())
    }
}
