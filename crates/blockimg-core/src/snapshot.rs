//! Snapshot operations
//!
//! Snapshot ids come from the pool's self-managed snapshot allocator; the
//! record itself lives in the image header. Protection guards a snapshot
//! that clones may depend on: unprotecting is refused while the child index
//! of any pool still lists a clone of it.

use crate::image::ImageHandle;
use crate::progress::{NoOpProgress, Progress};

use blockimg_common::{
    Error, Features, ParentSpec, ProtectionStatus, Result, SnapshotId, SnapshotInfo,
    SnapshotNamespace, SnapshotRecord,
};
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// Options of [`ImageHandle::snap_remove`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapRemoveFlags {
    /// Flatten every clone of the snapshot first
    pub flatten: bool,
    /// Unprotect the snapshot first
    pub unprotect: bool,
}

impl ImageHandle {
    fn require_current_format(&self) -> Result<()> {
        if self.format().is_legacy() {
            return Err(Error::unsupported(format!(
                "legacy image {} does not support snapshots",
                self.name()
            )));
        }
        Ok(())
    }

    fn snapshot_named(&self, name: &str) -> Result<SnapshotRecord> {
        self.read_meta(|m| m.snapshot_by_name(name).cloned())
            .ok_or_else(|| Error::not_found(format!("snapshot {name} of {}", self.name())))
    }

    pub async fn snap_create(&self, name: &str) -> Result<()> {
        debug!(image = %self.name(), snap = name, "Creating snapshot");
        self.ensure_head()?;
        self.require_current_format()?;
        if name.is_empty() {
            return Err(Error::invalid_argument("snapshot name is empty"));
        }
        self.refresh_if_required().await?;
        self.prepare_image_update().await?;

        if self.read_meta(|m| m.snapshot_by_name(name).is_some()) {
            return Err(Error::already_exists(format!(
                "snapshot {name} of {}",
                self.name()
            )));
        }

        let store = self.store();
        let snap_id = store.selfmanaged_snap_create(self.pool().id).await?;
        let (size, parent) = self.read_meta(|m| (m.size, m.parent.clone()));
        let record = SnapshotRecord {
            id: snap_id,
            name: name.to_string(),
            namespace: SnapshotNamespace::User,
            protection: ProtectionStatus::Unprotected,
            size,
            parent,
        };
        if let Err(e) = store.snapshot_add(self.pool().id, self.id(), record).await {
            if let Err(release) = store.selfmanaged_snap_remove(self.pool().id, snap_id).await {
                warn!("Failed to release snapshot id {}: {}", snap_id, release);
            }
            return Err(e);
        }

        self.notify_update().await;
        self.refresh().await?;
        info!(image = %self.name(), snap = name, id = %snap_id, "Snapshot created");
        Ok(())
    }

    pub async fn snap_list(&self) -> Result<Vec<SnapshotInfo>> {
        self.refresh_if_required().await?;
        Ok(self.read_meta(|m| {
            m.snapshots
                .iter()
                .map(|s| SnapshotInfo {
                    id: s.id,
                    name: s.name.clone(),
                    size: s.size,
                })
                .collect()
        }))
    }

    pub async fn snap_exists(&self, name: &str) -> Result<bool> {
        self.refresh_if_required().await?;
        Ok(self.read_meta(|m| m.snapshot_by_name(name).is_some()))
    }

    /// UNPROTECTING counts as protected
    pub async fn snap_is_protected(&self, name: &str) -> Result<bool> {
        self.refresh_if_required().await?;
        Ok(self.snapshot_named(name)?.is_protected())
    }

    pub async fn snap_get_namespace(&self, name: &str) -> Result<SnapshotNamespace> {
        self.refresh_if_required().await?;
        Ok(self.snapshot_named(name)?.namespace)
    }

    pub async fn snap_protect(&self, name: &str) -> Result<()> {
        self.ensure_head()?;
        self.require_current_format()?;
        self.refresh_if_required().await?;
        if !self.read_meta(|m| m.features.contains(Features::LAYERING)) {
            return Err(Error::unsupported(format!(
                "image {} does not support layering",
                self.name()
            )));
        }
        self.prepare_image_update().await?;

        let snap = self.snapshot_named(name)?;
        if snap.is_protected() {
            return Err(Error::busy(format!("snapshot {name} is already protected")));
        }
        self.store()
            .set_protection_status(self.pool().id, self.id(), snap.id, ProtectionStatus::Protected)
            .await?;
        self.notify_update().await;
        self.refresh().await?;
        info!(image = %self.name(), snap = name, "Snapshot protected");
        Ok(())
    }

    /// Unprotect `name` unless a clone of it exists in any pool
    pub async fn snap_unprotect(&self, name: &str) -> Result<()> {
        self.ensure_head()?;
        self.require_current_format()?;
        self.refresh_if_required().await?;
        if !self.read_meta(|m| m.features.contains(Features::LAYERING)) {
            return Err(Error::unsupported(format!(
                "image {} does not support layering",
                self.name()
            )));
        }
        self.prepare_image_update().await?;

        let snap = self.snapshot_named(name)?;
        if snap.protection == ProtectionStatus::Unprotected {
            return Err(Error::invalid_argument(format!(
                "snapshot {name} is already unprotected"
            )));
        }

        let store = self.store();
        store
            .set_protection_status(
                self.pool().id,
                self.id(),
                snap.id,
                ProtectionStatus::Unprotecting,
            )
            .await?;

        // Clones re-check protection after linking.
        let spec = ParentSpec::new(self.pool().id, self.id().clone(), snap.id);
        let children = match self.manager().list_children_info(&spec).await {
            Ok(children) => children,
            Err(e) => {
                self.restore_protection(snap.id).await;
                return Err(e);
            }
        };
        if !children.is_empty() {
            let count: usize = children.values().map(BTreeSet::len).sum();
            self.restore_protection(snap.id).await;
            return Err(Error::busy(format!(
                "snapshot {name} has {count} clone(s)"
            )));
        }

        store
            .set_protection_status(
                self.pool().id,
                self.id(),
                snap.id,
                ProtectionStatus::Unprotected,
            )
            .await?;
        self.notify_update().await;
        self.refresh().await?;
        info!(image = %self.name(), snap = name, "Snapshot unprotected");
        Ok(())
    }

    async fn restore_protection(&self, snap_id: SnapshotId) {
        if let Err(e) = self
            .store()
            .set_protection_status(self.pool().id, self.id(), snap_id, ProtectionStatus::Protected)
            .await
        {
            warn!("Failed to restore protection of snapshot {}: {}", snap_id, e);
        }
    }

    /// Remove a user snapshot, optionally flattening its clones and
    /// unprotecting it first
    pub async fn snap_remove(&self, name: &str, flags: SnapRemoveFlags) -> Result<()> {
        self.snap_remove_with_progress(name, flags, &NoOpProgress).await
    }

    pub async fn snap_remove_with_progress(
        &self,
        name: &str,
        flags: SnapRemoveFlags,
        progress: &dyn Progress,
    ) -> Result<()> {
        debug!(image = %self.name(), snap = name, ?flags, "Removing snapshot");
        self.ensure_head()?;
        self.require_current_format()?;
        self.refresh_if_required().await?;

        let snap = self.snapshot_named(name)?;
        if !snap.namespace.is_user() {
            return Err(Error::invalid_argument(format!(
                "snapshot {name} is not a user snapshot"
            )));
        }

        if flags.flatten {
            self.flatten_children(name, progress).await?;
        }

        if self.snap_is_protected(name).await? {
            if !flags.unprotect {
                return Err(Error::busy(format!("snapshot {name} is protected")));
            }
            self.snap_unprotect(name).await?;
            if self.snap_is_protected(name).await? {
                error!(
                    "Snapshot {}@{} still protected after unprotect",
                    self.name(),
                    name
                );
                std::process::abort();
            }
        }

        self.prepare_image_update().await?;
        let store = self.store();
        store
            .snapshot_remove(self.pool().id, self.id(), snap.id)
            .await?;
        if let Err(e) = store.selfmanaged_snap_remove(self.pool().id, snap.id).await {
            warn!("Failed to release snapshot id {}: {}", snap.id, e);
        }

        self.notify_update().await;
        self.refresh().await?;
        info!(image = %self.name(), snap = name, "Snapshot removed");
        Ok(())
    }

    /// Snapshot count limit; `u64::MAX` when unlimited or not supported
    pub async fn snap_get_limit(&self) -> Result<u64> {
        self.require_current_format()?;
        match self.store().snapshot_get_limit(self.pool().id, self.id()).await {
            Ok(limit) => Ok(limit),
            Err(e) if e.is_unsupported() => Ok(u64::MAX),
            Err(e) => Err(e),
        }
    }

    /// Set the snapshot count limit; `None` removes it
    pub async fn snap_set_limit(&self, limit: Option<u64>) -> Result<()> {
        self.ensure_head()?;
        self.require_current_format()?;
        self.prepare_image_update().await?;
        self.store()
            .snapshot_set_limit(self.pool().id, self.id(), limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ImageOption, ImageOptions};
    use crate::store::ClassFeature;
    use crate::testing::Fixture;
    use blockimg_common::GroupSpec;

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();

        image.snap_create("s1").await.unwrap();
        image.snap_create("s2").await.unwrap();
        assert!(matches!(
            image.snap_create("s1").await,
            Err(Error::AlreadyExists(_))
        ));
        let names: Vec<_> = image
            .snap_list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["s1", "s2"]);
        assert_eq!(
            image.snap_get_namespace("s1").await.unwrap(),
            SnapshotNamespace::User
        );

        image.snap_protect("s1").await.unwrap();
        assert!(image.snap_is_protected("s1").await.unwrap());
        assert!(matches!(image.snap_protect("s1").await, Err(Error::Busy(_))));
        assert!(matches!(
            image.snap_remove("s1", SnapRemoveFlags::default()).await,
            Err(Error::Busy(_))
        ));

        image
            .snap_remove(
                "s1",
                SnapRemoveFlags {
                    unprotect: true,
                    ..SnapRemoveFlags::default()
                },
            )
            .await
            .unwrap();
        image.snap_remove("s2", SnapRemoveFlags::default()).await.unwrap();
        assert!(image.snap_list().await.unwrap().is_empty());
        assert!(image
            .snap_remove("s2", SnapRemoveFlags::default())
            .await
            .unwrap_err()
            .is_not_found());
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unprotect_states() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        image.snap_create("s").await.unwrap();

        assert!(matches!(
            image.snap_unprotect("s").await,
            Err(Error::InvalidArgument(_))
        ));

        // An interrupted unprotect still counts as protected.
        let snap_id = image.snapshot_named("s").unwrap().id;
        fx.store()
            .set_protection_status(fx.pool, image.id(), snap_id, ProtectionStatus::Unprotecting)
            .await
            .unwrap();
        image.refresh().await.unwrap();
        assert!(image.snap_is_protected("s").await.unwrap());
        image.snap_unprotect("s").await.unwrap();
        assert!(!image.snap_is_protected("s").await.unwrap());
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_protect_requires_layering() {
        let fx = Fixture::new();
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Features, Features::EXCLUSIVE_LOCK.bits())
            .unwrap();
        fx.manager.create(fx.pool, "img", 1 << 20, &mut opts).await.unwrap();
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        image.snap_create("s").await.unwrap();
        assert!(image.snap_protect("s").await.unwrap_err().is_unsupported());
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_with_flatten_and_unprotect() {
        let fx = Fixture::new();
        fx.create("p", 1 << 20).await;
        let parent = fx.manager.open(fx.pool, "p", None).await.unwrap();
        parent.snap_create("s").await.unwrap();
        parent.snap_protect("s").await.unwrap();

        let mut opts = ImageOptions::new();
        fx.manager
            .clone_image(fx.pool, "p", Some("s"), fx.pool, "c", &mut opts)
            .await
            .unwrap();

        assert!(matches!(
            parent
                .snap_remove(
                    "s",
                    SnapRemoveFlags {
                        unprotect: true,
                        ..SnapRemoveFlags::default()
                    }
                )
                .await,
            Err(Error::Busy(_))
        ));
        assert!(parent.snap_is_protected("s").await.unwrap());

        parent
            .snap_remove(
                "s",
                SnapRemoveFlags {
                    flatten: true,
                    unprotect: true,
                },
            )
            .await
            .unwrap();
        assert!(!parent.snap_exists("s").await.unwrap());

        let child = fx.manager.open(fx.pool, "c", None).await.unwrap();
        assert!(child.meta().parent.is_none());
        child.close().await.unwrap();
        parent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_group_snapshots_are_not_removable() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        let snap_id = fx.store().selfmanaged_snap_create(fx.pool).await.unwrap();
        fx.store()
            .snapshot_add(
                fx.pool,
                image.id(),
                SnapshotRecord {
                    id: snap_id,
                    name: "group-snap".to_string(),
                    namespace: SnapshotNamespace::Group(GroupSpec {
                        pool_id: fx.pool,
                        group_id: "g1".to_string(),
                    }),
                    protection: ProtectionStatus::Unprotected,
                    size: 1 << 20,
                    parent: None,
                },
            )
            .await
            .unwrap();
        image.refresh().await.unwrap();

        assert!(matches!(
            image.snap_remove("group-snap", SnapRemoveFlags::default()).await,
            Err(Error::InvalidArgument(_))
        ));
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_limit() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        assert_eq!(image.snap_get_limit().await.unwrap(), u64::MAX);

        image.snap_set_limit(Some(1)).await.unwrap();
        assert_eq!(image.snap_get_limit().await.unwrap(), 1);
        image.snap_create("s1").await.unwrap();
        assert!(matches!(
            image.snap_create("s2").await,
            Err(Error::OutOfRange(_))
        ));

        fx.cluster.disable_class(ClassFeature::SnapshotLimit);
        assert_eq!(image.snap_get_limit().await.unwrap(), u64::MAX);
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_images_have_no_snapshots() {
        let fx = Fixture::new();
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Format, 1).unwrap();
        fx.manager.create(fx.pool, "old", 1 << 20, &mut opts).await.unwrap();
        let image = fx.manager.open(fx.pool, "old", None).await.unwrap();
        assert!(image.snap_create("s").await.unwrap_err().is_unsupported());
        assert!(image.snap_list().await.unwrap().is_empty());
        image.close().await.unwrap();
    }
}
