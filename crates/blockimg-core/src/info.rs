//! Image information and key/value metadata

use crate::image::ImageHandle;

use blockimg_common::{Error, Features, ImageInfo, ParentInfo, ParentNames, Result};
use std::collections::BTreeMap;
use tracing::debug;

impl ImageHandle {
    /// Parent linkage as seen at the handle's snapshot
    fn parent_at_snap(&self) -> Result<Option<ParentInfo>> {
        match self.snap() {
            None => Ok(self.read_meta(|m| m.parent.clone())),
            Some((snap_id, snap_name)) => self
                .read_meta(|m| m.snapshot(snap_id).map(|s| s.parent.clone()))
                .ok_or_else(|| Error::not_found(format!("snapshot {snap_name}"))),
        }
    }

    pub async fn info(&self) -> Result<ImageInfo> {
        let size = self.get_size().await?;
        let (order, prefix) = self.read_meta(|m| (m.order, m.object_prefix.clone()));
        let obj_size = 1u64 << order;
        Ok(ImageInfo {
            size,
            obj_size,
            num_objs: size.div_ceil(obj_size),
            order,
            block_name_prefix: prefix,
        })
    }

    /// Size of the image, or of the snapshot the handle is open at
    pub async fn get_size(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        match self.snap() {
            None => Ok(self.read_meta(|m| m.size)),
            Some((snap_id, snap_name)) => self
                .read_meta(|m| m.snapshot(snap_id).map(|s| s.size))
                .ok_or_else(|| Error::not_found(format!("snapshot {snap_name}"))),
        }
    }

    pub async fn get_features(&self) -> Result<Features> {
        self.refresh_if_required().await?;
        Ok(self.read_meta(|m| m.features))
    }

    pub async fn get_flags(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        Ok(self.read_meta(|m| m.flags))
    }

    #[must_use]
    pub fn get_old_format(&self) -> bool {
        self.format().is_legacy()
    }

    /// Bytes shared with the parent; 0 without a parent
    pub async fn get_overlap(&self) -> Result<u64> {
        self.refresh_if_required().await?;
        Ok(self.parent_at_snap()?.map_or(0, |p| p.overlap))
    }

    /// Pool, image and snapshot names of the parent
    pub async fn get_parent_info(&self) -> Result<ParentNames> {
        self.refresh_if_required().await?;
        let parent = self
            .parent_at_snap()?
            .ok_or_else(|| Error::not_found(format!("image {} has no parent", self.name())))?;
        let spec = parent.spec;

        let store = self.store();
        let pool_name = store.pool_name(spec.pool_id).await?;
        let image_name = store.dir_get_name(spec.pool_id, &spec.image_id).await?;
        let header = store.get_header(spec.pool_id, &spec.image_id).await?;
        let snap_name = header
            .snapshot(spec.snap_id)
            .map(|s| s.name.clone())
            .ok_or_else(|| Error::not_found(format!("parent snapshot {}", spec.snap_id)))?;

        debug!(image = %self.name(), parent = %spec, "Resolved parent");
        Ok(ParentNames {
            pool_name,
            image_name,
            snap_name,
        })
    }

    fn require_metadata_support(&self) -> Result<()> {
        if self.format().is_legacy() {
            return Err(Error::unsupported(format!(
                "legacy image {} has no metadata",
                self.name()
            )));
        }
        Ok(())
    }

    pub async fn metadata_get(&self, key: &str) -> Result<String> {
        self.require_metadata_support()?;
        self.store()
            .metadata_get(self.pool().id, self.id(), key)
            .await
    }

    pub async fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_head()?;
        self.require_metadata_support()?;
        if key.is_empty() {
            return Err(Error::invalid_argument("metadata key is empty"));
        }
        self.prepare_image_update().await?;
        let pairs = BTreeMap::from([(key.to_string(), value.to_string())]);
        self.store()
            .metadata_set(self.pool().id, self.id(), pairs)
            .await?;
        self.notify_update().await;
        Ok(())
    }

    pub async fn metadata_remove(&self, key: &str) -> Result<()> {
        self.ensure_head()?;
        self.require_metadata_support()?;
        self.prepare_image_update().await?;
        self.store()
            .metadata_remove(self.pool().id, self.id(), key)
            .await?;
        self.notify_update().await;
        Ok(())
    }

    /// Up to `max` pairs with keys after `start`; 0 means no limit
    pub async fn metadata_list(&self, start: &str, max: usize) -> Result<BTreeMap<String, String>> {
        self.require_metadata_support()?;
        self.store()
            .metadata_list(self.pool().id, self.id(), start, max)
            .await
    }
}
