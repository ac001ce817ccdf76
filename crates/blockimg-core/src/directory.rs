//! Metadata directory client
//!
//! Images are named through two indexes living in the same directory object:
//! the legacy single-object map holding bare names of format-1 images, and
//! the paginated name/id directory of format-2 images. Each format-2 image
//! also has an id object mapping its name to its id.

use crate::store::MetadataStore;
use crate::{id_obj_name, old_header_name};

use blockimg_common::{Error, ImageId, PoolId, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header layout of an image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// Format 1: single header object named after the image
    Legacy,
    /// Format 2: id object, header object and directory entry
    Current,
}

impl ImageFormat {
    #[must_use]
    pub const fn is_legacy(self) -> bool {
        matches!(self, Self::Legacy)
    }
}

/// Name/id lookups against a pool's directory
#[derive(Clone)]
pub struct DirectoryClient {
    store: Arc<dyn MetadataStore>,
    page_size: usize,
}

impl DirectoryClient {
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Detect which format `name` uses; `NotFound` when neither exists
    pub async fn detect_format(&self, pool: PoolId, name: &str) -> Result<ImageFormat> {
        match self.store.stat(pool, &old_header_name(name)).await {
            Ok(_) => return Ok(ImageFormat::Legacy),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.store.stat(pool, &id_obj_name(name)).await?;
        Ok(ImageFormat::Current)
    }

    /// Whether an image named `name` exists in either format
    pub async fn exists(&self, pool: PoolId, name: &str) -> Result<bool> {
        match self.detect_format(pool, name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Id of a format-2 image, read from its id object
    pub async fn image_id(&self, pool: PoolId, name: &str) -> Result<ImageId> {
        self.store.get_id(pool, name).await
    }

    /// Name of a format-2 image, read from the directory
    pub async fn image_name(&self, pool: PoolId, id: &ImageId) -> Result<String> {
        self.store.dir_get_name(pool, id).await
    }

    /// Names registered in the legacy map; empty when the directory is absent
    pub async fn list_legacy(&self, pool: PoolId) -> Result<Vec<String>> {
        match self.store.tmap_list(pool).await {
            Ok(names) => Ok(names),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// All format-2 entries, fetched page by page
    pub async fn list_current(&self, pool: PoolId) -> Result<BTreeMap<String, ImageId>> {
        let mut images = BTreeMap::new();
        let mut last = String::new();
        loop {
            let page = match self.store.dir_list(pool, &last, self.page_size).await {
                Ok(page) => page,
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    warn!("Failed to list directory of pool {}: {}", pool, e);
                    return Err(e);
                }
            };
            let count = page.len();
            if let Some(name) = page.keys().next_back() {
                last.clone_from(name);
            }
            images.extend(page);
            if count < self.page_size {
                break;
            }
        }
        Ok(images)
    }

    /// Legacy names followed by format-2 names
    pub async fn list(&self, pool: PoolId) -> Result<Vec<String>> {
        let mut names = self.list_legacy(pool).await?;
        names.extend(self.list_current(pool).await?.into_keys());
        debug!(pool = %pool, count = names.len(), "Listed images");
        Ok(names)
    }

    /// Resolve `name` to an id, through the id object or the directory
    pub async fn resolve_id(&self, pool: PoolId, name: &str) -> Result<ImageId> {
        match self.store.get_id(pool, name).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_not_found() => self.store.dir_get_id(pool, name).await,
            Err(e) => Err(e),
        }
    }
}

/// `AlreadyExists` if `name` is taken in either format
pub async fn ensure_absent(directory: &DirectoryClient, pool: PoolId, name: &str) -> Result<()> {
    if directory.exists(pool, name).await? {
        return Err(Error::already_exists(format!("image {name}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCluster;
    use bytes::Bytes;

    fn setup(page_size: usize) -> (MemoryCluster, PoolId, Arc<dyn MetadataStore>, DirectoryClient) {
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        let store: Arc<dyn MetadataStore> = Arc::new(cluster.connect());
        let directory = DirectoryClient::new(store.clone(), page_size);
        (cluster, pool, store, directory)
    }

    #[tokio::test]
    async fn test_detect_format() {
        let (_cluster, pool, store, directory) = setup(16);

        assert!(directory
            .detect_format(pool, "missing")
            .await
            .unwrap_err()
            .is_not_found());

        store
            .write_full(pool, &old_header_name("old"), Bytes::from_static(b"hdr"))
            .await
            .unwrap();
        store.set_id(pool, "new", &ImageId::new("1a")).await.unwrap();

        assert_eq!(
            directory.detect_format(pool, "old").await.unwrap(),
            ImageFormat::Legacy
        );
        assert_eq!(
            directory.detect_format(pool, "new").await.unwrap(),
            ImageFormat::Current
        );
        assert!(ensure_absent(&directory, pool, "new").await.is_err());
        ensure_absent(&directory, pool, "other").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_pages_through_directory() {
        let (_cluster, pool, store, directory) = setup(2);
        assert!(directory.list(pool).await.unwrap().is_empty());

        store.tmap_set(pool, "legacy").await.unwrap();
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            store
                .dir_add_image(pool, name, &ImageId::new(format!("id{i}")))
                .await
                .unwrap();
        }

        let names = directory.list(pool).await.unwrap();
        assert_eq!(names, vec!["legacy", "a", "b", "c", "d", "e"]);
        assert_eq!(
            directory.resolve_id(pool, "c").await.unwrap(),
            ImageId::new("id2")
        );
    }
}
