//! Image manager
//!
//! Entry point of the control plane. It owns the collaborators and the
//! configuration; image-level protocols are implemented on it and on
//! [`ImageHandle`] in their own modules.

use crate::directory::DirectoryClient;
use crate::image::ImageHandle;
use crate::journal::JournalClient;
use crate::store::MetadataStore;

use blockimg_common::{Config, ImageId, PoolId, PoolRef, Result};
use std::sync::Arc;
use tracing::debug;

/// Shared access to the store, the journal and the configuration
#[derive(Clone)]
pub struct ImageManager {
    store: Arc<dyn MetadataStore>,
    journal: Arc<dyn JournalClient>,
    config: Arc<Config>,
}

impl ImageManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        journal: Arc<dyn JournalClient>,
        config: Config,
    ) -> Self {
        Self {
            store,
            journal,
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<dyn JournalClient> {
        &self.journal
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn directory(&self) -> DirectoryClient {
        DirectoryClient::new(self.store.clone(), self.config.image.directory_page_size)
    }

    /// Look up a pool by name
    pub async fn pool(&self, name: &str) -> Result<PoolRef> {
        let id = self.store.pool_lookup(name).await?;
        Ok(PoolRef {
            id,
            name: name.to_string(),
        })
    }

    /// Look up a pool by id
    pub async fn pool_by_id(&self, id: PoolId) -> Result<PoolRef> {
        let name = self.store.pool_name(id).await?;
        Ok(PoolRef { id, name })
    }

    /// Open `name`, at snapshot `snap` when given
    pub async fn open(
        &self,
        pool: PoolId,
        name: &str,
        snap: Option<&str>,
    ) -> Result<Arc<ImageHandle>> {
        debug!(pool = %pool, image = name, snap = ?snap, "Opening image");
        let pool = self.pool_by_id(pool).await?;
        ImageHandle::open(self.clone(), pool, name, snap).await
    }

    /// Open a format-2 image by id
    pub async fn open_by_id(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap: Option<&str>,
    ) -> Result<Arc<ImageHandle>> {
        let name = self.store.dir_get_name(pool, id).await?;
        self.open(pool, &name, snap).await
    }

    /// Names of every image in the pool
    pub async fn list(&self, pool: PoolId) -> Result<Vec<String>> {
        self.directory().list(pool).await
    }
}
