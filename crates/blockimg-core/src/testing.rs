//! Shared test fixture

use crate::journal::MemoryJournal;
use crate::manager::ImageManager;
use crate::options::ImageOptions;
use crate::store::{MemoryCluster, MetadataStore};

use blockimg_common::{Config, PoolId};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// In-memory cluster with one pool and two client sessions
pub struct Fixture {
    pub cluster: MemoryCluster,
    pub journal: MemoryJournal,
    pub pool: PoolId,
    pub manager: ImageManager,
    peer: ImageManager,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        let journal = MemoryJournal::new();
        let manager = ImageManager::new(
            Arc::new(cluster.connect()),
            Arc::new(journal.clone()),
            config.clone(),
        );
        let peer = ImageManager::new(
            Arc::new(cluster.connect()),
            Arc::new(journal.clone()),
            config,
        );
        Self {
            cluster,
            journal,
            pool,
            manager,
            peer,
        }
    }

    /// Manager of a second client session
    pub fn peer(&self) -> &ImageManager {
        &self.peer
    }

    pub fn peer_address(&self) -> String {
        self.peer.store().client().address.clone()
    }

    pub fn peer_entity(&self) -> String {
        self.peer.store().client().entity.clone()
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        self.manager.store()
    }

    /// Create a format-2 image with default features
    pub async fn create(&self, name: &str, size: u64) {
        let mut opts = ImageOptions::new();
        self.manager
            .create(self.pool, name, size, &mut opts)
            .await
            .unwrap();
    }
}
