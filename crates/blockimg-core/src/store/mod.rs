//! Backing metadata store interface
//!
//! The control plane never talks to the object store directly. Every remote
//! step goes through [`MetadataStore`]: plain object operations, atomic class
//! methods on well-known objects, lock primitives, watch/notify and a few
//! cluster-level calls. Each call is a single remote round trip that commits
//! on its own.

mod memory;

pub use memory::{ClassFeature, MemoryCluster, MemoryStore};

use async_trait::async_trait;
use blockimg_common::{
    ClientIdentity, Features, GroupSpec, ImageId, LockInfo, LockMode, Locker, MirrorImage,
    MirrorImageStatusState, MirrorMode, MirrorPeer, MirrorStatusRecord, ParentInfo, ParentSpec,
    PoolId, PoolRef, ProtectionStatus, Result, SnapshotId, SnapshotRecord,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Header of a current-format image, read in one call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub flags: u64,
    pub object_prefix: String,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub data_pool: Option<PoolId>,
    pub snapshots: Vec<SnapshotRecord>,
    pub parent: Option<ParentInfo>,
}

impl ImageHeader {
    #[must_use]
    pub fn new(size: u64, order: u8, features: Features, object_prefix: String) -> Self {
        Self {
            size,
            order,
            features,
            flags: 0,
            object_prefix,
            stripe_unit: 1 << order,
            stripe_count: 1,
            data_pool: None,
            snapshots: Vec::new(),
            parent: None,
        }
    }

    #[must_use]
    pub fn snapshot(&self, id: SnapshotId) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.id == id)
    }
}

/// Broadcast delivered to the watchers of an object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// Image header changed; watchers should refresh
    HeaderUpdate,
    /// A peer asks the current lock owner to release the exclusive lock
    RequestLock { requester: String, force: bool },
    AcquiredLock { owner: String },
    ReleasedLock { owner: String },
    /// Pool mirroring mode changed
    ModeUpdated(MirrorMode),
    /// Mirroring state of an image changed
    ImageUpdated {
        image_id: ImageId,
        global_image_id: String,
        state: blockimg_common::MirrorImageState,
    },
}

/// A registered watch on an object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherInfo {
    pub entity: String,
    pub address: String,
    pub handle: u64,
}

/// Receives notifications for a watched object
#[async_trait]
pub trait WatchHandler: Send + Sync {
    /// The returned result is relayed back to the notifier
    async fn handle_notify(&self, notification: &Notification) -> Result<()>;
}

/// Response of one watcher to a notification
#[derive(Clone, Debug)]
pub struct NotifyAck {
    pub entity: String,
    pub handle: u64,
    pub result: Result<()>,
}

/// Remote metadata and object store
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Identity of this client session
    fn client(&self) -> &ClientIdentity;

    // Cluster

    async fn pool_list(&self) -> Result<Vec<PoolRef>>;
    async fn pool_lookup(&self, name: &str) -> Result<PoolId>;
    async fn pool_name(&self, pool: PoolId) -> Result<String>;
    /// Pool a cache tier sits in front of; a base pool returns its own id
    async fn pool_base_tier(&self, pool: PoolId) -> Result<PoolId>;
    /// `InvalidArgument` when the pool is in pool-snapshot mode
    async fn selfmanaged_snap_create(&self, pool: PoolId) -> Result<SnapshotId>;
    async fn selfmanaged_snap_remove(&self, pool: PoolId, snap_id: SnapshotId) -> Result<()>;
    /// Fence every session connected from `address`
    async fn blacklist_add(&self, address: &str, expire_seconds: u32) -> Result<()>;

    // Objects

    /// Size of the object
    async fn stat(&self, pool: PoolId, oid: &str) -> Result<u64>;
    async fn read(&self, pool: PoolId, oid: &str) -> Result<Bytes>;
    async fn write_full(&self, pool: PoolId, oid: &str, data: Bytes) -> Result<()>;
    async fn remove(&self, pool: PoolId, oid: &str) -> Result<()>;
    async fn list_objects(&self, pool: PoolId, prefix: &str) -> Result<Vec<String>>;

    // Legacy directory

    async fn tmap_set(&self, pool: PoolId, name: &str) -> Result<()>;
    async fn tmap_rm(&self, pool: PoolId, name: &str) -> Result<()>;
    async fn tmap_list(&self, pool: PoolId) -> Result<Vec<String>>;

    // Current directory

    /// Create the id object of `name`; `AlreadyExists` if present
    async fn set_id(&self, pool: PoolId, name: &str, id: &ImageId) -> Result<()>;
    async fn get_id(&self, pool: PoolId, name: &str) -> Result<ImageId>;
    async fn dir_add_image(&self, pool: PoolId, name: &str, id: &ImageId) -> Result<()>;
    async fn dir_remove_image(&self, pool: PoolId, name: &str, id: &ImageId) -> Result<()>;
    async fn dir_get_id(&self, pool: PoolId, name: &str) -> Result<ImageId>;
    async fn dir_get_name(&self, pool: PoolId, id: &ImageId) -> Result<String>;
    /// Up to `max` entries with names strictly after `start_after`
    async fn dir_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<BTreeMap<String, ImageId>>;

    // Image header

    async fn create_header(&self, pool: PoolId, id: &ImageId, header: ImageHeader) -> Result<()>;
    async fn get_header(&self, pool: PoolId, id: &ImageId) -> Result<ImageHeader>;
    async fn set_size(&self, pool: PoolId, id: &ImageId, size: u64) -> Result<()>;
    async fn set_parent(&self, pool: PoolId, id: &ImageId, parent: ParentInfo) -> Result<()>;
    /// Detach HEAD from its parent; with deep-flatten snapshots are detached too
    async fn remove_parent(&self, pool: PoolId, id: &ImageId) -> Result<()>;
    async fn snapshot_add(&self, pool: PoolId, id: &ImageId, snap: SnapshotRecord) -> Result<()>;
    /// `Busy` while the snapshot is protected
    async fn snapshot_remove(&self, pool: PoolId, id: &ImageId, snap_id: SnapshotId)
    -> Result<()>;
    async fn set_protection_status(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapshotId,
        status: ProtectionStatus,
    ) -> Result<()>;
    /// `Unsupported` on clusters without snapshot limits
    async fn snapshot_get_limit(&self, pool: PoolId, id: &ImageId) -> Result<u64>;
    async fn snapshot_set_limit(&self, pool: PoolId, id: &ImageId, limit: Option<u64>)
    -> Result<()>;
    /// `Unsupported` on clusters without consistency groups
    async fn image_get_group(&self, pool: PoolId, id: &ImageId) -> Result<Option<GroupSpec>>;
    async fn metadata_list(
        &self,
        pool: PoolId,
        id: &ImageId,
        start_after: &str,
        max: usize,
    ) -> Result<BTreeMap<String, String>>;
    async fn metadata_set(
        &self,
        pool: PoolId,
        id: &ImageId,
        pairs: BTreeMap<String, String>,
    ) -> Result<()>;
    async fn metadata_get(&self, pool: PoolId, id: &ImageId, key: &str) -> Result<String>;
    async fn metadata_remove(&self, pool: PoolId, id: &ImageId, key: &str) -> Result<()>;

    // Child index, stored in the child's pool

    async fn add_child(&self, pool: PoolId, parent: &ParentSpec, child: &ImageId) -> Result<()>;
    async fn remove_child(&self, pool: PoolId, parent: &ParentSpec, child: &ImageId)
    -> Result<()>;
    async fn get_children(&self, pool: PoolId, parent: &ParentSpec) -> Result<BTreeSet<ImageId>>;

    // Advisory locks held by this session

    async fn lock(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()>;
    async fn unlock(&self, pool: PoolId, oid: &str, name: &str, cookie: &str) -> Result<()>;
    /// Remove another session's lock entry
    async fn break_lock(&self, pool: PoolId, oid: &str, name: &str, locker: &Locker)
    -> Result<()>;
    /// An unlocked object reports no lockers
    async fn get_lock_info(&self, pool: PoolId, oid: &str, name: &str) -> Result<LockInfo>;
    /// Succeeds only while this session holds the lock with `cookie`
    async fn assert_locked(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()>;

    // Watch/notify

    async fn watch(&self, pool: PoolId, oid: &str, handler: Arc<dyn WatchHandler>)
    -> Result<u64>;
    async fn unwatch(&self, pool: PoolId, oid: &str, handle: u64) -> Result<()>;
    async fn list_watchers(&self, pool: PoolId, oid: &str) -> Result<Vec<WatcherInfo>>;
    async fn notify(
        &self,
        pool: PoolId,
        oid: &str,
        notification: Notification,
    ) -> Result<Vec<NotifyAck>>;

    // Mirroring registry

    async fn mirror_uuid_get(&self, pool: PoolId) -> Result<String>;
    async fn mirror_uuid_set(&self, pool: PoolId, uuid: &str) -> Result<()>;
    async fn mirror_mode_get(&self, pool: PoolId) -> Result<MirrorMode>;
    async fn mirror_mode_set(&self, pool: PoolId, mode: MirrorMode) -> Result<()>;
    async fn mirror_peer_list(&self, pool: PoolId) -> Result<Vec<MirrorPeer>>;
    /// `Stale` when the uuid is already taken
    async fn mirror_peer_add(&self, pool: PoolId, peer: MirrorPeer) -> Result<()>;
    async fn mirror_peer_remove(&self, pool: PoolId, uuid: &str) -> Result<()>;
    async fn mirror_peer_set_client(&self, pool: PoolId, uuid: &str, client_name: &str)
    -> Result<()>;
    async fn mirror_peer_set_cluster(
        &self,
        pool: PoolId,
        uuid: &str,
        cluster_name: &str,
    ) -> Result<()>;
    /// Image id to global image id
    async fn mirror_image_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<BTreeMap<ImageId, String>>;
    async fn mirror_image_get(&self, pool: PoolId, id: &ImageId) -> Result<MirrorImage>;
    async fn mirror_image_set(&self, pool: PoolId, id: &ImageId, image: MirrorImage)
    -> Result<()>;
    async fn mirror_image_remove(&self, pool: PoolId, id: &ImageId) -> Result<()>;
    async fn mirror_image_status_set(
        &self,
        pool: PoolId,
        global_image_id: &str,
        status: MirrorStatusRecord,
    ) -> Result<()>;
    async fn mirror_image_status_get(
        &self,
        pool: PoolId,
        global_image_id: &str,
    ) -> Result<MirrorStatusRecord>;
    async fn mirror_image_status_remove(&self, pool: PoolId, global_image_id: &str)
    -> Result<()>;
    /// Registry entries after `start_after` with the statuses recorded for them
    async fn mirror_image_status_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<(
        BTreeMap<ImageId, MirrorImage>,
        BTreeMap<ImageId, MirrorStatusRecord>,
    )>;
    async fn mirror_image_status_summary(
        &self,
        pool: PoolId,
    ) -> Result<BTreeMap<MirrorImageStatusState, usize>>;
}
