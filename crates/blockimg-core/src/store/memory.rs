//! In-memory metadata store
//!
//! [`MemoryCluster`] holds the state of a whole cluster; every
//! [`MemoryStore`] obtained from [`MemoryCluster::connect`] is one client
//! session with its own identity, so locks, watches and blacklisting behave
//! per client. The cluster also exposes switches used by embedders and tests:
//! optional class features, one-shot failures and per-operation counters.

use super::{ImageHeader, MetadataStore, Notification, NotifyAck, WatchHandler, WatcherInfo};
use crate::{DIRECTORY_OID, header_id};

use async_trait::async_trait;
use blockimg_common::{
    ClientIdentity, Error, GroupSpec, ImageId, LockInfo, LockMode, Locker, MirrorImage,
    MirrorImageState, MirrorImageStatusState, MirrorMode, MirrorPeer, MirrorStatusRecord,
    ParentInfo, ParentSpec, PoolId, PoolRef, ProtectionStatus, Result, SnapshotId,
    SnapshotRecord, Features,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Optional class methods a cluster may lack
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClassFeature {
    SnapshotLimit,
    Group,
    Metadata,
    Mirroring,
}

struct Watch {
    entity: String,
    address: String,
    handle: u64,
    handler: Arc<dyn WatchHandler>,
}

struct HeaderState {
    header: ImageHeader,
    group: Option<GroupSpec>,
    metadata: BTreeMap<String, String>,
    snapshot_limit: Option<u64>,
}

struct ObjectLock {
    mode: LockMode,
    tag: String,
    lockers: Vec<Locker>,
}

#[derive(Default)]
struct Mirroring {
    uuid: String,
    mode: MirrorMode,
    peers: Vec<MirrorPeer>,
    images: BTreeMap<ImageId, MirrorImage>,
    statuses: BTreeMap<String, MirrorStatusRecord>,
}

struct PoolState {
    name: String,
    base_tier: PoolId,
    selfmanaged_snaps: bool,
    next_snap_id: u64,
    objects: BTreeMap<String, Bytes>,
    directory_exists: bool,
    legacy_dir: BTreeSet<String>,
    dir_by_name: BTreeMap<String, ImageId>,
    dir_by_id: BTreeMap<ImageId, String>,
    headers: BTreeMap<ImageId, HeaderState>,
    children: BTreeMap<ParentSpec, BTreeSet<ImageId>>,
    locks: BTreeMap<(String, String), ObjectLock>,
    watches: BTreeMap<String, Vec<Watch>>,
    mirroring: Mirroring,
}

impl PoolState {
    fn new(name: &str, base_tier: PoolId) -> Self {
        Self {
            name: name.to_string(),
            base_tier,
            selfmanaged_snaps: true,
            next_snap_id: 1,
            objects: BTreeMap::new(),
            directory_exists: false,
            legacy_dir: BTreeSet::new(),
            dir_by_name: BTreeMap::new(),
            dir_by_id: BTreeMap::new(),
            headers: BTreeMap::new(),
            children: BTreeMap::new(),
            locks: BTreeMap::new(),
            watches: BTreeMap::new(),
            mirroring: Mirroring::default(),
        }
    }

    fn exists(&self, oid: &str) -> bool {
        if oid == DIRECTORY_OID {
            return self.directory_exists;
        }
        if let Some(id) = header_id(oid) {
            return self.headers.contains_key(&ImageId::new(id));
        }
        self.objects.contains_key(oid)
    }

    fn remove_object(&mut self, oid: &str) -> Result<()> {
        if !self.exists(oid) {
            return Err(Error::not_found(format!("object {oid}")));
        }
        if oid == DIRECTORY_OID {
            self.directory_exists = false;
            self.legacy_dir.clear();
            self.dir_by_name.clear();
            self.dir_by_id.clear();
        } else if let Some(id) = header_id(oid) {
            self.headers.remove(&ImageId::new(id));
        } else {
            self.objects.remove(oid);
        }
        self.locks.retain(|(o, _), _| o != oid);
        Ok(())
    }

    fn header(&self, id: &ImageId) -> Result<&HeaderState> {
        self.headers
            .get(id)
            .ok_or_else(|| Error::not_found(format!("image header {id}")))
    }

    fn header_mut(&mut self, id: &ImageId) -> Result<&mut HeaderState> {
        self.headers
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("image header {id}")))
    }

    fn snapshot_mut(&mut self, id: &ImageId, snap_id: SnapshotId) -> Result<&mut SnapshotRecord> {
        self.header_mut(id)?
            .header
            .snapshots
            .iter_mut()
            .find(|s| s.id == snap_id)
            .ok_or_else(|| Error::not_found(format!("snapshot {snap_id} of {id}")))
    }

    fn mirror_image(&self, id: &ImageId) -> Result<&MirrorImage> {
        self.mirroring
            .images
            .get(id)
            .ok_or_else(|| Error::not_found(format!("mirror image {id}")))
    }

    fn peer_mut(&mut self, uuid: &str) -> Result<&mut MirrorPeer> {
        self.mirroring
            .peers
            .iter_mut()
            .find(|p| p.uuid == uuid)
            .ok_or_else(|| Error::not_found(format!("mirror peer {uuid}")))
    }
}

/// Callback run once after an operation succeeds
type Hook = Box<dyn FnOnce(&MemoryCluster) + Send>;

struct ClusterState {
    pools: BTreeMap<PoolId, PoolState>,
    next_pool_id: i64,
    next_instance_id: u64,
    next_watch_handle: u64,
    blacklist: BTreeMap<String, u32>,
    disabled: HashSet<ClassFeature>,
    failpoints: HashMap<String, VecDeque<Error>>,
    hooks: HashMap<String, VecDeque<Hook>>,
    op_counts: HashMap<String, usize>,
}

impl ClusterState {
    /// Bookkeeping done before every remote call
    fn begin(&mut self, op: &str, client: &ClientIdentity, class: Option<ClassFeature>) -> Result<()> {
        *self.op_counts.entry(op.to_string()).or_default() += 1;
        if self.blacklist.contains_key(&client.address) {
            return Err(Error::Blacklisted(client.address.clone()));
        }
        if let Some(err) = self.failpoints.get_mut(op).and_then(VecDeque::pop_front) {
            debug!("Injecting failure into {}: {}", op, err);
            return Err(err);
        }
        if let Some(feature) = class {
            if self.disabled.contains(&feature) {
                return Err(Error::unsupported(format!("{feature:?} class methods")));
            }
        }
        Ok(())
    }

    fn take_hook<T>(&mut self, op: &str, result: &Result<T>) -> Option<Hook> {
        if result.is_err() {
            return None;
        }
        self.hooks.get_mut(op).and_then(VecDeque::pop_front)
    }

    fn pool_mut(&mut self, pool: PoolId) -> Result<&mut PoolState> {
        self.pools
            .get_mut(&pool)
            .ok_or_else(|| Error::not_found(format!("pool {pool}")))
    }
}

/// Shared state of an in-memory cluster
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                pools: BTreeMap::new(),
                next_pool_id: 1,
                next_instance_id: 4100,
                next_watch_handle: 1,
                blacklist: BTreeMap::new(),
                disabled: HashSet::new(),
                failpoints: HashMap::new(),
                hooks: HashMap::new(),
                op_counts: HashMap::new(),
            })),
        }
    }

    /// Open a new client session
    #[must_use]
    pub fn connect(&self) -> MemoryStore {
        let instance_id = {
            let mut state = self.state.lock();
            state.next_instance_id += 1;
            state.next_instance_id
        };
        MemoryStore {
            state: self.state.clone(),
            client: ClientIdentity::new(instance_id, format!("192.168.0.1:0/{instance_id}")),
        }
    }

    pub fn create_pool(&self, name: &str) -> PoolId {
        let mut state = self.state.lock();
        let id = PoolId::new(state.next_pool_id);
        state.next_pool_id += 1;
        state.pools.insert(id, PoolState::new(name, id));
        id
    }

    /// Create a cache tier in front of `base`
    pub fn create_cache_tier(&self, base: PoolId, name: &str) -> PoolId {
        let mut state = self.state.lock();
        let id = PoolId::new(state.next_pool_id);
        state.next_pool_id += 1;
        state.pools.insert(id, PoolState::new(name, base));
        id
    }

    /// Put a pool in pool-snapshot mode; self-managed snapshot allocation fails
    pub fn set_selfmanaged_snaps(&self, pool: PoolId, enabled: bool) {
        if let Some(p) = self.state.lock().pools.get_mut(&pool) {
            p.selfmanaged_snaps = enabled;
        }
    }

    pub fn disable_class(&self, feature: ClassFeature) {
        self.state.lock().disabled.insert(feature);
    }

    pub fn enable_class(&self, feature: ClassFeature) {
        self.state.lock().disabled.remove(&feature);
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_next(&self, op: &str, err: Error) {
        self.state
            .lock()
            .failpoints
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    /// Run `hook` right after the next successful call of `op`, before the
    /// caller sees the result
    pub fn after_next(&self, op: &str, hook: impl FnOnce(&Self) + Send + 'static) {
        self.state
            .lock()
            .hooks
            .entry(op.to_string())
            .or_default()
            .push_back(Box::new(hook));
    }

    /// Change the protection of a snapshot behind every session's back
    pub fn set_snapshot_protection(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapshotId,
        status: ProtectionStatus,
    ) {
        let mut state = self.state.lock();
        if let Some(snap) = state
            .pools
            .get_mut(&pool)
            .and_then(|p| p.snapshot_mut(id, snap_id).ok())
        {
            snap.protection = status;
        }
    }

    /// Number of calls of `op` made so far by any session
    #[must_use]
    pub fn op_count(&self, op: &str) -> usize {
        self.state.lock().op_counts.get(op).copied().unwrap_or(0)
    }

    pub fn set_image_group(&self, pool: PoolId, id: &ImageId, group: Option<GroupSpec>) {
        if let Some(h) = self
            .state
            .lock()
            .pools
            .get_mut(&pool)
            .and_then(|p| p.headers.get_mut(id))
        {
            h.group = group;
        }
    }

    #[must_use]
    pub fn object_exists(&self, pool: PoolId, oid: &str) -> bool {
        self.state
            .lock()
            .pools
            .get(&pool)
            .is_some_and(|p| p.exists(oid))
    }

    #[must_use]
    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.state.lock().blacklist.contains_key(address)
    }

    /// Drop every watch of the session at `address` without releasing its
    /// locks, as if the client process died
    pub fn expire_watches(&self, address: &str) {
        let mut state = self.state.lock();
        for pool in state.pools.values_mut() {
            for watches in pool.watches.values_mut() {
                watches.retain(|w| w.address != address);
            }
        }
    }
}

/// One client session of a [`MemoryCluster`]
pub struct MemoryStore {
    state: Arc<Mutex<ClusterState>>,
    client: ClientIdentity,
}

impl MemoryStore {
    fn with_cluster<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut ClusterState) -> Result<T>,
    ) -> Result<T> {
        let (result, hook) = {
            let mut state = self.state.lock();
            state.begin(op, &self.client, None)?;
            let result = f(&mut state);
            let hook = state.take_hook(op, &result);
            (result, hook)
        };
        self.run_hook(hook);
        result
    }

    fn run_hook(&self, hook: Option<Hook>) {
        if let Some(hook) = hook {
            hook(&MemoryCluster {
                state: self.state.clone(),
            });
        }
    }

    fn with_pool<T>(
        &self,
        op: &str,
        pool: PoolId,
        f: impl FnOnce(&mut PoolState) -> Result<T>,
    ) -> Result<T> {
        self.with_class(op, None, pool, f)
    }

    fn with_class<T>(
        &self,
        op: &str,
        class: Option<ClassFeature>,
        pool: PoolId,
        f: impl FnOnce(&mut PoolState) -> Result<T>,
    ) -> Result<T> {
        let (result, hook) = {
            let mut state = self.state.lock();
            state.begin(op, &self.client, class)?;
            let result = f(state.pool_mut(pool)?);
            let hook = state.take_hook(op, &result);
            (result, hook)
        };
        self.run_hook(hook);
        result
    }

    fn locker(&self, cookie: &str) -> Locker {
        Locker {
            entity: self.client.entity.clone(),
            cookie: cookie.to_string(),
            address: self.client.address.clone(),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    fn client(&self) -> &ClientIdentity {
        &self.client
    }

    async fn pool_list(&self) -> Result<Vec<PoolRef>> {
        self.with_cluster("pool_list", |s| {
            Ok(s.pools
                .iter()
                .map(|(id, p)| PoolRef {
                    id: *id,
                    name: p.name.clone(),
                })
                .collect())
        })
    }

    async fn pool_lookup(&self, name: &str) -> Result<PoolId> {
        self.with_cluster("pool_lookup", |s| {
            s.pools
                .iter()
                .find(|(_, p)| p.name == name)
                .map(|(id, _)| *id)
                .ok_or_else(|| Error::not_found(format!("pool {name}")))
        })
    }

    async fn pool_name(&self, pool: PoolId) -> Result<String> {
        self.with_pool("pool_name", pool, |p| Ok(p.name.clone()))
    }

    async fn pool_base_tier(&self, pool: PoolId) -> Result<PoolId> {
        self.with_pool("pool_base_tier", pool, |p| Ok(p.base_tier))
    }

    async fn selfmanaged_snap_create(&self, pool: PoolId) -> Result<SnapshotId> {
        self.with_pool("selfmanaged_snap_create", pool, |p| {
            if !p.selfmanaged_snaps {
                return Err(Error::invalid_argument(format!(
                    "pool {} uses pool snapshots",
                    p.name
                )));
            }
            let id = SnapshotId::new(p.next_snap_id);
            p.next_snap_id += 1;
            Ok(id)
        })
    }

    async fn selfmanaged_snap_remove(&self, pool: PoolId, _snap_id: SnapshotId) -> Result<()> {
        self.with_pool("selfmanaged_snap_remove", pool, |_| Ok(()))
    }

    async fn blacklist_add(&self, address: &str, expire_seconds: u32) -> Result<()> {
        self.with_cluster("blacklist_add", |s| {
            s.blacklist.insert(address.to_string(), expire_seconds);
            for pool in s.pools.values_mut() {
                for watches in pool.watches.values_mut() {
                    watches.retain(|w| w.address != address);
                }
            }
            Ok(())
        })
    }

    async fn stat(&self, pool: PoolId, oid: &str) -> Result<u64> {
        self.with_pool("stat", pool, |p| {
            if !p.exists(oid) {
                return Err(Error::not_found(format!("object {oid}")));
            }
            Ok(p.objects.get(oid).map_or(0, |b| b.len() as u64))
        })
    }

    async fn read(&self, pool: PoolId, oid: &str) -> Result<Bytes> {
        self.with_pool("read", pool, |p| {
            p.objects
                .get(oid)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("object {oid}")))
        })
    }

    async fn write_full(&self, pool: PoolId, oid: &str, data: Bytes) -> Result<()> {
        self.with_pool("write_full", pool, |p| {
            p.objects.insert(oid.to_string(), data);
            Ok(())
        })
    }

    async fn remove(&self, pool: PoolId, oid: &str) -> Result<()> {
        self.with_pool("remove", pool, |p| p.remove_object(oid))
    }

    async fn list_objects(&self, pool: PoolId, prefix: &str) -> Result<Vec<String>> {
        self.with_pool("list_objects", pool, |p| {
            Ok(p.objects
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        })
    }

    async fn tmap_set(&self, pool: PoolId, name: &str) -> Result<()> {
        self.with_pool("tmap_set", pool, |p| {
            p.directory_exists = true;
            p.legacy_dir.insert(name.to_string());
            Ok(())
        })
    }

    async fn tmap_rm(&self, pool: PoolId, name: &str) -> Result<()> {
        self.with_pool("tmap_rm", pool, |p| {
            if p.legacy_dir.remove(name) {
                Ok(())
            } else {
                Err(Error::not_found(format!("legacy directory entry {name}")))
            }
        })
    }

    async fn tmap_list(&self, pool: PoolId) -> Result<Vec<String>> {
        self.with_pool("tmap_list", pool, |p| {
            if !p.directory_exists {
                return Err(Error::not_found(DIRECTORY_OID));
            }
            Ok(p.legacy_dir.iter().cloned().collect())
        })
    }

    async fn set_id(&self, pool: PoolId, name: &str, id: &ImageId) -> Result<()> {
        self.with_pool("set_id", pool, |p| {
            let oid = crate::id_obj_name(name);
            if p.objects.contains_key(&oid) {
                return Err(Error::already_exists(oid));
            }
            p.objects
                .insert(oid, Bytes::copy_from_slice(id.as_str().as_bytes()));
            Ok(())
        })
    }

    async fn get_id(&self, pool: PoolId, name: &str) -> Result<ImageId> {
        self.with_pool("get_id", pool, |p| {
            let oid = crate::id_obj_name(name);
            let data = p
                .objects
                .get(&oid)
                .ok_or_else(|| Error::not_found(oid.clone()))?;
            let id = std::str::from_utf8(data)
                .map_err(|_| Error::Corrupt(format!("id object {oid}")))?;
            Ok(ImageId::new(id))
        })
    }

    async fn dir_add_image(&self, pool: PoolId, name: &str, id: &ImageId) -> Result<()> {
        self.with_pool("dir_add_image", pool, |p| {
            if p.dir_by_name.contains_key(name) || p.dir_by_id.contains_key(id) {
                return Err(Error::already_exists(format!("directory entry {name}")));
            }
            p.directory_exists = true;
            p.dir_by_name.insert(name.to_string(), id.clone());
            p.dir_by_id.insert(id.clone(), name.to_string());
            Ok(())
        })
    }

    async fn dir_remove_image(&self, pool: PoolId, name: &str, id: &ImageId) -> Result<()> {
        self.with_pool("dir_remove_image", pool, |p| {
            if p.dir_by_name.get(name) != Some(id) {
                return Err(Error::not_found(format!("directory entry {name}")));
            }
            p.dir_by_name.remove(name);
            p.dir_by_id.remove(id);
            Ok(())
        })
    }

    async fn dir_get_id(&self, pool: PoolId, name: &str) -> Result<ImageId> {
        self.with_pool("dir_get_id", pool, |p| {
            p.dir_by_name
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("directory entry {name}")))
        })
    }

    async fn dir_get_name(&self, pool: PoolId, id: &ImageId) -> Result<String> {
        self.with_pool("dir_get_name", pool, |p| {
            p.dir_by_id
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("directory entry for id {id}")))
        })
    }

    async fn dir_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<BTreeMap<String, ImageId>> {
        self.with_pool("dir_list", pool, |p| {
            if !p.directory_exists {
                return Err(Error::not_found(DIRECTORY_OID));
            }
            Ok(p.dir_by_name
                .iter()
                .filter(|(name, _)| name.as_str() > start_after)
                .take(max)
                .map(|(n, id)| (n.clone(), id.clone()))
                .collect())
        })
    }

    async fn create_header(&self, pool: PoolId, id: &ImageId, header: ImageHeader) -> Result<()> {
        self.with_pool("create_header", pool, |p| {
            if p.headers.contains_key(id) {
                return Err(Error::already_exists(crate::header_name(id)));
            }
            p.headers.insert(
                id.clone(),
                HeaderState {
                    header,
                    group: None,
                    metadata: BTreeMap::new(),
                    snapshot_limit: None,
                },
            );
            Ok(())
        })
    }

    async fn get_header(&self, pool: PoolId, id: &ImageId) -> Result<ImageHeader> {
        self.with_pool("get_header", pool, |p| Ok(p.header(id)?.header.clone()))
    }

    async fn set_size(&self, pool: PoolId, id: &ImageId, size: u64) -> Result<()> {
        self.with_pool("set_size", pool, |p| {
            p.header_mut(id)?.header.size = size;
            Ok(())
        })
    }

    async fn set_parent(&self, pool: PoolId, id: &ImageId, parent: ParentInfo) -> Result<()> {
        self.with_pool("set_parent", pool, |p| {
            let header = &mut p.header_mut(id)?.header;
            if !header.features.contains(Features::LAYERING) {
                return Err(Error::unsupported("image does not support layering"));
            }
            if header.parent.is_some() {
                return Err(Error::already_exists(format!("parent of {id}")));
            }
            header.parent = Some(parent);
            Ok(())
        })
    }

    async fn remove_parent(&self, pool: PoolId, id: &ImageId) -> Result<()> {
        self.with_pool("remove_parent", pool, |p| {
            let header = &mut p.header_mut(id)?.header;
            if header.parent.take().is_none() {
                return Err(Error::not_found(format!("parent of {id}")));
            }
            if header.features.contains(Features::DEEP_FLATTEN) {
                for snap in &mut header.snapshots {
                    snap.parent = None;
                }
            }
            Ok(())
        })
    }

    async fn snapshot_add(&self, pool: PoolId, id: &ImageId, snap: SnapshotRecord) -> Result<()> {
        self.with_pool("snapshot_add", pool, |p| {
            let state = p.header_mut(id)?;
            if state
                .header
                .snapshots
                .iter()
                .any(|s| s.id == snap.id || s.name == snap.name)
            {
                return Err(Error::already_exists(format!("snapshot {}", snap.name)));
            }
            if let Some(limit) = state.snapshot_limit {
                if state.header.snapshots.len() as u64 >= limit {
                    return Err(Error::OutOfRange(format!(
                        "snapshot limit {limit} reached"
                    )));
                }
            }
            state.header.snapshots.push(snap);
            Ok(())
        })
    }

    async fn snapshot_remove(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapshotId,
    ) -> Result<()> {
        self.with_pool("snapshot_remove", pool, |p| {
            if p.snapshot_mut(id, snap_id)?.is_protected() {
                return Err(Error::busy(format!("snapshot {snap_id} is protected")));
            }
            p.header_mut(id)?.header.snapshots.retain(|s| s.id != snap_id);
            Ok(())
        })
    }

    async fn set_protection_status(
        &self,
        pool: PoolId,
        id: &ImageId,
        snap_id: SnapshotId,
        status: ProtectionStatus,
    ) -> Result<()> {
        self.with_pool("set_protection_status", pool, |p| {
            p.snapshot_mut(id, snap_id)?.protection = status;
            Ok(())
        })
    }

    async fn snapshot_get_limit(&self, pool: PoolId, id: &ImageId) -> Result<u64> {
        self.with_class(
            "snapshot_get_limit",
            Some(ClassFeature::SnapshotLimit),
            pool,
            |p| Ok(p.header(id)?.snapshot_limit.unwrap_or(u64::MAX)),
        )
    }

    async fn snapshot_set_limit(
        &self,
        pool: PoolId,
        id: &ImageId,
        limit: Option<u64>,
    ) -> Result<()> {
        self.with_class(
            "snapshot_set_limit",
            Some(ClassFeature::SnapshotLimit),
            pool,
            |p| {
                p.header_mut(id)?.snapshot_limit = limit;
                Ok(())
            },
        )
    }

    async fn image_get_group(&self, pool: PoolId, id: &ImageId) -> Result<Option<GroupSpec>> {
        self.with_class("image_get_group", Some(ClassFeature::Group), pool, |p| {
            Ok(p.header(id)?.group.clone())
        })
    }

    async fn metadata_list(
        &self,
        pool: PoolId,
        id: &ImageId,
        start_after: &str,
        max: usize,
    ) -> Result<BTreeMap<String, String>> {
        self.with_class("metadata_list", Some(ClassFeature::Metadata), pool, |p| {
            let limit = if max == 0 { usize::MAX } else { max };
            Ok(p.header(id)?
                .metadata
                .iter()
                .filter(|(k, _)| k.as_str() > start_after)
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        })
    }

    async fn metadata_set(
        &self,
        pool: PoolId,
        id: &ImageId,
        pairs: BTreeMap<String, String>,
    ) -> Result<()> {
        self.with_class("metadata_set", Some(ClassFeature::Metadata), pool, |p| {
            p.header_mut(id)?.metadata.extend(pairs);
            Ok(())
        })
    }

    async fn metadata_get(&self, pool: PoolId, id: &ImageId, key: &str) -> Result<String> {
        self.with_class("metadata_get", Some(ClassFeature::Metadata), pool, |p| {
            p.header(id)?
                .metadata
                .get(key)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("metadata key {key}")))
        })
    }

    async fn metadata_remove(&self, pool: PoolId, id: &ImageId, key: &str) -> Result<()> {
        self.with_class("metadata_remove", Some(ClassFeature::Metadata), pool, |p| {
            p.header_mut(id)?
                .metadata
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(format!("metadata key {key}")))
        })
    }

    async fn add_child(&self, pool: PoolId, parent: &ParentSpec, child: &ImageId) -> Result<()> {
        self.with_pool("add_child", pool, |p| {
            if !p.children.entry(parent.clone()).or_default().insert(child.clone()) {
                return Err(Error::already_exists(format!("child {child} of {parent}")));
            }
            Ok(())
        })
    }

    async fn remove_child(
        &self,
        pool: PoolId,
        parent: &ParentSpec,
        child: &ImageId,
    ) -> Result<()> {
        self.with_pool("remove_child", pool, |p| {
            let set = p
                .children
                .get_mut(parent)
                .ok_or_else(|| Error::not_found(format!("children of {parent}")))?;
            if !set.remove(child) {
                return Err(Error::not_found(format!("child {child} of {parent}")));
            }
            if set.is_empty() {
                p.children.remove(parent);
            }
            Ok(())
        })
    }

    async fn get_children(&self, pool: PoolId, parent: &ParentSpec) -> Result<BTreeSet<ImageId>> {
        self.with_pool("get_children", pool, |p| {
            p.children
                .get(parent)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("children of {parent}")))
        })
    }

    async fn lock(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()> {
        let locker = self.locker(cookie);
        self.with_pool("lock", pool, |p| {
            if !p.exists(oid) {
                return Err(Error::not_found(format!("object {oid}")));
            }
            let key = (oid.to_string(), name.to_string());
            match p.locks.get_mut(&key) {
                None => {
                    p.locks.insert(
                        key,
                        ObjectLock {
                            mode,
                            tag: tag.to_string(),
                            lockers: vec![locker],
                        },
                    );
                    Ok(())
                }
                Some(lock) => {
                    if lock
                        .lockers
                        .iter()
                        .any(|l| l.entity == locker.entity && l.cookie == locker.cookie)
                    {
                        return Err(Error::already_exists(format!("lock {name} on {oid}")));
                    }
                    if lock.mode == LockMode::Exclusive || mode == LockMode::Exclusive {
                        return Err(Error::busy(format!("lock {name} on {oid} is held")));
                    }
                    if lock.tag != tag {
                        return Err(Error::busy(format!("lock {name} on {oid} has another tag")));
                    }
                    lock.lockers.push(locker);
                    Ok(())
                }
            }
        })
    }

    async fn unlock(&self, pool: PoolId, oid: &str, name: &str, cookie: &str) -> Result<()> {
        let entity = self.client.entity.clone();
        self.with_pool("unlock", pool, |p| {
            let key = (oid.to_string(), name.to_string());
            let lock = p
                .locks
                .get_mut(&key)
                .ok_or_else(|| Error::not_found(format!("lock {name} on {oid}")))?;
            let before = lock.lockers.len();
            lock.lockers
                .retain(|l| !(l.entity == entity && l.cookie == cookie));
            if lock.lockers.len() == before {
                return Err(Error::not_found(format!("locker {entity} {cookie}")));
            }
            if lock.lockers.is_empty() {
                p.locks.remove(&key);
            }
            Ok(())
        })
    }

    async fn break_lock(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        locker: &Locker,
    ) -> Result<()> {
        self.with_pool("break_lock", pool, |p| {
            let key = (oid.to_string(), name.to_string());
            let lock = p
                .locks
                .get_mut(&key)
                .ok_or_else(|| Error::not_found(format!("lock {name} on {oid}")))?;
            let before = lock.lockers.len();
            lock.lockers
                .retain(|l| !(l.entity == locker.entity && l.cookie == locker.cookie));
            if lock.lockers.len() == before {
                return Err(Error::not_found(format!(
                    "locker {} {}",
                    locker.entity, locker.cookie
                )));
            }
            if lock.lockers.is_empty() {
                p.locks.remove(&key);
            }
            Ok(())
        })
    }

    async fn get_lock_info(&self, pool: PoolId, oid: &str, name: &str) -> Result<LockInfo> {
        self.with_pool("get_lock_info", pool, |p| {
            if !p.exists(oid) {
                return Err(Error::not_found(format!("object {oid}")));
            }
            let key = (oid.to_string(), name.to_string());
            Ok(p.locks.get(&key).map_or_else(
                || LockInfo {
                    lockers: Vec::new(),
                    mode: LockMode::Exclusive,
                    tag: String::new(),
                },
                |l| LockInfo {
                    lockers: l.lockers.clone(),
                    mode: l.mode,
                    tag: l.tag.clone(),
                },
            ))
        })
    }

    async fn assert_locked(
        &self,
        pool: PoolId,
        oid: &str,
        name: &str,
        mode: LockMode,
        cookie: &str,
        tag: &str,
    ) -> Result<()> {
        let entity = self.client.entity.clone();
        self.with_pool("assert_locked", pool, |p| {
            let key = (oid.to_string(), name.to_string());
            let held = p.locks.get(&key).is_some_and(|l| {
                l.mode == mode
                    && l.tag == tag
                    && l.lockers
                        .iter()
                        .any(|x| x.entity == entity && x.cookie == cookie)
            });
            if held {
                Ok(())
            } else {
                Err(Error::busy(format!("lock {name} on {oid} is not held")))
            }
        })
    }

    async fn watch(
        &self,
        pool: PoolId,
        oid: &str,
        handler: Arc<dyn WatchHandler>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        state.begin("watch", &self.client, None)?;
        let handle = state.next_watch_handle;
        state.next_watch_handle += 1;
        let p = state.pool_mut(pool)?;
        if !p.exists(oid) {
            return Err(Error::not_found(format!("object {oid}")));
        }
        p.watches.entry(oid.to_string()).or_default().push(Watch {
            entity: self.client.entity.clone(),
            address: self.client.address.clone(),
            handle,
            handler,
        });
        Ok(handle)
    }

    async fn unwatch(&self, pool: PoolId, oid: &str, handle: u64) -> Result<()> {
        self.with_pool("unwatch", pool, |p| {
            let watches = p
                .watches
                .get_mut(oid)
                .ok_or_else(|| Error::not_found(format!("watch {handle} on {oid}")))?;
            let before = watches.len();
            watches.retain(|w| w.handle != handle);
            if watches.len() == before {
                return Err(Error::not_found(format!("watch {handle} on {oid}")));
            }
            Ok(())
        })
    }

    async fn list_watchers(&self, pool: PoolId, oid: &str) -> Result<Vec<WatcherInfo>> {
        self.with_pool("list_watchers", pool, |p| {
            if !p.exists(oid) {
                return Err(Error::not_found(format!("object {oid}")));
            }
            Ok(p.watches
                .get(oid)
                .map(|ws| {
                    ws.iter()
                        .map(|w| WatcherInfo {
                            entity: w.entity.clone(),
                            address: w.address.clone(),
                            handle: w.handle,
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    async fn notify(
        &self,
        pool: PoolId,
        oid: &str,
        notification: Notification,
    ) -> Result<Vec<NotifyAck>> {
        // Handlers may call back into the store, so collect them and drop
        // the cluster lock before delivering.
        let targets: Vec<(String, u64, Arc<dyn WatchHandler>)> =
            self.with_pool("notify", pool, |p| {
                Ok(p.watches
                    .get(oid)
                    .map(|ws| {
                        ws.iter()
                            .map(|w| (w.entity.clone(), w.handle, w.handler.clone()))
                            .collect()
                    })
                    .unwrap_or_default())
            })?;

        let notification = &notification;
        let acks = futures::future::join_all(targets.into_iter().map(
            |(entity, handle, handler)| async move {
                let result = handler.handle_notify(notification).await;
                NotifyAck {
                    entity,
                    handle,
                    result,
                }
            },
        ))
        .await;
        Ok(acks)
    }

    async fn mirror_uuid_get(&self, pool: PoolId) -> Result<String> {
        self.with_class("mirror_uuid_get", Some(ClassFeature::Mirroring), pool, |p| {
            if p.mirroring.uuid.is_empty() {
                return Err(Error::not_found("mirror uuid"));
            }
            Ok(p.mirroring.uuid.clone())
        })
    }

    async fn mirror_uuid_set(&self, pool: PoolId, uuid: &str) -> Result<()> {
        self.with_class("mirror_uuid_set", Some(ClassFeature::Mirroring), pool, |p| {
            if uuid.is_empty() {
                return Err(Error::invalid_argument("empty mirror uuid"));
            }
            p.mirroring.uuid = uuid.to_string();
            Ok(())
        })
    }

    async fn mirror_mode_get(&self, pool: PoolId) -> Result<MirrorMode> {
        self.with_class("mirror_mode_get", Some(ClassFeature::Mirroring), pool, |p| {
            Ok(p.mirroring.mode)
        })
    }

    async fn mirror_mode_set(&self, pool: PoolId, mode: MirrorMode) -> Result<()> {
        self.with_class("mirror_mode_set", Some(ClassFeature::Mirroring), pool, |p| {
            if mode != MirrorMode::Disabled && p.mirroring.uuid.is_empty() {
                return Err(Error::invalid_argument("mirror uuid not set"));
            }
            if mode == MirrorMode::Disabled && !p.mirroring.peers.is_empty() {
                return Err(Error::busy("mirror peers still registered"));
            }
            p.mirroring.mode = mode;
            Ok(())
        })
    }

    async fn mirror_peer_list(&self, pool: PoolId) -> Result<Vec<MirrorPeer>> {
        self.with_class("mirror_peer_list", Some(ClassFeature::Mirroring), pool, |p| {
            Ok(p.mirroring.peers.clone())
        })
    }

    async fn mirror_peer_add(&self, pool: PoolId, peer: MirrorPeer) -> Result<()> {
        self.with_class("mirror_peer_add", Some(ClassFeature::Mirroring), pool, |p| {
            if p.mirroring.mode == MirrorMode::Disabled {
                return Err(Error::invalid_argument("mirroring is disabled on the pool"));
            }
            if p.mirroring.peers.iter().any(|x| x.uuid == peer.uuid) {
                return Err(Error::Stale(format!("peer uuid {} in use", peer.uuid)));
            }
            if p.mirroring
                .peers
                .iter()
                .any(|x| x.cluster_name == peer.cluster_name && x.client_name == peer.client_name)
            {
                return Err(Error::already_exists(format!(
                    "peer {}/{}",
                    peer.cluster_name, peer.client_name
                )));
            }
            p.mirroring.peers.push(peer);
            Ok(())
        })
    }

    async fn mirror_peer_remove(&self, pool: PoolId, uuid: &str) -> Result<()> {
        self.with_class("mirror_peer_remove", Some(ClassFeature::Mirroring), pool, |p| {
            let before = p.mirroring.peers.len();
            p.mirroring.peers.retain(|x| x.uuid != uuid);
            if p.mirroring.peers.len() == before {
                return Err(Error::not_found(format!("mirror peer {uuid}")));
            }
            Ok(())
        })
    }

    async fn mirror_peer_set_client(
        &self,
        pool: PoolId,
        uuid: &str,
        client_name: &str,
    ) -> Result<()> {
        self.with_class(
            "mirror_peer_set_client",
            Some(ClassFeature::Mirroring),
            pool,
            |p| {
                p.peer_mut(uuid)?.client_name = client_name.to_string();
                Ok(())
            },
        )
    }

    async fn mirror_peer_set_cluster(
        &self,
        pool: PoolId,
        uuid: &str,
        cluster_name: &str,
    ) -> Result<()> {
        self.with_class(
            "mirror_peer_set_cluster",
            Some(ClassFeature::Mirroring),
            pool,
            |p| {
                p.peer_mut(uuid)?.cluster_name = cluster_name.to_string();
                Ok(())
            },
        )
    }

    async fn mirror_image_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<BTreeMap<ImageId, String>> {
        self.with_class("mirror_image_list", Some(ClassFeature::Mirroring), pool, |p| {
            Ok(p.mirroring
                .images
                .iter()
                .filter(|(id, _)| id.as_str() > start_after)
                .take(max)
                .map(|(id, m)| (id.clone(), m.global_image_id.clone()))
                .collect())
        })
    }

    async fn mirror_image_get(&self, pool: PoolId, id: &ImageId) -> Result<MirrorImage> {
        self.with_class("mirror_image_get", Some(ClassFeature::Mirroring), pool, |p| {
            p.mirror_image(id).cloned()
        })
    }

    async fn mirror_image_set(
        &self,
        pool: PoolId,
        id: &ImageId,
        image: MirrorImage,
    ) -> Result<()> {
        self.with_class("mirror_image_set", Some(ClassFeature::Mirroring), pool, |p| {
            if p.mirroring
                .images
                .iter()
                .any(|(other, m)| other != id && m.global_image_id == image.global_image_id)
            {
                return Err(Error::already_exists(format!(
                    "global image id {}",
                    image.global_image_id
                )));
            }
            if let Some(existing) = p.mirroring.images.get(id) {
                if existing.global_image_id != image.global_image_id {
                    return Err(Error::invalid_argument(format!(
                        "image {id} is mirrored as {}",
                        existing.global_image_id
                    )));
                }
            }
            p.mirroring.images.insert(id.clone(), image);
            Ok(())
        })
    }

    async fn mirror_image_remove(&self, pool: PoolId, id: &ImageId) -> Result<()> {
        self.with_class("mirror_image_remove", Some(ClassFeature::Mirroring), pool, |p| {
            if p.mirror_image(id)?.state != MirrorImageState::Disabling {
                return Err(Error::busy(format!("mirroring of {id} is not being disabled")));
            }
            if let Some(image) = p.mirroring.images.remove(id) {
                p.mirroring.statuses.remove(&image.global_image_id);
            }
            Ok(())
        })
    }

    async fn mirror_image_status_set(
        &self,
        pool: PoolId,
        global_image_id: &str,
        status: MirrorStatusRecord,
    ) -> Result<()> {
        self.with_class(
            "mirror_image_status_set",
            Some(ClassFeature::Mirroring),
            pool,
            |p| {
                p.mirroring
                    .statuses
                    .insert(global_image_id.to_string(), status);
                Ok(())
            },
        )
    }

    async fn mirror_image_status_get(
        &self,
        pool: PoolId,
        global_image_id: &str,
    ) -> Result<MirrorStatusRecord> {
        self.with_class(
            "mirror_image_status_get",
            Some(ClassFeature::Mirroring),
            pool,
            |p| {
                p.mirroring
                    .statuses
                    .get(global_image_id)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("status of {global_image_id}")))
            },
        )
    }

    async fn mirror_image_status_remove(&self, pool: PoolId, global_image_id: &str) -> Result<()> {
        self.with_class(
            "mirror_image_status_remove",
            Some(ClassFeature::Mirroring),
            pool,
            |p| {
                p.mirroring
                    .statuses
                    .remove(global_image_id)
                    .map(|_| ())
                    .ok_or_else(|| Error::not_found(format!("status of {global_image_id}")))
            },
        )
    }

    async fn mirror_image_status_list(
        &self,
        pool: PoolId,
        start_after: &str,
        max: usize,
    ) -> Result<(
        BTreeMap<ImageId, MirrorImage>,
        BTreeMap<ImageId, MirrorStatusRecord>,
    )> {
        self.with_class(
            "mirror_image_status_list",
            Some(ClassFeature::Mirroring),
            pool,
            |p| {
                let images: BTreeMap<ImageId, MirrorImage> = p
                    .mirroring
                    .images
                    .iter()
                    .filter(|(id, _)| id.as_str() > start_after)
                    .take(max)
                    .map(|(id, m)| (id.clone(), m.clone()))
                    .collect();
                let statuses = images
                    .iter()
                    .filter_map(|(id, m)| {
                        p.mirroring
                            .statuses
                            .get(&m.global_image_id)
                            .map(|s| (id.clone(), s.clone()))
                    })
                    .collect();
                Ok((images, statuses))
            },
        )
    }

    async fn mirror_image_status_summary(
        &self,
        pool: PoolId,
    ) -> Result<BTreeMap<MirrorImageStatusState, usize>> {
        self.with_class(
            "mirror_image_status_summary",
            Some(ClassFeature::Mirroring),
            pool,
            |p| {
                let mut summary = BTreeMap::new();
                for image in p.mirroring.images.values() {
                    let state = p
                        .mirroring
                        .statuses
                        .get(&image.global_image_id)
                        .map_or(MirrorImageStatusState::Unknown, |s| s.state);
                    *summary.entry(state).or_insert(0) += 1;
                }
                Ok(summary)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockimg_common::SnapshotNamespace;

    fn header() -> ImageHeader {
        ImageHeader::new(1 << 20, 22, Features::LAYERING, "img_data.a".to_string())
    }

    #[tokio::test]
    async fn test_exclusive_lock_per_session() {
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        let a = cluster.connect();
        let b = cluster.connect();
        let id = ImageId::new("a");
        let oid = crate::header_name(&id);
        a.create_header(pool, &id, header()).await.unwrap();

        a.lock(pool, &oid, "l", LockMode::Exclusive, "c1", "t")
            .await
            .unwrap();
        assert!(matches!(
            b.lock(pool, &oid, "l", LockMode::Exclusive, "c2", "t").await,
            Err(Error::Busy(_))
        ));
        a.assert_locked(pool, &oid, "l", LockMode::Exclusive, "c1", "t")
            .await
            .unwrap();
        assert!(b
            .assert_locked(pool, &oid, "l", LockMode::Exclusive, "c1", "t")
            .await
            .is_err());

        let info = b.get_lock_info(pool, &oid, "l").await.unwrap();
        assert_eq!(info.lockers.len(), 1);
        b.break_lock(pool, &oid, "l", &info.lockers[0]).await.unwrap();
        assert!(b.get_lock_info(pool, &oid, "l").await.unwrap().lockers.is_empty());
    }

    #[tokio::test]
    async fn test_blacklist_fences_session() {
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        let a = cluster.connect();
        let b = cluster.connect();

        b.blacklist_add(&a.client().address, 0).await.unwrap();
        assert!(cluster.is_blacklisted(&a.client().address));
        assert!(matches!(
            a.stat(pool, DIRECTORY_OID).await,
            Err(Error::Blacklisted(_))
        ));
        assert!(b.stat(pool, DIRECTORY_OID).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_protected_snapshot_cannot_be_removed() {
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        let store = cluster.connect();
        let id = ImageId::new("a");
        store.create_header(pool, &id, header()).await.unwrap();
        let snap = SnapshotRecord {
            id: SnapshotId::new(1),
            name: "s".to_string(),
            namespace: SnapshotNamespace::User,
            protection: ProtectionStatus::Protected,
            size: 0,
            parent: None,
        };
        store.snapshot_add(pool, &id, snap).await.unwrap();
        assert!(matches!(
            store.snapshot_remove(pool, &id, SnapshotId::new(1)).await,
            Err(Error::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_failpoints_and_class_toggles() {
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        let store = cluster.connect();

        cluster.fail_next("tmap_set", Error::Transport("timeout".into()));
        assert!(store.tmap_set(pool, "x").await.is_err());
        store.tmap_set(pool, "x").await.unwrap();
        assert_eq!(cluster.op_count("tmap_set"), 2);

        cluster.disable_class(ClassFeature::Mirroring);
        assert!(store.mirror_mode_get(pool).await.unwrap_err().is_unsupported());
        cluster.enable_class(ClassFeature::Mirroring);
        assert_eq!(store.mirror_mode_get(pool).await.unwrap(), MirrorMode::Disabled);
    }
}
