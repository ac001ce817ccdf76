//! Open image handles
//!
//! An [`ImageHandle`] is the consistent view of one image that every
//! protocol works against. Its metadata sits behind a reader/writer lock;
//! multi-field reads take a single guard. Exclusive lock ownership sits
//! behind a second lock. Neither guard is ever held across an `.await`.
//!
//! Every handle watches its header object. Peers broadcast header updates
//! and lock requests through that watch. A handle must be closed to drop its
//! watch, otherwise it keeps counting as a consumer of the image.

use crate::directory::ImageFormat;
use crate::lock::{ExclusiveLock, LockPolicy};
use crate::manager::ImageManager;
use crate::store::{ImageHeader, MetadataStore, Notification, WatchHandler};
use crate::{header_name, old_header_name};

use async_trait::async_trait;
use blockimg_common::{
    Error, Features, ImageId, ParentInfo, PoolRef, Result, SnapshotId, SnapshotRecord,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

const LEGACY_HEADER_TEXT: &[u8; 32] = b"<<< Block Device Image >>>\n\0\0\0\0\0";
const LEGACY_SIGNATURE: &[u8; 4] = b"IMG\0";
const LEGACY_VERSION: &[u8; 8] = b"001.005\0";
const LEGACY_BLOCK_NAME_LEN: usize = 24;
const LEGACY_HEADER_LEN: usize = 32 + LEGACY_BLOCK_NAME_LEN + 4 + 8 + 8 + 8;

/// Single-object header of a format-1 image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyHeader {
    pub block_name: String,
    pub order: u8,
    pub size: u64,
}

impl LegacyHeader {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LEGACY_HEADER_LEN);
        buf.put_slice(LEGACY_HEADER_TEXT);
        let mut name = [0u8; LEGACY_BLOCK_NAME_LEN];
        let len = self.block_name.len().min(LEGACY_BLOCK_NAME_LEN - 1);
        name[..len].copy_from_slice(&self.block_name.as_bytes()[..len]);
        buf.put_slice(&name);
        buf.put_slice(LEGACY_SIGNATURE);
        buf.put_slice(LEGACY_VERSION);
        buf.put_u64_le(u64::from(self.order));
        buf.put_u64_le(self.size);
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < LEGACY_HEADER_LEN || !data.starts_with(LEGACY_HEADER_TEXT) {
            return Err(Error::Corrupt("unrecognized image header".to_string()));
        }
        data.advance(LEGACY_HEADER_TEXT.len());
        let name = data.split_to(LEGACY_BLOCK_NAME_LEN);
        let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        let block_name = String::from_utf8(name[..end].to_vec())
            .map_err(|_| Error::Corrupt("invalid block name in image header".to_string()))?;
        data.advance(LEGACY_SIGNATURE.len() + LEGACY_VERSION.len());
        let order = u8::try_from(data.get_u64_le())
            .map_err(|_| Error::Corrupt("invalid order in image header".to_string()))?;
        let size = data.get_u64_le();
        Ok(Self {
            block_name,
            order,
            size,
        })
    }
}

/// Cached image metadata
#[derive(Clone, Debug)]
pub struct ImageMeta {
    pub size: u64,
    pub order: u8,
    pub features: Features,
    pub flags: u64,
    pub object_prefix: String,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub snapshots: Vec<SnapshotRecord>,
    pub parent: Option<ParentInfo>,
    /// How this handle reacts to lock requests and implicit acquisition
    pub lock_policy: LockPolicy,
}

impl ImageMeta {
    fn from_header(header: ImageHeader, lock_policy: LockPolicy) -> Self {
        Self {
            size: header.size,
            order: header.order,
            features: header.features,
            flags: header.flags,
            object_prefix: header.object_prefix,
            stripe_unit: header.stripe_unit,
            stripe_count: header.stripe_count,
            snapshots: header.snapshots,
            parent: header.parent,
            lock_policy,
        }
    }

    fn from_legacy(header: LegacyHeader, lock_policy: LockPolicy) -> Self {
        Self {
            size: header.size,
            order: header.order,
            features: Features::NONE,
            flags: 0,
            object_prefix: header.block_name,
            stripe_unit: 1 << header.order,
            stripe_count: 1,
            snapshots: Vec::new(),
            parent: None,
            lock_policy,
        }
    }

    #[must_use]
    pub fn snapshot(&self, id: SnapshotId) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    #[must_use]
    pub fn snapshot_by_name(&self, name: &str) -> Option<&SnapshotRecord> {
        self.snapshots.iter().find(|s| s.name == name)
    }
}

/// Handle to an open image
pub struct ImageHandle {
    manager: ImageManager,
    pool: PoolRef,
    id: ImageId,
    name: String,
    format: ImageFormat,
    header_oid: String,
    snap: Option<(SnapshotId, String)>,
    meta: RwLock<ImageMeta>,
    exclusive_lock: RwLock<Option<Arc<ExclusiveLock>>>,
    watch_handle: Mutex<Option<u64>>,
    needs_refresh: AtomicBool,
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("pool", &self.pool)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("format", &self.format)
            .field("snap", &self.snap)
            .finish_non_exhaustive()
    }
}

impl ImageHandle {
    pub(crate) async fn open(
        manager: ImageManager,
        pool: PoolRef,
        name: &str,
        snap: Option<&str>,
    ) -> Result<Arc<Self>> {
        let store = manager.store().clone();
        let format = manager.directory().detect_format(pool.id, name).await?;

        let (id, header_oid, meta) = match format {
            ImageFormat::Legacy => {
                let oid = old_header_name(name);
                let header = LegacyHeader::decode(store.read(pool.id, &oid).await?)?;
                (
                    ImageId::new(""),
                    oid,
                    ImageMeta::from_legacy(header, LockPolicy::default()),
                )
            }
            ImageFormat::Current => {
                let id = store.get_id(pool.id, name).await?;
                let header = store.get_header(pool.id, &id).await?;
                let oid = header_name(&id);
                (id, oid, ImageMeta::from_header(header, LockPolicy::default()))
            }
        };

        let snap = match snap {
            None => None,
            Some(snap_name) => {
                let record = meta.snapshot_by_name(snap_name).ok_or_else(|| {
                    Error::not_found(format!("snapshot {snap_name} of {name}"))
                })?;
                Some((record.id, snap_name.to_string()))
            }
        };

        let wants_lock = snap.is_none()
            && !format.is_legacy()
            && meta.features.contains(Features::EXCLUSIVE_LOCK);

        let image = Arc::new(Self {
            manager,
            pool,
            id,
            name: name.to_string(),
            format,
            header_oid,
            snap,
            meta: RwLock::new(meta),
            exclusive_lock: RwLock::new(None),
            watch_handle: Mutex::new(None),
            needs_refresh: AtomicBool::new(false),
        });

        let watcher = Arc::new(ImageWatcher {
            image: Arc::downgrade(&image),
        });
        let handle = store
            .watch(image.pool.id, &image.header_oid, watcher)
            .await?;
        *image.watch_handle.lock() = Some(handle);

        if wants_lock {
            let lock = ExclusiveLock::new(
                store,
                image.manager.config().lock.clone(),
                image.pool.id,
                image.header_oid.clone(),
                handle,
            );
            *image.exclusive_lock.write() = Some(Arc::new(lock));
        }

        debug!(
            pool = %image.pool.name,
            image = %image.name,
            id = %image.id,
            "Opened image"
        );
        Ok(image)
    }

    /// Drop the watch and release the exclusive lock if held
    pub async fn close(&self) -> Result<()> {
        let lock = self.exclusive_lock.write().take();
        if let Some(lock) = lock {
            if let Err(e) = lock.shut_down().wait().await {
                warn!("Failed to shut down exclusive lock of {}: {}", self.name, e);
            }
        }

        let handle = self.watch_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = self
                .store()
                .unwatch(self.pool.id, &self.header_oid, handle)
                .await
            {
                debug!("Failed to unwatch header of {}: {}", self.name, e);
            }
        }
        debug!(image = %self.name, "Closed image");
        Ok(())
    }

    /// Re-read the header
    pub async fn refresh(&self) -> Result<()> {
        self.needs_refresh.store(false, Ordering::SeqCst);
        if self.format.is_legacy() {
            let data = self.store().read(self.pool.id, &self.header_oid).await?;
            let header = LegacyHeader::decode(data)?;
            let mut meta = self.meta.write();
            let policy = meta.lock_policy;
            *meta = ImageMeta::from_legacy(header, policy);
        } else {
            let header = self.store().get_header(self.pool.id, &self.id).await?;
            let mut meta = self.meta.write();
            let policy = meta.lock_policy;
            *meta = ImageMeta::from_header(header, policy);
        }
        Ok(())
    }

    /// Refresh when a peer announced a header change
    pub async fn refresh_if_required(&self) -> Result<()> {
        if self.needs_refresh.load(Ordering::SeqCst) {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Tell every watcher, this handle included, that the header changed
    pub(crate) async fn notify_update(&self) {
        if let Err(e) = self
            .store()
            .notify(self.pool.id, &self.header_oid, Notification::HeaderUpdate)
            .await
        {
            warn!("Failed to notify header update of {}: {}", self.name, e);
        }
    }

    /// Make sure this client may modify the image, taking the exclusive lock
    /// when the lock policy allows it
    pub(crate) async fn prepare_image_update(&self) -> Result<()> {
        let Some(lock) = self.exclusive_lock() else {
            return Ok(());
        };
        if lock.is_lock_owner() {
            return Ok(());
        }
        let policy = self.meta.read().lock_policy;
        if !policy.may_auto_request_lock() {
            return Err(Error::LockNotAcquired(format!(
                "exclusive lock of {} is not held",
                self.name
            )));
        }
        lock.acquire_lock(false).wait().await?;
        self.refresh().await
    }

    /// Reject mutations through a snapshot handle
    pub(crate) fn ensure_head(&self) -> Result<()> {
        match &self.snap {
            Some((_, snap)) => Err(Error::invalid_argument(format!(
                "image {} is open at snapshot {snap}",
                self.name
            ))),
            None => Ok(()),
        }
    }

    pub(crate) async fn handle_lock_request(&self, requester: &str, force: bool) -> Result<()> {
        let Some(lock) = self.exclusive_lock() else {
            return Ok(());
        };
        if !lock.is_lock_owner() {
            return Ok(());
        }
        if !lock.accept_requests() {
            debug!("Refusing lock request from {}: requests blocked", requester);
            return Err(Error::busy(format!(
                "lock requests on {} are blocked",
                self.name
            )));
        }
        let policy = self.meta.read().lock_policy;
        if !policy.lock_requested(force) {
            debug!("Refusing lock request from {}: lock held explicitly", requester);
            return Err(Error::LockNotAcquired(format!(
                "exclusive lock of {} is held explicitly",
                self.name
            )));
        }
        info!(image = %self.name, requester, "Releasing exclusive lock on request");
        lock.release_lock().wait().await
    }

    pub(crate) fn manager(&self) -> &ImageManager {
        &self.manager
    }

    pub(crate) fn store(&self) -> &Arc<dyn MetadataStore> {
        self.manager.store()
    }

    pub(crate) fn exclusive_lock(&self) -> Option<Arc<ExclusiveLock>> {
        self.exclusive_lock.read().clone()
    }

    pub(crate) fn set_lock_policy(&self, policy: LockPolicy) -> LockPolicy {
        std::mem::replace(&mut self.meta.write().lock_policy, policy)
    }

    /// Copy of the cached metadata
    #[must_use]
    pub fn meta(&self) -> ImageMeta {
        self.meta.read().clone()
    }

    pub(crate) fn read_meta<T>(&self, f: impl FnOnce(&ImageMeta) -> T) -> T {
        f(&self.meta.read())
    }

    #[must_use]
    pub const fn pool(&self) -> &PoolRef {
        &self.pool
    }

    #[must_use]
    pub const fn id(&self) -> &ImageId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn format(&self) -> ImageFormat {
        self.format
    }

    #[must_use]
    pub fn header_oid(&self) -> &str {
        &self.header_oid
    }

    /// Snapshot this handle is open at
    #[must_use]
    pub fn snap(&self) -> Option<(SnapshotId, &str)> {
        self.snap.as_ref().map(|(id, name)| (*id, name.as_str()))
    }

    #[must_use]
    pub fn lock_policy(&self) -> LockPolicy {
        self.meta.read().lock_policy
    }
}

/// Watch callback of an open handle
struct ImageWatcher {
    image: Weak<ImageHandle>,
}

#[async_trait]
impl WatchHandler for ImageWatcher {
    async fn handle_notify(&self, notification: &Notification) -> Result<()> {
        let Some(image) = self.image.upgrade() else {
            return Ok(());
        };
        match notification {
            Notification::HeaderUpdate => {
                image.needs_refresh.store(true, Ordering::SeqCst);
                Ok(())
            }
            Notification::RequestLock { requester, force } => {
                image.handle_lock_request(requester, *force).await
            }
            Notification::AcquiredLock { owner } | Notification::ReleasedLock { owner } => {
                debug!(image = %image.name, owner = %owner, "Lock owner changed");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use blockimg_common::LockStatus;

    #[test]
    fn test_legacy_header_codec() {
        let header = LegacyHeader {
            block_name: "rb.0.1234.5678abcd".to_string(),
            order: 22,
            size: 10 << 20,
        };
        let decoded = LegacyHeader::decode(header.encode()).unwrap();
        assert_eq!(decoded, header);

        assert!(matches!(
            LegacyHeader::decode(Bytes::from_static(b"garbage")),
            Err(Error::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_image() {
        let fx = Fixture::new();
        assert!(fx
            .manager
            .open(fx.pool, "missing", None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_peer_update_marks_handle_stale() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;

        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        let peer = fx.peer().open(fx.pool, "img", None).await.unwrap();

        peer.snap_create("s1").await.unwrap();
        assert!(image.needs_refresh.load(Ordering::SeqCst));
        assert!(image.snap_exists("s1").await.unwrap());
        assert!(!image.needs_refresh.load(Ordering::SeqCst));

        assert_eq!(peer.lock_status().await.unwrap(), LockStatus::LockedBySelf);
        peer.close().await.unwrap();
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_handle_is_read_only() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        image.snap_create("s1").await.unwrap();
        image.close().await.unwrap();

        let at_snap = fx.manager.open(fx.pool, "img", Some("s1")).await.unwrap();
        assert_eq!(at_snap.snap().map(|(_, n)| n), Some("s1"));
        assert!(at_snap.exclusive_lock().is_none());
        assert!(matches!(
            at_snap.snap_create("s2").await,
            Err(Error::InvalidArgument(_))
        ));
        at_snap.close().await.unwrap();

        assert!(fx
            .manager
            .open(fx.pool, "img", Some("nope"))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
