//! Managed exclusive lock
//!
//! One advisory exclusive lock per image, taken on the header object with
//! the internal tag and a cookie naming the owner's watch handle. The cookie
//! lets a contender tell a live owner (still watching the header) from a
//! dead one. A live owner is asked to release through a notification; a dead
//! owner's lock is broken, fencing its address first when configured.

use crate::completion::Completion;
use crate::store::{MetadataStore, Notification};
use crate::{LOCK_COOKIE_PREFIX, LOCK_NAME, LOCK_TAG_INTERNAL};

use blockimg_common::config::LockConfig;
use blockimg_common::{Error, LockMode, Locker, PoolId, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// Lock attempts before giving up on a contended lock
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Locked,
    ShutDown,
}

/// Cookie used by the session watching with `watch_handle`
#[must_use]
pub fn lock_cookie(watch_handle: u64) -> String {
    format!("{LOCK_COOKIE_PREFIX} {watch_handle}")
}

/// Exclusive lock on one image header
pub struct ExclusiveLock {
    store: Arc<dyn MetadataStore>,
    config: LockConfig,
    pool: PoolId,
    oid: String,
    cookie: String,
    state: RwLock<LockState>,
    blocked_requests: AtomicU32,
}

impl ExclusiveLock {
    #[must_use]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        config: LockConfig,
        pool: PoolId,
        oid: String,
        watch_handle: u64,
    ) -> Self {
        Self {
            store,
            config,
            pool,
            oid,
            cookie: lock_cookie(watch_handle),
            state: RwLock::new(LockState::Unlocked),
            blocked_requests: AtomicU32::new(0),
        }
    }

    fn current(&self) -> LockState {
        *self.state.read()
    }

    /// Whether this session believes it owns the lock
    #[must_use]
    pub fn is_lock_owner(&self) -> bool {
        self.current() == LockState::Locked
    }

    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Stop handing the lock to peers until [`Self::unblock_requests`]
    pub fn block_requests(&self) {
        self.blocked_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unblock_requests(&self) {
        if self
            .blocked_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            debug!(oid = %self.oid, "Unblock without a matching block, requests already accepted");
        }
    }

    #[must_use]
    pub fn accept_requests(&self) -> bool {
        self.blocked_requests.load(Ordering::SeqCst) == 0
    }

    /// Start acquiring the lock; `force` asks a peer under an explicit
    /// policy to give it up as well
    pub fn acquire_lock(self: &Arc<Self>, force: bool) -> Completion<()> {
        let this = self.clone();
        Completion::spawn(async move { this.acquire(force).await })
    }

    /// Start releasing the lock
    pub fn release_lock(self: &Arc<Self>) -> Completion<()> {
        let this = self.clone();
        Completion::spawn(async move { this.release().await })
    }

    /// Release the lock if held and refuse any further acquisition
    pub fn shut_down(self: &Arc<Self>) -> Completion<()> {
        let this = self.clone();
        Completion::spawn(async move {
            let result = this.release().await;
            *this.state.write() = LockState::ShutDown;
            result
        })
    }

    /// Ping the store to confirm the lock is still ours
    pub async fn assert_header_locked(&self) -> Result<()> {
        self.store
            .assert_locked(
                self.pool,
                &self.oid,
                LOCK_NAME,
                LockMode::Exclusive,
                &self.cookie,
                LOCK_TAG_INTERNAL,
            )
            .await
    }

    /// Current owner; `NotFound` when unlocked, `Busy` when the lock was
    /// taken by something other than a managed owner
    pub async fn get_locker(&self) -> Result<Locker> {
        get_locker(self.store.as_ref(), self.pool, &self.oid).await
    }

    async fn acquire(&self, force: bool) -> Result<()> {
        match self.current() {
            LockState::Locked => return Ok(()),
            LockState::ShutDown => {
                return Err(Error::LockNotAcquired(format!(
                    "exclusive lock on {} is shut down",
                    self.oid
                )));
            }
            LockState::Unlocked => {}
        }

        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            debug!(oid = %self.oid, attempt, "Trying exclusive lock");
            match self
                .store
                .lock(
                    self.pool,
                    &self.oid,
                    LOCK_NAME,
                    LockMode::Exclusive,
                    &self.cookie,
                    LOCK_TAG_INTERNAL,
                )
                .await
            {
                Ok(()) => {
                    *self.state.write() = LockState::Locked;
                    info!(oid = %self.oid, "Acquired exclusive lock");
                    self.broadcast(Notification::AcquiredLock {
                        owner: self.store.client().entity.clone(),
                    })
                    .await;
                    return Ok(());
                }
                Err(Error::Busy(_)) => {}
                Err(e) => {
                    warn!("Failed to lock {}: {}", self.oid, e);
                    return Err(e);
                }
            }

            let locker = match self.get_locker().await {
                Ok(locker) => locker,
                // Released between our attempt and the query.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            if self.is_owner_alive(&locker).await? {
                self.request_lock(force).await?;
            } else {
                info!(
                    oid = %self.oid,
                    owner = %locker.entity,
                    "Breaking exclusive lock of dead owner"
                );
                break_locker(
                    self.store.as_ref(),
                    &self.config,
                    self.pool,
                    &self.oid,
                    &locker,
                )
                .await?;
            }
        }

        Err(Error::busy(format!(
            "gave up acquiring exclusive lock on {}",
            self.oid
        )))
    }

    async fn release(&self) -> Result<()> {
        if self.current() != LockState::Locked {
            return Ok(());
        }
        match self
            .store
            .unlock(self.pool, &self.oid, LOCK_NAME, &self.cookie)
            .await
        {
            Ok(()) => {}
            // The header is gone or the lock was broken.
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("Failed to unlock {}: {}", self.oid, e);
                return Err(e);
            }
        }
        *self.state.write() = LockState::Unlocked;
        info!(oid = %self.oid, "Released exclusive lock");
        self.broadcast(Notification::ReleasedLock {
            owner: self.store.client().entity.clone(),
        })
        .await;
        Ok(())
    }

    async fn is_owner_alive(&self, locker: &Locker) -> Result<bool> {
        let watchers = self.store.list_watchers(self.pool, &self.oid).await?;
        Ok(watchers
            .iter()
            .any(|w| w.entity == locker.entity && lock_cookie(w.handle) == locker.cookie))
    }

    async fn request_lock(&self, force: bool) -> Result<()> {
        let acks = self
            .store
            .notify(
                self.pool,
                &self.oid,
                Notification::RequestLock {
                    requester: self.store.client().entity.clone(),
                    force,
                },
            )
            .await?;
        for ack in acks {
            if let Err(e) = ack.result {
                debug!("Lock request refused by {}: {}", ack.entity, e);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn broadcast(&self, notification: Notification) {
        if let Err(e) = self.store.notify(self.pool, &self.oid, notification).await {
            warn!("Failed to notify lock change on {}: {}", self.oid, e);
        }
    }
}

/// Managed owner of the exclusive lock on `oid`
pub async fn get_locker(store: &dyn MetadataStore, pool: PoolId, oid: &str) -> Result<Locker> {
    let info = store.get_lock_info(pool, oid, LOCK_NAME).await?;
    if info.lockers.is_empty() {
        return Err(Error::not_found(format!("no lock on {oid}")));
    }
    if info.mode != LockMode::Exclusive || info.tag != LOCK_TAG_INTERNAL {
        return Err(Error::busy(format!("{oid} is locked by an external locker")));
    }
    let mut lockers = info.lockers;
    match lockers.len() {
        1 => Ok(lockers.remove(0)),
        n => Err(Error::busy(format!("{oid} has {n} lockers"))),
    }
}

/// Break `locker`'s lock, fencing its address first when configured
pub async fn break_locker(
    store: &dyn MetadataStore,
    config: &LockConfig,
    pool: PoolId,
    oid: &str,
    locker: &Locker,
) -> Result<()> {
    if config.blacklist_on_break_lock {
        info!(address = %locker.address, "Blacklisting lock owner");
        if let Err(e) = store
            .blacklist_add(&locker.address, config.blacklist_expire_seconds)
            .await
        {
            warn!("Failed to blacklist {}: {}", locker.address, e);
            return Err(e);
        }
    }
    match store.break_lock(pool, oid, LOCK_NAME, locker).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => {
            warn!("Failed to break lock on {}: {}", oid, e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ImageHeader, MemoryCluster, MemoryStore, WatchHandler};
    use async_trait::async_trait;
    use blockimg_common::{Features, ImageId};

    struct Silent;

    #[async_trait]
    impl WatchHandler for Silent {
        async fn handle_notify(&self, _notification: &Notification) -> Result<()> {
            Ok(())
        }
    }

    async fn setup() -> (MemoryCluster, PoolId, String) {
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        let store = cluster.connect();
        let id = ImageId::new("abc");
        store
            .create_header(
                pool,
                &id,
                ImageHeader::new(1 << 20, 22, Features::EXCLUSIVE_LOCK, "p".into()),
            )
            .await
            .unwrap();
        (cluster, pool, crate::header_name(&id))
    }

    async fn lock_for(store: MemoryStore, pool: PoolId, oid: &str) -> Arc<ExclusiveLock> {
        let store: Arc<dyn MetadataStore> = Arc::new(store);
        let handle = store.watch(pool, oid, Arc::new(Silent)).await.unwrap();
        Arc::new(ExclusiveLock::new(
            store,
            LockConfig::default(),
            pool,
            oid.to_string(),
            handle,
        ))
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (cluster, pool, oid) = setup().await;
        let lock = lock_for(cluster.connect(), pool, &oid).await;

        lock.acquire_lock(false).wait().await.unwrap();
        assert!(lock.is_lock_owner());
        lock.assert_header_locked().await.unwrap();
        assert_eq!(lock.get_locker().await.unwrap().cookie, lock.cookie());

        lock.release_lock().wait().await.unwrap();
        assert!(!lock.is_lock_owner());
        assert!(lock.get_locker().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_dead_owner_is_broken_and_fenced() {
        let (cluster, pool, oid) = setup().await;
        let dead_store = cluster.connect();
        let dead_address = dead_store.client().address.clone();
        let dead = lock_for(dead_store, pool, &oid).await;
        dead.acquire_lock(false).wait().await.unwrap();
        cluster.expire_watches(&dead_address);

        let lock = lock_for(cluster.connect(), pool, &oid).await;
        lock.acquire_lock(false).wait().await.unwrap();
        assert!(lock.is_lock_owner());
        assert!(cluster.is_blacklisted(&dead_address));
        assert!(matches!(
            dead.assert_header_locked().await,
            Err(Error::Blacklisted(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_live_owner_keeps_lock() {
        let (cluster, pool, oid) = setup().await;
        let owner = lock_for(cluster.connect(), pool, &oid).await;
        owner.acquire_lock(false).wait().await.unwrap();

        // The owner watches but never releases on request.
        let lock = lock_for(cluster.connect(), pool, &oid).await;
        assert!(matches!(
            lock.acquire_lock(false).wait().await,
            Err(Error::Busy(_))
        ));
        assert!(owner.is_lock_owner());
    }

    #[tokio::test]
    async fn test_shut_down_refuses_acquire() {
        let (cluster, pool, oid) = setup().await;
        let lock = lock_for(cluster.connect(), pool, &oid).await;
        lock.acquire_lock(false).wait().await.unwrap();
        lock.shut_down().wait().await.unwrap();

        assert!(!lock.is_lock_owner());
        assert!(matches!(
            lock.acquire_lock(false).wait().await,
            Err(Error::LockNotAcquired(_))
        ));
    }

    #[test]
    fn test_request_blocking_nests() {
        let lock = ExclusiveLock::new(
            Arc::new(MemoryCluster::new().connect()),
            LockConfig::default(),
            PoolId::new(1),
            "img_header.x".to_string(),
            7,
        );
        assert_eq!(lock.cookie(), "auto 7");
        lock.block_requests();
        lock.block_requests();
        lock.unblock_requests();
        assert!(!lock.accept_requests());
        lock.unblock_requests();
        assert!(lock.accept_requests());
        lock.unblock_requests();
        assert!(lock.accept_requests());

        // An unmatched unblock must not leave credit for a later block.
        lock.block_requests();
        assert!(!lock.accept_requests());
        lock.unblock_requests();
        assert!(lock.accept_requests());
    }
}
