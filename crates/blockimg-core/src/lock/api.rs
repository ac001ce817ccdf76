//! Exclusive lock operations on an open image

use super::exclusive::{break_locker, get_locker};
use super::{ExclusiveLock, LockPolicy};
use crate::LOCK_NAME;
use crate::image::ImageHandle;

use blockimg_common::{Error, Features, LockMode, LockStatus, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

impl ImageHandle {
    fn require_lock_feature(&self) -> Result<()> {
        if self.read_meta(|m| m.features.contains(Features::EXCLUSIVE_LOCK)) {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "exclusive lock is not enabled on {}",
                self.name()
            )))
        }
    }

    fn managed_lock(&self) -> Result<Arc<ExclusiveLock>> {
        self.require_lock_feature()?;
        self.exclusive_lock().ok_or_else(|| {
            Error::invalid_argument(format!("image {} has no managed lock", self.name()))
        })
    }

    /// Take the exclusive lock and keep it until released explicitly
    pub async fn lock_acquire(&self, mode: LockMode) -> Result<()> {
        if mode != LockMode::Exclusive {
            return Err(Error::unsupported("only exclusive locks are supported"));
        }
        let lock = self.managed_lock()?;

        if self.lock_policy().may_auto_request_lock() {
            self.set_lock_policy(LockPolicy::Standard);
        }
        if lock.is_lock_owner() {
            return Ok(());
        }

        debug!(image = %self.name(), "Requesting exclusive lock");
        lock.acquire_lock(false).wait().await?;
        self.refresh().await?;

        // The lock may be lost again before we get here.
        if !self.is_exclusive_lock_owner().await? {
            error!("Failed to acquire exclusive lock of {}", self.name());
            return Err(Error::LockNotAcquired(format!(
                "lost exclusive lock of {}",
                self.name()
            )));
        }
        info!(image = %self.name(), "Exclusive lock acquired");
        Ok(())
    }

    /// Release a lock taken with [`Self::lock_acquire`]
    pub async fn lock_release(&self) -> Result<()> {
        let lock = self.managed_lock()?;
        if !lock.is_lock_owner() {
            return Err(Error::invalid_argument(format!(
                "exclusive lock of {} is not held",
                self.name()
            )));
        }
        lock.release_lock().wait().await
    }

    /// Addresses of the lock owners; a single entry in exclusive mode
    pub async fn lock_get_owners(&self) -> Result<(LockMode, Vec<String>)> {
        self.require_lock_feature()?;
        let locker = get_locker(self.store().as_ref(), self.pool().id, self.header_oid()).await?;
        Ok((LockMode::Exclusive, vec![locker.address]))
    }

    /// Break the lock held by `owner`; refuses when someone else holds it
    pub async fn lock_break(&self, mode: LockMode, owner: &str) -> Result<()> {
        if mode != LockMode::Exclusive {
            return Err(Error::unsupported("only exclusive locks are supported"));
        }
        self.require_lock_feature()?;

        let locker = get_locker(self.store().as_ref(), self.pool().id, self.header_oid()).await?;
        if locker.address != owner {
            return Err(Error::busy(format!(
                "lock of {} is owned by {}, not {owner}",
                self.name(),
                locker.address
            )));
        }
        info!(image = %self.name(), owner, "Breaking exclusive lock");
        break_locker(
            self.store().as_ref(),
            &self.manager().config().lock,
            self.pool().id,
            self.header_oid(),
            &locker,
        )
        .await
    }

    /// Whether this client owns the lock, confirmed with the store
    pub async fn is_exclusive_lock_owner(&self) -> Result<bool> {
        let Some(lock) = self.exclusive_lock() else {
            return Ok(false);
        };
        if !lock.is_lock_owner() {
            return Ok(false);
        }
        match lock.assert_header_locked().await {
            Ok(()) => Ok(true),
            Err(Error::Busy(_) | Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// State of the exclusive lock as seen from this client
    pub async fn lock_status(&self) -> Result<LockStatus> {
        match self.is_exclusive_lock_owner().await {
            Ok(true) => return Ok(LockStatus::LockedBySelf),
            Ok(false) => {}
            Err(Error::Blacklisted(_)) => return Ok(LockStatus::Fenced),
            Err(e) => return Err(e),
        }

        let info = match self
            .store()
            .get_lock_info(self.pool().id, self.header_oid(), LOCK_NAME)
            .await
        {
            Ok(info) => info,
            Err(Error::Blacklisted(_)) => return Ok(LockStatus::Fenced),
            Err(e) => return Err(e),
        };

        let me = &self.store().client().entity;
        let own_cookie = self.exclusive_lock().map(|l| l.cookie().to_string());
        Ok(match info.lockers.first() {
            None => LockStatus::Unlocked,
            Some(l) if &l.entity == me && Some(&l.cookie) == own_cookie.as_ref() => {
                LockStatus::LockedBySelf
            }
            Some(_) => LockStatus::LockedByPeer,
        })
    }
}
