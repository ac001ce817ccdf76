//! Advisory cookie locks
//!
//! Callers may take their own shared or exclusive locks on the header,
//! identified by a cookie and a tag. These share the lock name with the
//! managed exclusive lock, so the two exclude each other.

use super::exclusive::break_locker;
use crate::LOCK_NAME;
use crate::image::ImageHandle;

use blockimg_common::{Error, LockInfo, LockMode, Result};
use tracing::info;

impl ImageHandle {
    /// Current lockers with the lock mode and tag
    pub async fn list_lockers(&self) -> Result<LockInfo> {
        self.store()
            .get_lock_info(self.pool().id, self.header_oid(), LOCK_NAME)
            .await
    }

    pub async fn lock(&self, mode: LockMode, cookie: &str, tag: &str) -> Result<()> {
        self.store()
            .lock(self.pool().id, self.header_oid(), LOCK_NAME, mode, cookie, tag)
            .await
    }

    pub async fn unlock(&self, cookie: &str) -> Result<()> {
        self.store()
            .unlock(self.pool().id, self.header_oid(), LOCK_NAME, cookie)
            .await
    }

    /// Break the lock `client` holds with `cookie`
    pub async fn break_lock(&self, client: &str, cookie: &str) -> Result<()> {
        let info = self.list_lockers().await?;
        let locker = info
            .lockers
            .into_iter()
            .find(|l| l.entity == client && l.cookie == cookie)
            .ok_or_else(|| Error::not_found(format!("lock of {client} with cookie {cookie}")))?;
        info!(image = %self.name(), client, cookie, "Breaking advisory lock");
        break_locker(
            self.store().as_ref(),
            &self.manager().config().lock,
            self.pool().id,
            self.header_oid(),
            &locker,
        )
        .await
    }
}
