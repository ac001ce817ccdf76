//! Journal client interface
//!
//! Journaled images carry a tag owner: the mirror uuid of the cluster
//! allowed to append to the journal. The local cluster is identified by
//! [`LOCAL_MIRROR_UUID`]; a demoted image is owned by nobody
//! ([`ORPHAN_MIRROR_UUID`]) until some cluster promotes it.

mod memory;

pub use memory::MemoryJournal;

use async_trait::async_trait;
use blockimg_common::{ImageId, MirrorRole, PoolId, Result};

/// Tag owner of images primary on this cluster
pub const LOCAL_MIRROR_UUID: &str = "";

/// Tag owner of demoted images
pub const ORPHAN_MIRROR_UUID: &str = "<orphan>";

/// Role implied by a journal tag owner
#[must_use]
pub fn role_of(tag_owner: &str) -> MirrorRole {
    match tag_owner {
        LOCAL_MIRROR_UUID => MirrorRole::Primary,
        ORPHAN_MIRROR_UUID => MirrorRole::Orphan,
        _ => MirrorRole::NonPrimary,
    }
}

/// Journal operations used by the control plane
#[async_trait]
pub trait JournalClient: Send + Sync {
    /// Create the journal of a new image with `tag_owner` as initial owner
    async fn create(
        &self,
        pool: PoolId,
        image_id: &ImageId,
        order: u8,
        splay_width: u8,
        tag_owner: &str,
    ) -> Result<()>;

    /// Delete the journal; `NotFound` when absent
    async fn remove(&self, pool: PoolId, image_id: &ImageId) -> Result<()>;

    async fn get_tag_owner(&self, pool: PoolId, image_id: &ImageId) -> Result<String>;

    async fn is_tag_owner(&self, pool: PoolId, image_id: &ImageId) -> Result<bool> {
        Ok(self.get_tag_owner(pool, image_id).await? == LOCAL_MIRROR_UUID)
    }

    /// Take tag ownership for the local cluster
    async fn promote(&self, pool: PoolId, image_id: &ImageId) -> Result<()>;

    /// Give up tag ownership
    async fn demote(&self, pool: PoolId, image_id: &ImageId) -> Result<()>;

    /// Flag the image for a full resync from its primary
    async fn request_resync(&self, pool: PoolId, image_id: &ImageId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_of_tag_owner() {
        assert_eq!(role_of(LOCAL_MIRROR_UUID), MirrorRole::Primary);
        assert_eq!(role_of(ORPHAN_MIRROR_UUID), MirrorRole::Orphan);
        assert_eq!(role_of("6a1e2c"), MirrorRole::NonPrimary);
    }
}
