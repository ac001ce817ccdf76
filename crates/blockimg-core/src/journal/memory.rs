//! In-memory journal client

use super::{JournalClient, LOCAL_MIRROR_UUID, ORPHAN_MIRROR_UUID};

use async_trait::async_trait;
use blockimg_common::{Error, ImageId, PoolId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

#[derive(Clone, Debug)]
struct JournalState {
    order: u8,
    splay_width: u8,
    tag_owner: String,
    resync_requested: bool,
}

#[derive(Default)]
struct Inner {
    journals: BTreeMap<(PoolId, ImageId), JournalState>,
    failpoints: HashMap<String, VecDeque<Error>>,
}

/// Journal client backed by shared memory; clones see the same journals
#[derive(Clone, Default)]
pub struct MemoryJournal {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand tag ownership to another cluster
    pub fn set_tag_owner(&self, pool: PoolId, image_id: &ImageId, owner: &str) {
        if let Some(j) = self
            .inner
            .lock()
            .journals
            .get_mut(&(pool, image_id.clone()))
        {
            j.tag_owner = owner.to_string();
        }
    }

    #[must_use]
    pub fn exists(&self, pool: PoolId, image_id: &ImageId) -> bool {
        self.inner
            .lock()
            .journals
            .contains_key(&(pool, image_id.clone()))
    }

    #[must_use]
    pub fn resync_requested(&self, pool: PoolId, image_id: &ImageId) -> bool {
        self.inner
            .lock()
            .journals
            .get(&(pool, image_id.clone()))
            .is_some_and(|j| j.resync_requested)
    }

    /// Layout the journal was created with
    #[must_use]
    pub fn layout(&self, pool: PoolId, image_id: &ImageId) -> Option<(u8, u8)> {
        self.inner
            .lock()
            .journals
            .get(&(pool, image_id.clone()))
            .map(|j| (j.order, j.splay_width))
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_next(&self, op: &str, err: Error) {
        self.inner
            .lock()
            .failpoints
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    fn with_journal<T>(
        &self,
        op: &str,
        pool: PoolId,
        image_id: &ImageId,
        f: impl FnOnce(&mut JournalState) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.failpoints.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        let journal = inner
            .journals
            .get_mut(&(pool, image_id.clone()))
            .ok_or_else(|| Error::not_found(format!("journal of {image_id}")))?;
        f(journal)
    }
}

#[async_trait]
impl JournalClient for MemoryJournal {
    async fn create(
        &self,
        pool: PoolId,
        image_id: &ImageId,
        order: u8,
        splay_width: u8,
        tag_owner: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.failpoints.get_mut("create").and_then(VecDeque::pop_front) {
            return Err(err);
        }
        let key = (pool, image_id.clone());
        if inner.journals.contains_key(&key) {
            return Err(Error::already_exists(format!("journal of {image_id}")));
        }
        inner.journals.insert(
            key,
            JournalState {
                order,
                splay_width,
                tag_owner: tag_owner.to_string(),
                resync_requested: false,
            },
        );
        Ok(())
    }

    async fn remove(&self, pool: PoolId, image_id: &ImageId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.failpoints.get_mut("remove").and_then(VecDeque::pop_front) {
            return Err(err);
        }
        inner
            .journals
            .remove(&(pool, image_id.clone()))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("journal of {image_id}")))
    }

    async fn get_tag_owner(&self, pool: PoolId, image_id: &ImageId) -> Result<String> {
        self.with_journal("get_tag_owner", pool, image_id, |j| Ok(j.tag_owner.clone()))
    }

    async fn promote(&self, pool: PoolId, image_id: &ImageId) -> Result<()> {
        self.with_journal("promote", pool, image_id, |j| {
            j.tag_owner = LOCAL_MIRROR_UUID.to_string();
            Ok(())
        })
    }

    async fn demote(&self, pool: PoolId, image_id: &ImageId) -> Result<()> {
        self.with_journal("demote", pool, image_id, |j| {
            if j.tag_owner != LOCAL_MIRROR_UUID {
                return Err(Error::invalid_argument(format!(
                    "journal of {image_id} is not owned locally"
                )));
            }
            j.tag_owner = ORPHAN_MIRROR_UUID.to_string();
            Ok(())
        })
    }

    async fn request_resync(&self, pool: PoolId, image_id: &ImageId) -> Result<()> {
        self.with_journal("request_resync", pool, image_id, |j| {
            j.resync_requested = true;
            Ok(())
        })
    }
}
