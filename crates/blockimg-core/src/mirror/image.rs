//! Image-level mirroring transitions

use super::{DisableRequest, EnableRequest};
use crate::image::ImageHandle;
use crate::journal::role_of;
use crate::lock::{ExclusiveLock, LockPolicy};
use crate::rollback::RollbackStack;

use blockimg_common::{
    Error, Features, MirrorImage, MirrorImageInfo, MirrorImageState, MirrorImageStatus,
    MirrorImageStatusState, MirrorMode, MirrorRole, MirrorStatusRecord, ParentSpec, Result,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl ImageHandle {
    async fn require_image_mode(&self) -> Result<()> {
        let mode = self.store().mirror_mode_get(self.pool().id).await?;
        if mode != MirrorMode::Image {
            return Err(Error::invalid_argument(format!(
                "pool {} is in {mode} mirroring mode",
                self.pool().name
            )));
        }
        Ok(())
    }

    /// Enable mirroring of this image; the pool must be in IMAGE mode
    pub async fn mirror_image_enable(&self, relax_same_pool_parent_check: bool) -> Result<()> {
        debug!(image = %self.name(), "Enabling mirroring");
        self.require_image_mode().await?;
        self.enable_mirroring(relax_same_pool_parent_check).await
    }

    pub(crate) async fn enable_mirroring(&self, relax_same_pool_parent_check: bool) -> Result<()> {
        let (features, parent) = self.read_meta(|m| (m.features, m.parent.clone()));
        if !features.contains(Features::JOURNALING) {
            return Err(Error::invalid_argument(format!(
                "journaling is not enabled on {}",
                self.name()
            )));
        }

        if let Some(parent) = parent {
            let store = self.store();
            let spec = &parent.spec;
            if relax_same_pool_parent_check && spec.pool_id == self.pool().id {
                let header = store.get_header(spec.pool_id, &spec.image_id).await?;
                if !header.features.contains(Features::JOURNALING) {
                    return Err(Error::invalid_argument(format!(
                        "parent of {} does not have journaling enabled",
                        self.name()
                    )));
                }
            } else {
                let mirrored = match store.mirror_image_get(spec.pool_id, &spec.image_id).await {
                    Ok(image) => image.state == MirrorImageState::Enabled,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e),
                };
                if !mirrored {
                    return Err(Error::invalid_argument(format!(
                        "parent of {} is not mirrored",
                        self.name()
                    )));
                }
            }
        }

        EnableRequest {
            store: self.store().as_ref(),
            journal: self.manager().journal().as_ref(),
            pool: self.pool().id,
            image_id: self.id(),
            non_primary_global_id: None,
        }
        .send()
        .await
    }

    /// Disable mirroring of this image; the pool must be in IMAGE mode
    pub async fn mirror_image_disable(&self, force: bool) -> Result<()> {
        debug!(image = %self.name(), force, "Disabling mirroring");
        self.require_image_mode().await?;
        self.disable_mirroring(force, true).await
    }

    /// Disable mirroring unless a clone of one of the snapshots is still
    /// mirrored; the registry entry is restored to ENABLED on failure
    pub(crate) async fn disable_mirroring(&self, force: bool, remove: bool) -> Result<()> {
        let store = self.store().clone();
        let pool = self.pool().id;
        let image = match store.mirror_image_get(pool, self.id()).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut rollback = RollbackStack::new();
        if image.state == MirrorImageState::Enabled {
            store
                .mirror_image_set(
                    pool,
                    self.id(),
                    MirrorImage {
                        global_image_id: image.global_image_id.clone(),
                        state: MirrorImageState::Disabling,
                    },
                )
                .await?;
            let store = store.clone();
            let id = self.id().clone();
            rollback.push("restore enabled mirroring state", move || async move {
                store.mirror_image_set(pool, &id, image).await
            });
        }

        let result = async {
            self.ensure_no_mirrored_children().await?;
            DisableRequest {
                store: store.as_ref(),
                journal: self.manager().journal().as_ref(),
                pool,
                image_id: self.id(),
                force,
                remove,
            }
            .send()
            .await
        }
        .await;

        match result {
            Ok(()) => {
                rollback.commit();
                Ok(())
            }
            Err(e) => {
                error!("Failed to disable mirroring of {}: {}", self.name(), e);
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    async fn ensure_no_mirrored_children(&self) -> Result<()> {
        let snapshots: Vec<_> = self.read_meta(|m| m.snapshots.iter().map(|s| s.id).collect());
        let store = self.store();
        for snap_id in snapshots {
            let spec = ParentSpec::new(self.pool().id, self.id().clone(), snap_id);
            for (pool, ids) in self.manager().list_children_info(&spec).await? {
                for id in ids {
                    match store.mirror_image_get(pool, &id).await {
                        Ok(image) if image.state != MirrorImageState::Disabled => {
                            return Err(Error::busy(format!(
                                "clone {id} of {} is still mirrored",
                                self.name()
                            )));
                        }
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Take the primary role for this image
    pub async fn mirror_image_promote(&self, force: bool) -> Result<()> {
        let info = self.mirror_image_get_info().await?;
        if info.state != MirrorImageState::Enabled {
            return Err(Error::invalid_argument(format!(
                "mirroring is not enabled on {}",
                self.name()
            )));
        }
        if info.primary {
            return Err(Error::invalid_argument(format!(
                "image {} is already primary",
                self.name()
            )));
        }

        let journal = self.manager().journal();
        let owner = journal.get_tag_owner(self.pool().id, self.id()).await?;
        if !force && role_of(&owner) == MirrorRole::NonPrimary {
            return Err(Error::busy(format!(
                "image {} is still primary within a remote cluster",
                self.name()
            )));
        }

        journal.promote(self.pool().id, self.id()).await?;
        self.notify_update().await;
        info!(image = %self.name(), force, "Image promoted");
        Ok(())
    }

    /// Give up the primary role
    ///
    /// Peer lock requests are refused while demoting, and a lock acquired
    /// here is released again whatever the outcome.
    pub async fn mirror_image_demote(&self) -> Result<()> {
        let info = self.mirror_image_get_info().await?;
        if info.state != MirrorImageState::Enabled {
            return Err(Error::invalid_argument(format!(
                "mirroring is not enabled on {}",
                self.name()
            )));
        }
        if !info.primary {
            return Err(Error::invalid_argument(format!(
                "image {} is not primary",
                self.name()
            )));
        }
        let Some(lock) = self.exclusive_lock() else {
            return Err(Error::invalid_argument(format!(
                "exclusive lock is not enabled on {}",
                self.name()
            )));
        };

        lock.block_requests();
        let previous = self.set_lock_policy(LockPolicy::Standard);

        let mut acquired = false;
        let result = self.demote_with_lock(&lock, &mut acquired).await;

        if acquired && lock.is_lock_owner() {
            if let Err(e) = lock.release_lock().wait().await {
                warn!("Failed to release exclusive lock of {}: {}", self.name(), e);
            }
        }
        self.set_lock_policy(previous);
        lock.unblock_requests();

        match &result {
            Ok(()) => info!(image = %self.name(), "Image demoted"),
            Err(e) => error!("Failed to demote {}: {}", self.name(), e),
        }
        result
    }

    async fn demote_with_lock(&self, lock: &Arc<ExclusiveLock>, acquired: &mut bool) -> Result<()> {
        if !lock.is_lock_owner() {
            lock.acquire_lock(true).wait().await?;
            *acquired = true;
            if !self.is_exclusive_lock_owner().await? {
                return Err(Error::LockNotAcquired(format!(
                    "failed to acquire exclusive lock of {}",
                    self.name()
                )));
            }
        }
        self.manager()
            .journal()
            .demote(self.pool().id, self.id())
            .await?;
        self.notify_update().await;
        Ok(())
    }

    /// Ask for a full resync from the primary
    pub async fn mirror_image_resync(&self) -> Result<()> {
        let info = self.mirror_image_get_info().await?;
        if info.state != MirrorImageState::Enabled {
            return Err(Error::invalid_argument(format!(
                "mirroring is not enabled on {}",
                self.name()
            )));
        }
        if info.primary {
            return Err(Error::invalid_argument(format!(
                "image {} is primary, cannot resync to itself",
                self.name()
            )));
        }
        self.manager()
            .journal()
            .request_resync(self.pool().id, self.id())
            .await?;
        info!(image = %self.name(), "Resync requested");
        Ok(())
    }

    pub async fn mirror_image_get_info(&self) -> Result<MirrorImageInfo> {
        let image = match self.store().mirror_image_get(self.pool().id, self.id()).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                return Ok(MirrorImageInfo {
                    global_id: String::new(),
                    state: MirrorImageState::Disabled,
                    primary: false,
                });
            }
            Err(e) => return Err(e),
        };

        let primary = if image.state == MirrorImageState::Enabled {
            self.manager()
                .journal()
                .is_tag_owner(self.pool().id, self.id())
                .await?
        } else {
            false
        };
        Ok(MirrorImageInfo {
            global_id: image.global_image_id,
            state: image.state,
            primary,
        })
    }

    pub async fn mirror_image_get_status(&self) -> Result<MirrorImageStatus> {
        let info = self.mirror_image_get_info().await?;
        let status = match self
            .store()
            .mirror_image_status_get(self.pool().id, &info.global_id)
            .await
        {
            Ok(status) => status,
            Err(e) if e.is_not_found() => MirrorStatusRecord {
                state: MirrorImageStatusState::Unknown,
                description: "status not found".to_string(),
                ..MirrorStatusRecord::default()
            },
            Err(e) => return Err(e),
        };
        Ok(MirrorImageStatus {
            name: self.name().to_string(),
            info,
            state: status.state,
            description: status.description,
            last_update: status.last_update,
            up: status.up,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::options::{ImageOption, ImageOptions};
    use crate::testing::Fixture;
    use blockimg_common::{
        Error, Features, LockMode, LockStatus, MirrorImageState, MirrorImageStatusState,
        MirrorMode, MirrorStatusRecord,
    };

    async fn image_mode_fixture() -> Fixture {
        let fx = Fixture::new();
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Image)
            .await
            .unwrap();
        fx
    }

    #[tokio::test]
    async fn test_enable_disable_in_image_mode() {
        let fx = Fixture::new();
        assert_eq!(
            fx.manager.mirror_mode_get(fx.pool).await.unwrap(),
            MirrorMode::Disabled
        );
        fx.create("a", 10 << 20).await;
        let image = fx.manager.open(fx.pool, "a", None).await.unwrap();
        assert!(matches!(
            image.mirror_image_enable(false).await,
            Err(Error::InvalidArgument(_))
        ));

        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Image)
            .await
            .unwrap();
        image.mirror_image_enable(false).await.unwrap();
        assert_eq!(
            fx.manager.mirror_mode_get(fx.pool).await.unwrap(),
            MirrorMode::Image
        );
        let info = image.mirror_image_get_info().await.unwrap();
        assert_eq!(info.state, MirrorImageState::Enabled);
        assert!(info.primary);
        assert!(!info.global_id.is_empty());

        image.mirror_image_disable(false).await.unwrap();
        image.mirror_image_disable(false).await.unwrap();
        assert_eq!(
            image.mirror_image_get_info().await.unwrap().state,
            MirrorImageState::Disabled
        );
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_requires_journaling() {
        let fx = image_mode_fixture().await;
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Features, Features::LAYERING.bits())
            .unwrap();
        fx.manager.create(fx.pool, "plain", 1 << 20, &mut opts).await.unwrap();
        let image = fx.manager.open(fx.pool, "plain", None).await.unwrap();
        assert!(matches!(
            image.mirror_image_enable(false).await,
            Err(Error::InvalidArgument(_))
        ));
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_keeps_state_while_clone_is_mirrored() {
        let fx = image_mode_fixture().await;
        fx.create("p", 1 << 20).await;
        let parent = fx.manager.open(fx.pool, "p", None).await.unwrap();
        parent.snap_create("s").await.unwrap();
        parent.snap_protect("s").await.unwrap();

        let mut opts = ImageOptions::new();
        fx.manager
            .clone_image(fx.pool, "p", Some("s"), fx.pool, "c", &mut opts)
            .await
            .unwrap();
        let child = fx.manager.open(fx.pool, "c", None).await.unwrap();

        // Parent not mirrored yet; the relaxed check only needs journaling.
        assert!(matches!(
            child.mirror_image_enable(false).await,
            Err(Error::InvalidArgument(_))
        ));
        child.mirror_image_enable(true).await.unwrap();
        parent.mirror_image_enable(false).await.unwrap();

        assert!(matches!(
            parent.mirror_image_disable(false).await,
            Err(Error::Busy(_))
        ));
        assert_eq!(
            parent.mirror_image_get_info().await.unwrap().state,
            MirrorImageState::Enabled
        );

        child.mirror_image_disable(false).await.unwrap();
        parent.mirror_image_disable(false).await.unwrap();
        child.close().await.unwrap();
        parent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_demote_promote_resync() {
        let fx = image_mode_fixture().await;
        fx.create("a", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "a", None).await.unwrap();
        image.mirror_image_enable(false).await.unwrap();

        assert!(matches!(
            image.mirror_image_promote(false).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            image.mirror_image_resync().await,
            Err(Error::InvalidArgument(_))
        ));

        image.mirror_image_demote().await.unwrap();
        assert!(!image.mirror_image_get_info().await.unwrap().primary);
        assert_eq!(image.lock_status().await.unwrap(), LockStatus::Unlocked);
        assert!(image.lock_policy().may_auto_request_lock());
        assert!(image.exclusive_lock().unwrap().accept_requests());
        assert!(matches!(
            image.mirror_image_demote().await,
            Err(Error::InvalidArgument(_))
        ));

        image.mirror_image_resync().await.unwrap();
        assert!(fx.journal.resync_requested(fx.pool, image.id()));

        // A demoted image is orphaned and can be promoted without force.
        image.mirror_image_promote(false).await.unwrap();
        assert!(image.mirror_image_get_info().await.unwrap().primary);

        image.mirror_image_demote().await.unwrap();
        fx.journal.set_tag_owner(fx.pool, image.id(), "remote-uuid");
        assert!(matches!(
            image.mirror_image_promote(false).await,
            Err(Error::Busy(_))
        ));
        image.mirror_image_promote(true).await.unwrap();
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_demote_takes_lock_from_explicit_owner() {
        let fx = image_mode_fixture().await;
        fx.create("a", 1 << 20).await;
        let peer = fx.peer().open(fx.pool, "a", None).await.unwrap();
        peer.lock_acquire(LockMode::Exclusive).await.unwrap();

        let image = fx.manager.open(fx.pool, "a", None).await.unwrap();
        image.mirror_image_enable(false).await.unwrap();
        image.mirror_image_demote().await.unwrap();
        assert!(!peer.is_exclusive_lock_owner().await.unwrap());
        assert_eq!(image.lock_status().await.unwrap(), LockStatus::Unlocked);

        peer.close().await.unwrap();
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_demote_restores_lock_state() {
        let fx = image_mode_fixture().await;
        fx.create("a", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "a", None).await.unwrap();
        image.mirror_image_enable(false).await.unwrap();

        fx.journal
            .fail_next("demote", Error::Transport("timeout".into()));
        assert!(matches!(
            image.mirror_image_demote().await,
            Err(Error::Transport(_))
        ));
        let lock = image.exclusive_lock().unwrap();
        assert!(!lock.is_lock_owner());
        assert!(lock.accept_requests());
        assert!(image.lock_policy().may_auto_request_lock());
        assert!(image.mirror_image_get_info().await.unwrap().primary);
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_status() {
        let fx = image_mode_fixture().await;
        fx.create("a", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "a", None).await.unwrap();

        let status = image.mirror_image_get_status().await.unwrap();
        assert_eq!(status.name, "a");
        assert_eq!(status.state, MirrorImageStatusState::Unknown);
        assert_eq!(status.description, "status not found");

        image.mirror_image_enable(false).await.unwrap();
        let global = image.mirror_image_get_info().await.unwrap().global_id;
        fx.store()
            .mirror_image_status_set(
                fx.pool,
                &global,
                MirrorStatusRecord {
                    state: MirrorImageStatusState::Replaying,
                    description: "replaying".to_string(),
                    last_update: 1_700_000_000,
                    up: true,
                },
            )
            .await
            .unwrap();
        let status = image.mirror_image_get_status().await.unwrap();
        assert_eq!(status.state, MirrorImageStatusState::Replaying);
        assert!(status.up);
        assert!(status.info.primary);
        image.close().await.unwrap();
    }
}
