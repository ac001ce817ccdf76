//! Registry-level enable and disable protocols
//!
//! These work on the image id alone, without an open handle, so creation,
//! clone and the pool-mode fan-out can run them too.

use crate::MIRRORING_OID;
use crate::journal::JournalClient;
use crate::store::{MetadataStore, Notification};

use blockimg_common::{Error, ImageId, MirrorImage, MirrorImageState, PoolId, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

async fn notify_image_updated(
    store: &dyn MetadataStore,
    pool: PoolId,
    image_id: &ImageId,
    global_image_id: &str,
    state: MirrorImageState,
) {
    let notification = Notification::ImageUpdated {
        image_id: image_id.clone(),
        global_image_id: global_image_id.to_string(),
        state,
    };
    if let Err(e) = store.notify(pool, MIRRORING_OID, notification).await {
        warn!("Failed to broadcast mirroring update of {}: {}", image_id, e);
    }
}

/// Register an image in the mirroring registry as enabled
pub(crate) struct EnableRequest<'a> {
    pub store: &'a dyn MetadataStore,
    pub journal: &'a dyn JournalClient,
    pub pool: PoolId,
    pub image_id: &'a ImageId,
    /// Global id assigned by the primary cluster; also allows enabling an
    /// image that is not primary here
    pub non_primary_global_id: Option<&'a str>,
}

impl EnableRequest<'_> {
    pub async fn send(self) -> Result<()> {
        match self.store.mirror_image_get(self.pool, self.image_id).await {
            Ok(image) if image.state == MirrorImageState::Enabled => {
                debug!(image = %self.image_id, "Mirroring already enabled");
                return Ok(());
            }
            Ok(image) if image.state == MirrorImageState::Disabling => {
                return Err(Error::invalid_argument(format!(
                    "mirroring of {} is being disabled",
                    self.image_id
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if self.non_primary_global_id.is_none()
            && !self.journal.is_tag_owner(self.pool, self.image_id).await?
        {
            return Err(Error::invalid_argument(format!(
                "image {} is not primary",
                self.image_id
            )));
        }

        let global_image_id = self
            .non_primary_global_id
            .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);
        self.store
            .mirror_image_set(
                self.pool,
                self.image_id,
                MirrorImage {
                    global_image_id: global_image_id.clone(),
                    state: MirrorImageState::Enabled,
                },
            )
            .await?;

        notify_image_updated(
            self.store,
            self.pool,
            self.image_id,
            &global_image_id,
            MirrorImageState::Enabled,
        )
        .await;
        info!(image = %self.image_id, global_id = %global_image_id, "Mirroring enabled");
        Ok(())
    }
}

/// Move an image to DISABLING and optionally drop its registry entry
pub(crate) struct DisableRequest<'a> {
    pub store: &'a dyn MetadataStore,
    pub journal: &'a dyn JournalClient,
    pub pool: PoolId,
    pub image_id: &'a ImageId,
    /// Allow disabling a non-primary image
    pub force: bool,
    /// Remove the registry entry once disabling
    pub remove: bool,
}

impl DisableRequest<'_> {
    pub async fn send(self) -> Result<()> {
        let mut image = match self.store.mirror_image_get(self.pool, self.image_id).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                debug!(image = %self.image_id, "Mirroring already disabled");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self.force && !self.journal.is_tag_owner(self.pool, self.image_id).await? {
            return Err(Error::invalid_argument(format!(
                "mirrored image {} is not primary, disable with force",
                self.image_id
            )));
        }

        if image.state != MirrorImageState::Disabling {
            image.state = MirrorImageState::Disabling;
            self.store
                .mirror_image_set(self.pool, self.image_id, image.clone())
                .await?;
            notify_image_updated(
                self.store,
                self.pool,
                self.image_id,
                &image.global_image_id,
                MirrorImageState::Disabling,
            )
            .await;
        }

        match self
            .store
            .mirror_image_status_remove(self.pool, &image.global_image_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if self.remove {
            self.store
                .mirror_image_remove(self.pool, self.image_id)
                .await?;
            notify_image_updated(
                self.store,
                self.pool,
                self.image_id,
                &image.global_image_id,
                MirrorImageState::Disabled,
            )
            .await;
        }
        info!(image = %self.image_id, remove = self.remove, "Mirroring disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::store::MemoryCluster;
    use blockimg_common::{MirrorImageStatusState, MirrorStatusRecord};

    fn setup() -> (MemoryCluster, MemoryJournal, PoolId, ImageId) {
        let cluster = MemoryCluster::new();
        let pool = cluster.create_pool("rbd");
        (cluster, MemoryJournal::new(), pool, ImageId::new("10ab"))
    }

    #[tokio::test]
    async fn test_enable_then_disable() {
        let (cluster, journal, pool, id) = setup();
        let store = cluster.connect();
        journal.create(pool, &id, 24, 4, "").await.unwrap();

        let enable = || EnableRequest {
            store: &store,
            journal: &journal,
            pool,
            image_id: &id,
            non_primary_global_id: None,
        };
        enable().send().await.unwrap();
        let global = store.mirror_image_get(pool, &id).await.unwrap().global_image_id;
        enable().send().await.unwrap();
        assert_eq!(
            store.mirror_image_get(pool, &id).await.unwrap().global_image_id,
            global
        );

        store
            .mirror_image_status_set(
                pool,
                &global,
                MirrorStatusRecord {
                    state: MirrorImageStatusState::Replaying,
                    ..MirrorStatusRecord::default()
                },
            )
            .await
            .unwrap();

        let disable = |remove| DisableRequest {
            store: &store,
            journal: &journal,
            pool,
            image_id: &id,
            force: false,
            remove,
        };
        disable(false).send().await.unwrap();
        assert_eq!(
            store.mirror_image_get(pool, &id).await.unwrap().state,
            MirrorImageState::Disabling
        );
        assert!(store
            .mirror_image_status_get(pool, &global)
            .await
            .unwrap_err()
            .is_not_found());

        // Disabling blocks re-enabling until the entry is gone.
        assert!(matches!(
            enable().send().await,
            Err(Error::InvalidArgument(_))
        ));
        disable(true).send().await.unwrap();
        assert!(store.mirror_image_get(pool, &id).await.unwrap_err().is_not_found());
        disable(true).send().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_primary_requires_provision_or_force() {
        let (cluster, journal, pool, id) = setup();
        let store = cluster.connect();
        journal.create(pool, &id, 24, 4, "remote").await.unwrap();

        let result = EnableRequest {
            store: &store,
            journal: &journal,
            pool,
            image_id: &id,
            non_primary_global_id: None,
        }
        .send()
        .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        EnableRequest {
            store: &store,
            journal: &journal,
            pool,
            image_id: &id,
            non_primary_global_id: Some("global-1"),
        }
        .send()
        .await
        .unwrap();

        let disable = |force| DisableRequest {
            store: &store,
            journal: &journal,
            pool,
            image_id: &id,
            force,
            remove: true,
        };
        assert!(matches!(
            disable(false).send().await,
            Err(Error::InvalidArgument(_))
        ));
        disable(true).send().await.unwrap();
    }
}
