//! Pool mirroring mode, peers and replication status

use super::EnableRequest;
use crate::MIRRORING_OID;
use crate::manager::ImageManager;
use crate::rollback::RollbackStack;
use crate::store::Notification;

use blockimg_common::{
    Error, Features, ImageId, MirrorImageInfo, MirrorImageState, MirrorImageStatus,
    MirrorImageStatusState, MirrorMode, MirrorPeer, PoolId, Result,
};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MIRROR_LIST_PAGE: usize = 256;
const MAX_STATUS_PAGE: usize = 1024;

impl ImageManager {
    pub async fn mirror_mode_get(&self, pool: PoolId) -> Result<MirrorMode> {
        self.store().mirror_mode_get(pool).await
    }

    /// Change the pool mirroring mode
    ///
    /// Moving to POOL enables every journaling image, moving from POOL to
    /// DISABLED disables every mirrored image. When one image fails, the
    /// images already transitioned are put back and the previous mode is
    /// kept. Watchers are told the resulting mode either way.
    pub async fn mirror_mode_set(&self, pool: PoolId, mode: MirrorMode) -> Result<()> {
        let store = self.store().clone();
        let current = store.mirror_mode_get(pool).await?;
        if current == mode {
            return Ok(());
        }
        debug!(pool = %pool, from = %current, to = %mode, "Changing mirroring mode");

        if mode == MirrorMode::Disabled {
            let peers = store.mirror_peer_list(pool).await?;
            if !peers.is_empty() {
                return Err(Error::busy(format!(
                    "{} mirror peer(s) still registered",
                    peers.len()
                )));
            }
        }
        if current == MirrorMode::Disabled {
            self.ensure_mirror_uuid(pool).await?;
        }
        if current == MirrorMode::Image
            && mode == MirrorMode::Disabled
            && self.has_enabled_images(pool).await?
        {
            return Err(Error::invalid_argument(
                "mirrored images remain, disable them before disabling the pool",
            ));
        }

        let mut rollback = RollbackStack::new();
        let result = self
            .transition_mode(pool, current, mode, &mut rollback)
            .await;

        let announced = if result.is_ok() {
            rollback.commit();
            info!(pool = %pool, mode = %mode, "Mirroring mode changed");
            mode
        } else {
            rollback.unwind().await;
            current
        };

        if let Err(e) = store
            .notify(pool, MIRRORING_OID, Notification::ModeUpdated(announced))
            .await
        {
            warn!("Failed to broadcast mirroring mode of pool {}: {}", pool, e);
        }
        result
    }

    async fn transition_mode(
        &self,
        pool: PoolId,
        current: MirrorMode,
        mode: MirrorMode,
        rollback: &mut RollbackStack,
    ) -> Result<()> {
        let store = self.store().clone();

        // Per-image transitions run in image mode.
        if current != MirrorMode::Image {
            store.mirror_mode_set(pool, MirrorMode::Image).await?;
            let store = store.clone();
            rollback.push("restore mirroring mode", move || async move {
                store.mirror_mode_set(pool, current).await
            });
        }

        if mode == MirrorMode::Pool {
            self.enable_pool_images(pool, rollback).await?;
        } else if mode == MirrorMode::Disabled && current == MirrorMode::Pool {
            self.disable_pool_images(pool, rollback).await?;
        }

        if mode != MirrorMode::Image {
            store.mirror_mode_set(pool, mode).await?;
        }
        Ok(())
    }

    async fn has_enabled_images(&self, pool: PoolId) -> Result<bool> {
        let store = self.store();
        let mut last = String::new();
        loop {
            let images = store.mirror_image_list(pool, &last, MIRROR_LIST_PAGE).await?;
            let count = images.len();
            for id in images.into_keys() {
                match store.mirror_image_get(pool, &id).await {
                    Ok(image) if image.state == MirrorImageState::Enabled => return Ok(true),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                last = id.as_str().to_string();
            }
            if count < MIRROR_LIST_PAGE {
                return Ok(false);
            }
        }
    }

    async fn ensure_mirror_uuid(&self, pool: PoolId) -> Result<()> {
        match self.store().mirror_uuid_get(pool).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                let uuid = Uuid::new_v4().to_string();
                debug!(pool = %pool, uuid = %uuid, "Assigning mirror uuid");
                self.store().mirror_uuid_set(pool, &uuid).await
            }
            Err(e) => Err(e),
        }
    }

    async fn enable_pool_images(&self, pool: PoolId, rollback: &mut RollbackStack) -> Result<()> {
        for (name, _) in self.directory().list_current(pool).await? {
            let image = self.open(pool, &name, None).await?;
            let journaling = image.read_meta(|m| m.features.contains(Features::JOURNALING));
            let result = if journaling {
                match image.mirror_image_get_info().await {
                    Ok(info) if info.state == MirrorImageState::Enabled => Ok(false),
                    Ok(_) => image.enable_mirroring(true).await.map(|()| true),
                    Err(e) => Err(e),
                }
            } else {
                Ok(false)
            };
            if let Err(e) = image.close().await {
                warn!("Failed to close {}: {}", name, e);
            }

            match result {
                Ok(true) => {
                    let manager = self.clone();
                    rollback.push(format!("disable mirroring of {name}"), move || async move {
                        let image = manager.open(pool, &name, None).await?;
                        let result = image.disable_mirroring(true, true).await;
                        image.close().await?;
                        result
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to enable mirroring of {}: {}", name, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn disable_pool_images(&self, pool: PoolId, rollback: &mut RollbackStack) -> Result<()> {
        let store = self.store().clone();
        let mut last = String::new();
        loop {
            let images = store.mirror_image_list(pool, &last, MIRROR_LIST_PAGE).await?;
            let count = images.len();
            for (id, global_image_id) in images {
                last = id.as_str().to_string();
                let image = self.open_by_id(pool, &id, None).await?;
                let result = image.disable_mirroring(false, true).await;
                if let Err(e) = image.close().await {
                    warn!("Failed to close {}: {}", image.name(), e);
                }
                if let Err(e) = result {
                    error!("Failed to disable mirroring of {}: {}", image.name(), e);
                    return Err(e);
                }

                let manager = self.clone();
                rollback.push(format!("re-enable mirroring of {id}"), move || async move {
                    EnableRequest {
                        store: manager.store().as_ref(),
                        journal: manager.journal().as_ref(),
                        pool,
                        image_id: &id,
                        non_primary_global_id: Some(&global_image_id),
                    }
                    .send()
                    .await
                });
            }
            if count < MIRROR_LIST_PAGE {
                return Ok(());
            }
        }
    }

    /// Register a remote peer cluster; returns the peer uuid
    pub async fn mirror_peer_add(
        &self,
        pool: PoolId,
        cluster_name: &str,
        client_name: &str,
    ) -> Result<String> {
        if cluster_name == self.config().mirroring.local_cluster_name {
            return Err(Error::invalid_argument(format!(
                "cannot add the local cluster {cluster_name} as a peer"
            )));
        }
        loop {
            let uuid = Uuid::new_v4().to_string();
            let peer = MirrorPeer {
                uuid: uuid.clone(),
                cluster_name: cluster_name.to_string(),
                client_name: client_name.to_string(),
            };
            match self.store().mirror_peer_add(pool, peer).await {
                Ok(()) => {
                    info!(pool = %pool, cluster = cluster_name, uuid = %uuid, "Added mirror peer");
                    return Ok(uuid);
                }
                Err(Error::Stale(_)) => debug!("Peer uuid {} taken, retrying", uuid),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn mirror_peer_remove(&self, pool: PoolId, uuid: &str) -> Result<()> {
        match self.store().mirror_peer_remove(pool, uuid).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn mirror_peer_list(&self, pool: PoolId) -> Result<Vec<MirrorPeer>> {
        self.store().mirror_peer_list(pool).await
    }

    pub async fn mirror_peer_set_client(
        &self,
        pool: PoolId,
        uuid: &str,
        client_name: &str,
    ) -> Result<()> {
        self.store()
            .mirror_peer_set_client(pool, uuid, client_name)
            .await
    }

    pub async fn mirror_peer_set_cluster(
        &self,
        pool: PoolId,
        uuid: &str,
        cluster_name: &str,
    ) -> Result<()> {
        if cluster_name == self.config().mirroring.local_cluster_name {
            return Err(Error::invalid_argument(format!(
                "cannot use the local cluster {cluster_name} as a peer"
            )));
        }
        self.store()
            .mirror_peer_set_cluster(pool, uuid, cluster_name)
            .await
    }

    /// Replication status of up to `max` mirrored images with ids after
    /// `start_id`
    pub async fn mirror_image_status_list(
        &self,
        pool: PoolId,
        start_id: &str,
        max: usize,
    ) -> Result<BTreeMap<ImageId, MirrorImageStatus>> {
        let (images, statuses) = self
            .store()
            .mirror_image_status_list(pool, start_id, max.min(MAX_STATUS_PAGE))
            .await?;

        let mut result = BTreeMap::new();
        for (id, image) in images {
            let name = match self.store().dir_get_name(pool, &id).await {
                Ok(name) => name,
                Err(e) if e.is_not_found() => {
                    debug!("Skipping mirrored image {} missing from directory", id);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let (state, description, last_update, up) = statuses.get(&id).map_or_else(
                || {
                    (
                        MirrorImageStatusState::Unknown,
                        "status not found".to_string(),
                        0,
                        false,
                    )
                },
                |s| (s.state, s.description.clone(), s.last_update, s.up),
            );
            result.insert(
                id,
                MirrorImageStatus {
                    name,
                    info: MirrorImageInfo {
                        global_id: image.global_image_id,
                        state: image.state,
                        primary: false,
                    },
                    state,
                    description,
                    last_update,
                    up,
                },
            );
        }
        Ok(result)
    }

    /// Number of mirrored images per replication state
    pub async fn mirror_image_status_summary(
        &self,
        pool: PoolId,
    ) -> Result<BTreeMap<MirrorImageStatusState, usize>> {
        self.store().mirror_image_status_summary(pool).await
    }
}

#[cfg(test)]
mod tests {
    use crate::options::{ImageOption, ImageOptions};
    use crate::store::ClassFeature;
    use crate::testing::Fixture;
    use blockimg_common::{
        Error, Features, MirrorImage, MirrorImageState, MirrorImageStatusState, MirrorMode,
        MirrorStatusRecord,
    };

    async fn mirror_state(fx: &Fixture, name: &str) -> MirrorImageState {
        let image = fx.manager.open(fx.pool, name, None).await.unwrap();
        let state = image.mirror_image_get_info().await.unwrap().state;
        image.close().await.unwrap();
        state
    }

    #[tokio::test]
    async fn test_pool_mode_fans_out() {
        let fx = Fixture::new();
        fx.create("a", 1 << 20).await;
        fx.create("b", 1 << 20).await;
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Features, Features::LAYERING.bits())
            .unwrap();
        fx.manager.create(fx.pool, "plain", 1 << 20, &mut opts).await.unwrap();

        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Pool)
            .await
            .unwrap();
        assert_eq!(
            fx.manager.mirror_mode_get(fx.pool).await.unwrap(),
            MirrorMode::Pool
        );
        assert!(!fx.store().mirror_uuid_get(fx.pool).await.unwrap().is_empty());
        assert_eq!(mirror_state(&fx, "a").await, MirrorImageState::Enabled);
        assert_eq!(mirror_state(&fx, "b").await, MirrorImageState::Enabled);
        assert_eq!(mirror_state(&fx, "plain").await, MirrorImageState::Disabled);

        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Disabled)
            .await
            .unwrap();
        assert_eq!(mirror_state(&fx, "a").await, MirrorImageState::Disabled);
        assert_eq!(mirror_state(&fx, "b").await, MirrorImageState::Disabled);
    }

    #[tokio::test]
    async fn test_image_mode_cannot_disable_with_mirrored_images() {
        let fx = Fixture::new();
        fx.create("a", 1 << 20).await;
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Image)
            .await
            .unwrap();
        let image = fx.manager.open(fx.pool, "a", None).await.unwrap();
        image.mirror_image_enable(false).await.unwrap();

        assert!(matches!(
            fx.manager.mirror_mode_set(fx.pool, MirrorMode::Disabled).await,
            Err(Error::InvalidArgument(_))
        ));
        image.mirror_image_disable(false).await.unwrap();
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Disabled)
            .await
            .unwrap();
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabling_with_peers_has_no_side_effects() {
        let fx = Fixture::new();
        fx.create("a", 1 << 20).await;
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Pool)
            .await
            .unwrap();
        let a = fx.store().get_id(fx.pool, "a").await.unwrap();
        let global = fx.store().mirror_image_get(fx.pool, &a).await.unwrap().global_image_id;
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
        fx.manager
            .mirror_peer_add(fx.pool, "remote", "client.admin")
            .await
            .unwrap();

        let sets = fx.cluster.op_count("mirror_image_set");
        let notifies = fx.cluster.op_count("notify");
        assert!(matches!(
            fx.manager.mirror_mode_set(fx.pool, MirrorMode::Disabled).await,
            Err(Error::Busy(_))
        ));
        assert_eq!(fx.cluster.op_count("mirror_image_set"), sets);
        assert_eq!(fx.cluster.op_count("notify"), notifies);
        assert_eq!(
            fx.manager.mirror_mode_get(fx.pool).await.unwrap(),
            MirrorMode::Pool
        );
        assert_eq!(mirror_state(&fx, "a").await, MirrorImageState::Enabled);
        let status = fx.store().mirror_image_status_get(fx.pool, &global).await.unwrap();
        assert_eq!(status.state, MirrorImageStatusState::Replaying);
    }

    #[tokio::test]
    async fn test_stuck_disabling_entry_does_not_block_pool_disable() {
        let fx = Fixture::new();
        fx.create("a", 1 << 20).await;
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Image)
            .await
            .unwrap();
        let image = fx.manager.open(fx.pool, "a", None).await.unwrap();
        image.mirror_image_enable(false).await.unwrap();
        image.close().await.unwrap();

        // A disable that died halfway leaves the entry in DISABLING.
        let a = fx.store().get_id(fx.pool, "a").await.unwrap();
        let global = fx.store().mirror_image_get(fx.pool, &a).await.unwrap().global_image_id;
        fx.store()
            .mirror_image_set(
                fx.pool,
                &a,
                MirrorImage {
                    global_image_id: global,
                    state: MirrorImageState::Disabling,
                },
            )
            .await
            .unwrap();

        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Disabled)
            .await
            .unwrap();
        assert_eq!(
            fx.manager.mirror_mode_get(fx.pool).await.unwrap(),
            MirrorMode::Disabled
        );
    }

    #[tokio::test]
    async fn test_failed_fan_out_restores_previous_mode() {
        let fx = Fixture::new();
        fx.create("a", 1 << 20).await;
        fx.create("b", 1 << 20).await;

        // The second image fails to enable.
        let a = fx.store().get_id(fx.pool, "a").await.unwrap();
        let b = fx.store().get_id(fx.pool, "b").await.unwrap();
        fx.journal.set_tag_owner(fx.pool, &b, "remote-uuid");

        assert!(matches!(
            fx.manager.mirror_mode_set(fx.pool, MirrorMode::Pool).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            fx.manager.mirror_mode_get(fx.pool).await.unwrap(),
            MirrorMode::Disabled
        );
        assert!(fx.store().mirror_image_get(fx.pool, &a).await.unwrap_err().is_not_found());
        assert!(fx.store().mirror_image_get(fx.pool, &b).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unsupported_mirroring() {
        let fx = Fixture::new();
        fx.cluster.disable_class(ClassFeature::Mirroring);
        assert!(fx
            .manager
            .mirror_mode_get(fx.pool)
            .await
            .unwrap_err()
            .is_unsupported());
    }

    #[tokio::test]
    async fn test_peers() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.manager.mirror_peer_add(fx.pool, "remote", "client.admin").await,
            Err(Error::InvalidArgument(_))
        ));
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Image)
            .await
            .unwrap();

        assert!(matches!(
            fx.manager.mirror_peer_add(fx.pool, "local", "client.admin").await,
            Err(Error::InvalidArgument(_))
        ));
        let uuid = fx
            .manager
            .mirror_peer_add(fx.pool, "remote", "client.admin")
            .await
            .unwrap();
        assert!(matches!(
            fx.manager.mirror_peer_add(fx.pool, "remote", "client.admin").await,
            Err(Error::AlreadyExists(_))
        ));

        fx.manager
            .mirror_peer_set_client(fx.pool, &uuid, "client.mirror")
            .await
            .unwrap();
        fx.manager
            .mirror_peer_set_cluster(fx.pool, &uuid, "site-b")
            .await
            .unwrap();
        let peers = fx.manager.mirror_peer_list(fx.pool).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].cluster_name, "site-b");
        assert_eq!(peers[0].client_name, "client.mirror");

        // Peers keep the pool from being disabled.
        assert!(matches!(
            fx.manager.mirror_mode_set(fx.pool, MirrorMode::Disabled).await,
            Err(Error::Busy(_))
        ));

        fx.manager.mirror_peer_remove(fx.pool, &uuid).await.unwrap();
        fx.manager.mirror_peer_remove(fx.pool, &uuid).await.unwrap();
        assert!(fx.manager.mirror_peer_list(fx.pool).await.unwrap().is_empty());
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Disabled)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_list_and_summary() {
        let fx = Fixture::new();
        fx.create("a", 1 << 20).await;
        fx.create("b", 1 << 20).await;
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Pool)
            .await
            .unwrap();

        let a = fx.store().get_id(fx.pool, "a").await.unwrap();
        let global = fx.store().mirror_image_get(fx.pool, &a).await.unwrap().global_image_id;
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

        let statuses = fx.manager.mirror_image_status_list(fx.pool, "", 10).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[&a].name, "a");
        assert_eq!(statuses[&a].state, MirrorImageStatusState::Replaying);
        let other = statuses.values().find(|s| s.name == "b").unwrap();
        assert_eq!(other.state, MirrorImageStatusState::Unknown);

        let summary = fx.manager.mirror_image_status_summary(fx.pool).await.unwrap();
        assert_eq!(summary[&MirrorImageStatusState::Replaying], 1);
        assert_eq!(summary[&MirrorImageStatusState::Unknown], 1);
    }
}
