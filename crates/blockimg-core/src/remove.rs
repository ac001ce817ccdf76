//! Image removal
//!
//! Removal refuses images that are still in use: snapshots, other watchers,
//! group membership or a lock this client cannot obtain. Teardown then runs
//! step by step; every step tolerates a missing object, so removing a
//! partially removed image again finishes the job.

use crate::image::ImageHandle;
use crate::manager::ImageManager;
use crate::progress::Progress;
use crate::{header_name, id_obj_name, object_map_name, old_header_name};

use blockimg_common::{Error, ImageId, PoolId, Result};
use tracing::{debug, error, info, warn};

/// Treat `NotFound` as success
fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl ImageManager {
    /// Remove image `name`
    ///
    /// With `force` the exclusive lock is shut down instead of negotiated
    /// and a non-primary mirrored image may be removed.
    pub async fn remove(
        &self,
        pool: PoolId,
        name: &str,
        force: bool,
        progress: &dyn Progress,
    ) -> Result<()> {
        debug!(pool = %pool, image = name, force, "Removing image");

        let mut legacy = false;
        let mut id = None;
        match self.open(pool, name, None).await {
            Ok(image) => {
                legacy = image.format().is_legacy();
                if !legacy {
                    id = Some(image.id().clone());
                }
                let result = self.remove_header(&image, force, progress).await;
                if let Err(e) = image.close().await {
                    warn!("Failed to close {}: {}", name, e);
                }
                if let Err(e) = result {
                    error!("Failed to remove {}: {}", name, e);
                    return Err(e);
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(image = name, "Header not found, cleaning up directory");
            }
            Err(e) => return Err(e),
        }

        if legacy {
            tolerate_missing(self.store().tmap_rm(pool, name).await)?;
        } else {
            let id = match id {
                Some(id) => id,
                None => match self.directory().resolve_id(pool, name).await {
                    Ok(id) => id,
                    Err(e) if e.is_not_found() => {
                        tolerate_missing(self.store().tmap_rm(pool, name).await)?;
                        info!(image = name, "Image already removed");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            };
            self.remove_registration(pool, name, &id).await?;
        }

        info!(pool = %pool, image = name, "Image removed");
        Ok(())
    }

    /// Safety checks, data trim and header deletion on an open image
    async fn remove_header(
        &self,
        image: &ImageHandle,
        force: bool,
        progress: &dyn Progress,
    ) -> Result<()> {
        let store = self.store();
        let pool = image.pool().id;
        let legacy = image.format().is_legacy();

        if image.read_meta(|m| !m.snapshots.is_empty()) {
            return Err(Error::NotEmpty(format!(
                "image {} has snapshots",
                image.name()
            )));
        }

        let watchers = store.list_watchers(pool, image.header_oid()).await?;
        if watchers.len() > 1 {
            return Err(Error::busy(format!(
                "image {} has {} watchers",
                image.name(),
                watchers.len()
            )));
        }

        if !legacy {
            match store.image_get_group(pool, image.id()).await {
                Ok(Some(group)) => {
                    return Err(Error::InUse(format!(
                        "image {} belongs to group {}",
                        image.name(),
                        group.group_id
                    )));
                }
                Ok(None) => {}
                Err(e) if e.is_unsupported() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(lock) = image.exclusive_lock() {
            if force {
                if let Err(e) = lock.shut_down().wait().await {
                    warn!("Failed to shut down exclusive lock of {}: {}", image.name(), e);
                }
            } else {
                let acquired = image.prepare_image_update().await;
                if acquired.is_err() || !lock.is_lock_owner() {
                    return Err(Error::busy(format!(
                        "cannot obtain exclusive lock of {}",
                        image.name()
                    )));
                }
            }
        }

        self.trim_image(image, progress).await?;

        if let Some(parent) = image.read_meta(|m| m.parent.clone()) {
            tolerate_missing(store.remove_child(pool, &parent.spec, image.id()).await)?;
        }

        if !legacy {
            match image.disable_mirroring(force, !force).await {
                Ok(()) => {}
                Err(e) if e.is_unsupported() => {}
                Err(e) => {
                    error!("Failed to disable mirroring of {}: {}", image.name(), e);
                    return Err(e);
                }
            }
        }

        let header_oid = if legacy {
            old_header_name(image.name())
        } else {
            header_name(image.id())
        };
        tolerate_missing(store.remove(pool, &header_oid).await)
    }

    /// Delete the data objects and shrink the image to zero
    async fn trim_image(&self, image: &ImageHandle, progress: &dyn Progress) -> Result<()> {
        let store = self.store();
        let pool = image.pool().id;
        let prefix = image.read_meta(|m| format!("{}.", m.object_prefix));

        let objects = store.list_objects(pool, &prefix).await?;
        let total = objects.len() as u64;
        for (done, oid) in (1..).zip(objects) {
            tolerate_missing(store.remove(pool, &oid).await)?;
            progress.update_progress(done, total);
        }

        if !image.format().is_legacy() {
            tolerate_missing(store.set_size(pool, image.id(), 0).await)?;
        }
        Ok(())
    }

    /// Drop everything that still refers to a current-format image id
    async fn remove_registration(&self, pool: PoolId, name: &str, id: &ImageId) -> Result<()> {
        let store = self.store();

        tolerate_missing(self.journal().remove(pool, id).await)?;
        tolerate_missing(store.remove(pool, &object_map_name(id)).await)?;
        match store.mirror_image_remove(pool, id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() || e.is_unsupported() => {}
            Err(e) => {
                error!("Failed to remove mirroring entry of {}: {}", name, e);
                return Err(e);
            }
        }
        tolerate_missing(store.remove(pool, &id_obj_name(name)).await)?;
        tolerate_missing(store.dir_remove_image(pool, name, id).await)
    }
}

#[cfg(test)]
mod tests {
    use crate::options::{ImageOption, ImageOptions};
    use crate::progress::NoOpProgress;
    use crate::testing::Fixture;
    use crate::{data_object_name, header_name, id_obj_name, object_map_name, old_header_name};
    use blockimg_common::{Error, GroupSpec, LockMode, MirrorMode};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_remove_twice() {
        let fx = Fixture::new();
        fx.create("img", 4 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        let id = image.id().clone();
        let prefix = image.meta().object_prefix;
        image.close().await.unwrap();
        fx.store()
            .write_full(fx.pool, &data_object_name(&prefix, 0), Bytes::from_static(b"x"))
            .await
            .unwrap();

        fx.manager
            .remove(fx.pool, "img", false, &NoOpProgress)
            .await
            .unwrap();
        assert!(!fx.cluster.object_exists(fx.pool, &header_name(&id)));
        assert!(!fx.cluster.object_exists(fx.pool, &id_obj_name("img")));
        assert!(!fx.cluster.object_exists(fx.pool, &object_map_name(&id)));
        assert!(!fx.cluster.object_exists(fx.pool, &data_object_name(&prefix, 0)));
        assert!(!fx.journal.exists(fx.pool, &id));
        assert!(fx.manager.list(fx.pool).await.unwrap().is_empty());

        fx.manager
            .remove(fx.pool, "img", false, &NoOpProgress)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshots_block_removal() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        image.snap_create("s").await.unwrap();
        let id = image.id().clone();
        image.close().await.unwrap();

        let removes = fx.cluster.op_count("remove");
        let resizes = fx.cluster.op_count("set_size");
        assert!(matches!(
            fx.manager.remove(fx.pool, "img", true, &NoOpProgress).await,
            Err(Error::NotEmpty(_))
        ));
        assert_eq!(fx.cluster.op_count("remove"), removes);
        assert_eq!(fx.cluster.op_count("set_size"), resizes);
        assert!(fx.cluster.object_exists(fx.pool, &header_name(&id)));
        assert_eq!(fx.manager.list(fx.pool).await.unwrap(), vec!["img"]);
    }

    #[tokio::test]
    async fn test_watchers_and_groups_block_removal() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let other = fx.peer().open(fx.pool, "img", None).await.unwrap();
        assert!(matches!(
            fx.manager.remove(fx.pool, "img", false, &NoOpProgress).await,
            Err(Error::Busy(_))
        ));
        other.close().await.unwrap();

        let id = fx.store().get_id(fx.pool, "img").await.unwrap();
        fx.cluster.set_image_group(
            fx.pool,
            &id,
            Some(GroupSpec {
                pool_id: fx.pool,
                group_id: "g1".to_string(),
            }),
        );
        assert!(matches!(
            fx.manager.remove(fx.pool, "img", false, &NoOpProgress).await,
            Err(Error::InUse(_))
        ));
        fx.cluster.set_image_group(fx.pool, &id, None);
        fx.manager
            .remove(fx.pool, "img", false, &NoOpProgress)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dead_lock_owner_is_fenced() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let owner = fx.peer().open(fx.pool, "img", None).await.unwrap();
        owner.lock_acquire(LockMode::Exclusive).await.unwrap();
        fx.cluster.expire_watches(&fx.peer_address());

        fx.manager
            .remove(fx.pool, "img", false, &NoOpProgress)
            .await
            .unwrap();
        assert!(fx.cluster.is_blacklisted(&fx.peer_address()));
    }

    #[tokio::test]
    async fn test_live_lock_owner_blocks_removal() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let image = fx.manager.open(fx.pool, "img", None).await.unwrap();
        image.lock_acquire(LockMode::Exclusive).await.unwrap();

        assert!(matches!(
            fx.peer().remove(fx.pool, "img", false, &NoOpProgress).await,
            Err(Error::Busy(_))
        ));
        assert!(image.is_exclusive_lock_owner().await.unwrap());
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_clone_updates_child_index() {
        let fx = Fixture::new();
        fx.create("p", 1 << 20).await;
        let parent = fx.manager.open(fx.pool, "p", None).await.unwrap();
        parent.snap_create("s").await.unwrap();
        parent.snap_protect("s").await.unwrap();
        let mut opts = ImageOptions::new();
        fx.manager
            .clone_image(fx.pool, "p", Some("s"), fx.pool, "c", &mut opts)
            .await
            .unwrap();
        assert!(matches!(parent.snap_unprotect("s").await, Err(Error::Busy(_))));

        fx.manager
            .remove(fx.pool, "c", false, &NoOpProgress)
            .await
            .unwrap();
        parent.snap_unprotect("s").await.unwrap();
        parent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_mirrored_image() {
        let fx = Fixture::new();
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Pool)
            .await
            .unwrap();
        fx.create("a", 1 << 20).await;
        fx.create("b", 1 << 20).await;
        let a = fx.store().get_id(fx.pool, "a").await.unwrap();
        let b = fx.store().get_id(fx.pool, "b").await.unwrap();

        fx.manager
            .remove(fx.pool, "a", false, &NoOpProgress)
            .await
            .unwrap();
        assert!(fx.store().mirror_image_get(fx.pool, &a).await.unwrap_err().is_not_found());

        // A non-primary image needs force.
        fx.journal.set_tag_owner(fx.pool, &b, "remote-uuid");
        assert!(matches!(
            fx.manager.remove(fx.pool, "b", false, &NoOpProgress).await,
            Err(Error::InvalidArgument(_))
        ));
        fx.manager
            .remove(fx.pool, "b", true, &NoOpProgress)
            .await
            .unwrap();
        assert!(fx.store().mirror_image_get(fx.pool, &b).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_after_partial_teardown() {
        let fx = Fixture::new();
        fx.create("img", 1 << 20).await;
        let id = fx.store().get_id(fx.pool, "img").await.unwrap();
        // Crash after the header was deleted.
        fx.store().remove(fx.pool, &header_name(&id)).await.unwrap();

        fx.manager
            .remove(fx.pool, "img", false, &NoOpProgress)
            .await
            .unwrap();
        assert!(!fx.journal.exists(fx.pool, &id));
        assert!(!fx.cluster.object_exists(fx.pool, &id_obj_name("img")));
        assert!(fx.manager.list(fx.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_legacy_image() {
        let fx = Fixture::new();
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Format, 1).unwrap();
        fx.manager.create(fx.pool, "old", 1 << 20, &mut opts).await.unwrap();

        fx.manager
            .remove(fx.pool, "old", false, &NoOpProgress)
            .await
            .unwrap();
        assert!(!fx.cluster.object_exists(fx.pool, &old_header_name("old")));
        assert!(fx.manager.list(fx.pool).await.unwrap().is_empty());
        fx.manager
            .remove(fx.pool, "old", false, &NoOpProgress)
            .await
            .unwrap();
    }
}
