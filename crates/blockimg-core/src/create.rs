//! Image creation
//!
//! Format 1 registers the name in the legacy map and writes a single header
//! object. Format 2 runs as a spawned request: id object, directory entry,
//! header, object map, journal and finally mirroring, each step pushing its
//! compensation onto a [`RollbackStack`].

use crate::completion::Completion;
use crate::directory::ensure_absent;
use crate::image::LegacyHeader;
use crate::journal::LOCAL_MIRROR_UUID;
use crate::manager::ImageManager;
use crate::mirror::EnableRequest;
use crate::options::{ImageOption, ImageOptions};
use crate::pool::validate_pool;
use crate::rollback::RollbackStack;
use crate::store::ImageHeader;
use crate::{
    MAX_ORDER, MIN_ORDER, data_object_prefix, header_name, id_obj_name, object_map_name,
    old_header_name,
};

use blockimg_common::{Error, Features, ImageId, MirrorMode, PoolId, Result};
use bytes::Bytes;
use tracing::{debug, error, info, warn};

const DEFAULT_JOURNAL_ORDER: u64 = 24;
const DEFAULT_JOURNAL_SPLAY_WIDTH: u64 = 4;

/// Largest image an object map can track, in objects
pub const MAX_OBJECT_MAP_OBJECTS: u64 = 256_000_000;

/// Identity of a non-primary image created for a mirroring peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorProvision {
    /// Global id shared by every copy of the image
    pub global_image_id: String,
    /// Mirror uuid of the cluster the primary lives on
    pub primary_mirror_uuid: String,
}

impl ImageManager {
    /// Create `name` with `size` bytes. The resolved order is written back
    /// into `opts`.
    pub async fn create(
        &self,
        pool: PoolId,
        name: &str,
        size: u64,
        opts: &mut ImageOptions,
    ) -> Result<()> {
        self.create_image(pool, name, size, opts, false, None).await
    }

    /// Create with control over mirroring: `skip_mirror_enable` leaves
    /// mirroring to the caller, `provision` creates a non-primary image
    pub async fn create_image(
        &self,
        pool: PoolId,
        name: &str,
        size: u64,
        opts: &mut ImageOptions,
        skip_mirror_enable: bool,
        provision: Option<&MirrorProvision>,
    ) -> Result<()> {
        debug!(pool = %pool, image = name, size, opts = %opts, "Creating image");
        let config = &self.config().image;

        let format = opts
            .get_u64(ImageOption::Format)
            .unwrap_or_else(|| u64::from(config.default_format));
        let legacy = match format {
            1 => true,
            2 => false,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown image format {other}"
                )));
            }
        };

        ensure_absent(&self.directory(), pool, name).await?;

        let order = match opts.get_u64(ImageOption::Order) {
            None | Some(0) => u64::from(config.default_order),
            Some(order) => order,
        };
        if order < u64::from(MIN_ORDER) || order > u64::from(MAX_ORDER) {
            return Err(Error::invalid_argument(format!(
                "order {order} outside {MIN_ORDER}..={MAX_ORDER}"
            )));
        }
        let order = u8::try_from(order)
            .map_err(|_| Error::invalid_argument(format!("invalid order {order}")))?;

        if legacy {
            self.create_v1(pool, name, size, order).await?;
        } else {
            let request = CreateRequest::prepare(
                self.clone(),
                pool,
                name,
                size,
                order,
                opts,
                skip_mirror_enable,
                provision.cloned(),
            )
            .await?;
            Completion::spawn(request.send()).wait().await?;
        }

        opts.set_u64(ImageOption::Order, u64::from(order))?;
        info!(pool = %pool, image = name, format, "Created image");
        Ok(())
    }

    async fn create_v1(&self, pool: PoolId, name: &str, size: u64, order: u8) -> Result<()> {
        let store = self.store();
        validate_pool(store.as_ref(), &self.config().image, pool).await?;

        if let Err(e) = store.tmap_set(pool, name).await {
            error!("Failed to register {} in legacy directory: {}", name, e);
            return Err(e);
        }

        let instance = store.client().instance_id;
        let header = LegacyHeader {
            block_name: format!(
                "rb.{:x}.{:x}.{:08x}",
                instance >> 32,
                instance & 0xffff_ffff,
                rand::random::<u32>()
            ),
            order,
            size,
        };
        if let Err(e) = store
            .write_full(pool, &old_header_name(name), header.encode())
            .await
        {
            error!("Failed to write header of {}: {}", name, e);
            if let Err(rm) = store.tmap_rm(pool, name).await {
                warn!("Failed to unregister {} from legacy directory: {}", name, rm);
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Format-2 creation with every parameter resolved
struct CreateRequest {
    manager: ImageManager,
    pool: PoolId,
    name: String,
    id: ImageId,
    size: u64,
    order: u8,
    features: Features,
    stripe_unit: u64,
    stripe_count: u64,
    data_pool: Option<PoolId>,
    journal_order: u8,
    journal_splay_width: u8,
    skip_mirror_enable: bool,
    provision: Option<MirrorProvision>,
}

impl CreateRequest {
    #[allow(clippy::too_many_arguments)]
    async fn prepare(
        manager: ImageManager,
        pool: PoolId,
        name: &str,
        size: u64,
        order: u8,
        opts: &ImageOptions,
        skip_mirror_enable: bool,
        provision: Option<MirrorProvision>,
    ) -> Result<Self> {
        let mut features = match opts.get_u64(ImageOption::Features) {
            Some(bits) => Features::from_bits(bits),
            None => manager.config().image.features()?,
        };
        if let Some(bits) = opts.get_u64(ImageOption::FeaturesSet) {
            features.insert(Features::from_bits(bits));
        }
        if let Some(bits) = opts.get_u64(ImageOption::FeaturesClear) {
            features.remove(Features::from_bits(bits));
        }
        if !features.is_subset_of(Features::ALL) {
            return Err(Error::unsupported(format!(
                "features {:#x} not supported",
                features.bits() & !Features::ALL.bits()
            )));
        }

        let object_size = 1u64 << order;
        if features.contains(Features::OBJECT_MAP) {
            let objects = size.div_ceil(object_size);
            if objects > MAX_OBJECT_MAP_OBJECTS {
                return Err(Error::invalid_argument(format!(
                    "{objects} objects exceed the object map limit of {MAX_OBJECT_MAP_OBJECTS}"
                )));
            }
        }

        let (stripe_unit, stripe_count) = match (
            opts.get_u64(ImageOption::StripeUnit).unwrap_or(0),
            opts.get_u64(ImageOption::StripeCount).unwrap_or(0),
        ) {
            (0, 0) => (object_size, 1),
            (0, _) | (_, 0) => {
                return Err(Error::invalid_argument(
                    "stripe unit and stripe count must be set together",
                ));
            }
            (unit, count) => (unit, count),
        };
        if stripe_unit != object_size || stripe_count != 1 {
            if stripe_unit > object_size || object_size % stripe_unit != 0 {
                return Err(Error::invalid_argument(format!(
                    "stripe unit {stripe_unit} does not divide object size {object_size}"
                )));
            }
            features.insert(Features::STRIPINGV2);
        }

        let data_pool = match opts.get_str(ImageOption::DataPool) {
            Some(data_pool) => {
                let id = manager.store().pool_lookup(data_pool).await?;
                (id != pool).then_some(id)
            }
            None => None,
        };
        if data_pool.is_some() {
            features.insert(Features::DATA_POOL);
        } else {
            features.remove(Features::DATA_POOL);
        }

        validate_feature_dependencies(features)?;

        let journal_order = opts
            .get_u64(ImageOption::JournalOrder)
            .unwrap_or(DEFAULT_JOURNAL_ORDER);
        let journal_splay_width = opts
            .get_u64(ImageOption::JournalSplayWidth)
            .unwrap_or(DEFAULT_JOURNAL_SPLAY_WIDTH);

        let id = ImageId::new(format!(
            "{:x}{:08x}",
            manager.store().client().instance_id,
            rand::random::<u32>()
        ));

        Ok(Self {
            pool,
            name: name.to_string(),
            id,
            size,
            order,
            features,
            stripe_unit,
            stripe_count,
            data_pool,
            journal_order: u8::try_from(journal_order).map_err(|_| {
                Error::invalid_argument(format!("invalid journal order {journal_order}"))
            })?,
            journal_splay_width: u8::try_from(journal_splay_width).map_err(|_| {
                Error::invalid_argument(format!(
                    "invalid journal splay width {journal_splay_width}"
                ))
            })?,
            skip_mirror_enable,
            provision,
            manager,
        })
    }

    async fn send(self) -> Result<()> {
        let store = self.manager.store();
        validate_pool(store.as_ref(), &self.manager.config().image, self.pool).await?;

        let mut rollback = RollbackStack::new();
        match self.run(&mut rollback).await {
            Ok(()) => {
                rollback.commit();
                debug!(image = %self.name, id = %self.id, features = %self.features, "Image created");
                Ok(())
            }
            Err(e) => {
                error!("Failed to create image {}: {}", self.name, e);
                rollback.unwind().await;
                Err(e)
            }
        }
    }

    async fn run(&self, rollback: &mut RollbackStack) -> Result<()> {
        let store = self.manager.store().clone();
        let journal = self.manager.journal().clone();
        let pool = self.pool;

        store.set_id(pool, &self.name, &self.id).await?;
        {
            let store = store.clone();
            let oid = id_obj_name(&self.name);
            rollback.push("remove id object", move || async move {
                store.remove(pool, &oid).await
            });
        }

        store.dir_add_image(pool, &self.name, &self.id).await?;
        {
            let store = store.clone();
            let name = self.name.clone();
            let id = self.id.clone();
            rollback.push("remove directory entry", move || async move {
                store.dir_remove_image(pool, &name, &id).await
            });
        }

        let mut header = ImageHeader::new(
            self.size,
            self.order,
            self.features,
            data_object_prefix(&self.id),
        );
        header.stripe_unit = self.stripe_unit;
        header.stripe_count = self.stripe_count;
        header.data_pool = self.data_pool;
        store.create_header(pool, &self.id, header).await?;
        {
            let store = store.clone();
            let oid = header_name(&self.id);
            rollback.push("remove header", move || async move {
                store.remove(pool, &oid).await
            });
        }

        if self.features.contains(Features::OBJECT_MAP) {
            let objects = self.size.div_ceil(1u64 << self.order);
            let len = usize::try_from(objects.div_ceil(4))
                .map_err(|_| Error::invalid_argument("image too large for object map"))?;
            let oid = object_map_name(&self.id);
            store.write_full(pool, &oid, Bytes::from(vec![0u8; len])).await?;
            let store = store.clone();
            rollback.push("remove object map", move || async move {
                store.remove(pool, &oid).await
            });
        }

        if self.features.contains(Features::JOURNALING) {
            let tag_owner = self
                .provision
                .as_ref()
                .map_or(LOCAL_MIRROR_UUID, |p| p.primary_mirror_uuid.as_str());
            journal
                .create(
                    pool,
                    &self.id,
                    self.journal_order,
                    self.journal_splay_width,
                    tag_owner,
                )
                .await?;
            let journal_rb = journal.clone();
            let id = self.id.clone();
            rollback.push("remove journal", move || async move {
                journal_rb.remove(pool, &id).await
            });

            if !self.skip_mirror_enable {
                let mode = match store.mirror_mode_get(pool).await {
                    Ok(mode) => mode,
                    Err(e) if e.is_unsupported() => MirrorMode::Disabled,
                    Err(e) => return Err(e),
                };
                if mode == MirrorMode::Pool || self.provision.is_some() {
                    EnableRequest {
                        store: store.as_ref(),
                        journal: journal.as_ref(),
                        pool,
                        image_id: &self.id,
                        non_primary_global_id: self
                            .provision
                            .as_ref()
                            .map(|p| p.global_image_id.as_str()),
                    }
                    .send()
                    .await?;
                }
            }
        }
        Ok(())
    }
}

/// `InvalidArgument` when a feature is enabled without the one it builds on
pub fn validate_feature_dependencies(features: Features) -> Result<()> {
    let needs = [
        (Features::OBJECT_MAP, Features::EXCLUSIVE_LOCK),
        (Features::JOURNALING, Features::EXCLUSIVE_LOCK),
        (Features::FAST_DIFF, Features::OBJECT_MAP),
    ];
    for (feature, required) in needs {
        if features.contains(feature) && !features.contains(required) {
            return Err(Error::invalid_argument(format!(
                "feature {feature} requires {required}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalClient;
    use crate::testing::Fixture;
    use blockimg_common::MirrorImageState;

    #[tokio::test]
    async fn test_create_format2() {
        let fx = Fixture::new();
        let mut opts = ImageOptions::new();
        fx.manager
            .create(fx.pool, "img", 10 << 20, &mut opts)
            .await
            .unwrap();
        assert_eq!(opts.get_u64(ImageOption::Order), Some(22));

        let id = fx.store().get_id(fx.pool, "img").await.unwrap();
        assert_eq!(fx.store().dir_get_name(fx.pool, &id).await.unwrap(), "img");
        let header = fx.store().get_header(fx.pool, &id).await.unwrap();
        assert_eq!(header.size, 10 << 20);
        assert!(header.features.contains(Features::JOURNALING));
        assert!(fx.cluster.object_exists(fx.pool, &object_map_name(&id)));
        assert!(fx.journal.exists(fx.pool, &id));

        assert!(matches!(
            fx.manager.create(fx.pool, "img", 1 << 20, &mut opts).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_order_bounds() {
        let fx = Fixture::new();
        for order in [11, 26] {
            let mut opts = ImageOptions::new();
            opts.set_u64(ImageOption::Order, order).unwrap();
            assert!(matches!(
                fx.manager.create(fx.pool, "img", 1 << 20, &mut opts).await,
                Err(Error::InvalidArgument(_))
            ));
        }
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Order, 12).unwrap();
        fx.manager
            .create(fx.pool, "img", 1 << 20, &mut opts)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_object_map_size_limit() {
        let fx = Fixture::new();
        let mut opts = ImageOptions::new();
        opts.set_u64(
            ImageOption::Features,
            (Features::LAYERING | Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP).bits(),
        )
        .unwrap();
        opts.set_u64(ImageOption::Order, 12).unwrap();

        assert!(matches!(
            fx.manager.create(fx.pool, "big", 1 << 62, &mut opts).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(fx.cluster.op_count("set_id"), 0);
        assert_eq!(fx.cluster.op_count("write_full"), 0);
        assert!(fx.manager.list(fx.pool).await.unwrap().is_empty());

        // Without an object map the size is not bounded by it.
        let mut opts = ImageOptions::new();
        opts.set_u64(
            ImageOption::Features,
            (Features::LAYERING | Features::EXCLUSIVE_LOCK).bits(),
        )
        .unwrap();
        opts.set_u64(ImageOption::Order, 12).unwrap();
        fx.manager
            .create(fx.pool, "big", 1 << 62, &mut opts)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_format1() {
        let fx = Fixture::new();
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Format, 1).unwrap();
        fx.manager
            .create(fx.pool, "old", 4 << 20, &mut opts)
            .await
            .unwrap();

        assert_eq!(fx.manager.list(fx.pool).await.unwrap(), vec!["old"]);
        let image = fx.manager.open(fx.pool, "old", None).await.unwrap();
        assert!(image.get_old_format());
        assert_eq!(image.get_size().await.unwrap(), 4 << 20);
        assert!(image.info().await.unwrap().block_name_prefix.starts_with("rb."));
        image.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_format1_header_failure_unregisters_name() {
        let fx = Fixture::new();
        fx.cluster
            .fail_next("write_full", Error::Transport("timeout".into()));
        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Format, 1).unwrap();

        assert!(matches!(
            fx.manager.create(fx.pool, "old", 1 << 20, &mut opts).await,
            Err(Error::Transport(_))
        ));
        assert!(fx.store().tmap_list(fx.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feature_validation() {
        let fx = Fixture::new();

        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Features, 1 << 20).unwrap();
        assert!(fx
            .manager
            .create(fx.pool, "a", 1 << 20, &mut opts)
            .await
            .unwrap_err()
            .is_unsupported());

        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Features, Features::OBJECT_MAP.bits())
            .unwrap();
        assert!(matches!(
            fx.manager.create(fx.pool, "a", 1 << 20, &mut opts).await,
            Err(Error::InvalidArgument(_))
        ));

        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::StripeUnit, 1 << 16).unwrap();
        assert!(matches!(
            fx.manager.create(fx.pool, "a", 1 << 20, &mut opts).await,
            Err(Error::InvalidArgument(_))
        ));

        let mut opts = ImageOptions::new();
        opts.set_u64(ImageOption::Features, Features::LAYERING.bits())
            .unwrap();
        opts.set_u64(ImageOption::StripeUnit, 1 << 16).unwrap();
        opts.set_u64(ImageOption::StripeCount, 4).unwrap();
        fx.manager
            .create(fx.pool, "a", 1 << 20, &mut opts)
            .await
            .unwrap();
        let id = fx.store().get_id(fx.pool, "a").await.unwrap();
        let header = fx.store().get_header(fx.pool, &id).await.unwrap();
        assert!(header.features.contains(Features::STRIPINGV2));
        assert_eq!(header.stripe_count, 4);
    }

    #[tokio::test]
    async fn test_failed_step_unwinds_earlier_steps() {
        let fx = Fixture::new();
        fx.journal
            .fail_next("create", Error::Transport("journal down".into()));

        let mut opts = ImageOptions::new();
        assert!(fx
            .manager
            .create(fx.pool, "img", 1 << 20, &mut opts)
            .await
            .is_err());

        assert!(!fx.cluster.object_exists(fx.pool, &id_obj_name("img")));
        assert!(fx.store().dir_get_id(fx.pool, "img").await.unwrap_err().is_not_found());
        assert!(fx.manager.list(fx.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_mode_enables_mirroring() {
        let fx = Fixture::new();
        fx.manager
            .mirror_mode_set(fx.pool, MirrorMode::Pool)
            .await
            .unwrap();
        fx.create("img", 1 << 20).await;

        let id = fx.store().get_id(fx.pool, "img").await.unwrap();
        let mirror = fx.store().mirror_image_get(fx.pool, &id).await.unwrap();
        assert_eq!(mirror.state, MirrorImageState::Enabled);
    }

    #[tokio::test]
    async fn test_provisioned_non_primary() {
        let fx = Fixture::new();
        let provision = MirrorProvision {
            global_image_id: "global-1".to_string(),
            primary_mirror_uuid: "remote-uuid".to_string(),
        };
        let mut opts = ImageOptions::new();
        fx.manager
            .create_image(fx.pool, "replica", 1 << 20, &mut opts, false, Some(&provision))
            .await
            .unwrap();

        let id = fx.store().get_id(fx.pool, "replica").await.unwrap();
        let mirror = fx.store().mirror_image_get(fx.pool, &id).await.unwrap();
        assert_eq!(mirror.global_image_id, "global-1");
        assert!(!fx.journal.is_tag_owner(fx.pool, &id).await.unwrap());
    }

    #[test]
    fn test_feature_dependencies() {
        validate_feature_dependencies(
            Features::EXCLUSIVE_LOCK | Features::OBJECT_MAP | Features::FAST_DIFF,
        )
        .unwrap();
        assert!(validate_feature_dependencies(Features::FAST_DIFF | Features::EXCLUSIVE_LOCK).is_err());
        assert!(validate_feature_dependencies(Features::JOURNALING).is_err());
    }
}
