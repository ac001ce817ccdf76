#![allow(clippy::module_name_repetitions)]
//! blockimg Core
//!
//! Control plane for block-device images stored in a distributed object
//! store. It manages image identity, copy-on-write clone chains, cooperative
//! exclusive ownership, safe deletion and primary/secondary mirroring roles.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ImageManager                 │
//! │  create / clone / remove / mirror pool ops   │
//! └──────┬──────────────┬────────────────┬───────┘
//!        │              │                │
//! ┌──────▼──────┐ ┌─────▼──────┐  ┌──────▼───────┐
//! │ ImageHandle │ │ Directory  │  │ Mirroring    │
//! │ + Exclusive │ │ + Pool     │  │ requests     │
//! │   Lock      │ │ validator  │  │              │
//! └──────┬──────┘ └─────┬──────┘  └──────┬───────┘
//!        │              │                │
//! ┌──────▼──────────────▼───┐   ┌────────▼───────┐
//! │     MetadataStore       │   │ JournalClient  │
//! └─────────────────────────┘   └────────────────┘
//! ```
//!
//! Every remote step is an `async` call. Multi-step protocols are not
//! transactional: failures are compensated through a [`RollbackStack`] and
//! teardown tolerates objects that are already gone.

pub mod clone;
pub mod completion;
pub mod create;
pub mod directory;
pub mod image;
pub mod info;
pub mod journal;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod mirror;
pub mod options;
pub mod pool;
pub mod progress;
pub mod remove;
pub mod rollback;
pub mod snapshot;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use blockimg_common::{Config, Error, Result};
pub use completion::Completion;
pub use create::MirrorProvision;
pub use image::ImageHandle;
pub use journal::{JournalClient, MemoryJournal};
pub use lock::{ExclusiveLock, LockPolicy};
pub use manager::ImageManager;
pub use options::{ImageOption, ImageOptions};
pub use progress::{NoOpProgress, Progress};
pub use rollback::RollbackStack;
pub use snapshot::SnapRemoveFlags;
pub use store::{ImageHeader, MemoryCluster, MemoryStore, MetadataStore, Notification};

/// Directory object holding both the legacy and current name index
pub const DIRECTORY_OID: &str = "img_directory";

/// Child index object, one per pool
pub const CHILDREN_OID: &str = "img_children";

/// Mirroring registry object, one per pool
pub const MIRRORING_OID: &str = "img_mirroring";

/// Name of the managed exclusive lock on the header object
pub const LOCK_NAME: &str = "img_lock";

/// Tag identifying the managed exclusive lock
pub const LOCK_TAG_INTERNAL: &str = "internal";

/// Prefix of the cookie used by the managed exclusive lock
pub const LOCK_COOKIE_PREFIX: &str = "auto";

/// Smallest supported object size (4 KiB)
pub const MIN_ORDER: u8 = 12;

/// Largest supported object size (32 MiB)
pub const MAX_ORDER: u8 = 25;

const ID_PREFIX: &str = "img_id.";
const HEADER_PREFIX: &str = "img_header.";
const OBJECT_MAP_PREFIX: &str = "img_object_map.";
const DATA_PREFIX: &str = "img_data.";
const LEGACY_HEADER_SUFFIX: &str = ".img";

/// Object holding the id of a current-format image
#[must_use]
pub fn id_obj_name(name: &str) -> String {
    format!("{ID_PREFIX}{name}")
}

/// Header object of a current-format image
#[must_use]
pub fn header_name(id: &blockimg_common::ImageId) -> String {
    format!("{HEADER_PREFIX}{id}")
}

/// Header object of a legacy image
#[must_use]
pub fn old_header_name(name: &str) -> String {
    format!("{name}{LEGACY_HEADER_SUFFIX}")
}

/// Object map of a current-format image
#[must_use]
pub fn object_map_name(id: &blockimg_common::ImageId) -> String {
    format!("{OBJECT_MAP_PREFIX}{id}")
}

/// Data object prefix of a current-format image
#[must_use]
pub fn data_object_prefix(id: &blockimg_common::ImageId) -> String {
    format!("{DATA_PREFIX}{id}")
}

/// Name of the `index`th data object under `prefix`
#[must_use]
pub fn data_object_name(prefix: &str, index: u64) -> String {
    format!("{prefix}.{index:016x}")
}

/// Image id encoded in a header object name
#[must_use]
pub fn header_id(oid: &str) -> Option<&str> {
    oid.strip_prefix(HEADER_PREFIX)
}
