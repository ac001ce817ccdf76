//! Core type definitions for blockimg
//!
//! This module defines the identifiers and metadata records shared by the
//! image control plane: pools, images, snapshots, clone linkage, lock state
//! and mirroring state.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Identifier of a pool in the cluster
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct PoolId(i64);

impl PoolId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

/// Immutable identifier of an image, assigned at creation
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ImageId(String);

impl ImageId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ImageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a snapshot within an image
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct SnapshotId(u64);

impl SnapshotId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A pool reference resolved to both id and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolRef {
    pub id: PoolId,
    pub name: String,
}

/// Full identity of an image
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageIdentity {
    pub pool_id: PoolId,
    pub image_id: ImageId,
    pub name: String,
}

/// The exact ancestor snapshot a clone derives from
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParentSpec {
    pub pool_id: PoolId,
    pub image_id: ImageId,
    pub snap_id: SnapshotId,
}

impl ParentSpec {
    #[must_use]
    pub fn new(pool_id: PoolId, image_id: ImageId, snap_id: SnapshotId) -> Self {
        Self {
            pool_id,
            image_id,
            snap_id,
        }
    }
}

impl fmt::Display for ParentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.pool_id, self.image_id, self.snap_id)
    }
}

/// Parent linkage plus the number of bytes still inherited from it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    pub spec: ParentSpec,
    pub overlap: u64,
}

/// Parent described by names, as reported to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentNames {
    pub pool_name: String,
    pub image_name: String,
    pub snap_name: String,
}

/// Protection status of a snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ProtectionStatus {
    #[default]
    #[display("unprotected")]
    Unprotected,
    #[display("protected")]
    Protected,
    #[display("unprotecting")]
    Unprotecting,
}

/// Consistency group membership
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupSpec {
    pub pool_id: PoolId,
    pub group_id: String,
}

/// Namespace a snapshot was created in
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotNamespace {
    #[default]
    User,
    Group(GroupSpec),
}

impl SnapshotNamespace {
    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(self, Self::User)
    }
}

/// A snapshot of an image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: SnapshotId,
    pub name: String,
    pub namespace: SnapshotNamespace,
    pub protection: ProtectionStatus,
    /// Image size when the snapshot was taken
    pub size: u64,
    /// Parent linkage frozen with the snapshot
    pub parent: Option<ParentInfo>,
}

impl SnapshotRecord {
    /// UNPROTECTING still counts as protected
    #[must_use]
    pub const fn is_protected(&self) -> bool {
        !matches!(self.protection, ProtectionStatus::Unprotected)
    }
}

/// Summary returned by snapshot listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub name: String,
    pub size: u64,
}

/// Image feature bit set
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Features(u64);

impl Features {
    pub const LAYERING: Self = Self(1 << 0);
    pub const STRIPINGV2: Self = Self(1 << 1);
    pub const EXCLUSIVE_LOCK: Self = Self(1 << 2);
    pub const OBJECT_MAP: Self = Self(1 << 3);
    pub const FAST_DIFF: Self = Self(1 << 4);
    pub const DEEP_FLATTEN: Self = Self(1 << 5);
    pub const JOURNALING: Self = Self(1 << 6);
    pub const DATA_POOL: Self = Self(1 << 7);

    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0xff);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::LAYERING, "layering"),
        (Self::STRIPINGV2, "striping"),
        (Self::EXCLUSIVE_LOCK, "exclusive-lock"),
        (Self::OBJECT_MAP, "object-map"),
        (Self::FAST_DIFF, "fast-diff"),
        (Self::DEEP_FLATTEN, "deep-flatten"),
        (Self::JOURNALING, "journaling"),
        (Self::DATA_POOL, "data-pool"),
    ];

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_subset_of(&self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Parse a feature by its display name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(f, _)| *f)
    }
}

impl BitOr for Features {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Features({self})")
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Lock mode for advisory locks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum LockMode {
    #[display("exclusive")]
    Exclusive,
    #[display("shared")]
    Shared,
}

/// One holder of an advisory lock
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locker {
    /// Client entity name, e.g. `client.4123`
    pub entity: String,
    pub cookie: String,
    /// Network address used for blacklisting
    pub address: String,
}

/// Lock state of an object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lockers: Vec<Locker>,
    pub mode: LockMode,
    pub tag: String,
}

/// Identity of this client as seen by the backing store
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub entity: String,
    pub address: String,
    pub instance_id: u64,
}

impl ClientIdentity {
    #[must_use]
    pub fn new(instance_id: u64, address: impl Into<String>) -> Self {
        Self {
            entity: format!("client.{instance_id}"),
            address: address.into(),
            instance_id,
        }
    }
}

/// Exclusive lock coordinator state as seen from this client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum LockStatus {
    #[display("unlocked")]
    Unlocked,
    #[display("locked by self")]
    LockedBySelf,
    #[display("locked by peer")]
    LockedByPeer,
    #[display("fenced")]
    Fenced,
}

/// Pool mirroring mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MirrorMode {
    #[default]
    #[display("disabled")]
    Disabled,
    #[display("image")]
    Image,
    #[display("pool")]
    Pool,
}

/// Per-image mirroring state; DISABLED is stored as absence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MirrorImageState {
    #[display("disabling")]
    Disabling,
    #[display("enabled")]
    Enabled,
    #[default]
    #[display("disabled")]
    Disabled,
}

/// Mirroring registry entry for an image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImage {
    pub global_image_id: String,
    pub state: MirrorImageState,
}

/// Role derived from journal tag ownership
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MirrorRole {
    #[display("primary")]
    Primary,
    #[display("non-primary")]
    NonPrimary,
    #[display("orphan")]
    Orphan,
}

/// Mirroring information reported for an image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImageInfo {
    pub global_id: String,
    pub state: MirrorImageState,
    pub primary: bool,
}

/// Replication status as reported by the remote replayer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
pub enum MirrorImageStatusState {
    #[default]
    #[display("unknown")]
    Unknown,
    #[display("error")]
    Error,
    #[display("syncing")]
    Syncing,
    #[display("starting_replay")]
    StartingReplay,
    #[display("replaying")]
    Replaying,
    #[display("stopping_replay")]
    StoppingReplay,
    #[display("stopped")]
    Stopped,
}

/// Status record stored by the replayer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStatusRecord {
    pub state: MirrorImageStatusState,
    pub description: String,
    /// Unix seconds of the last update
    pub last_update: i64,
    pub up: bool,
}

/// Status of a mirrored image, with its name and mirroring info
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImageStatus {
    pub name: String,
    pub info: MirrorImageInfo,
    pub state: MirrorImageStatusState,
    pub description: String,
    pub last_update: i64,
    pub up: bool,
}

/// A registered remote peer cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorPeer {
    pub uuid: String,
    pub cluster_name: String,
    pub client_name: String,
}

/// Basic image information
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub size: u64,
    /// Object size in bytes
    pub obj_size: u64,
    pub num_objs: u64,
    pub order: u8,
    pub block_name_prefix: String,
}
