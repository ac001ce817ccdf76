//! Mirroring role state machine
//!
//! Per-image mirroring state lives in the pool's mirroring registry: an
//! entry is ENABLED or DISABLING, and no entry means DISABLED. Whether this
//! cluster is primary for an image is decided by journal tag ownership.
//!
//! The registry protocols are shared with image creation and cloning;
//! image-level transitions work on an open handle, pool-level operations
//! on the manager.

mod image;
mod pool;
mod request;

pub(crate) use request::{DisableRequest, EnableRequest};
