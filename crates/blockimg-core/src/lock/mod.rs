//! Exclusive lock coordination
//!
//! - [`ExclusiveLock`]: the managed lock state machine of one open image
//! - [`LockPolicy`]: how a handle reacts to peer requests
//! - handle operations: `lock_acquire`, `lock_release`, `lock_get_owners`,
//!   `lock_break`, `is_exclusive_lock_owner`, `lock_status`
//! - advisory cookie locks: `list_lockers`, `lock`, `unlock`, `break_lock`

mod advisory;
mod api;
mod exclusive;
mod policy;

pub use exclusive::{ExclusiveLock, break_locker, get_locker, lock_cookie};
pub use policy::LockPolicy;
