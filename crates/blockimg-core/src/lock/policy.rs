//! Exclusive lock policies

/// How a handle takes and gives up the exclusive lock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockPolicy {
    /// Take the lock on first modification, hand it over on request
    #[default]
    Automatic,
    /// Held through explicit calls; only a forced request takes it away
    Standard,
}

impl LockPolicy {
    /// Whether a modification may acquire the lock implicitly
    #[must_use]
    pub const fn may_auto_request_lock(self) -> bool {
        matches!(self, Self::Automatic)
    }

    /// Whether an owner hands the lock to a peer that asked for it
    #[must_use]
    pub const fn lock_requested(self, force: bool) -> bool {
        match self {
            Self::Automatic => true,
            Self::Standard => force,
        }
    }
}
