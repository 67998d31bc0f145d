//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// Measured in kernel ticks; the platform decides what a tick is (the
/// hosted platform uses milliseconds).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns this timestamp advanced by `ticks`.
    pub fn offset(self, ticks: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(ticks))
    }

    /// Ticks remaining until `deadline`, or zero if it has passed.
    pub fn until(self, deadline: Timestamp) -> u64 {
        deadline.0.saturating_sub(self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}
