//! Provider status classification and cache TTL policy.
//!
//! Every component that decides whether a cached status may be trusted goes
//! through [`classify`]. Final outcomes get the shortest trust window.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub const SUCCEEDED: &str = "succeeded";
pub const FAILED: &str = "failed";
pub const CANCELED: &str = "canceled";
pub const REQUIRES_CAPTURE: &str = "requires_capture";
pub const REQUIRES_PAYMENT_METHOD: &str = "requires_payment_method";
pub const REQUIRES_CONFIRMATION: &str = "requires_confirmation";
pub const REQUIRES_ACTION: &str = "requires_action";
pub const PROCESSING: &str = "processing";

pub const FINAL_STATUS_TTL: Duration = Duration::from_secs(5);
pub const INTERMEDIATE_STATUS_TTL: Duration = Duration::from_secs(10);
pub const UNKNOWN_STATUS_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// Expected to transition again without outside action.
    Intermediate,
    /// Terminal for the reconciliation loop.
    Final,
    /// Not part of the known vocabulary; never trusted from cache.
    Unknown,
}

impl StatusClass {
    pub fn is_final(self) -> bool {
        matches!(self, StatusClass::Final)
    }

    pub fn is_intermediate(self) -> bool {
        matches!(self, StatusClass::Intermediate)
    }

    /// Whether a cached copy of a status in this class may be served as-is.
    pub fn is_cache_trusted(self) -> bool {
        self.is_intermediate()
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusClass::Intermediate => "intermediate",
            StatusClass::Final => "final",
            StatusClass::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

pub fn classify(status: &str) -> StatusClass {
    match status {
        SUCCEEDED | FAILED | CANCELED | REQUIRES_CAPTURE => StatusClass::Final,
        REQUIRES_PAYMENT_METHOD | REQUIRES_CONFIRMATION | REQUIRES_ACTION | PROCESSING => {
            StatusClass::Intermediate
        }
        _ => StatusClass::Unknown,
    }
}

pub fn is_final(status: &str) -> bool {
    classify(status).is_final()
}

/// Cache lifetime for a provider status snapshot. Never zero.
pub fn ttl_for(status: &str) -> Duration {
    match classify(status) {
        StatusClass::Final => FINAL_STATUS_TTL,
        StatusClass::Intermediate => INTERMEDIATE_STATUS_TTL,
        StatusClass::Unknown => UNKNOWN_STATUS_TTL,
    }
}

/// Outcome of checking whether a stored status may be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    Unchanged,
    /// The stored status is final and the write would change it.
    Rejected,
}

/// Guard for status writes.
///
/// Anything that is not final can be overwritten (last write wins). Final
/// statuses are immutable except for the capture outcomes of
/// `requires_capture`.
pub fn transition(current: &str, next: &str) -> Transition {
    if current == next {
        return Transition::Unchanged;
    }

    match classify(current) {
        StatusClass::Final => {
            if current == REQUIRES_CAPTURE && matches!(next, SUCCEEDED | CANCELED) {
                Transition::Apply
            } else {
                Transition::Rejected
            }
        }
        StatusClass::Intermediate | StatusClass::Unknown => Transition::Apply,
    }
}
