//! Tagged status enumerations: per-server status, exclusion states, and the
//! team priority ladder. Transitions are explicit; nothing here is inferred
//! from ad-hoc boolean soup at use sites.

use std::fmt;

use crate::model::Locality;

use serde::{Deserialize, Serialize};

/// Exclusion state of a network address (or ip wildcard). Order matters:
/// a higher state always wins when both would apply to the same address.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub enum ExclusionStatus {
    #[default]
    None,
    /// Being rotated out by the perpetual storage wiggle.
    Wiggling,
    /// Operator-excluded; drain and do not recruit.
    Excluded,
    /// Declared permanently failed; drain at top priority.
    Failed,
}

impl fmt::Display for ExclusionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ExclusionStatus::None => "none",
            ExclusionStatus::Wiggling => "wiggling",
            ExclusionStatus::Excluded => "excluded",
            ExclusionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Per-server status record kept by the status map.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub is_failed: bool,
    pub is_undesired: bool,
    pub is_wrong_configuration: bool,
    pub is_wiggling: bool,

    /// Observed locality at the time the status was derived.
    pub locality: Locality,
}

impl ServerStatus {
    pub fn new(is_failed: bool, is_undesired: bool, is_wiggling: bool, locality: Locality) -> Self {
        ServerStatus {
            is_failed,
            is_undesired,
            is_wrong_configuration: false,
            is_wiggling,
            locality,
        }
    }

    /// An unhealthy server cannot count toward healthy teams or machines.
    pub fn is_unhealthy(&self) -> bool {
        self.is_failed || self.is_undesired
    }

    /// Whether recruitment must avoid this server's address.
    pub fn exclude_on_recruit(&self) -> bool {
        self.is_failed || self.is_undesired || self.is_wrong_configuration
    }

    pub fn describe(&self) -> &'static str {
        if self.is_failed {
            "failed"
        } else if self.is_undesired {
            "undesired"
        } else if self.is_wiggling {
            "wiggling"
        } else {
            "healthy"
        }
    }
}

/// Relocation priority ladder for teams. The numeric levels are what go out
/// on `RelocateShard` events; larger means more urgent.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum TeamPriority {
    Healthy,
    ContainsUndesired,
    Redundant,
    Wiggle,
    PopulateRegion,
    Unhealthy,
    TwoLeft,
    OneLeft,
    Failed,
    ZeroLeft,
}

impl TeamPriority {
    /// Numeric urgency level carried on relocation requests.
    pub fn level(&self) -> i32 {
        match self {
            TeamPriority::Healthy => 140,
            TeamPriority::ContainsUndesired => 150,
            TeamPriority::Redundant => 200,
            TeamPriority::Wiggle => 590,
            TeamPriority::PopulateRegion => 600,
            TeamPriority::Unhealthy => 700,
            TeamPriority::TwoLeft => 709,
            TeamPriority::OneLeft => 800,
            TeamPriority::Failed => 805,
            TeamPriority::ZeroLeft => 809,
        }
    }
}

impl PartialOrd for TeamPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TeamPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.level().cmp(&other.level())
    }
}

impl fmt::Display for TeamPriority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TeamPriority::Healthy => "healthy",
            TeamPriority::ContainsUndesired => "contains_undesired",
            TeamPriority::Redundant => "redundant",
            TeamPriority::Wiggle => "storage_wiggle",
            TeamPriority::PopulateRegion => "populate_region",
            TeamPriority::Unhealthy => "unhealthy",
            TeamPriority::TwoLeft => "two_left",
            TeamPriority::OneLeft => "one_left",
            TeamPriority::Failed => "failed",
            TeamPriority::ZeroLeft => "zero_left",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod status_tests {
    use super::*;

    #[test]
    fn exclusion_ordering() {
        assert!(ExclusionStatus::Failed > ExclusionStatus::Excluded);
        assert!(ExclusionStatus::Excluded > ExclusionStatus::Wiggling);
        assert!(ExclusionStatus::Wiggling > ExclusionStatus::None);
    }

    #[test]
    fn priority_ladder_ordering() {
        assert!(TeamPriority::ZeroLeft > TeamPriority::Failed);
        assert!(TeamPriority::Failed > TeamPriority::OneLeft);
        assert!(TeamPriority::OneLeft > TeamPriority::TwoLeft);
        assert!(TeamPriority::TwoLeft > TeamPriority::Unhealthy);
        assert!(TeamPriority::Unhealthy > TeamPriority::PopulateRegion);
        assert!(TeamPriority::PopulateRegion > TeamPriority::Wiggle);
        assert!(TeamPriority::Wiggle > TeamPriority::Redundant);
        assert!(TeamPriority::Redundant > TeamPriority::ContainsUndesired);
        assert!(TeamPriority::ContainsUndesired > TeamPriority::Healthy);
    }

    #[test]
    fn unhealthy_bits() {
        let mut st = ServerStatus::new(false, false, false, Locality::new());
        assert!(!st.is_unhealthy());
        st.is_undesired = true;
        assert!(st.is_unhealthy());
        assert!(st.exclude_on_recruit());
        st.is_undesired = false;
        st.is_wrong_configuration = true;
        assert!(!st.is_unhealthy());
        assert!(st.exclude_on_recruit());
    }
}
