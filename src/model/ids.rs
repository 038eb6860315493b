//! Stable identifier types for the placement object graph.
//!
//! Teams, servers, and machines form a cyclic graph; every edge is stored as
//! one of these ids rather than a reference, so back-pointers stay valid
//! across removals and tracker cancellation works by id.

use std::fmt;

use rand::Rng;

use serde::{Deserialize, Serialize};

/// Read version number from the system keyspace.
pub type Version = i64;

/// Opaque 128-bit storage server id, stored as two halves.
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
pub struct ServerId(pub u64, pub u64);

impl ServerId {
    /// Draws a fresh random id.
    pub fn random(rng: &mut impl Rng) -> Self {
        ServerId(rng.gen(), rng.gen())
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        format!("{:08x}", (self.0 >> 32) as u32)
    }
}

impl From<u64> for ServerId {
    fn from(n: u64) -> Self {
        ServerId(n, 0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.0, self.1)
    }
}

/// Machine identity: the zone/machine locality value shared by all storage
/// servers co-located on one physical host.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Serialize,
    Deserialize,
)]
pub struct MachineId(pub String);

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        MachineId(s.to_string())
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identity from locality; the perpetual wiggle walks processes in
/// the sorted order of these.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Serialize,
    Deserialize,
)]
pub struct ProcessId(pub String);

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        ProcessId(s.to_string())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server team id, assigned monotonically by the owning collection.
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
pub struct TeamId(pub u64);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Machine team id, assigned monotonically by the owning collection.
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
pub struct MachineTeamId(pub u64);

impl fmt::Display for MachineTeamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mt{}", self.0)
    }
}

/// Replication region a collection instance is responsible for.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum Region {
    Primary,
    Remote,
}

impl Region {
    /// Short tag used as the logging prefix of this region's tasks.
    pub fn tag(&self) -> &'static str {
        match self {
            Region::Primary => "primary",
            Region::Remote => "remote",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Region::Primary)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[cfg(test)]
mod ids_tests {
    use super::*;

    #[test]
    fn server_id_ordering() {
        let a = ServerId(1, 9);
        let b = ServerId(2, 0);
        assert!(a < b);
        assert_eq!(ServerId::from(7u64), ServerId(7, 0));
    }

    #[test]
    fn server_id_display() {
        let id = ServerId(0xdead_beef_0000_0001, 2);
        assert_eq!(id.short(), "deadbeef");
        assert_eq!(format!("{}", id).len(), 32);
    }

    #[test]
    fn region_tags() {
        assert_eq!(Region::Primary.tag(), "primary");
        assert_eq!(Region::Remote.tag(), "remote");
        assert!(Region::Primary.is_primary());
        assert!(!Region::Remote.is_primary());
    }
}
