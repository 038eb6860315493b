//! Locality descriptors: the attribute → value dictionary every process
//! declares about its placement in the topology.

use std::collections::BTreeMap;
use std::fmt;

use crate::model::{MachineId, ProcessId};

use serde::{Deserialize, Serialize};

/// Datacenter id attribute key.
pub const LOC_DCID: &str = "dcid";
/// Zone id attribute key; doubles as the machine grouping key.
pub const LOC_ZONEID: &str = "zoneid";
/// Machine id attribute key.
pub const LOC_MACHINEID: &str = "machineid";
/// Process id attribute key.
pub const LOC_PROCESSID: &str = "processid";
/// Data hall attribute key.
pub const LOC_DATA_HALL: &str = "data_hall";

/// A process's declared locality. Keys are free-form attribute names; the
/// well-known ones above are what policies and the registry care about.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize,
)]
pub struct Locality {
    attrs: BTreeMap<String, String>,
}

impl Locality {
    /// Creates an empty locality.
    pub fn new() -> Self {
        Locality {
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute insertion.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.attrs.insert(key.to_string(), value.to_string());
        self
    }

    /// Sets an attribute in place.
    pub fn set(&mut self, key: &str, value: &str) {
        self.attrs.insert(key.to_string(), value.to_string());
    }

    /// Gets an attribute value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|s| s.as_str())
    }

    pub fn dc_id(&self) -> Option<&str> {
        self.get(LOC_DCID)
    }

    pub fn data_hall(&self) -> Option<&str> {
        self.get(LOC_DATA_HALL)
    }

    /// The zone id, which is also the machine grouping identity.
    pub fn zone_id(&self) -> Option<MachineId> {
        self.get(LOC_ZONEID).map(MachineId::from)
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.get(LOC_PROCESSID).map(ProcessId::from)
    }

    /// True if every one of the given attribute keys is present.
    pub fn has_keys<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> bool {
        keys.into_iter().all(|k| self.attrs.contains_key(k))
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, (k, v)) in self.attrs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod locality_tests {
    use super::*;

    #[test]
    fn well_known_accessors() {
        let loc = Locality::new()
            .with(LOC_DCID, "dc0")
            .with(LOC_ZONEID, "z3")
            .with(LOC_PROCESSID, "p17");
        assert_eq!(loc.dc_id(), Some("dc0"));
        assert_eq!(loc.zone_id(), Some(MachineId::from("z3")));
        assert_eq!(loc.process_id(), Some(ProcessId::from("p17")));
        assert_eq!(loc.data_hall(), None);
    }

    #[test]
    fn has_keys_check() {
        let loc = Locality::new().with(LOC_ZONEID, "z0").with(LOC_DCID, "dc0");
        let need = vec![LOC_ZONEID.to_string(), LOC_DCID.to_string()];
        assert!(loc.has_keys(need.iter()));
        let need = vec![LOC_DATA_HALL.to_string()];
        assert!(!loc.has_keys(need.iter()));
    }
}
