//! Core data model: stable identifiers, localities, and status enumerations
//! shared by every component of the placement controller.

mod ids;
mod locality;
mod status;

pub use ids::{MachineId, MachineTeamId, ProcessId, Region, ServerId, TeamId, Version};
pub use locality::{
    Locality, LOC_DATA_HALL, LOC_DCID, LOC_MACHINEID, LOC_PROCESSID, LOC_ZONEID,
};
pub use status::{ExclusionStatus, ServerStatus, TeamPriority};
