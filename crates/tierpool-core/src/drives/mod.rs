//! Physical drives: types, the durable registry, capacity probes and
//! startup provisioning.

mod capacity;
pub mod provision;
mod registry;
mod types;

pub use capacity::{Capacity, CapacityProbe, ManualCapacityProbe, StatvfsProbe};
pub use provision::{BlockDevice, DriveClass, Partition, ProvisionAction, Provisioner};
pub use registry::DriveRegistry;
pub use types::{Drive, DriveHealth, DriveId, Tier};
