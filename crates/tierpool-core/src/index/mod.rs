//! Placement Index: which physical drive holds each logical path.

mod locks;
mod path;
mod placement;
mod record;

pub use locks::{PathGuard, PathLockTable};
pub use path::LogicalPath;
pub use placement::{DriveUsage, PlacementIndex};
pub use record::{PlacementRecord, PlacementState};

pub(crate) use placement::{complete_migration_in, get_in};
