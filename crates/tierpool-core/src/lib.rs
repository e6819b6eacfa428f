//! Tierpool Core - tiering orchestration for a pool of drives behind a union
//! filesystem.
//!
//! The engine tracks where every file physically lives, scores files by a
//! decayed access temperature, plans promotions and demotions between tiers
//! within each drive's capacity, and moves files with a crash-safe
//! copy, verify, swap and clean state machine. The union mount itself is
//! driven through [`union::UnionNamespace`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tierpool_core::{TierEngine, TieringConfig};
//!
//! #[tokio::main]
//! async fn main() -> tierpool_core::Result<()> {
//!     let config = TieringConfig::load("/etc/tierpool/config.json".as_ref())?;
//!     let engine = TierEngine::builder(config).build().await?;
//!     engine.start().await?;
//!
//!     let report = engine.run_cycle().await?;
//!     println!("Queued {} migrations", report.queued.len());
//!
//!     engine.shutdown().await
//! }
//! ```

pub mod atomic;
pub mod cancel;
pub mod command;
pub mod config;
pub mod drives;
pub mod error;
pub mod index;
pub mod maintenance;
pub mod migration;
pub mod policy;
pub mod retry;
pub mod store;
pub mod temperature;
pub mod union;

mod engine;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{TierPolicy, TieringConfig};
pub use drives::{Drive, DriveHealth, DriveId, Tier};
pub use engine::{
    CycleReport, DriveStatus, EngineStatus, TierEngine, TierEngineBuilder, TierStatus,
};
pub use error::{Result, TierError};
pub use index::{LogicalPath, PlacementRecord, PlacementState};
pub use maintenance::ReconcileReport;
pub use migration::{MigrationTask, TaskOutcome, TaskPhase};
pub use policy::Plan;
pub use store::StateStore;
pub use union::{BranchUnion, PhysicalLocation, UnionNamespace};
