//! Migration Executor: durable tasks, copy, verify, swap and cleanup.

mod copy;
mod dispatch;
mod executor;
mod fingerprint;
mod recovery;
pub mod task;

pub use copy::{CopierKind, CopyPrimitive, NativeCopier, RsyncCopier};
pub use dispatch::Dispatcher;
pub use executor::{staging_dir, staging_path, MigrationExecutor, TaskOutcome};
pub use fingerprint::{
    fingerprint_file, Fingerprint, FingerprintAlgorithm, Fingerprinter, StreamingFingerprinter,
};
pub use recovery::{recover, RecoveryReport};
pub use task::{FailureKind, MigrationReason, MigrationTask, TaskPhase, TaskStore};
