//! The build loop and its persistent records.

pub mod driver;
pub mod state;
pub mod summary;

pub use driver::{BuildLoop, BuildObserver, DriverSettings, NoopObserver, RunReport};
pub use state::{FileStateStore, MemoryStateStore, ResumeState, StateStore};
pub use summary::{
    BuildSummary, DriftBatchSummary, FeatureOutcome, FeatureRecord, PassSummary, StopReason,
    UnschedulableRecord,
};
