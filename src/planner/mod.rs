//! Planning and apply.
//!
//! The diff engine compares the desired graph with the applied snapshot,
//! the plan orders the resulting operations, and the executor converges
//! the real world through providers.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff, UNKNOWN_VALUE};
pub use executor::{
    ApplyExecutor, ApplyReport, OperationResult, PollSettings, ResourceOutcome, ResourceStatus,
    RetryPolicy,
};
pub use plan::{Operation, OperationKind, Plan};
