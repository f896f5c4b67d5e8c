//! State management module for Halldyll stacks.
//!
//! This module provides persistent snapshot storage for applied resources:
//! provider ids, resolved inputs, outputs, pending replacements, exports and
//! run history.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, StateLock, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    PendingDelete, ResourceState, STATE_VERSION, StackHistoryEntry, StackOperation, StackState,
};
