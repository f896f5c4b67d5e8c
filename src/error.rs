//! Error types for the Halldyll infrastructure engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state management, providers,
//! planning and apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Halldyll infrastructure engine.
#[derive(Debug, Error)]
pub enum HalldyllError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Unknown deployment profile.
    #[error("Unknown deployment profile: {name}")]
    UnknownProfile {
        /// The requested profile name.
        name: String,
    },
}

/// Resource graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The declared references form a cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Resources along the cycle, first element repeated at the end.
        path: Vec<String>,
    },

    /// Two declarations share a name.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A reference points at an undeclared resource.
    #[error("Resource '{from}' references unknown resource '{target}'")]
    UnknownReference {
        /// Resource holding the reference.
        from: String,
        /// Missing target.
        target: String,
    },

    /// A property value could not be parsed.
    #[error("Invalid property '{property}' on '{resource}': {message}")]
    InvalidProperty {
        /// Resource name.
        resource: String,
        /// Property path.
        property: String,
        /// Description of the problem.
        message: String,
    },

    /// A placeholder could not be resolved from known outputs.
    #[error("Unresolved reference ${{{target}.{output}}} in '{resource}'")]
    Unresolved {
        /// Resource whose inputs were being resolved.
        resource: String,
        /// Referenced resource.
        target: String,
        /// Referenced output.
        output: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State belongs to another stack.
    #[error("State belongs to {found}, expected {expected}")]
    StackMismatch {
        /// Expected project/environment.
        expected: String,
        /// Found project/environment.
        found: String,
    },
}

/// Provider errors.
///
/// The variants map onto the failure taxonomy of an apply: transient errors
/// are retried, everything else fails the affected subtree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Timeouts, rate limits and server-side hiccups.
    #[error("Transient provider error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Provider-suggested delay before the next attempt.
        retry_after_secs: Option<u64>,
    },

    /// The provider rejected the request as invalid.
    #[error("Provider rejected {resource}: {message}")]
    Validation {
        /// Resource name or id.
        resource: String,
        /// Description of the rejection.
        message: String,
    },

    /// Desired state conflicts with the actual remote state.
    #[error("Conflict on {resource}: {message} (manual reconciliation required)")]
    Conflict {
        /// Resource name or id.
        resource: String,
        /// Description of the conflict.
        message: String,
    },

    /// The remote object does not exist.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider id.
        id: String,
    },

    /// No provider is registered for a kind.
    #[error("No provider registered for kind '{kind}'")]
    UnsupportedKind {
        /// The resource kind.
        kind: String,
    },

    /// Transient failures persisted past the attempt budget.
    #[error("Gave up on {resource} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Resource name.
        resource: String,
        /// Attempts made.
        attempts: u32,
        /// Last transient error message.
        last_error: String,
    },

    /// A long-running operation did not finish in time.
    #[error("Timed out waiting for operation {operation_id}")]
    Timeout {
        /// Operation identifier.
        operation_id: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Conflicting operations in plan.
    #[error("Conflicting operations in plan: {message}")]
    ConflictingOperations {
        /// Description of the conflict.
        message: String,
    },

    /// Dependency resolution failed.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },

    /// Plan violates guardrails.
    #[error("Plan violates guardrails: {}", violations.join("; "))]
    GuardrailViolation {
        /// Individual violations.
        violations: Vec<String>,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Some operations failed; state was persisted.
    #[error("{failed} resource(s) failed, {skipped} skipped")]
    PartialFailure {
        /// Number of failed resources.
        failed: usize,
        /// Number of skipped resources.
        skipped: usize,
    },

    /// The run was interrupted.
    #[error("Apply cancelled: {reason}")]
    Cancelled {
        /// Reason for cancellation.
        reason: String,
    },
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, HalldyllError>;

impl HalldyllError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Transient {
                retry_after_secs, ..
            }) => *retry_after_secs,
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Returns true if retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the error requires manual reconciliation.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = HalldyllError::Provider(ProviderError::Transient {
            message: String::from("throttled"),
            retry_after_secs: Some(7),
        });
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(7));
    }

    #[test]
    fn test_conflict_is_not_retryable() {
        let err = HalldyllError::Provider(ProviderError::conflict("cluster", "version drift"));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("manual reconciliation"));
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }
}
