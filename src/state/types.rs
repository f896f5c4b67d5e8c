//! State snapshot types.
//!
//! A snapshot records the last successfully applied resource set: resolved
//! inputs, outputs, provider ids and dependency lists. The planner diffs
//! against it and the executor rewrites it after every completed mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{HalldyllError, Result, StateError};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept in the snapshot.
const MAX_HISTORY: usize = 100;

/// The complete stack state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied configuration.
    pub config_hash: String,
    /// Applied resources by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Replaced instances whose deletion has not completed yet.
    #[serde(default)]
    pub pending_deletes: Vec<PendingDelete>,
    /// Resolved stack exports.
    #[serde(default)]
    pub exports: BTreeMap<String, Value>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<StackHistoryEntry>,
}

/// State of a single applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Logical name.
    pub name: String,
    /// Kind tag.
    pub kind: String,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Inputs as resolved when last applied.
    pub inputs: Value,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Hash of kind and inputs.
    pub input_hash: String,
    /// Resources this one depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An old instance left behind by a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelete {
    /// Logical name of the replaced resource.
    pub name: String,
    /// Kind of the old instance.
    pub kind: String,
    /// Provider id of the old instance.
    pub provider_id: String,
    /// When the replacement was recorded.
    pub replaced_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: StackOperation,
    /// Configuration hash at time of the run.
    pub config_hash: String,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether every operation succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    /// Converge toward the declaration.
    Apply,
    /// Tear the whole stack down.
    Destroy,
}

impl StackState {
    /// Creates a new empty stack state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            pending_deletes: Vec::new(),
            exports: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks that the snapshot belongs to the given stack.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StackMismatch`] otherwise.
    pub fn verify_stack(&self, project: &str, environment: &str) -> Result<()> {
        if self.project == project && self.environment == environment {
            Ok(())
        } else {
            Err(HalldyllError::State(StateError::StackMismatch {
                expected: format!("{project}/{environment}"),
                found: format!("{}/{}", self.project, self.environment),
            }))
        }
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Adds or updates a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Looks up one output of an applied resource.
    #[must_use]
    pub fn output(&self, resource: &str, output: &str) -> Option<&Value> {
        self.resources
            .get(resource)
            .and_then(|r| r.outputs.get(output))
    }

    /// Records an old instance that still has to be deleted.
    pub fn add_pending_delete(&mut self, pending: PendingDelete) {
        if !self
            .pending_deletes
            .iter()
            .any(|p| p.provider_id == pending.provider_id)
        {
            self.pending_deletes.push(pending);
            self.last_updated = Utc::now();
        }
    }

    /// Forgets a pending delete once the old instance is gone.
    pub fn remove_pending_delete(&mut self, provider_id: &str) -> Option<PendingDelete> {
        let idx = self
            .pending_deletes
            .iter()
            .position(|p| p.provider_id == provider_id)?;
        self.last_updated = Utc::now();
        Some(self.pending_deletes.remove(idx))
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: StackHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource names in sorted order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.pending_deletes.is_empty()
    }
}

impl ResourceState {
    /// Creates a resource record.
    #[must_use]
    pub fn new(
        name: &str,
        kind: &str,
        provider_id: &str,
        inputs: Value,
        input_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            provider_id: provider_id.to_string(),
            inputs,
            outputs: BTreeMap::new(),
            input_hash: input_hash.to_string(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: BTreeMap<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the dependency list.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl StackHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: StackOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: StackOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_is_capped() {
        let mut state = StackState::new("elk", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(StackHistoryEntry::new(
                StackOperation::Apply,
                &format!("hash-{i}"),
                Vec::new(),
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].config_hash, "hash-5");
    }

    #[test]
    fn test_outputs_lookup() {
        let mut state = StackState::new("elk", "dev");
        let mut outputs = BTreeMap::new();
        outputs.insert(String::from("id"), json!("vpc-1"));
        state.set_resource(
            ResourceState::new("network", "network", "vpc-1", json!({}), "h").with_outputs(outputs),
        );

        assert_eq!(state.output("network", "id"), Some(&json!("vpc-1")));
        assert_eq!(state.output("network", "arn"), None);
        assert_eq!(state.output("cluster", "id"), None);
    }

    #[test]
    fn test_pending_deletes_are_deduplicated() {
        let mut state = StackState::new("elk", "dev");
        let pending = PendingDelete {
            name: String::from("cluster"),
            kind: String::from("cluster"),
            provider_id: String::from("eks-old"),
            replaced_at: Utc::now(),
        };
        state.add_pending_delete(pending.clone());
        state.add_pending_delete(pending);
        assert_eq!(state.pending_deletes.len(), 1);
        assert!(!state.is_empty());

        assert!(state.remove_pending_delete("eks-old").is_some());
        assert!(state.remove_pending_delete("eks-old").is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn test_verify_stack() {
        let state = StackState::new("elk", "dev");
        assert!(state.verify_stack("elk", "dev").is_ok());
        assert!(matches!(
            state.verify_stack("elk", "prod"),
            Err(HalldyllError::State(StateError::StackMismatch { .. }))
        ));
    }
}
