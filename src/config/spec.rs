//! Configuration specification types for the infrastructure engine.
//!
//! This module defines all the structs that map to the `halldyll.infra.yaml` file.
//! These types are declarative and fully describe the desired stack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The root configuration structure for a Halldyll stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Apply executor tuning.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Optional guardrails configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrails: Option<GuardrailsConfig>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Values exported after apply (name -> property expression).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, serde_json::Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name, also the naming prefix available as `${project}`.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Deployment profile the stack was generated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which provider implementation serves the built-in kinds.
    #[serde(default)]
    pub backend: ProviderBackend,
    /// Gateway base URL (required for the http backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Interval between long-running operation polls, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Maximum time to wait for a long-running operation, in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Simulated backend only: report mutations as long-running operations.
    #[serde(default)]
    pub simulate_long_running: bool,
}

/// Provider backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    /// In-process simulated cloud.
    #[default]
    Simulated,
    /// Remote provisioning gateway over HTTP.
    Http,
}

/// Apply executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of operations in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per operation for transient failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds; doubled per attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// How replacements are sequenced.
    #[serde(default)]
    pub replacement: ReplacementStrategy,
}

/// Ordering of the two halves of a replacement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementStrategy {
    /// Create the new instance, repoint dependents, then delete the old one.
    #[default]
    CreateBeforeDelete,
    /// Delete the old instance first, then create the new one.
    DeleteBeforeCreate,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Unique logical name within the stack.
    pub name: String,
    /// Resource kind tag (network, role, cluster, ...).
    pub kind: String,
    /// Input properties, possibly containing `${resource.output}` references.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Explicit ordering dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Protected resources are never deleted or replaced.
    #[serde(default, skip_serializing_if = "is_false")]
    pub protect: bool,
}

/// Guardrails for destructive plans.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardrailsConfig {
    /// Maximum number of deletions a single plan may contain.
    #[serde(default)]
    pub max_deletes: Option<usize>,
    /// Whether plans may replace resources at all.
    #[serde(default = "default_allow_replace")]
    pub allow_replace: bool,
}

// Default value functions

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay() -> u64 {
    500
}

const fn default_max_delay() -> u64 {
    30_000
}

const fn default_request_timeout() -> u64 {
    30
}

const fn default_poll_interval() -> u64 {
    2_000
}

const fn default_operation_timeout() -> u64 {
    1_800
}

const fn default_allow_replace() -> bool {
    true
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: ProviderBackend::default(),
            endpoint: None,
            request_timeout_secs: default_request_timeout(),
            poll_interval_ms: default_poll_interval(),
            operation_timeout_secs: default_operation_timeout(),
            simulate_long_running: false,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            replacement: ReplacementStrategy::default(),
        }
    }
}

impl StackConfig {
    /// Returns the fully qualified stack name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Looks up a declared resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl ResourceConfig {
    /// Creates a resource declaration with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
            protect: false,
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_executor_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.replacement, ReplacementStrategy::CreateBeforeDelete);
    }

    #[test]
    fn test_resource_builder() {
        let res = ResourceConfig::new("cluster", "cluster")
            .with_property("version", json!("1.22"))
            .with_dependency("network");
        assert_eq!(res.properties.get("version"), Some(&json!("1.22")));
        assert_eq!(res.depends_on, vec![String::from("network")]);
        assert!(!res.protect);
    }
}
