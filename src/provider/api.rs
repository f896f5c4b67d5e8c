//! Provider capability interface.
//!
//! The engine only ever asks a provider to create, update or delete one
//! resource and to report the status of a long-running operation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ProviderError;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Outputs reported by a provider, keyed by output name.
pub type Outputs = BTreeMap<String, Value>;

/// A fully resolved request for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Logical resource name.
    pub name: String,
    /// Kind tag.
    pub kind: String,
    /// Resolved input properties (a JSON object).
    pub inputs: Value,
}

/// Final outcome of a provider mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    /// Provider-assigned identifier.
    pub id: String,
    /// Output properties.
    #[serde(default)]
    pub outputs: Outputs,
}

/// Handle on a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    /// Provider operation identifier.
    pub operation_id: String,
    /// Resource the operation is working on.
    pub resource: String,
}

/// Immediate answer to a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    /// The mutation finished.
    Done(ProviderOutcome),
    /// The mutation continues in the background.
    Pending(OperationHandle),
}

/// Status of a long-running operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    /// Still running.
    Running,
    /// Finished successfully.
    Succeeded(ProviderOutcome),
    /// Finished with an error.
    ///
    /// A transient error here means the operation changed nothing: the
    /// executor retries by issuing the mutation again.
    Failed(ProviderError),
}

/// A provider serves one or more resource kinds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse>;

    /// Updates a resource in place.
    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> ProviderResult<ProviderResponse>;

    /// Deletes a resource.
    ///
    /// A missing resource is reported as [`ProviderError::NotFound`].
    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<ProviderResponse>;

    /// Reports the status of a long-running operation.
    async fn poll(&self, operation: &OperationHandle) -> ProviderResult<OperationStatus>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        (**self).create(request).await
    }

    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> ProviderResult<ProviderResponse> {
        (**self).update(id, request).await
    }

    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<ProviderResponse> {
        (**self).delete(kind, id).await
    }

    async fn poll(&self, operation: &OperationHandle) -> ProviderResult<OperationStatus> {
        (**self).poll(operation).await
    }
}

impl ProviderOutcome {
    /// Creates an outcome with no outputs.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outputs: Outputs::new(),
        }
    }

    /// Adds an output.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}

impl ResourceRequest {
    /// Reads a string input.
    #[must_use]
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }
}
