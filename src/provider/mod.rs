//! Provider capability layer.
//!
//! This module provides the interface the engine uses to converge real
//! resources, the schema registry keyed by kind, and the two providers:
//! an in-process simulation and an HTTP provisioning gateway.

mod api;
mod http;
mod registry;
mod schema;
mod simulated;

#[cfg(test)]
pub use api::MockProvider;
pub use api::{
    OperationHandle, OperationStatus, Outputs, Provider, ProviderOutcome, ProviderResponse,
    ProviderResult, ResourceRequest,
};
pub use http::HttpProvider;
pub use registry::ProviderRegistry;
pub use schema::{
    KIND_CHART_DEPLOYMENT, KIND_CLUSTER, KIND_INSTANCE_PROFILE, KIND_NETWORK, KIND_NODE_GROUP,
    KIND_PACKAGE_RELEASE, KIND_ROLE, KindSchema, builtin_schemas,
};
pub use simulated::SimulatedProvider;
