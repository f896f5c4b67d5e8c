//! Provisioning gateway provider.
//!
//! Talks to a remote gateway that fronts the cloud, Kubernetes and chart
//! APIs. The gateway either finishes a mutation inline (200/201) or hands
//! back an operation to poll (202).

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{HalldyllError, ProviderError, Result};

use super::api::{
    Outputs, OperationHandle, OperationStatus, Provider, ProviderOutcome, ProviderResponse,
    ProviderResult, ResourceRequest,
};

/// Retry delay used when a 429 carries no `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP provider for the provisioning gateway.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Gateway base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    name: &'a str,
    kind: &'a str,
    inputs: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AcceptedBody {
    operation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RemoteStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Deserialize)]
struct OperationBody {
    status: RemoteStatus,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    outputs: Outputs,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retryable: bool,
}

impl HttpProvider {
    /// Creates a gateway provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| HalldyllError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        resource: &str,
    ) -> ProviderResult<Response> {
        let response = self
            .authorized(builder)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error(resource, &e))?;

        trace!("Gateway answered {} for {resource}", response.status());
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response, resource).await)
        }
    }

    async fn mutation_response(
        response: Response,
        resource: &str,
    ) -> ProviderResult<ProviderResponse> {
        if response.status() == StatusCode::ACCEPTED {
            let body: AcceptedBody = response
                .json()
                .await
                .map_err(|e| invalid_body(resource, &e))?;
            debug!("Gateway accepted {resource} as operation {}", body.operation_id);
            return Ok(ProviderResponse::Pending(OperationHandle {
                operation_id: body.operation_id,
                resource: resource.to_string(),
            }));
        }

        let outcome: ProviderOutcome = response
            .json()
            .await
            .map_err(|e| invalid_body(resource, &e))?;
        Ok(ProviderResponse::Done(outcome))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        let body = CreateBody {
            name: &request.name,
            kind: &request.kind,
            inputs: &request.inputs,
        };
        let builder = self.client.post(self.url("/v1/resources")).json(&body);
        let response = self.send(builder, &request.name).await?;
        Self::mutation_response(response, &request.name).await
    }

    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> ProviderResult<ProviderResponse> {
        let body = CreateBody {
            name: &request.name,
            kind: &request.kind,
            inputs: &request.inputs,
        };
        let builder = self
            .client
            .put(self.url(&format!("/v1/resources/{id}")))
            .json(&body);
        let response = self.send(builder, &request.name).await?;
        Self::mutation_response(response, &request.name).await
    }

    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<ProviderResponse> {
        let builder = self
            .client
            .delete(self.url(&format!("/v1/resources/{id}")))
            .query(&[("kind", kind)]);
        let response = self.send(builder, id).await?;

        if response.status() == StatusCode::ACCEPTED {
            return Self::mutation_response(response, id).await;
        }
        Ok(ProviderResponse::Done(ProviderOutcome::new(id)))
    }

    async fn poll(&self, operation: &OperationHandle) -> ProviderResult<OperationStatus> {
        let builder = self
            .client
            .get(self.url(&format!("/v1/operations/{}", operation.operation_id)));
        let response = self.send(builder, &operation.resource).await?;
        let body: OperationBody = response
            .json()
            .await
            .map_err(|e| invalid_body(&operation.resource, &e))?;

        Ok(match body.status {
            RemoteStatus::Running => OperationStatus::Running,
            RemoteStatus::Succeeded => OperationStatus::Succeeded(ProviderOutcome {
                id: body.id.unwrap_or_else(|| operation.resource.clone()),
                outputs: body.outputs,
            }),
            RemoteStatus::Failed => {
                let message = body
                    .error
                    .unwrap_or_else(|| String::from("operation failed"));
                // A retry re-issues the mutation, so a failure that left an
                // object behind must not be retried.
                OperationStatus::Failed(match (body.retryable, body.id) {
                    (true, None) => ProviderError::transient(message),
                    (true, Some(id)) => ProviderError::conflict(
                        &operation.resource,
                        format!("{message}; operation left {id} behind"),
                    ),
                    (false, _) => ProviderError::validation(&operation.resource, message),
                })
            }
        })
    }
}

fn transport_error(resource: &str, e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ProviderError::transient(format!("Request for {resource} failed: {e}"))
    } else {
        ProviderError::validation(resource, format!("Request failed: {e}"))
    }
}

fn invalid_body(resource: &str, e: &reqwest::Error) -> ProviderError {
    ProviderError::validation(resource, format!("Invalid gateway response: {e}"))
}

/// Maps a non-success gateway status onto the provider error taxonomy.
async fn status_error(response: Response, resource: &str) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        429 => ProviderError::Transient {
            message: format!("Rate limited while applying {resource}"),
            retry_after_secs: Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
        },
        500..=599 => ProviderError::Transient {
            message: format!("Gateway returned {status}: {body}"),
            retry_after_secs: retry_after,
        },
        409 => ProviderError::conflict(resource, body),
        404 => ProviderError::NotFound {
            id: resource.to_string(),
        },
        401 | 403 => ProviderError::validation(resource, "Gateway rejected the provider token"),
        _ => ProviderError::validation(resource, format!("Gateway returned {status}: {body}")),
    }
}
