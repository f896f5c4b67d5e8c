//! In-process simulated cloud.
//!
//! Assigns ids and synthesizes kind-specific outputs so stacks can be
//! planned and applied end to end without touching real APIs. With a
//! persistence file the simulated objects outlive the process, so separate
//! CLI runs see the same cloud.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;

use super::api::{
    OperationHandle, OperationStatus, Provider, ProviderOutcome, ProviderResponse,
    ProviderResult, ResourceRequest,
};
use super::schema::{
    KIND_CHART_DEPLOYMENT, KIND_CLUSTER, KIND_INSTANCE_PROFILE, KIND_NETWORK, KIND_NODE_GROUP,
    KIND_PACKAGE_RELEASE, KIND_ROLE,
};

/// Polls a simulated long-running operation reports as running.
const POLLS_BEFORE_DONE: u32 = 1;

/// Fake account id used in synthesized ARNs.
const ACCOUNT_ID: &str = "000000000000";

/// File name of the persisted simulated cloud.
pub const SIMULATED_FILE: &str = "simulated.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimulatedObject {
    kind: String,
    generation: u64,
}

type ObjectMap = HashMap<String, SimulatedObject>;

#[derive(Debug)]
struct PendingOperation {
    remaining_polls: u32,
    outcome: ProviderOutcome,
}

/// Simulated provider serving every built-in kind.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    /// Live objects; `None` until first loaded from the persistence file.
    objects: Mutex<Option<ObjectMap>>,
    operations: Mutex<HashMap<String, PendingOperation>>,
    long_running: bool,
    persist_path: Option<PathBuf>,
}

impl SimulatedProvider {
    /// Creates a provider that completes every call immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports mutations as long-running operations.
    #[must_use]
    pub fn with_long_running(mut self, enabled: bool) -> Self {
        self.long_running = enabled;
        self
    }

    /// Keeps the simulated objects in `dir/simulated.json`.
    #[must_use]
    pub fn with_persistence(mut self, dir: impl AsRef<Path>) -> Self {
        self.persist_path = Some(dir.as_ref().join(SIMULATED_FILE));
        self
    }

    /// Number of live simulated objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistence file cannot be read.
    pub async fn object_count(&self) -> ProviderResult<usize> {
        let guard = self.objects().await?;
        Ok((*guard).as_ref().map_or(0, HashMap::len))
    }

    /// Locks the object map, loading it from disk on first use.
    async fn objects(&self) -> ProviderResult<MutexGuard<'_, Option<ObjectMap>>> {
        let mut guard = self.objects.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_objects().await?);
        }
        Ok(guard)
    }

    async fn load_objects(&self) -> ProviderResult<ObjectMap> {
        let Some(path) = &self.persist_path else {
            return Ok(ObjectMap::new());
        };
        if !path.exists() {
            return Ok(ObjectMap::new());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| storage_error(path, &e))?;
        let objects: ObjectMap = serde_json::from_str(&content).map_err(|e| {
            ProviderError::validation(
                path.display().to_string(),
                format!("corrupt simulated cloud: {e}"),
            )
        })?;
        debug!("Loaded {} simulated objects from {}", objects.len(), path.display());
        Ok(objects)
    }

    /// Applies `change` to a copy of the objects and commits it once persisted.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut ObjectMap) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let mut guard = self.objects().await?;
        let mut objects = (*guard).clone().unwrap_or_default();
        let result = change(&mut objects)?;
        self.persist(&objects).await?;
        *guard = Some(objects);
        Ok(result)
    }

    /// Writes the objects through a synced temp file and a rename.
    async fn persist(&self, objects: &ObjectMap) -> ProviderResult<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| storage_error(dir, &e))?;
        }
        let content =
            serde_json::to_string_pretty(objects).map_err(|e| storage_error(path, &e))?;
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage_error(&temp_path, &e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| storage_error(&temp_path, &e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error(&temp_path, &e))?;
        drop(file);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| storage_error(path, &e))
    }

    async fn respond(&self, resource: &str, outcome: ProviderOutcome) -> ProviderResponse {
        if !self.long_running {
            return ProviderResponse::Done(outcome);
        }
        let operation_id = format!("op-{}", short_id());
        self.operations.lock().await.insert(
            operation_id.clone(),
            PendingOperation {
                remaining_polls: POLLS_BEFORE_DONE,
                outcome,
            },
        );
        ProviderResponse::Pending(OperationHandle {
            operation_id,
            resource: resource.to_string(),
        })
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        let id = format!("{}-{}", id_prefix(&request.kind), short_id());
        debug!("Simulating create of {} ({}) as {id}", request.name, request.kind);

        self.mutate(|objects| {
            objects.insert(
                id.clone(),
                SimulatedObject {
                    kind: request.kind.clone(),
                    generation: 1,
                },
            );
            Ok(())
        })
        .await?;

        let outcome = synthesize_outcome(&id, request, 1);
        Ok(self.respond(&request.name, outcome).await)
    }

    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> ProviderResult<ProviderResponse> {
        let generation = self
            .mutate(|objects| {
                let object = objects.get_mut(id).ok_or_else(|| ProviderError::NotFound {
                    id: id.to_string(),
                })?;
                if object.kind != request.kind {
                    return Err(ProviderError::conflict(
                        &request.name,
                        format!("object {id} is a {}, not a {}", object.kind, request.kind),
                    ));
                }
                object.generation += 1;
                Ok(object.generation)
            })
            .await?;
        debug!("Simulating update of {} ({id})", request.name);

        let outcome = synthesize_outcome(id, request, generation);
        Ok(self.respond(&request.name, outcome).await)
    }

    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<ProviderResponse> {
        self.mutate(|objects| match objects.get(id).map(|object| object.kind == kind) {
            Some(true) => {
                objects.remove(id);
                Ok(())
            }
            Some(false) => Err(ProviderError::conflict(id, format!("object is not a {kind}"))),
            None => Err(ProviderError::NotFound { id: id.to_string() }),
        })
        .await?;

        debug!("Simulating delete of {id}");
        Ok(self.respond(id, ProviderOutcome::new(id)).await)
    }

    async fn poll(&self, operation: &OperationHandle) -> ProviderResult<OperationStatus> {
        let mut operations = self.operations.lock().await;
        let Some(pending) = operations.get_mut(&operation.operation_id) else {
            return Err(ProviderError::NotFound {
                id: operation.operation_id.clone(),
            });
        };

        if pending.remaining_polls > 0 {
            pending.remaining_polls -= 1;
            return Ok(OperationStatus::Running);
        }

        let outcome = pending.outcome.clone();
        operations.remove(&operation.operation_id);
        Ok(OperationStatus::Succeeded(outcome))
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(12).collect()
}

fn storage_error(path: &Path, error: &dyn std::fmt::Display) -> ProviderError {
    ProviderError::Transient {
        message: format!("simulated cloud storage {}: {error}", path.display()),
        retry_after_secs: None,
    }
}

fn id_prefix(kind: &str) -> &'static str {
    match kind {
        KIND_NETWORK => "vpc",
        KIND_ROLE => "role",
        KIND_INSTANCE_PROFILE => "ip",
        KIND_CLUSTER => "eks",
        KIND_NODE_GROUP => "ng",
        KIND_PACKAGE_RELEASE | KIND_CHART_DEPLOYMENT => "rel",
        _ => "res",
    }
}

/// Builds the outputs a real provider would report for this kind.
fn synthesize_outcome(id: &str, request: &ResourceRequest, generation: u64) -> ProviderOutcome {
    let name = request.input_str("name").unwrap_or(&request.name).to_string();
    let outcome = ProviderOutcome::new(id).with_output("id", json!(id));

    match request.kind.as_str() {
        KIND_NETWORK => {
            let suffix: String = id.chars().rev().take(4).collect();
            outcome
                .with_output(
                    "cidr",
                    request
                        .inputs
                        .get("cidr")
                        .cloned()
                        .unwrap_or_else(|| json!("172.31.0.0/16")),
                )
                .with_output(
                    "private_subnet_ids",
                    json!([format!("subnet-{suffix}a"), format!("subnet-{suffix}b")]),
                )
                .with_output(
                    "public_subnet_ids",
                    json!([format!("subnet-{suffix}c"), format!("subnet-{suffix}d")]),
                )
        }
        KIND_ROLE => outcome
            .with_output("arn", json!(format!("arn:aws:iam::{ACCOUNT_ID}:role/{name}")))
            .with_output("name", json!(name)),
        KIND_INSTANCE_PROFILE => outcome
            .with_output(
                "arn",
                json!(format!("arn:aws:iam::{ACCOUNT_ID}:instance-profile/{name}")),
            )
            .with_output("name", json!(name)),
        KIND_CLUSTER => {
            let endpoint = format!("https://{id}.eks.simulated.local");
            let kubeconfig = json!({
                "apiVersion": "v1",
                "kind": "Config",
                "clusters": [{"name": name, "cluster": {"server": endpoint}}],
                "current-context": name,
            });
            outcome
                .with_output("name", json!(name))
                .with_output("endpoint", json!(endpoint))
                .with_output("kubeconfig", kubeconfig)
                .with_output("certificate_authority", json!(format!("ca-{id}")))
        }
        KIND_NODE_GROUP => outcome
            .with_output("name", json!(name))
            .with_output("autoscaling_group", json!(format!("asg-{id}"))),
        KIND_PACKAGE_RELEASE | KIND_CHART_DEPLOYMENT => {
            let namespace = request
                .input_str("namespace")
                .unwrap_or("default")
                .to_string();
            let outcome = outcome
                .with_output("name", json!(name))
                .with_output("namespace", json!(namespace))
                .with_output("status", json!("deployed"));
            if request.kind == KIND_PACKAGE_RELEASE {
                outcome.with_output("revision", Value::from(generation))
            } else {
                outcome
            }
        }
        _ => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, kind: &str, inputs: Value) -> ResourceRequest {
        ResourceRequest {
            name: name.to_string(),
            kind: kind.to_string(),
            inputs,
        }
    }

    fn done(response: ProviderResponse) -> ProviderOutcome {
        match response {
            ProviderResponse::Done(outcome) => outcome,
            ProviderResponse::Pending(handle) => panic!("unexpected pending {handle:?}"),
        }
    }

    #[tokio::test]
    async fn test_network_outputs() {
        let provider = SimulatedProvider::new();
        let outcome = done(
            provider
                .create(&request("network", KIND_NETWORK, json!({"cidr": "10.0.0.0/16"})))
                .await
                .unwrap(),
        );

        assert!(outcome.id.starts_with("vpc-"));
        assert_eq!(outcome.outputs["cidr"], json!("10.0.0.0/16"));
        assert_eq!(
            outcome.outputs["private_subnet_ids"]
                .as_array()
                .map(Vec::len),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_update_bumps_release_revision() {
        let provider = SimulatedProvider::new();
        let req = request("kibana", KIND_PACKAGE_RELEASE, json!({"chart": "kibana"}));
        let created = done(provider.create(&req).await.unwrap());
        assert_eq!(created.outputs["revision"], json!(1));

        let updated = done(provider.update(&created.id, &req).await.unwrap());
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.outputs["revision"], json!(2));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let provider = SimulatedProvider::new();
        let err = provider.delete(KIND_ROLE, "role-missing").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_with_wrong_kind_conflicts() {
        let provider = SimulatedProvider::new();
        let created = done(
            provider
                .create(&request("r", KIND_ROLE, json!({"name": "r"})))
                .await
                .unwrap(),
        );
        let err = provider.delete(KIND_CLUSTER, &created.id).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(provider.object_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_long_running_operations_complete_after_polling() {
        let provider = SimulatedProvider::new().with_long_running(true);
        let response = provider
            .create(&request("cluster", KIND_CLUSTER, json!({"name": "elk"})))
            .await
            .unwrap();
        let ProviderResponse::Pending(handle) = response else {
            panic!("expected a pending operation");
        };

        assert_eq!(provider.poll(&handle).await.unwrap(), OperationStatus::Running);
        match provider.poll(&handle).await.unwrap() {
            OperationStatus::Succeeded(outcome) => {
                assert_eq!(outcome.outputs["name"], json!("elk"));
                assert!(outcome.outputs.contains_key("kubeconfig"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(provider.poll(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_persisted_objects_are_shared_by_fresh_providers() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = SimulatedProvider::new().with_persistence(dir.path());
        let created = done(
            first
                .create(&request("r", KIND_ROLE, json!({"name": "elk-role"})))
                .await
                .unwrap(),
        );
        assert!(dir.path().join(SIMULATED_FILE).exists());

        let second = SimulatedProvider::new().with_persistence(dir.path());
        assert_eq!(second.object_count().await.unwrap(), 1);
        let req = request("r", KIND_ROLE, json!({"name": "elk-role"}));
        let updated = done(second.update(&created.id, &req).await.unwrap());
        assert_eq!(updated.id, created.id);

        done(second.delete(KIND_ROLE, &created.id).await.unwrap());
        let third = SimulatedProvider::new().with_persistence(dir.path());
        assert_eq!(third.object_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_cloud_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(SIMULATED_FILE), "not json").unwrap();

        let provider = SimulatedProvider::new().with_persistence(dir.path());
        let err = provider
            .create(&request("n", KIND_NETWORK, json!({})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains(SIMULATED_FILE));
    }
}
