//! Apply executor.
//!
//! Walks a plan in dependency order. Ready operations are spawned onto a
//! `JoinSet` and gated by a `Semaphore`; only the coordinating loop touches
//! the snapshot, and it persists the snapshot after every completed
//! mutation and once more at the end of the run.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ExecutorConfig, ProviderConfig};
use crate::error::{ProviderError, Result};
use crate::graph::ResourceGraph;
use crate::provider::{
    OperationHandle, OperationStatus, Provider, ProviderOutcome, ProviderRegistry,
    ProviderResponse, ProviderResult, ResourceRequest,
};
use crate::state::{
    PendingDelete, ResourceState, StackHistoryEntry, StackOperation, StackState, StateStore,
};

use super::plan::{Operation, OperationKind, Plan};

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for the computed delay.
    pub max_delay: Duration,
}

/// How long-running operations are awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between status polls.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

/// Final status of one resource after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Every operation on the resource succeeded.
    Applied,
    /// The resource needed no change.
    Unchanged,
    /// An operation on the resource failed.
    Failed,
    /// Operations were not attempted.
    Skipped,
}

/// Outcome of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    /// Final status.
    pub status: ResourceStatus,
    /// Error or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Provider attempts made across the resource's operations.
    pub attempts: u32,
}

/// Outcome of one planned operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    /// Operation index in the plan.
    pub index: usize,
    /// Operation type.
    pub kind: OperationKind,
    /// Resource name.
    pub resource: String,
    /// Final status (`applied`, `failed` or `skipped`).
    pub status: ResourceStatus,
    /// Provider id after the operation (if any).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Error or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Provider attempts made.
    pub attempts: u32,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Per-resource outcomes.
    pub resources: BTreeMap<String, ResourceOutcome>,
    /// Per-operation outcomes in plan order.
    pub operations: Vec<OperationResult>,
    /// Whether the run was interrupted.
    pub cancelled: bool,
    /// Resolved stack exports.
    pub exports: BTreeMap<String, Value>,
}

/// Executor for plans.
pub struct ApplyExecutor<'a> {
    registry: &'a ProviderRegistry,
    store: &'a dyn StateStore,
    concurrency: usize,
    retry: RetryPolicy,
    polling: PollSettings,
    cancel: CancellationToken,
    hasher: ConfigHasher,
}

impl std::fmt::Debug for ApplyExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyExecutor")
            .field("registry", self.registry)
            .field("store", &self.store.backend_type())
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Provider call performed by a task.
#[derive(Debug, Clone)]
enum TaskAction {
    Create(ResourceRequest),
    Update { id: String, request: ResourceRequest },
    Delete { kind: String, id: String },
}

#[derive(Debug)]
enum TaskOutcome {
    Completed {
        outcome: ProviderOutcome,
        attempts: u32,
    },
    Failed {
        error: ProviderError,
        attempts: u32,
    },
    NotStarted,
}

/// Bundled parameters for one operation running on the pool.
struct OperationTask {
    index: usize,
    resource: String,
    action: TaskAction,
    provider: Arc<dyn Provider>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    polling: PollSettings,
}

impl RetryPolicy {
    /// Builds the policy from executor configuration.
    #[must_use]
    pub const fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before attempt `failed_attempts + 1`.
    ///
    /// Doubles from `base_delay` and is capped at `max_delay`; a provider
    /// supplied retry-after wins when it is longer.
    #[must_use]
    pub fn delay_for(&self, failed_attempts: u32, retry_after_secs: Option<u64>) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        retry_after_secs.map_or(backoff, |secs| backoff.max(Duration::from_secs(secs)))
    }
}

impl PollSettings {
    /// Builds poll settings from provider configuration.
    #[must_use]
    pub const fn from_config(config: &ProviderConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.operation_timeout_secs),
        }
    }
}

impl<'a> ApplyExecutor<'a> {
    /// Creates a new executor.
    #[must_use]
    pub fn new(
        registry: &'a ProviderRegistry,
        store: &'a dyn StateStore,
        executor: &ExecutorConfig,
        provider: &ProviderConfig,
    ) -> Self {
        Self {
            registry,
            store,
            concurrency: executor.concurrency.max(1),
            retry: RetryPolicy::from_config(executor),
            polling: PollSettings::from_config(provider),
            cancel: CancellationToken::new(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Uses an external cancellation token (e.g. wired to Ctrl-C).
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Executes a plan against the snapshot.
    ///
    /// Operation failures are reported per resource and do not make this
    /// call fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan violates guardrails or the final
    /// snapshot cannot be persisted.
    pub async fn execute(
        &self,
        plan: &Plan,
        graph: &ResourceGraph,
        state: &mut StackState,
        run: StackOperation,
    ) -> Result<ApplyReport> {
        plan.ensure_guardrails()?;
        info!(
            "Executing {run} with {} operations (concurrency {})",
            plan.operations.len(),
            self.concurrency
        );

        let n = plan.operations.len();
        let mut states = vec![OpState::Waiting; n];
        let mut results: Vec<Option<OperationResult>> = vec![None; n];
        let mut inputs: HashMap<usize, Value> = HashMap::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(usize, TaskOutcome)> = JoinSet::new();

        loop {
            if !self.cancel.is_cancelled() {
                for idx in 0..n {
                    let op = &plan.operations[idx];
                    if states[idx] != OpState::Waiting
                        || !op.depends_on.iter().all(|d| states[*d] == OpState::Succeeded)
                    {
                        continue;
                    }

                    match self.prepare(op, graph, state) {
                        Ok((action, provider)) => {
                            if let TaskAction::Create(r) | TaskAction::Update { request: r, .. } =
                                &action
                            {
                                inputs.insert(idx, r.inputs.clone());
                            }
                            debug!("Launching {}", op.description());
                            let task = OperationTask {
                                index: idx,
                                resource: op.resource.clone(),
                                action,
                                provider,
                                semaphore: Arc::clone(&semaphore),
                                cancel: self.cancel.clone(),
                                retry: self.retry,
                                polling: self.polling,
                            };
                            let handle = join_set.spawn(task.run());
                            running.insert(handle.id(), idx);
                            states[idx] = OpState::Running;
                        }
                        Err(message) => {
                            error!("Cannot start {}: {message}", op.description());
                            self.fail(plan, idx, message, 0, &mut states, &mut results);
                        }
                    }
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((idx, outcome)) => {
                    let op = &plan.operations[idx];
                    match outcome {
                        TaskOutcome::Completed { outcome, attempts } => {
                            info!("{} succeeded", op.description());
                            let provider_id = outcome.id.clone();
                            self.record_success(op, graph, state, outcome, inputs.remove(&idx));
                            if let Err(e) = self.persist(state).await {
                                warn!("Failed to persist state after {}: {e}", op.resource);
                            }
                            states[idx] = OpState::Succeeded;
                            results[idx] = Some(OperationResult {
                                index: idx,
                                kind: op.kind,
                                resource: op.resource.clone(),
                                status: ResourceStatus::Applied,
                                provider_id: Some(provider_id),
                                message: None,
                                attempts,
                            });
                        }
                        TaskOutcome::Failed { error, attempts } => {
                            error!("{} failed: {error}", op.description());
                            self.fail(
                                plan,
                                idx,
                                error.to_string(),
                                attempts,
                                &mut states,
                                &mut results,
                            );
                        }
                        TaskOutcome::NotStarted => {
                            states[idx] = OpState::Skipped;
                            results[idx] = Some(skipped(op, idx, "cancelled before start"));
                        }
                    }
                }
                Err(join_error) => {
                    error!("Operation task panicked: {join_error}");
                    if let Some(idx) = running.remove(&join_error.id()) {
                        self.fail(
                            plan,
                            idx,
                            join_error.to_string(),
                            0,
                            &mut states,
                            &mut results,
                        );
                    }
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        for (idx, op) in plan.operations.iter().enumerate() {
            if results[idx].is_none() {
                let reason = if cancelled {
                    "cancelled before start"
                } else {
                    "dependencies did not complete"
                };
                results[idx] = Some(skipped(op, idx, reason));
            }
        }
        let operations: Vec<OperationResult> = results.into_iter().flatten().collect();

        let exports = if run == StackOperation::Destroy {
            BTreeMap::new()
        } else {
            resolve_exports(graph, state)
        };
        state.exports.clone_from(&exports);

        let report = ApplyReport::new(plan, operations, cancelled, exports);
        let entry = if report.is_success() {
            state.config_hash.clone_from(&plan.config_hash);
            StackHistoryEntry::new(run, &plan.config_hash, plan.resources())
        } else {
            StackHistoryEntry::failed(run, &plan.config_hash, plan.resources(), &report.summary())
        };
        state.add_history(entry);
        self.persist(state).await?;

        info!("{report}");
        Ok(report)
    }

    /// Resolves inputs and picks the provider for an operation.
    fn prepare(
        &self,
        op: &Operation,
        graph: &ResourceGraph,
        state: &StackState,
    ) -> std::result::Result<(TaskAction, Arc<dyn Provider>), String> {
        let provider = self
            .registry
            .provider(&op.resource_kind)
            .map_err(|e| e.to_string())?;

        if op.is_delete() {
            let id = op
                .provider_id
                .clone()
                .ok_or_else(|| format!("no provider id recorded for {}", op.resource))?;
            return Ok((
                TaskAction::Delete {
                    kind: op.resource_kind.clone(),
                    id,
                },
                provider,
            ));
        }

        let node = graph
            .node(&op.resource)
            .ok_or_else(|| format!("{} is not declared", op.resource))?;
        let inputs = node
            .resolve_inputs(&|r| state.output(&r.resource, &r.output).cloned())
            .map_err(|e| e.to_string())?;
        let request = ResourceRequest {
            name: op.resource.clone(),
            kind: op.resource_kind.clone(),
            inputs,
        };

        let action = match op.kind {
            OperationKind::Update => {
                let id = op
                    .provider_id
                    .clone()
                    .or_else(|| state.get_resource(&op.resource).map(|r| r.provider_id.clone()))
                    .ok_or_else(|| format!("no provider id recorded for {}", op.resource))?;
                TaskAction::Update { id, request }
            }
            _ => TaskAction::Create(request),
        };
        Ok((action, provider))
    }

    /// Writes a successful operation into the snapshot.
    fn record_success(
        &self,
        op: &Operation,
        graph: &ResourceGraph,
        state: &mut StackState,
        outcome: ProviderOutcome,
        inputs: Option<Value>,
    ) {
        match op.kind {
            OperationKind::Create | OperationKind::Update | OperationKind::Replace => {
                let inputs = inputs.unwrap_or(Value::Null);
                let mut outputs = outcome.outputs;
                outputs
                    .entry(String::from("id"))
                    .or_insert_with(|| Value::String(outcome.id.clone()));

                let prior = state.get_resource(&op.resource).cloned();
                if op.kind == OperationKind::Replace
                    && let Some(old) = &prior
                    && old.provider_id != outcome.id
                {
                    state.add_pending_delete(PendingDelete {
                        name: old.name.clone(),
                        kind: old.kind.clone(),
                        provider_id: old.provider_id.clone(),
                        replaced_at: Utc::now(),
                    });
                }

                let hash = self.hasher.hash_inputs(&op.resource_kind, &inputs);
                let mut record =
                    ResourceState::new(&op.resource, &op.resource_kind, &outcome.id, inputs, &hash)
                        .with_outputs(outputs)
                        .with_dependencies(graph.dependencies(&op.resource));
                if let Some(old) = prior
                    && old.provider_id == outcome.id
                {
                    record.created_at = old.created_at;
                }
                state.set_resource(record);
            }
            OperationKind::Delete => {
                state.remove_resource(&op.resource);
            }
            OperationKind::DeleteReplaced => {
                let Some(old_id) = op.provider_id.as_deref() else {
                    return;
                };
                let current = state
                    .get_resource(&op.resource)
                    .is_some_and(|r| r.provider_id == old_id);
                if current {
                    // delete-before-create: the recorded instance is gone
                    state.remove_resource(&op.resource);
                }
                state.remove_pending_delete(old_id);
            }
        }
    }

    /// Marks an operation failed and skips everything downstream of it.
    fn fail(
        &self,
        plan: &Plan,
        idx: usize,
        message: String,
        attempts: u32,
        states: &mut [OpState],
        results: &mut [Option<OperationResult>],
    ) {
        let op = &plan.operations[idx];
        states[idx] = OpState::Failed;
        results[idx] = Some(OperationResult {
            index: idx,
            kind: op.kind,
            resource: op.resource.clone(),
            status: ResourceStatus::Failed,
            provider_id: op.provider_id.clone(),
            message: Some(message),
            attempts,
        });

        for dependent in plan.transitive_dependents(idx) {
            if states[dependent] == OpState::Waiting {
                let reason = format!("{} {} failed", op.kind, op.resource);
                warn!(
                    "Skipping {} because {reason}",
                    plan.operations[dependent].description()
                );
                states[dependent] = OpState::Skipped;
                results[dependent] = Some(skipped(&plan.operations[dependent], dependent, &reason));
            }
        }
    }

    async fn persist(&self, state: &mut StackState) -> Result<()> {
        state.last_updated = Utc::now();
        self.store.save(state).await
    }
}

impl OperationTask {
    /// Waits for a permit, then runs the provider call with retries.
    async fn run(self) -> (usize, TaskOutcome) {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return (self.index, TaskOutcome::NotStarted);
        };
        if self.cancel.is_cancelled() {
            return (self.index, TaskOutcome::NotStarted);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let error = match self.attempt().await {
                Ok(outcome) => {
                    return (self.index, TaskOutcome::Completed { outcome, attempts });
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                return (self.index, TaskOutcome::Failed { error, attempts });
            }
            if attempts >= self.retry.max_attempts {
                let error = ProviderError::RetriesExhausted {
                    resource: self.resource.clone(),
                    attempts,
                    last_error: error.to_string(),
                };
                return (self.index, TaskOutcome::Failed { error, attempts });
            }

            let retry_after = match &error {
                ProviderError::Transient {
                    retry_after_secs, ..
                } => *retry_after_secs,
                _ => None,
            };
            let delay = self.retry.delay_for(attempts, retry_after);
            warn!(
                "Attempt {attempts}/{} for {} failed: {error}; retrying in {}ms",
                self.retry.max_attempts,
                self.resource,
                delay.as_millis()
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    return (self.index, TaskOutcome::Failed { error, attempts });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self) -> ProviderResult<ProviderOutcome> {
        let response = match &self.action {
            TaskAction::Create(request) => self.provider.create(request).await,
            TaskAction::Update { id, request } => self.provider.update(id, request).await,
            TaskAction::Delete { kind, id } => match self.provider.delete(kind, id).await {
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{id} was already deleted");
                    return Ok(ProviderOutcome::new(id.clone()));
                }
                other => other,
            },
        }?;

        match response {
            ProviderResponse::Done(outcome) => Ok(outcome),
            ProviderResponse::Pending(handle) => self.wait(&handle).await,
        }
    }

    /// Polls a long-running operation until it settles or times out.
    async fn wait(&self, handle: &OperationHandle) -> ProviderResult<ProviderOutcome> {
        debug!(
            "Waiting for operation {} on {}",
            handle.operation_id, handle.resource
        );
        let deadline = Instant::now() + self.polling.timeout;

        loop {
            tokio::time::sleep(self.polling.interval).await;

            match self.provider.poll(handle).await {
                Ok(OperationStatus::Running) => {}
                Ok(OperationStatus::Succeeded(outcome)) => return Ok(outcome),
                Ok(OperationStatus::Failed(error)) => return Err(error),
                Err(e) if e.is_transient() => {
                    warn!("Polling {} failed: {e}", handle.operation_id);
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(ProviderError::Timeout {
                    operation_id: handle.operation_id.clone(),
                });
            }
        }
    }
}

fn skipped(op: &Operation, index: usize, reason: &str) -> OperationResult {
    OperationResult {
        index,
        kind: op.kind,
        resource: op.resource.clone(),
        status: ResourceStatus::Skipped,
        provider_id: op.provider_id.clone(),
        message: Some(reason.to_string()),
        attempts: 0,
    }
}

/// Resolves stack exports from the snapshot, leaving out unresolvable ones.
fn resolve_exports(graph: &ResourceGraph, state: &StackState) -> BTreeMap<String, Value> {
    let lookup = |r: &crate::graph::OutputRef| state.output(&r.resource, &r.output).cloned();
    let mut exports = BTreeMap::new();
    for (key, value) in graph.exports() {
        match value.resolve(&lookup) {
            Ok(resolved) => {
                exports.insert(key.clone(), resolved);
            }
            Err(e) => warn!("Export '{key}' is unavailable: {e:?}"),
        }
    }
    exports
}

impl ApplyReport {
    fn new(
        plan: &Plan,
        operations: Vec<OperationResult>,
        cancelled: bool,
        exports: BTreeMap<String, Value>,
    ) -> Self {
        let mut resources: BTreeMap<String, ResourceOutcome> = plan
            .unchanged
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    ResourceOutcome {
                        status: ResourceStatus::Unchanged,
                        message: None,
                        attempts: 0,
                    },
                )
            })
            .collect();

        for result in &operations {
            let entry = resources
                .entry(result.resource.clone())
                .or_insert(ResourceOutcome {
                    status: ResourceStatus::Applied,
                    message: None,
                    attempts: 0,
                });
            entry.attempts += result.attempts;
            // failed outranks skipped outranks applied
            let rank = |s: ResourceStatus| match s {
                ResourceStatus::Failed => 3,
                ResourceStatus::Skipped => 2,
                ResourceStatus::Applied => 1,
                ResourceStatus::Unchanged => 0,
            };
            if rank(result.status) > rank(entry.status) {
                entry.status = result.status;
                entry.message.clone_from(&result.message);
            }
        }

        Self {
            resources,
            operations,
            cancelled,
            exports,
        }
    }

    /// Number of resources with a given status.
    #[must_use]
    pub fn count(&self, status: ResourceStatus) -> usize {
        self.resources
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Number of failed resources.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(ResourceStatus::Failed)
    }

    /// Number of skipped resources.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(ResourceStatus::Skipped)
    }

    /// Returns true if nothing failed, nothing was skipped and the run was
    /// not cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed() == 0 && self.skipped() == 0
    }

    /// Looks up the status of one resource.
    #[must_use]
    pub fn status(&self, resource: &str) -> Option<ResourceStatus> {
        self.resources.get(resource).map(|r| r.status)
    }

    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} applied, {} unchanged, {} failed, {} skipped",
            self.count(ResourceStatus::Applied),
            self.count(ResourceStatus::Unchanged),
            self.failed(),
            self.skipped()
        )
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Resources: {}", self.summary())?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ResourceConfig, StackConfig};
    use crate::error::HalldyllError;
    use crate::planner::DiffEngine;
    use crate::provider::{
        KIND_CLUSTER, KIND_NETWORK, KIND_ROLE, MockProvider, SimulatedProvider,
    };
    use crate::state::LocalStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Fails every create of one resource with a transient error.
    struct FlakyProvider {
        inner: SimulatedProvider,
        failing: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
            if request.name == self.failing {
                self.calls.fetch_add(1, Ordering::SeqCst);
                return Err(ProviderError::transient("503 Service Unavailable"));
            }
            self.inner.create(request).await
        }

        async fn update(
            &self,
            id: &str,
            request: &ResourceRequest,
        ) -> ProviderResult<ProviderResponse> {
            self.inner.update(id, request).await
        }

        async fn delete(&self, kind: &str, id: &str) -> ProviderResult<ProviderResponse> {
            self.inner.delete(kind, id).await
        }

        async fn poll(&self, operation: &OperationHandle) -> ProviderResult<OperationStatus> {
            self.inner.poll(operation).await
        }
    }

    /// Holds the create of one resource until released.
    struct GatedProvider {
        inner: SimulatedProvider,
        gated: String,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Provider for GatedProvider {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
            if request.name == self.gated {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.inner.create(request).await
        }

        async fn update(
            &self,
            id: &str,
            request: &ResourceRequest,
        ) -> ProviderResult<ProviderResponse> {
            self.inner.update(id, request).await
        }

        async fn delete(&self, kind: &str, id: &str) -> ProviderResult<ProviderResponse> {
            self.inner.delete(kind, id).await
        }

        async fn poll(&self, operation: &OperationHandle) -> ProviderResult<OperationStatus> {
            self.inner.poll(operation).await
        }
    }

    struct Harness {
        registry: ProviderRegistry,
        store: LocalStateStore,
        _dir: TempDir,
    }

    impl Harness {
        fn new(provider: Arc<dyn Provider>) -> Self {
            let dir = TempDir::new().expect("temp dir");
            Self {
                registry: ProviderRegistry::with_builtin_kinds(provider),
                store: LocalStateStore::for_stack(dir.path(), "elk-dev"),
                _dir: dir,
            }
        }

        fn executor(&self) -> ApplyExecutor<'_> {
            let config = ExecutorConfig {
                base_delay_ms: 1,
                max_delay_ms: 5,
                ..ExecutorConfig::default()
            };
            let provider = ProviderConfig {
                poll_interval_ms: 1,
                ..ProviderConfig::default()
            };
            ApplyExecutor::new(&self.registry, &self.store, &config, &provider)
        }

        fn plan(&self, config: &StackConfig, state: &StackState) -> (Plan, ResourceGraph) {
            let graph = ResourceGraph::from_config(config).expect("graph");
            let diff = DiffEngine::new(&self.registry)
                .compute_diff(&graph, Some(state))
                .expect("diff");
            let plan = Plan::from_diff(&diff, &graph, Some(state), &self.registry, config, "h")
                .expect("plan");
            (plan, graph)
        }

        async fn apply(&self, config: &StackConfig, state: &mut StackState) -> ApplyReport {
            let (plan, graph) = self.plan(config, state);
            self.executor()
                .execute(&plan, &graph, state, StackOperation::Apply)
                .await
                .expect("execute")
        }
    }

    fn stack(resources: Vec<ResourceConfig>) -> StackConfig {
        StackConfig {
            project: ProjectConfig {
                name: String::from("elk"),
                environment: String::from("dev"),
                profile: None,
            },
            state: crate::config::StateConfig::default(),
            provider: ProviderConfig::default(),
            executor: ExecutorConfig::default(),
            guardrails: None,
            resources,
            exports: BTreeMap::new(),
        }
    }

    fn nrc() -> StackConfig {
        let mut config = stack(vec![
            ResourceConfig::new("n", KIND_NETWORK).with_property("cidr", json!("10.0.0.0/16")),
            ResourceConfig::new("r", KIND_ROLE)
                .with_property("name", json!("${project}-role"))
                .with_property("assume_role_policy", json!({}))
                .with_property("vpc", json!("${n.id}")),
            ResourceConfig::new("c", KIND_CLUSTER)
                .with_property("name", json!("${project}-cluster"))
                .with_property("vpc_id", json!("${n.id}"))
                .with_property("subnet_ids", json!("${n.private_subnet_ids}"))
                .with_property("role_arn", json!("${r.arn}"))
                .with_property("version", json!("1.22")),
            ResourceConfig::new("sibling", KIND_NETWORK),
        ]);
        config
            .exports
            .insert(String::from("cluster_name"), json!("${c.name}"));
        config
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        let delays: Vec<u128> = (1..=5)
            .map(|n| policy.delay_for(n, None).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
        assert_eq!(policy.delay_for(1, Some(5)), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_apply_then_replan_is_empty() {
        let harness = Harness::new(Arc::new(SimulatedProvider::new()));
        let config = nrc();
        let mut state = StackState::new("elk", "dev");

        let report = harness.apply(&config, &mut state).await;
        assert!(report.is_success(), "{report}");
        assert_eq!(report.count(ResourceStatus::Applied), 4);

        let cluster = state.get_resource("c").expect("cluster recorded");
        assert_eq!(cluster.inputs["vpc_id"], state.resources["n"].outputs["id"]);
        assert_eq!(cluster.dependencies, vec![String::from("n"), String::from("r")]);
        assert_eq!(report.exports.get("cluster_name"), Some(&json!("elk-cluster")));

        let persisted = harness.store.load().await.expect("load").expect("state");
        assert_eq!(persisted.resources.len(), 4);
        assert_eq!(persisted.config_hash, "h");

        let (replan, _) = harness.plan(&config, &state);
        assert!(replan.is_empty(), "{replan}");
    }

    #[tokio::test]
    async fn test_version_change_updates_in_place() {
        let harness = Harness::new(Arc::new(SimulatedProvider::new()));
        let mut config = nrc();
        let mut state = StackState::new("elk", "dev");
        harness.apply(&config, &mut state).await;
        let cluster_id = state.resources["c"].provider_id.clone();

        config.resources[2] = config.resources[2]
            .clone()
            .with_property("version", json!("1.23"));
        let (plan, _) = harness.plan(&config, &state);
        assert_eq!(plan.operation_count(), 1);
        assert_eq!(plan.operations[0].kind, OperationKind::Update);
        assert_eq!(plan.operations[0].resource, "c");

        let report = harness.apply(&config, &mut state).await;
        assert_eq!(report.status("c"), Some(ResourceStatus::Applied));
        assert_eq!(report.status("n"), Some(ResourceStatus::Unchanged));
        assert_eq!(state.resources["c"].provider_id, cluster_id);
        assert_eq!(state.resources["c"].inputs["version"], json!("1.23"));
    }

    #[tokio::test]
    async fn test_transient_failure_skips_dependents_only() {
        let flaky = Arc::new(FlakyProvider {
            inner: SimulatedProvider::new(),
            failing: String::from("r"),
            calls: AtomicU32::new(0),
        });
        let harness = Harness::new(flaky.clone());
        let mut state = StackState::new("elk", "dev");

        let report = harness.apply(&nrc(), &mut state).await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.status("n"), Some(ResourceStatus::Applied));
        assert_eq!(report.status("sibling"), Some(ResourceStatus::Applied));
        assert_eq!(report.status("r"), Some(ResourceStatus::Failed));
        assert_eq!(report.status("c"), Some(ResourceStatus::Skipped));
        assert!(!report.is_success());
        assert!(
            report.resources["r"]
                .message
                .as_deref()
                .is_some_and(|m| m.contains("after 3 attempts"))
        );

        let persisted = harness.store.load().await.expect("load").expect("state");
        assert_eq!(persisted.resource_names(), vec!["n", "sibling"]);
        assert!(!persisted.history.last().expect("history").success);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let mut mock = MockProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_create()
            .times(1)
            .returning(|r| Err(ProviderError::conflict(r.name.clone(), "already exists")));
        let harness = Harness::new(Arc::new(mock));
        let mut state = StackState::new("elk", "dev");

        let config = stack(vec![ResourceConfig::new("n", KIND_NETWORK)]);
        let report = harness.apply(&config, &mut state).await;

        assert_eq!(report.status("n"), Some(ResourceStatus::Failed));
        assert_eq!(report.resources["n"].attempts, 1);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_removed_resources_are_deleted_dependents_first() {
        let harness = Harness::new(Arc::new(SimulatedProvider::new()));
        let mut state = StackState::new("elk", "dev");
        harness.apply(&nrc(), &mut state).await;

        let report = harness.apply(&stack(Vec::new()), &mut state).await;

        assert!(report.is_success(), "{report}");
        let order: Vec<&str> = report
            .operations
            .iter()
            .map(|o| o.resource.as_str())
            .collect();
        let pos = |name: &str| order.iter().position(|n| *n == name).expect("deleted");
        assert!(pos("c") < pos("r"));
        assert!(pos("r") < pos("n"));
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_replacement_clears_old_instance() {
        let provider = Arc::new(SimulatedProvider::new());
        let harness = Harness::new(provider.clone());
        let mut state = StackState::new("elk", "dev");
        let mut config = nrc();
        harness.apply(&config, &mut state).await;
        let old_network = state.resources["n"].provider_id.clone();

        config.resources[0] = config.resources[0]
            .clone()
            .with_property("cidr", json!("10.1.0.0/16"));
        let report = harness.apply(&config, &mut state).await;

        assert!(report.is_success(), "{report}");
        assert_ne!(state.resources["n"].provider_id, old_network);
        assert_eq!(
            state.resources["c"].inputs["vpc_id"],
            json!(state.resources["n"].provider_id)
        );
        assert!(state.pending_deletes.is_empty());
        assert_eq!(provider.object_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_long_running_operations_are_polled() {
        let harness = Harness::new(Arc::new(SimulatedProvider::new().with_long_running(true)));
        let mut state = StackState::new("elk", "dev");

        let report = harness.apply(&nrc(), &mut state).await;
        assert!(report.is_success(), "{report}");
        assert_eq!(state.resources.len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_unstarted_operations() {
        let harness = Harness::new(Arc::new(SimulatedProvider::new()));
        let config = nrc();
        let mut state = StackState::new("elk", "dev");
        let (plan, graph) = harness.plan(&config, &state);

        let token = CancellationToken::new();
        token.cancel();
        let report = harness
            .executor()
            .with_cancellation(token)
            .execute(&plan, &graph, &mut state, StackOperation::Apply)
            .await
            .expect("execute");

        assert!(report.cancelled);
        assert_eq!(report.skipped(), 4);
        assert!(harness.store.exists().await.expect("exists"));
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_operation_finish() {
        let gated = Arc::new(GatedProvider {
            inner: SimulatedProvider::new(),
            gated: String::from("n"),
            started: Notify::new(),
            release: Notify::new(),
        });
        let harness = Harness::new(gated.clone());
        let config = nrc();
        let mut state = StackState::new("elk", "dev");
        let (plan, graph) = harness.plan(&config, &state);

        let token = CancellationToken::new();
        let executor = harness.executor().with_cancellation(token.clone());
        let (report, ()) = tokio::join!(
            executor.execute(&plan, &graph, &mut state, StackOperation::Apply),
            async {
                gated.started.notified().await;
                token.cancel();
                gated.release.notify_one();
            }
        );
        let report = report.expect("execute");

        assert!(report.cancelled);
        assert!(!report.is_success());
        assert_eq!(report.status("n"), Some(ResourceStatus::Applied));
        assert_eq!(report.status("r"), Some(ResourceStatus::Skipped));
        assert_eq!(report.status("c"), Some(ResourceStatus::Skipped));

        let persisted = harness.store.load().await.expect("load").expect("state");
        assert_eq!(
            persisted.get_resource("n").map(|r| r.provider_id.as_str()),
            state.get_resource("n").map(|r| r.provider_id.as_str())
        );
        assert!(persisted.get_resource("c").is_none());
        assert!(!persisted.history.last().expect("history").success);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let flaky = Arc::new(FlakyProvider {
            inner: SimulatedProvider::new(),
            failing: String::from("n"),
            calls: AtomicU32::new(0),
        });
        let harness = Harness::new(flaky.clone());
        let config = stack(vec![ResourceConfig::new("n", KIND_NETWORK)]);
        let mut state = StackState::new("elk", "dev");
        let (plan, graph) = harness.plan(&config, &state);

        let slow_retry = ExecutorConfig {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..ExecutorConfig::default()
        };
        let token = CancellationToken::new();
        let executor = ApplyExecutor::new(
            &harness.registry,
            &harness.store,
            &slow_retry,
            &ProviderConfig::default(),
        )
        .with_cancellation(token.clone());

        let started = Instant::now();
        let (report, ()) = tokio::join!(
            executor.execute(&plan, &graph, &mut state, StackOperation::Apply),
            async {
                while flaky.calls.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                token.cancel();
            }
        );
        let report = report.expect("execute");

        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(report.cancelled);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.status("n"), Some(ResourceStatus::Failed));
        assert_eq!(report.resources["n"].attempts, 1);
        assert!(
            report.resources["n"]
                .message
                .as_deref()
                .is_some_and(|m| m.contains("503"))
        );
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_simulated_cloud_survives_between_runs() {
        let cloud = TempDir::new().expect("temp dir");
        let mut harness = Harness::new(Arc::new(
            SimulatedProvider::new().with_persistence(cloud.path()),
        ));
        let mut config = nrc();
        let mut state = StackState::new("elk", "dev");
        harness.apply(&config, &mut state).await;
        let cluster_id = state.resources["c"].provider_id.clone();

        // a later run builds a fresh provider and reloads the snapshot
        harness.registry = ProviderRegistry::with_builtin_kinds(Arc::new(
            SimulatedProvider::new().with_persistence(cloud.path()),
        ));
        let mut state = harness.store.load().await.expect("load").expect("state");
        config.resources[2] = config.resources[2]
            .clone()
            .with_property("version", json!("1.23"));

        let report = harness.apply(&config, &mut state).await;
        assert!(report.is_success(), "{report}");
        assert_eq!(report.status("c"), Some(ResourceStatus::Applied));
        assert_eq!(state.resources["c"].provider_id, cluster_id);
        assert_eq!(state.resources["c"].inputs["version"], json!("1.23"));

        let fresh = Arc::new(SimulatedProvider::new().with_persistence(cloud.path()));
        harness.registry = ProviderRegistry::with_builtin_kinds(fresh.clone());
        let report = harness.apply(&stack(Vec::new()), &mut state).await;
        assert!(report.is_success(), "{report}");
        assert_eq!(fresh.object_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_destroy_empties_stack() {
        let provider = Arc::new(SimulatedProvider::new());
        let harness = Harness::new(provider.clone());
        let mut config = nrc();
        let mut state = StackState::new("elk", "dev");
        harness.apply(&config, &mut state).await;
        assert_eq!(provider.object_count().await.unwrap(), 4);

        // max_deletes does not apply to an explicit destroy
        config.guardrails = Some(crate::config::GuardrailsConfig {
            max_deletes: Some(1),
            allow_replace: true,
        });
        let graph = ResourceGraph::from_config(&config).expect("graph");
        let diff = DiffEngine::new(&harness.registry).compute_destroy(&state);
        let plan = Plan::from_diff(&diff, &graph, Some(&state), &harness.registry, &config, "")
            .expect("plan");
        assert!(plan.destroy);
        assert!(plan.passes_guardrails);

        let report = harness
            .executor()
            .execute(&plan, &graph, &mut state, StackOperation::Destroy)
            .await
            .expect("execute");

        assert!(report.is_success(), "{report}");
        assert!(report.exports.is_empty());
        assert!(state.resources.is_empty());
        assert!(state.exports.is_empty());
        assert_eq!(provider.object_count().await.unwrap(), 0);
        assert_eq!(
            state.history.last().map(|h| h.operation),
            Some(StackOperation::Destroy)
        );
    }

    #[tokio::test]
    async fn test_guardrail_violation_blocks_execution() {
        let harness = Harness::new(Arc::new(SimulatedProvider::new()));
        let mut state = StackState::new("elk", "dev");
        harness.apply(&nrc(), &mut state).await;

        let mut config = stack(Vec::new());
        config.guardrails = Some(crate::config::GuardrailsConfig {
            max_deletes: Some(1),
            allow_replace: true,
        });
        let (plan, graph) = harness.plan(&config, &state);
        let result = harness
            .executor()
            .execute(&plan, &graph, &mut state, StackOperation::Apply)
            .await;

        assert!(matches!(result, Err(HalldyllError::Plan(_))));
        assert_eq!(state.resources.len(), 4);
    }
}
