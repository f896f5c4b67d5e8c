//! Plan types and construction.
//!
//! A plan is the diff turned into operations with explicit ordering
//! constraints. Operations are stored in a deterministic topological order:
//! among operations that are free to run, resource name and then operation
//! kind decide.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::{ReplacementStrategy, StackConfig};
use crate::error::{HalldyllError, PlanError, Result};
use crate::graph::ResourceGraph;
use crate::provider::ProviderRegistry;
use crate::state::StackState;

use super::diff::{DiffDetail, DiffResult, DiffType};

/// A complete plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Operations in execution order.
    pub operations: Vec<Operation>,
    /// Declared resources that need no change.
    pub unchanged: Vec<String>,
    /// Whether the plan tears the whole stack down.
    pub destroy: bool,
    /// Whether the plan passes guardrails.
    pub passes_guardrails: bool,
    /// Guardrail violations (if any).
    pub guardrail_violations: Vec<String>,
}

/// A single planned operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Operation type.
    pub kind: OperationKind,
    /// Resource name.
    pub resource: String,
    /// Kind tag the provider call uses.
    pub resource_kind: String,
    /// Provider id of the existing instance (if applicable).
    pub provider_id: Option<String>,
    /// Reason for this operation.
    pub reason: String,
    /// Property-level differences.
    pub details: Vec<DiffDetail>,
    /// Operation indices that must complete first.
    pub depends_on: Vec<usize>,
}

/// Types of operations in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Create the replacement instance of a resource.
    Replace,
    /// Delete the old instance of a replaced resource.
    DeleteReplaced,
    /// Delete a resource.
    Delete,
}

impl Plan {
    /// Builds a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyResolutionFailed`] if the ordering
    /// constraints cannot be satisfied.
    pub fn from_diff(
        diff: &DiffResult,
        graph: &ResourceGraph,
        state: Option<&StackState>,
        registry: &ProviderRegistry,
        config: &StackConfig,
        config_hash: &str,
    ) -> Result<Self> {
        let mut ops: Vec<Operation> = Vec::new();
        let mut mutation: HashMap<&str, usize> = HashMap::new();
        let mut removal: HashMap<&str, usize> = HashMap::new();
        let mut old_instance: HashMap<&str, usize> = HashMap::new();
        let mut unchanged = Vec::new();

        for d in &diff.diffs {
            let op = |kind: OperationKind, resource_kind: &str, reason: &str| Operation {
                kind,
                resource: d.name.clone(),
                resource_kind: resource_kind.to_string(),
                provider_id: d.provider_id.clone(),
                reason: reason.to_string(),
                details: d.details.clone(),
                depends_on: Vec::new(),
            };
            match d.diff_type {
                DiffType::NoChange => unchanged.push(d.name.clone()),
                DiffType::Create => {
                    mutation.insert(d.name.as_str(), ops.len());
                    ops.push(op(OperationKind::Create, &d.kind, &d.reason));
                }
                DiffType::Update => {
                    mutation.insert(d.name.as_str(), ops.len());
                    ops.push(op(OperationKind::Update, &d.kind, &d.reason));
                }
                DiffType::Replace => {
                    mutation.insert(d.name.as_str(), ops.len());
                    ops.push(op(OperationKind::Replace, &d.kind, &d.reason));
                    old_instance.insert(d.name.as_str(), ops.len());
                    let old_kind = d.old_kind.as_deref().unwrap_or(&d.kind);
                    let mut delete = op(
                        OperationKind::DeleteReplaced,
                        old_kind,
                        "Old instance of replaced resource",
                    );
                    delete.details.clear();
                    ops.push(delete);
                }
                DiffType::Delete => {
                    removal.insert(d.name.as_str(), ops.len());
                    ops.push(op(OperationKind::Delete, &d.kind, &d.reason));
                }
            }
        }

        if let Some(state) = state {
            for pending in &state.pending_deletes {
                ops.push(Operation {
                    kind: OperationKind::DeleteReplaced,
                    resource: pending.name.clone(),
                    resource_kind: pending.kind.clone(),
                    provider_id: Some(pending.provider_id.clone()),
                    reason: String::from("Finishing interrupted replacement"),
                    details: Vec::new(),
                    depends_on: Vec::new(),
                });
            }
        }

        let mut after: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); ops.len()];

        // creates, updates and replacements follow their graph dependencies
        for (name, &idx) in &mutation {
            for dep in graph.dependencies(name) {
                if let Some(&dep_idx) = mutation.get(dep.as_str()) {
                    after[idx].insert(dep_idx);
                }
            }
        }

        // an instance goes away only after whatever still uses it
        for (name, &idx) in &removal {
            for dependent in recorded_dependents(state, name) {
                if let Some(&j) = removal.get(dependent) {
                    after[idx].insert(j);
                }
                if let Some(&j) = mutation.get(dependent) {
                    after[idx].insert(j);
                }
                if let Some(&j) = old_instance.get(dependent) {
                    after[idx].insert(j);
                }
            }
        }

        // replaced resources still using a delete-first old instance are
        // deleted first too, so their old instances can go before it
        let mut delete_first: BTreeSet<&str> = old_instance
            .keys()
            .copied()
            .filter(|name| {
                config.executor.replacement == ReplacementStrategy::DeleteBeforeCreate
                    || mutation.get(name).is_some_and(|&idx| {
                        registry
                            .schema(&ops[idx].resource_kind)
                            .is_some_and(|s| s.conflicting_identity)
                    })
            })
            .collect();
        let mut pending: Vec<&str> = delete_first.iter().copied().collect();
        while let Some(name) = pending.pop() {
            for dependent in recorded_dependents(state, name) {
                if old_instance.contains_key(dependent) && delete_first.insert(dependent) {
                    pending.push(dependent);
                }
            }
        }

        for (name, &old_idx) in &old_instance {
            let Some(&new_idx) = mutation.get(name) else {
                continue;
            };

            for dependent in recorded_dependents(state, name) {
                if let Some(&j) = removal.get(dependent) {
                    after[old_idx].insert(j);
                }
            }

            if delete_first.contains(name) {
                ops[new_idx].reason = format!("{} (delete before create)", ops[new_idx].reason);
                after[new_idx].insert(old_idx);
                for dependent in recorded_dependents(state, name) {
                    if let Some(&j) = old_instance.get(dependent) {
                        after[old_idx].insert(j);
                    }
                }
            } else {
                after[old_idx].insert(new_idx);
                for dependent in graph.dependents(name) {
                    if let Some(&j) = mutation.get(dependent.as_str()) {
                        after[old_idx].insert(j);
                    }
                }
                for dependent in recorded_dependents(state, name) {
                    if let Some(&j) = old_instance.get(dependent) {
                        after[old_idx].insert(j);
                    }
                }
            }
        }

        let operations = order_operations(ops, &after)?;

        let mut plan = Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            operations,
            unchanged,
            destroy: diff.destroy,
            passes_guardrails: true,
            guardrail_violations: Vec::new(),
        };
        plan.check_guardrails(graph, config);

        debug!(
            "Planned {} operations ({} unchanged)",
            plan.operations.len(),
            plan.unchanged.len()
        );
        Ok(plan)
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            operations: Vec::new(),
            unchanged: Vec::new(),
            destroy: false,
            passes_guardrails: true,
            guardrail_violations: Vec::new(),
        }
    }

    /// Checks guardrails for the plan.
    fn check_guardrails(&mut self, graph: &ResourceGraph, config: &StackConfig) {
        let mut violations = Vec::new();

        let protected = |name: &str| {
            graph.node(name).is_some_and(|n| n.protect)
                || config.resource(name).is_some_and(|r| r.protect)
        };
        for op in &self.operations {
            if matches!(op.kind, OperationKind::Delete | OperationKind::Replace)
                && protected(&op.resource)
            {
                violations.push(format!(
                    "Resource '{}' is protected and cannot be {}",
                    op.resource,
                    if op.kind == OperationKind::Delete {
                        "deleted"
                    } else {
                        "replaced"
                    }
                ));
            }
        }

        if let Some(guardrails) = &config.guardrails {
            let deletes = self.count(OperationKind::Delete);
            if let Some(max) = guardrails.max_deletes
                && !self.destroy
                && deletes > max
            {
                violations.push(format!(
                    "Plan deletes {deletes} resources but max_deletes is {max}"
                ));
            }

            let replaces = self.count(OperationKind::Replace);
            if !guardrails.allow_replace && replaces > 0 {
                violations.push(format!(
                    "Plan replaces {replaces} resources but allow_replace is false"
                ));
            }
        }

        self.passes_guardrails = violations.is_empty();
        self.guardrail_violations = violations;
    }

    /// Fails if the plan violates guardrails.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::GuardrailViolation`] listing every violation.
    pub fn ensure_guardrails(&self) -> Result<()> {
        if self.passes_guardrails {
            Ok(())
        } else {
            Err(HalldyllError::Plan(PlanError::GuardrailViolation {
                violations: self.guardrail_violations.clone(),
            }))
        }
    }

    /// Returns true if the plan is empty (no changes).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Returns the number of operations of one kind.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|o| o.kind == kind).count()
    }

    /// Gets operations that depend directly on a specific operation index.
    #[must_use]
    pub fn dependent_operations(&self, index: usize) -> Vec<(usize, &Operation)> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, o)| o.depends_on.contains(&index))
            .collect()
    }

    /// Every operation that transitively depends on `index`.
    #[must_use]
    pub fn transitive_dependents(&self, index: usize) -> BTreeSet<usize> {
        let mut found = BTreeSet::new();
        let mut queue = vec![index];
        while let Some(current) = queue.pop() {
            for (idx, _) in self.dependent_operations(current) {
                if found.insert(idx) {
                    queue.push(idx);
                }
            }
        }
        found
    }

    /// Names of every resource an operation touches, sorted.
    #[must_use]
    pub fn resources(&self) -> Vec<String> {
        self.operations
            .iter()
            .map(|o| o.resource.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Recorded resources whose snapshot lists `target` as a dependency.
fn recorded_dependents<'s>(state: Option<&'s StackState>, target: &str) -> Vec<&'s str> {
    state
        .map(|s| {
            s.resources
                .values()
                .filter(|r| r.dependencies.iter().any(|d| d == target))
                .map(|r| r.name.as_str())
                .collect()
        })
        .unwrap_or_default()
}

/// Kahn's algorithm over the prerequisite sets with a deterministic
/// tie-break; indices are remapped to the final order.
fn order_operations(ops: Vec<Operation>, after: &[BTreeSet<usize>]) -> Result<Vec<Operation>> {
    let mut in_degree: Vec<usize> = after.iter().map(BTreeSet::len).collect();
    let mut unlocks: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
    for (idx, prereqs) in after.iter().enumerate() {
        for &p in prereqs {
            unlocks[p].push(idx);
        }
    }

    let key = |idx: usize| {
        (
            ops[idx].resource.clone(),
            ops[idx].kind,
            ops[idx].provider_id.clone(),
            idx,
        )
    };
    let mut ready: BTreeSet<_> = (0..ops.len())
        .filter(|&i| in_degree[i] == 0)
        .map(key)
        .collect();

    let mut order = Vec::with_capacity(ops.len());
    while let Some((_, _, _, idx)) = ready.pop_first() {
        order.push(idx);
        for &next in &unlocks[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(key(next));
            }
        }
    }

    if order.len() != ops.len() {
        let stuck: Vec<String> = (0..ops.len())
            .filter(|i| !order.contains(i))
            .map(|i| format!("{} {}", ops[i].kind, ops[i].resource))
            .collect();
        return Err(HalldyllError::Plan(PlanError::DependencyResolutionFailed {
            message: format!("operations wait on each other: {}", stuck.join(", ")),
        }));
    }

    let mut position = vec![0usize; ops.len()];
    for (pos, &idx) in order.iter().enumerate() {
        position[idx] = pos;
    }

    let mut slots: Vec<Option<Operation>> = ops.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(order.len());
    for &idx in &order {
        if let Some(mut op) = slots[idx].take() {
            let mut deps: Vec<usize> = after[idx].iter().map(|&p| position[p]).collect();
            deps.sort_unstable();
            op.depends_on = deps;
            ordered.push(op);
        }
    }
    Ok(ordered)
}

impl Operation {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            OperationKind::Create => format!("Create {} '{}'", self.resource_kind, self.resource),
            OperationKind::Update => format!("Update {} '{}'", self.resource_kind, self.resource),
            OperationKind::Replace => {
                format!("Replace {} '{}'", self.resource_kind, self.resource)
            }
            OperationKind::DeleteReplaced => format!(
                "Delete old {} '{}' ({})",
                self.resource_kind,
                self.resource,
                self.provider_id.as_deref().unwrap_or("unknown id")
            ),
            OperationKind::Delete => format!("Delete {} '{}'", self.resource_kind, self.resource),
        }
    }

    /// Returns true if the operation removes a remote object.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(
            self.kind,
            OperationKind::Delete | OperationKind::DeleteReplaced
        )
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::DeleteReplaced => "delete-replaced",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.resource)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operations.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} operations):", self.operations.len())?;
        for (i, op) in self.operations.iter().enumerate() {
            writeln!(f, "  {i}. {op}")?;
        }

        if !self.guardrail_violations.is_empty() {
            writeln!(f, "\nGuardrail violations:")?;
            for violation in &self.guardrail_violations {
                writeln!(f, "  - {violation}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardrailsConfig, ProjectConfig, ResourceConfig};
    use crate::planner::DiffEngine;
    use crate::provider::{
        KIND_CLUSTER, KIND_NETWORK, KIND_NODE_GROUP, KIND_ROLE, SimulatedProvider,
    };
    use crate::state::{PendingDelete, ResourceState};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn stack(resources: Vec<ResourceConfig>) -> StackConfig {
        StackConfig {
            project: ProjectConfig {
                name: String::from("elk"),
                environment: String::from("dev"),
                profile: None,
            },
            state: crate::config::StateConfig::default(),
            provider: crate::config::ProviderConfig::default(),
            executor: crate::config::ExecutorConfig::default(),
            guardrails: None,
            resources,
            exports: BTreeMap::new(),
        }
    }

    fn plan_for(config: &StackConfig, state: Option<&StackState>) -> Result<Plan> {
        let registry = ProviderRegistry::with_builtin_kinds(Arc::new(SimulatedProvider::new()));
        let graph = ResourceGraph::from_config(config)?;
        let diff = DiffEngine::new(&registry).compute_diff(&graph, state)?;
        Plan::from_diff(&diff, &graph, state, &registry, config, "hash")
    }

    fn nrc() -> Vec<ResourceConfig> {
        vec![
            ResourceConfig::new("n", KIND_NETWORK).with_property("cidr", json!("10.0.0.0/16")),
            ResourceConfig::new("r", KIND_ROLE)
                .with_property("name", json!("${project}-role"))
                .with_property("assume_role_policy", json!({}))
                .with_property("vpc", json!("${n.id}")),
            ResourceConfig::new("c", KIND_CLUSTER)
                .with_property("name", json!("${project}-cluster"))
                .with_property("vpc_id", json!("${n.id}"))
                .with_property("subnet_ids", json!("${n.private_subnet_ids}"))
                .with_property("role_arn", json!("${r.arn}")),
        ]
    }

    fn recorded(name: &str, kind: &str, id: &str, deps: &[&str]) -> ResourceState {
        ResourceState::new(name, kind, id, json!({}), "h")
            .with_dependencies(deps.iter().map(|d| (*d).to_string()).collect())
    }

    fn position(plan: &Plan, kind: OperationKind, resource: &str) -> usize {
        plan.operations
            .iter()
            .position(|o| o.kind == kind && o.resource == resource)
            .expect("operation present")
    }

    #[test]
    fn test_empty_state_creates_in_dependency_order() {
        let plan = plan_for(&stack(nrc()), None).expect("plan");

        let order: Vec<(OperationKind, &str)> = plan
            .operations
            .iter()
            .map(|o| (o.kind, o.resource.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (OperationKind::Create, "n"),
                (OperationKind::Create, "r"),
                (OperationKind::Create, "c"),
            ]
        );
        assert_eq!(plan.operations[2].depends_on, vec![0, 1]);
        assert_eq!(plan.operations[1].depends_on, vec![0]);
    }

    #[test]
    fn test_independent_operations_are_ordered_by_name() {
        let resources = vec![
            ResourceConfig::new("zeta", KIND_NETWORK),
            ResourceConfig::new("alpha", KIND_NETWORK),
            ResourceConfig::new("mid", KIND_NETWORK),
        ];
        let plan = plan_for(&stack(resources), None).expect("plan");
        let names: Vec<&str> = plan.operations.iter().map(|o| o.resource.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_cycle_produces_no_plan() {
        let resources = vec![
            ResourceConfig::new("a", KIND_NETWORK).with_property("x", json!("${b.id}")),
            ResourceConfig::new("b", KIND_NETWORK).with_property("x", json!("${a.id}")),
        ];
        let result = plan_for(&stack(resources), None);
        assert!(matches!(
            result,
            Err(HalldyllError::Graph(crate::error::GraphError::Cycle { .. }))
        ));
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let mut state = StackState::new("elk", "dev");
        state.set_resource(recorded("n", KIND_NETWORK, "vpc-1", &[]));
        state.set_resource(recorded("r", KIND_ROLE, "role-1", &["n"]));
        state.set_resource(recorded("c", KIND_CLUSTER, "eks-1", &["n", "r"]));

        let plan = plan_for(&stack(Vec::new()), Some(&state)).expect("plan");

        let c = position(&plan, OperationKind::Delete, "c");
        let r = position(&plan, OperationKind::Delete, "r");
        let n = position(&plan, OperationKind::Delete, "n");
        assert!(c < r && r < n);
        assert!(plan.operations[n].depends_on.contains(&c));
        assert!(plan.operations[n].depends_on.contains(&r));
    }

    #[test]
    fn test_replace_creates_before_deleting_by_default() {
        let config = stack(vec![
            ResourceConfig::new("n", KIND_NETWORK).with_property("cidr", json!("10.1.0.0/16")),
        ]);
        let mut state = StackState::new("elk", "dev");
        state.set_resource(ResourceState::new(
            "n",
            KIND_NETWORK,
            "vpc-1",
            json!({"cidr": "10.0.0.0/16"}),
            "h",
        ));

        let plan = plan_for(&config, Some(&state)).expect("plan");
        let create = position(&plan, OperationKind::Replace, "n");
        let delete = position(&plan, OperationKind::DeleteReplaced, "n");
        assert!(create < delete);
        assert_eq!(plan.operations[delete].provider_id.as_deref(), Some("vpc-1"));
    }

    #[test]
    fn test_conflicting_identity_deletes_first() {
        let config = stack(vec![
            ResourceConfig::new("r", KIND_ROLE)
                .with_property("name", json!("new-name"))
                .with_property("assume_role_policy", json!({})),
        ]);
        let mut state = StackState::new("elk", "dev");
        state.set_resource(ResourceState::new(
            "r",
            KIND_ROLE,
            "role-1",
            json!({"name": "old-name", "assume_role_policy": {}}),
            "h",
        ));

        let plan = plan_for(&config, Some(&state)).expect("plan");
        let create = position(&plan, OperationKind::Replace, "r");
        let delete = position(&plan, OperationKind::DeleteReplaced, "r");
        assert!(delete < create);
        assert_eq!(plan.operations[create].depends_on, vec![delete]);
    }

    #[test]
    fn test_delete_first_replacement_removes_old_dependents_first() {
        // c's identity conflicts and both n and c are replaced
        let config = stack(vec![
            ResourceConfig::new("n", KIND_NETWORK).with_property("cidr", json!("10.1.0.0/16")),
            ResourceConfig::new("c", KIND_CLUSTER)
                .with_property("name", json!("new-cluster"))
                .with_property("vpc_id", json!("${n.id}")),
            ResourceConfig::new("ng", KIND_NODE_GROUP)
                .with_property("name", json!("ng"))
                .with_property("cluster", json!("${c.name}"))
                .with_property("instance_type", json!("t2.small")),
        ]);
        let mut state = StackState::new("elk", "dev");
        state.set_resource(ResourceState::new(
            "n",
            KIND_NETWORK,
            "vpc-1",
            json!({"cidr": "10.0.0.0/16"}),
            "h",
        ));
        state.set_resource(
            ResourceState::new(
                "c",
                KIND_CLUSTER,
                "eks-1",
                json!({"name": "old-cluster", "vpc_id": "vpc-1"}),
                "h",
            )
            .with_dependencies(vec![String::from("n")]),
        );
        state.set_resource(
            ResourceState::new(
                "ng",
                KIND_NODE_GROUP,
                "ng-1",
                json!({"name": "ng", "cluster": "old-cluster", "instance_type": "t2.micro"}),
                "h",
            )
            .with_dependencies(vec![String::from("c")]),
        );

        let plan = plan_for(&config, Some(&state)).expect("plan");

        let old_ng = position(&plan, OperationKind::DeleteReplaced, "ng");
        let old_c = position(&plan, OperationKind::DeleteReplaced, "c");
        let new_c = position(&plan, OperationKind::Replace, "c");
        let new_ng = position(&plan, OperationKind::Replace, "ng");
        assert!(old_ng < old_c);
        assert!(old_c < new_c);
        assert!(new_c < new_ng);
        assert!(plan.operations[old_c].depends_on.contains(&old_ng));
        assert!(plan.operations[new_ng].reason.contains("delete before create"));
    }

    #[test]
    fn test_pending_deletes_are_planned() {
        let config = stack(vec![ResourceConfig::new("n", KIND_NETWORK)]);
        let mut state = StackState::new("elk", "dev");
        state.set_resource(ResourceState::new("n", KIND_NETWORK, "vpc-2", json!({}), "h"));
        state.add_pending_delete(PendingDelete {
            name: String::from("n"),
            kind: String::from(KIND_NETWORK),
            provider_id: String::from("vpc-1"),
            replaced_at: Utc::now(),
        });

        let plan = plan_for(&config, Some(&state)).expect("plan");
        assert_eq!(plan.operation_count(), 1);
        assert_eq!(plan.operations[0].kind, OperationKind::DeleteReplaced);
        assert_eq!(plan.operations[0].provider_id.as_deref(), Some("vpc-1"));
    }

    #[test]
    fn test_guardrails() {
        let mut state = StackState::new("elk", "dev");
        state.set_resource(recorded("a", KIND_NETWORK, "vpc-a", &[]));
        state.set_resource(recorded("b", KIND_NETWORK, "vpc-b", &[]));

        let mut config = stack(Vec::new());
        config.guardrails = Some(GuardrailsConfig {
            max_deletes: Some(1),
            allow_replace: true,
        });
        let plan = plan_for(&config, Some(&state)).expect("plan");
        assert!(!plan.passes_guardrails);
        assert!(plan.ensure_guardrails().is_err());

        let mut protected = ResourceConfig::new("a", KIND_NETWORK).with_property("cidr", json!("x"));
        protected.protect = true;
        let mut state = StackState::new("elk", "dev");
        state.set_resource(ResourceState::new("a", KIND_NETWORK, "vpc-a", json!({"cidr": "y"}), "h"));
        let plan = plan_for(&stack(vec![protected]), Some(&state)).expect("plan");
        assert_eq!(plan.guardrail_violations.len(), 1);
        assert!(plan.guardrail_violations[0].contains("protected"));
    }

    #[test]
    fn test_transitive_dependents() {
        let plan = plan_for(&stack(nrc()), None).expect("plan");
        let deps = plan.transitive_dependents(0);
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }
}
