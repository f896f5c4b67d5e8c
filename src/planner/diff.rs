//! Diff engine for comparing the desired graph with the applied snapshot.
//!
//! Inputs are previewed by resolving placeholders against the snapshot.
//! Outputs of a dependency that is about to be created or replaced are not
//! known yet, so any property reading them counts as changed.

use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use crate::error::{GraphError, HalldyllError, Result};
use crate::graph::{OutputRef, ResolveError, ResourceGraph, ResourceNode};
use crate::provider::ProviderRegistry;
use crate::state::{ResourceState, StackState};

/// Rendering of a value that is only known after apply.
pub const UNKNOWN_VALUE: &str = "(known after apply)";

/// Engine for computing diffs between the desired graph and the snapshot.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    /// Schemas deciding which property changes force a replacement.
    registry: &'a ProviderRegistry,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Declared kind, or the recorded kind for deletes.
    pub kind: String,
    /// Recorded kind when it differs from the declared one.
    pub old_kind: Option<String>,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Why this resource changes.
    pub reason: String,
    /// Property-level differences.
    pub details: Vec<DiffDetail>,
    /// Provider id of the recorded instance.
    pub provider_id: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be deleted and recreated.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Property that differs.
    pub field: String,
    /// Recorded value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
    /// Whether this change alone forces a replacement.
    pub forces_replace: bool,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Diffs in dependency order, deletes last.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
    /// Set when every recorded resource is being torn down.
    pub destroy: bool,
}

impl<'a> DiffEngine<'a> {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes the diff between the desired graph and the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidProperty`] when a property cannot be
    /// previewed because a recorded output has the wrong shape.
    pub fn compute_diff(
        &self,
        graph: &ResourceGraph,
        state: Option<&StackState>,
    ) -> Result<DiffResult> {
        let mut diffs = Vec::new();
        // resources whose outputs are unknown until apply
        let mut pending: HashSet<String> = HashSet::new();

        for name in graph.topological_order() {
            let Some(node) = graph.node(&name) else {
                continue;
            };
            let prior = state.and_then(|s| s.get_resource(&name));
            let diff = self.diff_resource(node, prior, state, &pending)?;
            if matches!(diff.diff_type, DiffType::Create | DiffType::Replace) {
                pending.insert(name);
            }
            diffs.push(diff);
        }

        if let Some(state) = state {
            for recorded in state.resources.values() {
                if !graph.contains(&recorded.name) {
                    debug!("Resource {} removed from configuration", recorded.name);
                    diffs.push(Self::delete_diff(
                        recorded,
                        "Resource removed from configuration",
                    ));
                }
            }
        }

        Ok(DiffResult::from_diffs(diffs, false))
    }

    /// Computes a diff that deletes every recorded resource.
    #[must_use]
    pub fn compute_destroy(&self, state: &StackState) -> DiffResult {
        let diffs = state
            .resources
            .values()
            .map(|recorded| Self::delete_diff(recorded, "Stack destroyed"))
            .collect();
        DiffResult::from_diffs(diffs, true)
    }

    fn diff_resource(
        &self,
        node: &ResourceNode,
        prior: Option<&ResourceState>,
        state: Option<&StackState>,
        pending: &HashSet<String>,
    ) -> Result<ResourceDiff> {
        let lookup = |r: &OutputRef| -> Option<Value> {
            if pending.contains(&r.resource) {
                return None;
            }
            state.and_then(|s| s.output(&r.resource, &r.output)).cloned()
        };

        let Some(prior) = prior else {
            debug!("Resource {} needs to be created", node.name);
            let mut details = Vec::new();
            for (field, value) in &node.properties {
                let preview = preview(node, field, value.resolve(&lookup))?;
                details.push(DiffDetail {
                    field: field.clone(),
                    old_value: None,
                    new_value: Some(preview.unwrap_or_else(|| UNKNOWN_VALUE.to_string())),
                    forces_replace: false,
                });
            }
            return Ok(ResourceDiff {
                name: node.name.clone(),
                kind: node.kind.clone(),
                old_kind: None,
                diff_type: DiffType::Create,
                reason: String::from("Resource defined in configuration"),
                details,
                provider_id: None,
            });
        };

        if prior.kind != node.kind {
            debug!(
                "Resource {} changes kind {} -> {}",
                node.name, prior.kind, node.kind
            );
            return Ok(ResourceDiff {
                name: node.name.clone(),
                kind: node.kind.clone(),
                old_kind: Some(prior.kind.clone()),
                diff_type: DiffType::Replace,
                reason: format!("Kind changed from {} to {}", prior.kind, node.kind),
                details: vec![DiffDetail {
                    field: String::from("kind"),
                    old_value: Some(prior.kind.clone()),
                    new_value: Some(node.kind.clone()),
                    forces_replace: true,
                }],
                provider_id: Some(prior.provider_id.clone()),
            });
        }

        let schema = self.registry.schema(&node.kind);
        let recorded = prior.inputs.as_object();
        let mut details = Vec::new();

        for (field, value) in &node.properties {
            let old = recorded.and_then(|m| m.get(field));
            let resolved = value.resolve(&lookup);
            if let (Ok(new), Some(old)) = (&resolved, old)
                && new == old
            {
                continue;
            }
            let new = preview(node, field, resolved)?;
            details.push(DiffDetail {
                field: field.clone(),
                old_value: old.map(render),
                new_value: Some(new.unwrap_or_else(|| UNKNOWN_VALUE.to_string())),
                forces_replace: schema.is_some_and(|s| s.requires_replace(field)),
            });
        }

        if let Some(recorded) = recorded {
            for (field, old) in recorded {
                if !node.properties.contains_key(field) {
                    details.push(DiffDetail {
                        field: field.clone(),
                        old_value: Some(render(old)),
                        new_value: None,
                        forces_replace: schema.is_some_and(|s| s.requires_replace(field)),
                    });
                }
            }
        }

        let (diff_type, reason) = if details.is_empty() {
            debug!("Resource {} is up to date", node.name);
            (DiffType::NoChange, String::new())
        } else if let Some(field) = details.iter().find(|d| d.forces_replace) {
            (
                DiffType::Replace,
                format!("Changing '{}' requires replacement", field.field),
            )
        } else {
            let fields: Vec<&str> = details.iter().map(|d| d.field.as_str()).collect();
            (
                DiffType::Update,
                format!("Updating {}", fields.join(", ")),
            )
        };
        debug!("Resource {}: {diff_type}", node.name);

        Ok(ResourceDiff {
            name: node.name.clone(),
            kind: node.kind.clone(),
            old_kind: None,
            diff_type,
            reason,
            details,
            provider_id: Some(prior.provider_id.clone()),
        })
    }

    fn delete_diff(recorded: &ResourceState, reason: &str) -> ResourceDiff {
        ResourceDiff {
            name: recorded.name.clone(),
            kind: recorded.kind.clone(),
            old_kind: None,
            diff_type: DiffType::Delete,
            reason: reason.to_string(),
            details: vec![DiffDetail {
                field: String::from("id"),
                old_value: Some(recorded.provider_id.clone()),
                new_value: None,
                forces_replace: false,
            }],
            provider_id: Some(recorded.provider_id.clone()),
        }
    }
}

/// Renders a previewed value; `None` when it depends on unknown outputs.
fn preview(
    node: &ResourceNode,
    field: &str,
    resolved: std::result::Result<Value, ResolveError>,
) -> Result<Option<String>> {
    match resolved {
        Ok(value) => Ok(Some(render(&value))),
        Err(ResolveError::Unknown(_)) => Ok(None),
        Err(ResolveError::Invalid(message)) => {
            Err(HalldyllError::Graph(GraphError::InvalidProperty {
                resource: node.name.clone(),
                property: field.to_string(),
                message,
            }))
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl DiffResult {
    fn from_diffs(diffs: Vec<ResourceDiff>, destroy: bool) -> Self {
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        Self {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            destroy,
            diffs,
        }
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Looks up the diff for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::graph::NamingContext;
    use crate::provider::{KIND_CLUSTER, KIND_NETWORK, SimulatedProvider};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::with_builtin_kinds(Arc::new(SimulatedProvider::new()))
    }

    fn graph(resources: &[ResourceConfig]) -> ResourceGraph {
        ResourceGraph::build(
            NamingContext::new("elk", "dev"),
            resources,
            &BTreeMap::new(),
        )
        .expect("graph builds")
    }

    fn declared() -> Vec<ResourceConfig> {
        vec![
            ResourceConfig::new("network", KIND_NETWORK).with_property("cidr", json!("10.0.0.0/16")),
            ResourceConfig::new("cluster", KIND_CLUSTER)
                .with_property("name", json!("${project}-cluster"))
                .with_property("vpc_id", json!("${network.id}"))
                .with_property("subnet_ids", json!("${network.private_subnet_ids}"))
                .with_property("version", json!("1.22")),
        ]
    }

    fn applied() -> StackState {
        let mut state = StackState::new("elk", "dev");
        let mut net_out = BTreeMap::new();
        net_out.insert(String::from("id"), json!("vpc-1"));
        net_out.insert(String::from("private_subnet_ids"), json!(["s-1", "s-2"]));
        state.set_resource(
            ResourceState::new("network", KIND_NETWORK, "vpc-1", json!({"cidr": "10.0.0.0/16"}), "h")
                .with_outputs(net_out),
        );
        state.set_resource(
            ResourceState::new(
                "cluster",
                KIND_CLUSTER,
                "eks-1",
                json!({
                    "name": "elk-cluster",
                    "vpc_id": "vpc-1",
                    "subnet_ids": ["s-1", "s-2"],
                    "version": "1.22"
                }),
                "h",
            )
            .with_dependencies(vec![String::from("network")]),
        );
        state
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let registry = registry();
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph(&declared()), None)
            .expect("diff");

        assert_eq!(diff.creates, 2);
        let cluster = diff.get("cluster").expect("cluster diff");
        let vpc = cluster
            .details
            .iter()
            .find(|d| d.field == "vpc_id")
            .expect("vpc detail");
        assert_eq!(vpc.new_value.as_deref(), Some(UNKNOWN_VALUE));
    }

    #[test]
    fn test_matching_snapshot_has_no_changes() {
        let registry = registry();
        let state = applied();
        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph(&declared()), Some(&state))
            .expect("diff");

        assert!(!diff.has_changes());
        assert_eq!(diff.unchanged, 2);
    }

    #[test]
    fn test_version_change_is_in_place_update() {
        let registry = registry();
        let state = applied();
        let mut resources = declared();
        resources[1] = resources[1].clone().with_property("version", json!("1.23"));

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph(&resources), Some(&state))
            .expect("diff");

        assert_eq!(diff.total_changes(), 1);
        let cluster = diff.get("cluster").expect("cluster diff");
        assert_eq!(cluster.diff_type, DiffType::Update);
        assert_eq!(cluster.details[0].old_value.as_deref(), Some("1.22"));
        assert_eq!(cluster.details[0].new_value.as_deref(), Some("1.23"));
    }

    #[test]
    fn test_replaced_dependency_makes_references_unknown() {
        let registry = registry();
        let state = applied();
        let mut resources = declared();
        resources[0] = resources[0].clone().with_property("cidr", json!("10.1.0.0/16"));

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph(&resources), Some(&state))
            .expect("diff");

        assert_eq!(diff.get("network").map(|d| d.diff_type), Some(DiffType::Replace));
        // vpc_id is replace-on-change for clusters
        assert_eq!(diff.get("cluster").map(|d| d.diff_type), Some(DiffType::Replace));
    }

    #[test]
    fn test_kind_change_is_replace() {
        let registry = registry();
        let mut state = applied();
        state.remove_resource("cluster");
        let mut recorded = state.get_resource("network").cloned().expect("network");
        recorded.kind = String::from("role");
        state.set_resource(recorded);

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph(&declared()[..1]), Some(&state))
            .expect("diff");

        let network = diff.get("network").expect("network diff");
        assert_eq!(network.diff_type, DiffType::Replace);
        assert_eq!(network.old_kind.as_deref(), Some("role"));
    }

    #[test]
    fn test_removed_resources_are_deleted() {
        let registry = registry();
        let state = applied();

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph(&declared()[..1]), Some(&state))
            .expect("diff");

        assert_eq!(diff.deletes, 1);
        let cluster = diff.get("cluster").expect("cluster diff");
        assert_eq!(cluster.provider_id.as_deref(), Some("eks-1"));
    }

    #[test]
    fn test_destroy_deletes_everything() {
        let registry = registry();
        let diff = DiffEngine::new(&registry).compute_destroy(&applied());
        assert!(diff.destroy);
        assert_eq!(diff.deletes, 2);
    }
}
