//! Resource kind schemas.
//!
//! A schema tells the validator which properties a kind needs and tells the
//! planner which property changes force a replacement.

use serde::Serialize;

/// Network kind tag.
pub const KIND_NETWORK: &str = "network";
/// IAM role kind tag.
pub const KIND_ROLE: &str = "role";
/// Instance profile kind tag.
pub const KIND_INSTANCE_PROFILE: &str = "instance-profile";
/// Managed Kubernetes cluster kind tag.
pub const KIND_CLUSTER: &str = "cluster";
/// Worker node group kind tag.
pub const KIND_NODE_GROUP: &str = "node-group";
/// Chart release kind tag.
pub const KIND_PACKAGE_RELEASE: &str = "package-release";
/// Legacy chart deployment kind tag.
pub const KIND_CHART_DEPLOYMENT: &str = "chart-deployment";

/// Description of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindSchema {
    /// Kind tag.
    pub kind: String,
    /// Properties that must be declared.
    pub required: Vec<String>,
    /// Properties whose change forces delete + recreate.
    pub replace_on_change: Vec<String>,
    /// Outputs the provider reports after apply.
    pub outputs: Vec<String>,
    /// Old and new instances cannot coexist, so replacements delete first.
    pub conflicting_identity: bool,
}

impl KindSchema {
    /// Creates an empty schema for a kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required: Vec::new(),
            replace_on_change: Vec::new(),
            outputs: vec![String::from("id")],
            conflicting_identity: false,
        }
    }

    /// Sets the required properties.
    #[must_use]
    pub fn with_required(mut self, props: &[&str]) -> Self {
        self.required = props.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Sets the properties that force a replacement.
    #[must_use]
    pub fn with_replace_on_change(mut self, props: &[&str]) -> Self {
        self.replace_on_change = props.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Adds declared outputs (`id` is always present).
    #[must_use]
    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs
            .extend(outputs.iter().map(|o| (*o).to_string()));
        self
    }

    /// Marks the kind as having a conflicting identity.
    #[must_use]
    pub const fn with_conflicting_identity(mut self) -> Self {
        self.conflicting_identity = true;
        self
    }

    /// Returns true if a change to `property` forces a replacement.
    #[must_use]
    pub fn requires_replace(&self, property: &str) -> bool {
        self.replace_on_change.iter().any(|p| p == property)
    }

    /// Returns true if the kind declares `output`.
    #[must_use]
    pub fn declares_output(&self, output: &str) -> bool {
        self.outputs.iter().any(|o| o == output)
    }
}

/// Schemas for the built-in kinds.
#[must_use]
pub fn builtin_schemas() -> Vec<KindSchema> {
    vec![
        KindSchema::new(KIND_NETWORK)
            .with_replace_on_change(&["cidr", "default"])
            .with_outputs(&["private_subnet_ids", "public_subnet_ids", "cidr"]),
        KindSchema::new(KIND_ROLE)
            .with_required(&["name", "assume_role_policy"])
            .with_replace_on_change(&["name"])
            .with_outputs(&["arn", "name"])
            .with_conflicting_identity(),
        KindSchema::new(KIND_INSTANCE_PROFILE)
            .with_required(&["name", "role"])
            .with_replace_on_change(&["name"])
            .with_outputs(&["arn", "name"])
            .with_conflicting_identity(),
        KindSchema::new(KIND_CLUSTER)
            .with_required(&["name", "vpc_id", "subnet_ids"])
            .with_replace_on_change(&["name", "vpc_id", "subnet_ids"])
            .with_outputs(&["name", "endpoint", "kubeconfig", "certificate_authority"])
            .with_conflicting_identity(),
        KindSchema::new(KIND_NODE_GROUP)
            .with_required(&["cluster", "instance_type", "instance_profile"])
            .with_replace_on_change(&["cluster", "instance_type", "ami_id", "instance_profile"])
            .with_outputs(&["name", "autoscaling_group"]),
        KindSchema::new(KIND_PACKAGE_RELEASE)
            .with_required(&["chart", "repository"])
            .with_replace_on_change(&["chart", "namespace"])
            .with_outputs(&["name", "namespace", "revision", "status"]),
        KindSchema::new(KIND_CHART_DEPLOYMENT)
            .with_required(&["chart", "repository"])
            .with_replace_on_change(&["chart", "namespace"])
            .with_outputs(&["name", "namespace", "status"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_are_unique() {
        let schemas = builtin_schemas();
        let mut kinds: Vec<&str> = schemas.iter().map(|s| s.kind.as_str()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), schemas.len());
    }

    #[test]
    fn test_cluster_version_is_updatable() {
        let cluster = builtin_schemas()
            .into_iter()
            .find(|s| s.kind == KIND_CLUSTER)
            .unwrap();
        assert!(!cluster.requires_replace("version"));
        assert!(cluster.requires_replace("vpc_id"));
        assert!(cluster.declares_output("kubeconfig"));
        assert!(cluster.declares_output("id"));
    }
}
