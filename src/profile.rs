//! Built-in deployment profiles.
//!
//! A profile is a ready-made stack for the logging cluster: network, node
//! roles and instance profiles, a managed cluster, two worker node groups and
//! the Elasticsearch, Kibana and Metricbeat chart releases. The two profiles
//! differ in where the cluster lives and how the charts are installed.

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::{
    ExecutorConfig, ProjectConfig, ProviderConfig, ResourceConfig, StackConfig, StateConfig,
};
use crate::error::{ConfigError, HalldyllError, Result};
use crate::provider::{
    KIND_CHART_DEPLOYMENT, KIND_CLUSTER, KIND_INSTANCE_PROFILE, KIND_NETWORK, KIND_NODE_GROUP,
    KIND_PACKAGE_RELEASE, KIND_ROLE,
};

/// Kubernetes version the cluster is created with.
const CLUSTER_VERSION: &str = "1.22";

/// Worker node image.
const NODE_AMI: &str = "ami-0e0b320630373ee54";

/// Chart repository for every release.
const ELASTIC_REPOSITORY: &str = "https://helm.elastic.co";

/// Number of node roles, each paired with an instance profile.
const NODE_ROLE_COUNT: usize = 3;

/// Control plane log types shipped by the cluster.
const CLUSTER_LOG_TYPES: [&str; 5] = [
    "api",
    "audit",
    "authenticator",
    "controllerManager",
    "scheduler",
];

/// Policies attached to every node role.
const NODE_ROLE_POLICIES: [&str; 3] = [
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
];

/// A built-in stack topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// Cluster in the account's shared default network, charts installed as
    /// package releases.
    DefaultVpc,
    /// Cluster in a dedicated network, charts installed through the older
    /// chart deployment mechanism.
    DedicatedVpc,
}

impl Profile {
    /// Every built-in profile.
    pub const ALL: [Self; 2] = [Self::DefaultVpc, Self::DedicatedVpc];

    /// Returns the profile's name as used on the command line.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DefaultVpc => "default-vpc",
            Self::DedicatedVpc => "dedicated-vpc",
        }
    }

    /// Returns a one-line description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::DefaultVpc => "shared default network, package releases",
            Self::DedicatedVpc => "dedicated network, chart deployments",
        }
    }

    /// Kind used for the chart releases.
    const fn release_kind(self) -> &'static str {
        match self {
            Self::DefaultVpc => KIND_PACKAGE_RELEASE,
            Self::DedicatedVpc => KIND_CHART_DEPLOYMENT,
        }
    }

    /// Builds the full stack for a project.
    #[must_use]
    pub fn stack(self, project: &str, environment: &str) -> StackConfig {
        let mut resources = vec![self.network()];

        for index in 1..=NODE_ROLE_COUNT {
            resources.push(node_role(index));
        }
        for index in 1..=NODE_ROLE_COUNT {
            resources.push(instance_profile(index));
        }

        resources.push(cluster());
        resources.push(node_group("ng-micro", "t2.micro", 1));
        resources.push(node_group("ng-small", "t2.small", 2));

        resources.push(self.release("elastic", "elasticsearch", None));
        resources.push(self.release("kibana", "kibana", Some("7.x")));
        resources.push(self.release("metricbeat", "metricbeat", Some("7.x")));

        let exports = BTreeMap::from([
            (String::from("kubeconfig"), json!("${cluster.kubeconfig}")),
            (String::from("cluster_name"), json!("${cluster.name}")),
            (String::from("vpc_id"), json!("${network.id}")),
            (String::from("all_subnet_ids"), all_subnets()),
        ]);

        StackConfig {
            project: ProjectConfig {
                name: project.to_string(),
                environment: environment.to_string(),
                profile: Some(self.name().to_string()),
            },
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            executor: ExecutorConfig::default(),
            guardrails: None,
            resources,
            exports,
        }
    }

    /// Renders the stack as a YAML stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render(self, project: &str, environment: &str) -> Result<String> {
        let stack = self.stack(project, environment);
        let body = serde_yaml::to_string(&stack)
            .map_err(|e| HalldyllError::Internal(format!("Failed to render profile: {e}")))?;

        Ok(format!(
            "# Halldyll stack ({} profile: {})\n{body}",
            self.name(),
            self.description()
        ))
    }

    fn network(self) -> ResourceConfig {
        let network = ResourceConfig::new("network", KIND_NETWORK);
        match self {
            Self::DefaultVpc => network.with_property("default", json!(true)),
            Self::DedicatedVpc => network
                .with_property("cidr", json!("10.0.0.0/16"))
                .with_property("name", json!("${project}-vpc"))
                .with_property("availability_zones", json!(2)),
        }
    }

    fn release(self, name: &str, chart: &str, version: Option<&str>) -> ResourceConfig {
        let mut release = ResourceConfig::new(name, self.release_kind())
            .with_property("name", json!(name))
            .with_property("chart", json!(chart))
            .with_property("repository", json!(ELASTIC_REPOSITORY))
            .with_property("namespace", json!("default"))
            .with_property("cluster", json!("${cluster.name}"))
            .with_dependency("cluster");

        if let Some(version) = version {
            release = release.with_property("version", json!(version));
        }
        release
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Profile {
    type Err = HalldyllError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| {
                HalldyllError::Config(ConfigError::UnknownProfile {
                    name: s.to_string(),
                })
            })
    }
}

fn node_role(index: usize) -> ResourceConfig {
    ResourceConfig::new(format!("role-{index}"), KIND_ROLE)
        .with_property("name", json!(format!("${{project}}-role-{index}")))
        .with_property(
            "assume_role_policy",
            json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Action": "sts:AssumeRole",
                    "Effect": "Allow",
                    "Principal": { "Service": "ec2.amazonaws.com" }
                }]
            }),
        )
        .with_property("managed_policy_arns", json!(NODE_ROLE_POLICIES))
}

fn instance_profile(index: usize) -> ResourceConfig {
    ResourceConfig::new(format!("instance-profile-{index}"), KIND_INSTANCE_PROFILE)
        .with_property(
            "name",
            json!(format!("${{project}}-instance-profile-{index}")),
        )
        .with_property("role", json!(format!("${{role-{index}.name}}")))
}

fn cluster() -> ResourceConfig {
    let instance_roles: Vec<String> = (1..=NODE_ROLE_COUNT)
        .map(|index| format!("${{role-{index}.arn}}"))
        .collect();

    ResourceConfig::new("cluster", KIND_CLUSTER)
        .with_property("name", json!("${project}"))
        .with_property("version", json!(CLUSTER_VERSION))
        .with_property("vpc_id", json!("${network.id}"))
        .with_property("subnet_ids", all_subnets())
        .with_property("node_associate_public_ip_address", json!(false))
        .with_property("skip_default_node_group", json!(true))
        .with_property("deploy_dashboard", json!(false))
        .with_property("instance_roles", json!(instance_roles))
        .with_property("enabled_log_types", json!(CLUSTER_LOG_TYPES))
}

fn node_group(name: &str, instance_type: &str, profile_index: usize) -> ResourceConfig {
    ResourceConfig::new(name, KIND_NODE_GROUP)
        .with_property("name", json!(format!("${{project}}-{name}")))
        .with_property("cluster", json!("${cluster.name}"))
        .with_property("instance_type", json!(instance_type))
        .with_property("ami_id", json!(NODE_AMI))
        .with_property("desired_capacity", json!(2))
        .with_property(
            "instance_profile",
            json!(format!("${{instance-profile-{profile_index}.name}}")),
        )
}

fn all_subnets() -> Value {
    json!({ "$concat": ["${network.private_subnet_ids}", "${network.public_subnet_ids}"] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, ConfigValidator};
    use crate::graph::ResourceGraph;
    use crate::planner::{ApplyExecutor, DiffEngine, OperationKind, Plan};
    use crate::provider::{ProviderRegistry, SimulatedProvider};
    use crate::state::{LocalStateStore, StackOperation, StackState};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_profile_parsing() {
        assert_eq!("default-vpc".parse::<Profile>().unwrap(), Profile::DefaultVpc);
        assert_eq!(
            "dedicated-vpc".parse::<Profile>().unwrap(),
            Profile::DedicatedVpc
        );

        let err = "custom-vpc".parse::<Profile>().unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::Config(ConfigError::UnknownProfile { ref name }) if name == "custom-vpc"
        ));
    }

    #[test]
    fn test_profiles_validate() {
        let validator = ConfigValidator::new();
        for profile in Profile::ALL {
            let stack = profile.stack("elk", "dev");
            let result = validator.collect(&stack);
            assert!(result.errors.is_empty(), "{profile}: {:?}", result.errors);
        }
    }

    #[test]
    fn test_release_kind_follows_profile() {
        let default = Profile::DefaultVpc.stack("elk", "dev");
        let dedicated = Profile::DedicatedVpc.stack("elk", "dev");

        assert_eq!(
            default.resource("kibana").unwrap().kind,
            KIND_PACKAGE_RELEASE
        );
        assert_eq!(
            dedicated.resource("kibana").unwrap().kind,
            KIND_CHART_DEPLOYMENT
        );
        assert!(dedicated.resource("network").unwrap().properties.contains_key("cidr"));
    }

    #[test]
    fn test_profile_graph_order() {
        let stack = Profile::DefaultVpc.stack("elk", "dev");
        let graph = ResourceGraph::from_config(&stack).unwrap();

        assert_eq!(graph.len(), 13);

        let order = graph.topological_order();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();

        assert!(position("network") < position("cluster"));
        assert!(position("role-3") < position("cluster"));
        assert!(position("role-1") < position("instance-profile-1"));
        assert!(position("cluster") < position("ng-micro"));
        assert!(position("instance-profile-2") < position("ng-small"));
        assert!(position("cluster") < position("metricbeat"));

        assert_eq!(
            graph.dependencies("cluster"),
            vec!["network", "role-1", "role-2", "role-3"]
        );
    }

    #[test]
    fn test_render_round_trips_through_parser() {
        let yaml = Profile::DedicatedVpc.render("elk", "staging").unwrap();
        assert!(yaml.starts_with("# Halldyll stack (dedicated-vpc"));

        let parsed = ConfigParser::new().parse_yaml(&yaml, None).unwrap();
        assert_eq!(parsed, Profile::DedicatedVpc.stack("elk", "staging"));
    }

    #[tokio::test]
    async fn test_profile_applies_on_simulated_provider() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::for_stack(dir.path(), "elk-dev");
        let provider = Arc::new(SimulatedProvider::new());
        let registry = ProviderRegistry::with_builtin_kinds(provider.clone());

        let stack = Profile::DefaultVpc.stack("elk", "dev");
        let graph = ResourceGraph::from_config(&stack).unwrap();
        let mut state = StackState::new("elk", "dev");

        let diff = DiffEngine::new(&registry)
            .compute_diff(&graph, Some(&state))
            .unwrap();
        let plan = Plan::from_diff(&diff, &graph, Some(&state), &registry, &stack, "h").unwrap();
        assert_eq!(plan.count(OperationKind::Create), 13);

        let executor_config = ExecutorConfig {
            base_delay_ms: 1,
            ..ExecutorConfig::default()
        };
        let report = ApplyExecutor::new(&registry, &store, &executor_config, &stack.provider)
            .execute(&plan, &graph, &mut state, StackOperation::Apply)
            .await
            .unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(provider.object_count().await.unwrap(), 13);
        assert_eq!(report.exports["cluster_name"], json!("elk"));
        assert_eq!(
            report.exports["all_subnet_ids"].as_array().map(Vec::len),
            Some(4)
        );

        let node_group = state.resources.get("ng-small").unwrap();
        assert_eq!(node_group.inputs["name"], json!("elk-ng-small"));
        assert_eq!(
            node_group.inputs["instance_profile"],
            json!("elk-instance-profile-2")
        );
    }
}
