//! Resource graph construction and ordering.
//!
//! Edges point from a dependency to its dependent, so a topological walk
//! visits every resource after the resources it needs.

use crate::config::{ResourceConfig, StackConfig};
use crate::error::{GraphError, HalldyllError, Result};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Control, DfsEvent, Reversed, depth_first_search};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use super::value::{NamingContext, OutputRef, PropertyValue, ResolveError};

/// Why one resource depends on another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeKind {
    /// Declared in `depends_on`.
    Explicit,
    /// A property reads this output.
    Output(String),
}

/// An edge from a dependent resource to one of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    /// Dependency name.
    pub target: String,
    /// How the dependency was introduced.
    pub via: EdgeKind,
}

/// A declared resource after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Logical name.
    pub name: String,
    /// Kind tag.
    pub kind: String,
    /// Parsed input properties.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Edges to the resources this one depends on.
    pub edges: Vec<Edge>,
    /// Never delete or replace.
    pub protect: bool,
}

/// Directed acyclic graph of declared resources.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    graph: DiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
    nodes: BTreeMap<String, ResourceNode>,
    exports: BTreeMap<String, PropertyValue>,
    naming: NamingContext,
}

impl ResourceNode {
    /// Returns the names of the resources this node depends on, sorted.
    #[must_use]
    pub fn dependency_names(&self) -> BTreeSet<&str> {
        self.edges.iter().map(|e| e.target.as_str()).collect()
    }

    /// Resolves all properties into a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Unresolved`] when a referenced output is not
    /// available and [`GraphError::InvalidProperty`] on shape mismatches.
    pub fn resolve_inputs<F>(&self, lookup: &F) -> Result<Value>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        let mut inputs = serde_json::Map::new();
        for (key, value) in &self.properties {
            let resolved = value.resolve(lookup).map_err(|e| match e {
                ResolveError::Unknown(r) => GraphError::Unresolved {
                    resource: self.name.clone(),
                    target: r.resource,
                    output: r.output,
                },
                ResolveError::Invalid(message) => GraphError::InvalidProperty {
                    resource: self.name.clone(),
                    property: key.clone(),
                    message,
                },
            })?;
            inputs.insert(key.clone(), resolved);
        }
        Ok(Value::Object(inputs))
    }
}

impl ResourceGraph {
    /// Builds the graph for a stack, using its project and environment as
    /// naming variables.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] on duplicate names, malformed or dangling
    /// references, or a dependency cycle.
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        let naming = NamingContext::new(&config.project.name, &config.project.environment);
        Self::build(naming, &config.resources, &config.exports)
    }

    /// Builds the graph from declarations.
    ///
    /// # Errors
    ///
    /// See [`ResourceGraph::from_config`].
    pub fn build(
        naming: NamingContext,
        resources: &[ResourceConfig],
        exports: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for decl in resources {
            if nodes.contains_key(&decl.name) {
                return Err(GraphError::DuplicateName {
                    name: decl.name.clone(),
                }
                .into());
            }
            let node = parse_node(decl, &naming)?;
            nodes.insert(decl.name.clone(), node);
        }

        for node in nodes.values() {
            for edge in &node.edges {
                if !nodes.contains_key(&edge.target) {
                    return Err(GraphError::UnknownReference {
                        from: node.name.clone(),
                        target: edge.target.clone(),
                    }
                    .into());
                }
            }
        }

        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();
        for name in nodes.keys() {
            let idx = graph.add_node(name.clone());
            index_map.insert(name.clone(), idx);
        }
        for node in nodes.values() {
            let to = index_map[&node.name];
            for target in node.dependency_names() {
                graph.add_edge(index_map[target], to, ());
            }
        }

        let mut parsed_exports = BTreeMap::new();
        for (key, raw) in exports {
            let value = PropertyValue::parse(raw, &naming).map_err(|message| {
                GraphError::InvalidProperty {
                    resource: String::from("exports"),
                    property: key.clone(),
                    message,
                }
            })?;
            for r in value.references() {
                if !nodes.contains_key(&r.resource) {
                    return Err(GraphError::UnknownReference {
                        from: String::from("exports"),
                        target: r.resource.clone(),
                    }
                    .into());
                }
            }
            parsed_exports.insert(key.clone(), value);
        }

        let built = Self {
            graph,
            index_map,
            nodes,
            exports: parsed_exports,
            naming,
        };
        built.check_acyclic()?;

        debug!(
            "Built resource graph with {} nodes and {} edges",
            built.graph.node_count(),
            built.graph.edge_count()
        );
        Ok(built)
    }

    /// Depth-first search for a back edge; reports the first cycle found.
    fn check_acyclic(&self) -> Result<()> {
        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        let mut stack: Vec<NodeIndex> = Vec::new();
        let outcome = depth_first_search(&self.graph, starts, |event| match event {
            DfsEvent::Discover(n, _) => {
                stack.push(n);
                Control::Continue
            }
            DfsEvent::Finish(_, _) => {
                stack.pop();
                Control::Continue
            }
            DfsEvent::BackEdge(_, v) => {
                let start = stack.iter().position(|n| *n == v).unwrap_or(0);
                let mut cycle: Vec<NodeIndex> = stack[start..].to_vec();
                cycle.push(v);
                Control::Break(cycle)
            }
            DfsEvent::TreeEdge(_, _) | DfsEvent::CrossForwardEdge(_, _) => Control::Continue,
        });

        if let Control::Break(cycle) = outcome {
            // edges run dependency -> dependent; report as "depends on" chain
            let path = cycle
                .iter()
                .rev()
                .map(|idx| self.graph[*idx].clone())
                .collect();
            return Err(HalldyllError::Graph(GraphError::Cycle { path }));
        }
        Ok(())
    }

    /// Returns every resource name, dependencies first.
    ///
    /// Ties among ready resources are broken lexicographically so the order
    /// is stable across runs.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(idx, _)| self.graph[*idx].as_str())
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            let idx = self.index_map[name];
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(self.graph[next].as_str());
                    }
                }
            }
        }
        order
    }

    /// Groups resources into levels; each level only depends on earlier ones.
    #[must_use]
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        for name in self.topological_order() {
            let level = self
                .dependencies(&name)
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            if let Some(key) = self.nodes.get_key_value(&name).map(|(k, _)| k.as_str()) {
                depth.insert(key, level);
            }
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        for (name, level) in depth {
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(name.to_string());
        }
        levels
    }

    /// Direct dependencies of a resource, sorted.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct dependents of a resource, sorted.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.index_map.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|i| self.graph[i].clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Every resource that depends on `name`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let Some(&idx) = self.index_map.get(name) else {
            return BTreeSet::new();
        };
        let mut out = BTreeSet::new();
        let mut bfs = Bfs::new(&self.graph, idx);
        while let Some(next) = bfs.next(&self.graph) {
            if next != idx {
                out.insert(self.graph[next].clone());
            }
        }
        out
    }

    /// Every resource `name` depends on, directly or transitively.
    #[must_use]
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        let Some(&idx) = self.index_map.get(name) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut out = BTreeSet::new();
        let mut bfs = Bfs::new(reversed, idx);
        while let Some(next) = bfs.next(reversed) {
            if next != idx {
                out.insert(self.graph[next].clone());
            }
        }
        out
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.get(name)
    }

    /// Iterates nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Returns true if a resource with this name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Parsed stack exports.
    #[must_use]
    pub const fn exports(&self) -> &BTreeMap<String, PropertyValue> {
        &self.exports
    }

    /// Naming variables the graph was built with.
    #[must_use]
    pub const fn naming(&self) -> &NamingContext {
        &self.naming
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no resources are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

fn parse_node(decl: &ResourceConfig, naming: &NamingContext) -> Result<ResourceNode> {
    let mut properties = BTreeMap::new();
    let mut edges = BTreeSet::new();

    for (key, raw) in &decl.properties {
        let value = PropertyValue::parse(raw, naming).map_err(|message| {
            GraphError::InvalidProperty {
                resource: decl.name.clone(),
                property: key.clone(),
                message,
            }
        })?;
        for r in value.references() {
            edges.insert(Edge {
                target: r.resource.clone(),
                via: EdgeKind::Output(r.output.clone()),
            });
        }
        properties.insert(key.clone(), value);
    }

    for dep in &decl.depends_on {
        edges.insert(Edge {
            target: dep.clone(),
            via: EdgeKind::Explicit,
        });
    }

    Ok(ResourceNode {
        name: decl.name.clone(),
        kind: decl.kind.clone(),
        properties,
        edges: edges.into_iter().collect(),
        protect: decl.protect,
    })
}
