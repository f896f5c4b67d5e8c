//! Resource graph.
//!
//! Declared resources become nodes of a DAG. Property references
//! (`${resource.output}`) and explicit `depends_on` entries become edges.

mod builder;
mod value;

pub use builder::{Edge, EdgeKind, ResourceGraph, ResourceNode};
pub use value::{NamingContext, OutputRef, PropertyValue, ResolveError, Segment};
