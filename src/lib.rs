// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Infra
//!
//! A declarative convergence engine for cloud infrastructure stacks.
//!
//! ## Overview
//!
//! A stack file declares resources (network, roles, a managed cluster, node
//! groups, chart releases) whose properties may reference each other's
//! outputs. Halldyll turns the declarations into a dependency graph, diffs
//! it against the last recorded snapshot and converges the cloud:
//!
//! - Independent resources are created, updated or deleted in parallel
//! - Dependents wait for their dependencies and are skipped when one fails
//! - Transient provider failures are retried with exponential backoff
//! - The snapshot is persisted atomically after every completed operation
//!
//! ## Architecture
//!
//! 1. **Declarations**: `halldyll.infra.yaml`, or a built-in [`profile`]
//! 2. **Graph**: references and `depends_on` become edges of a DAG
//! 3. **Plan**: create, update, replace and delete operations in dependency order
//! 4. **Apply**: a bounded pool of provider calls driven by the plan
//!
//! ## Modules
//!
//! - [`config`]: Stack parsing, validation and hashing
//! - [`graph`]: Property references and the resource dependency graph
//! - [`provider`]: Provider capability interface and built-in kinds
//! - [`state`]: Snapshot storage backends (local, S3) and locking
//! - [`planner`]: Diff computation, plan ordering and apply execution
//! - [`profile`]: Built-in deployment profiles
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: elk
//!   environment: dev
//!
//! resources:
//!   - name: network
//!     kind: network
//!     properties:
//!       default: true
//!   - name: cluster
//!     kind: cluster
//!     properties:
//!       name: "${project}"
//!       version: "1.22"
//!       vpc_id: "${network.id}"
//!       subnet_ids:
//!         $concat: ["${network.private_subnet_ids}", "${network.public_subnet_ids}"]
//!
//! exports:
//!   kubeconfig: "${cluster.kubeconfig}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod profile;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use error::{HalldyllError, Result};
pub use graph::ResourceGraph;
pub use planner::{ApplyExecutor, ApplyReport, DiffEngine, Plan};
pub use profile::Profile;
pub use provider::{Provider, ProviderRegistry};
pub use state::{LocalStateStore, S3StateStore, StackState, StateStore};
