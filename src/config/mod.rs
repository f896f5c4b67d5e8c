//! Configuration module for Halldyll infrastructure stacks.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `halldyll.infra.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ExecutorConfig, GuardrailsConfig, ProjectConfig, ProviderBackend, ProviderConfig,
    ReplacementStrategy, ResourceConfig, StackConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
