//! Configuration validation for stack files.
//!
//! This module checks a parsed stack before any graph is built, collecting
//! every error and warning so they can be reported together.

use crate::error::{ConfigError, HalldyllError, Result};
use crate::graph::{NamingContext, PropertyValue};
use crate::provider::{KindSchema, ProviderRegistry, builtin_schemas};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::spec::{
    ExecutorConfig, ProjectConfig, ProviderBackend, ProviderConfig, ResourceConfig, StackConfig,
    StateBackend, StateConfig,
};

/// Validator for stack configurations.
#[derive(Debug)]
pub struct ConfigValidator {
    /// Known kinds and their schemas.
    schemas: BTreeMap<String, KindSchema>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Creates a validator that knows the built-in kinds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schemas: builtin_schemas()
                .into_iter()
                .map(|s| (s.kind.clone(), s))
                .collect(),
        }
    }

    /// Creates a validator that knows every kind of a registry.
    #[must_use]
    pub fn from_registry(registry: &ProviderRegistry) -> Self {
        Self {
            schemas: registry
                .schemas()
                .map(|s| (s.kind.clone(), s.clone()))
                .collect(),
        }
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found; the full list
    /// is available through [`ConfigValidator::collect`].
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.collect(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(HalldyllError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects all errors and warnings without failing.
    #[must_use]
    pub fn collect(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_executor(&config.executor, &mut result);
        self.validate_resources(config, &mut result);
        Self::validate_guardrails(config, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if provider.backend == ProviderBackend::Http {
            match provider.endpoint.as_deref() {
                None | Some("") => result.error(
                    "provider.endpoint",
                    "An endpoint is required when using the http provider",
                ),
                Some(url) if !url.starts_with("https://") && !url.starts_with("http://") => {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{url}' must be an http(s) URL"),
                    );
                }
                Some(url) if url.starts_with("http://") => result.warnings.push(format!(
                    "provider.endpoint: '{url}' is not using TLS; the token is sent in clear"
                )),
                Some(_) => {}
            }
        }

        if provider.request_timeout_secs == 0 {
            result.error(
                "provider.request_timeout_secs",
                "Request timeout must be at least 1 second",
            );
        }
        if provider.poll_interval_ms == 0 {
            result.error(
                "provider.poll_interval_ms",
                "Poll interval must be positive",
            );
        }
    }

    /// Validates executor tuning.
    fn validate_executor(executor: &ExecutorConfig, result: &mut ValidationResult) {
        if executor.concurrency == 0 {
            result.error("executor.concurrency", "Concurrency must be at least 1");
        }
        if executor.concurrency > 64 {
            result.warnings.push(format!(
                "executor.concurrency: {} parallel operations may trip provider rate limits",
                executor.concurrency
            ));
        }
        if executor.max_attempts == 0 {
            result.error("executor.max_attempts", "At least one attempt is required");
        }
        if executor.base_delay_ms > executor.max_delay_ms {
            result.error(
                "executor.base_delay_ms",
                format!(
                    "Base delay ({} ms) exceeds max delay ({} ms)",
                    executor.base_delay_ms, executor.max_delay_ms
                ),
            );
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(&self, config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let declared: BTreeMap<&str, &str> = config
            .resources
            .iter()
            .map(|r| (r.name.as_str(), r.kind.as_str()))
            .collect();
        let naming = NamingContext::new(&config.project.name, &config.project.environment);
        let mut seen_names = HashSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate resource name: {}", resource.name),
                );
            }

            if !is_valid_name(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            match self.schemas.get(&resource.kind) {
                Some(schema) => Self::validate_required(resource, schema, &prefix, result),
                None => result.error(
                    format!("{prefix}.kind"),
                    format!(
                        "Unknown kind '{}'. Known kinds: {}",
                        resource.kind,
                        self.schemas.keys().cloned().collect::<Vec<_>>().join(", ")
                    ),
                ),
            }

            for (j, dep) in resource.depends_on.iter().enumerate() {
                if dep == &resource.name {
                    result.error(
                        format!("{prefix}.depends_on[{j}]"),
                        format!("Resource '{}' cannot depend on itself", resource.name),
                    );
                } else if !declared.contains_key(dep.as_str()) {
                    result.error(
                        format!("{prefix}.depends_on[{j}]"),
                        format!("Unknown dependency '{dep}'"),
                    );
                }
            }

            self.validate_references(resource, &declared, &naming, &prefix, result);
        }
    }

    /// Checks that every required property is declared.
    fn validate_required(
        resource: &ResourceConfig,
        schema: &KindSchema,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        for required in &schema.required {
            if !resource.properties.contains_key(required) {
                result.error(
                    format!("{prefix}.properties.{required}"),
                    format!(
                        "Property '{required}' is required for kind '{}'",
                        schema.kind
                    ),
                );
            }
        }
    }

    /// Checks property placeholders against declared resources and outputs.
    fn validate_references(
        &self,
        resource: &ResourceConfig,
        declared: &BTreeMap<&str, &str>,
        naming: &NamingContext,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        for (key, raw) in &resource.properties {
            let field = format!("{prefix}.properties.{key}");
            let value = match PropertyValue::parse(raw, naming) {
                Ok(value) => value,
                Err(message) => {
                    result.error(field, message);
                    continue;
                }
            };

            for r in value.references() {
                if r.resource == resource.name {
                    result.error(
                        field.clone(),
                        format!("Resource '{}' cannot reference itself", resource.name),
                    );
                    continue;
                }
                let Some(target_kind) = declared.get(r.resource.as_str()) else {
                    result.error(
                        field.clone(),
                        format!("Reference {r} names an unknown resource"),
                    );
                    continue;
                };
                if let Some(schema) = self.schemas.get(*target_kind)
                    && !schema.declares_output(&r.output)
                {
                    result.warnings.push(format!(
                        "{field}: kind '{target_kind}' does not declare output '{}'",
                        r.output
                    ));
                }
            }
        }
    }

    /// Validates guardrails configuration.
    fn validate_guardrails(config: &StackConfig, result: &mut ValidationResult) {
        if let Some(guardrails) = &config.guardrails {
            if guardrails.max_deletes == Some(0) {
                result.warnings.push(String::from(
                    "guardrails.max_deletes is 0: any plan that deletes a resource will be refused",
                ));
            }

            if !guardrails.allow_replace
                && config.executor.replacement
                    == super::spec::ReplacementStrategy::DeleteBeforeCreate
            {
                result.warnings.push(String::from(
                    "executor.replacement has no effect while guardrails.allow_replace is false",
                ));
            }
        }

        let protected = config.resources.iter().filter(|r| r.protect).count();
        if protected > 0 {
            debug!("{protected} protected resource(s) declared");
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
