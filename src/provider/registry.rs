//! Schema registry mapping kind tags to schemas and providers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ConfigParser, ProviderBackend, ProviderConfig};
use crate::error::{ConfigError, HalldyllError, ProviderError, Result};

use super::api::{Provider, ProviderResult};
use super::http::HttpProvider;
use super::schema::{KindSchema, builtin_schemas};
use super::simulated::SimulatedProvider;

struct RegisteredKind {
    schema: KindSchema,
    provider: Arc<dyn Provider>,
}

/// Registry of resource kinds.
///
/// Adding a kind means registering a schema and a provider; nothing else in
/// the engine changes.
#[derive(Default)]
pub struct ProviderRegistry {
    kinds: BTreeMap<String, RegisteredKind>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.kinds
                    .iter()
                    .map(|(kind, entry)| (kind, entry.provider.name())),
            )
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry serving every built-in kind with one provider.
    #[must_use]
    pub fn with_builtin_kinds(provider: Arc<dyn Provider>) -> Self {
        let mut registry = Self::new();
        for schema in builtin_schemas() {
            registry.register(schema, Arc::clone(&provider));
        }
        registry
    }

    /// Builds the registry described by the provider configuration.
    ///
    /// The simulated backend keeps its objects in `simulated_dir` when one is
    /// given, so consecutive runs against the same stack share one cloud.
    ///
    /// # Errors
    ///
    /// Returns an error if the http backend has no endpoint or its client
    /// cannot be created.
    pub fn from_config(config: &ProviderConfig, simulated_dir: Option<&Path>) -> Result<Self> {
        let provider: Arc<dyn Provider> = match config.backend {
            ProviderBackend::Simulated => {
                let simulated =
                    SimulatedProvider::new().with_long_running(config.simulate_long_running);
                Arc::new(match simulated_dir {
                    Some(dir) => simulated.with_persistence(dir),
                    None => simulated,
                })
            }
            ProviderBackend::Http => {
                let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                    HalldyllError::Config(ConfigError::validation(
                        "provider.endpoint is required for the http backend",
                        "provider.endpoint",
                    ))
                })?;
                let token = ConfigParser::get_provider_token().ok();
                if token.is_none() {
                    debug!("HALLDYLL_PROVIDER_TOKEN not set, calling gateway anonymously");
                }
                Arc::new(HttpProvider::new(
                    endpoint,
                    token,
                    config.request_timeout_secs,
                )?)
            }
        };

        info!("Using {} provider", provider.name());
        Ok(Self::with_builtin_kinds(provider))
    }

    /// Registers (or replaces) a kind.
    pub fn register(&mut self, schema: KindSchema, provider: Arc<dyn Provider>) {
        debug!("Registering kind '{}' with {} provider", schema.kind, provider.name());
        self.kinds
            .insert(schema.kind.clone(), RegisteredKind { schema, provider });
    }

    /// Looks up the schema for a kind.
    #[must_use]
    pub fn schema(&self, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(kind).map(|entry| &entry.schema)
    }

    /// Looks up the provider for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnsupportedKind`] for unregistered kinds.
    pub fn provider(&self, kind: &str) -> ProviderResult<Arc<dyn Provider>> {
        self.kinds
            .get(kind)
            .map(|entry| Arc::clone(&entry.provider))
            .ok_or_else(|| ProviderError::UnsupportedKind {
                kind: kind.to_string(),
            })
    }

    /// All registered schemas in kind order.
    pub fn schemas(&self) -> impl Iterator<Item = &KindSchema> {
        self.kinds.values().map(|entry| &entry.schema)
    }

    /// Returns true if the kind is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }
}
