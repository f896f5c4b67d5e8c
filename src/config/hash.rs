//! Configuration hashing for change detection.
//!
//! Hashes are computed over canonical JSON (object keys sorted), so two
//! declarations that differ only in key order hash the same.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::spec::StackConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole stack declaration.
    ///
    /// Executor tuning is excluded; it changes how a stack is applied, not
    /// what it declares.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        for resource in resources {
            hasher.update(resource.name.as_bytes());
            hasher.update(resource.kind.as_bytes());
            for (key, value) in &resource.properties {
                hasher.update(key.as_bytes());
                hasher.update(canonical_json(value).as_bytes());
            }
            let mut deps = resource.depends_on.clone();
            deps.sort();
            for dep in deps {
                hasher.update(dep.as_bytes());
            }
            hasher.update(if resource.protect { [1u8] } else { [0u8] });
        }

        for (key, value) in &config.exports {
            hasher.update(key.as_bytes());
            hasher.update(canonical_json(value).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a resource's resolved inputs.
    #[must_use]
    pub fn hash_inputs(&self, kind: &str, inputs: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(canonical_json(inputs).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Serializes a value with object keys in sorted order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}
