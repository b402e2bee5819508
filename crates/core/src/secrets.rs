//! Decrypted secrets
//!
//! Decryption happens outside the agent. What reaches us is a plain
//! `KEY=VALUE` file:
//!
//! ```text
//! # Database credentials
//! DB_PASSWORD=my-secret-password
//!
//! API_KEY=abc123xyz
//! ```
//!
//! Blank lines and `#` comments are ignored, values are taken literally and
//! later files win on conflicting keys. Every value is registered for
//! redaction as soon as it is loaded.

use crate::command::is_env_name;
use crate::errors::ConfigError;
use crate::redaction::SecretRegistry;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, instrument, warn};

/// Secrets exported into every stage environment
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: BTreeMap<String, String>,
}

impl Secrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every existing file in order, registering values with `registry`
    ///
    /// Missing files are skipped with a warning.
    #[instrument(skip_all)]
    pub fn load<P: AsRef<Path>>(
        paths: &[P],
        registry: &SecretRegistry,
    ) -> Result<Self, ConfigError> {
        let mut secrets = Self::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                warn!("Secrets file not found: {}", path.display());
                continue;
            }
            let content = std::fs::read_to_string(path)?;
            let parsed = parse(&content, &path.display().to_string());
            if let Some(name) = parsed.keys().find(|name| !is_env_name(name)) {
                return Err(ConfigError::Validation {
                    message: format!(
                        "{}: {:?} is not a valid variable name",
                        path.display(),
                        name
                    ),
                });
            }
            debug!("Loaded {} secrets from {}", parsed.len(), path.display());
            secrets.values.extend(parsed);
        }
        registry.add_secrets(secrets.values.values());
        Ok(secrets)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Key names only, safe to log
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.values
    }
}

/// Parse `KEY=VALUE` lines; `origin` names the source in warnings
pub fn parse(content: &str, origin: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
            Some(_) => warn!("Empty key at {}:{}", origin, index + 1),
            None => warn!(
                "Invalid line at {}:{} (expected KEY=VALUE)",
                origin,
                index + 1
            ),
        }
    }
    values
}
