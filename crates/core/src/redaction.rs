//! Secret redaction for events and console output
//!
//! Decrypted secrets travel through the properties bag into stage
//! environments. Every value registered here is replaced with a placeholder
//! before an event or console line leaves the process.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Minimum length for a value to be considered for redaction
const MIN_REDACTION_LENGTH: usize = 4;

/// Replacement text for redacted secrets
pub const REDACTION_PLACEHOLDER: &str = "****";

/// Thread-safe registry of secret values
#[derive(Debug, Clone, Default)]
pub struct SecretRegistry {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl SecretRegistry {
    /// Create a new empty secret registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret value to the registry
    ///
    /// Values shorter than the minimum length are ignored; redacting them would
    /// mangle unrelated output.
    pub fn add_secret(&self, secret: &str) {
        if secret.len() < MIN_REDACTION_LENGTH {
            return;
        }
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(secret.to_string());
        }
    }

    /// Add multiple secrets to the registry
    pub fn add_secrets<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for secret in secrets {
            self.add_secret(secret.as_ref());
        }
    }

    /// Replace every registered secret in `text`
    ///
    /// Longer secrets are replaced first so a secret containing another secret
    /// is not partially revealed.
    pub fn redact_text(&self, text: &str) -> String {
        let Ok(inner) = self.inner.read() else {
            return text.to_string();
        };
        let mut secrets: Vec<&String> = inner.iter().collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut redacted = text.to_string();
        for secret in secrets {
            if redacted.contains(secret.as_str()) {
                redacted = redacted.replace(secret.as_str(), REDACTION_PLACEHOLDER);
            }
        }
        redacted
    }

    /// Number of registered secrets
    pub fn secret_count(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }
}

/// Configuration for redaction behavior
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    /// Whether redaction is enabled
    pub enabled: bool,
    /// Registry consulted when enabled
    pub registry: SecretRegistry,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            registry: SecretRegistry::new(),
        }
    }
}

impl RedactionConfig {
    /// Redaction switched off (debugging only)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            registry: SecretRegistry::new(),
        }
    }

    /// Enabled redaction backed by an existing registry
    pub fn with_registry(registry: SecretRegistry) -> Self {
        Self {
            enabled: true,
            registry,
        }
    }

    /// Redact `text` if enabled
    pub fn redact(&self, text: &str) -> String {
        if self.enabled {
            self.registry.redact_text(text)
        } else {
            text.to_string()
        }
    }

    /// Redact every string inside a JSON value in place
    pub fn redact_json(&self, value: &mut serde_json::Value) {
        if !self.enabled {
            return;
        }
        match value {
            serde_json::Value::String(s) => *s = self.registry.redact_text(s),
            serde_json::Value::Array(items) => {
                for item in items {
                    self.redact_json(item);
                }
            }
            serde_json::Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.redact_json(item);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_registered_secret() {
        let registry = SecretRegistry::new();
        registry.add_secret("hunter22");
        let config = RedactionConfig::with_registry(registry);
        assert_eq!(
            config.redact("export DB_PASS=hunter22"),
            "export DB_PASS=****"
        );
    }

    #[test]
    fn test_short_values_ignored() {
        let registry = SecretRegistry::new();
        registry.add_secret("ab");
        assert_eq!(registry.secret_count(), 0);
        assert_eq!(registry.redact_text("ab cd"), "ab cd");
    }

    #[test]
    fn test_longest_secret_wins() {
        let registry = SecretRegistry::new();
        registry.add_secrets(["token", "token-extended"]);
        assert_eq!(registry.redact_text("x token-extended y"), "x **** y");
    }

    #[test]
    fn test_disabled_passes_through() {
        let config = RedactionConfig::disabled();
        config.registry.add_secret("hunter22");
        assert_eq!(config.redact("hunter22"), "hunter22");
    }

    #[test]
    fn test_redact_json_nested() {
        let registry = SecretRegistry::new();
        registry.add_secret("s3cr3t-value");
        let config = RedactionConfig::with_registry(registry);
        let mut value = json!({
            "command": "deploy --key s3cr3t-value",
            "env": ["A=s3cr3t-value"],
            "exit_code": 1
        });
        config.redact_json(&mut value);
        assert_eq!(value["command"], "deploy --key ****");
        assert_eq!(value["env"][0], "A=****");
        assert_eq!(value["exit_code"], 1);
    }
}
