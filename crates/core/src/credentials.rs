//! SSH credential lookup
//!
//! A credential matches a connection when the username is equal and the
//! server is either equal or the wildcard `*`. Exact-server entries win over
//! wildcard entries regardless of declaration order.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server value matching every host
pub const WILDCARD_SERVER: &str = "*";

/// One configured credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(default = "wildcard")]
    pub server: String,
    /// Private key file
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Password, used through `sshpass` when no key is set
    #[serde(default)]
    pub password: Option<String>,
}

fn wildcard() -> String {
    WILDCARD_SERVER.to_string()
}

impl Credential {
    pub fn with_key(username: &str, server: &str, key: impl Into<PathBuf>) -> Self {
        Self {
            username: username.to_string(),
            server: server.to_string(),
            key: Some(key.into()),
            password: None,
        }
    }

    pub fn with_password(username: &str, server: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            server: server.to_string(),
            key: None,
            password: Some(password.to_string()),
        }
    }

    /// Whether key or password material is present
    pub fn has_secret(&self) -> bool {
        self.key.is_some() || self.password.is_some()
    }
}

/// Ordered set of credentials
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    credentials: Vec<Credential>,
}

impl CredentialStore {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Best credential for `username` on `server`
    pub fn resolve(&self, username: &str, server: &str) -> Option<&Credential> {
        let mut candidates = self.credentials.iter().filter(|c| c.username == username);
        let exact = candidates.clone().find(|c| c.server == server);
        exact.or_else(|| candidates.find(|c| c.server == WILDCARD_SERVER))
    }

    /// Every configured password, for the redaction registry
    pub fn passwords(&self) -> impl Iterator<Item = &str> {
        self.credentials
            .iter()
            .filter_map(|c| c.password.as_deref())
    }
}
