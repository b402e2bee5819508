//! Docker image validation
//!
//! Requested images are first rewritten from the friendly registry alias to
//! the real private registry host. With no allow-list every image is
//! accepted as rewritten; with an allow-list, `repo:tag` must match a listed
//! tag or the `*` wildcard for that repo.
//!
//! Duplicate repo entries in the allow-list are merged: the allowed tags are
//! the union of every entry for that repo.

use crate::events::EventLog;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Tag assumed when none is given
pub const DEFAULT_TAG: &str = "latest";

/// Tag entry allowing every tag of a repo
pub const WILDCARD_TAG: &str = "*";

/// Alias registry prefix and its real host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAlias {
    pub from: String,
    pub to: String,
}

/// Split an image reference into repository and tag
///
/// A colon only separates a tag when it appears after the last `/`, so
/// `registry:5000/app` has no tag. Digests (`@sha256:...`) are kept as the tag.
pub fn split_image(image: &str) -> (String, String) {
    if let Some((repo, digest)) = image.split_once('@') {
        return (repo.to_string(), digest.to_string());
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(pos) => {
            let split = name_start + pos;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), DEFAULT_TAG.to_string()),
    }
}

/// Join a repository and a tag or digest back into a reference
///
/// Tags never contain `:`, digests always do (`sha256:...`).
pub fn join_image(repo: &str, tag: &str) -> String {
    if tag.contains(':') {
        format!("{}@{}", repo, tag)
    } else {
        format!("{}:{}", repo, tag)
    }
}

/// Validates and rewrites requested images
#[derive(Debug, Clone)]
pub struct ImageValidator {
    alias: Option<RegistryAlias>,
    allowed: BTreeMap<String, BTreeSet<String>>,
    events: EventLog,
}

impl ImageValidator {
    pub fn new(alias: Option<RegistryAlias>, events: EventLog) -> Self {
        Self {
            alias,
            allowed: BTreeMap::new(),
            events,
        }
    }

    /// Allow `tags` for `repo`, merging with earlier entries for the same repo
    pub fn allow<I, S>(mut self, repo: &str, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let repo = self.rewrite(repo);
        self.allowed
            .entry(repo)
            .or_default()
            .extend(tags.into_iter().map(Into::into));
        self
    }

    /// Allow every `(repo, tags)` entry
    pub fn with_allow_list<'a, I>(self, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Vec<String>)>,
    {
        entries
            .into_iter()
            .fold(self, |validator, (repo, tags)| validator.allow(repo, tags.iter().cloned()))
    }

    /// Whether an allow-list is configured
    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Replace the alias registry prefix with the real host
    pub fn rewrite(&self, image: &str) -> String {
        if let Some(alias) = &self.alias {
            if image == alias.from {
                return alias.to.clone();
            }
            if let Some(rest) = image.strip_prefix(&format!("{}/", alias.from)) {
                return format!("{}/{}", alias.to, rest);
            }
        }
        image.to_string()
    }

    /// Every allowed `repo:tag` combination
    pub fn allowed_combinations(&self) -> Vec<String> {
        self.allowed
            .iter()
            .flat_map(|(repo, tags)| tags.iter().map(move |tag| join_image(repo, tag)))
            .collect()
    }

    /// Resolve `requested` to the image to run, or `None` if not allowed
    ///
    /// `None` means stop the build; never fall back to the requested name.
    pub fn validate(&self, requested: &str) -> Option<String> {
        let rewritten = self.rewrite(requested);
        if !self.is_restricted() {
            debug!("No image allow-list configured, using {}", rewritten);
            return Some(rewritten);
        }

        let (repo, tag) = split_image(&rewritten);
        let candidate = join_image(&repo, &tag);
        let accepted = self
            .allowed
            .get(&repo)
            .is_some_and(|tags| tags.contains(&tag) || tags.contains(WILDCARD_TAG));

        if accepted {
            debug!("Image {} allowed as {}", requested, candidate);
            Some(candidate)
        } else {
            self.events.failure(
                &format!("Docker image {} is not allowed", candidate),
                json!({
                    "requested": requested,
                    "candidate": candidate,
                    "allowed": self.allowed_combinations(),
                }),
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias() -> Option<RegistryAlias> {
        Some(RegistryAlias {
            from: "easy".to_string(),
            to: "registry.internal:5000".to_string(),
        })
    }

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("myapp"), ("myapp".into(), "latest".into()));
        assert_eq!(split_image("myapp:v2"), ("myapp".into(), "v2".into()));
        assert_eq!(
            split_image("registry:5000/team/app"),
            ("registry:5000/team/app".into(), "latest".into())
        );
        assert_eq!(
            split_image("registry:5000/team/app:1.0"),
            ("registry:5000/team/app".into(), "1.0".into())
        );
        assert_eq!(
            split_image("app@sha256:abc"),
            ("app".into(), "sha256:abc".into())
        );
    }

    #[test]
    fn test_digest_references_keep_at_form() {
        let validator = ImageValidator::new(None, EventLog::silent())
            .allow("app", ["*"])
            .allow("pinned", ["sha256:abc"]);
        assert_eq!(
            validator.validate("app@sha256:abc"),
            Some("app@sha256:abc".to_string())
        );
        assert_eq!(
            validator.validate("pinned@sha256:abc"),
            Some("pinned@sha256:abc".to_string())
        );
        assert_eq!(validator.validate("pinned@sha256:def"), None);
        assert!(validator
            .allowed_combinations()
            .contains(&"pinned@sha256:abc".to_string()));
    }

    #[test]
    fn test_no_allow_list_accepts_rewritten() {
        let validator = ImageValidator::new(alias(), EventLog::silent());
        assert_eq!(
            validator.validate("easy/php:8.2"),
            Some("registry.internal:5000/php:8.2".to_string())
        );
        assert_eq!(validator.validate("node"), Some("node".to_string()));
    }

    #[test]
    fn test_wildcard_tag_defaults_to_latest() {
        let validator = ImageValidator::new(None, EventLog::silent()).allow("myapp", ["*"]);
        assert_eq!(validator.validate("myapp"), Some("myapp:latest".to_string()));
    }

    #[test]
    fn test_rejected_tag_logs_allowed_set() {
        let (events, memory) = EventLog::memory();
        let validator = ImageValidator::new(None, events).allow("myapp", ["v1"]);
        assert_eq!(validator.validate("myapp:v2"), None);

        let event = &memory.messages()[0];
        let context = event.context().unwrap();
        assert_eq!(context["requested"], "myapp:v2");
        assert_eq!(context["candidate"], "myapp:v2");
        assert_eq!(context["allowed"], json!(["myapp:v1"]));
    }

    #[test]
    fn test_unknown_repo_rejected() {
        let validator = ImageValidator::new(None, EventLog::silent()).allow("myapp", ["*"]);
        assert_eq!(validator.validate("other:latest"), None);
    }

    #[test]
    fn test_duplicate_entries_union() {
        let validator = ImageValidator::new(None, EventLog::silent())
            .allow("myapp", ["v1"])
            .allow("myapp", ["v2"]);
        assert!(validator.validate("myapp:v1").is_some());
        assert!(validator.validate("myapp:v2").is_some());
        assert_eq!(validator.allowed_combinations(), vec!["myapp:v1", "myapp:v2"]);
    }

    #[test]
    fn test_allow_list_keys_accept_alias_form() {
        let validator = ImageValidator::new(alias(), EventLog::silent()).allow("easy/php", ["8.2"]);
        assert_eq!(
            validator.validate("easy/php:8.2"),
            Some("registry.internal:5000/php:8.2".to_string())
        );
        assert_eq!(
            validator.validate("registry.internal:5000/php:8.2"),
            Some("registry.internal:5000/php:8.2".to_string())
        );
    }
}
