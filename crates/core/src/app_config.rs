//! Per-application configuration (`.rigger.yml`)
//!
//! ```yaml
//! platform: linux
//! image: node:20
//! env:
//!   NODE_ENV: production
//! dist: build
//! exclude: [node_modules]
//! build:
//!   - npm ci
//!   - npm run build
//! deploy: ./bin/deploy
//! ```
//!
//! Each stage key takes a single command or a list. An absent or null key
//! means the stage is skipped.

use crate::command::is_env_name;
use crate::errors::ConfigError;
use crate::job::{DeployTarget, StageConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File names looked up at the source root, in order
pub const APP_CONFIG_FILES: &[&str] = &[".rigger.yml", ".rigger.yaml"];

/// Platform used when the application does not name one
pub const DEFAULT_PLATFORM: &str = "linux";

/// Named stages configurable per application
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Build,
    BuildTransform,
    BeforeDeploy,
    Deploy,
    AfterDeploy,
}

impl Stage {
    /// Configuration key and stage name
    pub fn key(self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::BuildTransform => "build_transform",
            Stage::BeforeDeploy => "before_deploy",
            Stage::Deploy => "deploy",
            Stage::AfterDeploy => "after_deploy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum StepList {
    One(String),
    Many(Vec<String>),
}

impl StepList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StepList::One(step) => vec![step],
            StepList::Many(steps) => steps,
        }
    }
}

/// Parsed `.rigger.yml`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub dist: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    build: Option<StepList>,
    #[serde(default)]
    build_transform: Option<StepList>,
    #[serde(default)]
    before_deploy: Option<StepList>,
    #[serde(default)]
    deploy: Option<StepList>,
    #[serde(default)]
    after_deploy: Option<StepList>,
}

impl AppConfig {
    /// Parse YAML text
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parsing {
            message: e.to_string(),
        })
    }

    /// Path of the config file under `source_root`, if any
    pub fn locate(source_root: &Path) -> Option<PathBuf> {
        APP_CONFIG_FILES
            .iter()
            .map(|name| source_root.join(name))
            .find(|path| path.is_file())
    }

    /// Load from `source_root`; defaults when no file exists
    pub fn load(source_root: &Path) -> Result<Self, ConfigError> {
        match Self::locate(source_root) {
            Some(path) => {
                debug!("Reading application config {}", path.display());
                let text = std::fs::read_to_string(&path)?;
                Self::parse(&text)
            }
            None => {
                debug!(
                    "No application config in {}, using defaults",
                    source_root.display()
                );
                Ok(Self::default())
            }
        }
    }

    /// Configured platform or [`DEFAULT_PLATFORM`]
    pub fn platform(&self) -> &str {
        self.platform.as_deref().unwrap_or(DEFAULT_PLATFORM)
    }

    /// Environment with scalar values rendered as strings
    pub fn env_vars(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        self.env
            .iter()
            .map(|(name, value)| {
                if !is_env_name(name) {
                    return Err(ConfigError::Validation {
                        message: format!("env.{} is not a valid variable name", name),
                    });
                }
                let rendered = match value {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    serde_yaml::Value::Null => String::new(),
                    _ => {
                        return Err(ConfigError::Validation {
                            message: format!("env.{} must be a scalar value", name),
                        })
                    }
                };
                Ok((name.clone(), rendered))
            })
            .collect()
    }

    /// Steps for `stage`; `None` when the stage is not configured
    pub fn steps(&self, stage: Stage) -> Option<Vec<String>> {
        let list = match stage {
            Stage::Build => &self.build,
            Stage::BuildTransform => &self.build_transform,
            Stage::BeforeDeploy => &self.before_deploy,
            Stage::Deploy => &self.deploy,
            Stage::AfterDeploy => &self.after_deploy,
        };
        list.clone().map(StepList::into_vec)
    }

    /// Full stage configuration handed to a platform
    pub fn stage_config(
        &self,
        stage: Stage,
        default_image: Option<&str>,
        target: Option<DeployTarget>,
    ) -> Result<StageConfig, ConfigError> {
        Ok(StageConfig {
            image: self
                .image
                .clone()
                .or_else(|| default_image.map(str::to_string)),
            steps: self.steps(stage).unwrap_or_default(),
            env: self.env_vars()?,
            dist: self.dist.clone().unwrap_or_else(|| ".".to_string()),
            exclude: self.exclude.clone(),
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::parse(
            r#"
platform: windows
image: mcr.microsoft.com/dotnet/sdk:8.0
env:
  CONFIGURATION: Release
  RETRIES: 3
  VERBOSE: true
dist: out
exclude: [".git", "obj"]
build:
  - dotnet restore
  - dotnet publish -o out
deploy: ./deploy.ps1
after_deploy: ~
"#,
        )
        .unwrap();

        assert_eq!(config.platform(), "windows");
        assert_eq!(
            config.steps(Stage::Build).unwrap(),
            vec!["dotnet restore", "dotnet publish -o out"]
        );
        assert_eq!(config.steps(Stage::Deploy).unwrap(), vec!["./deploy.ps1"]);
        assert_eq!(config.steps(Stage::AfterDeploy), None);
        assert_eq!(config.steps(Stage::BeforeDeploy), None);

        let env = config.env_vars().unwrap();
        assert_eq!(env["RETRIES"], "3");
        assert_eq!(env["VERBOSE"], "true");
    }

    #[test]
    fn test_defaults_when_missing() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig::load(temp.path()).unwrap();
        assert_eq!(config.platform(), "linux");
        let stage = config
            .stage_config(Stage::Build, Some("debian:stable"), None)
            .unwrap();
        assert_eq!(stage.image.as_deref(), Some("debian:stable"));
        assert!(stage.steps.is_empty());
        assert_eq!(stage.dist, ".");
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".rigger.yml"), "image: node:20\nbuild: npm test\n").unwrap();
        let config = AppConfig::load(temp.path()).unwrap();
        assert_eq!(config.image.as_deref(), Some("node:20"));
        assert_eq!(config.steps(Stage::Build).unwrap(), vec!["npm test"]);
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            AppConfig::parse("build: [unclosed"),
            Err(ConfigError::Parsing { .. })
        ));
        assert!(matches!(
            AppConfig::parse("bulid: make"),
            Err(ConfigError::Parsing { .. })
        ));
    }

    #[test]
    fn test_invalid_env_name_rejected() {
        let config = AppConfig::parse("env:\n  \"A; touch /tmp/x; B\": 1\n").unwrap();
        assert!(matches!(
            config.env_vars(),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_nested_env_rejected() {
        let config = AppConfig::parse("env:\n  A:\n    nested: 1\n").unwrap();
        assert!(matches!(
            config.env_vars(),
            Err(ConfigError::Validation { .. })
        ));
    }
}
