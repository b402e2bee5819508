//! Agent settings
//!
//! Settings come from a TOML file, located in this order:
//!
//! 1. an explicit path (`--config`)
//! 2. `RIGGER_CONFIG`
//! 3. `rigger.toml` in the platform config directory
//!
//! An explicit path that does not exist is an error; a missing default file
//! yields built-in defaults. `RIGGER_WORKSPACE_ROOT`, `RIGGER_ARTIFACT_DIR`
//! and `RIGGER_JOB_DIR` override the matching paths afterwards.
//!
//! ```toml
//! workspace_root = "/var/lib/rigger/work"
//!
//! [docker]
//! default_image = "debian:bookworm"
//! registry_alias = { from = "easy", to = "registry.internal:5000" }
//! dns_hosts = ["db.internal=10.0.0.5"]
//!
//! [docker.allowed_images]
//! "easy/php" = ["8.2", "8.3"]
//!
//! [[credentials]]
//! username = "deploy"
//! server = "*"
//! key = "/etc/rigger/deploy_ed25519"
//! ```

use crate::credentials::{Credential, CredentialStore};
use crate::docker::{DriverTimeouts, HostEntry};
use crate::errors::ConfigError;
use crate::image::RegistryAlias;
use crate::session::{SessionKey, SshOptions};
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Environment variable naming the settings file
pub const CONFIG_ENV: &str = "RIGGER_CONFIG";

/// Settings file name in the platform config directory
pub const CONFIG_FILE_NAME: &str = "rigger.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "rigger", "rigger")
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".rigger"))
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("rigger")
}

fn default_artifact_dir() -> PathBuf {
    data_dir().join("artifacts")
}

fn default_job_dir() -> PathBuf {
    data_dir().join("jobs")
}

/// Top-level agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Parent of per-job workspaces
    pub workspace_root: PathBuf,
    /// Stored build artifacts
    pub artifact_dir: PathBuf,
    /// Job documents
    pub job_dir: PathBuf,
    /// JSON-lines event log; events are only kept in memory when unset
    pub event_log: Option<PathBuf>,
    /// Decrypted `KEY=VALUE` secrets
    pub secrets_file: Option<PathBuf>,
    /// `git` binary used to download sources
    pub git_path: String,
    pub docker: DockerSettings,
    pub windows: WindowsSettings,
    pub ssh: SshSettings,
    pub credentials: Vec<Credential>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            artifact_dir: default_artifact_dir(),
            job_dir: default_job_dir(),
            event_log: None,
            secrets_file: None,
            git_path: "git".to_string(),
            docker: DockerSettings::default(),
            windows: WindowsSettings::default(),
            ssh: SshSettings::default(),
            credentials: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSettings {
    pub docker_path: String,
    /// Image used when the application names none
    pub default_image: String,
    pub registry_alias: Option<RegistryAlias>,
    /// Repository to allowed tags; empty allows every image
    pub allowed_images: BTreeMap<String, Vec<String>>,
    /// Manual `name=ip` entries added to every container
    pub dns_hosts: Vec<String>,
    pub internal_timeout_secs: u64,
    pub build_step_timeout_secs: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        let timeouts = DriverTimeouts::default();
        Self {
            docker_path: "docker".to_string(),
            default_image: "debian:bookworm".to_string(),
            registry_alias: None,
            allowed_images: BTreeMap::new(),
            dns_hosts: Vec::new(),
            internal_timeout_secs: timeouts.internal.as_secs(),
            build_step_timeout_secs: timeouts.build_step.as_secs(),
        }
    }
}

impl DockerSettings {
    pub fn timeouts(&self) -> DriverTimeouts {
        DriverTimeouts {
            internal: Duration::from_secs(self.internal_timeout_secs),
            build_step: Duration::from_secs(self.build_step_timeout_secs),
        }
    }

    /// Parsed DNS entries; a malformed entry is an error
    pub fn host_entries(&self) -> Result<Vec<HostEntry>, ConfigError> {
        HostEntry::parse_all(&self.dns_hosts)
    }
}

/// How PowerShell batches reach the Windows builder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowsTransport {
    /// Cloud command service (`aws ssm send-command`)
    #[default]
    Ssm,
    /// PowerShell over the SSH session
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowsSettings {
    pub transport: WindowsTransport,
    /// Cloud instance id of the builder (ssm transport)
    pub instance_id: Option<String>,
    /// SSH host of the builder; also used to stage archives
    pub builder_host: Option<String>,
    pub builder_user: String,
    /// Directory on the builder receiving archives
    pub staging_dir: String,
    pub aws_path: String,
    pub region: Option<String>,
}

impl Default for WindowsSettings {
    fn default() -> Self {
        Self {
            transport: WindowsTransport::default(),
            instance_id: None,
            builder_host: None,
            builder_user: "Administrator".to_string(),
            staging_dir: "c:\\rigger\\staging".to_string(),
            aws_path: "aws".to_string(),
            region: None,
        }
    }
}

impl WindowsSettings {
    /// Whether enough is configured to build on Windows
    pub fn is_configured(&self) -> bool {
        self.builder_host.is_some()
            && (self.transport == WindowsTransport::Ssh || self.instance_id.is_some())
    }

    /// SSH identity of the builder
    pub fn builder_key(&self) -> Option<SessionKey> {
        self.builder_host
            .as_ref()
            .map(|host| SessionKey::new(self.builder_user.clone(), host.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    pub ssh_path: String,
    pub scp_path: String,
    pub sshpass_path: String,
    pub rsync_path: String,
    /// Directory for control sockets; system temp dir when unset
    pub control_dir: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_path: "ssh".to_string(),
            scp_path: "scp".to_string(),
            sshpass_path: "sshpass".to_string(),
            rsync_path: "rsync".to_string(),
            control_dir: None,
            connect_timeout_secs: 30,
        }
    }
}

impl SshSettings {
    pub fn options(&self) -> SshOptions {
        let defaults = SshOptions::default();
        SshOptions {
            ssh_path: self.ssh_path.clone(),
            scp_path: self.scp_path.clone(),
            sshpass_path: self.sshpass_path.clone(),
            control_dir: self.control_dir.clone().unwrap_or(defaults.control_dir),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

impl Settings {
    /// Parse TOML text and validate it
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text).map_err(|e| ConfigError::Parsing {
            message: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Locate, read and validate settings, then apply environment overrides
    #[instrument]
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match Self::locate(explicit)? {
            Some(path) => {
                debug!("Loading settings from {}", path.display());
                let text = std::fs::read_to_string(&path)?;
                Self::parse(&text)?
            }
            None => {
                debug!("No settings file found, using defaults");
                Self::default()
            }
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
        let required = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = required {
            if !path.is_file() {
                return Err(ConfigError::NotFound {
                    path: path.display().to_string(),
                });
            }
            return Ok(Some(path));
        }
        Ok(project_dirs()
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.is_file()))
    }

    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut PathBuf); 3] = [
            ("RIGGER_WORKSPACE_ROOT", &mut self.workspace_root),
            ("RIGGER_ARTIFACT_DIR", &mut self.artifact_dir),
            ("RIGGER_JOB_DIR", &mut self.job_dir),
        ];
        for (name, slot) in overrides {
            if let Some(value) = std::env::var_os(name).filter(|v| !v.is_empty()) {
                debug!("{} overrides {}", name, slot.display());
                *slot = PathBuf::from(value);
            }
        }
    }

    /// Reject settings that would only fail later, mid-job
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.docker.host_entries()?;
        if self.docker.internal_timeout_secs == 0 || self.docker.build_step_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                message: "docker timeouts must be greater than zero".to_string(),
            });
        }
        for (repo, tags) in &self.docker.allowed_images {
            if tags.is_empty() {
                return Err(ConfigError::Validation {
                    message: format!("docker.allowed_images.\"{}\" lists no tags", repo),
                });
            }
        }
        if let Some(credential) = self.credentials.iter().find(|c| !c.has_secret()) {
            return Err(ConfigError::Validation {
                message: format!(
                    "credential for {}@{} has neither key nor password",
                    credential.username, credential.server
                ),
            });
        }
        Ok(())
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(self.credentials.clone())
    }
}
