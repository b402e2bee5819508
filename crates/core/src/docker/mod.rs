//! Container drivers
//!
//! A [`ContainerDriver`] is a thin imperative API over
//! `docker volume/container {create,cp,start,rm}`. The local variant runs the
//! docker CLI as a subprocess; the Windows variant submits PowerShell batches
//! to a remote Docker host. Callers pass the same container and volume names
//! to every lifecycle call; drivers keep no per-container state.
//!
//! Every operation reports a plain `bool` and records failure detail in the
//! event log. Cleanup operations return nothing: a failed removal is logged
//! and can never be folded into the caller's result.

pub mod linux;
pub mod windows;

use crate::errors::ConfigError;
use crate::events::EventLog;
use crate::process::{CommandOutcome, CommandStatus};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use linux::LocalDocker;
pub use windows::{ScriptRunner, SessionScriptRunner, SsmRunner, WindowsDocker};

/// Working directory inside Linux containers
pub const LINUX_WORKDIR: &str = "/workspace";

/// Working directory inside Windows containers
pub const WINDOWS_WORKDIR: &str = "c:\\workspace";

/// Timeout for volume/container create, copy and removal
pub const DEFAULT_INTERNAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for running a user build step
pub const DEFAULT_BUILD_STEP_TIMEOUT: Duration = Duration::from_secs(3600);

/// The two timeout classes applied by drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTimeouts {
    /// Create, copy and cleanup calls
    pub internal: Duration,
    /// User-supplied commands
    pub build_step: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        Self {
            internal: DEFAULT_INTERNAL_TIMEOUT,
            build_step: DEFAULT_BUILD_STEP_TIMEOUT,
        }
    }
}

/// A manual DNS entry (`name=ip`) injected into containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub ip: String,
}

impl HostEntry {
    /// Parse `name=ip`; both sides must be non-empty
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidHostEntry {
            entry: entry.to_string(),
        };
        let (name, ip) = entry.split_once('=').ok_or_else(invalid)?;
        let (name, ip) = (name.trim(), ip.trim());
        if name.is_empty() || ip.is_empty() || name.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            ip: ip.to_string(),
        })
    }

    /// Parse every entry, failing on the first malformed one
    pub fn parse_all<S: AsRef<str>>(entries: &[S]) -> Result<Vec<Self>, ConfigError> {
        entries.iter().map(|e| Self::parse(e.as_ref())).collect()
    }

    /// `--add-host` value
    pub fn add_host_arg(&self) -> String {
        format!("{}:{}", self.name, self.ip)
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub volume: String,
    pub env: BTreeMap<String, String>,
    pub dns_hosts: Vec<HostEntry>,
    /// Initial command; `None` creates an idle container used for copying
    pub command: Option<String>,
}

impl ContainerSpec {
    pub fn new(image: &str, name: &str, volume: &str) -> Self {
        Self {
            image: image.to_string(),
            name: name.to_string(),
            volume: volume.to_string(),
            env: BTreeMap::new(),
            dns_hosts: Vec::new(),
            command: None,
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_dns_hosts(mut self, hosts: Vec<HostEntry>) -> Self {
        self.dns_hosts = hosts;
        self
    }
}

/// Container lifecycle operations shared by all drivers
#[async_trait]
pub trait ContainerDriver: Send + Sync + fmt::Debug {
    /// Fixed working directory inside containers
    fn workdir(&self) -> &'static str;

    async fn create_volume(&self, name: &str) -> bool;

    /// Create (not start) a container
    async fn create_container(&self, spec: &ContainerSpec) -> bool;

    /// Extract a local tar archive into the container's working directory
    async fn copy_into_container(&self, name: &str, archive: &Path) -> bool;

    /// Start a container created with a command and wait for it to finish;
    /// a failed container is left in place until cleanup
    async fn start_user_container(&self, name: &str, command: &str, label: &str) -> bool;

    /// Export the container's working directory as a gzip-tar at `archive`
    async fn copy_from_container(&self, name: &str, archive: &Path) -> bool;

    /// Force-remove a container; never fails the caller
    async fn cleanup_container(&self, name: &str);

    /// Remove a volume; never fails the caller
    async fn cleanup_volume(&self, name: &str);
}

/// A container or volume that may still exist on a Docker host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Container(String),
    Volume(String),
}

#[derive(Debug)]
struct LiveEntry {
    driver: Arc<dyn ContainerDriver>,
    resource: Resource,
}

/// Containers and volumes created by running stages and not yet removed
///
/// Builders track what they create and release it after their own cleanup.
/// Whatever is still tracked when the emergency cleanup fires is removed by
/// [`LiveResources::release_all`]. Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct LiveResources {
    entries: Arc<Mutex<Vec<LiveEntry>>>,
}

impl LiveResources {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<LiveEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn track(&self, driver: &Arc<dyn ContainerDriver>, resource: Resource) {
        self.entries().push(LiveEntry {
            driver: driver.clone(),
            resource,
        });
    }

    /// Stop tracking `resource`; its owner removed it
    pub fn release(&self, resource: &Resource) {
        self.entries().retain(|entry| entry.resource != *resource);
    }

    pub fn tracked(&self) -> Vec<Resource> {
        self.entries().iter().map(|e| e.resource.clone()).collect()
    }

    /// Remove every tracked resource, containers before volumes
    ///
    /// Blocks until done. The driver calls run on a dedicated thread with its
    /// own runtime, so this works from panic hooks, signal handlers and
    /// async code alike.
    pub fn release_all(&self) {
        let mut live = std::mem::take(&mut *self.entries());
        if live.is_empty() {
            return;
        }
        tracing::warn!("Removing {} leftover Docker resources", live.len());
        live.sort_by_key(|entry| matches!(entry.resource, Resource::Volume(_)));

        let worker = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::warn!("Cannot remove leftover Docker resources: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                for entry in live {
                    match &entry.resource {
                        Resource::Container(name) => entry.driver.cleanup_container(name).await,
                        Resource::Volume(name) => entry.driver.cleanup_volume(name).await,
                    }
                }
            });
        });
        if worker.join().is_err() {
            tracing::warn!("Removing leftover Docker resources panicked");
        }
    }
}

/// Log a driver command outcome; returns whether it succeeded
pub(crate) fn report(
    events: &EventLog,
    action: &str,
    command: &str,
    timeout: Duration,
    outcome: &CommandOutcome,
) -> bool {
    let context = json!({
        "command": command,
        "exit_code": outcome.exit_code,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "max_timeout": timeout.as_secs(),
    });
    match outcome.status {
        CommandStatus::Success => true,
        CommandStatus::Timeout => {
            events.failure(
                &format!("{} timed out after {} seconds", action, timeout.as_secs()),
                context,
            );
            false
        }
        CommandStatus::Failure => {
            events.failure(&format!("{} failed", action), context);
            false
        }
    }
}

/// Log a cleanup outcome as a warning-level event, never a failure
pub(crate) fn report_cleanup(
    events: &EventLog,
    action: &str,
    command: &str,
    outcome: &CommandOutcome,
) {
    if !outcome.success() {
        tracing::warn!("{} failed: {}", action, outcome.stderr.trim());
        events.info(
            &format!("{} failed (ignored)", action),
            json!({
                "command": command,
                "exit_code": outcome.exit_code,
                "stderr": outcome.stderr,
            }),
        );
    }
}

pub mod mock {
    //! Recording container driver for tests
    //!
    //! Every call is recorded in order. Failures are scripted per operation,
    //! optionally restricted to names containing a pattern.

    use super::*;
    use crate::archive::{Archiver, TarArchiver};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, MutexGuard};

    /// Operation kinds, for scripting failures
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DriverOp {
        CreateVolume,
        CreateContainer,
        CopyInto,
        Start,
        CopyFrom,
    }

    /// One recorded call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum DriverCall {
        CreateVolume(String),
        CreateContainer {
            name: String,
            image: String,
            command: Option<String>,
        },
        CopyInto(String),
        Start {
            name: String,
            command: String,
            label: String,
        },
        CopyFrom(String),
        CleanupContainer(String),
        CleanupVolume(String),
    }

    #[derive(Debug, Default)]
    struct RecorderState {
        calls: Vec<DriverCall>,
        specs: Vec<ContainerSpec>,
        failures: Vec<(DriverOp, String)>,
        output_dir: Option<PathBuf>,
    }

    /// [`ContainerDriver`] that records calls; clones share state
    #[derive(Debug, Clone, Default)]
    pub struct RecordingDriver {
        state: Arc<Mutex<RecorderState>>,
    }

    impl RecordingDriver {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, RecorderState> {
            self.state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Fail `op` for names containing `pattern` (`""` matches all)
        pub fn fail(&self, op: DriverOp, pattern: &str) {
            self.state().failures.push((op, pattern.to_string()));
        }

        /// Directory whose contents copy-out exports; empty archive otherwise
        pub fn set_output_dir(&self, dir: impl Into<PathBuf>) {
            self.state().output_dir = Some(dir.into());
        }

        pub fn calls(&self) -> Vec<DriverCall> {
            self.state().calls.clone()
        }

        /// Full spec of every container creation, env and DNS entries included
        pub fn created_specs(&self) -> Vec<ContainerSpec> {
            self.state().specs.clone()
        }

        fn record(&self, op: Option<DriverOp>, name: &str, call: DriverCall) -> bool {
            let mut state = self.state();
            state.calls.push(call);
            match op {
                Some(op) => !state
                    .failures
                    .iter()
                    .any(|(f, pattern)| *f == op && name.contains(pattern.as_str())),
                None => true,
            }
        }
    }

    fn write_empty_archive(path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        tar::Builder::new(encoder).into_inner()?.finish()?;
        Ok(())
    }

    #[async_trait]
    impl ContainerDriver for RecordingDriver {
        fn workdir(&self) -> &'static str {
            LINUX_WORKDIR
        }

        async fn create_volume(&self, name: &str) -> bool {
            self.record(
                Some(DriverOp::CreateVolume),
                name,
                DriverCall::CreateVolume(name.to_string()),
            )
        }

        async fn create_container(&self, spec: &ContainerSpec) -> bool {
            self.state().specs.push(spec.clone());
            self.record(
                Some(DriverOp::CreateContainer),
                &spec.name,
                DriverCall::CreateContainer {
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    command: spec.command.clone(),
                },
            )
        }

        async fn copy_into_container(&self, name: &str, archive: &Path) -> bool {
            archive.exists()
                && self.record(
                    Some(DriverOp::CopyInto),
                    name,
                    DriverCall::CopyInto(name.to_string()),
                )
        }

        async fn start_user_container(&self, name: &str, command: &str, label: &str) -> bool {
            self.record(
                Some(DriverOp::Start),
                name,
                DriverCall::Start {
                    name: name.to_string(),
                    command: command.to_string(),
                    label: label.to_string(),
                },
            )
        }

        async fn copy_from_container(&self, name: &str, archive: &Path) -> bool {
            if !self.record(
                Some(DriverOp::CopyFrom),
                name,
                DriverCall::CopyFrom(name.to_string()),
            ) {
                return false;
            }
            let output_dir = self.state().output_dir.clone();
            match output_dir {
                Some(dir) => TarArchiver.pack_tar_gz(&dir, archive, &[]).is_ok(),
                None => write_empty_archive(archive).is_ok(),
            }
        }

        async fn cleanup_container(&self, name: &str) {
            self.record(None, name, DriverCall::CleanupContainer(name.to_string()));
        }

        async fn cleanup_volume(&self, name: &str) {
            self.record(None, name, DriverCall::CleanupVolume(name.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_entry_parse() {
        let entry = HostEntry::parse("db.internal=10.0.0.5").unwrap();
        assert_eq!(entry.name, "db.internal");
        assert_eq!(entry.ip, "10.0.0.5");
        assert_eq!(entry.add_host_arg(), "db.internal:10.0.0.5");
    }

    #[test]
    fn test_malformed_host_entry_is_error() {
        for bad in ["db.internal", "=10.0.0.5", "db=", "my host=1.2.3.4"] {
            assert!(
                matches!(
                    HostEntry::parse(bad),
                    Err(ConfigError::InvalidHostEntry { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
        assert!(HostEntry::parse_all(&["a=1.1.1.1", "broken"][..]).is_err());
    }

    #[test]
    fn test_report_distinguishes_timeout() {
        let (events, memory) = EventLog::memory();
        let outcome = CommandOutcome {
            status: CommandStatus::Timeout,
            exit_code: None,
            stdout: "compiling".to_string(),
            stderr: String::new(),
            duration: Duration::from_secs(5),
        };
        assert!(!report(
            &events,
            "Build step [1/2]",
            "make",
            Duration::from_secs(5),
            &outcome
        ));
        let messages = memory.messages();
        assert_eq!(
            messages[0].message(),
            Some("Build step [1/2] timed out after 5 seconds")
        );
        assert_eq!(messages[0].context().unwrap()["stdout"], "compiling");
        assert_eq!(messages[0].context().unwrap()["max_timeout"], 5);
    }
}
