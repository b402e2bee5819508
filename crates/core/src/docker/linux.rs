//! Local Docker Engine driver
//!
//! Drives the `docker` CLI as a subprocess. Commands are built as argument
//! groups and executed as argv, so nothing is shell-quoted.

use super::{
    report, report_cleanup, ContainerDriver, ContainerSpec, DriverTimeouts, LINUX_WORKDIR,
};
use crate::archive::{Archiver, TarArchiver};
use crate::command::CommandBuilder;
use crate::errors::DockerError;
use crate::events::EventLog;
use crate::process::{self, CommandOutcome, ProcessOptions};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Docker CLI driver for the local engine
#[derive(Debug, Clone)]
pub struct LocalDocker {
    docker_path: String,
    timeouts: DriverTimeouts,
    events: EventLog,
}

impl LocalDocker {
    pub fn new(events: EventLog, timeouts: DriverTimeouts) -> Self {
        Self::with_path("docker".to_string(), events, timeouts)
    }

    /// Use a custom docker binary
    pub fn with_path(docker_path: String, events: EventLog, timeouts: DriverTimeouts) -> Self {
        Self {
            docker_path,
            timeouts,
            events,
        }
    }

    /// Check that the docker binary is installed and answering
    #[instrument(skip(self))]
    pub async fn check_installed(&self) -> Result<(), DockerError> {
        let argv = vec![self.docker_path.clone(), "--version".to_string()];
        let options = ProcessOptions::with_timeout(Duration::from_secs(30));
        let outcome = process::run(&argv, &options).await;
        if outcome.success() {
            debug!("Docker found: {}", outcome.stdout.trim());
            Ok(())
        } else if outcome.exit_code.is_none() {
            Err(DockerError::NotInstalled)
        } else {
            Err(DockerError::CLIError(format!(
                "Version check failed: {}",
                outcome.stderr.trim()
            )))
        }
    }

    fn docker(&self) -> CommandBuilder {
        CommandBuilder::new(self.docker_path.clone())
    }

    /// `docker container create` for `spec`
    pub fn create_command(&self, spec: &ContainerSpec) -> CommandBuilder {
        let mut cmd = self
            .docker()
            .args(["container", "create", "--tty", "--interactive"])
            .args(["--name", spec.name.as_str()])
            .args(["--volume".to_string(), format!("{}:{}", spec.volume, LINUX_WORKDIR)])
            .args(["--workdir", LINUX_WORKDIR])
            .repeated("--add-host", spec.dns_hosts.iter().map(|h| h.add_host_arg()))
            .repeated(
                "--env",
                spec.env.iter().map(|(k, v)| format!("{}={}", k, v)),
            )
            .args(["--entrypoint", "bash"])
            .arg(spec.image.clone());
        if let Some(command) = &spec.command {
            cmd = cmd.args(["-l", "-c"]).user_command(command.clone());
        }
        cmd
    }

    async fn run(
        &self,
        cmd: &CommandBuilder,
        options: &ProcessOptions,
    ) -> (String, CommandOutcome) {
        let argv = cmd.to_argv();
        let text = argv.join(" ");
        debug!("Running: {}", text);
        (text, process::run(&argv, options).await)
    }

    fn internal(&self) -> ProcessOptions {
        ProcessOptions::with_timeout(self.timeouts.internal)
    }
}

#[async_trait]
impl ContainerDriver for LocalDocker {
    fn workdir(&self) -> &'static str {
        LINUX_WORKDIR
    }

    #[instrument(skip(self))]
    async fn create_volume(&self, name: &str) -> bool {
        let cmd = self.docker().args(["volume", "create", name]);
        let (text, outcome) = self.run(&cmd, &self.internal()).await;
        report(
            &self.events,
            &format!("Creating volume {}", name),
            &text,
            self.timeouts.internal,
            &outcome,
        )
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_container(&self, spec: &ContainerSpec) -> bool {
        let cmd = self.create_command(spec);
        let (text, outcome) = self.run(&cmd, &self.internal()).await;
        report(
            &self.events,
            &format!("Creating container {}", spec.name),
            &text,
            self.timeouts.internal,
            &outcome,
        )
    }

    #[instrument(skip(self))]
    async fn copy_into_container(&self, name: &str, archive: &Path) -> bool {
        let cmd = self
            .docker()
            .args(["container", "cp", "-"])
            .arg(format!("{}:{}", name, LINUX_WORKDIR));
        let (text, outcome) = self
            .run(&cmd, &self.internal().stdin_file(archive))
            .await;
        report(
            &self.events,
            &format!("Copying workspace into {}", name),
            &text,
            self.timeouts.internal,
            &outcome,
        )
    }

    #[instrument(skip(self, command))]
    async fn start_user_container(&self, name: &str, command: &str, label: &str) -> bool {
        let cmd = self.docker().args(["container", "start", "--attach", name]);
        let options = ProcessOptions::with_timeout(self.timeouts.build_step);
        let (text, outcome) = self.run(&cmd, &options).await;
        let ok = report(
            &self.events,
            label,
            command,
            self.timeouts.build_step,
            &outcome,
        );
        if ok {
            self.events.success(
                &format!("{}: {}", label, command),
                json!({ "container": name, "command": text, "output": outcome.stdout }),
            );
        }
        ok
    }

    #[instrument(skip(self))]
    async fn copy_from_container(&self, name: &str, archive: &Path) -> bool {
        let raw_tar = PathBuf::from(format!("{}.raw.tar", archive.display()));
        let cmd = self
            .docker()
            .args(["container", "cp"])
            .arg(format!("{}:{}/.", name, LINUX_WORKDIR))
            .arg("-");
        let (text, outcome) = self
            .run(&cmd, &self.internal().stdout_file(&raw_tar))
            .await;
        let action = format!("Copying workspace out of {}", name);
        let mut ok = report(&self.events, &action, &text, self.timeouts.internal, &outcome);

        if ok {
            if let Err(e) = TarArchiver.gzip(&raw_tar, archive) {
                self.events.failure(
                    &format!("{} failed", action),
                    json!({ "error": e.to_string() }),
                );
                ok = false;
            }
        }
        let _ = std::fs::remove_file(&raw_tar);
        ok
    }

    #[instrument(skip(self))]
    async fn cleanup_container(&self, name: &str) {
        let cmd = self.docker().args(["container", "rm", "--force", name]);
        let (text, outcome) = self.run(&cmd, &self.internal()).await;
        report_cleanup(
            &self.events,
            &format!("Removing container {}", name),
            &text,
            &outcome,
        );
    }

    #[instrument(skip(self))]
    async fn cleanup_volume(&self, name: &str) {
        let cmd = self.docker().args(["volume", "rm", name]);
        let (text, outcome) = self.run(&cmd, &self.internal()).await;
        report_cleanup(
            &self.events,
            &format!("Removing volume {}", name),
            &text,
            &outcome,
        );
    }
}
