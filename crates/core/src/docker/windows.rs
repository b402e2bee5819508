//! Windows Docker host driver
//!
//! The Windows builder is reached through a [`ScriptRunner`] that executes
//! PowerShell batches remotely, either through the cloud command service
//! ([`SsmRunner`]) or over an SSH session ([`SessionScriptRunner`]). Every
//! batch gets [`POWERSHELL_HEADER`] prepended and [`EXIT_CODE_LINE`] appended
//! so the transport reports docker's exit code rather than the wrapper's.
//!
//! The transports only carry command strings, so commands are joined with
//! PowerShell quoting and user text is sanitised token by token. Archives are
//! staged on the builder over the SSH session.
//!
//! Manual DNS entries cannot be passed at create time here; they are patched
//! into the container's hosts file by a prelude that runs at container start,
//! before the user command.

use super::{
    report, report_cleanup, ContainerDriver, ContainerSpec, DriverTimeouts, HostEntry,
    WINDOWS_WORKDIR,
};
use crate::archive::{Archiver, TarArchiver};
use crate::command::{quote, CommandBuilder, Quoting};
use crate::events::EventLog;
use crate::process::{self, CommandOutcome, CommandStatus, ProcessOptions};
use crate::session::{ExecRequest, SessionKey, SessionManager};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Prepended to every batch
pub const POWERSHELL_HEADER: &[&str] = &[
    "$ErrorActionPreference = 'Stop'",
    "$ProgressPreference = 'SilentlyContinue'",
];

/// Appended to every batch so the transport sees the last native exit code
pub const EXIT_CODE_LINE: &str =
    "if (Test-Path variable:global:LastExitCode) { Exit $LastExitCode }";

const HOSTS_FILE: &str = "c:\\windows\\system32\\drivers\\etc\\hosts";

/// Wrap commands into a complete batch
pub fn wrap_batch(commands: &[String]) -> Vec<String> {
    POWERSHELL_HEADER
        .iter()
        .map(|line| line.to_string())
        .chain(commands.iter().cloned())
        .chain(std::iter::once(EXIT_CODE_LINE.to_string()))
        .collect()
}

/// Script that appends manual DNS entries to the container hosts file
///
/// Returns `None` when there is nothing to patch.
pub fn hosts_patch_script(hosts: &[HostEntry]) -> Option<String> {
    if hosts.is_empty() {
        return None;
    }
    let mut script = String::new();
    for host in hosts {
        script.push_str(&format!(
            "Add-Content -Path {} -Value {}; ",
            HOSTS_FILE,
            quote(&format!("{} {}", host.ip, host.name), Quoting::PowerShell)
        ));
    }
    Some(script)
}

/// Encode a script for `powershell -EncodedCommand` (base64 of UTF-16LE)
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Executes PowerShell batches on the Windows builder
#[async_trait]
pub trait ScriptRunner: Send + Sync + fmt::Debug {
    /// Human-readable target, for logs
    fn target(&self) -> String;

    async fn run_script(&self, lines: &[String], timeout: Duration) -> CommandOutcome;
}

/// Runs batches through the cloud command service via the `aws` CLI
#[derive(Debug, Clone)]
pub struct SsmRunner {
    aws_path: String,
    instance_id: String,
    region: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandOutput {
    command: SentCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SentCommand {
    command_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CommandInvocation {
    status: String,
    response_code: i32,
    standard_output_content: String,
    standard_error_content: String,
}

const AWS_CALL_TIMEOUT: Duration = Duration::from_secs(60);

impl SsmRunner {
    pub fn new(aws_path: &str, instance_id: &str, region: Option<String>) -> Self {
        Self {
            aws_path: aws_path.to_string(),
            instance_id: instance_id.to_string(),
            region,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn aws(&self, operation: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(self.aws_path.clone())
            .args(["ssm", operation])
            .args(["--output", "json"]);
        if let Some(region) = &self.region {
            cmd = cmd.args(["--region", region.as_str()]);
        }
        cmd
    }

    async fn poll(&self, command_id: &str) -> Option<CommandInvocation> {
        let cmd = self
            .aws("get-command-invocation")
            .args(["--command-id", command_id])
            .args(["--instance-id", self.instance_id.as_str()]);
        let outcome = process::run(
            &cmd.to_argv(),
            &ProcessOptions::with_timeout(AWS_CALL_TIMEOUT),
        )
        .await;
        if !outcome.success() {
            // The invocation is not visible until the agent picks it up
            debug!("Invocation not available yet: {}", outcome.stderr.trim());
            return None;
        }
        serde_json::from_str(&outcome.stdout).ok()
    }

    async fn cancel(&self, command_id: &str) {
        let cmd = self.aws("cancel-command").args(["--command-id", command_id]);
        let outcome = process::run(
            &cmd.to_argv(),
            &ProcessOptions::with_timeout(AWS_CALL_TIMEOUT),
        )
        .await;
        if !outcome.success() {
            warn!("Failed to cancel command {}: {}", command_id, outcome.stderr.trim());
        }
    }
}

#[async_trait]
impl ScriptRunner for SsmRunner {
    fn target(&self) -> String {
        self.instance_id.clone()
    }

    #[instrument(skip(self, lines), fields(instance = %self.instance_id))]
    async fn run_script(&self, lines: &[String], timeout: Duration) -> CommandOutcome {
        let started = Instant::now();
        let input = json!({
            "DocumentName": "AWS-RunPowerShellScript",
            "InstanceIds": [self.instance_id],
            "Parameters": {
                "commands": lines,
                "executionTimeout": [timeout.as_secs().to_string()],
            },
        });
        let cmd = self
            .aws("send-command")
            .args(["--cli-input-json".to_string(), input.to_string()]);
        let sent = process::run(
            &cmd.to_argv(),
            &ProcessOptions::with_timeout(AWS_CALL_TIMEOUT),
        )
        .await;
        if !sent.success() {
            return sent;
        }
        let command_id = match serde_json::from_str::<SendCommandOutput>(&sent.stdout) {
            Ok(output) => output.command.command_id,
            Err(e) => {
                return CommandOutcome::not_started(format!(
                    "Unexpected send-command response: {}",
                    e
                ))
            }
        };
        debug!("Submitted command {}", command_id);

        let mut last = CommandInvocation::default();
        loop {
            if started.elapsed() >= timeout {
                self.cancel(&command_id).await;
                return CommandOutcome {
                    status: CommandStatus::Timeout,
                    exit_code: None,
                    stdout: last.standard_output_content,
                    stderr: last.standard_error_content,
                    duration: started.elapsed(),
                };
            }
            tokio::time::sleep(self.poll_interval).await;

            let Some(invocation) = self.poll(&command_id).await else {
                continue;
            };
            let status = match invocation.status.as_str() {
                "Pending" | "InProgress" | "Delayed" => {
                    last = invocation;
                    continue;
                }
                "Success" => CommandStatus::Success,
                "TimedOut" => CommandStatus::Timeout,
                _ => CommandStatus::Failure,
            };
            return CommandOutcome {
                status,
                exit_code: (status != CommandStatus::Timeout).then_some(invocation.response_code),
                stdout: invocation.standard_output_content,
                stderr: invocation.standard_error_content,
                duration: started.elapsed(),
            };
        }
    }
}

/// Runs batches with `powershell -EncodedCommand` over an SSH session
#[derive(Debug, Clone)]
pub struct SessionScriptRunner {
    sessions: Arc<SessionManager>,
    key: SessionKey,
}

impl SessionScriptRunner {
    pub fn new(sessions: Arc<SessionManager>, key: SessionKey) -> Self {
        Self { sessions, key }
    }
}

#[async_trait]
impl ScriptRunner for SessionScriptRunner {
    fn target(&self) -> String {
        self.key.to_string()
    }

    async fn run_script(&self, lines: &[String], timeout: Duration) -> CommandOutcome {
        let command = format!(
            "powershell -NoProfile -NonInteractive -EncodedCommand {}",
            encode_powershell(&lines.join("\r\n"))
        );
        // The driver logs the readable batch itself
        let request = ExecRequest::new(command, timeout).quiet();
        match self.sessions.execute(&self.key, &request).await {
            Ok(outcome) => outcome,
            Err(e) => CommandOutcome::not_started(e.to_string()),
        }
    }
}

/// Docker driver for a remote Windows host
#[derive(Debug, Clone)]
pub struct WindowsDocker {
    runner: Arc<dyn ScriptRunner>,
    sessions: Arc<SessionManager>,
    builder: SessionKey,
    staging_dir: String,
    timeouts: DriverTimeouts,
    events: EventLog,
}

impl WindowsDocker {
    /// `builder` is the SSH identity used to stage archives in `staging_dir`
    pub fn new(
        runner: Arc<dyn ScriptRunner>,
        sessions: Arc<SessionManager>,
        builder: SessionKey,
        staging_dir: &str,
        timeouts: DriverTimeouts,
        events: EventLog,
    ) -> Self {
        Self {
            runner,
            sessions,
            builder,
            staging_dir: staging_dir.trim_end_matches('\\').to_string(),
            timeouts,
            events,
        }
    }

    fn docker() -> CommandBuilder {
        CommandBuilder::new("docker")
    }

    /// Run `command` through `cmd.exe`, which keeps binary pipes and
    /// redirects intact; `--%` hands the line to cmd without PowerShell parsing
    fn cmd_line(command: &CommandBuilder) -> String {
        format!("cmd --% /c {}", command.to_shell_string(Quoting::Cmd))
    }

    fn staged_path(&self, archive: &Path) -> String {
        let file_name = archive
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace.tar".to_string());
        format!("{}\\{}", self.staging_dir, file_name)
    }

    /// `docker container create` for `spec`, as a PowerShell command string
    pub fn create_command(&self, spec: &ContainerSpec) -> String {
        let mut cmd = Self::docker()
            .args(["container", "create"])
            .args(["--name", spec.name.as_str()])
            .args([
                "--volume".to_string(),
                format!("{}:{}", spec.volume, WINDOWS_WORKDIR),
            ])
            .args(["--workdir", WINDOWS_WORKDIR])
            .repeated(
                "--env",
                spec.env.iter().map(|(k, v)| format!("{}={}", k, v)),
            )
            .arg(spec.image.clone());
        if let Some(command) = &spec.command {
            cmd = cmd.args(["powershell", "-NoProfile", "-Command"]);
            if let Some(prelude) = hosts_patch_script(&spec.dns_hosts) {
                cmd = cmd.arg(prelude);
            }
            cmd = cmd.user_command(command.clone());
        }
        cmd.to_shell_string(Quoting::PowerShell)
    }

    async fn batch(&self, action: &str, commands: Vec<String>, timeout: Duration) -> bool {
        let outcome = self.runner.run_script(&wrap_batch(&commands), timeout).await;
        report(&self.events, action, &commands.join("\n"), timeout, &outcome)
    }

    async fn cleanup_batch(&self, action: &str, command: String) {
        let outcome = self
            .runner
            .run_script(&wrap_batch(std::slice::from_ref(&command)), self.timeouts.internal)
            .await;
        report_cleanup(&self.events, action, &command, &outcome);
    }

    async fn ensure_staging_dir(&self) -> bool {
        let command = format!(
            "New-Item -ItemType Directory -Force -Path {} | Out-Null",
            quote(&self.staging_dir, Quoting::PowerShell)
        );
        self.batch(
            "Preparing staging directory",
            vec![command],
            self.timeouts.internal,
        )
        .await
    }

    async fn remove_staged(&self, staged: &str) {
        self.cleanup_batch(
            &format!("Removing staged archive {}", staged),
            format!(
                "Remove-Item -Force -ErrorAction SilentlyContinue {}",
                quote(staged, Quoting::PowerShell)
            ),
        )
        .await;
    }

    /// Remote path form accepted by scp on Windows OpenSSH
    fn scp_path(path: &str) -> String {
        path.replace('\\', "/")
    }
}

#[async_trait]
impl ContainerDriver for WindowsDocker {
    fn workdir(&self) -> &'static str {
        WINDOWS_WORKDIR
    }

    #[instrument(skip(self), fields(target = %self.runner.target()))]
    async fn create_volume(&self, name: &str) -> bool {
        let command = Self::docker()
            .args(["volume", "create", name])
            .to_shell_string(Quoting::PowerShell);
        self.batch(
            &format!("Creating volume {}", name),
            vec![command],
            self.timeouts.internal,
        )
        .await
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_container(&self, spec: &ContainerSpec) -> bool {
        let command = self.create_command(spec);
        self.batch(
            &format!("Creating container {}", spec.name),
            vec![command],
            self.timeouts.internal,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn copy_into_container(&self, name: &str, archive: &Path) -> bool {
        let action = format!("Copying workspace into {}", name);
        if !self.ensure_staging_dir().await {
            return false;
        }

        let staged = self.staged_path(archive);
        let session = match self.sessions.session(&self.builder).await {
            Ok(session) => session,
            Err(e) => {
                self.events
                    .failure(&format!("{} failed", action), json!({ "error": e.to_string() }));
                return false;
            }
        };
        let uploaded = session
            .upload(archive, &Self::scp_path(&staged), self.timeouts.internal)
            .await;
        if !report(
            &self.events,
            &format!("Staging {}", archive.display()),
            &staged,
            self.timeouts.internal,
            &uploaded,
        ) {
            return false;
        }

        let pipe = CommandBuilder::new("type")
            .arg(staged.clone())
            .pipe_into(
                "|",
                Self::docker()
                    .args(["container", "cp", "-"])
                    .arg(format!("{}:{}", name, WINDOWS_WORKDIR)),
            );
        let ok = self
            .batch(
                &action,
                vec![Self::cmd_line(&pipe)],
                self.timeouts.internal,
            )
            .await;
        self.remove_staged(&staged).await;
        ok
    }

    #[instrument(skip(self, command))]
    async fn start_user_container(&self, name: &str, command: &str, label: &str) -> bool {
        let start = Self::docker()
            .args(["container", "start", "--attach", name])
            .to_shell_string(Quoting::PowerShell);
        let outcome = self
            .runner
            .run_script(
                &wrap_batch(std::slice::from_ref(&start)),
                self.timeouts.build_step,
            )
            .await;
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
                json!({ "container": name, "command": start, "output": outcome.stdout }),
            );
        }
        ok
    }

    #[instrument(skip(self))]
    async fn copy_from_container(&self, name: &str, archive: &Path) -> bool {
        let action = format!("Copying workspace out of {}", name);
        if !self.ensure_staging_dir().await {
            return false;
        }

        let staged = format!("{}.raw.tar", self.staged_path(archive));
        let export = Self::docker()
            .args(["container", "cp"])
            .arg(format!("{}:{}\\.", name, WINDOWS_WORKDIR))
            .arg("-")
            .raw(">")
            .arg(staged.clone());
        if !self
            .batch(
                &action,
                vec![Self::cmd_line(&export)],
                self.timeouts.internal,
            )
            .await
        {
            self.remove_staged(&staged).await;
            return false;
        }

        let raw_tar = PathBuf::from(format!("{}.raw.tar", archive.display()));
        let ok = match self.sessions.session(&self.builder).await {
            Ok(session) => {
                let downloaded = session
                    .download(&Self::scp_path(&staged), &raw_tar, self.timeouts.internal)
                    .await;
                report(
                    &self.events,
                    &format!("Fetching {}", staged),
                    &staged,
                    self.timeouts.internal,
                    &downloaded,
                )
            }
            Err(e) => {
                self.events
                    .failure(&format!("{} failed", action), json!({ "error": e.to_string() }));
                false
            }
        };
        self.remove_staged(&staged).await;

        let ok = ok
            && match TarArchiver.gzip(&raw_tar, archive) {
                Ok(()) => true,
                Err(e) => {
                    self.events
                        .failure(&format!("{} failed", action), json!({ "error": e.to_string() }));
                    false
                }
            };
        let _ = std::fs::remove_file(&raw_tar);
        ok
    }

    #[instrument(skip(self))]
    async fn cleanup_container(&self, name: &str) {
        let command = Self::docker()
            .args(["container", "rm", "--force", name])
            .to_shell_string(Quoting::PowerShell);
        self.cleanup_batch(&format!("Removing container {}", name), command)
            .await;
    }

    #[instrument(skip(self))]
    async fn cleanup_volume(&self, name: &str) {
        let command = Self::docker()
            .args(["volume", "rm", name])
            .to_shell_string(Quoting::PowerShell);
        self.cleanup_batch(&format!("Removing volume {}", name), command)
            .await;
    }
}

pub mod mock {
    //! Scripted [`ScriptRunner`] for tests

    use super::*;
    use std::sync::Mutex;

    /// Records every batch; replies with scripted outcomes by substring
    #[derive(Debug, Default)]
    pub struct RecordingRunner {
        batches: Mutex<Vec<Vec<String>>>,
        responses: Mutex<Vec<(String, CommandOutcome)>>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Reply with `outcome` to batches containing `pattern`
        pub fn respond(&self, pattern: &str, outcome: CommandOutcome) {
            if let Ok(mut responses) = self.responses.lock() {
                responses.push((pattern.to_string(), outcome));
            }
        }

        pub fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().map(|b| b.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl ScriptRunner for RecordingRunner {
        fn target(&self) -> String {
            "recording".to_string()
        }

        async fn run_script(&self, lines: &[String], _timeout: Duration) -> CommandOutcome {
            if let Ok(mut batches) = self.batches.lock() {
                batches.push(lines.to_vec());
            }
            let joined = lines.join("\n");
            self.responses
                .lock()
                .ok()
                .and_then(|responses| {
                    responses
                        .iter()
                        .find(|(pattern, _)| joined.contains(pattern.as_str()))
                        .map(|(_, outcome)| outcome.clone())
                })
                .unwrap_or_else(|| crate::session::mock::ok_outcome(""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingRunner;
    use super::*;
    use crate::session::mock::{failed_outcome, FakeConnector};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn driver(runner: Arc<RecordingRunner>, connector: &FakeConnector) -> WindowsDocker {
        let events = EventLog::silent();
        let sessions = Arc::new(SessionManager::new(
            Arc::new(connector.clone()),
            events.clone(),
        ));
        WindowsDocker::new(
            runner,
            sessions,
            SessionKey::new("Administrator", "winbuild"),
            "c:\\rigger\\staging\\",
            DriverTimeouts::default(),
            events,
        )
    }

    #[test]
    fn test_batch_wrapping() {
        let batch = wrap_batch(&["docker volume create v".to_string()]);
        assert_eq!(batch.first().unwrap(), "$ErrorActionPreference = 'Stop'");
        assert_eq!(batch[2], "docker volume create v");
        assert_eq!(batch.last().unwrap(), EXIT_CODE_LINE);
    }

    #[test]
    fn test_encode_powershell_utf16le() {
        // "a" in UTF-16LE is [0x61, 0x00]
        assert_eq!(encode_powershell("a"), "YQA=");
    }

    #[test]
    fn test_create_command_with_hosts_prelude() {
        let connector = FakeConnector::new();
        let docker = driver(Arc::new(RecordingRunner::new()), &connector);
        let mut env = BTreeMap::new();
        env.insert("CONFIG".to_string(), "Release".to_string());
        let spec = ContainerSpec::new("mcr.microsoft.com/dotnet/sdk:8.0", "c1", "v1")
            .with_env(env)
            .with_dns_hosts(vec![HostEntry::parse("nuget.internal=10.1.2.3").unwrap()])
            .with_command("dotnet build -c Release");

        let command = docker.create_command(&spec);
        assert!(command.starts_with(
            "docker container create --name c1 --volume v1:c:\\workspace --workdir c:\\workspace --env CONFIG=Release mcr.microsoft.com/dotnet/sdk:8.0 powershell -NoProfile -Command "
        ));
        assert!(command.contains("Add-Content -Path c:\\windows\\system32\\drivers\\etc\\hosts -Value ''10.1.2.3 nuget.internal'';"));
        assert!(command.ends_with("dotnet build -c Release"));
    }

    #[tokio::test]
    async fn test_copy_into_stages_over_session() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("rigger-abc.tar");
        std::fs::write(&archive, b"tar").unwrap();
        let connector = FakeConnector::new();
        let runner = Arc::new(RecordingRunner::new());
        let docker = driver(runner.clone(), &connector);

        assert!(docker.copy_into_container("c1", &archive).await);

        assert_eq!(
            connector.uploads(),
            vec![(archive.clone(), "c:/rigger/staging/rigger-abc.tar".to_string())]
        );
        let batches = runner.batches();
        assert_eq!(batches.len(), 3);
        assert!(batches[1].contains(
            &"cmd --% /c type c:\\rigger\\staging\\rigger-abc.tar | docker container cp - c1:c:\\workspace"
                .to_string()
        ));
        assert!(batches[2][2].starts_with("Remove-Item"));
    }

    #[tokio::test]
    async fn test_staging_dir_with_spaces_quoted_for_cmd() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("rigger-abc.tar.gz");
        let connector = FakeConnector::new();
        let runner = Arc::new(RecordingRunner::new());
        let docker = WindowsDocker::new(
            runner.clone(),
            Arc::new(SessionManager::new(
                Arc::new(connector.clone()),
                EventLog::silent(),
            )),
            SessionKey::new("Administrator", "winbuild"),
            "c:\\rigger staging",
            DriverTimeouts::default(),
            EventLog::silent(),
        );

        docker.copy_from_container("c1", &archive).await;

        let export = runner
            .batches()
            .into_iter()
            .flatten()
            .find(|line| line.starts_with("cmd "))
            .unwrap();
        assert_eq!(
            export,
            "cmd --% /c docker container cp c1:c:\\workspace\\. - > \"c:\\rigger staging\\rigger-abc.tar.gz.raw.tar\""
        );
    }

    #[tokio::test]
    async fn test_failed_start_reports_false() {
        let connector = FakeConnector::new();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("container start", failed_outcome(1, "build failed"));
        let docker = driver(runner.clone(), &connector);
        assert!(
            !docker
                .start_user_container("c1", "msbuild", "Build step [1/1]")
                .await
        );
    }

    #[tokio::test]
    async fn test_cleanup_ignores_failures() {
        let connector = FakeConnector::new();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("volume rm", failed_outcome(1, "no such volume"));
        let docker = driver(runner.clone(), &connector);
        docker.cleanup_volume("v1").await;
        docker.cleanup_container("c1").await;
        assert_eq!(runner.batches().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ssm_runner_polls_until_done() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let aws = temp.path().join("aws");
        std::fs::write(
            &aws,
            "#!/bin/sh\ncase \"$2\" in\n  send-command) echo '{\"Command\":{\"CommandId\":\"cmd-1\"}}' ;;\n  get-command-invocation) echo '{\"Status\":\"Failed\",\"ResponseCode\":3,\"StandardOutputContent\":\"out\",\"StandardErrorContent\":\"err\"}' ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&aws, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = SsmRunner::new(&aws.display().to_string(), "i-0abc", None)
            .with_poll_interval(Duration::from_millis(10));
        let outcome = runner
            .run_script(&wrap_batch(&["docker ps".to_string()]), Duration::from_secs(10))
            .await;
        assert_eq!(outcome.status, CommandStatus::Failure);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, "out");
    }
}
