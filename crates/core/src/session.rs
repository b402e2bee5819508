//! Remote command sessions
//!
//! One authenticated session is kept per `(user, host)` for the lifetime of a
//! job. The production connector drives the system `ssh` client with
//! connection multiplexing: the first request for a pair starts a control
//! master, every later command, upload and rsync rides its control socket
//! without a new handshake.
//!
//! A connection failure is cached: later requests for the same pair fail
//! immediately with the original reason.

use crate::command::{in_directory, with_env_exports};
use crate::credentials::CredentialStore;
use crate::errors::SessionError;
use crate::events::EventLog;
use crate::process::{self, CommandOutcome, CommandStatus, ProcessOptions};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Identity of a remote session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub user: String,
    pub host: String,
}

impl SessionKey {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// One command to run over a session
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Record command and output in the event log
    pub log_output: bool,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout,
            log_output: true,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Keep this command out of the event log (expected/retryable probes)
    pub fn quiet(mut self) -> Self {
        self.log_output = false;
        self
    }

    /// The command string actually sent to the remote shell
    pub fn composed(&self) -> String {
        let command = with_env_exports(&self.command, &self.env);
        match &self.working_dir {
            Some(dir) => in_directory(dir, &command),
            None => command,
        }
    }
}

impl SessionError {
    /// Classify a finished command; `Ok` for success
    pub fn from_outcome(
        command: &str,
        timeout: Duration,
        outcome: &CommandOutcome,
    ) -> std::result::Result<(), SessionError> {
        match outcome.status {
            CommandStatus::Success => Ok(()),
            CommandStatus::Timeout => Err(SessionError::Timeout {
                command: command.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
            CommandStatus::Failure => Err(SessionError::CommandFailed {
                command: command.to_string(),
                exit_code: outcome.exit_code.unwrap_or(-1),
            }),
        }
    }
}

/// An established remote session
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    fn key(&self) -> &SessionKey;

    /// Run a fully composed command string
    async fn run(&self, command: &str, timeout: Duration) -> CommandOutcome;

    /// Copy a local file to `remote_path`
    async fn upload(&self, local: &Path, remote_path: &str, timeout: Duration) -> CommandOutcome;

    /// Copy `remote_path` to a local file
    async fn download(&self, remote_path: &str, local: &Path, timeout: Duration)
        -> CommandOutcome;

    /// Remote shell argv for tools that open their own channel (rsync `-e`)
    fn remote_shell(&self) -> Vec<String>;

    /// Close the session; idempotent and blocking so it can run from
    /// destructors and signal handlers
    fn disconnect(&self);
}

/// Establishes sessions
#[async_trait]
pub trait SessionConnector: Send + Sync + fmt::Debug {
    async fn connect(&self, key: &SessionKey) -> std::result::Result<Arc<dyn Session>, SessionError>;
}

#[derive(Debug, Clone)]
enum SessionSlot {
    Connected(Arc<dyn Session>),
    Failed(String),
}

/// Per-job cache of remote sessions
#[derive(Debug)]
pub struct SessionManager {
    connector: Arc<dyn SessionConnector>,
    sessions: Mutex<HashMap<SessionKey, SessionSlot>>,
    connect_lock: tokio::sync::Mutex<()>,
    events: EventLog,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn SessionConnector>, events: EventLog) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    fn cached(&self, key: &SessionKey) -> Option<SessionSlot> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(key).cloned())
    }

    /// Existing session for `key`, connecting on first use
    #[instrument(skip(self), fields(target = %key))]
    pub async fn session(
        &self,
        key: &SessionKey,
    ) -> std::result::Result<Arc<dyn Session>, SessionError> {
        // Serialise setup so concurrent callers never handshake twice
        let _guard = self.connect_lock.lock().await;

        match self.cached(key) {
            Some(SessionSlot::Connected(session)) => {
                debug!("Reusing session");
                return Ok(session);
            }
            Some(SessionSlot::Failed(reason)) => {
                debug!("Session previously failed: {}", reason);
                return Err(SessionError::Connection {
                    target: key.to_string(),
                    reason,
                });
            }
            None => {}
        }

        let slot = match self.connector.connect(key).await {
            Ok(session) => {
                debug!("Session established");
                SessionSlot::Connected(session)
            }
            Err(e) => {
                let reason = match &e {
                    SessionError::Connection { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                self.events.failure(
                    &format!("Could not connect to {}", key),
                    json!({ "target": key.to_string(), "reason": reason }),
                );
                SessionSlot::Failed(reason)
            }
        };

        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(key.clone(), slot.clone());
        }

        match slot {
            SessionSlot::Connected(session) => Ok(session),
            SessionSlot::Failed(reason) => Err(SessionError::Connection {
                target: key.to_string(),
                reason,
            }),
        }
    }

    /// Execute a command over the session for `key`
    ///
    /// `Err` only for connection failures; command failures and timeouts come
    /// back as an outcome with the matching status and are logged here.
    pub async fn execute(
        &self,
        key: &SessionKey,
        request: &ExecRequest,
    ) -> std::result::Result<CommandOutcome, SessionError> {
        let session = self.session(key).await?;
        let composed = request.composed();
        let outcome = session.run(&composed, request.timeout).await;
        if request.log_output {
            self.log_outcome(key, request, &outcome);
        }
        Ok(outcome)
    }

    /// Execute and reduce to success/failure
    pub async fn execute_ok(&self, key: &SessionKey, request: &ExecRequest) -> bool {
        matches!(self.execute(key, request).await, Ok(outcome) if outcome.success())
    }

    fn log_outcome(&self, key: &SessionKey, request: &ExecRequest, outcome: &CommandOutcome) {
        let context = json!({
            "target": key.to_string(),
            "command": request.command,
            "exit_code": outcome.exit_code,
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
        });
        match outcome.status {
            CommandStatus::Success => self.events.info(
                &format!("Executed on {}: {}", key, request.command),
                context,
            ),
            CommandStatus::Timeout => {
                let mut context = context;
                context["max_timeout"] = json!(request.timeout.as_secs());
                self.events.failure(
                    &format!(
                        "Command timed out after {} seconds on {}",
                        request.timeout.as_secs(),
                        key
                    ),
                    context,
                );
            }
            CommandStatus::Failure => self.events.failure(
                &format!(
                    "Command failed with exit code {} on {}",
                    outcome.exit_code.unwrap_or(-1),
                    key
                ),
                context,
            ),
        }
    }

    /// Number of live sessions
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .map(|s| {
                s.values()
                    .filter(|slot| matches!(slot, SessionSlot::Connected(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Disconnect every session and forget cached failures
    pub fn disconnect_all(&self) {
        let drained: Vec<SessionSlot> = match self.sessions.lock() {
            Ok(mut sessions) => sessions.drain().map(|(_, slot)| slot).collect(),
            Err(_) => return,
        };
        for slot in drained {
            if let SessionSlot::Connected(session) = slot {
                debug!("Disconnecting {}", session.key());
                session.disconnect();
            }
        }
    }
}

/// Settings for the `ssh`-backed connector
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_path: String,
    pub scp_path: String,
    pub sshpass_path: String,
    /// Directory holding control sockets
    pub control_dir: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_path: "ssh".to_string(),
            scp_path: "scp".to_string(),
            sshpass_path: "sshpass".to_string(),
            control_dir: std::env::temp_dir(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Connector using the system OpenSSH client with a control master
#[derive(Debug, Clone)]
pub struct SshConnector {
    options: SshOptions,
    credentials: CredentialStore,
}

impl SshConnector {
    pub fn new(options: SshOptions, credentials: CredentialStore) -> Self {
        Self {
            options,
            credentials,
        }
    }

    fn control_path(&self, key: &SessionKey) -> PathBuf {
        self.options.control_dir.join(format!(
            "rigger-{}-{}@{}.sock",
            std::process::id(),
            key.user,
            key.host
        ))
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    #[instrument(skip(self), fields(target = %key))]
    async fn connect(
        &self,
        key: &SessionKey,
    ) -> std::result::Result<Arc<dyn Session>, SessionError> {
        let connection_error = |reason: String| SessionError::Connection {
            target: key.to_string(),
            reason,
        };

        let credential = self
            .credentials
            .resolve(&key.user, &key.host)
            .ok_or_else(|| connection_error("no credentials configured".to_string()))?;

        if let Some(key_file) = &credential.key {
            if !key_file.exists() {
                return Err(connection_error(format!(
                    "key file {} not found",
                    key_file.display()
                )));
            }
        } else if credential.password.is_none() {
            return Err(connection_error("credential has no key or password".to_string()));
        }

        let control_path = self.control_path(key);
        let mut argv = Vec::new();
        let mut options = ProcessOptions::with_timeout(self.options.connect_timeout + Duration::from_secs(5));
        if let Some(password) = &credential.password {
            argv.extend([self.options.sshpass_path.clone(), "-e".to_string()]);
            options = options.env("SSHPASS", password.clone());
        }
        argv.extend([
            self.options.ssh_path.clone(),
            "-M".to_string(),
            "-S".to_string(),
            control_path.display().to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs()),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ]);
        match &credential.key {
            Some(key_file) => argv.extend([
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-i".to_string(),
                key_file.display().to_string(),
            ]),
            None => argv.extend([
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
            ]),
        }
        argv.extend(["-f".to_string(), "-N".to_string(), key.to_string()]);

        let outcome = process::run(&argv, &options).await;
        if !outcome.success() {
            let reason = if outcome.timed_out() {
                "connection attempt timed out".to_string()
            } else {
                outcome.stderr.trim().to_string()
            };
            return Err(connection_error(reason));
        }

        Ok(Arc::new(SshSession {
            key: key.clone(),
            ssh_path: self.options.ssh_path.clone(),
            scp_path: self.options.scp_path.clone(),
            control_path,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session multiplexed over an OpenSSH control socket
#[derive(Debug)]
pub struct SshSession {
    key: SessionKey,
    ssh_path: String,
    scp_path: String,
    control_path: PathBuf,
    closed: AtomicBool,
}

impl SshSession {
    fn ssh_base(&self) -> Vec<String> {
        vec![
            self.ssh_path.clone(),
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ]
    }

    fn scp_base(&self) -> Vec<String> {
        vec![
            self.scp_path.clone(),
            "-q".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]
    }
}

#[async_trait]
impl Session for SshSession {
    fn key(&self) -> &SessionKey {
        &self.key
    }

    async fn run(&self, command: &str, timeout: Duration) -> CommandOutcome {
        let mut argv = self.ssh_base();
        argv.push(self.key.to_string());
        argv.push(command.to_string());
        process::run(&argv, &ProcessOptions::with_timeout(timeout)).await
    }

    async fn upload(&self, local: &Path, remote_path: &str, timeout: Duration) -> CommandOutcome {
        let mut argv = self.scp_base();
        argv.push(local.display().to_string());
        argv.push(format!("{}:{}", self.key, remote_path));
        process::run(&argv, &ProcessOptions::with_timeout(timeout)).await
    }

    async fn download(
        &self,
        remote_path: &str,
        local: &Path,
        timeout: Duration,
    ) -> CommandOutcome {
        let mut argv = self.scp_base();
        argv.push(format!("{}:{}", self.key, remote_path));
        argv.push(local.display().to_string());
        process::run(&argv, &ProcessOptions::with_timeout(timeout)).await
    }

    fn remote_shell(&self) -> Vec<String> {
        self.ssh_base()
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = std::process::Command::new(&self.ssh_path)
            .arg("-S")
            .arg(&self.control_path)
            .args(["-O", "exit"])
            .arg(self.key.to_string())
            .output();
        match result {
            Ok(output) if output.status.success() => debug!("Closed session {}", self.key),
            Ok(output) => warn!(
                "Failed to close session {}: {}",
                self.key,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to close session {}: {}", self.key, e),
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

pub mod mock {
    //! Session fakes for tests
    //!
    //! [`FakeConnector`] counts handshakes and returns scripted outcomes
    //! without touching the network. [`LocalShellConnector`] runs commands
    //! through the local `sh`, which makes timeouts and partial output real.

    use super::*;
    use std::collections::BTreeSet;

    /// Everything a [`FakeConnector`] observed
    #[derive(Debug, Default)]
    pub struct FakeState {
        pub handshakes: usize,
        pub refused_hosts: BTreeSet<String>,
        pub responses: Vec<(String, CommandOutcome)>,
        pub commands: Vec<(SessionKey, String)>,
        pub uploads: Vec<(PathBuf, String)>,
        pub downloads: Vec<(String, PathBuf)>,
        pub disconnects: usize,
    }

    /// Scripted connector; clones share state
    #[derive(Debug, Clone, Default)]
    pub struct FakeConnector {
        state: Arc<Mutex<FakeState>>,
    }

    fn lock(state: &Mutex<FakeState>) -> std::sync::MutexGuard<'_, FakeState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Successful outcome with the given stdout
    pub fn ok_outcome(stdout: &str) -> CommandOutcome {
        CommandOutcome {
            status: CommandStatus::Success,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Failed outcome with the given exit code and stderr
    pub fn failed_outcome(exit_code: i32, stderr: &str) -> CommandOutcome {
        CommandOutcome {
            status: CommandStatus::Failure,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration: Duration::ZERO,
        }
    }

    /// Timed-out outcome carrying partial stdout
    pub fn timeout_outcome(partial_stdout: &str) -> CommandOutcome {
        CommandOutcome {
            status: CommandStatus::Timeout,
            exit_code: None,
            stdout: partial_stdout.to_string(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    impl FakeConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Refuse connections to `host`
        pub fn refuse(&self, host: &str) {
            lock(&self.state).refused_hosts.insert(host.to_string());
        }

        /// Reply with `outcome` to commands containing `pattern`
        pub fn respond(&self, pattern: &str, outcome: CommandOutcome) {
            lock(&self.state)
                .responses
                .push((pattern.to_string(), outcome));
        }

        pub fn handshakes(&self) -> usize {
            lock(&self.state).handshakes
        }

        pub fn disconnects(&self) -> usize {
            lock(&self.state).disconnects
        }

        pub fn commands(&self) -> Vec<String> {
            lock(&self.state)
                .commands
                .iter()
                .map(|(_, c)| c.clone())
                .collect()
        }

        pub fn uploads(&self) -> Vec<(PathBuf, String)> {
            lock(&self.state).uploads.clone()
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(
            &self,
            key: &SessionKey,
        ) -> std::result::Result<Arc<dyn Session>, SessionError> {
            let mut state = lock(&self.state);
            state.handshakes += 1;
            if state.refused_hosts.contains(&key.host) {
                return Err(SessionError::Connection {
                    target: key.to_string(),
                    reason: "Permission denied (publickey)".to_string(),
                });
            }
            Ok(Arc::new(FakeSession {
                key: key.clone(),
                state: self.state.clone(),
                closed: AtomicBool::new(false),
            }))
        }
    }

    #[derive(Debug)]
    struct FakeSession {
        key: SessionKey,
        state: Arc<Mutex<FakeState>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Session for FakeSession {
        fn key(&self) -> &SessionKey {
            &self.key
        }

        async fn run(&self, command: &str, _timeout: Duration) -> CommandOutcome {
            let mut state = lock(&self.state);
            state.commands.push((self.key.clone(), command.to_string()));
            state
                .responses
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map(|(_, outcome)| outcome.clone())
                .unwrap_or_else(|| ok_outcome(""))
        }

        async fn upload(&self, local: &Path, remote_path: &str, _timeout: Duration) -> CommandOutcome {
            lock(&self.state)
                .uploads
                .push((local.to_path_buf(), remote_path.to_string()));
            ok_outcome("")
        }

        async fn download(
            &self,
            remote_path: &str,
            local: &Path,
            _timeout: Duration,
        ) -> CommandOutcome {
            lock(&self.state)
                .downloads
                .push((remote_path.to_string(), local.to_path_buf()));
            ok_outcome("")
        }

        fn remote_shell(&self) -> Vec<String> {
            vec!["ssh".to_string(), format!("fake:{}", self.key)]
        }

        fn disconnect(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                lock(&self.state).disconnects += 1;
            }
        }
    }

    /// Connector whose sessions run commands with the local `sh`
    #[derive(Debug, Clone, Default)]
    pub struct LocalShellConnector;

    #[async_trait]
    impl SessionConnector for LocalShellConnector {
        async fn connect(
            &self,
            key: &SessionKey,
        ) -> std::result::Result<Arc<dyn Session>, SessionError> {
            Ok(Arc::new(LocalShellSession { key: key.clone() }))
        }
    }

    #[derive(Debug)]
    struct LocalShellSession {
        key: SessionKey,
    }

    #[async_trait]
    impl Session for LocalShellSession {
        fn key(&self) -> &SessionKey {
            &self.key
        }

        async fn run(&self, command: &str, timeout: Duration) -> CommandOutcome {
            let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
            process::run(&argv, &ProcessOptions::with_timeout(timeout)).await
        }

        async fn upload(&self, local: &Path, remote_path: &str, timeout: Duration) -> CommandOutcome {
            let argv = vec![
                "cp".to_string(),
                local.display().to_string(),
                remote_path.to_string(),
            ];
            process::run(&argv, &ProcessOptions::with_timeout(timeout)).await
        }

        async fn download(
            &self,
            remote_path: &str,
            local: &Path,
            timeout: Duration,
        ) -> CommandOutcome {
            let argv = vec![
                "cp".to_string(),
                remote_path.to_string(),
                local.display().to_string(),
            ];
            process::run(&argv, &ProcessOptions::with_timeout(timeout)).await
        }

        fn remote_shell(&self) -> Vec<String> {
            vec!["sh".to_string(), "-c".to_string()]
        }

        fn disconnect(&self) {}
    }
}
