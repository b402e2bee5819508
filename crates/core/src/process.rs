//! Subprocess execution with timeout classification
//!
//! Output is collected by reader tasks into shared buffers so that whatever
//! a command printed before its timeout is still available afterwards.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Grace period for reader tasks to drain after the child is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Classification of a finished command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// Non-zero exit, or the process could not be started
    Failure,
    /// Killed after exceeding its timeout
    Timeout,
}

/// Result of running one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    pub fn timed_out(&self) -> bool {
        self.status == CommandStatus::Timeout
    }

    /// Outcome for a command that never ran
    pub fn not_started(reason: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failure,
            exit_code: None,
            stdout: String::new(),
            stderr: reason.into(),
            duration: Duration::ZERO,
        }
    }
}

/// How to run a process
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Feed this file on stdin
    pub stdin_file: Option<PathBuf>,
    /// Write stdout into this file instead of capturing it
    pub stdout_file: Option<PathBuf>,
}

impl ProcessOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cwd: None,
            env: BTreeMap::new(),
            stdin_file: None,
            stdout_file: None,
        }
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn spawn_reader<R>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn take_string(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

/// Run `argv` (program first) to completion or timeout
#[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or_default()))]
pub async fn run(argv: &[String], options: &ProcessOptions) -> CommandOutcome {
    let Some((program, args)) = argv.split_first() else {
        return CommandOutcome::not_started("empty command");
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&options.env)
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }

    match &options.stdin_file {
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => {
                command.stdin(Stdio::from(file));
            }
            Err(e) => {
                return CommandOutcome::not_started(format!(
                    "Failed to open {}: {}",
                    path.display(),
                    e
                ))
            }
        },
        None => {
            command.stdin(Stdio::null());
        }
    }

    match &options.stdout_file {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => {
                command.stdout(Stdio::from(file));
            }
            Err(e) => {
                return CommandOutcome::not_started(format!(
                    "Failed to create {}: {}",
                    path.display(),
                    e
                ))
            }
        },
        None => {
            command.stdout(Stdio::piped());
        }
    }

    debug!("Spawning process with {} argument(s)", args.len());
    let started = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!("Failed to spawn {}: {}", program, e);
            return CommandOutcome::not_started(format!("Failed to execute {}: {}", program, e));
        }
    };

    let stdout_buf = SharedBuffer::default();
    let stderr_buf = SharedBuffer::default();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, stdout_buf.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, stderr_buf.clone()));
    }

    let waited = tokio::time::timeout(options.timeout, child.wait()).await;
    let (status, exit_code) = match waited {
        Ok(Ok(exit)) => {
            let code = exit.code();
            if exit.success() {
                (CommandStatus::Success, code)
            } else {
                (CommandStatus::Failure, code)
            }
        }
        Ok(Err(e)) => {
            warn!("Failed waiting for {}: {}", program, e);
            (CommandStatus::Failure, None)
        }
        Err(_) => {
            debug!("{} exceeded timeout of {:?}", program, options.timeout);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out process {}: {}", program, e);
            }
            (CommandStatus::Timeout, None)
        }
    };

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            abort.abort();
        }
    }

    CommandOutcome {
        status,
        exit_code,
        stdout: take_string(&stdout_buf),
        stderr: take_string(&stderr_buf),
        duration: started.elapsed(),
    }
}
