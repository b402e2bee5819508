//! Deploys to a bare SSH host
//!
//! The `deploy` stage probes the target directory, creates it if missing and
//! rsyncs the packaged output over the job's SSH session before running the
//! configured steps there. Other stages only run their steps.

use crate::command::{quote, CommandBuilder, Quoting};
use crate::docker::{report, DriverTimeouts};
use crate::events::EventLog;
use crate::io::Console;
use crate::job::{DeployTarget, JobExecution, Properties};
use crate::platform::Platform;
use crate::process::{self, ProcessOptions};
use crate::session::{ExecRequest, SessionKey, SessionManager};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct RsyncDeployer {
    sessions: Arc<SessionManager>,
    rsync_path: String,
    timeouts: DriverTimeouts,
    events: EventLog,
}

/// A deploy target with every field present
struct Resolved<'a> {
    key: SessionKey,
    path: &'a str,
}

fn resolve(target: Option<&DeployTarget>) -> Option<Resolved<'_>> {
    let target = target?;
    Some(Resolved {
        key: SessionKey::new(target.user.clone()?, target.server.clone()?),
        path: target.path.as_deref()?,
    })
}

impl RsyncDeployer {
    pub fn new(
        sessions: Arc<SessionManager>,
        rsync_path: &str,
        timeouts: DriverTimeouts,
        events: EventLog,
    ) -> Self {
        Self {
            sessions,
            rsync_path: rsync_path.to_string(),
            timeouts,
            events,
        }
    }

    /// `rsync` invocation copying `source` into `path` on `key`
    pub fn rsync_command(
        &self,
        remote_shell: &[String],
        source: &Path,
        key: &SessionKey,
        path: &str,
        exclude: &[String],
    ) -> CommandBuilder {
        CommandBuilder::new(self.rsync_path.clone())
            .args(["--archive", "--compress", "--delete"])
            .arg("--rsh")
            .arg(shell_words::join(remote_shell))
            .repeated("--exclude", exclude.iter().cloned())
            .arg(format!("{}/", source.display()))
            .arg(format!("{}:{}/", key, path.trim_end_matches('/')))
    }

    /// Make sure `path` exists; the probe itself is never logged
    async fn ensure_directory(&self, key: &SessionKey, path: &str) -> bool {
        let probe = ExecRequest::new(
            format!("test -d {}", quote(path, Quoting::Posix)),
            self.timeouts.internal,
        )
        .quiet();
        match self.sessions.execute(key, &probe).await {
            Ok(outcome) if outcome.success() => {
                debug!("{} exists on {}", path, key);
                true
            }
            Ok(_) => {
                let mkdir = ExecRequest::new(
                    format!("mkdir -p {}", quote(path, Quoting::Posix)),
                    self.timeouts.internal,
                );
                self.sessions.execute_ok(key, &mkdir).await
            }
            Err(_) => false,
        }
    }

    async fn sync(&self, key: &SessionKey, path: &str, source: &Path, exclude: &[String]) -> bool {
        let session = match self.sessions.session(key).await {
            Ok(session) => session,
            Err(_) => return false,
        };
        if !self.ensure_directory(key, path).await {
            return false;
        }
        let command = self.rsync_command(&session.remote_shell(), source, key, path, exclude);
        let text = command.to_shell_string(Quoting::Posix);
        let outcome = process::run(
            &command.to_argv(),
            &ProcessOptions::with_timeout(self.timeouts.build_step),
        )
        .await;
        let ok = report(
            &self.events,
            &format!("Syncing files to {}:{}", key, path),
            &text,
            self.timeouts.build_step,
            &outcome,
        );
        if ok {
            self.events.success(
                &format!("Synced files to {}:{}", key, path),
                json!({ "command": text }),
            );
        }
        ok
    }
}

#[async_trait]
impl Platform for RsyncDeployer {
    #[instrument(skip_all, fields(stage = %execution.stage, job = %properties.job.id))]
    async fn run(
        &self,
        console: &Console,
        execution: &JobExecution,
        properties: &Properties,
    ) -> bool {
        let config = &execution.config;
        let Some(target) = resolve(config.target.as_ref()) else {
            self.events.failure(
                "Deploy target needs a server, a user and a path",
                json!({ "target": format!("{:?}", config.target) }),
            );
            return false;
        };

        if execution.stage == "deploy" {
            let source = properties.workspace.join(&config.dist);
            console.line(&format!("--> Syncing to {}:{}", target.key, target.path));
            if !self.sync(&target.key, target.path, &source, &config.exclude).await {
                return false;
            }
        }

        let env = properties.stage_env(config);
        let total = config.steps.len();
        for (index, step) in config.steps.iter().enumerate() {
            let label = execution.step_label(index + 1, total);
            console.line(&format!("--> {}: {}", label, step));
            let request = ExecRequest::new(step.clone(), self.timeouts.build_step)
                .in_dir(target.path)
                .with_env(env.clone());
            if !self.sessions.execute_ok(&target.key, &request).await {
                let remaining = total - index - 1;
                if remaining > 0 {
                    self.events.info(
                        &execution.skipped_steps_message(remaining),
                        json!({ "failed_step": label }),
                    );
                }
                return false;
            }
        }
        true
    }
}
