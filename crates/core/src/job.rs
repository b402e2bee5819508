//! Jobs, stage executions and the properties bag

use crate::errors::JobError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// What a job produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Build,
    Release,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Build => write!(f, "build"),
            JobKind::Release => write!(f, "release"),
        }
    }
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Success,
    Error,
    Removed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Where the source for a build comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSource {
    /// Git URL or local directory
    pub url: String,
    /// Branch, tag or commit for git sources
    #[serde(default)]
    pub reference: Option<String>,
}

/// Remote target for a release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTarget {
    /// Overrides the application's configured platform
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// A build or release unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub application: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub source: Option<JobSource>,
    /// Build whose artifact a release deploys
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub target: Option<DeployTarget>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: &str, kind: JobKind, application: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            status: JobStatus::Waiting,
            application: application.to_string(),
            environment: None,
            source: None,
            build_id: None,
            target: None,
            created: Utc::now(),
            started: None,
            finished: None,
        }
    }

    /// Waiting -> Running
    pub fn start(&mut self) -> Result<(), JobError> {
        if self.status != JobStatus::Waiting {
            return Err(JobError::InvalidStatus {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.status = JobStatus::Running;
        self.started = Some(Utc::now());
        Ok(())
    }

    /// Record the final outcome
    pub fn finish(&mut self, success: bool) {
        self.status = if success {
            JobStatus::Success
        } else {
            JobStatus::Error
        };
        self.finished = Some(Utc::now());
    }

    /// Fail unless this job is of `kind`
    pub fn expect_kind(&self, kind: JobKind) -> Result<(), JobError> {
        if self.kind != kind {
            return Err(JobError::WrongKind {
                id: self.id.clone(),
                actual: self.kind.to_string(),
                expected: kind.to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration of one stage, as handed to a platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageConfig {
    pub image: Option<String>,
    pub steps: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Directory (relative to the workspace) holding the stage's output
    pub dist: String,
    pub exclude: Vec<String>,
    pub target: Option<DeployTarget>,
}

/// One stage of a job: which platform runs it and with what configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExecution {
    pub platform: String,
    pub stage: String,
    pub config: StageConfig,
}

impl JobExecution {
    pub fn new(platform: &str, stage: &str, config: StageConfig) -> Self {
        Self {
            platform: platform.to_string(),
            stage: stage.to_string(),
            config,
        }
    }

    /// Human name of the stage, e.g. `Before deploy`
    pub fn stage_noun(&self) -> &str {
        match self.stage.as_str() {
            "build" => "Build",
            "build_transform" => "Transform",
            "before_deploy" => "Before deploy",
            "deploy" => "Deploy",
            "after_deploy" => "After deploy",
            other => other,
        }
    }

    /// Label for step `index` (1-based) of `total`, e.g. `Build step [1/2]`
    pub fn step_label(&self, index: usize, total: usize) -> String {
        format!("{} step [{}/{}]", self.stage_noun(), index, total)
    }

    /// Event message for steps not run after a failure
    pub fn skipped_steps_message(&self, remaining: usize) -> String {
        format!(
            "Skipping {} remaining {} steps",
            remaining,
            self.stage_noun().to_lowercase()
        )
    }
}

/// Mutable state threaded through the stages of one job
#[derive(Debug, Clone)]
pub struct Properties {
    pub job: Job,
    /// Unpacked source / build output
    pub workspace: PathBuf,
    /// Scratch directory for per-stage archives
    pub scratch: PathBuf,
    /// Global environment exported to every stage
    pub env: BTreeMap<String, String>,
    /// Decrypted secrets, exported to every stage
    pub secrets: BTreeMap<String, String>,
}

impl Properties {
    pub fn new(job: Job, workspace: PathBuf, scratch: PathBuf) -> Self {
        Self {
            job,
            workspace,
            scratch,
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    /// Environment for a stage: secrets, then global env, then stage env
    pub fn stage_env(&self, config: &StageConfig) -> BTreeMap<String, String> {
        let mut env = self.secrets.clone();
        env.extend(self.env.clone());
        env.extend(config.env.clone());
        env
    }
}
