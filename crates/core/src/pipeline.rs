//! Stage orchestration
//!
//! Build jobs run `Resolve -> Download -> Read-Config -> Build -> Store-Artifact`.
//! Release jobs run `Resolve -> Download-Artifact -> Read-Config -> Transform
//! -> Before-Deploy -> Deploy -> After-Deploy`.
//!
//! The first failing stage stops the sequence, with one exception:
//! After-Deploy still runs when Deploy fails, so scripts can react to
//! `DEPLOY_STATUS=failure`. Stages without configured steps are reported as
//! skipped and count as success.
//!
//! Once Resolve succeeds, an emergency cleanup is registered that removes
//! leftover containers and volumes, disconnects every remote session and
//! removes the job workspace. It fires
//! once, from whichever comes first: the end of the job, an unwinding
//! [`CleanupGuard`](crate::cleanup::CleanupGuard), the panic hook or a
//! signal.

use crate::app_config::{AppConfig, Stage};
use crate::artifacts::ArtifactStore;
use crate::cleanup::EmergencyCleanup;
use crate::docker::LiveResources;
use crate::events::{EventLog, StageStatus};
use crate::io::Console;
use crate::job::{JobExecution, JobKind, JobStatus, Properties};
use crate::runner::JobRunner;
use crate::secrets::Secrets;
use crate::session::SessionManager;
use crate::source::SourceFetcher;
use crate::store::JobStore;
use crate::workspace::JobWorkspace;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Environment variable carrying the outcome of the deploy stage
pub const DEPLOY_STATUS: &str = "DEPLOY_STATUS";

/// Environment variable carrying the job id
pub const JOB_ID_ENV: &str = "RIGGER_JOB_ID";

/// The stage a job failed in; each maps to its own exit code
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFailure {
    #[error("Resolve failed")]
    Resolve,
    #[error("Download failed")]
    Download,
    #[error("Download-Artifact failed")]
    DownloadArtifact,
    #[error("Read-Config failed")]
    ReadConfig,
    #[error("Build failed")]
    Build,
    #[error("Store-Artifact failed")]
    StoreArtifact,
    #[error("Transform failed")]
    Transform,
    #[error("Before-Deploy failed")]
    BeforeDeploy,
    #[error("Deploy failed")]
    Deploy,
    #[error("After-Deploy failed")]
    AfterDeploy,
}

impl StageFailure {
    pub fn exit_code(self) -> i32 {
        match self {
            StageFailure::Resolve => 10,
            StageFailure::Download | StageFailure::DownloadArtifact => 11,
            StageFailure::ReadConfig => 12,
            StageFailure::Build => 13,
            StageFailure::StoreArtifact => 14,
            StageFailure::Transform => 15,
            StageFailure::BeforeDeploy => 16,
            StageFailure::Deploy => 17,
            StageFailure::AfterDeploy => 18,
        }
    }

    /// Title printed on the console
    pub fn title(self) -> &'static str {
        match self {
            StageFailure::Resolve => "Resolve",
            StageFailure::Download => "Download",
            StageFailure::DownloadArtifact => "Download-Artifact",
            StageFailure::ReadConfig => "Read-Config",
            StageFailure::Build => "Build",
            StageFailure::StoreArtifact => "Store-Artifact",
            StageFailure::Transform => "Transform",
            StageFailure::BeforeDeploy => "Before-Deploy",
            StageFailure::Deploy => "Deploy",
            StageFailure::AfterDeploy => "After-Deploy",
        }
    }

    /// Stage name in the event log
    pub fn stage_key(self) -> &'static str {
        match self {
            StageFailure::Resolve => "resolve",
            StageFailure::Download => "download",
            StageFailure::DownloadArtifact => "download_artifact",
            StageFailure::ReadConfig => "read_config",
            StageFailure::Build => "build",
            StageFailure::StoreArtifact => "store_artifact",
            StageFailure::Transform => "build_transform",
            StageFailure::BeforeDeploy => "before_deploy",
            StageFailure::Deploy => "deploy",
            StageFailure::AfterDeploy => "after_deploy",
        }
    }
}

/// A failed stage and, when not already logged below, why
#[derive(Debug)]
struct Failed {
    stage: StageFailure,
    reason: Option<String>,
}

impl Failed {
    fn logged(stage: StageFailure) -> Self {
        Self {
            stage,
            reason: None,
        }
    }

    fn because(stage: StageFailure, reason: impl std::fmt::Display) -> Self {
        Self {
            stage,
            reason: Some(reason.to_string()),
        }
    }
}

type StageResult<T = ()> = Result<T, Failed>;

/// Settings the orchestrator needs beyond its collaborators
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub workspace_root: PathBuf,
    /// Image for applications that name none
    pub default_image: Option<String>,
    /// Decrypted `KEY=VALUE` files
    pub secrets_files: Vec<PathBuf>,
    /// Exported to every stage
    pub env: BTreeMap<String, String>,
}

/// Runs whole jobs
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub runner: JobRunner,
    pub jobs: Arc<dyn JobStore>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub artifacts: ArtifactStore,
    pub sessions: Arc<SessionManager>,
    pub events: EventLog,
    pub console: Console,
    pub cleanup: EmergencyCleanup,
    /// Shared with the Docker platforms
    pub resources: LiveResources,
    pub options: PipelineOptions,
}

impl Pipeline {
    /// Run build job `job_id`
    #[instrument(skip(self))]
    pub async fn build(&self, job_id: &str) -> Result<(), StageFailure> {
        self.run_job(job_id, JobKind::Build).await
    }

    /// Run release job `job_id`
    #[instrument(skip(self))]
    pub async fn deploy(&self, job_id: &str) -> Result<(), StageFailure> {
        self.run_job(job_id, JobKind::Release).await
    }

    async fn run_job(&self, job_id: &str, kind: JobKind) -> Result<(), StageFailure> {
        self.events.start_job(job_id);
        let mut properties = match self.resolve(job_id, kind) {
            Ok(properties) => properties,
            Err(failed) => return Err(self.report_failure(None, failed)),
        };
        let _guard = self.cleanup.guard();

        let result = match kind {
            JobKind::Build => self.build_stages(&mut properties).await,
            JobKind::Release => self.deploy_stages(&mut properties).await,
        };

        let outcome = match result {
            Ok(()) => {
                properties.job.finish(true);
                self.save(&properties);
                self.events.finish_job(properties.job.status);
                self.console
                    .line(&format!("Job {} succeeded", properties.job.id));
                info!("Job {} succeeded", properties.job.id);
                Ok(())
            }
            Err(failed) => Err(self.report_failure(Some(&mut properties), failed)),
        };
        self.cleanup.run();
        outcome
    }

    fn save(&self, properties: &Properties) {
        if let Err(e) = self.jobs.save(&properties.job) {
            self.events.failure(
                &format!("Could not save job {}", properties.job.id),
                json!({ "error": e.to_string() }),
            );
        }
    }

    fn report_failure(&self, properties: Option<&mut Properties>, failed: Failed) -> StageFailure {
        let stage = failed.stage;
        let message = failed
            .reason
            .clone()
            .unwrap_or_else(|| "see the event log for details".to_string());
        if let Some(reason) = &failed.reason {
            self.events.failure(reason, json!({ "stage": stage.stage_key() }));
        }
        self.events.set_stage(stage.stage_key(), StageStatus::Failure);
        self.console.failure(stage.title(), &message);

        if let Some(properties) = properties {
            properties.job.finish(false);
            self.save(properties);
            self.events.finish_job(properties.job.status);
        } else {
            self.events.finish_job(JobStatus::Error);
        }
        stage
    }

    fn begin(&self, stage: StageFailure) {
        self.console.stage(stage.title());
        self.events.set_stage(stage.stage_key(), StageStatus::Running);
    }

    fn succeed(&self, stage: StageFailure) {
        self.events.set_stage(stage.stage_key(), StageStatus::Success);
    }

    /// Load and start the job, create its workspace and arm the cleanup
    fn resolve(&self, job_id: &str, kind: JobKind) -> StageResult<Properties> {
        let stage = StageFailure::Resolve;
        self.begin(stage);

        let mut job = self.jobs.load(job_id).map_err(|e| Failed::because(stage, e))?;
        job.expect_kind(kind).map_err(|e| Failed::because(stage, e))?;
        if kind == JobKind::Release && job.build_id.is_none() {
            return Err(Failed::because(
                stage,
                format!("Release {} names no build to deploy", job.id),
            ));
        }
        job.start().map_err(|e| Failed::because(stage, e))?;

        let workspace = JobWorkspace::create(&self.options.workspace_root, &job.id).map_err(|e| {
            Failed::because(stage, format!("Could not create workspace: {}", e))
        })?;
        let resources = self.resources.clone();
        let sessions = self.sessions.clone();
        let teardown = workspace.clone();
        self.cleanup.register(move || {
            // Windows containers are removed over the sessions
            resources.release_all();
            sessions.disconnect_all();
            teardown.remove();
        });

        let secrets = Secrets::load(&self.options.secrets_files, &self.events.redaction().registry)
            .map_err(|e| {
                self.cleanup.run();
                Failed::because(stage, format!("Could not load secrets: {}", e))
            })?;
        debug!("Loaded {} secrets", secrets.len());

        let mut properties = Properties::new(job, workspace.source(), workspace.scratch());
        properties.secrets = secrets.into_map();
        properties.env = self.options.env.clone();
        properties
            .env
            .insert(JOB_ID_ENV.to_string(), properties.job.id.clone());
        self.save(&properties);
        self.succeed(stage);
        Ok(properties)
    }

    fn read_config(&self, properties: &Properties) -> StageResult<AppConfig> {
        let stage = StageFailure::ReadConfig;
        self.begin(stage);
        let config = AppConfig::load(&properties.workspace).map_err(|e| Failed::because(stage, e))?;
        config.env_vars().map_err(|e| Failed::because(stage, e))?;
        self.succeed(stage);
        Ok(config)
    }

    /// Hand one configured stage to the runner
    ///
    /// Without steps the stage is skipped unless `always` is set (deploy
    /// platforms may have work to do without user steps).
    async fn dispatch(
        &self,
        stage: StageFailure,
        platform: &str,
        config: &AppConfig,
        key: Stage,
        properties: &Properties,
        always: bool,
    ) -> StageResult {
        let stage_config = config
            .stage_config(
                key,
                self.options.default_image.as_deref(),
                properties.job.target.clone(),
            )
            .map_err(|e| Failed::because(stage, e))?;

        if stage_config.steps.is_empty() && !always {
            self.console.skipped(stage.title(), "no steps configured");
            self.events.set_stage(stage.stage_key(), StageStatus::Skipped);
            return Ok(());
        }

        self.console.stage(stage.title());
        let execution = JobExecution::new(platform, key.key(), stage_config);
        if self.runner.run(&self.console, &execution, properties).await {
            self.succeed(stage);
            Ok(())
        } else {
            Err(Failed::logged(stage))
        }
    }

    async fn build_stages(&self, properties: &mut Properties) -> StageResult {
        let stage = StageFailure::Download;
        self.begin(stage);
        let Some(source) = properties.job.source.clone() else {
            return Err(Failed::because(
                stage,
                format!("Build {} has no source", properties.job.id),
            ));
        };
        self.fetcher
            .fetch(&source, &properties.workspace)
            .await
            .map_err(|e| Failed::because(stage, e))?;
        self.succeed(stage);

        let config = self.read_config(properties)?;
        self.dispatch(
            StageFailure::Build,
            config.platform(),
            &config,
            Stage::Build,
            properties,
            false,
        )
        .await?;

        self.store_artifact(properties, &config)
    }

    fn store_artifact(&self, properties: &Properties, config: &AppConfig) -> StageResult {
        let stage = StageFailure::StoreArtifact;
        self.begin(stage);
        let dist = properties
            .workspace
            .join(config.dist.as_deref().unwrap_or("."));
        if !dist.is_dir() {
            return Err(Failed::because(
                stage,
                format!("Build output {} not found", dist.display()),
            ));
        }

        // Releases read their stages from the artifact
        if let Some(app_config) = AppConfig::locate(&properties.workspace) {
            if let Some(name) = app_config.file_name() {
                let carried = dist.join(name);
                if !carried.exists() {
                    std::fs::copy(&app_config, &carried).map_err(|e| Failed::because(stage, e))?;
                }
            }
        }

        let path = self
            .artifacts
            .store(&properties.job.id, &dist, &config.exclude)
            .map_err(|e| Failed::because(stage, e))?;
        self.events.success(
            &format!("Stored artifact for {}", properties.job.id),
            json!({ "path": path.display().to_string() }),
        );
        self.succeed(stage);
        Ok(())
    }

    async fn deploy_stages(&self, properties: &mut Properties) -> StageResult {
        let stage = StageFailure::DownloadArtifact;
        self.begin(stage);
        let build_id = properties.job.build_id.clone().unwrap_or_default();
        self.artifacts
            .fetch(&build_id, &properties.workspace)
            .map_err(|e| Failed::because(stage, e))?;
        self.succeed(stage);

        let config = self.read_config(properties)?;
        let deploy_platform = properties
            .job
            .target
            .as_ref()
            .and_then(|t| t.platform.clone())
            .unwrap_or_else(|| config.platform().to_string());

        self.dispatch(
            StageFailure::Transform,
            config.platform(),
            &config,
            Stage::BuildTransform,
            properties,
            false,
        )
        .await?;

        properties.env.insert(DEPLOY_STATUS.to_string(), "pending".to_string());
        self.dispatch(
            StageFailure::BeforeDeploy,
            &deploy_platform,
            &config,
            Stage::BeforeDeploy,
            properties,
            false,
        )
        .await?;

        properties.env.insert(DEPLOY_STATUS.to_string(), "running".to_string());
        let deployed = self
            .dispatch(
                StageFailure::Deploy,
                &deploy_platform,
                &config,
                Stage::Deploy,
                properties,
                true,
            )
            .await;

        let status = if deployed.is_ok() { "success" } else { "failure" };
        properties.env.insert(DEPLOY_STATUS.to_string(), status.to_string());
        let after = self
            .dispatch(
                StageFailure::AfterDeploy,
                &deploy_platform,
                &config,
                Stage::AfterDeploy,
                properties,
                false,
            )
            .await;

        deployed.and(after)
    }
}
