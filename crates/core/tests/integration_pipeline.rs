//! End-to-end tests for build and release jobs
//!
//! Jobs are stored on disk, sources are local directories and every platform
//! is scripted, so these exercise stage ordering, skipping, `DEPLOY_STATUS`
//! propagation, artifact hand-over and emergency cleanup without Docker.

use anyhow::Result;
use rigger_core::archive::{Archiver, TarArchiver};
use rigger_core::artifacts::ArtifactStore;
use rigger_core::cleanup::EmergencyCleanup;
use rigger_core::docker::mock::{DriverCall, RecordingDriver};
use rigger_core::docker::{ContainerDriver, LiveResources, Resource};
use rigger_core::events::{EventLog, MemoryEmitter};
use rigger_core::io::{CapturedOutput, Console};
use rigger_core::job::{DeployTarget, Job, JobKind, JobSource, JobStatus};
use rigger_core::pipeline::{Pipeline, PipelineOptions, StageFailure, DEPLOY_STATUS};
use rigger_core::platform::mock::ScriptedPlatform;
use rigger_core::platform::PlatformRegistry;
use rigger_core::runner::JobRunner;
use rigger_core::session::mock::FakeConnector;
use rigger_core::session::{ExecRequest, SessionKey, SessionManager};
use rigger_core::source::GitFetcher;
use rigger_core::store::{FileJobStore, JobStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    temp: TempDir,
    jobs: FileJobStore,
    platform: ScriptedPlatform,
    connector: FakeConnector,
    memory: MemoryEmitter,
    output: CapturedOutput,
    pipeline: Pipeline,
}

impl Harness {
    fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let jobs = FileJobStore::new(temp.path().join("jobs"));
        let workspace_root = temp.path().join("work");
        std::fs::create_dir_all(&workspace_root)?;

        let (events, memory) = EventLog::memory();
        let (console, output) = Console::buffer();
        let platform = ScriptedPlatform::new();
        let runner = JobRunner::new(
            PlatformRegistry::new()
                .register("linux", Arc::new(platform.clone()))
                .register("rsync", Arc::new(platform.clone())),
            events.clone(),
        );
        let connector = FakeConnector::new();
        let sessions = Arc::new(SessionManager::new(
            Arc::new(connector.clone()),
            events.clone(),
        ));
        let archiver: Arc<dyn Archiver> = Arc::new(TarArchiver);

        let pipeline = Pipeline {
            runner,
            jobs: Arc::new(jobs.clone()),
            fetcher: Arc::new(GitFetcher::new(archiver.clone())),
            artifacts: ArtifactStore::new(temp.path().join("artifacts"), archiver),
            sessions,
            events,
            console,
            cleanup: EmergencyCleanup::new(),
            resources: LiveResources::new(),
            options: PipelineOptions {
                workspace_root,
                default_image: Some("debian:bookworm".to_string()),
                secrets_files: Vec::new(),
                env: BTreeMap::new(),
            },
        };

        Ok(Self {
            temp,
            jobs,
            platform,
            connector,
            memory,
            output,
            pipeline,
        })
    }

    /// Application source with the given `.rigger.yml`
    fn source(&self, app_config: &str) -> Result<PathBuf> {
        let dir = self.temp.path().join("app");
        std::fs::create_dir_all(dir.join("dist"))?;
        std::fs::create_dir_all(dir.join(".git"))?;
        std::fs::write(dir.join(".git/HEAD"), "ref: refs/heads/main\n")?;
        std::fs::write(dir.join("dist/index.html"), "<h1>shop</h1>\n")?;
        std::fs::write(dir.join(".rigger.yml"), app_config)?;
        Ok(dir)
    }

    fn save_build(&self, id: &str, source: &Path) -> Result<()> {
        let mut job = Job::new(id, JobKind::Build, "shop");
        job.source = Some(JobSource {
            url: source.display().to_string(),
            reference: None,
        });
        self.jobs.save(&job)?;
        Ok(())
    }

    fn save_release(&self, id: &str, build_id: &str) -> Result<()> {
        let mut job = Job::new(id, JobKind::Release, "shop");
        job.build_id = Some(build_id.to_string());
        job.target = Some(DeployTarget {
            platform: Some("rsync".to_string()),
            server: Some("web1".to_string()),
            user: Some("deploy".to_string()),
            path: Some("/srv/shop".to_string()),
        });
        self.jobs.save(&job)?;
        Ok(())
    }

    fn workspaces_left(&self) -> Result<usize> {
        Ok(std::fs::read_dir(&self.pipeline.options.workspace_root)?.count())
    }
}

const APP_CONFIG: &str = r#"
image: node:20
dist: dist
env:
  NODE_ENV: production
build:
  - npm ci
  - npm run build
deploy: ./restart.sh
after_deploy:
  - ./notify.sh
"#;

#[tokio::test]
async fn test_build_stores_artifact_and_finishes_job() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b1", &source)?;

    harness.pipeline.build("b1").await?;

    let calls = harness.platform.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].stage, "build");
    assert_eq!(calls[0].steps, vec!["npm ci", "npm run build"]);
    assert_eq!(calls[0].env.get("NODE_ENV").map(String::as_str), Some("production"));
    assert_eq!(calls[0].env.get("RIGGER_JOB_ID").map(String::as_str), Some("b1"));

    assert!(harness.pipeline.artifacts.exists("b1"));
    assert_eq!(harness.jobs.load("b1")?.status, JobStatus::Success);
    assert_eq!(harness.workspaces_left()?, 0);

    let console = harness.output.contents();
    assert!(console.contains("==> Download"));
    assert!(console.contains("==> Store-Artifact"));
    assert!(console.contains("Job b1 succeeded"));
    Ok(())
}

#[tokio::test]
async fn test_release_runs_stages_with_deploy_status() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b2", &source)?;
    harness.pipeline.build("b2").await?;

    harness.save_release("r2", "b2")?;
    harness.pipeline.deploy("r2").await?;

    let calls: Vec<_> = harness
        .platform
        .calls()
        .into_iter()
        .filter(|c| c.stage != "build")
        .collect();
    let seen: Vec<(String, Option<String>)> = calls
        .iter()
        .map(|c| (c.stage.clone(), c.env.get(DEPLOY_STATUS).cloned()))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("deploy".to_string(), Some("running".to_string())),
            ("after_deploy".to_string(), Some("success".to_string())),
        ]
    );
    assert_eq!(harness.jobs.load("r2")?.status, JobStatus::Success);

    // Transform and Before-Deploy have no steps
    let console = harness.output.contents();
    assert!(console.contains("==> Transform (skipped: no steps configured)"));
    assert!(console.contains("==> Before-Deploy (skipped: no steps configured)"));
    Ok(())
}

#[tokio::test]
async fn test_after_deploy_runs_when_deploy_fails() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b3", &source)?;
    harness.pipeline.build("b3").await?;

    harness.platform.fail_stage("deploy");
    harness.save_release("r3", "b3")?;
    let err = harness.pipeline.deploy("r3").await.unwrap_err();
    assert_eq!(err, StageFailure::Deploy);
    assert_eq!(err.exit_code(), 17);

    let after = harness
        .platform
        .calls()
        .into_iter()
        .find(|c| c.stage == "after_deploy")
        .expect("after_deploy still dispatched");
    assert_eq!(after.env.get(DEPLOY_STATUS).map(String::as_str), Some("failure"));

    assert_eq!(harness.jobs.load("r3")?.status, JobStatus::Error);
    assert!(harness.memory.contains_message("Stage deploy failed"));
    assert!(harness.output.contents().contains("!!! Deploy failed"));
    assert_eq!(harness.workspaces_left()?, 0);
    Ok(())
}

#[tokio::test]
async fn test_failing_build_stops_before_store() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b4", &source)?;
    harness.platform.fail_stage("build");

    let err = harness.pipeline.build("b4").await.unwrap_err();
    assert_eq!(err, StageFailure::Build);
    assert!(!harness.pipeline.artifacts.exists("b4"));
    assert!(!harness.output.contents().contains("==> Store-Artifact"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_job_fails_resolve() -> Result<()> {
    let harness = Harness::new()?;
    let err = harness.pipeline.build("nope").await.unwrap_err();
    assert_eq!(err, StageFailure::Resolve);
    assert_eq!(err.exit_code(), 10);
    assert!(harness.platform.calls().is_empty());
    assert!(harness.output.contents().contains("!!! Resolve failed"));
    Ok(())
}

#[tokio::test]
async fn test_release_without_artifact_fails_download() -> Result<()> {
    let harness = Harness::new()?;
    harness.save_release("r5", "never-built")?;
    let err = harness.pipeline.deploy("r5").await.unwrap_err();
    assert_eq!(err, StageFailure::DownloadArtifact);
    assert_eq!(harness.workspaces_left()?, 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_app_config_fails_read_config() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source("build: [make]\nunknown_key: 1\n")?;
    harness.save_build("b6", &source)?;
    let err = harness.pipeline.build("b6").await.unwrap_err();
    assert_eq!(err, StageFailure::ReadConfig);
    assert!(harness.platform.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cleanup_disconnects_sessions() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b7", &source)?;

    // A session opened during the job outlives no job
    harness
        .pipeline
        .sessions
        .execute(
            &SessionKey::new("deploy", "web1"),
            &ExecRequest::new("true", Duration::from_secs(5)),
        )
        .await?;
    harness.pipeline.build("b7").await?;

    assert_eq!(harness.connector.disconnects(), 1);
    assert_eq!(harness.pipeline.sessions.open_sessions(), 0);
    assert!(!harness.pipeline.cleanup.is_armed());
    Ok(())
}

#[tokio::test]
async fn test_cleanup_removes_leftover_containers_and_volumes() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b9", &source)?;

    // What an interrupted Docker stage leaves behind
    let driver = RecordingDriver::new();
    let shared: Arc<dyn ContainerDriver> = Arc::new(driver.clone());
    let resources = &harness.pipeline.resources;
    resources.track(&shared, Resource::Volume("rigger-b9-vol".to_string()));
    resources.track(&shared, Resource::Container("rigger-b9-vol-step1".to_string()));

    harness.pipeline.build("b9").await?;

    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::CleanupContainer("rigger-b9-vol-step1".to_string()),
            DriverCall::CleanupVolume("rigger-b9-vol".to_string()),
        ]
    );
    assert!(resources.tracked().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_secrets_exported_to_stages() -> Result<()> {
    let mut harness = Harness::new()?;
    let secrets = harness.temp.path().join("secrets.env");
    std::fs::write(&secrets, "# decrypted\nNPM_TOKEN=s3cr3t-token\n")?;
    harness.pipeline.options.secrets_files = vec![secrets];

    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b8", &source)?;
    harness.pipeline.build("b8").await?;

    let calls = harness.platform.calls();
    assert_eq!(
        calls[0].env.get("NPM_TOKEN").map(String::as_str),
        Some("s3cr3t-token")
    );
    assert!(harness
        .pipeline
        .events
        .redaction()
        .redact("token=s3cr3t-token")
        .contains("****"));
    Ok(())
}

#[tokio::test]
async fn test_finished_job_cannot_rerun() -> Result<()> {
    let harness = Harness::new()?;
    let source = harness.source(APP_CONFIG)?;
    harness.save_build("b9", &source)?;
    harness.pipeline.build("b9").await?;

    let err = harness.pipeline.build("b9").await.unwrap_err();
    assert_eq!(err, StageFailure::Resolve);
    Ok(())
}
