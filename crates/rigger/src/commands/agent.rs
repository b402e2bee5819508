//! Wiring for `rigger build` and `rigger deploy`
//!
//! Turns [`Settings`] into a [`Pipeline`]: the event log, the SSH session
//! manager, one platform per supported target and the emergency cleanup with
//! its panic and signal triggers.

use super::check_image::validator;
use anyhow::{Context, Result};
use rigger_core::archive::{Archiver, TarArchiver};
use rigger_core::artifacts::ArtifactStore;
use rigger_core::cleanup::EmergencyCleanup;
use rigger_core::docker::{
    LiveResources, LocalDocker, ScriptRunner, SessionScriptRunner, SsmRunner, WindowsDocker,
};
use rigger_core::events::{EventEmitter, EventLog, JsonFileEmitter, SilentEmitter};
use rigger_core::io::Console;
use rigger_core::pipeline::{Pipeline, PipelineOptions};
use rigger_core::platform::{self, DockerBuilder, PlatformRegistry, RsyncDeployer};
use rigger_core::redaction::RedactionConfig;
use rigger_core::runner::JobRunner;
use rigger_core::session::{SessionManager, SshConnector};
use rigger_core::settings::{Settings, WindowsTransport};
use rigger_core::source::GitFetcher;
use rigger_core::store::FileJobStore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Agent {
    pipeline: Pipeline,
    local_docker: LocalDocker,
}

fn event_log(settings: &Settings, redaction: RedactionConfig) -> Result<EventLog> {
    let emitter: Box<dyn EventEmitter> = match &settings.event_log {
        Some(path) => Box::new(
            JsonFileEmitter::new(path)
                .with_context(|| format!("Cannot open event log {}", path.display()))?,
        ),
        None => Box::new(SilentEmitter),
    };
    Ok(EventLog::new(emitter, redaction))
}

/// SSH passwords never show up in events or on the console
fn with_credential_passwords(settings: &Settings, redaction: RedactionConfig) -> RedactionConfig {
    redaction
        .registry
        .add_secrets(settings.credential_store().passwords());
    redaction
}

/// Every platform this agent can dispatch to
fn platforms(
    settings: &Settings,
    local: &LocalDocker,
    sessions: &Arc<SessionManager>,
    archiver: &Arc<dyn Archiver>,
    live: &LiveResources,
    events: &EventLog,
) -> Result<PlatformRegistry> {
    let timeouts = settings.docker.timeouts();
    let dns_hosts = settings.docker.host_entries()?;
    let images = validator(settings, events.clone());

    let mut registry = PlatformRegistry::new()
        .register(
            platform::LINUX,
            Arc::new(
                DockerBuilder::new(
                    Arc::new(local.clone()),
                    images.clone(),
                    archiver.clone(),
                    events.clone(),
                )
                .with_dns_hosts(dns_hosts.clone())
                .with_live_resources(live.clone()),
            ),
        )
        .register(
            platform::RSYNC,
            Arc::new(RsyncDeployer::new(
                sessions.clone(),
                &settings.ssh.rsync_path,
                timeouts,
                events.clone(),
            )),
        );

    let windows = &settings.windows;
    if let (true, Some(builder)) = (windows.is_configured(), windows.builder_key()) {
        let runner: Arc<dyn ScriptRunner> = match windows.transport {
            WindowsTransport::Ssm => Arc::new(SsmRunner::new(
                &windows.aws_path,
                windows.instance_id.as_deref().unwrap_or_default(),
                windows.region.clone(),
            )),
            WindowsTransport::Ssh => {
                Arc::new(SessionScriptRunner::new(sessions.clone(), builder.clone()))
            }
        };
        let driver = WindowsDocker::new(
            runner,
            sessions.clone(),
            builder,
            &windows.staging_dir,
            timeouts,
            events.clone(),
        );
        registry = registry.register(
            platform::WINDOWS,
            Arc::new(
                DockerBuilder::new(Arc::new(driver), images, archiver.clone(), events.clone())
                    .with_dns_hosts(dns_hosts)
                    .with_live_resources(live.clone()),
            ),
        );
    } else {
        debug!("No Windows builder configured");
    }

    Ok(registry)
}

impl Agent {
    pub fn new(
        settings: &Settings,
        redaction: RedactionConfig,
        extra_secrets: &[PathBuf],
    ) -> Result<Self> {
        let redaction = with_credential_passwords(settings, redaction);
        let events = event_log(settings, redaction.clone())?;
        let console = Console::stdout(redaction);
        let archiver: Arc<dyn Archiver> = Arc::new(TarArchiver);
        let sessions = Arc::new(SessionManager::new(
            Arc::new(SshConnector::new(
                settings.ssh.options(),
                settings.credential_store(),
            )),
            events.clone(),
        ));

        let local_docker = LocalDocker::with_path(
            settings.docker.docker_path.clone(),
            events.clone(),
            settings.docker.timeouts(),
        );
        let resources = LiveResources::new();
        let registry = platforms(
            settings,
            &local_docker,
            &sessions,
            &archiver,
            &resources,
            &events,
        )?;
        info!("Platforms available: {}", registry.names().join(", "));

        let cleanup = EmergencyCleanup::new();
        cleanup.install_panic_hook();
        cleanup.spawn_signal_handler();

        let secrets_files = settings
            .secrets_file
            .iter()
            .chain(extra_secrets)
            .cloned()
            .collect();

        Ok(Self {
            pipeline: Pipeline {
                runner: JobRunner::new(registry, events.clone()),
                jobs: Arc::new(FileJobStore::new(&settings.job_dir)),
                fetcher: Arc::new(
                    GitFetcher::new(archiver.clone())
                        .with_git_path(&settings.git_path)
                        .with_timeout(settings.docker.timeouts().internal),
                ),
                artifacts: ArtifactStore::new(&settings.artifact_dir, archiver),
                sessions,
                events,
                console,
                cleanup,
                resources,
                options: PipelineOptions {
                    workspace_root: settings.workspace_root.clone(),
                    default_image: Some(settings.docker.default_image.clone()),
                    secrets_files,
                    env: BTreeMap::new(),
                },
            },
            local_docker,
        })
    }

    pub async fn build(&self, job_id: &str) -> Result<()> {
        // Windows builds do not need a local engine
        if let Err(e) = self.local_docker.check_installed().await {
            warn!("{}", e);
        }
        Ok(self.pipeline.build(job_id).await?)
    }

    pub async fn deploy(&self, job_id: &str) -> Result<()> {
        Ok(self.pipeline.deploy(job_id).await?)
    }
}
