//! Docker-backed build stages
//!
//! One stage runs as:
//!
//! ```text
//! validate images -> pack workspace -> create volume -> create setup container
//!   -> copy in -> [create step container -> start]* -> copy out -> cleanup
//! ```
//!
//! The volume carries state between steps; every step gets a fresh container
//! on it. A step written as `docker:<image> <command>` switches the image for
//! itself and every following step until the next switch.
//!
//! Every container and the volume are removed before `run` returns, whatever
//! happened. Nothing is created when image validation fails. While a stage
//! runs, its containers and volume are tracked in [`LiveResources`] so the
//! emergency cleanup can remove them if the process is interrupted.

use crate::archive::Archiver;
use crate::docker::{ContainerDriver, ContainerSpec, HostEntry, LiveResources, Resource};
use crate::events::EventLog;
use crate::image::ImageValidator;
use crate::io::Console;
use crate::job::{JobExecution, Properties};
use crate::platform::Platform;
use crate::workspace::{random_suffix, scratch_file};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Prefix selecting another image for a step
pub const IMAGE_PREFIX: &str = "docker:";

/// A user step resolved to the image it runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub image: String,
    pub command: String,
}

/// Assign an image to every step
///
/// Steps inherit the image of the closest preceding `docker:` step, or
/// `default_image`. A `docker:` step without a command is an error.
pub fn plan_steps(default_image: &str, steps: &[String]) -> Result<Vec<PlannedStep>, String> {
    let mut image = default_image.to_string();
    let mut planned = Vec::with_capacity(steps.len());
    for step in steps {
        let step = step.trim();
        let command = match step.strip_prefix(IMAGE_PREFIX) {
            Some(rest) => {
                let (selected, command) = rest
                    .split_once(char::is_whitespace)
                    .map(|(i, c)| (i, c.trim()))
                    .unwrap_or((rest, ""));
                if selected.is_empty() || command.is_empty() {
                    return Err(format!("'{}' needs both an image and a command", step));
                }
                image = selected.to_string();
                command
            }
            None => step,
        };
        planned.push(PlannedStep {
            image: image.clone(),
            command: command.to_string(),
        });
    }
    Ok(planned)
}

/// Runs stages in containers through a [`ContainerDriver`]
#[derive(Debug, Clone)]
pub struct DockerBuilder {
    driver: Arc<dyn ContainerDriver>,
    validator: ImageValidator,
    archiver: Arc<dyn Archiver>,
    dns_hosts: Vec<HostEntry>,
    live: LiveResources,
    events: EventLog,
}

/// Names created for one stage
struct StageResources {
    volume: String,
    setup: String,
    containers: Vec<String>,
    archives: Vec<PathBuf>,
}

impl DockerBuilder {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        validator: ImageValidator,
        archiver: Arc<dyn Archiver>,
        events: EventLog,
    ) -> Self {
        Self {
            driver,
            validator,
            archiver,
            dns_hosts: Vec::new(),
            live: LiveResources::new(),
            events,
        }
    }

    pub fn with_dns_hosts(mut self, hosts: Vec<HostEntry>) -> Self {
        self.dns_hosts = hosts;
        self
    }

    /// Share the registry the emergency cleanup drains
    pub fn with_live_resources(mut self, live: LiveResources) -> Self {
        self.live = live;
        self
    }

    fn add_container(&self, resources: &mut StageResources, name: &str) {
        self.live
            .track(&self.driver, Resource::Container(name.to_string()));
        resources.containers.push(name.to_string());
    }

    /// Validate every distinct image; `None` stops the stage
    fn resolve_images(&self, steps: &[PlannedStep]) -> Option<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        for step in steps {
            if resolved.contains_key(&step.image) {
                continue;
            }
            let image = self.validator.validate(&step.image)?;
            resolved.insert(step.image.clone(), image);
        }
        Some(resolved)
    }

    fn spec(&self, image: &str, name: &str, volume: &str, env: &BTreeMap<String, String>) -> ContainerSpec {
        ContainerSpec::new(image, name, volume)
            .with_env(env.clone())
            .with_dns_hosts(self.dns_hosts.clone())
    }

    fn archive_failed(&self, action: &str, path: &Path, error: impl std::fmt::Display) -> bool {
        self.events.failure(
            &format!("{} failed", action),
            json!({ "path": path.display().to_string(), "error": error.to_string() }),
        );
        false
    }

    /// Everything between packing and cleanup; records what it creates
    async fn lifecycle(
        &self,
        console: &Console,
        execution: &JobExecution,
        properties: &Properties,
        steps: &[PlannedStep],
        images: &BTreeMap<String, String>,
        resources: &mut StageResources,
    ) -> bool {
        let env = properties.stage_env(&execution.config);
        let volume = resources.volume.clone();

        let input = scratch_file(&properties.scratch, &execution.stage, "tar");
        resources.archives.push(input.clone());
        if let Err(e) = self.archiver.pack_tar(&properties.workspace, &input, &[]) {
            return self.archive_failed("Packing workspace", &input, e);
        }

        self.live.track(&self.driver, Resource::Volume(volume.clone()));
        if !self.driver.create_volume(&volume).await {
            return false;
        }

        let first_image = &images[&steps[0].image];
        let setup = resources.setup.clone();
        self.add_container(resources, &setup);
        if !self
            .driver
            .create_container(&self.spec(first_image, &resources.setup, &volume, &env))
            .await
        {
            return false;
        }
        if !self.driver.copy_into_container(&resources.setup, &input).await {
            return false;
        }

        let total = steps.len();
        for (index, step) in steps.iter().enumerate() {
            let label = execution.step_label(index + 1, total);
            let name = format!("{}-step{}", volume, index + 1);
            console.line(&format!("--> {}: {}", label, step.command));
            self.add_container(resources, &name);

            let spec = self
                .spec(&images[&step.image], &name, &volume, &env)
                .with_command(&step.command);
            let ok = self.driver.create_container(&spec).await
                && self
                    .driver
                    .start_user_container(&name, &step.command, &label)
                    .await;
            if !ok {
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

        let output = scratch_file(&properties.scratch, &execution.stage, "tar.gz");
        resources.archives.push(output.clone());
        if !self.driver.copy_from_container(&resources.setup, &output).await {
            return false;
        }
        if let Err(e) = self.archiver.unpack_tar_gz(&output, &properties.workspace) {
            return self.archive_failed("Unpacking build output", &output, e);
        }
        true
    }

    async fn cleanup(&self, resources: &StageResources) {
        for container in &resources.containers {
            self.driver.cleanup_container(container).await;
            self.live.release(&Resource::Container(container.clone()));
        }
        self.driver.cleanup_volume(&resources.volume).await;
        self.live.release(&Resource::Volume(resources.volume.clone()));
        for archive in &resources.archives {
            let _ = std::fs::remove_file(archive);
        }
    }
}

#[async_trait]
impl Platform for DockerBuilder {
    #[instrument(skip_all, fields(stage = %execution.stage, job = %properties.job.id))]
    async fn run(
        &self,
        console: &Console,
        execution: &JobExecution,
        properties: &Properties,
    ) -> bool {
        let config = &execution.config;
        if config.steps.is_empty() {
            debug!("No steps configured");
            return true;
        }

        let Some(default_image) = config.image.as_deref() else {
            self.events.failure(
                "No Docker image configured",
                json!({ "stage": execution.stage }),
            );
            return false;
        };

        let steps = match plan_steps(default_image, &config.steps) {
            Ok(steps) => steps,
            Err(reason) => {
                self.events
                    .failure(&format!("Invalid {} step", execution.stage), json!({ "reason": reason }));
                return false;
            }
        };

        let Some(images) = self.resolve_images(&steps) else {
            return false;
        };

        let volume = format!("rigger-{}-{}", properties.job.id, random_suffix(6));
        let mut resources = StageResources {
            setup: format!("{}-setup", volume),
            volume,
            containers: Vec::new(),
            archives: Vec::new(),
        };

        let ok = self
            .lifecycle(console, execution, properties, &steps, &images, &mut resources)
            .await;
        self.cleanup(&resources).await;
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TarArchiver;
    use crate::docker::mock::{DriverCall, DriverOp, RecordingDriver};
    use crate::job::{Job, JobKind, StageConfig};
    use tempfile::TempDir;

    fn setup(temp: &TempDir, steps: &[&str]) -> (JobExecution, Properties) {
        let workspace = temp.path().join("source");
        let scratch = temp.path().join("scratch");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(workspace.join("Makefile"), "all:\n").unwrap();
        let config = StageConfig {
            image: Some("gcc:13".to_string()),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            dist: ".".to_string(),
            ..StageConfig::default()
        };
        (
            JobExecution::new("linux", "build", config),
            Properties::new(Job::new("b7", JobKind::Build, "shop"), workspace, scratch),
        )
    }

    fn builder(driver: &RecordingDriver, events: EventLog) -> DockerBuilder {
        DockerBuilder::new(
            Arc::new(driver.clone()),
            ImageValidator::new(None, events.clone()),
            Arc::new(TarArchiver),
            events,
        )
    }

    #[test]
    fn test_plan_steps_switches_image() {
        let steps: Vec<String> = ["make", "docker:node:20 npm ci", "npm test", "docker:gcc:13 make install"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let planned = plan_steps("gcc:13", &steps).unwrap();
        let images: Vec<&str> = planned.iter().map(|p| p.image.as_str()).collect();
        assert_eq!(images, vec!["gcc:13", "node:20", "node:20", "gcc:13"]);
        assert_eq!(planned[1].command, "npm ci");
        assert!(plan_steps("gcc:13", &["docker:node:20".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_step_containers_use_switched_image() {
        let temp = TempDir::new().unwrap();
        let (execution, properties) = setup(&temp, &["make", "docker:node:20 npm test"]);
        let driver = RecordingDriver::new();
        assert!(builder(&driver, EventLog::silent())
            .run(&Console::sink(), &execution, &properties)
            .await);

        let images: Vec<(String, Option<String>)> = driver
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::CreateContainer { image, command, .. } => Some((image, command)),
                _ => None,
            })
            .collect();
        assert_eq!(
            images,
            vec![
                ("gcc:13".to_string(), None),
                ("gcc:13".to_string(), Some("make".to_string())),
                ("node:20".to_string(), Some("npm test".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_image_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let (execution, properties) = setup(&temp, &["make"]);
        let driver = RecordingDriver::new();
        let (events, memory) = EventLog::memory();
        let builder = DockerBuilder::new(
            Arc::new(driver.clone()),
            ImageValidator::new(None, events.clone()).allow("gcc", ["12"]),
            Arc::new(TarArchiver),
            events,
        );
        assert!(!builder.run(&Console::sink(), &execution, &properties).await);
        assert!(driver.calls().is_empty());
        assert!(memory.contains_message("Docker image gcc:13 is not allowed"));
    }

    #[tokio::test]
    async fn test_volume_failure_still_cleans_volume() {
        let temp = TempDir::new().unwrap();
        let (execution, properties) = setup(&temp, &["make"]);
        let driver = RecordingDriver::new();
        driver.fail(DriverOp::CreateVolume, "");
        assert!(!builder(&driver, EventLog::silent())
            .run(&Console::sink(), &execution, &properties)
            .await);
        let calls = driver.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[1], DriverCall::CleanupVolume(_)));
    }

    #[tokio::test]
    async fn test_scratch_archives_removed() {
        let temp = TempDir::new().unwrap();
        let (execution, properties) = setup(&temp, &["make"]);
        let driver = RecordingDriver::new();
        assert!(builder(&driver, EventLog::silent())
            .run(&Console::sink(), &execution, &properties)
            .await);
        assert_eq!(std::fs::read_dir(&properties.scratch).unwrap().count(), 0);
    }
}
