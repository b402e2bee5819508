//! Platform dispatch
//!
//! [`JobRunner::run`] looks up the platform named by an execution and hands
//! the stage over. An unknown platform is a configuration error that is
//! logged with every valid name. A platform's own result is returned
//! unchanged; the platform has already logged why it failed, so only a
//! generic stage failure is added here.

use crate::errors::ConfigError;
use crate::events::{EventLog, StageStatus};
use crate::io::Console;
use crate::job::{JobExecution, Properties};
use crate::platform::PlatformRegistry;
use serde_json::json;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct JobRunner {
    platforms: PlatformRegistry,
    events: EventLog,
}

impl JobRunner {
    pub fn new(platforms: PlatformRegistry, events: EventLog) -> Self {
        Self { platforms, events }
    }

    pub fn platforms(&self) -> &PlatformRegistry {
        &self.platforms
    }

    #[instrument(skip_all, fields(platform = %execution.platform, stage = %execution.stage))]
    pub async fn run(
        &self,
        console: &Console,
        execution: &JobExecution,
        properties: &Properties,
    ) -> bool {
        let Some(platform) = self.platforms.get(&execution.platform) else {
            let error = ConfigError::UnknownPlatform {
                name: execution.platform.clone(),
                valid: self.platforms.names(),
            };
            self.events.failure(
                &error.to_string(),
                json!({ "platform": execution.platform, "valid": self.platforms.names() }),
            );
            return false;
        };

        self.events.set_stage(&execution.stage, StageStatus::Running);
        debug!("Dispatching to platform {}", execution.platform);
        let ok = platform.run(console, execution, properties).await;
        if !ok {
            self.events.failure(
                &format!("Stage {} failed", execution.stage),
                json!({ "platform": execution.platform }),
            );
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobKind, StageConfig};
    use crate::platform::mock::ScriptedPlatform;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn properties() -> Properties {
        Properties::new(
            Job::new("b5", JobKind::Build, "shop"),
            PathBuf::from("/w"),
            PathBuf::from("/s"),
        )
    }

    #[tokio::test]
    async fn test_unknown_platform_lists_valid_names() {
        let platform = ScriptedPlatform::new();
        let (events, memory) = EventLog::memory();
        let runner = JobRunner::new(
            PlatformRegistry::new()
                .register("linux", Arc::new(platform.clone()))
                .register("rsync", Arc::new(platform.clone())),
            events,
        );
        let execution = JobExecution::new("mainframe", "build", StageConfig::default());

        assert!(!runner.run(&Console::sink(), &execution, &properties()).await);
        assert!(platform.calls().is_empty());
        assert!(memory
            .contains_message("Unknown platform 'mainframe'. Valid platforms: linux, rsync"));
    }

    #[tokio::test]
    async fn test_result_propagated_with_single_generic_failure() {
        let platform = ScriptedPlatform::new();
        platform.push_result(true);
        platform.push_result(false);
        let (events, memory) = EventLog::memory();
        let runner = JobRunner::new(
            PlatformRegistry::new().register("linux", Arc::new(platform.clone())),
            events.clone(),
        );
        let execution = JobExecution::new("linux", "build", StageConfig::default());

        assert!(runner.run(&Console::sink(), &execution, &properties()).await);
        assert_eq!(events.current_stage().as_deref(), Some("build"));
        assert!(memory.messages().is_empty());

        assert!(!runner.run(&Console::sink(), &execution, &properties()).await);
        let failures: Vec<_> = memory
            .messages()
            .into_iter()
            .filter_map(|e| e.message().map(str::to_string))
            .collect();
        assert_eq!(failures, vec!["Stage build failed"]);
    }
}
