//! Platforms
//!
//! A platform executes one stage of a job. The orchestrator never talks to
//! a platform directly: it hands a [`JobExecution`] to the
//! [`JobRunner`](crate::runner::JobRunner), which looks the platform up in a
//! [`PlatformRegistry`] built at startup.
//!
//! Platforms report a plain `bool` and log the root cause of a failure
//! themselves.

pub mod docker_builder;
pub mod rsync;

use crate::io::Console;
use crate::job::{JobExecution, Properties};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use docker_builder::DockerBuilder;
pub use rsync::RsyncDeployer;

/// Platform names understood out of the box
pub const LINUX: &str = "linux";
pub const WINDOWS: &str = "windows";
pub const RSYNC: &str = "rsync";

/// Executes one stage
#[async_trait]
pub trait Platform: Send + Sync + fmt::Debug {
    /// Run `execution`; `false` once the failure has been logged
    async fn run(&self, console: &Console, execution: &JobExecution, properties: &Properties)
        -> bool;
}

/// Platform name to implementation
#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &str, platform: Arc<dyn Platform>) -> Self {
        self.platforms.insert(name.to_string(), platform);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.platforms.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.platforms.keys().cloned().collect()
    }
}

pub mod mock {
    //! Scripted platform for runner and orchestrator tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One recorded platform invocation
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlatformCall {
        pub stage: String,
        pub steps: Vec<String>,
        pub env: BTreeMap<String, String>,
    }

    #[derive(Debug, Default)]
    struct ScriptState {
        calls: Vec<PlatformCall>,
        results: VecDeque<bool>,
        failing_stages: Vec<String>,
    }

    /// Succeeds unless told otherwise; clones share state
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedPlatform {
        state: Arc<Mutex<ScriptState>>,
    }

    impl ScriptedPlatform {
        pub fn new() -> Self {
            Self::default()
        }

        /// Return `result` for the next invocation
        pub fn push_result(&self, result: bool) {
            self.lock().results.push_back(result);
        }

        /// Always fail `stage`
        pub fn fail_stage(&self, stage: &str) {
            self.lock().failing_stages.push(stage.to_string());
        }

        pub fn calls(&self) -> Vec<PlatformCall> {
            self.lock().calls.clone()
        }

        pub fn stages(&self) -> Vec<String> {
            self.calls().into_iter().map(|c| c.stage).collect()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
            self.state.lock().unwrap_or_else(|p| p.into_inner())
        }
    }

    #[async_trait]
    impl Platform for ScriptedPlatform {
        async fn run(
            &self,
            _console: &Console,
            execution: &JobExecution,
            properties: &Properties,
        ) -> bool {
            let mut state = self.lock();
            state.calls.push(PlatformCall {
                stage: execution.stage.clone(),
                steps: execution.config.steps.clone(),
                env: properties.stage_env(&execution.config),
            });
            if state.failing_stages.contains(&execution.stage) {
                return false;
            }
            state.results.pop_front().unwrap_or(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock::ScriptedPlatform;

    #[test]
    fn test_registry_names_sorted() {
        let registry = PlatformRegistry::new()
            .register(WINDOWS, Arc::new(ScriptedPlatform::new()))
            .register(LINUX, Arc::new(ScriptedPlatform::new()));
        assert_eq!(registry.names(), vec!["linux", "windows"]);
        assert!(registry.get(LINUX).is_some());
        assert!(registry.get("s3").is_none());
    }
}
