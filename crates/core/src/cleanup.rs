//! Emergency cleanup
//!
//! Once a job's configuration resolves, the orchestrator registers one
//! closure that removes leftover containers and volumes, disconnects every
//! remote session and removes the workspace.
//! The closure can be triggered from four places: the failure path, the
//! success path, a [`CleanupGuard`] dropped during unwinding, and the
//! panic/signal handlers. It runs at most once: the first trigger takes it
//! out of the slot and later triggers find the slot empty.

use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Exit code after SIGINT
pub const SIGINT_EXIT_CODE: i32 = 130;

/// Exit code after SIGTERM
pub const SIGTERM_EXIT_CODE: i32 = 143;

/// One-shot cleanup slot shared by every trigger
#[derive(Clone, Default)]
pub struct EmergencyCleanup {
    slot: Arc<Mutex<Option<CleanupFn>>>,
}

impl std::fmt::Debug for EmergencyCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyCleanup")
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl EmergencyCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm with `cleanup`; replaces a closure that has not run yet
    pub fn register<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            warn!("Replacing an emergency cleanup that never ran");
        }
        *slot = Some(Box::new(cleanup));
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Run the registered closure if it has not run yet
    ///
    /// Returns whether this call performed the cleanup.
    pub fn run(&self) -> bool {
        let cleanup = self.slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        match cleanup {
            Some(cleanup) => {
                debug!("Running emergency cleanup");
                cleanup();
                true
            }
            None => false,
        }
    }

    /// Guard that triggers the cleanup when dropped
    pub fn guard(&self) -> CleanupGuard {
        CleanupGuard {
            cleanup: self.clone(),
        }
    }

    /// Trigger the cleanup before the previous panic hook runs
    pub fn install_panic_hook(&self) {
        let cleanup = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            cleanup.run();
            previous(info);
        }));
    }

    /// Trigger the cleanup on SIGINT/SIGTERM, then exit
    ///
    /// Commands already running on remote hosts are not interrupted; the
    /// registered closure releases containers, volumes, sessions and local
    /// directories.
    pub fn spawn_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        let cleanup = self.clone();
        tokio::spawn(async move {
            let code = wait_for_signal().await;
            warn!("Interrupted, cleaning up");
            cleanup.run();
            std::process::exit(code);
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = tokio::signal::ctrl_c() => SIGINT_EXIT_CODE,
            _ = terminate.recv() => SIGTERM_EXIT_CODE,
        },
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            SIGINT_EXIT_CODE
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    SIGINT_EXIT_CODE
}

/// Runs the cleanup when dropped, including during unwinding
#[derive(Debug)]
pub struct CleanupGuard {
    cleanup: EmergencyCleanup,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.cleanup.run();
    }
}
