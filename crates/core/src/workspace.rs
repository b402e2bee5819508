//! Per-job workspace directories
//!
//! Each job gets `<workspace_root>/<job_id>-<suffix>/` holding:
//!
//! * `source/` - unpacked source or artifact, shared by all stages
//! * `scratch/` - per-stage archives, named uniquely per call
//!
//! The whole directory is removed by the emergency cleanup.

use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Random lowercase alphanumeric suffix
pub fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    root: PathBuf,
}

impl JobWorkspace {
    /// Create a fresh workspace for `job_id` under `workspace_root`
    #[instrument]
    pub fn create(workspace_root: &Path, job_id: &str) -> std::io::Result<Self> {
        let root = workspace_root.join(format!("{}-{}", job_id, random_suffix(8)));
        let workspace = Self { root };
        std::fs::create_dir_all(workspace.source())?;
        std::fs::create_dir_all(workspace.scratch())?;
        debug!("Created workspace {}", workspace.root.display());
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Unique path in the scratch directory, e.g. `build-k3x9q2ab.tar`
    pub fn scratch_file(&self, prefix: &str, extension: &str) -> PathBuf {
        scratch_file(&self.scratch(), prefix, extension)
    }

    /// Remove the workspace; missing directories are fine
    pub fn remove(&self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => debug!("Removed workspace {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.root.display(), e),
        }
    }
}

/// Unique file path in `dir`
pub fn scratch_file(dir: &Path, prefix: &str, extension: &str) -> PathBuf {
    dir.join(format!("{}-{}.{}", prefix, random_suffix(8), extension))
}
