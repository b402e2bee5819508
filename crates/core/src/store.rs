//! Job persistence
//!
//! Jobs are created by whatever manages builds and releases; the agent only
//! loads one, updates its status and writes it back.

use crate::errors::JobError;
use crate::job::Job;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Load and save jobs
pub trait JobStore: Send + Sync + std::fmt::Debug {
    fn load(&self, id: &str) -> Result<Job, JobError>;
    fn save(&self, job: &Job) -> Result<(), JobError>;
}

/// One JSON document per job: `<dir>/<id>.json`
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, JobError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !id.starts_with('.');
        if !valid {
            return Err(JobError::NotFound { id: id.to_string() });
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

impl JobStore for FileJobStore {
    fn load(&self, id: &str) -> Result<Job, JobError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(JobError::NotFound { id: id.to_string() });
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| JobError::Corrupt {
            id: id.to_string(),
            message: e.to_string(),
        })
    }

    fn save(&self, job: &Job) -> Result<(), JobError> {
        let path = self.path_for(&job.id)?;
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(job).map_err(|e| JobError::Corrupt {
            id: job.id.clone(),
            message: e.to_string(),
        })?;
        // Write-then-rename: readers never see a partial document
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!("Saved job {} as {}", job.id, job.status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, JobStatus};
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = FileJobStore::new(temp.path().join("jobs"));
        let mut job = Job::new("b100", JobKind::Build, "shop");
        job.start().unwrap();
        store.save(&job).unwrap();

        let loaded = store.load("b100").unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.application, "shop");
        assert!(temp.path().join("jobs/b100.json").exists());
    }

    #[test]
    fn test_missing_job() {
        let temp = TempDir::new().unwrap();
        let store = FileJobStore::new(temp.path());
        assert!(matches!(store.load("b1"), Err(JobError::NotFound { .. })));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let store = FileJobStore::new(temp.path());
        assert!(matches!(
            store.load("../etc/passwd"),
            Err(JobError::NotFound { .. })
        ));
    }

    #[test]
    fn test_corrupt_document() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("b2.json"), "{ not json").unwrap();
        let store = FileJobStore::new(temp.path());
        assert!(matches!(store.load("b2"), Err(JobError::Corrupt { .. })));
    }
}
