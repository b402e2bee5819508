//! Source download
//!
//! A job's source is either a git URL, cloned shallowly at the requested
//! reference, or a local directory, copied through the archiver so the same
//! exclusion and ordering rules apply as for container archives.

use crate::archive::Archiver;
use crate::errors::SourceError;
use crate::job::JobSource;
use crate::process::{self, ProcessOptions};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Time allowed for a clone
pub const DEFAULT_CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// Places a job's source into a directory
#[async_trait]
pub trait SourceFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, source: &JobSource, dest: &Path) -> Result<(), SourceError>;
}

/// Whether `url` names a local directory rather than a remote repository
pub fn is_local(url: &str) -> bool {
    url.starts_with('/') || url.starts_with("./") || url.starts_with("file://")
}

/// Fetches git URLs with `git clone` and local paths by copying
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git_path: String,
    timeout: Duration,
    archiver: Arc<dyn Archiver>,
}

impl GitFetcher {
    pub fn new(archiver: Arc<dyn Archiver>) -> Self {
        Self {
            git_path: "git".to_string(),
            timeout: DEFAULT_CLONE_TIMEOUT,
            archiver,
        }
    }

    pub fn with_git_path(mut self, git_path: &str) -> Self {
        self.git_path = git_path.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `git clone` argv for `source` into `dest`
    pub fn clone_argv(&self, source: &JobSource, dest: &Path) -> Vec<String> {
        let mut argv = vec![
            self.git_path.clone(),
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
        ];
        if let Some(reference) = &source.reference {
            argv.extend(["--branch".to_string(), reference.clone()]);
        }
        argv.extend([
            "--".to_string(),
            source.url.clone(),
            dest.display().to_string(),
        ]);
        argv
    }

    fn copy_local(&self, path: &Path, dest: &Path) -> Result<(), SourceError> {
        if !path.is_dir() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }
        let scratch = dest.with_extension("source.tar.gz");
        let copy = || -> Result<(), crate::errors::ArchiveError> {
            self.archiver.pack_tar_gz(path, &scratch, &[".git".to_string()])?;
            self.archiver.unpack_tar_gz(&scratch, dest)
        };
        let result = copy();
        let _ = std::fs::remove_file(&scratch);
        result.map_err(|e| SourceError::CloneFailed(e.to_string()))
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    #[instrument(skip(self), fields(url = %source.url))]
    async fn fetch(&self, source: &JobSource, dest: &Path) -> Result<(), SourceError> {
        if is_local(&source.url) {
            let path = source.url.trim_start_matches("file://");
            debug!("Copying local source {}", path);
            return self.copy_local(Path::new(path), dest);
        }

        let outcome = process::run(
            &self.clone_argv(source, dest),
            &ProcessOptions::with_timeout(self.timeout),
        )
        .await;
        if outcome.success() {
            debug!("Cloned {} into {}", source.url, dest.display());
            return Ok(());
        }
        let reason = if outcome.timed_out() {
            format!("timed out after {} seconds", self.timeout.as_secs())
        } else {
            outcome.stderr.trim().to_string()
        };
        Err(SourceError::CloneFailed(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TarArchiver;
    use tempfile::TempDir;

    #[test]
    fn test_clone_argv() {
        let fetcher = GitFetcher::new(Arc::new(TarArchiver));
        let source = JobSource {
            url: "https://git.example.com/shop.git".to_string(),
            reference: Some("release/2.1".to_string()),
        };
        assert_eq!(
            fetcher.clone_argv(&source, Path::new("/w/src")),
            vec![
                "git",
                "clone",
                "--depth",
                "1",
                "--branch",
                "release/2.1",
                "--",
                "https://git.example.com/shop.git",
                "/w/src"
            ]
        );
    }

    #[tokio::test]
    async fn test_local_source_copied_without_git_dir() {
        let temp = TempDir::new().unwrap();
        let origin = temp.path().join("origin");
        std::fs::create_dir_all(origin.join(".git")).unwrap();
        std::fs::create_dir_all(origin.join("src")).unwrap();
        std::fs::write(origin.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(origin.join("src/main.c"), "int main;").unwrap();

        let dest = temp.path().join("work");
        let fetcher = GitFetcher::new(Arc::new(TarArchiver));
        let source = JobSource {
            url: origin.display().to_string(),
            reference: None,
        };
        fetcher.fetch(&source, &dest).await.unwrap();

        assert!(dest.join("src/main.c").exists());
        assert!(!dest.join(".git").exists());
    }

    #[tokio::test]
    async fn test_missing_local_source() {
        let temp = TempDir::new().unwrap();
        let fetcher = GitFetcher::new(Arc::new(TarArchiver));
        let source = JobSource {
            url: temp.path().join("nope").display().to_string(),
            reference: None,
        };
        assert!(matches!(
            fetcher.fetch(&source, &temp.path().join("work")).await,
            Err(SourceError::NotFound(_))
        ));
    }
}
