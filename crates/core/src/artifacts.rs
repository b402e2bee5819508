//! Build artifact storage
//!
//! A successful build's `dist` directory is kept as
//! `<artifact_dir>/<build_id>.tar.gz`; releases unpack it again.

use crate::archive::Archiver;
use crate::errors::ArchiveError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    archiver: Arc<dyn Archiver>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            dir: dir.into(),
            archiver,
        }
    }

    pub fn path_for(&self, build_id: &str) -> PathBuf {
        self.dir.join(format!("{}.tar.gz", build_id))
    }

    pub fn exists(&self, build_id: &str) -> bool {
        self.path_for(build_id).is_file()
    }

    /// Archive `dist_dir` for `build_id`, replacing any earlier artifact
    #[instrument(skip(self, exclude))]
    pub fn store(
        &self,
        build_id: &str,
        dist_dir: &Path,
        exclude: &[String],
    ) -> Result<PathBuf, ArchiveError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(build_id);
        let partial = path.with_extension("partial");
        self.archiver.pack_tar_gz(dist_dir, &partial, exclude)?;
        std::fs::rename(&partial, &path)?;
        debug!("Stored artifact {}", path.display());
        Ok(path)
    }

    /// Unpack the artifact of `build_id` into `dest`
    #[instrument(skip(self))]
    pub fn fetch(&self, build_id: &str, dest: &Path) -> Result<(), ArchiveError> {
        let path = self.path_for(build_id);
        if !path.is_file() {
            return Err(ArchiveError::SourceNotFound {
                path: path.display().to_string(),
            });
        }
        self.archiver.unpack_tar_gz(&path, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TarArchiver;
    use tempfile::TempDir;

    #[test]
    fn test_store_then_fetch() {
        let temp = TempDir::new().unwrap();
        let dist = temp.path().join("dist");
        std::fs::create_dir_all(dist.join("logs")).unwrap();
        std::fs::write(dist.join("app.bin"), b"\x7fELF").unwrap();
        std::fs::write(dist.join("logs/build.log"), "noise").unwrap();

        let store = ArtifactStore::new(temp.path().join("artifacts"), Arc::new(TarArchiver));
        let path = store.store("b9", &dist, &["logs".to_string()]).unwrap();
        assert!(path.ends_with("b9.tar.gz"));
        assert!(store.exists("b9"));

        let dest = temp.path().join("release");
        store.fetch("b9", &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("app.bin")).unwrap(), b"\x7fELF");
        assert!(!dest.join("logs").exists());
    }

    #[test]
    fn test_fetch_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path(), Arc::new(TarArchiver));
        assert!(matches!(
            store.fetch("b404", temp.path()),
            Err(ArchiveError::SourceNotFound { .. })
        ));
    }
}
