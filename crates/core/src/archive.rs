//! Workspace archives
//!
//! Archives going into a container are plain tar (the container copy
//! protocol accepts it as-is); archives coming out are stored gzip'd.
//! Entries are added in lexicographic order relative to the source root.

use crate::errors::ArchiveError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

type Result<T> = std::result::Result<T, ArchiveError>;

/// Packs and unpacks workspace archives
pub trait Archiver: Send + Sync + std::fmt::Debug {
    /// Pack `source` into an uncompressed tar, skipping `exclude` (paths
    /// relative to `source`)
    fn pack_tar(&self, source: &Path, dest: &Path, exclude: &[String]) -> Result<()>;

    /// Pack `source` into a gzip-compressed tar
    fn pack_tar_gz(&self, source: &Path, dest: &Path, exclude: &[String]) -> Result<()>;

    /// Extract a gzip-compressed tar into `dest`
    fn unpack_tar_gz(&self, archive: &Path, dest: &Path) -> Result<()>;

    /// Compress an existing tar file
    fn gzip(&self, tar: &Path, dest: &Path) -> Result<()>;
}

/// [`Archiver`] backed by the `tar` and `flate2` crates
#[derive(Debug, Clone, Default)]
pub struct TarArchiver;

fn collect_entries(
    root: &Path,
    dir: &Path,
    exclude: &[PathBuf],
    out: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(entry.file_name()));
        if exclude.iter().any(|ex| relative.starts_with(ex)) {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        out.push((path.clone(), relative));
        if is_dir {
            collect_entries(root, &path, exclude, out)?;
        }
    }
    Ok(())
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    exclude: &[String],
) -> Result<()> {
    if !source.is_dir() {
        return Err(ArchiveError::SourceNotFound {
            path: source.display().to_string(),
        });
    }
    let exclude: Vec<PathBuf> = exclude
        .iter()
        .map(|e| PathBuf::from(e.trim_start_matches("./").trim_end_matches('/')))
        .filter(|e| !e.as_os_str().is_empty())
        .collect();

    let mut entries = Vec::new();
    collect_entries(source, source, &exclude, &mut entries)?;
    builder.follow_symlinks(false);
    for (path, relative) in entries {
        builder.append_path_with_name(&path, &relative)?;
    }
    Ok(())
}

impl Archiver for TarArchiver {
    #[instrument(skip(self, exclude))]
    fn pack_tar(&self, source: &Path, dest: &Path, exclude: &[String]) -> Result<()> {
        let file = File::create(dest)?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        append_tree(&mut builder, source, exclude)?;
        builder.into_inner()?.flush()?;
        debug!("Packed {} into {}", source.display(), dest.display());
        Ok(())
    }

    #[instrument(skip(self, exclude))]
    fn pack_tar_gz(&self, source: &Path, dest: &Path, exclude: &[String]) -> Result<()> {
        let file = File::create(dest)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append_tree(&mut builder, source, exclude)?;
        builder.into_inner()?.finish()?.flush()?;
        debug!("Packed {} into {}", source.display(), dest.display());
        Ok(())
    }

    #[instrument(skip(self))]
    fn unpack_tar_gz(&self, archive: &Path, dest: &Path) -> Result<()> {
        let file = File::open(archive).map_err(|_| ArchiveError::SourceNotFound {
            path: archive.display().to_string(),
        })?;
        std::fs::create_dir_all(dest)?;
        let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        tar.set_preserve_permissions(true);
        tar.unpack(dest)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn gzip(&self, tar: &Path, dest: &Path) -> Result<()> {
        let mut input = File::open(tar).map_err(|_| ArchiveError::SourceNotFound {
            path: tar.display().to_string(),
        })?;
        let output = File::create(dest)?;
        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(root: &Path) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("src/main.c"), "int main() {}").unwrap();
        std::fs::write(root.join("Makefile"), "all:").unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
    }

    fn names(tar_path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(tar_path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path().unwrap().display().to_string();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_pack_tar_sorted_with_excludes() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src-root");
        fixture(&src);
        let dest = temp.path().join("out.tar");

        TarArchiver
            .pack_tar(&src, &dest, &["node_modules/".to_string()])
            .unwrap();

        let names = names(&dest);
        assert_eq!(names, vec!["Makefile", "src", "src/main.c"]);
    }

    #[test]
    fn test_gz_roundtrip_restores_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("in");
        fixture(&src);
        let archive = temp.path().join("out.tar.gz");
        let dest = temp.path().join("restored");

        TarArchiver.pack_tar_gz(&src, &archive, &[]).unwrap();
        TarArchiver.unpack_tar_gz(&archive, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("src/main.c")).unwrap(),
            "int main() {}"
        );
        assert!(dest.join("node_modules/pkg/index.js").exists());
    }

    #[test]
    fn test_gzip_existing_tar() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("in");
        fixture(&src);
        let tar_path = temp.path().join("plain.tar");
        let gz_path = temp.path().join("plain.tar.gz");
        let dest = temp.path().join("out");

        TarArchiver.pack_tar(&src, &tar_path, &[]).unwrap();
        TarArchiver.gzip(&tar_path, &gz_path).unwrap();
        TarArchiver.unpack_tar_gz(&gz_path, &dest).unwrap();
        assert!(dest.join("Makefile").exists());
    }

    #[test]
    fn test_missing_source() {
        let temp = TempDir::new().unwrap();
        let err = TarArchiver
            .pack_tar(&temp.path().join("nope"), &temp.path().join("x.tar"), &[])
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SourceNotFound { .. }));
    }
}
