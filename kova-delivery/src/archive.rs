//! Zip archives attached to bulk jobs.
//!
//! Archives are written on the blocking pool so compression never stalls the
//! dispatcher.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use kova_common::tracing;
use ulid::Ulid;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{ArchiveSpec, AttachmentSpec, MailError};

/// An archive on disk, ready to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArchive {
    pub path: PathBuf,
    /// Name presented to the recipient
    pub display_name: String,
    /// Entries actually written
    pub entries: usize,
}

impl BuiltArchive {
    #[must_use]
    pub fn attachment(&self) -> AttachmentSpec {
        AttachmentSpec::named(&self.path, &self.display_name)
    }

    /// Delete the archive file.
    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!(path = %self.path.display(), "Could not remove archive: {e}");
        }
    }
}

/// Build `spec` into a uniquely named file under `temp_dir`.
///
/// Missing entries are skipped with a warning.
///
/// # Errors
///
/// [`MailError::Archive`] when no entry could be written or the file could
/// not be created.
pub async fn build_archive(spec: &ArchiveSpec, temp_dir: &Path) -> Result<BuiltArchive, MailError> {
    let mut spec = spec.clone();
    spec.file_name = bare_file_name(&spec.file_name);
    let path = temp_dir.join(format!("{}-{}", Ulid::new(), spec.file_name));

    let task_path = path.clone();
    let written = tokio::task::spawn_blocking(move || write_archive(&spec, &task_path))
        .await
        .map_err(|e| MailError::Archive(format!("archive task failed: {e}")))?;

    match written {
        Ok((display_name, entries)) => {
            tracing::info!(
                archive = %display_name,
                entries,
                path = %path.display(),
                "Archive built"
            );
            Ok(BuiltArchive {
                path,
                display_name,
                entries,
            })
        }
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                tracing::trace!("No partial archive to remove: {cleanup}");
            }
            Err(e)
        }
    }
}

/// Last path component only, so the archive always lands inside `temp_dir`.
fn bare_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| "archive.zip".to_string(), str::to_string)
}

fn write_archive(spec: &ArchiveSpec, path: &Path) -> Result<(String, usize), MailError> {
    let present: Vec<_> = spec
        .entries
        .iter()
        .filter(|entry| {
            let exists = entry.path.is_file();
            if !exists {
                tracing::warn!(path = %entry.path.display(), "Archive entry missing, skipping");
            }
            exists
        })
        .collect();

    if present.is_empty() {
        return Err(MailError::Archive(format!(
            "no files to put in {}",
            spec.file_name
        )));
    }

    let archive_error = |e: &dyn std::fmt::Display| MailError::Archive(format!("{}: {e}", spec.file_name));

    let file = File::create(path).map_err(|e| archive_error(&e))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in &present {
        writer
            .start_file(entry.name.as_str(), options)
            .map_err(|e| archive_error(&e))?;
        let mut source = File::open(&entry.path).map_err(|e| archive_error(&e))?;
        std::io::copy(&mut source, &mut writer).map_err(|e| archive_error(&e))?;
    }

    let mut inner = writer.finish().map_err(|e| archive_error(&e))?;
    inner.flush().map_err(|e| archive_error(&e))?;

    Ok((spec.file_name.clone(), present.len()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::ArchiveEntry;

    #[tokio::test]
    async fn test_builds_archive_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("Ankara.xlsx");
        std::fs::write(&first, b"ankara rows").unwrap();

        let spec = ArchiveSpec {
            file_name: "output.zip".to_string(),
            entries: vec![
                ArchiveEntry {
                    path: first,
                    name: "output/Ankara.xlsx".to_string(),
                },
                ArchiveEntry {
                    path: dir.path().join("gone.xlsx"),
                    name: "output/gone.xlsx".to_string(),
                },
            ],
        };

        let built = build_archive(&spec, dir.path()).await.unwrap();
        assert_eq!(built.entries, 1);
        assert_eq!(built.display_name, "output.zip");
        assert_eq!(built.attachment().file_name(), "output.zip");

        let mut zip = zip::ZipArchive::new(File::open(&built.path).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut content = String::new();
        zip.by_name("output/Ankara.xlsx")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "ankara rows");

        let path = built.path.clone();
        built.remove().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_name_cannot_leave_temp_dir() {
        let root = tempfile::tempdir().unwrap();
        let temp_dir = root.path().join("tmp");
        std::fs::create_dir(&temp_dir).unwrap();
        let rows = root.path().join("Konya.xlsx");
        std::fs::write(&rows, b"konya rows").unwrap();

        let spec = ArchiveSpec {
            file_name: "../escaped.zip".to_string(),
            entries: vec![ArchiveEntry {
                path: rows,
                name: "Konya.xlsx".to_string(),
            }],
        };

        let built = build_archive(&spec, &temp_dir).await.unwrap();
        assert_eq!(built.path.parent(), Some(temp_dir.as_path()));
        assert_eq!(built.display_name, "escaped.zip");
        assert!(std::fs::read_dir(root.path()).unwrap().all(|entry| {
            !entry.unwrap().file_name().to_string_lossy().ends_with(".zip")
        }));
    }

    #[test]
    fn test_bare_file_name() {
        assert_eq!(bare_file_name("output.zip"), "output.zip");
        assert_eq!(bare_file_name("/etc/cron.d/x.zip"), "x.zip");
        assert_eq!(bare_file_name(".."), "archive.zip");
        assert_eq!(bare_file_name(""), "archive.zip");
    }

    #[tokio::test]
    async fn test_empty_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ArchiveSpec {
            file_name: "output.zip".to_string(),
            entries: vec![ArchiveEntry {
                path: dir.path().join("missing.xlsx"),
                name: "missing.xlsx".to_string(),
            }],
        };

        let error = build_archive(&spec, dir.path()).await.unwrap_err();
        assert!(matches!(error, MailError::Archive(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
