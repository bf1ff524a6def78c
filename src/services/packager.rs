use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

use super::converter::OutputRef;
use crate::config::StorageConfig;

/// Location of a packaged job archive
pub type ArchiveRef = String;

pub const RESULT_ARCHIVE_NAME: &str = "result.zip";

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("I/O error while packaging: {0}")]
    Io(#[from] io::Error),

    #[error("Archive write failed: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Packaging task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait Packager: Send + Sync + 'static {
    /// Bundle the completed outputs of `job_id`. Called at most once per job,
    /// with at least one output.
    async fn package(&self, job_id: Uuid, outputs: &[OutputRef])
        -> Result<ArchiveRef, PackagingError>;
}

/// Writes `<work_dir>/<job_id>/result.zip` with one deflated entry per output
#[derive(Debug, Clone)]
pub struct ZipPackager {
    work_dir: PathBuf,
}

impl ZipPackager {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(&storage.work_dir)
    }

    fn write_archive(archive_path: &Path, outputs: &[OutputRef]) -> Result<(), PackagingError> {
        if let Some(parent) = archive_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = zip::ZipWriter::new(File::create(archive_path)?);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        let mut names = HashSet::new();

        for output in outputs {
            let path = Path::new(output);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| output.clone());
            let name = unique_entry_name(name, &mut names);

            writer.start_file(name, options)?;
            let mut input = File::open(path)?;
            io::copy(&mut input, &mut writer)?;
        }

        writer.finish()?;
        Ok(())
    }
}

/// Claim `name` in `taken`, suffixing ` (2)`, ` (3)`, ... before the
/// extension until it is free
fn unique_entry_name(name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.clone()) {
        return name;
    }

    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 2u32;
    loop {
        let candidate = match &extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        if taken.insert(candidate.clone()) {
            debug!(entry = %name, renamed = %candidate, "Renamed colliding archive entry");
            return candidate;
        }
        n += 1;
    }
}

#[async_trait]
impl Packager for ZipPackager {
    async fn package(
        &self,
        job_id: Uuid,
        outputs: &[OutputRef],
    ) -> Result<ArchiveRef, PackagingError> {
        let archive_path = self
            .work_dir
            .join(job_id.to_string())
            .join(RESULT_ARCHIVE_NAME);
        let outputs = outputs.to_vec();
        let target = archive_path.clone();

        tokio::task::spawn_blocking(move || Self::write_archive(&target, &outputs))
            .await
            .map_err(|e| PackagingError::Task(e.to_string()))??;

        Ok(archive_path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_packages_outputs_by_file_name() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, b"%PDF-a").unwrap();
        std::fs::write(&b, b"%PDF-b").unwrap();

        let packager = ZipPackager::new(dir.path().join("work"));
        let job_id = Uuid::new_v4();
        let archive_ref = packager
            .package(
                job_id,
                &[a.display().to_string(), b.display().to_string()],
            )
            .await
            .unwrap();

        assert!(archive_ref.ends_with(RESULT_ARCHIVE_NAME));
        let mut archive = zip::ZipArchive::new(File::open(&archive_ref).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.by_index(0).unwrap().name(), "a.pdf");
    }

    #[tokio::test]
    async fn test_colliding_file_names_are_all_packaged() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("unit-1");
        let second = dir.path().join("unit-2");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(first.join("report.pdf"), b"%PDF-lower").unwrap();
        std::fs::write(second.join("report.pdf"), b"%PDF-upper").unwrap();

        let packager = ZipPackager::new(dir.path().join("work"));
        let archive_ref = packager
            .package(
                Uuid::new_v4(),
                &[
                    first.join("report.pdf").display().to_string(),
                    second.join("report.pdf").display().to_string(),
                ],
            )
            .await
            .unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&archive_ref).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.by_index(0).unwrap().name(), "report.pdf");
        assert_eq!(archive.by_index(1).unwrap().name(), "report (2).pdf");
    }

    #[test]
    fn test_unique_entry_name_without_extension() {
        let mut taken = HashSet::new();
        assert_eq!(unique_entry_name("notes".into(), &mut taken), "notes");
        assert_eq!(unique_entry_name("notes".into(), &mut taken), "notes (2)");
        assert_eq!(unique_entry_name("notes".into(), &mut taken), "notes (3)");
    }

    #[tokio::test]
    async fn test_missing_output_fails_packaging() {
        let dir = TempDir::new().unwrap();
        let packager = ZipPackager::new(dir.path());
        let err = packager
            .package(Uuid::new_v4(), &["/nonexistent/out.pdf".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, PackagingError::Io(_)));
    }
}
