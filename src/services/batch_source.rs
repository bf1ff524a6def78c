//! # Batch Sources
//!
//! Enumerate the members of a submitted batch. [`ZipBatchSource`] extracts an
//! uploaded zip into `<work_dir>/<job_id>/input`; [`DirectoryBatchSource`]
//! reads members straight from an existing directory.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::is_accepted_member;
use crate::config::StorageConfig;

/// One member of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    /// File name shown in status reports
    pub name: String,
    /// Locator handed to the converter
    pub source_ref: String,
}

#[derive(Debug, Error)]
pub enum ExpansionError {
    #[error("Batch '{batch_ref}' could not be read: {reason}")]
    Unreadable { batch_ref: String, reason: String },

    #[error("Batch '{batch_ref}' is malformed: {reason}")]
    Malformed { batch_ref: String, reason: String },

    #[error("Batch '{batch_ref}' contains no convertible members")]
    Empty { batch_ref: String },

    #[error("I/O error while expanding batch: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
    /// List the members of `batch_ref`. An empty list is returned as-is; the
    /// expander decides what an empty batch means.
    async fn enumerate(&self, job_id: Uuid, batch_ref: &str)
        -> Result<Vec<SourceItem>, ExpansionError>;
}

/// Zip upload source
#[derive(Debug, Clone)]
pub struct ZipBatchSource {
    work_dir: PathBuf,
    accepted_extensions: Vec<String>,
}

impl ZipBatchSource {
    pub fn new(work_dir: impl Into<PathBuf>, accepted_extensions: Vec<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            accepted_extensions,
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(&storage.work_dir, storage.accepted_extensions.clone())
    }

    fn extract(
        archive_path: &Path,
        input_dir: &Path,
        accepted_extensions: &[String],
    ) -> Result<Vec<SourceItem>, ExpansionError> {
        let batch_ref = archive_path.display().to_string();
        let file = File::open(archive_path).map_err(|e| ExpansionError::Unreadable {
            batch_ref: batch_ref.clone(),
            reason: e.to_string(),
        })?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| ExpansionError::Malformed {
            batch_ref: batch_ref.clone(),
            reason: e.to_string(),
        })?;

        std::fs::create_dir_all(input_dir)?;

        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for i in 0..archive.len() {
            let mut member = archive
                .by_index(i)
                .map_err(|e| ExpansionError::Malformed {
                    batch_ref: batch_ref.clone(),
                    reason: format!("entry {i}: {e}"),
                })?;

            if member.is_dir() {
                continue;
            }

            // Nested paths are flattened; entries escaping the archive root are skipped.
            let Some(file_name) = member
                .enclosed_name()
                .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            else {
                warn!(batch_ref = %batch_ref, entry = member.name(), "Skipping unsafe zip entry");
                continue;
            };

            if !is_accepted_member(&file_name, accepted_extensions) {
                debug!(batch_ref = %batch_ref, entry = %file_name, "Skipping non-convertible member");
                continue;
            }

            if !seen.insert(file_name.clone()) {
                warn!(batch_ref = %batch_ref, entry = %file_name, "Skipping duplicate member name");
                continue;
            }

            let target = input_dir.join(&file_name);
            let mut out = File::create(&target)?;
            io::copy(&mut member, &mut out)?;

            items.push(SourceItem {
                name: file_name,
                source_ref: target.display().to_string(),
            });
        }

        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}

#[async_trait]
impl BatchSource for ZipBatchSource {
    async fn enumerate(
        &self,
        job_id: Uuid,
        batch_ref: &str,
    ) -> Result<Vec<SourceItem>, ExpansionError> {
        let archive_path = PathBuf::from(batch_ref);
        let input_dir = self.work_dir.join(job_id.to_string()).join("input");
        let accepted = self.accepted_extensions.clone();

        tokio::task::spawn_blocking(move || Self::extract(&archive_path, &input_dir, &accepted))
            .await
            .map_err(|e| ExpansionError::Unreadable {
                batch_ref: batch_ref.to_string(),
                reason: format!("extraction task failed: {e}"),
            })?
    }
}

/// Reads members from a directory that already holds the batch
#[derive(Debug, Clone)]
pub struct DirectoryBatchSource {
    accepted_extensions: Vec<String>,
}

impl DirectoryBatchSource {
    pub fn new(accepted_extensions: Vec<String>) -> Self {
        Self {
            accepted_extensions,
        }
    }
}

#[async_trait]
impl BatchSource for DirectoryBatchSource {
    async fn enumerate(
        &self,
        _job_id: Uuid,
        batch_ref: &str,
    ) -> Result<Vec<SourceItem>, ExpansionError> {
        let mut entries =
            tokio::fs::read_dir(batch_ref)
                .await
                .map_err(|e| ExpansionError::Unreadable {
                    batch_ref: batch_ref.to_string(),
                    reason: e.to_string(),
                })?;

        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_accepted_member(&name, &self.accepted_extensions) {
                items.push(SourceItem {
                    name,
                    source_ref: entry.path().display().to_string(),
                });
            }
        }

        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}
