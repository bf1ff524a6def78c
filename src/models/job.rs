//! # Job Model
//!
//! One submitted batch of conversion work with an aggregate lifecycle.
//!
//! ## Overview
//!
//! A `Job` is created in `PENDING` by the submission boundary, expanded into
//! [`Unit`](super::Unit) records by the batch expander, and closed out exactly
//! once by the job finalizer. The counters are only ever incremented by a
//! unit's single terminal transition, so `completed_units + failed_units`
//! never exceeds `total_units`.
//!
//! ## Database Schema
//!
//! Maps to the `docbatch_jobs` table:
//! - `job_id`: Primary key (UUID)
//! - `status`: Current [`JobState`] (VARCHAR)
//! - `total_units`, `completed_units`, `failed_units`: INTEGER counters
//! - `cancel_requested`: BOOLEAN
//! - `archive_ref`: Packaged output location, set on finalization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::JobState;

/// Represents one batch and its aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    /// Locator of the submitted batch (for example the uploaded zip path)
    pub batch_ref: String,
    pub status: JobState,
    pub total_units: u32,
    pub completed_units: u32,
    pub failed_units: u32,
    /// Job-level failure (expansion or packaging)
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub archive_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job in `PENDING` for the given batch
    pub fn new(batch_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            batch_ref: batch_ref.into(),
            status: JobState::Pending,
            total_units: 0,
            completed_units: 0,
            failed_units: 0,
            error: None,
            cancel_requested: false,
            archive_ref: None,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    pub fn counts(&self) -> JobCounts {
        JobCounts {
            total: self.total_units,
            completed: self.completed_units,
            failed: self.failed_units,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Snapshot of a job's unit counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl JobCounts {
    /// Units that have not reached a terminal status yet
    pub fn outstanding(&self) -> u32 {
        self.total.saturating_sub(self.completed + self.failed)
    }

    pub fn is_drained(&self) -> bool {
        self.total > 0 && self.completed + self.failed == self.total
    }

    /// `completed + failed <= total`
    pub fn is_consistent(&self) -> bool {
        self.completed + self.failed <= self.total
    }
}

/// Final values written by the job finalizer (or the expander on failure)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub status: JobState,
    pub error: Option<String>,
    pub archive_ref: Option<String>,
    pub finalized_at: DateTime<Utc>,
}
