//! # Orchestration Types
//!
//! Messages and reports shared across the orchestration components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Job, Unit};
use crate::state_machine::{JobState, UnitState};

/// One unit handed to the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitDispatch {
    pub job_id: Uuid,
    pub unit_id: Uuid,
}

/// Snapshot returned by the status boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: Uuid,
    pub status: JobState,
    pub total_units: u32,
    pub completed_units: u32,
    pub failed_units: u32,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub result_available: bool,
    pub units: Vec<UnitStatusReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatusReport {
    pub unit_name: String,
    pub status: UnitState,
    pub attempt_count: u32,
    pub error: Option<String>,
}

impl JobStatusReport {
    pub fn from_records(job: &Job, units: &[Unit]) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            total_units: job.total_units,
            completed_units: job.completed_units,
            failed_units: job.failed_units,
            error: job.error.clone(),
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            finalized_at: job.finalized_at,
            result_available: job.is_terminal() && job.archive_ref.is_some(),
            units: units
                .iter()
                .map(|unit| UnitStatusReport {
                    unit_name: unit.source_name.clone(),
                    status: unit.status,
                    attempt_count: unit.attempt_count,
                    error: unit.error.clone(),
                })
                .collect(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outcome of a result lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultLookup {
    /// Packaged output is available
    Ready { archive_ref: String },
    /// The job has not reached a terminal status yet
    NotReady { status: JobState },
    /// Terminal, but nothing was packaged (no unit completed, or packaging failed)
    Unavailable { status: JobState },
    NotFound,
}

impl ResultLookup {
    pub fn from_job(job: Option<&Job>) -> Self {
        match job {
            None => Self::NotFound,
            Some(job) if !job.is_terminal() => Self::NotReady { status: job.status },
            Some(job) => match &job.archive_ref {
                Some(archive_ref) => Self::Ready {
                    archive_ref: archive_ref.clone(),
                },
                None => Self::Unavailable { status: job.status },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_lookup_states() {
        assert_eq!(ResultLookup::from_job(None), ResultLookup::NotFound);

        let mut job = Job::new("batch.zip");
        job.status = JobState::InProgress;
        assert_eq!(
            ResultLookup::from_job(Some(&job)),
            ResultLookup::NotReady {
                status: JobState::InProgress
            }
        );

        job.status = JobState::Failed;
        assert_eq!(
            ResultLookup::from_job(Some(&job)),
            ResultLookup::Unavailable {
                status: JobState::Failed
            }
        );

        job.status = JobState::CompletedWithErrors;
        job.archive_ref = Some("/work/j/result.zip".into());
        assert_eq!(
            ResultLookup::from_job(Some(&job)),
            ResultLookup::Ready {
                archive_ref: "/work/j/result.zip".into()
            }
        );
    }

    #[test]
    fn test_status_report_lists_unit_errors() {
        let mut job = Job::new("batch.zip");
        job.status = JobState::CompletedWithErrors;
        job.total_units = 2;
        job.completed_units = 1;
        job.failed_units = 1;

        let mut ok = Unit::new(job.job_id, "a.docx", "/in/a.docx");
        ok.status = UnitState::Completed;
        ok.attempt_count = 1;
        let mut bad = Unit::new(job.job_id, "b.docx", "/in/b.docx");
        bad.status = UnitState::Failed;
        bad.attempt_count = 3;
        bad.error = Some("corrupt file".into());

        let report = JobStatusReport::from_records(&job, &[ok, bad]);
        assert!(report.is_terminal());
        assert!(!report.result_available);
        assert_eq!(report.units[1].error.as_deref(), Some("corrupt file"));
        assert_eq!(report.units[1].attempt_count, 3);
    }
}
