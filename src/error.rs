//! Crate-level error type.
//!
//! Component errors ([`ExpansionError`], [`ConversionError`], [`PackagingError`],
//! [`BarrierError`], [`StoreError`], [`StateMachineError`]) convert into
//! [`BatchError`] so orchestration code can propagate them with `?`.

use thiserror::Error;
use uuid::Uuid;

use crate::barrier::BarrierError;
use crate::config::ConfigurationError;
use crate::orchestration::FinalizationError;
use crate::services::{ConversionError, ExpansionError, PackagingError};
use crate::state_machine::StateMachineError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Unit not found: {0}")]
    UnitNotFound(Uuid),

    #[error("Expansion error: {0}")]
    Expansion(#[from] ExpansionError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Packaging error: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Completion barrier error: {0}")]
    Barrier(#[from] BarrierError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Finalization error: {0}")]
    Finalization(#[from] FinalizationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A programming-contract violation: double seeding, double finalization of a
    /// live job, duplicate terminal notification, or counters out of sync.
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Timed out waiting for job {0}")]
    WaitTimeout(Uuid),
}

impl BatchError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalConsistency(msg.into())
    }

    /// Contract violations that must be surfaced loudly rather than recorded as
    /// ordinary job or unit failures.
    pub fn is_internal_consistency(&self) -> bool {
        match self {
            Self::InternalConsistency(_) => true,
            Self::Barrier(err) => err.is_contract_violation(),
            Self::Finalization(err) => err.is_contract_violation(),
            Self::StateMachine(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_contract_violations_are_internal() {
        let job_id = Uuid::new_v4();
        let err: BatchError = BarrierError::AlreadySeeded { job_id }.into();
        assert!(err.is_internal_consistency());

        let err = BatchError::JobNotFound(job_id);
        assert!(!err.is_internal_consistency());
    }

    #[test]
    fn test_error_display() {
        let err = BatchError::internal("unit notified twice");
        assert_eq!(
            err.to_string(),
            "Internal consistency violation: unit notified twice"
        );
    }
}
