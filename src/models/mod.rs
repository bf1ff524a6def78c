pub mod job;
pub mod unit;

// Re-export core models for easy access
pub use job::{Job, JobCompletion, JobCounts};
pub use unit::{Unit, UnitOutcome};
