//! Shared test doubles for the orchestration integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use docbatch_core::config::BatchConfig;
use docbatch_core::models::{Job, JobCompletion, JobCounts, Unit, UnitOutcome};
use docbatch_core::orchestration::{OrchestrationSystem, SystemContext};
use docbatch_core::state_machine::{JobState, UnitState};
use docbatch_core::store::{InMemoryStateStore, StateStore, StoreResult};
use docbatch_core::services::{
    ArchiveRef, BatchSource, ConversionError, ConversionRequest, Converter, ExpansionError,
    OutputRef, Packager, PackagingError, SourceItem,
};

/// Engine configuration tuned for fast tests: tiny backoff, manual sweeps
pub fn test_config(worker_count: usize, max_attempts: u32) -> BatchConfig {
    let mut config = BatchConfig::default();
    config.engine.worker_count = worker_count;
    config.retry.max_attempts = max_attempts;
    config.retry.backoff_base_ms = 5;
    config.retry.backoff_max_ms = 20;
    config.execution.conversion_timeout_seconds = 1;
    config.recovery.enabled = false;
    config
}

pub struct Harness {
    pub system: Arc<OrchestrationSystem>,
    pub converter: Arc<ScriptedConverter>,
    pub packager: Arc<RecordingPackager>,
}

impl Harness {
    pub fn start(source: FixedBatchSource, converter: ScriptedConverter, config: BatchConfig) -> Self {
        Self::start_with_packager(source, converter, RecordingPackager::new(), config)
    }

    pub fn start_with_packager(
        source: FixedBatchSource,
        converter: ScriptedConverter,
        packager: RecordingPackager,
        config: BatchConfig,
    ) -> Self {
        let converter = Arc::new(converter);
        let packager = Arc::new(packager);
        let context = SystemContext::in_memory(
            Arc::new(source),
            converter.clone(),
            packager.clone(),
            Arc::new(config),
        );
        Self {
            system: OrchestrationSystem::start(context),
            converter,
            packager,
        }
    }
}

/// Batch source returning a fixed member list, or a fixed error
pub struct FixedBatchSource {
    members: Vec<String>,
    unreadable: Option<String>,
}

impl FixedBatchSource {
    pub fn new(members: &[&str]) -> Self {
        Self {
            members: members.iter().map(|m| m.to_string()).collect(),
            unreadable: None,
        }
    }

    pub fn unreadable(reason: &str) -> Self {
        Self {
            members: Vec::new(),
            unreadable: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl BatchSource for FixedBatchSource {
    async fn enumerate(
        &self,
        _job_id: Uuid,
        batch_ref: &str,
    ) -> Result<Vec<SourceItem>, ExpansionError> {
        if let Some(reason) = &self.unreadable {
            return Err(ExpansionError::Unreadable {
                batch_ref: batch_ref.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(self
            .members
            .iter()
            .map(|name| SourceItem {
                name: name.clone(),
                source_ref: format!("mem://{name}"),
            })
            .collect())
    }
}

/// What one converter attempt does
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(&'static str),
    Panic(&'static str),
    /// Sleep past any sensible conversion timeout
    Hang,
}

/// Converter following a per-member script of attempt outcomes.
///
/// Members without a script succeed. When a script runs out its last step
/// repeats.
#[derive(Default)]
pub struct ScriptedConverter {
    scripts: HashMap<String, Vec<Step>>,
    delay: Duration,
    attempts: DashMap<(Uuid, String), u32>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, member: &str, steps: Vec<Step>) -> Self {
        self.scripts.insert(member.to_string(), steps);
        self
    }

    /// Hold every attempt for `delay` before applying its step
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Attempts made for `member`, summed over every job
    pub fn attempts_for(&self, member: &str) -> u32 {
        self.attempts
            .iter()
            .filter(|entry| entry.key().1 == member)
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.iter().map(|entry| *entry.value()).sum()
    }

    /// Highest number of attempts observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Converter for ScriptedConverter {
    async fn convert(&self, request: &ConversionRequest) -> Result<OutputRef, ConversionError> {
        let member = request
            .source_ref
            .trim_start_matches("mem://")
            .to_string();

        let attempt = {
            let mut count = self
                .attempts
                .entry((request.job_id, member.clone()))
                .or_insert(0);
            *count += 1;
            *count
        };
        assert_eq!(attempt, request.attempt, "attempt numbering drifted for {member}");

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = RunningGuard(&self.running);
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self
            .scripts
            .get(&member)
            .and_then(|steps| {
                steps
                    .get(attempt as usize - 1)
                    .or_else(|| steps.last())
                    .cloned()
            })
            .unwrap_or(Step::Succeed);

        match step {
            Step::Succeed => Ok(format!("out://{}.pdf", member.trim_end_matches(".docx"))),
            Step::Fail(reason) => Err(ConversionError::CommandFailed {
                status: "exit status: 1".to_string(),
                stderr: reason.to_string(),
            }),
            Step::Panic(reason) => panic!("{reason}"),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(String::new())
            }
        }
    }
}

/// Packager that records what it was asked to package
#[derive(Default)]
pub struct RecordingPackager {
    calls: Mutex<Vec<(Uuid, Vec<OutputRef>)>>,
    fail_with: Option<String>,
}

impl RecordingPackager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<(Uuid, Vec<OutputRef>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Packager for RecordingPackager {
    async fn package(
        &self,
        job_id: Uuid,
        outputs: &[OutputRef],
    ) -> Result<ArchiveRef, PackagingError> {
        self.calls.lock().push((job_id, outputs.to_vec()));
        if let Some(reason) = &self.fail_with {
            return Err(PackagingError::Io(std::io::Error::other(reason.clone())));
        }
        Ok(format!("archive://{job_id}/result.zip"))
    }
}

/// In-memory store whose unit listings lose every recorded output, leaving
/// completed units the finalizer cannot package
#[derive(Default)]
pub struct OutputDroppingStore {
    inner: InMemoryStateStore,
}

impl OutputDroppingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for OutputDroppingStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn transition_job(&self, job_id: Uuid, from: JobState, to: JobState) -> StoreResult<bool> {
        self.inner.transition_job(job_id, from, to).await
    }

    async fn insert_units(&self, job_id: Uuid, units: &[Unit]) -> StoreResult<u32> {
        self.inner.insert_units(job_id, units).await
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        from: JobState,
        completion: &JobCompletion,
    ) -> StoreResult<bool> {
        self.inner.complete_job(job_id, from, completion).await
    }

    async fn request_cancel(&self, job_id: Uuid) -> StoreResult<bool> {
        self.inner.request_cancel(job_id).await
    }

    async fn jobs_in_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        self.inner.jobs_in_state(state).await
    }

    async fn get_unit(&self, unit_id: Uuid) -> StoreResult<Option<Unit>> {
        self.inner.get_unit(unit_id).await
    }

    async fn list_units(&self, job_id: Uuid) -> StoreResult<Vec<Unit>> {
        let mut units = self.inner.list_units(job_id).await?;
        for unit in &mut units {
            unit.output_ref = None;
        }
        Ok(units)
    }

    async fn claim_unit(&self, unit_id: Uuid, max_attempts: u32) -> StoreResult<Option<Unit>> {
        self.inner.claim_unit(unit_id, max_attempts).await
    }

    async fn release_unit(&self, unit_id: Uuid, attempt: u32) -> StoreResult<bool> {
        self.inner.release_unit(unit_id, attempt).await
    }

    async fn record_unit_outcome(
        &self,
        unit_id: Uuid,
        expected: UnitState,
        attempt: u32,
        outcome: &UnitOutcome,
    ) -> StoreResult<Option<JobCounts>> {
        self.inner
            .record_unit_outcome(unit_id, expected, attempt, outcome)
            .await
    }

    async fn find_stuck_units(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<Unit>> {
        self.inner.find_stuck_units(claimed_before).await
    }
}
