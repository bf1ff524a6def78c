//! # Orchestration System
//!
//! Running engine and its external boundary: submit, status, result, cancel,
//! wait and shutdown.
//!
//! [`OrchestrationSystem::start`] wires the dispatch channel, the worker pool
//! and (when enabled) the recovery sweeper onto the current tokio runtime.
//! Submission creates a `PENDING` job and returns its id immediately; expansion
//! runs on a spawned task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::batch_expander::{BatchExpander, ExpansionResult};
use super::context::SystemContext;
use super::recovery::StuckUnitSweeper;
use super::types::{JobStatusReport, ResultLookup};
use super::unit_executor::UnitExecutor;
use super::worker_pool::{dispatch_channel, DispatchHandle, WorkerPool};
use crate::error::{BatchError, Result};
use crate::events::LifecycleEvent;
use crate::logging::log_job_operation;
use crate::models::Job;

pub struct OrchestrationSystem {
    context: SystemContext,
    dispatcher: DispatchHandle,
    expander: BatchExpander,
    sweeper: StuckUnitSweeper,
    shutdown_sender: watch::Sender<bool>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for OrchestrationSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationSystem")
            .field("context", &self.context)
            .field("running", &self.is_running())
            .finish()
    }
}

impl OrchestrationSystem {
    /// Start the worker pool and recovery sweeper. Must be called from within
    /// a tokio runtime.
    pub fn start(context: SystemContext) -> Arc<Self> {
        let engine = &context.config.engine;
        let (dispatcher, receiver) = dispatch_channel(engine.dispatch_queue_capacity);
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let executor = Arc::new(UnitExecutor::new(context.clone(), dispatcher.clone()));
        let pool = WorkerPool::new(
            receiver,
            executor,
            engine.worker_count,
            shutdown_receiver.clone(),
        );

        let mut background_tasks = vec![tokio::spawn(pool.run())];

        let sweeper = StuckUnitSweeper::new(context.clone(), dispatcher.clone());
        if context.config.recovery.enabled {
            background_tasks.push(tokio::spawn(sweeper.clone().run(shutdown_receiver)));
        } else {
            info!("Recovery sweeper disabled");
        }

        info!(
            worker_count = engine.worker_count,
            max_attempts = context.config.retry.max_attempts,
            recovery = context.config.recovery.enabled,
            "Orchestration system started"
        );

        Arc::new(Self {
            expander: BatchExpander::new(context.clone(), dispatcher.clone()),
            context,
            dispatcher,
            sweeper,
            shutdown_sender,
            background_tasks: Mutex::new(background_tasks),
        })
    }

    pub fn context(&self) -> &SystemContext {
        &self.context
    }

    /// Sweeper sharing this system's dispatch channel, for on-demand sweeps
    pub fn sweeper(&self) -> &StuckUnitSweeper {
        &self.sweeper
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_sender.borrow() && !self.dispatcher.is_closed()
    }

    /// Accept a batch. The job is created `PENDING` and expanded in the background.
    pub async fn submit(&self, batch_ref: impl Into<String>) -> Result<Uuid> {
        if !self.is_running() {
            return Err(BatchError::PoolClosed);
        }

        let job = Job::new(batch_ref);
        let job_id = job.job_id;
        self.context.store.create_job(&job).await?;
        log_job_operation("submit", job_id, job.status.as_str(), Some(&job.batch_ref));

        let expander = self.expander.clone();
        let batch_ref = job.batch_ref;
        tokio::spawn(async move {
            match expander.expand(job_id, &batch_ref).await {
                Ok(ExpansionResult::Expanded { total_units }) => {
                    debug!(job_id = %job_id, total_units, "Expansion finished");
                }
                Ok(ExpansionResult::Failed { error }) => {
                    debug!(job_id = %job_id, error = %error, "Expansion rejected batch");
                }
                Err(err) => {
                    error!(
                        job_id = %job_id,
                        error = %err,
                        internal = err.is_internal_consistency(),
                        "Expansion aborted"
                    );
                }
            }
        });

        Ok(job_id)
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusReport> {
        let job = self
            .context
            .store
            .get_job(job_id)
            .await?
            .ok_or(BatchError::JobNotFound(job_id))?;
        let units = self.context.store.list_units(job_id).await?;
        Ok(JobStatusReport::from_records(&job, &units))
    }

    pub async fn get_result(&self, job_id: Uuid) -> Result<ResultLookup> {
        let job = self.context.store.get_job(job_id).await?;
        Ok(ResultLookup::from_job(job.as_ref()))
    }

    /// Request cancellation. Returns `false` when the job is already terminal.
    ///
    /// Pending units are failed as they are picked up and failed attempts
    /// are not retried; attempts already running finish normally.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let accepted = match self.context.store.request_cancel(job_id).await {
            Ok(accepted) => accepted,
            Err(crate::store::StoreError::NotFound { .. }) => {
                return Err(BatchError::JobNotFound(job_id))
            }
            Err(err) => return Err(err.into()),
        };

        if accepted {
            self.context
                .events
                .publish(LifecycleEvent::JobCancelRequested { job_id });
            log_job_operation("cancel", job_id, "CANCEL_REQUESTED", None);
        } else {
            debug!(job_id = %job_id, "Cancel ignored for terminal job");
        }
        Ok(accepted)
    }

    /// Wait until the job is terminal, then return its status
    pub async fn wait_for_terminal(
        &self,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<JobStatusReport> {
        // Subscribe before the first check so a transition in between is seen.
        let mut events = self.context.events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let report = self.get_status(job_id).await?;
            if report.is_terminal() {
                return Ok(report);
            }

            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => return Err(BatchError::WaitTimeout(job_id)),
                    Ok(Ok(published))
                        if published.event.job_id() == job_id
                            && published.event.is_job_terminal() =>
                    {
                        break
                    }
                    Ok(Ok(_)) => continue,
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        debug!(job_id = %job_id, skipped, "Event subscriber lagged, re-checking status");
                        break;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        return Err(BatchError::internal("lifecycle event channel closed"));
                    }
                }
            }
        }
    }

    /// Stop the sweeper and the worker pool. In-flight attempts run to completion
    /// before this returns.
    pub async fn shutdown(&self) {
        if self.shutdown_sender.send_replace(true) {
            warn!("Orchestration system already shut down");
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background_tasks.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Background task ended abnormally");
            }
        }
        info!("Orchestration system stopped");
    }
}
