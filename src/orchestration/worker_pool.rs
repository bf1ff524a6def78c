//! # Worker Pool
//!
//! Bounded pool of unit executors fed by an mpsc channel.
//!
//! Each received [`UnitDispatch`] is spawned onto its own task, which first
//! acquires a permit from a semaphore sized by `engine.worker_count`. The
//! permit is held until the unit's attempt (and, for the last unit of a job,
//! the inline finalization) is done.
//!
//! On shutdown the pool stops receiving, closes the channel so further
//! dispatches fail with [`BatchError::PoolClosed`], then waits for every
//! permit to come back, which lets in-flight attempts finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::types::UnitDispatch;
use super::unit_executor::UnitExecutor;
use crate::error::{BatchError, Result};

/// Sending side of the dispatch channel
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<UnitDispatch>,
}

impl DispatchHandle {
    pub async fn dispatch(&self, dispatch: UnitDispatch) -> Result<()> {
        self.sender
            .send(dispatch)
            .await
            .map_err(|_| BatchError::PoolClosed)
    }

    /// Dispatch after `delay` without blocking the caller
    pub fn dispatch_after(&self, dispatch: UnitDispatch, delay: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = handle.dispatch(dispatch).await {
                warn!(
                    job_id = %dispatch.job_id,
                    unit_id = %dispatch.unit_id,
                    error = %err,
                    "Delayed dispatch dropped; recovery sweep will pick the unit up"
                );
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct WorkerPool {
    dispatch_receiver: mpsc::Receiver<UnitDispatch>,
    executor: Arc<UnitExecutor>,
    concurrency_semaphore: Arc<Semaphore>,
    worker_count: usize,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field(
                "available_permits",
                &self.concurrency_semaphore.available_permits(),
            )
            .finish()
    }
}

/// Create the dispatch channel. The receiver is handed to [`WorkerPool::new`].
pub fn dispatch_channel(capacity: usize) -> (DispatchHandle, mpsc::Receiver<UnitDispatch>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (DispatchHandle { sender }, receiver)
}

impl WorkerPool {
    pub fn new(
        dispatch_receiver: mpsc::Receiver<UnitDispatch>,
        executor: Arc<UnitExecutor>,
        worker_count: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dispatch_receiver,
            executor,
            concurrency_semaphore: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            shutdown,
        }
    }

    /// Run until shutdown is signalled or every dispatch handle is dropped
    pub async fn run(mut self) {
        info!(worker_count = self.worker_count, "Worker pool starting");

        loop {
            let dispatch = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                received = self.dispatch_receiver.recv() => match received {
                    Some(dispatch) => dispatch,
                    None => break,
                },
            };

            debug!(
                job_id = %dispatch.job_id,
                unit_id = %dispatch.unit_id,
                "Received unit dispatch"
            );

            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&self.concurrency_semaphore);

            tokio::spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(
                            job_id = %dispatch.job_id,
                            unit_id = %dispatch.unit_id,
                            "Worker pool closed before the unit started; leaving it for recovery"
                        );
                        return;
                    }
                };

                if let Err(err) = executor.execute(dispatch).await {
                    error!(
                        job_id = %dispatch.job_id,
                        unit_id = %dispatch.unit_id,
                        error = %err,
                        internal = err.is_internal_consistency(),
                        "Unit execution failed"
                    );
                }

                drop(permit);
            });
        }

        // Stop accepting work, then wait for in-flight attempts.
        self.dispatch_receiver.close();
        let in_flight = self
            .worker_count
            .saturating_sub(self.concurrency_semaphore.available_permits());
        info!(in_flight, "Worker pool draining");

        match self
            .concurrency_semaphore
            .acquire_many(self.worker_count as u32)
            .await
        {
            Ok(_all) => {
                self.concurrency_semaphore.close();
                info!("Worker pool stopped");
            }
            Err(_) => warn!("Worker pool semaphore closed during drain"),
        }
    }
}
