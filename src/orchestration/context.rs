use std::sync::Arc;

use crate::barrier::{CompletionBarrier, InMemoryCompletionBarrier};
use crate::config::BatchConfig;
use crate::events::EventPublisher;
use crate::services::{BatchSource, Converter, Packager};
use crate::store::{InMemoryStateStore, StateStore};

/// Shared handles used by every orchestration component
#[derive(Clone)]
pub struct SystemContext {
    pub store: Arc<dyn StateStore>,
    pub barrier: Arc<dyn CompletionBarrier>,
    pub source: Arc<dyn BatchSource>,
    pub converter: Arc<dyn Converter>,
    pub packager: Arc<dyn Packager>,
    pub config: Arc<BatchConfig>,
    pub events: EventPublisher,
}

impl SystemContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        barrier: Arc<dyn CompletionBarrier>,
        source: Arc<dyn BatchSource>,
        converter: Arc<dyn Converter>,
        packager: Arc<dyn Packager>,
        config: Arc<BatchConfig>,
    ) -> Self {
        Self {
            store,
            barrier,
            source,
            converter,
            packager,
            config,
            events: EventPublisher::default(),
        }
    }

    /// Context over the in-process store and barrier
    pub fn in_memory(
        source: Arc<dyn BatchSource>,
        converter: Arc<dyn Converter>,
        packager: Arc<dyn Packager>,
        config: Arc<BatchConfig>,
    ) -> Self {
        Self::new(
            Arc::new(InMemoryStateStore::new()),
            Arc::new(InMemoryCompletionBarrier::new()),
            source,
            converter,
            packager,
            config,
        )
    }

    pub fn with_event_publisher(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }
}

impl std::fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("worker_count", &self.config.engine.worker_count)
            .field("max_attempts", &self.config.retry.max_attempts)
            .field("subscribers", &self.events.subscriber_count())
            .finish()
    }
}
