use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{BarrierError, BarrierResult, BarrierSignal, CompletionBarrier};

#[derive(Debug)]
struct BarrierSlot {
    outstanding: u32,
    notified: HashSet<Uuid>,
}

/// In-process barrier. Each job's counter sits behind its own mutex, so
/// notifications for one job serialize while other jobs proceed untouched.
#[derive(Debug, Default)]
pub struct InMemoryCompletionBarrier {
    slots: DashMap<Uuid, Arc<Mutex<BarrierSlot>>>,
}

impl InMemoryCompletionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, job_id: Uuid) -> Option<Arc<Mutex<BarrierSlot>>> {
        self.slots.get(&job_id).map(|slot| Arc::clone(slot.value()))
    }
}

#[async_trait]
impl CompletionBarrier for InMemoryCompletionBarrier {
    async fn seed(&self, job_id: Uuid, total_units: u32) -> BarrierResult<()> {
        if total_units == 0 {
            return Err(BarrierError::ZeroSeed { job_id });
        }

        match self.slots.entry(job_id) {
            Entry::Occupied(_) => Err(BarrierError::AlreadySeeded { job_id }),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(BarrierSlot {
                    outstanding: total_units,
                    notified: HashSet::with_capacity(total_units as usize),
                })));
                Ok(())
            }
        }
    }

    async fn notify(&self, job_id: Uuid, unit_id: Uuid) -> BarrierResult<BarrierSignal> {
        let slot = self
            .slot(job_id)
            .ok_or(BarrierError::NotSeeded { job_id })?;
        let mut slot = slot.lock();

        if slot.notified.contains(&unit_id) {
            return Err(BarrierError::DuplicateNotification { job_id, unit_id });
        }
        if slot.outstanding == 0 {
            return Err(BarrierError::Exhausted { job_id, unit_id });
        }

        slot.notified.insert(unit_id);
        slot.outstanding -= 1;

        if slot.outstanding == 0 {
            Ok(BarrierSignal::Released)
        } else {
            Ok(BarrierSignal::Pending {
                outstanding: slot.outstanding,
            })
        }
    }

    async fn outstanding(&self, job_id: Uuid) -> BarrierResult<Option<u32>> {
        Ok(self.slot(job_id).map(|slot| slot.lock().outstanding))
    }

    async fn has_notified(&self, job_id: Uuid, unit_id: Uuid) -> BarrierResult<bool> {
        Ok(self
            .slot(job_id)
            .is_some_and(|slot| slot.lock().notified.contains(&unit_id)))
    }

    async fn retire(&self, job_id: Uuid) -> BarrierResult<()> {
        self.slots.remove(&job_id);
        Ok(())
    }
}
