use crate::status::StatusError;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;

/// Fixed-capacity pool bounding the transient tasks (dispatch slices and
/// shards) that exist at any instant. `acquire` hands out a slot or fails
/// with RESOURCE_EXHAUSTED; the slot is recorded on the task header so that
/// cleanup releases it automatically. Tasks owned by external arenas carry no
/// slot and are reclaimed by their owner.
#[derive(Debug)]
pub struct TaskPool {
    slots: Mutex<Slab<()>>,
    capacity: usize,
}

/// A held pool slot. Dropping it without [`PoolSlot::release`] would leak
/// capacity, so the task cleanup path releases it explicitly.
#[derive(Debug)]
pub(crate) struct PoolSlot {
    pool: Arc<TaskPool>,
    key: usize,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Arc<TaskPool> {
        Arc::new(TaskPool {
            slots: Mutex::new(Slab::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity - self.slots.lock().len()
    }

    pub(crate) fn acquire(self: &Arc<TaskPool>) -> Result<PoolSlot, StatusError> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.capacity {
            return Err(StatusError::ResourceExhausted(format!(
                "task pool at capacity ({} slots)",
                self.capacity
            )));
        }
        let key = slots.insert(());
        Ok(PoolSlot {
            pool: Arc::clone(self),
            key,
        })
    }

    fn release(&self, key: usize) {
        self.slots.lock().remove(key);
    }
}

impl PoolSlot {
    pub(crate) fn release(self) {
        self.pool.release(self.key);
    }
}
