use crate::task::list::TaskList;
use crate::task::{TaskRef, WorkerMask};

/// Staging buffer of ready tasks, partitioned by target worker.
///
/// Producers and executing tasks enqueue here; the batch is published to the
/// workers' inbound queues at a flush point ([`crate::Executor::submit`] on
/// the producer side, after each task execution on the worker side). That
/// publication is the only cross-worker memory hand-off.
#[derive(Debug)]
pub struct Submission {
    partitions: Vec<TaskList>,
    /// Rotating routing cursor, randomized per submission so concurrent
    /// producers spread across the pool instead of dogpiling worker 0.
    cursor: usize,
}

impl Submission {
    pub fn new(worker_count: usize) -> Submission {
        debug_assert!(worker_count > 0, "a submission needs at least one partition");
        Submission {
            partitions: (0..worker_count).map(|_| TaskList::new()).collect(),
            cursor: fastrand::usize(..worker_count.max(1)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(TaskList::is_empty)
    }

    /// Stages a ready task on a worker chosen from its affinity mask.
    /// Staging is LIFO: freshly readied tasks run first for cache locality.
    pub fn enqueue(&mut self, task: TaskRef) {
        let worker_index = self.select_worker(task.affinity());
        self.partitions[worker_index].push_front(task);
    }

    /// Stages a ready task on an explicit worker, preserving post order.
    pub fn enqueue_to(&mut self, worker_index: usize, task: TaskRef) {
        self.partitions[worker_index].push_back(task);
    }

    /// Picks the next worker eligible under `affinity`, round-robin from the
    /// rotating cursor.
    pub(crate) fn select_worker(&mut self, affinity: WorkerMask) -> usize {
        let worker_count = self.partitions.len();
        for probe in 0..worker_count {
            let worker_index = (self.cursor + probe) % worker_count;
            if affinity.contains(worker_index) {
                self.cursor = worker_index + 1;
                return worker_index;
            }
        }
        // The mask excludes the whole pool; fall back to the cursor slot so
        // the task still makes progress.
        self.cursor % worker_count
    }

    /// Drains every partition into `sink` as `(worker_index, task)` pairs.
    pub(crate) fn drain_into(&mut self, mut sink: impl FnMut(usize, TaskRef)) {
        for (worker_index, partition) in self.partitions.iter_mut().enumerate() {
            while let Some(task) = partition.pop_front() {
                sink(worker_index, task);
            }
        }
    }

    /// Tears down everything still staged without executing it.
    pub(crate) fn discard_all(&mut self) {
        let mut abandoned = TaskList::new();
        for partition in &mut self.partitions {
            abandoned.concat(partition);
        }
        abandoned.discard_all();
    }
}
