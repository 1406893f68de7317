use crate::runtime::Executor;
use crate::tuning;
use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let counter = Arc::new(AtomicUsize::new(0));
    ThreadNameFn(Arc::new(move || {
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        format!("taskgrid-worker-{}", prev)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself isn't printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core, capped at the affinity mask width.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the executor.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the executor.
    thread_stack_size: Option<usize>,

    /// Scratch bytes each worker owns for per-tile local memory.
    worker_local_memory_size: usize,

    /// Slice block shape for slice-mode dispatches.
    tiles_per_slice: [u32; 3],

    /// Upper bound on tiles reserved per shard cursor fetch-add.
    max_tiles_per_shard_reservation: u32,

    /// Capacity of the transient pool backing dispatch slices and shards.
    transient_task_capacity: usize,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            worker_local_memory_size: tuning::DEFAULT_WORKER_LOCAL_MEMORY_SIZE,
            tiles_per_slice: [
                tuning::TILES_PER_SLICE_X,
                tuning::TILES_PER_SLICE_Y,
                tuning::TILES_PER_SLICE_Z,
            ],
            max_tiles_per_shard_reservation: tuning::MAX_TILES_PER_SHARD_RESERVATION,
            transient_task_capacity: tuning::DEFAULT_TRANSIENT_TASK_CAPACITY,
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of threads spawned by the executor's thread pool.
    ///
    /// The default name is "taskgrid-worker-{N}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// executor's thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies a minimal stack size.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets how many bytes of scratch memory each worker owns. Dispatches
    /// request a subrange per tile; requests larger than this fail with
    /// RESOURCE_EXHAUSTED.
    pub fn worker_local_memory_size(mut self, val: usize) -> Self {
        self.worker_local_memory_size = val;
        self
    }

    /// Sets the tile block shape carved out per slice in slice-mode
    /// dispatches. Smaller blocks mean more, finer slices.
    pub fn tiles_per_slice(mut self, val: [u32; 3]) -> Self {
        self.tiles_per_slice = val;
        self
    }

    /// Sets the maximum tiles a shard reserves from the grid cursor at a
    /// time. Higher amortizes the cursor, lower steals finer.
    pub fn max_tiles_per_shard_reservation(mut self, val: u32) -> Self {
        self.max_tiles_per_shard_reservation = val;
        self
    }

    /// Sets how many transient tasks (dispatch slices/shards) may exist at
    /// once.
    pub fn transient_task_capacity(mut self, val: usize) -> Self {
        self.transient_task_capacity = val;
        self
    }

    /// Creates the configured [`Executor`], ready to accept submissions.
    pub fn build(self) -> Result<Executor> {
        let cfg: RuntimeConfig = self.try_into()?;
        Ok(Executor::new(cfg))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

// Export the builder as a RuntimeConfig object to be consumed by the executor
// and its workers.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) worker_local_memory_size: usize,
    pub(crate) tiles_per_slice: [u32; 3],
    pub(crate) max_tiles_per_shard_reservation: u32,
    pub(crate) transient_task_capacity: usize,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 || self.worker_threads > tuning::MAX_WORKER_COUNT {
            return Err(anyhow!(
                "worker_threads must be in 1..={}, got {}",
                tuning::MAX_WORKER_COUNT,
                self.worker_threads
            ));
        }

        if self.tiles_per_slice.iter().any(|&tiles| tiles == 0) {
            return Err(anyhow!("tiles_per_slice axes must be non-zero"));
        }

        if self.max_tiles_per_shard_reservation == 0 {
            return Err(anyhow!("max_tiles_per_shard_reservation must be non-zero"));
        }

        if self.transient_task_capacity == 0 {
            return Err(anyhow!("transient_task_capacity must be non-zero"));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(worker_threads) => worker_threads,
            None => thread::available_parallelism()?
                .get()
                .min(tuning::MAX_WORKER_COUNT),
        };

        let cfg = RuntimeConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            worker_local_memory_size: builder.worker_local_memory_size,
            tiles_per_slice: builder.tiles_per_slice,
            max_tiles_per_shard_reservation: builder.max_tiles_per_shard_reservation,
            transient_task_capacity: builder.transient_task_capacity,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config is cloned into every spawned worker thread.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[test]
    fn builder_rejects_bad_configs() {
        assert!(Builder::new()
            .worker_threads(tuning::MAX_WORKER_COUNT + 1)
            .build()
            .is_err());
        assert!(Builder::new().tiles_per_slice([0, 1, 1]).build().is_err());
        assert!(Builder::new()
            .max_tiles_per_shard_reservation(0)
            .build()
            .is_err());
        assert!(Builder::new().transient_task_capacity(0).build().is_err());
    }

    #[test]
    fn builder_defaults_come_from_tuning() {
        let builder = Builder::new();
        assert_eq!(
            builder.tiles_per_slice,
            [
                tuning::TILES_PER_SLICE_X,
                tuning::TILES_PER_SLICE_Y,
                tuning::TILES_PER_SLICE_Z
            ]
        );
        assert_eq!(
            builder.max_tiles_per_shard_reservation,
            tuning::MAX_TILES_PER_SHARD_RESERVATION
        );
    }
}
