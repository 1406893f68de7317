use crate::runtime::executor::ExecutorShared;
use crate::runtime::worker::Worker;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Barrier};
use std::thread;

/// The executor's worker thread pool.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub(crate) fn new(shared: &Arc<ExecutorShared>) -> ThreadPool {
        let worker_count = shared.worker_count();

        // Workers hold at the barrier until the unpark handles are
        // registered; nothing runs against a half-initialized pool.
        let barrier = Arc::new(Barrier::new(worker_count + 1));

        let mut handles = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let handle = spawn_worker_thread(worker_index, shared, &barrier);
            threads.push(handle.thread().clone());
            handles.push(handle);
        }

        shared.register_threads(threads);
        barrier.wait();

        ThreadPool { handles }
    }

    pub(crate) fn join_all(self) -> Result<()> {
        let panicked = self
            .handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(Result::is_err)
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", panicked))
        }
    }
}

fn spawn_worker_thread(
    worker_index: usize,
    shared: &Arc<ExecutorShared>,
    barrier: &Arc<Barrier>,
) -> thread::JoinHandle<()> {
    let mut builder = thread::Builder::new().name((shared.cfg.thread_name.0)());
    if let Some(stack_size) = shared.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let shared = Arc::clone(shared);
    let barrier = Arc::clone(barrier);
    builder
        .spawn(move || {
            barrier.wait();
            Worker::new(worker_index, shared).run();
        })
        .expect("failed to spawn worker thread")
}
