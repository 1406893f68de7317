//! Shared helpers for the crate's tests.

use crate::scope::Scope;
use crate::status::{StatusCode, StatusError};
use crate::task::{Task, TaskRef, WaitHandle};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// Records the order labelled call tasks actually executed in.
#[derive(Clone, Default)]
pub struct ExecutionLog(Arc<Mutex<Vec<&'static str>>>);

impl ExecutionLog {
    pub fn new() -> ExecutionLog {
        ExecutionLog::default()
    }

    pub fn record(&self, label: &'static str) {
        self.0.lock().push(label);
    }

    /// A call task that logs `label` and succeeds.
    pub fn ok_call(&self, scope: &Arc<Scope>, label: &'static str) -> TaskRef {
        let log = self.clone();
        Task::call(scope, move |_, _| {
            log.record(label);
            Ok(())
        })
    }

    /// A call task that logs `label` and fails with an opaque user status.
    pub fn failing_call(
        &self,
        scope: &Arc<Scope>,
        label: &'static str,
        message: &'static str,
    ) -> TaskRef {
        let log = self.clone();
        Task::call(scope, move |_, _| {
            log.record(label);
            Err(StatusError::User(anyhow!(message)))
        })
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }
}

/// Observes the terminal status code of every task it is attached to.
#[derive(Clone, Default)]
pub struct CleanupProbe(Arc<Mutex<Vec<(&'static str, StatusCode)>>>);

impl CleanupProbe {
    pub fn new() -> CleanupProbe {
        CleanupProbe::default()
    }

    pub fn attach(&self, task: &TaskRef, label: &'static str) {
        let probe = self.clone();
        task.set_cleanup(move |code| probe.0.lock().push((label, code)));
    }

    pub fn entries(&self) -> Vec<(&'static str, StatusCode)> {
        self.0.lock().clone()
    }

    pub fn codes_for(&self, label: &'static str) -> Vec<StatusCode> {
        self.0
            .lock()
            .iter()
            .filter(|(entry, _)| *entry == label)
            .map(|(_, code)| *code)
            .collect()
    }
}

/// Wait handle that reports unsatisfied for the first `n` checks.
pub struct CountdownWaitHandle(AtomicU32);

impl CountdownWaitHandle {
    pub fn new(checks_until_ready: u32) -> CountdownWaitHandle {
        CountdownWaitHandle(AtomicU32::new(checks_until_ready))
    }
}

impl WaitHandle for CountdownWaitHandle {
    fn check(&self) -> bool {
        let remaining = self.0.load(Ordering::Relaxed);
        if remaining == 0 {
            true
        } else {
            self.0.store(remaining - 1, Ordering::Relaxed);
            false
        }
    }
}
