use crate::dispatch::{DispatchStatistics, SharedStatistics};
use crate::status::{StatusCode, StatusError, StatusSlot, TaskResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Logical grouping of tasks submitted together.
///
/// A scope tracks outstanding work (one unit per in-flight fence) and
/// accumulates a permanent first-failure status. A failed scope keeps
/// draining: in-flight executions complete, and every task of the scope that
/// has not yet executed is cleaned up as aborted.
#[derive(Debug)]
pub struct Scope {
    /// Diagnostic name, surfaced in logs.
    name: String,

    /// In-flight fences. Bumped by fence initialization, dropped by fence
    /// retirement or discard.
    outstanding: Mutex<usize>,
    idle: Condvar,

    /// Sticky first-failure slot. Later failures are consumed by a no-op;
    /// aggregating across parallel shards would need synchronization on the
    /// fast path for no benefit.
    permanent_status: StatusSlot,

    /// Work counters rolled up from every dispatch that retires in the scope.
    statistics: SharedStatistics,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Scope {
            name: name.into(),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            permanent_status: StatusSlot::default(),
            statistics: SharedStatistics::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn begin(&self) {
        *self.outstanding.lock() += 1;
    }

    pub(crate) fn end(&self) {
        let mut outstanding = self.outstanding.lock();
        debug_assert!(*outstanding > 0, "scope.end without a matching begin");
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn fail(&self, status: StatusError) {
        debug!(scope = %self.name, %status, "scope failure captured");
        self.permanent_status.try_set(status);
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.permanent_status.is_set()
    }

    pub(crate) fn merge_statistics(&self, statistics: &DispatchStatistics) {
        self.statistics.merge(statistics);
    }

    pub fn is_idle(&self) -> bool {
        *self.outstanding.lock() == 0
    }

    /// Blocks until every fence of the scope has retired. The scope is always
    /// fully drained before this returns, failed or not.
    pub fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.idle.wait(&mut outstanding);
        }
    }

    /// Like [`Scope::wait_idle`] with a deadline. Returns false on timeout.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            if self.idle.wait_for(&mut outstanding, timeout).timed_out() {
                return *outstanding == 0;
            }
        }
        true
    }

    /// Peeks the code of the permanent status without consuming it.
    pub fn status(&self) -> StatusCode {
        self.permanent_status.code()
    }

    /// Moves the permanent status out, resetting the scope to OK.
    pub fn consume_status(&self) -> TaskResult {
        self.permanent_status.take()
    }

    /// Snapshot of the dispatch work retired into this scope so far.
    pub fn statistics(&self) -> DispatchStatistics {
        self.statistics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use static_assertions::assert_impl_all;
    use std::thread;

    assert_impl_all!(Scope: Send, Sync);

    #[test]
    fn begin_end_balance() {
        let scope = Scope::new("balance");
        assert!(scope.is_idle());

        scope.begin();
        scope.begin();
        assert!(!scope.is_idle());

        scope.end();
        assert!(!scope.is_idle());
        scope.end();
        assert!(scope.is_idle());
    }

    #[test]
    fn wait_idle_wakes_on_last_end() {
        let scope = Scope::new("waiter");
        scope.begin();

        let waiter = {
            let scope = Arc::clone(&scope);
            thread::spawn(move || scope.wait_idle())
        };

        scope.end();
        waiter.join().expect("waiter thread panicked");
        assert!(scope.is_idle());
    }

    #[test]
    fn wait_idle_timeout_reports_outstanding_work() {
        let scope = Scope::new("deadline");
        scope.begin();
        assert!(!scope.wait_idle_timeout(Duration::from_millis(10)));
        scope.end();
        assert!(scope.wait_idle_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn first_failure_is_sticky() {
        let scope = Scope::new("failures");
        assert_eq!(scope.status(), StatusCode::Ok);
        assert!(!scope.has_failed());

        scope.fail(StatusError::User(anyhow!("first")));
        scope.fail(StatusError::User(anyhow!("second")));

        assert!(scope.has_failed());
        let err = scope.consume_status().unwrap_err();
        assert_eq!(err.to_string(), "first");
        assert_eq!(scope.status(), StatusCode::Ok);
    }
}
