//! The retire/discard engine.
//!
//! Every task that reaches READY terminates through exactly one of two paths:
//! `retire` (it executed, successfully or not) or `discard` (an upstream
//! failure tore it down before it could run). Both paths run the cleanup
//! callback exactly once and then advance or abort the downstream graph.

use crate::status::{StatusCode, TaskResult};
use crate::submission::Submission;
use crate::task::list::TaskList;
use crate::task::{TaskFlags, TaskPayload, TaskRef};
use smallvec::SmallVec;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// Runs the cleanup callback and releases the pool slot, exactly once.
///
/// The pool slot is taken out before the callback runs: the callback may drop
/// external references to the task, so nothing touches the header afterwards
/// except through what was captured here.
pub(crate) fn cleanup(task: &TaskRef, status_code: StatusCode) {
    let pool_slot = task.pool.lock().take();
    if let Some(cleanup_fn) = task.cleanup.lock().take() {
        cleanup_fn(status_code);
    }
    if let Some(slot) = pool_slot {
        slot.release();
    }
}

/// Retires a task whose pending dependency count has reached zero.
///
/// On success the completion task is advanced and, if this was its last
/// dependency, staged for execution. On failure the status moves into the
/// scope and the completion task is discarded (if it just became ready) or
/// flagged ABORTED (if other dependencies are still outstanding; whoever
/// delivers the final decrement deals with it).
pub(crate) fn retire(task: &TaskRef, pending_submission: &mut Submission, status: TaskResult) {
    debug_assert_eq!(
        task.pending.load(Ordering::Acquire),
        0,
        "retiring a task with pending dependencies"
    );

    let completion = task.completion.lock().take();
    let completion_ready = completion
        .as_ref()
        .is_some_and(|completion| completion.pending.fetch_sub(1, Ordering::AcqRel) == 1);

    match status {
        Ok(()) => {
            cleanup(task, StatusCode::Ok);
            if completion_ready {
                if let Some(completion) = completion {
                    pending_submission.enqueue(completion);
                }
            }
        }
        Err(status) => {
            task.scope().fail(status);
            cleanup(task, StatusCode::Aborted);
            if let Some(completion) = completion {
                if completion_ready {
                    let mut discard_worklist = TaskList::new();
                    discard(&completion, &mut discard_worklist);
                    discard_worklist.discard_all();
                } else {
                    completion.set_flag(TaskFlags::ABORTED);
                }
            }
        }
    }
}

/// Tears a task down without running its closure: severs its downstream
/// edges, closes the scope for fences, and runs cleanup as aborted.
/// Downstream tasks freed by the severed edges join `discard_worklist`
/// head-first, so draining it walks the subgraph depth-first for locality.
pub(crate) fn discard(task: &TaskRef, discard_worklist: &mut TaskList) {
    trace!(?task, "discard");

    if let Some(completion) = task.completion.lock().take() {
        sever_edge(&completion, discard_worklist);
    }

    match task.payload() {
        TaskPayload::Barrier { dependents } => {
            for dependent in dependents.lock().drain(..) {
                sever_edge(&dependent, discard_worklist);
            }
        }
        TaskPayload::Fence => task.scope().end(),
        _ => {}
    }

    cleanup(task, StatusCode::Aborted);
}

/// Removes one inbound edge of `downstream`. The final decrement pushes the
/// task onto the worklist; with other dependencies still live, the ABORTED
/// flag makes whoever delivers the last decrement skip the closure.
fn sever_edge(downstream: &TaskRef, discard_worklist: &mut TaskList) {
    downstream.set_flag(TaskFlags::ABORTED);
    if downstream.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
        discard_worklist.push_front(Arc::clone(downstream));
    }
}

pub(crate) fn execute_call(task: &TaskRef, pending_submission: &mut Submission) {
    let TaskPayload::Call { closure, status } = task.payload() else {
        unreachable!("execute_call on a non-call task");
    };

    if !task.has_flag(TaskFlags::CALL_EXECUTED) {
        task.set_flag(TaskFlags::CALL_EXECUTED);
        // The closure may wire nested tasks onto this task, raising its
        // pending count above zero; it then stays alive until the nested
        // graph drains.
        if let Err(user_status) = closure(task, pending_submission) {
            status.try_set(user_status);
        }
    }

    // The staged nested tasks cannot run before the flush that follows this
    // call, so a non-zero count here is stable until they execute.
    if task.pending.load(Ordering::Acquire) == 0 {
        retire(task, pending_submission, status.take());
    }
}

pub(crate) fn retire_barrier(task: &TaskRef, pending_submission: &mut Submission) {
    let TaskPayload::Barrier { dependents } = task.payload() else {
        unreachable!("retire_barrier on a non-barrier task");
    };

    // Walk in reverse so the staged tasks come out in LIFO order.
    let dependents: SmallVec<[TaskRef; 4]> = dependents.lock().drain(..).collect();
    for dependent in dependents.iter().rev() {
        if dependent.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            pending_submission.enqueue(Arc::clone(dependent));
        }
    }

    retire(task, pending_submission, Ok(()));
}

pub(crate) fn retire_fence(task: &TaskRef, pending_submission: &mut Submission) {
    task.scope().end();
    retire(task, pending_submission, Ok(()));
}

pub(crate) fn execute_wait(task: &TaskRef, pending_submission: &mut Submission) {
    let TaskPayload::Wait { handle } = task.payload() else {
        unreachable!("execute_wait on a non-wait task");
    };

    // Blocking is entirely the handle's business; the worker thread obeys it.
    if !handle.check() {
        handle.wait();
    }
    task.set_flag(TaskFlags::WAIT_COMPLETED);
    retire(task, pending_submission, Ok(()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use crate::status::{StatusCode, StatusError};
    use crate::task::Task;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn submission() -> Submission {
        Submission::new(1)
    }

    #[test]
    fn retire_ok_stages_ready_completion() {
        let scope = Scope::new("retire");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);
        a.set_completion(&b);

        let mut pending = submission();
        retire(&a, &mut pending, Ok(()));

        assert!(b.is_ready());
        assert!(!pending.is_empty());
        assert_eq!(scope.status(), StatusCode::Ok);
    }

    #[test]
    fn retire_ok_leaves_waiting_completion_alone() {
        let scope = Scope::new("retire");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);
        let c = Task::nop(&scope);
        a.set_completion(&c);
        b.set_completion(&c);

        let mut pending = submission();
        retire(&a, &mut pending, Ok(()));

        // b still holds an edge; c must not be staged yet.
        assert!(!c.is_ready());
        assert!(pending.is_empty());
    }

    #[test]
    fn retire_failure_discards_ready_completion() {
        let scope = Scope::new("retire");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);
        a.set_completion(&b);

        let cleaned = Arc::new(Mutex::new(Vec::new()));
        for (task, label) in [(&a, "a"), (&b, "b")] {
            let cleaned = Arc::clone(&cleaned);
            task.set_cleanup(move |code| cleaned.lock().push((label, code)));
        }

        let mut pending = submission();
        retire(&a, &mut pending, Err(StatusError::User(anyhow!("boom"))));

        assert!(pending.is_empty());
        assert!(scope.has_failed());
        assert_eq!(
            *cleaned.lock(),
            vec![("a", StatusCode::Aborted), ("b", StatusCode::Aborted)]
        );
    }

    #[test]
    fn retire_failure_flags_waiting_completion() {
        let scope = Scope::new("retire");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);
        let c = Task::nop(&scope);
        a.set_completion(&c);
        b.set_completion(&c);

        let mut pending = submission();
        retire(&a, &mut pending, Err(StatusError::User(anyhow!("boom"))));

        assert!(!c.is_ready());
        assert!(c.has_flag(TaskFlags::ABORTED));

        // The surviving dependency retires cleanly; c becomes ready but keeps
        // the flag so the worker discards it instead of executing.
        retire(&b, &mut pending, Ok(()));
        assert!(c.is_ready());
        assert!(c.has_flag(TaskFlags::ABORTED));
        assert!(!pending.is_empty());
    }

    #[test]
    fn discard_walks_diamond_once() {
        let scope = Scope::new("discard");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);
        let c = Task::nop(&scope);
        let d = Task::nop(&scope);
        // a and b both feed c; c feeds d.
        a.set_completion(&c);
        b.set_completion(&c);
        c.set_completion(&d);

        let cleanups = Arc::new(Mutex::new(0usize));
        for task in [&c, &d] {
            let cleanups = Arc::clone(&cleanups);
            task.set_cleanup(move |code| {
                assert_eq!(code, StatusCode::Aborted);
                *cleanups.lock() += 1;
            });
        }

        let mut worklist = TaskList::new();
        discard(&a, &mut worklist);
        worklist.discard_all();
        // c still has b's edge: flagged, not cleaned.
        assert_eq!(*cleanups.lock(), 0);
        assert!(c.has_flag(TaskFlags::ABORTED));

        discard(&b, &mut worklist);
        worklist.discard_all();
        // The final severed edge frees c, which drags d with it. Exactly one
        // cleanup each.
        assert_eq!(*cleanups.lock(), 2);
    }

    #[test]
    fn discard_of_fence_closes_scope() {
        let scope = Scope::new("discard");
        let fence = Task::fence(&scope);
        assert!(!scope.is_idle());

        let mut worklist = TaskList::new();
        discard(&fence, &mut worklist);
        assert!(scope.is_idle());
        assert!(worklist.is_empty());
    }

    #[test]
    fn barrier_retire_stages_ready_dependents() {
        let scope = Scope::new("barrier");
        let deps: Vec<_> = (0..3).map(|_| Task::nop(&scope)).collect();
        let barrier = Task::barrier(&scope, deps.clone());

        let mut pending = submission();
        retire_barrier(&barrier, &mut pending);

        for dep in &deps {
            assert!(dep.is_ready());
        }
        let mut staged = 0;
        pending.drain_into(|_, _| staged += 1);
        assert_eq!(staged, 3);
    }

    #[test]
    fn call_captures_first_failure() {
        let scope = Scope::new("call");
        let task = Task::call(&scope, |_, _| Err(StatusError::User(anyhow!("first"))));

        let mut pending = submission();
        execute_call(&task, &mut pending);

        let err = scope.consume_status().unwrap_err();
        assert_eq!(err.to_string(), "first");
    }
}
