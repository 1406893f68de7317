use crate::dispatch::{
    DispatchDesc, DispatchPayload, SharedStatistics, ShardPayload, ShardState, SlicePayload,
    TileContext, WorkgroupCountSource,
};
use crate::scope::Scope;
use crate::status::{StatusCode, StatusSlot, TaskResult};
use crate::submission::Submission;
use bitflags::bitflags;
use parking_lot::Mutex;
use self::pool::PoolSlot;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) mod lifecycle;
pub(crate) mod list;
pub mod pool;

pub type TaskRef = Arc<Task>;

pub(crate) type CleanupFn = Box<dyn FnOnce(StatusCode) + Send>;
pub(crate) type CallClosure =
    Box<dyn Fn(&TaskRef, &mut Submission) -> TaskResult + Send + Sync>;

/// Opaque primitive a WAIT task blocks on. Richer wait semantics (timers,
/// external events) live entirely behind this hook; the scheduler only ever
/// calls `check` and `wait`.
pub trait WaitHandle: Send + Sync {
    /// Non-blocking readiness check.
    fn check(&self) -> bool;

    /// Block until the handle is satisfied. Handles backed by real blocking
    /// primitives should override this; the default yield-polls `check`.
    fn wait(&self) {
        while !self.check() {
            std::thread::yield_now();
        }
    }
}

/// Wait handle that is always satisfied.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateWaitHandle;

impl WaitHandle for ImmediateWaitHandle {
    fn check(&self) -> bool {
        true
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskFlags: u32 {
        /// An upstream failure aborted this task before it executed; its
        /// closure must not run.
        const ABORTED = 1 << 0;
        /// The wait condition was observed satisfied.
        const WAIT_COMPLETED = 1 << 1;
        /// The workgroup count is read through the indirect buffer at issue
        /// time.
        const DISPATCH_INDIRECT = 1 << 2;
        /// The dispatch has been issued; the next time it runs, all of its
        /// slices or shards have completed and it retires.
        const DISPATCH_RETIRE = 1 << 3;
        /// The call closure already ran; re-entry after a nested graph drains
        /// retires with the captured status instead of re-invoking.
        const CALL_EXECUTED = 1 << 4;
    }
}

/// Set of workers a task may run on. Defaults to any worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerMask(pub u64);

impl WorkerMask {
    pub const ANY: WorkerMask = WorkerMask(u64::MAX);

    pub fn single(worker_index: usize) -> WorkerMask {
        debug_assert!(worker_index < 64);
        WorkerMask(1 << worker_index)
    }

    pub fn contains(&self, worker_index: usize) -> bool {
        worker_index < 64 && self.0 & (1 << worker_index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for WorkerMask {
    fn default() -> Self {
        WorkerMask::ANY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Nop,
    Call,
    Barrier,
    Fence,
    Wait,
    Dispatch,
    DispatchSlice,
    DispatchShard,
}

pub(crate) enum TaskPayload {
    Nop,
    Call {
        closure: CallClosure,
        status: StatusSlot,
    },
    Barrier {
        /// Borrowed fan-out in the original; owned handles here. Wired before
        /// submission, drained at retire or discard.
        dependents: Mutex<SmallVec<[TaskRef; 4]>>,
    },
    Fence,
    Wait {
        handle: Box<dyn WaitHandle>,
    },
    Dispatch(DispatchPayload),
    Slice(SlicePayload),
    Shard(ShardPayload),
}

/// A single node of the task graph.
///
/// Tasks are wired into the DAG with completion and barrier edges, enqueued
/// into a [`Submission`], executed by a worker once their pending dependency
/// count reaches zero, and then retired (success) or discarded (abort).
/// Either terminal path runs the cleanup callback exactly once.
pub struct Task {
    payload: TaskPayload,
    scope: Arc<Scope>,
    affinity: AtomicU64,
    flags: AtomicU32,
    /// Remaining in-degree. The task is eligible for a ready queue iff zero.
    pub(crate) pending: AtomicU32,
    /// Single successor whose pending count was bumped at wire-up. Taken on
    /// retire or discard.
    pub(crate) completion: Mutex<Option<TaskRef>>,
    pub(crate) cleanup: Mutex<Option<CleanupFn>>,
    /// Pool backref for transient tasks; cleanup releases the slot.
    pub(crate) pool: Mutex<Option<PoolSlot>>,
}

impl Task {
    fn new(payload: TaskPayload, scope: &Arc<Scope>) -> TaskRef {
        Arc::new(Task {
            payload,
            scope: Arc::clone(scope),
            affinity: AtomicU64::new(WorkerMask::ANY.0),
            flags: AtomicU32::new(TaskFlags::empty().bits()),
            pending: AtomicU32::new(0),
            completion: Mutex::new(None),
            cleanup: Mutex::new(None),
            pool: Mutex::new(None),
        })
    }

    pub fn nop(scope: &Arc<Scope>) -> TaskRef {
        Task::new(TaskPayload::Nop, scope)
    }

    pub fn call<F>(scope: &Arc<Scope>, closure: F) -> TaskRef
    where
        F: Fn(&TaskRef, &mut Submission) -> TaskResult + Send + Sync + 'static,
    {
        Task::new(
            TaskPayload::Call {
                closure: Box::new(closure),
                status: StatusSlot::default(),
            },
            scope,
        )
    }

    /// Creates a barrier fanning out to `dependents`, bumping each dependent's
    /// pending count.
    pub fn barrier(scope: &Arc<Scope>, dependents: Vec<TaskRef>) -> TaskRef {
        let task = Task::barrier_empty(scope);
        task.set_barrier_dependents(dependents);
        task
    }

    /// Creates a barrier with no dependents; wire them later with
    /// [`Task::set_barrier_dependents`], before submission.
    pub fn barrier_empty(scope: &Arc<Scope>) -> TaskRef {
        Task::new(
            TaskPayload::Barrier {
                dependents: Mutex::new(SmallVec::new()),
            },
            scope,
        )
    }

    /// Creates a fence, opening the scope. The scope closes again when the
    /// fence retires (or is discarded).
    pub fn fence(scope: &Arc<Scope>) -> TaskRef {
        scope.begin();
        Task::new(TaskPayload::Fence, scope)
    }

    pub fn wait<H>(scope: &Arc<Scope>, handle: H) -> TaskRef
    where
        H: WaitHandle + 'static,
    {
        Task::new(
            TaskPayload::Wait {
                handle: Box::new(handle),
            },
            scope,
        )
    }

    /// Creates a 3-D dispatch running `closure` once per workgroup. The
    /// workgroup count is read from `count` at issue time; issuance mode
    /// (static slices vs work-stealing shards) comes from `desc`.
    pub fn dispatch<F>(
        scope: &Arc<Scope>,
        desc: DispatchDesc,
        count: WorkgroupCountSource,
        closure: F,
    ) -> TaskRef
    where
        F: Fn(&mut TileContext<'_>, &mut Submission) -> TaskResult + Send + Sync + 'static,
    {
        let indirect = matches!(count, WorkgroupCountSource::Indirect(_));
        let task = Task::new(
            TaskPayload::Dispatch(DispatchPayload {
                closure: Box::new(closure),
                workgroup_size: desc.workgroup_size,
                count,
                mode: desc.mode,
                local_memory_size: desc.local_memory_size,
                status: StatusSlot::default(),
                statistics: SharedStatistics::default(),
            }),
            scope,
        );
        if indirect {
            task.set_flag(TaskFlags::DISPATCH_INDIRECT);
        }
        task
    }

    pub(crate) fn dispatch_slice(
        dispatch: &TaskRef,
        workgroup_base: [u32; 3],
        workgroup_range: [u32; 3],
        workgroup_count: [u32; 3],
    ) -> TaskRef {
        let task = Task::new(
            TaskPayload::Slice(SlicePayload {
                dispatch: Arc::clone(dispatch),
                workgroup_base,
                workgroup_range,
                workgroup_count,
            }),
            dispatch.scope(),
        );
        task.set_completion(dispatch);
        task
    }

    pub(crate) fn dispatch_shard(dispatch: &TaskRef, state: &Arc<ShardState>) -> TaskRef {
        let task = Task::new(
            TaskPayload::Shard(ShardPayload {
                dispatch: Arc::clone(dispatch),
                state: Arc::clone(state),
            }),
            dispatch.scope(),
        );
        task.set_completion(dispatch);
        task
    }

    pub fn kind(&self) -> TaskKind {
        match &self.payload {
            TaskPayload::Nop => TaskKind::Nop,
            TaskPayload::Call { .. } => TaskKind::Call,
            TaskPayload::Barrier { .. } => TaskKind::Barrier,
            TaskPayload::Fence => TaskKind::Fence,
            TaskPayload::Wait { .. } => TaskKind::Wait,
            TaskPayload::Dispatch(_) => TaskKind::Dispatch,
            TaskPayload::Slice(_) => TaskKind::DispatchSlice,
            TaskPayload::Shard(_) => TaskKind::DispatchShard,
        }
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub(crate) fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    /// Wires the post-edge: `completion` becomes ready only after this task
    /// retires. Must happen before either task is submitted, and only once.
    pub fn set_completion(&self, completion: &TaskRef) {
        let mut slot = self.completion.lock();
        debug_assert!(
            slot.is_none(),
            "completion edge may be wired exactly once"
        );
        completion.pending.fetch_add(1, Ordering::SeqCst);
        *slot = Some(Arc::clone(completion));
    }

    /// Wires barrier fan-out, bumping every dependent's pending count. Must
    /// happen before the barrier or any dependent is submitted.
    pub fn set_barrier_dependents(&self, dependent_tasks: Vec<TaskRef>) {
        let TaskPayload::Barrier { dependents } = &self.payload else {
            debug_assert!(false, "set_barrier_dependents on a non-barrier task");
            return;
        };
        let mut dependents = dependents.lock();
        debug_assert!(dependents.is_empty(), "barrier dependents already wired");
        for dependent in &dependent_tasks {
            dependent.pending.fetch_add(1, Ordering::Relaxed);
        }
        dependents.extend(dependent_tasks);
    }

    /// Registers a callback invoked exactly once when the task retires or is
    /// discarded, with the terminal status code.
    pub fn set_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce(StatusCode) + Send + 'static,
    {
        *self.cleanup.lock() = Some(Box::new(cleanup));
    }

    pub fn set_affinity(&self, mask: WorkerMask) {
        self.affinity.store(mask.0, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> WorkerMask {
        WorkerMask(self.affinity.load(Ordering::Relaxed))
    }

    /// A relaxed readiness probe. False negatives are fine (the concurrent
    /// decrement re-enqueues), false positives are not.
    pub fn is_ready(&self) -> bool {
        self.pending.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn set_flag(&self, flag: TaskFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub(crate) fn has_flag(&self, flag: TaskFlags) -> bool {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)).contains(flag)
    }

    pub(crate) fn adopt_pool_slot(&self, slot: PoolSlot) {
        *self.pool.lock() = Some(slot);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind())
            .field("scope", &self.scope.name())
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field(
                "flags",
                &TaskFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task: Send, Sync);
    assert_impl_all!(WorkerMask: Send, Sync, Copy);

    #[test]
    fn worker_mask_membership() {
        assert!(WorkerMask::ANY.contains(0));
        assert!(WorkerMask::ANY.contains(63));
        assert!(!WorkerMask::ANY.contains(64));

        let one = WorkerMask::single(3);
        assert!(one.contains(3));
        assert!(!one.contains(2));
        assert!(!one.is_empty());
        assert!(WorkerMask(0).is_empty());
    }

    #[test]
    fn completion_edge_bumps_pending() {
        let scope = Scope::new("wiring");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);

        assert!(b.is_ready());
        a.set_completion(&b);
        assert!(!b.is_ready());
        assert!(a.is_ready());
    }

    #[test]
    fn barrier_wiring_bumps_each_dependent() {
        let scope = Scope::new("wiring");
        let deps: Vec<_> = (0..3).map(|_| Task::nop(&scope)).collect();
        let barrier = Task::barrier(&scope, deps.clone());

        assert!(barrier.is_ready());
        for dep in &deps {
            assert_eq!(dep.pending.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn fence_opens_scope() {
        let scope = Scope::new("fences");
        assert!(scope.is_idle());
        let _fence = Task::fence(&scope);
        assert!(!scope.is_idle());
    }

    #[test]
    fn flags_accumulate() {
        let scope = Scope::new("flags");
        let task = Task::nop(&scope);

        assert!(!task.has_flag(TaskFlags::ABORTED));
        task.set_flag(TaskFlags::ABORTED);
        task.set_flag(TaskFlags::DISPATCH_RETIRE);
        assert!(task.has_flag(TaskFlags::ABORTED));
        assert!(task.has_flag(TaskFlags::DISPATCH_RETIRE));
        assert!(!task.has_flag(TaskFlags::WAIT_COMPLETED));
    }
}
