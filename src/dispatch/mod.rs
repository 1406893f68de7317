//! 3-D dispatch: a parallel-for over an XYZ workgroup grid.
//!
//! A dispatch is issued the first time a worker runs it: the workgroup count
//! is resolved (directly or through an indirection buffer) and the grid is
//! split into slices (static partitioning) or shards (work stealing over an
//! atomic tile cursor). The dispatch itself retires once the last slice or
//! shard completion edge drops its pending count back to zero.

use crate::runtime::RuntimeConfig;
use crate::status::{StatusSlot, TaskResult};
use crate::submission::Submission;
use crate::task::pool::TaskPool;
use crate::task::{lifecycle, TaskFlags, TaskPayload, TaskRef};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) mod shard;
pub(crate) mod slice;

pub(crate) type TileClosure =
    Box<dyn Fn(&mut TileContext<'_>, &mut Submission) -> TaskResult + Send + Sync>;

/// How a dispatch's grid is handed to workers. Chosen by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Static partitioning: the grid is split into fixed sub-grid slices,
    /// placed round-robin across workers at issue time.
    Slice,
    /// Dynamic work stealing: one shard per worker reserves tile ranges from
    /// a shared atomic cursor until the grid is drained.
    Shard,
}

/// Static shape of a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchDesc {
    /// Size of one workgroup, carried through to the tile context.
    pub workgroup_size: [u32; 3],
    /// Bytes of per-worker scratch the tiles need. Workers whose local memory
    /// is smaller fail the slice/shard with RESOURCE_EXHAUSTED.
    pub local_memory_size: usize,
    pub mode: DispatchMode,
}

impl Default for DispatchDesc {
    fn default() -> Self {
        DispatchDesc {
            workgroup_size: [1, 1, 1],
            local_memory_size: 0,
            mode: DispatchMode::Shard,
        }
    }
}

/// Producer-writable indirection target for workgroup counts resolved at
/// issue time (an upstream task computes the count the dispatch reads).
#[derive(Debug, Default)]
pub struct WorkgroupCountBuffer([AtomicU32; 3]);

impl WorkgroupCountBuffer {
    pub fn new(workgroup_count: [u32; 3]) -> Arc<WorkgroupCountBuffer> {
        let buffer = WorkgroupCountBuffer::default();
        buffer.store(workgroup_count);
        Arc::new(buffer)
    }

    pub fn store(&self, workgroup_count: [u32; 3]) {
        for (slot, value) in self.0.iter().zip(workgroup_count) {
            slot.store(value, Ordering::Release);
        }
    }

    pub fn load(&self) -> [u32; 3] {
        [
            self.0[0].load(Ordering::Acquire),
            self.0[1].load(Ordering::Acquire),
            self.0[2].load(Ordering::Acquire),
        ]
    }
}

#[derive(Debug, Clone)]
pub enum WorkgroupCountSource {
    /// Inline count, known at wire-up.
    Direct([u32; 3]),
    /// Count read from the buffer when the dispatch issues. The dependency
    /// edges of the graph must make the write happen-before the dispatch
    /// becomes ready.
    Indirect(Arc<WorkgroupCountBuffer>),
}

/// Per-dispatch work counters. Slices and shards aggregate locally and merge
/// into the dispatch on retire, which keeps the tile loop free of shared-state
/// contention; the dispatch rolls up into its scope the same way.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStatistics {
    /// Tiles the closure was invoked for.
    pub tiles_executed: u64,
    /// Tile ranges reserved from shard cursors.
    pub reservations: u64,
}

impl DispatchStatistics {
    pub fn merge(&mut self, other: &DispatchStatistics) {
        self.tiles_executed += other.tiles_executed;
        self.reservations += other.reservations;
    }
}

/// Atomic twin of [`DispatchStatistics`] for the merge targets.
#[derive(Debug, Default)]
pub(crate) struct SharedStatistics {
    tiles_executed: AtomicU64,
    reservations: AtomicU64,
}

impl SharedStatistics {
    pub(crate) fn merge(&self, statistics: &DispatchStatistics) {
        self.tiles_executed
            .fetch_add(statistics.tiles_executed, Ordering::Relaxed);
        self.reservations
            .fetch_add(statistics.reservations, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchStatistics {
        DispatchStatistics {
            tiles_executed: self.tiles_executed.load(Ordering::Relaxed),
            reservations: self.reservations.load(Ordering::Relaxed),
        }
    }
}

/// Everything a tile closure gets to see for one workgroup invocation.
pub struct TileContext<'a> {
    /// This tile's coordinates in the grid.
    pub workgroup_xyz: [u32; 3],
    pub workgroup_size: [u32; 3],
    pub workgroup_count: [u32; 3],
    /// Executor-local statistics; merged into the dispatch on retire.
    pub statistics: &'a mut DispatchStatistics,
    /// Scratch span sized to the dispatch's request, carved from the worker's
    /// local memory. Contents do not survive across tiles.
    pub local_memory: &'a mut [u8],
}

pub(crate) struct DispatchPayload {
    pub(crate) closure: TileClosure,
    pub(crate) workgroup_size: [u32; 3],
    pub(crate) count: WorkgroupCountSource,
    pub(crate) mode: DispatchMode,
    pub(crate) local_memory_size: usize,
    /// First tile failure, CAS-style; the dispatch carries the true status
    /// while slices/shards retire OK.
    pub(crate) status: StatusSlot,
    pub(crate) statistics: SharedStatistics,
}

pub(crate) struct SlicePayload {
    pub(crate) dispatch: TaskRef,
    pub(crate) workgroup_base: [u32; 3],
    /// Inclusive upper corner of the sub-grid.
    pub(crate) workgroup_range: [u32; 3],
    pub(crate) workgroup_count: [u32; 3],
}

pub(crate) struct ShardPayload {
    pub(crate) dispatch: TaskRef,
    pub(crate) state: Arc<ShardState>,
}

/// Iteration state shared by every shard of one dispatch.
#[derive(Debug)]
pub(crate) struct ShardState {
    /// Next unclaimed tile. Relaxed fetch-add is enough: tiles are
    /// independent and the claim itself is the only synchronization needed.
    pub(crate) tile_cursor: AtomicU32,
    pub(crate) tile_count: u32,
    pub(crate) tiles_per_reservation: u32,
    pub(crate) workgroup_count: [u32; 3],
}

/// First execution of a dispatch: resolve the workgroup count and fan the
/// grid out as slices or shards. The DISPATCH_RETIRE flag routes the next
/// execution (triggered by the last completion edge) to [`retire_dispatch`].
pub(crate) fn issue(
    task: &TaskRef,
    cfg: &RuntimeConfig,
    pool: &Arc<TaskPool>,
    pending_submission: &mut Submission,
) {
    let TaskPayload::Dispatch(dispatch) = task.payload() else {
        unreachable!("issue on a non-dispatch task");
    };

    task.set_flag(TaskFlags::DISPATCH_RETIRE);

    // By the dispatch being ready, any dependency writing the indirection
    // buffer has retired and the count is safe to read. Slices and shard
    // state capture the resolved value; nothing reads the source again.
    let workgroup_count = match &dispatch.count {
        WorkgroupCountSource::Direct(count) => *count,
        WorkgroupCountSource::Indirect(buffer) => buffer.load(),
    };

    if workgroup_count.iter().any(|&count| count == 0) {
        // Nothing to execute; bail early.
        retire_dispatch(task, pending_submission);
        return;
    }

    match dispatch.mode {
        DispatchMode::Slice => {
            slice::issue_sliced(task, dispatch, workgroup_count, cfg, pool, pending_submission);
        }
        DispatchMode::Shard => {
            shard::issue_sharded(task, dispatch, workgroup_count, cfg, pool, pending_submission);
        }
    }
}

/// Runs when the last slice/shard drops the dispatch's pending count to zero
/// (or immediately, for an empty grid). Rolls statistics up into the scope,
/// takes the aggregated status, and retires through the generic engine.
pub(crate) fn retire_dispatch(task: &TaskRef, pending_submission: &mut Submission) {
    let TaskPayload::Dispatch(dispatch) = task.payload() else {
        unreachable!("retire_dispatch on a non-dispatch task");
    };

    task.scope().merge_statistics(&dispatch.statistics.snapshot());

    let status = dispatch.status.take();
    lifecycle::retire(task, pending_submission, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(DispatchStatistics: Send, Sync, Copy);
    assert_impl_all!(WorkgroupCountBuffer: Send, Sync);

    #[test]
    fn statistics_merge_adds_fields() {
        let mut total = DispatchStatistics::default();
        total.merge(&DispatchStatistics {
            tiles_executed: 3,
            reservations: 1,
        });
        total.merge(&DispatchStatistics {
            tiles_executed: 4,
            reservations: 2,
        });
        assert_eq!(total.tiles_executed, 7);
        assert_eq!(total.reservations, 3);

        let shared = SharedStatistics::default();
        shared.merge(&total);
        shared.merge(&total);
        assert_eq!(shared.snapshot().tiles_executed, 14);
    }

    #[test]
    fn workgroup_count_buffer_round_trips() {
        let buffer = WorkgroupCountBuffer::new([2, 3, 4]);
        assert_eq!(buffer.load(), [2, 3, 4]);
        buffer.store([0, 0, 0]);
        assert_eq!(buffer.load(), [0, 0, 0]);
    }
}
