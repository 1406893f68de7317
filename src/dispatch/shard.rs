//! Dynamic work stealing: shards pull tile ranges from a shared atomic cursor
//! until the grid is drained.

use crate::dispatch::{
    retire_dispatch, DispatchPayload, DispatchStatistics, ShardState, TileContext,
};
use crate::runtime::RuntimeConfig;
use crate::status::StatusError;
use crate::submission::Submission;
use crate::task::pool::TaskPool;
use crate::task::{lifecycle, Task, TaskPayload, TaskRef};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub(crate) fn issue_sharded(
    task: &TaskRef,
    dispatch: &DispatchPayload,
    workgroup_count: [u32; 3],
    cfg: &RuntimeConfig,
    pool: &Arc<TaskPool>,
    pending_submission: &mut Submission,
) {
    let tile_count = workgroup_count[0] * workgroup_count[1] * workgroup_count[2];
    let worker_count = pending_submission.worker_count() as u32;

    // Coarser reservations amortize the cursor; small grids get sliced up
    // eagerly so every worker has a chance to participate.
    let tiles_per_reservation =
        if tile_count < worker_count * cfg.max_tiles_per_shard_reservation {
            1
        } else {
            cfg.max_tiles_per_shard_reservation
        };

    let state = Arc::new(ShardState {
        tile_cursor: AtomicU32::new(0),
        tile_count,
        tiles_per_reservation,
        workgroup_count,
    });

    // Almost always worker_count, unless the dispatch is tiny.
    let shard_count = tile_count.min(worker_count);

    // Randomize the starting worker.
    let worker_offset = pending_submission.select_worker(task.affinity()) as u32;

    let mut issued = 0u32;
    for i in 0..shard_count {
        let slot = match pool.acquire() {
            Ok(slot) => slot,
            Err(status) => {
                // The shards already issued will drain the whole grid on
                // their own; losing parallelism here is not fatal, but with
                // zero shards issued the error has to surface.
                if issued == 0 {
                    dispatch.status.try_set(status);
                }
                break;
            }
        };
        let shard_task = Task::dispatch_shard(task, &state);
        shard_task.adopt_pool_slot(slot);

        pending_submission
            .enqueue_to(((worker_offset + i) % worker_count) as usize, shard_task);
        issued += 1;
    }

    if issued == 0 {
        retire_dispatch(task, pending_submission);
    }
}

/// Reserves tile ranges from the shared cursor until the grid is exhausted,
/// decomposing each linear tile index into (x, y, z).
pub(crate) fn execute_shard(
    task: &TaskRef,
    local_memory: &mut [u8],
    pending_submission: &mut Submission,
) {
    let TaskPayload::Shard(shard) = task.payload() else {
        unreachable!("execute_shard on a non-shard task");
    };
    let TaskPayload::Dispatch(dispatch) = shard.dispatch.payload() else {
        unreachable!("shard parent is not a dispatch");
    };
    let state = &shard.state;

    if dispatch.local_memory_size > local_memory.len() {
        lifecycle::retire(
            task,
            pending_submission,
            Err(StatusError::ResourceExhausted(format!(
                "dispatch requires {}B of local memory but only {}B is available per-worker",
                dispatch.local_memory_size,
                local_memory.len()
            ))),
        );
        return;
    }
    let scratch = &mut local_memory[..dispatch.local_memory_size];

    let workgroup_count_x = state.workgroup_count[0];
    let workgroup_count_y = state.workgroup_count[1];

    // Statistics stay in this stack frame until retire; shards hammering a
    // shared counter per tile would serialize on the cache line.
    let mut shard_statistics = DispatchStatistics::default();
    let mut result = Ok(());

    let mut tile_base = state
        .tile_cursor
        .fetch_add(state.tiles_per_reservation, Ordering::Relaxed);
    'reservations: while tile_base < state.tile_count {
        shard_statistics.reservations += 1;
        let tile_range = (tile_base + state.tiles_per_reservation).min(state.tile_count);
        for tile_index in tile_base..tile_range {
            let mut linear = tile_index;
            let x = linear % workgroup_count_x;
            linear /= workgroup_count_x;
            let y = linear % workgroup_count_y;
            linear /= workgroup_count_y;
            let z = linear;

            #[cfg(feature = "tile-tracing")]
            tracing::trace!(x, y, z, "shard tile");

            shard_statistics.tiles_executed += 1;
            let mut tile_context = TileContext {
                workgroup_xyz: [x, y, z],
                workgroup_size: dispatch.workgroup_size,
                workgroup_count: state.workgroup_count,
                statistics: &mut shard_statistics,
                local_memory: &mut scratch[..],
            };
            if let Err(status) = (dispatch.closure)(&mut tile_context, pending_submission) {
                // Bail early. Other shards may keep running; the parent
                // aggregates the first failure.
                result = Err(status);
                break 'reservations;
            }
        }

        tile_base = state
            .tile_cursor
            .fetch_add(state.tiles_per_reservation, Ordering::Relaxed);
    }

    dispatch.statistics.merge(&shard_statistics);
    if let Err(status) = result {
        dispatch.status.try_set(status);
    }
    lifecycle::retire(task, pending_submission, Ok(()));
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    // Mirrors the decomposition in execute_shard.
    fn decompose(tile_index: u32, workgroup_count: [u32; 3]) -> [u32; 3] {
        let mut linear = tile_index;
        let x = linear % workgroup_count[0];
        linear /= workgroup_count[0];
        let y = linear % workgroup_count[1];
        linear /= workgroup_count[1];
        [x, y, linear]
    }

    #[rstest]
    #[case(0, [2, 3, 4], [0, 0, 0])]
    #[case(1, [2, 3, 4], [1, 0, 0])]
    #[case(2, [2, 3, 4], [0, 1, 0])]
    #[case(6, [2, 3, 4], [0, 0, 1])]
    #[case(23, [2, 3, 4], [1, 2, 3])]
    #[case(999, [1, 1, 1000], [0, 0, 999])]
    fn tile_index_decomposition(
        #[case] tile_index: u32,
        #[case] workgroup_count: [u32; 3],
        #[case] expected: [u32; 3],
    ) {
        assert_eq!(decompose(tile_index, workgroup_count), expected);
    }

    #[test]
    fn decomposition_is_a_bijection() {
        let workgroup_count = [3u32, 5, 7];
        let tile_count = workgroup_count.iter().product::<u32>();
        let mut seen = vec![false; tile_count as usize];
        for tile_index in 0..tile_count {
            let [x, y, z] = decompose(tile_index, workgroup_count);
            let linear = (z * workgroup_count[1] + y) * workgroup_count[0] + x;
            assert!(!seen[linear as usize]);
            seen[linear as usize] = true;
        }
        assert!(seen.iter().all(|&hit| hit));
    }
}
