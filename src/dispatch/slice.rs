//! Static partitioning: the dispatch grid is divided into sub-grid slices at
//! issue time, each posted to a specific worker.

use crate::dispatch::{retire_dispatch, DispatchPayload, DispatchStatistics, TileContext};
use crate::runtime::RuntimeConfig;
use crate::status::StatusError;
use crate::submission::Submission;
use crate::task::pool::TaskPool;
use crate::task::{lifecycle, Task, TaskPayload, TaskRef};
use std::sync::Arc;

/// Number of slices along each axis: outer ceil so partial blocks at the grid
/// edge still get a slice and the union of ranges covers the grid exactly.
pub(crate) fn slice_counts(workgroup_count: [u32; 3], tiles_per_slice: [u32; 3]) -> [u32; 3] {
    [
        workgroup_count[0].div_ceil(tiles_per_slice[0]),
        workgroup_count[1].div_ceil(tiles_per_slice[1]),
        workgroup_count[2].div_ceil(tiles_per_slice[2]),
    ]
}

pub(crate) fn issue_sliced(
    task: &TaskRef,
    dispatch: &DispatchPayload,
    workgroup_count: [u32; 3],
    cfg: &RuntimeConfig,
    pool: &Arc<TaskPool>,
    pending_submission: &mut Submission,
) {
    let tiles_per_slice = cfg.tiles_per_slice;
    let [slice_count_x, slice_count_y, slice_count_z] =
        slice_counts(workgroup_count, tiles_per_slice);
    let slice_count = slice_count_x * slice_count_y * slice_count_z;

    let worker_count = pending_submission.worker_count() as u32;
    let slices_per_worker = (slice_count / worker_count).max(1);

    // Randomize the starting worker, then round-robin in chunks.
    let mut worker_index = pending_submission.select_worker(task.affinity()) as u32;
    let mut worker_slice_count = 0;

    let mut issued = 0u32;
    'issue: for slice_z in 0..slice_count_z {
        for slice_y in 0..slice_count_y {
            for slice_x in 0..slice_count_x {
                let workgroup_base = [
                    slice_x * tiles_per_slice[0],
                    slice_y * tiles_per_slice[1],
                    slice_z * tiles_per_slice[2],
                ];
                // Inclusive upper corner, clamped to the grid bounds.
                let workgroup_range = [
                    workgroup_count[0].min(workgroup_base[0] + tiles_per_slice[0]) - 1,
                    workgroup_count[1].min(workgroup_base[1] + tiles_per_slice[1]) - 1,
                    workgroup_count[2].min(workgroup_base[2] + tiles_per_slice[2]) - 1,
                ];

                let slot = match pool.acquire() {
                    Ok(slot) => slot,
                    Err(status) => {
                        // Out of transient tasks. The slices already issued
                        // still run; the dispatch retires with the failure
                        // rather than silently dropping workgroups.
                        dispatch.status.try_set(status);
                        break 'issue;
                    }
                };
                let slice_task =
                    Task::dispatch_slice(task, workgroup_base, workgroup_range, workgroup_count);
                slice_task.adopt_pool_slot(slot);

                pending_submission
                    .enqueue_to((worker_index % worker_count) as usize, slice_task);
                issued += 1;

                worker_slice_count += 1;
                if worker_slice_count >= slices_per_worker {
                    worker_index += 1;
                    worker_slice_count = 0;
                }
            }
        }
    }

    // With nothing issued there is no completion edge left to retire the
    // dispatch; do it inline (this also publishes a pool-exhaustion status).
    if issued == 0 {
        retire_dispatch(task, pending_submission);
    }
}

/// Iterates the slice's inclusive 3-D range in Z-major order, invoking the
/// dispatch closure once per tile.
pub(crate) fn execute_slice(
    task: &TaskRef,
    local_memory: &mut [u8],
    pending_submission: &mut Submission,
) {
    let TaskPayload::Slice(slice) = task.payload() else {
        unreachable!("execute_slice on a non-slice task");
    };
    let TaskPayload::Dispatch(dispatch) = slice.dispatch.payload() else {
        unreachable!("slice parent is not a dispatch");
    };

    // Map only the requested span so one dispatch's usage cannot leak into
    // another's.
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

    let mut slice_statistics = DispatchStatistics::default();
    let mut result = Ok(());

    let [base_x, base_y, base_z] = slice.workgroup_base;
    let [range_x, range_y, range_z] = slice.workgroup_range;
    'tiles: for z in base_z..=range_z {
        for y in base_y..=range_y {
            for x in base_x..=range_x {
                #[cfg(feature = "tile-tracing")]
                tracing::trace!(x, y, z, "slice tile");

                slice_statistics.tiles_executed += 1;
                let mut tile_context = TileContext {
                    workgroup_xyz: [x, y, z],
                    workgroup_size: dispatch.workgroup_size,
                    workgroup_count: slice.workgroup_count,
                    statistics: &mut slice_statistics,
                    local_memory: &mut scratch[..],
                };
                if let Err(status) = (dispatch.closure)(&mut tile_context, pending_submission) {
                    // Bail early; other slices of the dispatch may keep
                    // running, the parent aggregates.
                    result = Err(status);
                    break 'tiles;
                }
            }
        }
    }

    // Push aggregate statistics up to the dispatch, then the failure (the
    // slice itself retires OK; the parent carries the true status).
    dispatch.statistics.merge(&slice_statistics);
    if let Err(status) = result {
        dispatch.status.try_set(status);
    }
    lifecycle::retire(task, pending_submission, Ok(()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case([8, 4, 2], [8, 4, 2], [1, 1, 1])]
    #[case([16, 4, 2], [8, 4, 2], [2, 1, 1])]
    #[case([9, 5, 3], [8, 4, 2], [2, 2, 2])]
    #[case([1, 1, 1], [8, 4, 2], [1, 1, 1])]
    #[case([2, 3, 1], [1, 1, 1], [2, 3, 1])]
    fn slice_counts_cover_the_grid(
        #[case] workgroup_count: [u32; 3],
        #[case] tiles_per_slice: [u32; 3],
        #[case] expected: [u32; 3],
    ) {
        assert_eq!(slice_counts(workgroup_count, tiles_per_slice), expected);
    }

    #[test]
    fn slice_ranges_are_disjoint_and_complete() {
        // Deliberately non-multiple grid: 9x5x3 with 8x4x2 blocks.
        let workgroup_count = [9u32, 5, 3];
        let tiles_per_slice = [8u32, 4, 2];
        let [sx, sy, sz] = slice_counts(workgroup_count, tiles_per_slice);

        let mut covered =
            vec![0u32; (workgroup_count[0] * workgroup_count[1] * workgroup_count[2]) as usize];
        for slice_z in 0..sz {
            for slice_y in 0..sy {
                for slice_x in 0..sx {
                    let base = [
                        slice_x * tiles_per_slice[0],
                        slice_y * tiles_per_slice[1],
                        slice_z * tiles_per_slice[2],
                    ];
                    let range = [
                        workgroup_count[0].min(base[0] + tiles_per_slice[0]) - 1,
                        workgroup_count[1].min(base[1] + tiles_per_slice[1]) - 1,
                        workgroup_count[2].min(base[2] + tiles_per_slice[2]) - 1,
                    ];
                    for z in base[2]..=range[2] {
                        for y in base[1]..=range[1] {
                            for x in base[0]..=range[0] {
                                let index = (z * workgroup_count[1] + y) * workgroup_count[0] + x;
                                covered[index as usize] += 1;
                            }
                        }
                    }
                }
            }
        }
        assert!(covered.iter().all(|&count| count == 1));
    }
}
