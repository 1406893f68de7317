//! Scheduling tuning knobs. The builder exposes overrides for anything a
//! deployment may want to change; the values here are the defaults.

/// How many tiles a slice covers along X. Slices are the finest-granularity
/// unit of static scheduling; X is the fastest-moving dimension and gets the
/// largest block.
pub const TILES_PER_SLICE_X: u32 = 8;

/// How many tiles a slice covers along Y.
pub const TILES_PER_SLICE_Y: u32 = 4;

/// How many tiles a slice covers along Z.
pub const TILES_PER_SLICE_Z: u32 = 2;

/// Upper bound on how many tiles a shard reserves from the grid cursor per
/// fetch-add. A higher number reduces overhead and improves locality while a
/// lower number reduces worst-case latency (coarser work stealing).
pub const MAX_TILES_PER_SHARD_RESERVATION: u32 = 8;

/// Default scratch memory each worker owns for per-tile use.
pub const DEFAULT_WORKER_LOCAL_MEMORY_SIZE: usize = 64 * 1024;

/// Worker affinity is a 64-bit mask, so 64 workers is the ceiling.
pub const MAX_WORKER_COUNT: usize = 64;

/// Default capacity of the transient pool that slices and shards are
/// allocated from during dispatch issue.
pub const DEFAULT_TRANSIENT_TASK_CAPACITY: usize = 1024;
