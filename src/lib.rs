pub mod dispatch;

pub mod runtime;
pub use runtime::{Builder, Executor};

pub mod scope;
pub use scope::Scope;

pub mod status;
pub use status::{StatusCode, StatusError, TaskResult};

pub mod submission;
pub use submission::Submission;

pub mod task;
pub use task::{ImmediateWaitHandle, Task, TaskKind, TaskRef, WaitHandle, WorkerMask};

pub mod tuning;

pub use dispatch::{
    DispatchDesc, DispatchMode, DispatchStatistics, TileContext, WorkgroupCountBuffer,
    WorkgroupCountSource,
};
pub use task::pool::TaskPool;

#[cfg(test)]
pub mod test_utils;
