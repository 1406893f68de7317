use crate::task::{lifecycle, TaskRef};
use std::collections::VecDeque;

/// Worklist of tasks, used as ready list, staging partition, and discard
/// worklist. Owning the deque upholds the rule that a task sits on at most
/// one list at a time; lists are never shared across threads.
#[derive(Debug, Default)]
pub(crate) struct TaskList {
    tasks: VecDeque<TaskRef>,
}

impl TaskList {
    pub(crate) fn new() -> TaskList {
        TaskList::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn push_front(&mut self, task: TaskRef) {
        self.tasks.push_front(task);
    }

    pub(crate) fn push_back(&mut self, task: TaskRef) {
        self.tasks.push_back(task);
    }

    pub(crate) fn pop_front(&mut self) -> Option<TaskRef> {
        self.tasks.pop_front()
    }

    /// Moves every task of `other` to the back of this list, preserving order.
    pub(crate) fn concat(&mut self, other: &mut TaskList) {
        self.tasks.append(&mut other.tasks);
    }

    /// Tears down every task on the list without executing it: cleanup runs
    /// as aborted, pool slots are released, and downstream tasks freed by the
    /// severed edges join the walk. Draining front-first keeps the walk
    /// depth-first, matching the LIFO discard order of the retire engine.
    pub(crate) fn discard_all(&mut self) {
        while let Some(task) = self.pop_front() {
            lifecycle::discard(&task, self);
        }
    }
}
