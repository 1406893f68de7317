use parking_lot::Mutex;

/// Lightweight status code handed to cleanup callbacks and exposed by scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    /// The task was discarded, or its scope failed before it executed.
    Aborted,
    ResourceExhausted,
    InvalidArgument,
    /// An opaque user status returned by a closure.
    Unknown,
}

/// A centralized error type for all scheduler operations.
#[derive(thiserror::Error, Debug)]
pub enum StatusError {
    /// An upstream failure tore this task down before it could run.
    #[error("task aborted")]
    Aborted,

    /// A pool is at capacity or a worker's local memory is too small.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The caller wired the graph incorrectly.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Whatever a task closure returned, carried opaquely.
    #[error(transparent)]
    User(#[from] anyhow::Error),
}

impl StatusError {
    pub fn code(&self) -> StatusCode {
        match self {
            StatusError::Aborted => StatusCode::Aborted,
            StatusError::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            StatusError::InvalidArgument(_) => StatusCode::InvalidArgument,
            StatusError::User(_) => StatusCode::Unknown,
        }
    }
}

pub type TaskResult = Result<(), StatusError>;

/// First-writer-wins failure slot.
///
/// Statuses are move-only carriers: `try_set` consumes losing statuses with a
/// no-op, and `take` moves the winner out for whoever retires the holder.
/// Failures are rare, so an uncontended mutex is fine here.
#[derive(Debug, Default)]
pub(crate) struct StatusSlot(Mutex<Option<StatusError>>);

impl StatusSlot {
    pub(crate) fn try_set(&self, status: StatusError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(status);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    pub(crate) fn code(&self) -> StatusCode {
        self.0.lock().as_ref().map_or(StatusCode::Ok, StatusError::code)
    }

    pub(crate) fn take(&self) -> TaskResult {
        match self.0.lock().take() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use static_assertions::assert_impl_all;

    assert_impl_all!(StatusError: Send, Sync);
    assert_impl_all!(StatusSlot: Send, Sync);

    #[test]
    fn first_failure_wins() {
        let slot = StatusSlot::default();
        assert!(!slot.is_set());
        assert_eq!(slot.code(), StatusCode::Ok);

        slot.try_set(StatusError::ResourceExhausted("pool".into()));
        slot.try_set(StatusError::User(anyhow!("late loser")));

        assert_eq!(slot.code(), StatusCode::ResourceExhausted);
        assert!(matches!(slot.take(), Err(StatusError::ResourceExhausted(_))));

        // Taking the status resets the slot.
        assert!(slot.take().is_ok());
        assert!(!slot.is_set());
    }

    #[test]
    fn user_status_is_opaque() {
        let slot = StatusSlot::default();
        slot.try_set(StatusError::User(anyhow!("kernel oops")));
        assert_eq!(slot.code(), StatusCode::Unknown);

        let err = slot.take().unwrap_err();
        assert_eq!(err.to_string(), "kernel oops");
    }
}
