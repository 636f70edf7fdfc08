use ::tokio::runtime::Handle;

use super::{Executor, Job};
use crate::QueryError;

/// Runs jobs on the blocking pool of a Tokio runtime.
///
/// Producers are plain blocking closures, so they go through
/// [`spawn_blocking`](Handle::spawn_blocking) rather than onto the async
/// workers. The join itself still blocks the calling thread and must not be
/// called from inside an async task.
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime the caller is currently running in.
    pub fn current() -> Result<Self, QueryError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| QueryError::InvalidConfiguration(e.to_string()))
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        // The session tracks completion itself, the join handle is not needed.
        drop(self.handle.spawn_blocking(job));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn test_current_outside_runtime() {
        let err = TokioExecutor::current().unwrap_err();
        assert!(matches!(err, QueryError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_runs_on_blocking_pool() {
        let runtime = ::tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let executor = TokioExecutor::new(runtime.handle().clone());

        let (tx, rx) = channel();
        executor.execute(Box::new(move || tx.send("done").unwrap()));

        assert_eq!(rx.recv().unwrap(), "done");
    }
}
