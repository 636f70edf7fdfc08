use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result returned by a single producer function.
pub type TaskResult<T> = anyhow::Result<T>;

/// Error raised inside a producer, shared between the worker that observed it
/// and the join that reports it.
#[derive(Debug, Error, Clone)]
#[error("{0:#}")]
pub struct TaskError(pub(crate) Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying userland error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to view the root error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError(Arc::new(e))
    }
}

/// Why a join gave up waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The deadline elapsed with tasks still outstanding.
    Timeout(Duration),
    /// The join was interrupted through an [`Interrupter`](crate::Interrupter).
    Interrupted,
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortCause::Timeout(limit) => write!(f, "timed out after {limit:?}"),
            AbortCause::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    #[error("Invalid session configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Query '{session}' {cause}, cancelled {cancelled} task(s){}", format_pending(.pending))]
    Aborted {
        session: Arc<str>,
        cause: AbortCause,
        cancelled: usize,
        /// Trace labels of the cancelled tasks in registration order. Empty
        /// unless the session was created with tracing enabled.
        pending: Vec<Arc<str>>,
    },

    #[error("Query '{session}' task{} failed:\n{source}", format_task(.task))]
    TaskFailed {
        session: Arc<str>,
        task: Option<Arc<str>>,
        #[source]
        source: TaskError,
    },
}

impl QueryError {
    /// Returns `true` for a timed out or interrupted join.
    pub fn is_aborted(&self) -> bool {
        matches!(self, QueryError::Aborted { .. })
    }

    /// Returns `true` when a producer raised an error.
    pub fn is_task_failed(&self) -> bool {
        matches!(self, QueryError::TaskFailed { .. })
    }
}

fn format_pending(pending: &[Arc<str>]) -> String {
    if pending.is_empty() {
        String::new()
    } else {
        let names: Vec<&str> = pending.iter().map(AsRef::as_ref).collect();
        format!(":\n\t{}", names.join("\n\t"))
    }
}

fn format_task(task: &Option<Arc<str>>) -> String {
    match task {
        Some(label) => format!(" '{label}'"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborted_lists_pending_labels() {
        let err = QueryError::Aborted {
            session: "orders.rs:10@1".into(),
            cause: AbortCause::Timeout(Duration::from_secs(1)),
            cancelled: 2,
            pending: vec!["orders.rs:12".into(), "orders.rs:13".into()],
        };

        let text = err.to_string();
        assert!(text.contains("timed out after 1s"));
        assert!(text.contains("cancelled 2 task(s)"));
        assert!(text.contains("\n\torders.rs:12\n\torders.rs:13"));
        assert!(err.is_aborted());
    }

    #[test]
    fn test_task_failed_keeps_context_chain() {
        let inner = anyhow::anyhow!("connection reset").context("loading users");
        let err = QueryError::TaskFailed {
            session: "s".into(),
            task: None,
            source: TaskError::from(inner),
        };

        assert_eq!(
            err.to_string(),
            "Query 's' task failed:\nloading users: connection reset"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
