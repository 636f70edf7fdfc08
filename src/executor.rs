#[cfg(feature = "tokio")]
mod tokio;

use std::sync::Arc;

use crate::QueryError;

#[cfg(feature = "tokio")]
pub use self::tokio::TokioExecutor;

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The substrate that actually runs submitted work.
///
/// Execution is fire-and-forget: completion tracking, cancellation and result
/// collection are handled by the session, so any thread pool that can run a
/// boxed closure can back a session. Closures of type `Fn(Job)` are executors
/// too, which is handy for running work inline or for test doubles.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

/// Runs jobs on a rayon thread pool.
///
/// Producers usually block on I/O, so a dedicated pool sized for the expected
/// fan-out is preferable to the global one, which is shared with CPU-bound
/// parallel iterators.
#[derive(Clone, Default)]
pub struct RayonExecutor {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl RayonExecutor {
    /// Uses rayon's global thread pool.
    pub fn global() -> Self {
        Self { pool: None }
    }

    /// Builds a dedicated pool with `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, QueryError> {
        if threads == 0 {
            return Err(QueryError::InvalidConfiguration(
                "executor needs at least one thread".into(),
            ));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("matome-worker-{i}"))
            .build()
            .map_err(|e| QueryError::InvalidConfiguration(e.to_string()))?;

        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Number of worker threads available to this executor.
    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

impl Executor for RayonExecutor {
    fn execute(&self, job: Job) {
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

impl std::fmt::Debug for RayonExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonExecutor")
            .field("dedicated", &self.pool.is_some())
            .field("threads", &self.threads())
            .finish()
    }
}
