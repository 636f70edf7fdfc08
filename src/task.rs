//! Pending tasks and the batch that owns them until the next join.
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::cancel::CancelToken;
use crate::error::{TaskError, TaskResult};
use crate::executor::Executor;
use crate::sink::{Handle, Sink, Slot};
use crate::trace::Tracer;

/// Lifecycle of a single task.
///
/// `Submitted` and `Running` are the only states a join will cancel. The
/// other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// State shared between a task's worker and its batch.
///
/// Every transition happens under one lock, so whichever of "commit" and
/// "cancel" gets there first decides the terminal state.
pub(crate) struct TaskCell {
    status: Mutex<TaskStatus>,
    token: CancelToken,
}

impl TaskCell {
    fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Submitted),
            token: CancelToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> TaskStatus {
        *self.lock()
    }

    /// Moves a submitted task to running. Returns `false` if it was cancelled
    /// before a worker picked it up.
    fn start(&self) -> bool {
        let mut status = self.lock();
        match *status {
            TaskStatus::Submitted => {
                *status = TaskStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Records the producer's outcome and, on success, fills the handle.
    ///
    /// Returns `None` when the task was cancelled first; the value is then
    /// dropped without touching the handle.
    fn commit<T>(
        &self,
        outcome: Result<T, TaskError>,
        slot: Slot<T>,
    ) -> Option<Result<(), TaskError>> {
        let mut status = self.lock();
        if status.is_terminal() {
            return None;
        }

        match outcome {
            Ok(value) => {
                slot.fill(value);
                *status = TaskStatus::Succeeded;
                Some(Ok(()))
            }
            Err(err) => {
                *status = TaskStatus::Failed;
                Some(Err(err))
            }
        }
    }

    /// Cancels the task unless it already reached a terminal state.
    pub(crate) fn cancel(&self) -> bool {
        let mut status = self.lock();
        if status.is_terminal() {
            return false;
        }

        *status = TaskStatus::Cancelled;
        drop(status);
        self.token.cancel();
        true
    }
}

/// A task registered with a session and not yet joined.
pub(crate) struct PendingTask {
    pub(crate) label: Option<Arc<str>>,
    pub(crate) cell: Arc<TaskCell>,
}

/// Message sent by a worker once its task reached a terminal state on its
/// own. Cancelled tasks send nothing.
pub(crate) struct Finished {
    pub(crate) index: usize,
    pub(crate) outcome: Result<(), TaskError>,
    pub(crate) start: Instant,
    pub(crate) duration: Duration,
}

/// All tasks registered since the last join, in registration order.
///
/// Each batch has its own completion channel, so stragglers of an earlier
/// batch can never be mistaken for members of the next one. Dropping a batch
/// cancels whatever is still outstanding.
pub(crate) struct Batch {
    pub(crate) tasks: Vec<PendingTask>,
    tx: Sender<Finished>,
    pub(crate) rx: Receiver<Finished>,
}

impl Default for Batch {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tasks: Vec::new(),
            tx,
            rx,
        }
    }
}

impl Batch {
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Submits `producer` to `executor` and returns the handle its result is
    /// merged into.
    pub(crate) fn submit<I, S, P>(
        &mut self,
        executor: &dyn Executor,
        tracer: &Tracer,
        label: Option<String>,
        location: &Location<'_>,
        producer: P,
        sink: S,
    ) -> Handle<S::Output>
    where
        S: Sink<I>,
        P: FnOnce(&CancelToken) -> TaskResult<I> + Send + 'static,
    {
        let index = self.tasks.len();
        let label = tracer.label(label, location);
        let cell = Arc::new(TaskCell::new());
        let (handle, slot) = Handle::new();

        let job = {
            let cell = Arc::clone(&cell);
            let tracer = tracer.clone();
            let label = label.clone();
            let tx = self.tx.clone();
            let submitted = Instant::now();

            move || {
                tracer.in_scope(|| {
                    if !cell.start() {
                        return;
                    }

                    let span = tracer.task_span(label.as_ref());
                    let _enter = span.enter();

                    let start = Instant::now();
                    let outcome =
                        run_guarded(|| producer(&cell.token).map(|input| sink.merge(input)));
                    let duration = start.elapsed();

                    tracer.record(
                        label.as_ref(),
                        start.saturating_duration_since(submitted),
                        duration,
                    );

                    if let Some(outcome) = cell.commit(outcome, slot) {
                        // The receiver is gone once its join has returned.
                        let _ = tx.send(Finished {
                            index,
                            outcome,
                            start,
                            duration,
                        });
                    }
                })
            }
        };

        self.tasks.push(PendingTask { label, cell });
        executor.execute(Box::new(job));

        handle
    }

    /// Cancels every task that has not reached a terminal state yet and
    /// returns the ones that were cancelled, in registration order.
    pub(crate) fn cancel_outstanding(&self) -> Vec<&PendingTask> {
        self.tasks.iter().filter(|task| task.cell.cancel()).collect()
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.cancel_outstanding();
    }
}

/// Runs a producer, turning a panic into an ordinary task error.
fn run_guarded<T>(f: impl FnOnce() -> TaskResult<T>) -> Result<T, TaskError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(TaskError::from),
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("task panicked: {s}")
            } else {
                String::from("task panicked with unknown payload")
            };

            Err(TaskError::new(anyhow::anyhow!(msg)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use tracing::Dispatch;

    use super::*;
    use crate::executor::Job;
    use crate::sink::Single;

    fn tracer() -> Tracer {
        Tracer::new(true, "test@0".into(), Dispatch::none())
    }

    /// Holds submitted jobs until the test runs them.
    #[derive(Clone, Default)]
    struct Deferred(Arc<Mutex<Vec<Job>>>);

    impl Deferred {
        fn executor(&self) -> impl Executor + use<> {
            let jobs = self.0.clone();
            move |job: Job| jobs.lock().unwrap().push(job)
        }

        fn run_all(&self) {
            let jobs: Vec<Job> = self.0.lock().unwrap().drain(..).collect();
            for job in jobs {
                job();
            }
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Submitted.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_success_fills_handle_and_reports() {
        let deferred = Deferred::default();
        let mut batch = Batch::default();

        let handle = batch.submit(
            &deferred.executor(),
            &tracer(),
            Some("answer".into()),
            Location::caller(),
            |_| Ok(42),
            Single,
        );

        assert_eq!(batch.tasks[0].cell.status(), TaskStatus::Submitted);
        assert_eq!(batch.tasks[0].label.as_deref(), Some("answer"));
        assert!(!handle.is_ready());

        deferred.run_all();

        assert_eq!(handle.get(), Some(&42));
        assert_eq!(batch.tasks[0].cell.status(), TaskStatus::Succeeded);

        let finished = batch.rx.try_recv().unwrap();
        assert_eq!(finished.index, 0);
        assert!(finished.outcome.is_ok());
    }

    #[test]
    fn test_failure_leaves_handle_empty() {
        let deferred = Deferred::default();
        let mut batch = Batch::default();

        let handle = batch.submit(
            &deferred.executor(),
            &tracer(),
            None,
            Location::caller(),
            |_| -> TaskResult<u32> { anyhow::bail!("no such table") },
            Single,
        );
        deferred.run_all();

        assert!(!handle.is_ready());
        assert_eq!(batch.tasks[0].cell.status(), TaskStatus::Failed);

        let finished = batch.rx.try_recv().unwrap();
        assert_eq!(finished.outcome.unwrap_err().to_string(), "no such table");
    }

    #[test]
    fn test_panic_becomes_task_error() {
        let outcome = run_guarded(|| -> TaskResult<i32> {
            let zero = "0".parse::<i32>()?;
            Ok(1 / zero)
        });

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("attempt to divide by zero"));
    }

    #[test]
    fn test_cancel_before_start_skips_producer() {
        let deferred = Deferred::default();
        let mut batch = Batch::default();
        let (tx, rx) = channel();

        let handle = batch.submit(
            &deferred.executor(),
            &tracer(),
            None,
            Location::caller(),
            move |_| {
                tx.send(()).unwrap();
                Ok(1)
            },
            Single,
        );

        let cancelled = batch.cancel_outstanding();
        assert_eq!(cancelled.len(), 1);

        deferred.run_all();

        assert!(rx.try_recv().is_err());
        assert!(!handle.is_ready());
        assert_eq!(batch.tasks[0].cell.status(), TaskStatus::Cancelled);
        assert!(batch.rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_wins_over_late_result() {
        let cell = TaskCell::new();
        let (handle, slot) = Handle::new();

        assert!(cell.start());
        assert!(cell.cancel());
        assert!(cell.token.is_cancelled());

        assert!(cell.commit(Ok(5), slot).is_none());
        assert!(!handle.is_ready());
        assert_eq!(cell.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_commit_before_cancel_keeps_value() {
        let cell = TaskCell::new();
        let (handle, slot) = Handle::new();

        assert!(cell.start());
        assert!(cell.commit(Ok(5), slot).is_some());
        assert!(!cell.cancel());

        assert_eq!(handle.into_inner(), Some(5));
        assert_eq!(cell.status(), TaskStatus::Succeeded);
    }

    #[test]
    fn test_dropping_batch_cancels_outstanding() {
        let deferred = Deferred::default();
        let mut batch = Batch::default();

        batch.submit(
            &deferred.executor(),
            &tracer(),
            None,
            Location::caller(),
            |_| Ok(()),
            Single,
        );
        let cell = Arc::clone(&batch.tasks[0].cell);

        drop(batch);

        assert_eq!(cell.status(), TaskStatus::Cancelled);
        deferred.run_all();
        assert_eq!(cell.status(), TaskStatus::Cancelled);
    }
}
