use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::select;

use crate::Session;
use crate::diagnostics::{Diagnostics, TaskExecution};
use crate::error::{AbortCause, QueryError, TaskError};
use crate::task::Batch;

/// How the wait loop ended, before cancellation and reporting.
enum Verdict {
    Done,
    Failed(usize, TaskError),
    Aborted(AbortCause),
}

impl Session {
    /// Waits until every task registered since the last join has finished, or
    /// until `timeout` elapses.
    ///
    /// * All tasks succeed: every handle of the batch is populated and the
    ///   execution timings are returned.
    /// * A task fails (returns an error or panics): the first failure
    ///   observed is returned as [`QueryError::TaskFailed`].
    /// * The deadline passes, or the join is interrupted through an
    ///   [`Interrupter`](crate::Interrupter): [`QueryError::Aborted`] is
    ///   returned, listing the unfinished tasks when tracing is enabled.
    ///
    /// In both failure cases every task that is still outstanding is
    /// cancelled. On every path the batch is closed, so the session starts
    /// empty afterwards.
    ///
    /// This blocks the calling thread; do not call it from a worker of the
    /// session's own executor.
    pub fn join_all(&mut self, timeout: Duration) -> Result<Diagnostics, QueryError> {
        // Taking the batch out up front closes it on every exit path. Its drop
        // cancels whatever is still running.
        let batch = std::mem::take(&mut self.batch);
        let tracer = self.tracer.clone();

        tracer.in_scope(|| {
            let mut executions = Vec::with_capacity(batch.len());
            let verdict = self.wait(&batch, timeout, &mut executions);
            let session = Arc::clone(tracer.session());

            match verdict {
                Verdict::Done => {
                    tracing::debug!(
                        session = %session,
                        tasks = executions.len(),
                        "all tasks finished"
                    );

                    executions.sort_by_key(|exec: &TaskExecution| exec.index);
                    Ok(Diagnostics {
                        session,
                        executions,
                    })
                }
                Verdict::Failed(index, source) => {
                    let task = batch.tasks[index].label.clone();
                    let cancelled = batch.cancel_outstanding().len();

                    tracing::error!(
                        session = %session,
                        task = task.as_deref().unwrap_or("-"),
                        cancelled,
                        error = %source,
                        "query exception"
                    );

                    Err(QueryError::TaskFailed {
                        session,
                        task,
                        source,
                    })
                }
                Verdict::Aborted(cause) => {
                    let cancelled = batch.cancel_outstanding();
                    let pending: Vec<Arc<str>> = cancelled
                        .iter()
                        .filter_map(|task| task.label.clone())
                        .collect();

                    if tracer.is_enabled() {
                        let names: Vec<&str> = pending.iter().map(AsRef::as_ref).collect();
                        tracing::error!(
                            session = %session,
                            "query {cause}, non done tasks:\n\t{}",
                            names.join("\n\t")
                        );
                    } else {
                        tracing::error!(session = %session, "query {cause}");
                    }

                    Err(QueryError::Aborted {
                        session,
                        cause,
                        cancelled: cancelled.len(),
                        pending,
                    })
                }
            }
        })
    }

    /// Same as [`join_all`](Session::join_all) with the timeout given in
    /// whole seconds.
    pub fn join_all_secs(&mut self, seconds: u64) -> Result<Diagnostics, QueryError> {
        self.join_all(Duration::from_secs(seconds))
    }

    fn wait(
        &self,
        batch: &Batch,
        timeout: Duration,
        executions: &mut Vec<TaskExecution>,
    ) -> Verdict {
        let deadline = Instant::now().checked_add(timeout);
        let mut outstanding = batch.len();

        while outstanding > 0 {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };

            select! {
                recv(batch.rx) -> msg => {
                    // The batch holds a sender itself, the channel cannot disconnect.
                    let Ok(finished) = msg else { continue };

                    executions.push(TaskExecution {
                        index: finished.index,
                        label: batch.tasks[finished.index].label.clone(),
                        start: finished.start,
                        duration: finished.duration,
                    });

                    match finished.outcome {
                        Ok(()) => outstanding -= 1,
                        Err(err) => return Verdict::Failed(finished.index, err),
                    }
                }
                recv(self.interrupts) -> _ => return Verdict::Aborted(AbortCause::Interrupted),
                default(remaining) => return Verdict::Aborted(AbortCause::Timeout(timeout)),
            }
        }

        Verdict::Done
    }
}
