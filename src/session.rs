use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::panic::Location;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::Dispatch;

use crate::cancel::{CancelToken, Interrupter, interrupt_channel};
use crate::error::{QueryError, TaskResult};
use crate::executor::Executor;
use crate::sink::{EntriesSink, GroupBy, Handle, KeyBy, ListSink, SetSink, Single, Sink};
use crate::task::{Batch, TaskStatus};
use crate::trace::{self, Tracer};

/// One batch of concurrent lookups and its single join point.
///
/// Every `query_*` call schedules its producer on the executor right away and
/// returns an empty [`Handle`]. [`join_all`](Session::join_all) then waits for
/// the whole batch with one deadline; once it returns `Ok`, every handle holds
/// its merged value.
///
/// ```rust
/// use std::time::Duration;
/// use matome::{RayonExecutor, Session};
///
/// # fn main() -> Result<(), matome::QueryError> {
/// let mut session = Session::new(RayonExecutor::with_threads(4)?);
///
/// let users = session.query_list(|_| Ok(vec!["ana", "bo"]));
/// let count = session.query_value(|_| Ok(2usize));
///
/// session.join_all(Duration::from_secs(5))?;
///
/// assert_eq!(users.get(), Some(&vec!["ana", "bo"]));
/// assert_eq!(count.into_inner(), Some(2));
/// # Ok(())
/// # }
/// ```
///
/// Registration is meant to happen from the thread that owns the session;
/// only the producers run elsewhere. A session can be reused after a join,
/// each join closes the batch registered before it.
pub struct Session {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) tracer: Tracer,
    pub(crate) batch: Batch,
    pub(crate) interrupts: Receiver<()>,
    interrupter: Interrupter,
    next_label: Option<String>,
}

impl Session {
    /// Creates a session without tracing.
    #[track_caller]
    pub fn new(executor: impl Executor + 'static) -> Self {
        Self::assemble(Arc::new(executor), false, None, None, Location::caller())
    }

    /// Creates a session that records call-site labels and per-task timings.
    #[track_caller]
    pub fn traced(executor: impl Executor + 'static) -> Self {
        Self::assemble(Arc::new(executor), true, None, None, Location::caller())
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    fn assemble(
        executor: Arc<dyn Executor>,
        trace: bool,
        source: Option<String>,
        dispatch: Option<Dispatch>,
        location: &Location<'_>,
    ) -> Self {
        let source = source.unwrap_or_else(|| trace::call_site(location));
        let dispatch = dispatch.unwrap_or_else(trace::current_dispatch);
        let tracer = Tracer::new(trace, trace::session_id(&source), dispatch);
        let (interrupter, interrupts) = interrupt_channel();

        Self {
            executor,
            tracer,
            batch: Batch::default(),
            interrupts,
            interrupter,
            next_label: None,
        }
    }

    /// Identifier attached to every log line of this session.
    pub fn id(&self) -> &str {
        self.tracer.session()
    }

    pub fn is_tracing(&self) -> bool {
        self.tracer.is_enabled()
    }

    /// Number of tasks registered since the last join.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Current status of every task registered since the last join, in
    /// registration order.
    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.batch
            .tasks
            .iter()
            .map(|task| task.cell.status())
            .collect()
    }

    /// Handle for aborting a join from another thread.
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Names the next registered task. Without it, traced sessions label a
    /// task with the location of the `query_*` call.
    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.next_label = Some(label.into());
        self
    }

    /// Runs `producer` for its side effects only.
    #[track_caller]
    pub fn execute<P>(&mut self, producer: P)
    where
        P: FnOnce(&CancelToken) -> TaskResult<()> + Send + 'static,
    {
        let location = Location::caller();
        let _ = self.submit(producer, Single, location);
    }

    /// Stores the produced value.
    #[track_caller]
    pub fn query_value<V, P>(&mut self, producer: P) -> Handle<V>
    where
        V: Send + Sync + 'static,
        P: FnOnce(&CancelToken) -> TaskResult<V> + Send + 'static,
    {
        let location = Location::caller();
        self.submit(producer, Single, location)
    }

    /// Collects the produced elements into a list, in producer order.
    #[track_caller]
    pub fn query_list<V, I, P>(&mut self, producer: P) -> Handle<Vec<V>>
    where
        V: Send + Sync + 'static,
        I: IntoIterator<Item = V>,
        P: FnOnce(&CancelToken) -> TaskResult<I> + Send + 'static,
    {
        let location = Location::caller();
        self.submit(producer, ListSink::<V>::new(), location)
    }

    /// Collects the produced elements into a set.
    #[track_caller]
    pub fn query_set<V, I, P>(&mut self, producer: P) -> Handle<HashSet<V>>
    where
        V: Eq + Hash + Send + Sync + 'static,
        I: IntoIterator<Item = V>,
        P: FnOnce(&CancelToken) -> TaskResult<I> + Send + 'static,
    {
        let location = Location::caller();
        self.submit(producer, SetSink::<V>::new(), location)
    }

    /// Indexes the produced elements by `key`. Within the task's output a
    /// later element replaces an earlier one with the same key.
    #[track_caller]
    pub fn query_map<K, V, I, P, F>(&mut self, producer: P, key: F) -> Handle<HashMap<K, V>>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
        I: IntoIterator<Item = V>,
        P: FnOnce(&CancelToken) -> TaskResult<I> + Send + 'static,
        F: Fn(&V) -> K + Send + 'static,
    {
        let location = Location::caller();
        self.submit(producer, KeyBy(key), location)
    }

    /// Groups the produced elements by `key`, keeping producer order inside
    /// each group.
    #[track_caller]
    pub fn query_group<K, V, I, P, F>(
        &mut self,
        producer: P,
        key: F,
    ) -> Handle<HashMap<K, Vec<V>>>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
        I: IntoIterator<Item = V>,
        P: FnOnce(&CancelToken) -> TaskResult<I> + Send + 'static,
        F: Fn(&V) -> K + Send + 'static,
    {
        let location = Location::caller();
        self.submit(producer, GroupBy(key), location)
    }

    /// Copies the entries of a ready map (or any iterator of pairs).
    #[track_caller]
    pub fn query_entries<K, V, I, P>(&mut self, producer: P) -> Handle<HashMap<K, V>>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
        I: IntoIterator<Item = (K, V)>,
        P: FnOnce(&CancelToken) -> TaskResult<I> + Send + 'static,
    {
        let location = Location::caller();
        self.submit(producer, EntriesSink::<K, V>::new(), location)
    }

    fn submit<I, S, P>(
        &mut self,
        producer: P,
        sink: S,
        location: &Location<'_>,
    ) -> Handle<S::Output>
    where
        S: Sink<I>,
        P: FnOnce(&CancelToken) -> TaskResult<I> + Send + 'static,
    {
        let label = self.next_label.take();
        self.batch.submit(
            self.executor.as_ref(),
            &self.tracer,
            label,
            location,
            producer,
            sink,
        )
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("tracing", &self.is_tracing())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Configures a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    executor: Option<Arc<dyn Executor>>,
    trace: bool,
    source: Option<String>,
    dispatch: Option<Dispatch>,
}

impl SessionBuilder {
    pub fn executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Uses an executor shared with other sessions.
    pub fn shared_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Enables call-site labels and per-task timing logs.
    pub fn trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    /// Replaces the call-site part of the session identifier.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Routes the session's log events to `dispatch` instead of the
    /// dispatcher current at construction.
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    #[track_caller]
    pub fn finish(self) -> Result<Session, QueryError> {
        let location = Location::caller();

        let Some(executor) = self.executor else {
            return Err(QueryError::InvalidConfiguration(
                "session requires an executor".into(),
            ));
        };

        if self.source.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(QueryError::InvalidConfiguration(
                "session source must not be empty".into(),
            ));
        }

        Ok(Session::assemble(
            executor,
            self.trace,
            self.source,
            self.dispatch,
            location,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::executor::Job;

    fn parked() -> (impl Executor + use<>, Arc<Mutex<Vec<Job>>>) {
        let jobs = Arc::new(Mutex::new(Vec::new()));
        let sink = jobs.clone();
        (move |job: Job| sink.lock().unwrap().push(job), jobs)
    }

    #[test]
    fn test_builder_requires_executor() {
        let err = Session::builder().trace(true).finish().unwrap_err();
        assert!(matches!(err, QueryError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_builder_rejects_blank_source() {
        let (executor, _) = parked();
        let err = Session::builder()
            .executor(executor)
            .source("  ")
            .finish()
            .unwrap_err();

        assert!(matches!(err, QueryError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_id_defaults_to_constructor_site() {
        let (executor, _) = parked();
        let line = line!() + 1;
        let session = Session::new(executor);

        assert!(session.id().starts_with(&format!("session.rs:{line}@")));
        assert!(!session.is_tracing());
    }

    #[test]
    fn test_id_uses_configured_source() {
        let (executor, _) = parked();
        let session = Session::builder()
            .executor(executor)
            .source("Dashboard#load")
            .finish()
            .unwrap();

        assert!(session.id().starts_with("Dashboard#load@"));
    }

    #[test]
    fn test_registration_returns_empty_handles() {
        let (executor, jobs) = parked();
        let mut session = Session::new(executor);

        let value = session.query_value(|_| Ok(1));
        let list = session.query_list(|_| Ok(vec![1, 2]));
        session.execute(|_| Ok(()));

        assert!(!value.is_ready());
        assert!(!list.is_ready());
        assert_eq!(session.pending(), 3);
        assert_eq!(jobs.lock().unwrap().len(), 3);
        assert_eq!(session.statuses(), vec![TaskStatus::Submitted; 3]);
    }

    #[test]
    fn test_labels_apply_to_next_task_only() {
        let (executor, _) = parked();
        let mut session = Session::traced(executor);

        session.label("users").query_value(|_| Ok(1));
        let line = line!() + 1;
        session.query_value(|_| Ok(2));

        let labels: Vec<_> = session
            .batch
            .tasks
            .iter()
            .map(|task| task.label.as_deref().unwrap().to_string())
            .collect();

        assert_eq!(labels, vec!["users".to_string(), format!("session.rs:{line}")]);
    }

    #[test]
    fn test_untraced_session_keeps_no_labels() {
        let (executor, _) = parked();
        let mut session = Session::new(executor);

        session.label("users").query_value(|_| Ok(1));

        assert!(session.batch.tasks[0].label.is_none());
    }
}
