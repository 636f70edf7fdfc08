//! Call-site labels, session identifiers and per-task timing logs.
//!
//! Nothing in here influences what ends up in a result handle. Disabling
//! tracing only removes the timing lines and the list of unfinished tasks
//! reported by a timed out join.
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{Dispatch, Span};

/// Renders a source location as `<file name>:<line>`.
pub(crate) fn call_site(location: &Location<'_>) -> String {
    let file = location.file();
    let name = file.rsplit(['/', '\\']).next().unwrap_or(file);
    format!("{name}:{}", location.line())
}

/// Identifier used to correlate every log line of one session.
pub(crate) fn session_id(source: &str) -> Arc<str> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis())
        .unwrap_or_default();

    format!("{source}@{millis}").into()
}

/// The dispatcher current on the calling thread.
pub(crate) fn current_dispatch() -> Dispatch {
    tracing::dispatcher::get_default(Dispatch::clone)
}

#[derive(Clone)]
pub(crate) struct Tracer {
    enabled: bool,
    session: Arc<str>,
    dispatch: Dispatch,
}

impl Tracer {
    pub(crate) fn new(enabled: bool, session: Arc<str>, dispatch: Dispatch) -> Self {
        Self {
            enabled,
            session,
            dispatch,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn session(&self) -> &Arc<str> {
        &self.session
    }

    /// Label recorded for a new task. Only traced sessions keep labels.
    pub(crate) fn label(
        &self,
        explicit: Option<String>,
        location: &Location<'_>,
    ) -> Option<Arc<str>> {
        if !self.enabled {
            return None;
        }

        Some(explicit.unwrap_or_else(|| call_site(location)).into())
    }

    /// Runs `f` with the session's dispatcher, whichever thread it is on.
    pub(crate) fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub(crate) fn task_span(&self, label: Option<&Arc<str>>) -> Span {
        match label {
            Some(label) => tracing::info_span!(
                "query_task",
                session = %self.session,
                task = %label
            ),
            None => Span::none(),
        }
    }

    /// Logs how long a traced task waited for a worker and how long it ran.
    pub(crate) fn record(&self, label: Option<&Arc<str>>, waited: Duration, elapsed: Duration) {
        let Some(label) = label else {
            return;
        };

        tracing::info!(
            session = %self.session,
            task = %label,
            waited_ms = waited.as_millis() as u64,
            elapsed_ms = elapsed.as_millis() as u64,
            "task run time {}ms",
            elapsed.as_millis()
        );
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.enabled)
            .field("session", &self.session)
            .finish()
    }
}

/// In-memory log sink for asserting on emitted events.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl Capture {
    pub(crate) fn dispatch(&self) -> Dispatch {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        Dispatch::new(subscriber)
    }

    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl std::io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
