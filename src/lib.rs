#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cancel;
mod diagnostics;
mod error;
mod executor;
mod join;
#[cfg(feature = "logging")]
mod logging;
mod session;
mod sink;
mod task;
mod trace;

pub use crate::cancel::{CancelToken, Cancelled, Interrupter};
pub use crate::diagnostics::{Diagnostics, TaskExecution};
pub use crate::error::*;
pub use crate::executor::{Executor, Job, RayonExecutor};
#[cfg(feature = "tokio")]
pub use crate::executor::TokioExecutor;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::session::{Session, SessionBuilder};
pub use crate::sink::Handle;
pub use crate::task::TaskStatus;
