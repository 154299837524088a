mod cancel;
mod context;
mod diagnostics;
mod gate;
mod session;

#[cfg(test)]
mod tests;

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::EngineError;

pub use crate::engine::cancel::CancelToken;
pub use crate::engine::context::ExecContext;
pub use crate::engine::diagnostics::{Reason, Report, TaskExecution};
pub use crate::engine::session::{DependencyCheckError, Session};

pub(crate) use crate::engine::session::StoreAccess;

/// A unit of incremental work.
///
/// A task value is its own input: two values that serialize to the same bytes
/// are the same task, and the engine keys every result by that encoding. The
/// usual shape is one enum per application with a variant per kind of work.
///
/// The body must be deterministic in everything it observes through the
/// [`ExecContext`]. Reading files or calling other tasks behind the context's
/// back makes results silently stale.
///
/// Failures the application cares about belong in `Output`, for example as a
/// `Result<_, TaskFailure>`; those are stored and reused like any other value.
/// Returning `Err` is reserved for structural problems and aborts the session.
pub trait Task: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Output: Clone + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable name of the task definition.
    fn id(&self) -> &'static str;

    fn execute(&self, ctx: &mut ExecContext<Self>) -> Result<Self::Output, EngineError>;
}
