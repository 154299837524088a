use std::fmt::Display;
use std::sync::Arc;
#[cfg(feature = "live")]
use std::sync::mpsc::RecvError;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::TaskKey;

/// Structural failure of the engine.
///
/// These errors are never stored as task output. A session that observed any
/// of them refuses to commit, leaving the store at its last committed state.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Cyclic dependency: {}", CyclePath(.path))]
    Cycle { path: Vec<TaskKey> },

    #[error("Resource '{path}' is provided by both {first} and {second}")]
    ResourceConflict {
        path: Utf8PathBuf,
        first: TaskKey,
        second: TaskKey,
    },

    #[error("Store:\n{0}")]
    Store(#[from] StoreError),

    #[error("Session was cancelled")]
    Cancelled,

    #[error("Couldn't encode or decode value: {0}")]
    Encode(String),

    #[error("Task {key} panicked: {message}")]
    Panicked { key: TaskKey, message: String },

    #[error("Couldn't build worker pool.\n{0}")]
    Pool(Arc<rayon::ThreadPoolBuildError>),
}

impl EngineError {
    pub fn is_cycle(&self) -> bool {
        matches!(self, EngineError::Cycle { .. })
    }
}

struct CyclePath<'a>(&'a [TaskKey]);

impl Display for CyclePath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("Couldn't access store at '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Store at '{path}' is already open in another engine")]
    Locked { path: Utf8PathBuf },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

/// Application level failure produced by a task body.
///
/// This is ordinary data: it is stored as part of the output, stamped like any
/// other output, and dependents decide whether to propagate it, substitute a
/// default or stop.
#[derive(Debug, Error, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
    pub causes: Vec<String>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            causes: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }
}

impl From<std::io::Error> for TaskFailure {
    fn from(err: std::io::Error) -> Self {
        TaskFailure::from(anyhow::Error::new(err))
    }
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Recv(#[from] RecvError),

    #[error("Couldn't read working directory.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Working directory is not valid UTF-8.\n{0}")]
    Path(#[from] camino::FromPathBufError),
}
