//! Sound incremental task engine with dynamic dependencies.
//!
//! Work is expressed as [`Task`] values. A task body runs against an
//! [`ExecContext`] and discovers its dependencies while it runs: other tasks
//! through [`ExecContext::require`], files and directories through
//! [`ExecContext::require_resource`], and files it writes through
//! [`ExecContext::provide`]. Every observation is recorded together with a
//! stamp, and the next session re-runs a task only when one of those stamps
//! changed.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use tsumiki::{EngineError, ExecContext, Pie, ResourceStamper, Task};
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
//! struct Length(String);
//!
//! impl Task for Length {
//!     type Output = Option<usize>;
//!
//!     fn id(&self) -> &'static str {
//!         "length"
//!     }
//!
//!     fn execute(&self, ctx: &mut ExecContext<Self>) -> Result<Self::Output, EngineError> {
//!         let file = ctx.require_resource(&self.0, ResourceStamper::Hash)?;
//!         Ok(file.read_to_string().ok().map(|text| text.len()))
//!     }
//! }
//!
//! let mut pie = Pie::<Length>::config().store(".tsumiki").finish()?;
//! let length = pie.require(&Length("README.md".into()))?;
//! # Ok::<(), EngineError>(())
//! ```

#![forbid(unsafe_code)]

mod core;
mod engine;
mod error;
mod io;
mod stamp;
pub mod store;
#[cfg(feature = "live")]
mod watch;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::{ThreadPool, ThreadPoolBuilder};

pub use crate::core::{Hash32, TaskKey};
pub use crate::engine::{
    CancelToken, DependencyCheckError, ExecContext, Reason, Report, Session, Task, TaskExecution,
};
pub use crate::error::*;
pub use crate::stamp::{OutputStamp, OutputStamper, Resource, ResourceStamp, ResourceStamper};
pub use crate::store::{Dependency, Store, Target, TaskData};

use crate::engine::StoreAccess;

/// The engine: a durable store of task results and the worker pool that
/// produces them.
///
/// Only one writing session can exist at a time, which the borrow checker
/// enforces through [`Pie::new_session`]. Read-only sessions run over a
/// [`Snapshot`] and may coexist with each other and with the writer.
pub struct Pie<T: Task> {
    store: Store<T::Output>,
    pool: Arc<ThreadPool>,
    progress: bool,
}

impl<T: Task> Pie<T> {
    pub fn config() -> Config<T> {
        Config::default()
    }

    /// Opens the exclusive writing session.
    pub fn new_session(&mut self) -> Session<'_, T> {
        Session::new(
            StoreAccess::Writer(&mut self.store),
            self.pool.clone(),
            self.progress,
        )
    }

    /// Runs `f` in a fresh session and commits it if `f` succeeds.
    pub fn run_in_session<R>(
        &mut self,
        f: impl FnOnce(&Session<'_, T>) -> Result<R, EngineError>,
    ) -> Result<(R, Report), EngineError> {
        let session = self.new_session();

        match f(&session) {
            Ok(value) => Ok((value, session.commit()?)),
            Err(err) => {
                session.discard();
                Err(err)
            }
        }
    }

    /// Requires a single task in its own session.
    pub fn require(&mut self, task: &T) -> Result<T::Output, EngineError> {
        self.run_in_session(|session| session.require(task))
            .map(|(output, _)| output)
    }

    /// Freezes the current store contents for read-only sessions.
    pub fn snapshot(&self) -> Snapshot<T> {
        Snapshot {
            store: Arc::new(self.store.clone()),
            pool: self.pool.clone(),
            progress: self.progress,
        }
    }

    pub fn store(&self) -> &Store<T::Output> {
        &self.store
    }

    /// Removes every stored result not reachable from `roots`.
    pub fn compact(&mut self, roots: &[T]) -> Result<usize, EngineError> {
        let roots = roots.iter().map(TaskKey::of).collect::<Result<Vec<_>, _>>()?;
        Ok(self.store.compact(&roots)?)
    }
}

/// Frozen copy of the store.
pub struct Snapshot<T: Task> {
    store: Arc<Store<T::Output>>,
    pool: Arc<ThreadPool>,
    progress: bool,
}

impl<T: Task> Snapshot<T> {
    /// Opens a session whose results are never written back.
    pub fn session(&self) -> Session<'static, T> {
        Session::new(
            StoreAccess::Snapshot(self.store.clone()),
            self.pool.clone(),
            self.progress,
        )
    }

    pub fn store(&self) -> &Store<T::Output> {
        &self.store
    }
}

impl<T: Task> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pool: self.pool.clone(),
            progress: self.progress,
        }
    }
}

/// Builder for [`Pie`].
pub struct Config<T: Task> {
    dir: Option<Utf8PathBuf>,
    threads: usize,
    progress: bool,
    _task: PhantomData<fn() -> T>,
}

impl<T: Task> Default for Config<T> {
    fn default() -> Self {
        Self {
            dir: None,
            threads: 0,
            progress: false,
            _task: PhantomData,
        }
    }
}

impl<T: Task> Config<T> {
    /// Persist results as records under `dir`.
    pub fn store(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Keep results in memory only. This is the default.
    pub fn in_memory(mut self) -> Self {
        self.dir = None;
        self
    }

    /// Size of the worker pool, `0` picks one thread per core.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Show progress bars for [`Session::require_all`].
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn finish(self) -> Result<Pie<T>, EngineError> {
        let s = Instant::now();

        let store = match &self.dir {
            Some(dir) => Store::open(dir)?,
            None => Store::in_memory(),
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("tsumiki-{i}"))
            .build()
            .map_err(|e| EngineError::Pool(Arc::new(e)))?;

        tracing::debug!(
            "engine ready with {} workers {}",
            pool.current_num_threads(),
            crate::io::as_overhead(s)
        );

        Ok(Pie {
            store,
            pool: Arc::new(pool),
            progress: self.progress,
        })
    }
}

/// Installs a global `tracing` subscriber that prints events above the
/// `RUST_LOG` level (default `info`) and draws span progress bars.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
