//! The incremental scheduler.
//!
//! A session answers `require(task)` with an output that is consistent with
//! the current state of the world, executing as little as possible. There is
//! no separate invalidation pass: a stored result is checked top-down when it
//! is requested, by requiring each recorded task dependency in order and
//! comparing its output stamp, and by re-stamping each recorded resource. The
//! first mismatch sends the task to execution, which records a fresh
//! dependency list that replaces the old one wholesale.
//!
//! Every key is validated at most once per session. Concurrent requesters of
//! the same key meet at its execution gate (see [`gate`](super::gate)).
//!
//! Results are buffered in the session and only reach the store on
//! [`Session::commit`]. Structural errors poison the session so that commit
//! refuses to write anything.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressStyle;
use rayon::ThreadPool;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::TaskKey;
use crate::engine::cancel::CancelToken;
use crate::engine::context::ExecContext;
use crate::engine::diagnostics::{Reason, Report, TaskExecution};
use crate::engine::gate::{Entry, Gates, Outcome};
use crate::engine::Task;
use crate::error::EngineError;
use crate::store::{Dependency, Store, TaskData};

pub(crate) enum StoreAccess<'p, O> {
    /// Exclusive access; commit writes through.
    Writer(&'p mut Store<O>),
    /// Frozen copy; commit only reports.
    Snapshot(Arc<Store<O>>),
}

impl<O> StoreAccess<'_, O> {
    fn get(&self) -> &Store<O> {
        match self {
            StoreAccess::Writer(store) => store,
            StoreAccess::Snapshot(store) => store,
        }
    }
}

/// A resource that couldn't be stamped while checking a dependency.
#[derive(Debug, Clone)]
pub struct DependencyCheckError {
    pub key: TaskKey,
    pub path: Utf8PathBuf,
    pub error: Arc<std::io::Error>,
}

/// One incremental build.
pub struct Session<'p, T: Task> {
    store: StoreAccess<'p, T::Output>,
    pool: Arc<ThreadPool>,
    gates: Gates<T::Output>,
    writes: Mutex<HashMap<TaskKey, TaskData<T::Output>>>,
    providers: Mutex<HashMap<Utf8PathBuf, TaskKey>>,
    poison: Mutex<Option<EngineError>>,
    cancel: CancelToken,
    report: Mutex<Report>,
    check_errors: Mutex<Vec<DependencyCheckError>>,
    progress: bool,
    span: tracing::Span,
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

impl<'p, T: Task> Session<'p, T> {
    pub(crate) fn new(store: StoreAccess<'p, T::Output>, pool: Arc<ThreadPool>, progress: bool) -> Self {
        let read_only = matches!(store, StoreAccess::Snapshot(_));
        let span = tracing::span!(Level::INFO, "session", read_only);

        Self {
            store,
            pool,
            gates: Gates::default(),
            writes: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            poison: Mutex::new(None),
            cancel: CancelToken::new(),
            report: Mutex::new(Report::default()),
            check_errors: Mutex::new(Vec::new()),
            progress,
            span,
        }
    }

    /// Requires `task`, returning an up to date output.
    pub fn require(&self, task: &T) -> Result<T::Output, EngineError> {
        let _enter = self.span.enter();
        let key = TaskKey::of(task).map_err(|e| self.poison(e))?;
        self.require_keyed(task, &key, &[])
    }

    /// Requires every task in `tasks` concurrently on the session's worker
    /// pool. Results are returned in the order of `tasks`.
    pub fn require_all(&self, tasks: &[T]) -> Vec<Result<T::Output, EngineError>> {
        let span = tracing::span!(parent: &self.span, Level::INFO, "require_all", roots = tasks.len());

        if self.progress {
            span.pb_set_length(tasks.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            {
                span.pb_set_style(&style.progress_chars("=>-"));
            }
            span.pb_set_message("Requiring tasks...");
        }

        let _enter = span.enter();

        self.pool.install(|| {
            tasks
                .par_iter()
                .map(|task| {
                    let _enter = span.enter();
                    let result = self.require(task);
                    if self.progress {
                        span.pb_inc(1);
                    }
                    result
                })
                .collect()
        })
    }

    /// Token that cancels this session when triggered from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Snapshot of what the session did so far.
    pub fn report(&self) -> Report {
        lock(&self.report).clone()
    }

    /// Resources that couldn't be stamped during validation. Each of them
    /// counted as changed.
    pub fn dependency_check_errors(&self) -> Vec<DependencyCheckError> {
        lock(&self.check_errors).clone()
    }

    /// The store this session validates against.
    pub fn store(&self) -> &Store<T::Output> {
        self.store.get()
    }

    /// Ends the session, committing every result to the store.
    ///
    /// If a structural error happened at any point, nothing is written and
    /// the first such error is returned.
    pub fn commit(self) -> Result<Report, EngineError> {
        let Session {
            store,
            writes,
            poison,
            cancel,
            report,
            ..
        } = self;

        let report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        let writes = writes.into_inner().unwrap_or_else(PoisonError::into_inner);

        if let Some(err) = poison.into_inner().unwrap_or_else(PoisonError::into_inner) {
            tracing::warn!("discarding {} results: {}", writes.len(), err);
            return Err(err);
        }

        if cancel.is_cancelled() {
            tracing::warn!("discarding {} results: session was cancelled", writes.len());
            return Err(EngineError::Cancelled);
        }

        match store {
            StoreAccess::Writer(store) => {
                let s = Instant::now();
                let count = store.commit(writes)?;
                tracing::info!(
                    "committed {} records, {} executed, {} reused {}",
                    count,
                    report.executed.len(),
                    report.reused,
                    crate::io::as_overhead(s)
                );
            }
            StoreAccess::Snapshot(_) => {
                tracing::debug!("read-only session, dropping {} results", writes.len());
            }
        }

        Ok(report)
    }

    /// Ends the session without touching the store.
    pub fn discard(self) -> Report {
        self.report.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the first structural error of the session.
    fn poison(&self, err: EngineError) -> EngineError {
        let mut poison = lock(&self.poison);
        if poison.is_none() {
            *poison = Some(err.clone());
        }
        err
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), EngineError> {
        match self.cancel.is_cancelled() {
            true => Err(self.poison(EngineError::Cancelled)),
            false => Ok(()),
        }
    }

    /// Core of the algorithm. `lineage` holds the keys being required along
    /// the calling chain, the caller being the last one.
    pub(crate) fn require_keyed(
        &self,
        task: &T,
        key: &TaskKey,
        lineage: &[TaskKey],
    ) -> Result<T::Output, EngineError> {
        self.check_cancelled()?;

        if let Some(position) = lineage.iter().position(|k| k == key) {
            let mut path = lineage[position..].to_vec();
            path.push(key.clone());
            return Err(self.poison(EngineError::Cycle { path }));
        }

        let requirer = lineage.last();

        let outcome = match self.gates.enter(key, requirer) {
            Err(err) => Err(err),
            Ok(Entry::Done(outcome)) => outcome,
            Ok(Entry::Wait(gate)) => gate.wait(),
            Ok(Entry::Owner(gate)) => {
                let mut lineage = lineage.to_vec();
                lineage.push(key.clone());

                // Waiters must be released even when validation unwinds.
                let outcome = catch_unwind(AssertUnwindSafe(|| self.validate(task, key, &lineage)))
                    .unwrap_or_else(|panic| {
                        Err(EngineError::Panicked {
                            key: key.clone(),
                            message: panic_message(panic),
                        })
                    });
                self.gates.finish(key, &gate, outcome.clone());
                outcome
            }
        };

        if let Some(requirer) = requirer {
            self.gates.leave(requirer);
        }

        outcome.map_err(|e| self.poison(e))
    }

    /// Reuses the stored output of `key` if every recorded dependency still
    /// holds, executes the task otherwise.
    fn validate(&self, task: &T, key: &TaskKey, lineage: &[TaskKey]) -> Outcome<T::Output> {
        let Some(data) = self.store.get().get(key) else {
            return self.execute(task, key, lineage, Reason::New);
        };

        match self.check(key, data, lineage)? {
            None => {
                tracing::debug!("reusing {}", key);
                lock(&self.report).reused += 1;
                Ok(data.output.clone())
            }
            Some(reason) => self.execute(task, key, lineage, reason),
        }
    }

    /// Finds the first dependency of `data` that no longer holds.
    fn check(
        &self,
        key: &TaskKey,
        data: &TaskData<T::Output>,
        lineage: &[TaskKey],
    ) -> Result<Option<Reason>, EngineError> {
        for dep in &data.dependencies {
            match dep {
                Dependency::Call {
                    key: callee,
                    stamper,
                    stamp,
                } => {
                    let Ok(task) = callee.decode::<T>() else {
                        return Ok(Some(Reason::Undecodable(callee.clone())));
                    };

                    let output = self.require_keyed(&task, callee, lineage)?;

                    if stamper.stamp(&output)? != *stamp {
                        return Ok(Some(Reason::Call(callee.clone())));
                    }
                }
                Dependency::Resource {
                    path,
                    stamper,
                    stamp,
                } => {
                    let (current, error) = stamper.try_stamp(path);

                    // An error that yields the recorded stamp again is what the
                    // body saw last time, so the dependency still holds.
                    if current == *stamp {
                        if let Some(error) = error {
                            tracing::trace!("{} for {} still fails the same way: {}", path, key, error);
                        }
                        continue;
                    }

                    if let Some(error) = error {
                        tracing::warn!("couldn't stamp {} for {}: {}", path, key, error);
                        lock(&self.check_errors).push(DependencyCheckError {
                            key: key.clone(),
                            path: path.clone(),
                            error: Arc::new(error),
                        });
                    }

                    return Ok(Some(Reason::Resource(path.clone())));
                }
                Dependency::Provide { path } => self.register_provider(path, key)?,
            }
        }

        Ok(None)
    }

    fn execute(
        &self,
        task: &T,
        key: &TaskKey,
        lineage: &[TaskKey],
        reason: Reason,
    ) -> Outcome<T::Output> {
        // Provisions registered while checking the old record don't carry
        // over; the body declares its own.
        lock(&self.providers).retain(|_, provider| provider != key);

        let span = tracing::span!(Level::INFO, "task", key = %key);
        let _enter = span.enter();

        tracing::info!("executing {} ({})", key, reason);
        let start = Instant::now();

        let mut context = ExecContext::new(self, key.clone(), lineage, span.clone());

        let output = match catch_unwind(AssertUnwindSafe(|| task.execute(&mut context))) {
            Ok(result) => result?,
            Err(panic) => {
                return Err(EngineError::Panicked {
                    key: key.clone(),
                    message: panic_message(panic),
                });
            }
        };

        // A body that finished after cancellation may have seen partial state.
        self.check_cancelled()?;

        let dependencies = context.into_dependencies();
        let duration = start.elapsed();

        tracing::debug!(
            "{} finished in {:.2?} with {} dependencies",
            key,
            duration,
            dependencies.len()
        );

        lock(&self.writes).insert(
            key.clone(),
            TaskData {
                output: output.clone(),
                dependencies,
            },
        );

        lock(&self.report).executed.push(TaskExecution {
            key: key.clone(),
            reason,
            start,
            duration,
        });

        Ok(output)
    }

    /// Makes `key` the provider of `path` for the rest of the session.
    pub(crate) fn register_provider(&self, path: &Utf8Path, key: &TaskKey) -> Result<(), EngineError> {
        let mut providers = lock(&self.providers);

        match providers.entry(path.to_owned()) {
            MapEntry::Occupied(entry) if entry.get() != key => {
                let err = EngineError::ResourceConflict {
                    path: path.to_owned(),
                    first: entry.get().clone(),
                    second: key.clone(),
                };
                Err(self.poison(err))
            }
            MapEntry::Occupied(_) => Ok(()),
            MapEntry::Vacant(entry) => {
                entry.insert(key.clone());
                Ok(())
            }
        }
    }
}
