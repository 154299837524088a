//! Watch mode.
//!
//! The roots are required once, then every directory holding a resource read
//! by a stored task is watched. When a debounced batch of file events
//! arrives, the affected keys are looked up in the store's reverse indices
//! and the roots are required again in a fresh session. Validation takes care
//! of re-running only what actually changed.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::new_debouncer;

use crate::error::{EngineError, WatchError};
use crate::store::{Dependency, Store};
use crate::{Pie, Report, Task};

/// Outputs of the roots, in order, for one rebuild.
pub type Outputs<T> = Vec<Result<<T as Task>::Output, EngineError>>;

impl<T: Task> Pie<T> {
    /// Requires `roots`, then keeps requiring them on every file change until
    /// `callback` breaks out of the loop.
    ///
    /// A rebuild that fails to commit is logged and the loop keeps watching.
    pub fn watch<F>(&mut self, roots: &[T], mut callback: F) -> Result<(), WatchError>
    where
        F: FnMut(Outputs<T>, &Report) -> ControlFlow<()>,
    {
        let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;

        tracing::info!("running initial build...");
        let (outputs, report) = self.rebuild(roots)?;

        if callback(outputs, &report).is_break() {
            return Ok(());
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer = new_debouncer(Duration::from_millis(250), None, tx)?;
        let mut watched = HashSet::new();

        watch_new_roots(&self.store, &cwd, &mut watched, |path| {
            debouncer.watch(path, RecursiveMode::Recursive)
        })?;
        tracing::info!("initial build completed, now watching for changes...");

        loop {
            let events = match rx.recv()? {
                Ok(events) => events,
                Err(errors) => {
                    for e in errors {
                        tracing::error!("watch error: {}", e);
                    }
                    continue;
                }
            };

            let changed: HashSet<Utf8PathBuf> = events
                .iter()
                .filter(|de| {
                    matches!(
                        de.event.kind,
                        EventKind::Create(..) | EventKind::Modify(..) | EventKind::Remove(..)
                    )
                })
                .flat_map(|de| &de.event.paths)
                .filter_map(|path| Utf8Path::from_path(path))
                .flat_map(|path| candidates(path, &cwd))
                .collect();

            let affected = self.store.affected_by(changed.iter().map(Utf8PathBuf::as_path));
            if affected.is_empty() {
                tracing::debug!("{} paths changed, no task affected", changed.len());
                continue;
            }

            tracing::info!("change detected, {} tasks affected", affected.len());

            let s = Instant::now();
            let (outputs, report) = match self.rebuild(roots) {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::error!("rebuild failed: {}", e);
                    continue;
                }
            };

            tracing::info!(
                "rebuild complete, {} executed {}",
                report.executed.len(),
                crate::io::as_overhead(s)
            );

            if callback(outputs, &report).is_break() {
                return Ok(());
            }

            watch_new_roots(&self.store, &cwd, &mut watched, |path| {
                debouncer.watch(path, RecursiveMode::Recursive)
            })?;
        }
    }

    fn rebuild(&mut self, roots: &[T]) -> Result<(Outputs<T>, Report), EngineError> {
        let session = self.new_session();
        let outputs = session.require_all(roots);
        let report = session.commit()?;
        Ok((outputs, report))
    }
}

/// Starts watching directories of resources read since the last call.
fn watch_new_roots<O>(
    store: &Store<O>,
    cwd: &Utf8Path,
    watched: &mut HashSet<Utf8PathBuf>,
    mut watch: impl FnMut(&Utf8Path) -> notify::Result<()>,
) -> Result<(), WatchError> {
    let wanted: HashSet<Utf8PathBuf> = resources(store)
        .filter_map(|path| watch_root(&cwd.join(path)))
        .collect();

    for path in collapse_watch_paths(wanted) {
        if watched.iter().any(|w| path.starts_with(w)) {
            continue;
        }

        tracing::info!("watching {}", path);
        watch(&path)?;
        watched.insert(path);
    }

    Ok(())
}

fn resources<O>(store: &Store<O>) -> impl Iterator<Item = &Utf8Path> {
    store
        .keys()
        .filter_map(|key| store.get(key))
        .flat_map(|data| &data.dependencies)
        .filter_map(|dep| match dep {
            Dependency::Resource { path, .. } => Some(path.as_path()),
            _ => None,
        })
}

/// Nearest existing directory that covers `path`. Files are watched through
/// their parent so atomic writes are caught.
fn watch_root(path: &Utf8Path) -> Option<Utf8PathBuf> {
    path.ancestors()
        .find(|ancestor| ancestor.is_dir())
        .map(Utf8Path::to_path_buf)
}

/// Every spelling under which a changed path may have been recorded: the
/// absolute path, the path relative to the working directory, and the
/// directories containing them (which directory stampers read).
fn candidates(path: &Utf8Path, cwd: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut paths = Vec::new();

    for ancestor in path.ancestors() {
        paths.push(ancestor.to_path_buf());

        if let Ok(relative) = ancestor.strip_prefix(cwd)
            && !relative.as_str().is_empty()
        {
            paths.push(relative.to_path_buf());
        }
    }

    paths
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
