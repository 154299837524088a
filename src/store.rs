//! Durable memoization table.
//!
//! The store maps every [`TaskKey`] to the output and dependency list of its
//! most recent execution. Three reverse indices are derived from those
//! records and never persisted on their own: they are rebuilt on load.
//!
//! On disk, the store is a directory with one CBOR record per key, named after
//! the key digest. Each record carries its key and a checksum of its payload,
//! so a damaged record only costs a recomputation of that one key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, TaskKey, decode, encode};
use crate::error::StoreError;
use crate::stamp::{OutputStamp, OutputStamper, ResourceStamp, ResourceStamper};

const RECORD_VERSION: u32 = 1;
const RECORD_EXTENSION: &str = "cbor";
const TEMP_EXTENSION: &str = "tmp";
const LOCK_FILE: &str = ".lock";

/// A single dependency observed while a task body ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependency {
    /// The task required another task and saw an output with this stamp.
    Call {
        key: TaskKey,
        stamper: OutputStamper,
        stamp: OutputStamp,
    },
    /// The task read an external resource.
    Resource {
        path: Utf8PathBuf,
        stamper: ResourceStamper,
        stamp: ResourceStamp,
    },
    /// The task declared itself the writer of a resource.
    Provide { path: Utf8PathBuf },
}

/// Last committed result of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskData<O> {
    pub output: O,
    /// Exactly what the body required on its most recent execution, in order.
    pub dependencies: Vec<Dependency>,
}

/// Something other tasks can depend on.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Resource(&'a Utf8Path),
    Task(&'a TaskKey),
}

#[derive(Serialize, Deserialize)]
struct Record {
    version: u32,
    key: TaskKey,
    checksum: Hash32,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Store<O> {
    tasks: HashMap<TaskKey, TaskData<O>>,
    /// resource -> tasks that read it
    readers: HashMap<Utf8PathBuf, HashSet<TaskKey>>,
    /// resource -> tasks that provide it
    providers: HashMap<Utf8PathBuf, HashSet<TaskKey>>,
    /// task -> tasks that required it
    callers: HashMap<TaskKey, HashSet<TaskKey>>,
    dir: Option<Utf8PathBuf>,
    /// Exclusive lock on `dir`, released when the last clone is dropped.
    _lock: Option<Arc<fs::File>>,
}

impl<O> Default for Store<O> {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
            readers: HashMap::new(),
            providers: HashMap::new(),
            callers: HashMap::new(),
            dir: None,
            _lock: None,
        }
    }
}

impl<O> Store<O> {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &TaskKey) -> Option<&TaskData<O>> {
        self.tasks.get(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.tasks.keys()
    }

    /// Replaces the record of `key` wholesale and reindexes it.
    pub fn put(&mut self, key: TaskKey, data: TaskData<O>) {
        self.unindex(&key);
        self.index(&key, &data.dependencies);
        self.tasks.insert(key, data);
    }

    pub fn remove(&mut self, key: &TaskKey) -> Option<TaskData<O>> {
        self.unindex(key);
        self.tasks.remove(key)
    }

    /// Tasks that directly depend on `target`.
    pub fn dependents(&self, target: Target) -> HashSet<TaskKey> {
        match target {
            Target::Resource(path) => {
                let readers = self.readers.get(path).into_iter().flatten();
                let providers = self.providers.get(path).into_iter().flatten();
                readers.chain(providers).cloned().collect()
            }
            Target::Task(key) => self.callers.get(key).cloned().unwrap_or_default(),
        }
    }

    /// Every task that may observe a change to one of `paths`, found by
    /// walking the reverse indices. A task providing a path makes the readers
    /// of that path affected as well.
    pub fn affected_by<'a>(&self, paths: impl IntoIterator<Item = &'a Utf8Path>) -> HashSet<TaskKey> {
        let mut affected = HashSet::new();
        let mut queue = VecDeque::new();

        for path in paths {
            queue.extend(self.dependents(Target::Resource(path)));
        }

        while let Some(key) = queue.pop_front() {
            if !affected.insert(key.clone()) {
                continue;
            }

            queue.extend(self.dependents(Target::Task(&key)));

            if let Some(data) = self.tasks.get(&key) {
                for dep in &data.dependencies {
                    if let Dependency::Provide { path } = dep
                        && let Some(readers) = self.readers.get(path)
                    {
                        queue.extend(readers.iter().cloned());
                    }
                }
            }
        }

        affected
    }

    fn index(&mut self, key: &TaskKey, dependencies: &[Dependency]) {
        for dep in dependencies {
            match dep {
                Dependency::Call { key: callee, .. } => {
                    self.callers
                        .entry(callee.clone())
                        .or_default()
                        .insert(key.clone());
                }
                Dependency::Resource { path, .. } => {
                    self.readers
                        .entry(path.clone())
                        .or_default()
                        .insert(key.clone());
                }
                Dependency::Provide { path } => {
                    self.providers
                        .entry(path.clone())
                        .or_default()
                        .insert(key.clone());
                }
            }
        }
    }

    fn unindex(&mut self, key: &TaskKey) {
        let Some(old) = self.tasks.get(key) else {
            return;
        };

        for dep in &old.dependencies {
            match dep {
                Dependency::Call { key: callee, .. } => remove_from(&mut self.callers, callee, key),
                Dependency::Resource { path, .. } => remove_from(&mut self.readers, path, key),
                Dependency::Provide { path } => remove_from(&mut self.providers, path, key),
            }
        }
    }

    /// Builds a graph of call edges between the stored tasks.
    pub fn graph(&self) -> (DiGraph<TaskKey, ()>, HashMap<TaskKey, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for key in self.tasks.keys() {
            nodes.insert(key.clone(), graph.add_node(key.clone()));
        }

        for (key, data) in &self.tasks {
            for dep in &data.dependencies {
                if let Dependency::Call { key: callee, .. } = dep
                    && let Some(&target) = nodes.get(callee)
                {
                    graph.add_edge(nodes[key], target, ());
                }
            }
        }

        (graph, nodes)
    }

    /// Human readable dump of the stored keys and their dependencies.
    pub fn to_json(&self) -> serde_json::Value {
        let mut keys: Vec<_> = self.tasks.iter().collect();
        keys.sort_by_key(|(key, _)| key.to_string());

        let tasks = keys
            .into_iter()
            .map(|(key, data)| {
                let deps: Vec<_> = data
                    .dependencies
                    .iter()
                    .map(|dep| match dep {
                        Dependency::Call { key, stamper, .. } => serde_json::json!({
                            "call": key.to_string(),
                            "stamper": format!("{stamper:?}"),
                        }),
                        Dependency::Resource { path, stamper, .. } => serde_json::json!({
                            "resource": path,
                            "stamper": format!("{stamper:?}"),
                        }),
                        Dependency::Provide { path } => serde_json::json!({ "provide": path }),
                    })
                    .collect();

                serde_json::json!({ "key": key.to_string(), "dependencies": deps })
            })
            .collect::<Vec<_>>();

        serde_json::Value::Array(tasks)
    }
}

impl<O> Store<O>
where
    O: Serialize + DeserializeOwned,
{
    /// Opens the store kept in `dir`, creating the directory if needed.
    ///
    /// The directory is locked for as long as the store, or any snapshot of
    /// it, is alive. Records that can't be read or trusted are skipped; their
    /// keys will simply be executed again.
    pub fn open(dir: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let s = Instant::now();

        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let lock = lock_dir(dir)?;

        let mut store = Store {
            dir: Some(dir.to_owned()),
            _lock: Some(Arc::new(lock)),
            ..Store::default()
        };

        let mut skipped = 0;

        for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = match Utf8PathBuf::from_path_buf(entry.path()) {
                Ok(path) => path,
                Err(path) => {
                    tracing::warn!("skipping non UTF-8 store entry {}", path.display());
                    skipped += 1;
                    continue;
                }
            };

            // Left behind by a write that never reached its rename.
            if path.extension() == Some(TEMP_EXTENSION) {
                if let Err(e) = crate::io::remove_if_exists(&path) {
                    tracing::warn!("couldn't remove stale {}: {}", path, e);
                }
                continue;
            }

            if path.extension() != Some(RECORD_EXTENSION) {
                continue;
            }

            match read_record::<O>(&path) {
                Ok((key, data)) => store.put(key, data),
                Err(reason) => {
                    tracing::warn!("skipping store record {}: {}", path, reason);
                    skipped += 1;
                }
            }
        }

        tracing::info!(
            "loaded {} records from {} ({} skipped) {}",
            store.len(),
            dir,
            skipped,
            crate::io::as_overhead(s)
        );

        Ok(store)
    }

    fn record_path(dir: &Utf8Path, key: &TaskKey) -> Utf8PathBuf {
        dir.join(key.digest().to_hex())
            .with_extension(RECORD_EXTENSION)
    }

    /// Applies the writes of a finished session and persists them.
    pub(crate) fn commit(
        &mut self,
        writes: impl IntoIterator<Item = (TaskKey, TaskData<O>)>,
    ) -> Result<usize, StoreError> {
        let mut keys = Vec::new();

        for (key, data) in writes {
            keys.push(key.clone());
            self.put(key, data);
        }

        self.persist(&keys)?;
        Ok(keys.len())
    }

    /// Writes the current state of `keys` to disk. Keys no longer in memory
    /// have their record deleted.
    fn persist(&self, keys: &[TaskKey]) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        for key in keys {
            let path = Self::record_path(dir, key);

            match self.tasks.get(key) {
                Some(data) => {
                    let payload = encode(data).map_err(|e| {
                        StoreError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                    })?;

                    let record = Record {
                        version: RECORD_VERSION,
                        key: key.clone(),
                        checksum: Hash32::hash(&payload),
                        payload,
                    };

                    let bytes = encode(&record).map_err(|e| {
                        StoreError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                    })?;

                    crate::io::write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
                }
                None => {
                    crate::io::remove_if_exists(&path).map_err(|e| StoreError::io(&path, e))?;
                }
            }
        }

        Ok(())
    }

    /// Drops every record not reachable from `roots` through call edges.
    ///
    /// This is an out-of-band maintenance step; sessions never call it.
    pub fn compact(&mut self, roots: &[TaskKey]) -> Result<usize, StoreError> {
        let (graph, nodes) = self.graph();
        let mut reachable = HashSet::new();

        for root in roots {
            let Some(&start) = nodes.get(root) else {
                continue;
            };

            let mut dfs = Dfs::new(&graph, start);
            while let Some(index) = dfs.next(&graph) {
                reachable.insert(index);
            }
        }

        let orphans: Vec<TaskKey> = nodes
            .into_iter()
            .filter(|(_, index)| !reachable.contains(index))
            .map(|(key, _)| key)
            .collect();

        for key in &orphans {
            self.remove(key);
        }

        self.persist(&orphans)?;
        tracing::info!("compacted store, removed {} records", orphans.len());

        Ok(orphans.len())
    }
}

fn remove_from<K>(map: &mut HashMap<K, HashSet<TaskKey>>, entry: &K, key: &TaskKey)
where
    K: std::hash::Hash + Eq,
{
    if let Some(set) = map.get_mut(entry) {
        set.remove(key);
        if set.is_empty() {
            map.remove(entry);
        }
    }
}

fn lock_dir(dir: &Utf8Path) -> Result<fs::File, StoreError> {
    let path = dir.join(LOCK_FILE);

    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| StoreError::io(&path, e))?;

    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(fs::TryLockError::WouldBlock) => Err(StoreError::Locked { path: dir.to_owned() }),
        Err(fs::TryLockError::Error(e)) => Err(StoreError::io(&path, e)),
    }
}

fn read_record<O: DeserializeOwned>(path: &Utf8Path) -> Result<(TaskKey, TaskData<O>), String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let record: Record = decode(&bytes).map_err(|e| e.to_string())?;

    if record.version != RECORD_VERSION {
        return Err(format!("unsupported record version {}", record.version));
    }

    if Hash32::hash(&record.payload) != record.checksum {
        return Err("checksum mismatch".into());
    }

    if path.file_stem() != Some(record.key.digest().to_hex().as_str()) {
        return Err(format!("record of {} stored under the wrong name", record.key));
    }

    let data = decode(&record.payload).map_err(|e| e.to_string())?;
    Ok((record.key, data))
}
