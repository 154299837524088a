//! Stamps are equality-only fingerprints of a task output or of an external
//! resource. The stamper is picked at every dependency site, so a task that
//! only cares whether a directory exists does not re-run when a file inside
//! it is edited.

use std::fs;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, encode};
use crate::error::EngineError;

/// How the output of a required task is fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputStamper {
    /// The stamp changes whenever the serialized output changes.
    #[default]
    Equals,
    /// The stamp never changes; the caller only needs the task to be up to date.
    Inconsequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputStamp {
    Equals(Hash32),
    Inconsequential,
}

impl OutputStamper {
    pub fn stamp<O: Serialize>(&self, output: &O) -> Result<OutputStamp, EngineError> {
        match self {
            OutputStamper::Equals => Ok(OutputStamp::Equals(Hash32::hash(encode(output)?))),
            OutputStamper::Inconsequential => Ok(OutputStamp::Inconsequential),
        }
    }
}

/// How an external resource is fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceStamper {
    /// Only whether something exists at the path.
    Exists,
    /// Last modification time.
    Modified,
    /// BLAKE3 hash of the file content.
    #[default]
    Hash,
    /// BLAKE3 hash over the sorted entry names of a directory.
    Listing,
}

/// Observed state of a resource. `None` means the resource was absent or
/// could not be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStamp {
    Exists(bool),
    Modified(Option<SystemTime>),
    Hash(Option<Hash32>),
    Listing(Option<Hash32>),
}

impl ResourceStamper {
    /// Stamps the resource at `path`.
    ///
    /// This never fails. A resource that can't be observed gets the absent
    /// stamp, so it reads as changed once it becomes observable again.
    pub fn stamp(&self, path: &Utf8Path) -> ResourceStamp {
        match self {
            ResourceStamper::Exists => ResourceStamp::Exists(path.exists()),
            ResourceStamper::Modified => ResourceStamp::Modified(
                observe(path, fs::metadata(path).and_then(|meta| meta.modified())),
            ),
            ResourceStamper::Hash => ResourceStamp::Hash(match path.is_file() {
                true => observe(path, Hash32::hash_file(path)),
                false => None,
            }),
            ResourceStamper::Listing => ResourceStamp::Listing(observe(path, hash_listing(path))),
        }
    }

    /// Like [`stamp`](Self::stamp), but surfaces the I/O error that made the
    /// resource unobservable, if any. Used during validation to collect
    /// dependency check errors.
    pub(crate) fn try_stamp(&self, path: &Utf8Path) -> (ResourceStamp, Option<std::io::Error>) {
        let error = match self {
            ResourceStamper::Exists => None,
            ResourceStamper::Modified => fs::metadata(path).and_then(|m| m.modified()).err(),
            ResourceStamper::Hash if path.is_file() => Hash32::hash_file(path).err(),
            ResourceStamper::Hash => None,
            ResourceStamper::Listing => hash_listing(path).err(),
        };

        let error = error.filter(|e| e.kind() != std::io::ErrorKind::NotFound);
        (self.stamp(path), error)
    }
}

fn observe<V>(path: &Utf8Path, result: std::io::Result<V>) -> Option<V> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::debug!("couldn't stamp {}: {}", path, e);
            None
        }
    }
}

fn hash_listing(path: &Utf8Path) -> std::io::Result<Hash32> {
    let mut names = fs::read_dir(path)?
        .map(|entry| entry.map(|entry| entry.file_name()))
        .collect::<Result<Vec<_>, _>>()?;

    names.sort();

    let mut hasher = blake3::Hasher::new();
    for name in names {
        hasher.update(name.as_encoded_bytes());
        hasher.update(&[0]);
    }

    Ok(hasher.finalize().into())
}

/// Handle to an external resource that a task declared a dependency on.
#[derive(Debug, Clone)]
pub struct Resource {
    path: Utf8PathBuf,
    stamp: ResourceStamp,
}

impl Resource {
    pub(crate) fn new(path: Utf8PathBuf, stamp: ResourceStamp) -> Self {
        Self { path, stamp }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The stamp recorded for this resource.
    pub fn stamp(&self) -> ResourceStamp {
        self.stamp
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    pub fn read_to_string(&self) -> std::io::Result<String> {
        fs::read_to_string(&self.path)
    }
}
