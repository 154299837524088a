use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for change detection.
///
/// In `tsumiki`, this serves three purposes:
/// 1. It is the fingerprint behind content and output stamps, deciding whether
///    a recorded dependency still holds.
/// 2. It names record files inside the store directory, one per task key.
/// 3. It checksums record payloads so that a torn or corrupted record is
///    detected on load instead of being trusted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Encodes a value as CBOR.
pub(crate) fn encode<V: Serialize + ?Sized>(value: &V) -> Result<Vec<u8>, EngineError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|e| EngineError::Encode(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a CBOR value.
pub(crate) fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, EngineError> {
    ciborium::from_reader(bytes).map_err(|e| EngineError::Encode(e.to_string()))
}

/// Identity of a single task invocation.
///
/// A key is the task definition identifier together with the CBOR encoding of
/// the task value. Equality and hashing only ever look at these bytes, so two
/// task values are the same computation exactly when they serialize the same
/// way. Task inputs should therefore avoid types with unstable iteration order
/// such as `HashMap`; use `BTreeMap` instead.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    id: ArcStr,
    input: Arc<[u8]>,
}

impl TaskKey {
    /// Computes the key of a task value.
    pub fn of<T: crate::Task>(task: &T) -> Result<Self, EngineError> {
        Ok(Self {
            id: Arc::from(task.id()),
            input: Arc::from(encode(task)?),
        })
    }

    /// Recovers the task value this key was computed from.
    pub fn decode<T: crate::Task>(&self) -> Result<T, EngineError> {
        decode(&self.input)
    }

    /// The task definition identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stable digest of the whole key, used to name its record on disk.
    pub fn digest(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.input);
        hasher.finalize().into()
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.digest().to_hex();
        write!(f, "{}({})", self.id, &hex[..10])
    }
}

impl Debug for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskKey({self})")
    }
}
