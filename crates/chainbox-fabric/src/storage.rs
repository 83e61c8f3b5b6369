//! Filesystem-scoped KV and blob namespaces.
//!
//! Each namespace is a directory; keys are URL-encoded into file names so
//! arbitrary key strings round-trip safely. Values are serialised opaquely:
//! JSON for the KV store, raw bytes for the blob store. Concurrent writers
//! to the same key are last-writer-wins; there are no cross-key guarantees.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use chainbox_types::FabricError;

/// Storage failures, folded into `INTERNAL_ERROR` at the fabric boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<StorageError> for FabricError {
    fn from(e: StorageError) -> Self {
        FabricError::internal(e.to_string())
    }
}

/// One directory-backed namespace storing raw bytes.
#[derive(Debug, Clone)]
pub struct Namespace {
    dir: PathBuf,
}

impl Namespace {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            dir: root.join(name),
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_bytes(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(key), value).await?;
        Ok(())
    }

    /// Remove a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys starting with `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = decode_key(name) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

/// JSON-valued view over a namespace.
#[derive(Debug, Clone)]
pub struct KvStore {
    ns: Namespace,
}

impl KvStore {
    pub fn new(root: &Path) -> Self {
        Self {
            ns: Namespace::new(root, "kv"),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.ns.get_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.ns.set_bytes(key, &serde_json::to_vec(value)?).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.ns.delete(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ns.list(prefix).await
    }
}

/// Raw-bytes view over a namespace.
#[derive(Debug, Clone)]
pub struct BlobStore {
    ns: Namespace,
}

impl BlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            ns: Namespace::new(root, "blob"),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ns.get_bytes(key).await
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.ns.set_bytes(key, value).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.ns.delete(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ns.list(prefix).await
    }
}

/// Percent-encode a key into a safe file name. `[A-Za-z0-9._-]` pass
/// through; everything else becomes `%XX` per byte.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Invert [`encode_key`]. `None` for names that are not valid encodings.
fn decode_key(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut chars = name.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let hex = [hi, lo];
            let s = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(s, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}
