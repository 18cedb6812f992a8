//! Host key-value collaborator.
//!
//! The chat host owns the durable key-value namespace; this core only sees
//! the narrow contract below. There are no transactions and writes are
//! last-write-wins, so all consistency in the crate rests on deterministic
//! per-user key layouts rather than locking.

use dashmap::DashMap;
use thiserror::Error;

/// Error reported by the host key-value store.
///
/// The host's failure detail is opaque to this core; we keep the operation
/// name and the host's message for logging.
#[derive(Debug, Error)]
#[error("kv {op} failed: {message}")]
pub struct KvError {
    pub op: &'static str,
    pub message: String,
}

impl KvError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

/// Contract consumed from the host key-value store.
///
/// `get` returns `None` for absent keys (absence is not an error here; the
/// callers decide what absence means). `list_keys` pages through the whole
/// namespace and is only used by the global token reset sweep.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Returns the page of keys at `page` (0-based), `per_page` keys per page.
    /// An empty page means the namespace is exhausted.
    fn list_keys(&self, page: usize, per_page: usize) -> Result<Vec<String>, KvError>;
}

/// In-memory `KvStore` used by tests and the dev harness.
///
/// Key listing is sorted so pagination is stable across calls, which is what
/// the reset sweep assumes of the host store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    fn list_keys(&self, page: usize, per_page: usize) -> Result<Vec<String>, KvError> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();

        let start = page.saturating_mul(per_page);
        if start >= keys.len() {
            return Ok(Vec::new());
        }
        let end = (start + per_page).min(keys.len());
        Ok(keys[start..end].to_vec())
    }
}
