use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{AtomicStore, UpdateFn};

const DEFAULT_MAX_ATTEMPTS: u32 = 16;

struct Versioned {
    version: u64,
    value: Value,
}

struct Inner {
    /// Store-wide version sequence. Per-key versions are drawn from it so a
    /// delete-and-recreate never reuses an observed version.
    seq: u64,
    entries: HashMap<String, Versioned>,
}

/// In-memory store with per-key compare-and-swap semantics.
///
/// The lock is released between the read and the commit of an
/// `atomic_update`, so concurrent updaters genuinely race and lose the
/// version check, exercising the same retry path a remote backend would.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_attempts: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seq: 0,
                entries: HashMap::new(),
            }),
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.entries.get(path).map(|e| e.value.clone()))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let version = inner.seq;
        inner
            .entries
            .insert(path.to_string(), Versioned { version, value });
        Ok(())
    }

    async fn atomic_update(
        &self,
        path: &str,
        apply: UpdateFn<'_>,
    ) -> Result<Option<Value>, StoreError> {
        for _ in 0..self.max_attempts {
            let observed: Option<(u64, Value)> = {
                let inner = self.inner.lock();
                inner
                    .entries
                    .get(path)
                    .map(|e| (e.version, e.value.clone()))
            };

            let next = apply(observed.as_ref().map(|(_, v)| v.clone()));

            let mut inner = self.inner.lock();
            let current = inner.entries.get(path).map(|e| e.version);
            if current != observed.as_ref().map(|(ver, _)| *ver) {
                // Lost the race; re-read and re-apply.
                continue;
            }

            return Ok(match next {
                Some(value) => {
                    inner.seq += 1;
                    let version = inner.seq;
                    inner.entries.insert(
                        path.to_string(),
                        Versioned {
                            version,
                            value: value.clone(),
                        },
                    );
                    Some(value)
                }
                None => {
                    inner.entries.remove(path);
                    None
                }
            });
        }

        Err(StoreError::Contention {
            path: path.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn multi_path_update(
        &self,
        changes: HashMap<String, Option<Value>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for (path, change) in changes {
            match change {
                Some(value) => {
                    inner.seq += 1;
                    let version = inner.seq;
                    inner.entries.insert(path, Versioned { version, value });
                }
                None => {
                    inner.entries.remove(&path);
                }
            }
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<(String, Value)> = inner
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, e)| (path.clone(), e.value.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
