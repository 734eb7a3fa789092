//! Atomic key-value store seam.
//!
//! Every counter mutation in the allocator goes through [`AtomicStore::atomic_update`]:
//! a single-key read-modify-write that commits only if the key was unchanged
//! since the read, retried internally up to the backend's budget. There are
//! no multi-key transactions and no locks; `multi_path_update` is best-effort
//! and gives no cross-key atomicity guarantee.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

pub use serde_json::Value;

/// Pure transition applied inside an optimistic update. Receives the current
/// value at the key (`None` if absent) and returns the desired value
/// (`None` deletes the key). May be invoked several times on retry, so it
/// must be side-effect free apart from interior captures.
pub type UpdateFn<'a> = &'a (dyn Fn(Option<Value>) -> Option<Value> + Send + Sync);

#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Plain point read. Not ordered with respect to concurrent updates.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Plain overwrite. NOT atomic with respect to `atomic_update` callers
    /// racing on the same key; reserved for logically single-writer state.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Single-key optimistic read-modify-write. Returns the committed value.
    /// Exhausting the retry budget surfaces [`StoreError::Contention`];
    /// the caller must treat that as "commit status unknown".
    async fn atomic_update(
        &self,
        path: &str,
        apply: UpdateFn<'_>,
    ) -> Result<Option<Value>, StoreError>;

    /// Applies a batch of writes/deletes (`None` deletes). Unordered and
    /// without cross-key atomicity: a crash mid-way may leave some paths
    /// applied and others not.
    async fn multi_path_update(
        &self,
        changes: HashMap<String, Option<Value>>,
    ) -> Result<(), StoreError>;

    /// Lists all entries whose path starts with `prefix`, sorted by path.
    /// Diagnostic/admin read; no snapshot isolation.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}
