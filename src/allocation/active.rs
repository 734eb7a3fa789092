use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;

use crate::allocation::model::{ACTIVE_ROOT, ActiveBundle, active_path};
use crate::error::StoreError;
use crate::store::AtomicStore;

/// Repository for each worker's at-most-one active bundle per region.
///
/// All access is plain get/set: the state is logically single-writer (a
/// worker's own actions serialize through the caller), so none of these
/// operations are atomic with respect to counter updates.
pub struct ActiveBundles {
    store: Arc<dyn AtomicStore>,
}

impl ActiveBundles {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    pub async fn get(
        &self,
        worker_id: &str,
        region: &str,
    ) -> Result<Option<ActiveBundle>, StoreError> {
        let path = active_path(worker_id, region);
        match self.store.get(&path).await? {
            Some(value) => {
                let state = serde_json::from_value(value)
                    .with_context(|| format!("malformed active bundle at {path}"))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub async fn put(&self, worker_id: &str, state: &ActiveBundle) -> Result<(), StoreError> {
        let value = serde_json::to_value(state).context("active bundle encode failed")?;
        self.store
            .set(&active_path(worker_id, &state.region), value)
            .await
    }

    pub async fn delete(&self, worker_id: &str, region: &str) -> Result<(), StoreError> {
        let mut changes = HashMap::new();
        changes.insert(active_path(worker_id, region), None);
        self.store.multi_path_update(changes).await
    }

    /// All regions in which the worker currently holds a bundle.
    pub async fn all_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<HashMap<String, ActiveBundle>, StoreError> {
        let prefix = format!("{ACTIVE_ROOT}{worker_id}/");
        let mut out = HashMap::new();

        for (path, value) in self.store.scan_prefix(&prefix).await? {
            match serde_json::from_value::<ActiveBundle>(value) {
                Ok(state) => {
                    out.insert(state.region.clone(), state);
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "skipping malformed active bundle");
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn repo() -> ActiveBundles {
        ActiveBundles::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let repo = repo();
        let state = ActiveBundle::new(3, "Vasai");

        repo.put("u1", &state).await.unwrap();
        assert_eq!(repo.get("u1", "Vasai").await.unwrap(), Some(state));

        repo.delete("u1", "Vasai").await.unwrap();
        assert_eq!(repo.get("u1", "Vasai").await.unwrap(), None);
    }

    #[tokio::test]
    async fn states_are_scoped_per_region() {
        let repo = repo();
        repo.put("u1", &ActiveBundle::new(1, "Vasai")).await.unwrap();
        repo.put("u1", &ActiveBundle::new(9, "Kannad")).await.unwrap();

        let all = repo.all_for_worker("u1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["Vasai"].bundle_no, 1);
        assert_eq!(all["Kannad"].bundle_no, 9);

        assert!(repo.all_for_worker("u2").await.unwrap().is_empty());
    }
}
