use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::allocation::model::{BundleCounter, COUNTERS_ROOT, Partition};
use crate::error::StoreError;
use crate::store::AtomicStore;

/// Repository for per-partition bundle counters. Every mutation is a
/// single-key optimistic update; the counter is created lazily on first
/// allocation and only ever removed by the full wipe.
pub struct BundleCounters {
    store: Arc<dyn AtomicStore>,
}

/// An absent counter decodes to the lazily-initialized default; a present
/// but malformed one is an error, since defaulting it would restart the
/// partition at 1 and reissue numbers already held live.
fn decode(value: Option<Value>) -> Result<BundleCounter, serde_json::Error> {
    match value {
        Some(v) => serde_json::from_value(v),
        None => Ok(BundleCounter::default()),
    }
}

fn encode(counter: &BundleCounter) -> Value {
    json!({
        "next_bundle": counter.next_bundle,
        "gaps": counter.gaps,
    })
}

impl BundleCounters {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    /// Issues the next bundle number for the partition: the smallest gap if
    /// one exists, otherwise the counter head. Returns the number and
    /// whether it was recycled from the gap pool.
    #[instrument(skip(self), target = "allocation", fields(partition = %partition))]
    pub async fn allocate(&self, partition: &Partition) -> Result<(u64, bool), StoreError> {
        // The closure may rerun on conflict; the cell holds whatever the
        // committed attempt picked.
        let picked = Mutex::new(None::<(u64, bool)>);

        self.store
            .atomic_update(&partition.counter_path(), &|cur| match decode(cur.clone()) {
                Ok(mut counter) => {
                    let issued = counter.allocate();
                    *picked.lock() = Some(issued);
                    Some(encode(&counter))
                }
                // Commit the stored value unchanged and report the failure
                // below instead of resetting the counter.
                Err(_) => {
                    *picked.lock() = None;
                    cur
                }
            })
            .await?;

        let issued = picked.lock().take().ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!(
                "malformed bundle counter at {}",
                partition.counter_path()
            ))
        })?;

        debug!(bundle_no = issued.0, from_gap = issued.1, "bundle number issued");
        Ok(issued)
    }

    /// Returns `bundle_no` to the partition's gap pool. Idempotent: a number
    /// already in the pool is not duplicated.
    #[instrument(skip(self), target = "allocation", fields(partition = %partition, bundle_no))]
    pub async fn recycle(&self, partition: &Partition, bundle_no: u64) -> Result<(), StoreError> {
        let recycled = Mutex::new(false);

        self.store
            .atomic_update(&partition.counter_path(), &|cur| match decode(cur.clone()) {
                Ok(mut counter) => {
                    counter.recycle(bundle_no);
                    *recycled.lock() = true;
                    Some(encode(&counter))
                }
                Err(_) => {
                    *recycled.lock() = false;
                    cur
                }
            })
            .await?;

        if !*recycled.lock() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "malformed bundle counter at {}",
                partition.counter_path()
            )));
        }

        debug!("bundle number recycled");
        Ok(())
    }

    /// Read-only snapshot of every partition's counter.
    pub async fn snapshot(&self) -> Result<HashMap<Partition, BundleCounter>, StoreError> {
        let mut out = HashMap::new();

        for (path, value) in self.store.scan_prefix(COUNTERS_ROOT).await? {
            let key = &path[COUNTERS_ROOT.len()..];
            let Some((location, region)) = key.split_once('/') else {
                tracing::warn!(path = %path, "skipping malformed counter path");
                continue;
            };
            match serde_json::from_value::<BundleCounter>(value) {
                Ok(counter) => {
                    out.insert(Partition::new(location, region), counter);
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "skipping malformed counter");
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

    fn counters() -> (Arc<MemoryStore>, BundleCounters) {
        let store = Arc::new(MemoryStore::new());
        let repo = BundleCounters::new(store.clone());
        (store, repo)
    }

    #[tokio::test]
    async fn first_allocation_initializes_counter() {
        let (store, repo) = counters();
        let p = Partition::new("palghar", "Kannad");

        assert_eq!(repo.allocate(&p).await.unwrap(), (1, false));

        let stored = store.get(&p.counter_path()).await.unwrap().unwrap();
        assert_eq!(stored, json!({"next_bundle": 2, "gaps": []}));
    }

    #[tokio::test]
    async fn gaps_are_consumed_before_growth() {
        let (store, repo) = counters();
        let p = Partition::new("palghar", "Kannad");
        store
            .set(&p.counter_path(), json!({"next_bundle": 10, "gaps": [7, 3]}))
            .await
            .unwrap();

        assert_eq!(repo.allocate(&p).await.unwrap(), (3, true));
        assert_eq!(repo.allocate(&p).await.unwrap(), (7, true));
        assert_eq!(repo.allocate(&p).await.unwrap(), (10, false));
    }

    #[tokio::test]
    async fn recycle_twice_keeps_one_entry() {
        let (store, repo) = counters();
        let p = Partition::new("palghar", "Kannad");
        repo.allocate(&p).await.unwrap();

        repo.recycle(&p, 1).await.unwrap();
        repo.recycle(&p, 1).await.unwrap();

        let stored = store.get(&p.counter_path()).await.unwrap().unwrap();
        assert_eq!(stored, json!({"next_bundle": 2, "gaps": [1]}));
    }

    #[tokio::test]
    async fn malformed_counter_fails_instead_of_restarting_at_one() {
        let (store, repo) = counters();
        let p = Partition::new("palghar", "Kannad");
        store
            .set(&p.counter_path(), json!("not a counter"))
            .await
            .unwrap();

        let err = repo.allocate(&p).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)), "got {err:?}");

        let err = repo.recycle(&p, 4).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)), "got {err:?}");

        // The stored value is left for an operator to inspect, not reset.
        assert_eq!(
            store.get(&p.counter_path()).await.unwrap(),
            Some(json!("not a counter"))
        );
    }

    #[tokio::test]
    async fn snapshot_maps_partitions() {
        let (_, repo) = counters();
        let a = Partition::new("palghar", "Vasai");
        let b = Partition::new("nashik", "Igatpuri");
        repo.allocate(&a).await.unwrap();
        repo.allocate(&b).await.unwrap();
        repo.allocate(&b).await.unwrap();

        let snap = repo.snapshot().await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&a].next_bundle, 2);
        assert_eq!(snap[&b].next_bundle, 3);
    }
}
