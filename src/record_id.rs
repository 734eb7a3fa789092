use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::instrument;

use crate::allocation::model::Partition;
use crate::error::StoreError;
use crate::store::AtomicStore;

/// Issues human-readable record identifiers, strictly sequential within a
/// partition: `PA` + `VA` + decimal sequence for ("palghar", "Vasai").
///
/// A batch of N records costs N sequential atomic increments. That is a
/// throughput bound, not a bug: identifiers must be partition-sequential.
pub struct RecordIdGenerator {
    store: Arc<dyn AtomicStore>,
}

fn partition_prefix(location: &str, region: &str) -> String {
    location
        .chars()
        .take(2)
        .chain(region.chars().take(2))
        .flat_map(char::to_uppercase)
        .collect()
}

impl RecordIdGenerator {
    pub fn new(store: Arc<dyn AtomicStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), target = "record_id")]
    pub async fn next(&self, location: &str, region: &str) -> Result<String, StoreError> {
        let partition = Partition::new(location, region);
        let issued = Mutex::new(None::<u64>);

        self.store
            .atomic_update(&partition.id_counter_path(), &|cur| {
                let last = match cur.as_ref() {
                    Some(v) => v.get("last_id").and_then(Value::as_u64),
                    None => Some(0),
                };
                match last {
                    Some(last) => {
                        let next = last + 1;
                        *issued.lock() = Some(next);
                        Some(json!({ "last_id": next }))
                    }
                    // A present but unreadable counter must not restart the
                    // sequence; keep it and report the failure below.
                    None => {
                        *issued.lock() = None;
                        cur
                    }
                }
            })
            .await?;

        let sequence = issued.lock().take().ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!(
                "malformed id counter at {}",
                partition.id_counter_path()
            ))
        })?;

        Ok(format!("{}{sequence}", partition_prefix(location, region)))
    }
}
