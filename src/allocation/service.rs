//! Bundle allocation orchestration.
//!
//! Responsibilities:
//! - Issue bundle numbers per partition (gap pool first, then counter head).
//! - Enforce at most one active bundle per worker per region.
//! - Recycle numbers abandoned via reset; retire completed ones.
//! - Issue partition-sequential record identifiers and store records.
//! - Admin overrides: force-complete, manual assign, full wipe.
//!
//! Non-responsibilities:
//! - HTTP routing, authentication, spreadsheet ingest/export, UI.
//! - Cross-partition ordering guarantees.
//! - Compensation for partially-applied multi-key writes.
//!
//! Concurrency:
//! - Every BundleCounter / IdCounter mutation goes through the store's
//!   single-key optimistic update.
//! - The assign-time existence check and all admin overwrites are plain
//!   get/set, NOT atomic with respect to counter updates. A worker firing
//!   two near-simultaneous assigns can pass the check twice; the second
//!   active-state write wins and no counter value is issued twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::allocation::active::ActiveBundles;
use crate::allocation::counters::BundleCounters;
use crate::allocation::model::{
    ACTIVE_ROOT, ActiveBundle, BundleAudit, BundleCounter, COUNTERS_ROOT, Partition,
    ProcessedRecord, RECORDS_ROOT,
};
use crate::error::{AllocError, StoreError};
use crate::logger::warn_if_slow;
use crate::metrics::counters::Counters;
use crate::record_id::RecordIdGenerator;
use crate::store::AtomicStore;
use crate::worker::{Worker, WorkerDirectory};

pub struct AllocationService {
    store: Arc<dyn AtomicStore>,
    directory: Arc<dyn WorkerDirectory>,
    counters: BundleCounters,
    active: ActiveBundles,
    ids: RecordIdGenerator,

    /// Threshold for flagging slow store round-trips.
    slow_warn: Duration,

    /// Observability counters (does not affect behavior).
    metrics: Counters,
}

impl AllocationService {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        directory: Arc<dyn WorkerDirectory>,
        slow_warn_ms: u64,
        metrics: Counters,
    ) -> Self {
        Self {
            counters: BundleCounters::new(store.clone()),
            active: ActiveBundles::new(store.clone()),
            ids: RecordIdGenerator::new(store.clone()),
            store,
            directory,
            slow_warn: Duration::from_millis(slow_warn_ms),
            metrics,
        }
    }

    async fn resolve_worker(&self, worker_id: &str) -> Result<Worker, AllocError> {
        self.directory
            .get_worker(worker_id)
            .await
            .map_err(AllocError::Directory)?
            .ok_or_else(|| AllocError::NotFound(format!("unknown worker: {worker_id}")))
    }

    /// Assigns the next bundle number in (location, region) to the worker.
    ///
    /// Fails with Conflict if the worker already holds an active bundle for
    /// the region. The existence check and the final state write are two
    /// separate operations around one atomic counter update; see the module
    /// docs for the resulting (accepted) race window.
    #[instrument(
        skip(self),
        target = "allocation",
        fields(worker = %worker_id, location = %location, region = %region)
    )]
    pub async fn assign(
        &self,
        worker_id: &str,
        location: &str,
        region: &str,
    ) -> Result<ActiveBundle, AllocError> {
        if self.active.get(worker_id, region).await?.is_some() {
            self.metrics
                .assign_conflicts
                .fetch_add(1, Ordering::Relaxed);
            warn!("worker already has an active bundle for this region");
            return Err(AllocError::Conflict {
                worker: worker_id.to_string(),
                region: region.to_string(),
            });
        }

        let partition = Partition::new(location, region);
        let (bundle_no, from_gap) = warn_if_slow("bundle_allocate", self.slow_warn, async {
            self.counters.allocate(&partition).await
        })
        .await?;

        let state = ActiveBundle::new(bundle_no, region);
        self.active.put(worker_id, &state).await?;

        self.metrics.assigns.fetch_add(1, Ordering::Relaxed);
        if from_gap {
            self.metrics.gap_reuses.fetch_add(1, Ordering::Relaxed);
        }

        info!(bundle_no, from_gap, "bundle assigned");
        Ok(state)
    }

    /// Finishes the worker's active bundle in the region. The number is
    /// permanently retired, not recycled.
    #[instrument(
        skip(self),
        target = "allocation",
        fields(worker = %worker_id, region = %region)
    )]
    pub async fn complete(&self, worker_id: &str, region: &str) -> Result<(), AllocError> {
        let Some(state) = self.active.get(worker_id, region).await? else {
            return Err(AllocError::NotFound(format!(
                "no active bundle for worker {worker_id} in region {region}"
            )));
        };

        self.active.delete(worker_id, region).await?;

        self.metrics.completes.fetch_add(1, Ordering::Relaxed);
        info!(bundle_no = state.bundle_no, "bundle completed");
        Ok(())
    }

    /// Admin: abandons the worker's active bundle, deletes its records, and
    /// returns the number to the partition's gap pool.
    ///
    /// The record deletion + state deletion go out as one best-effort
    /// multi-path update, then the counter is updated atomically. A crash
    /// in between can leave the number neither held nor recycled; that
    /// needs manual admin correction, by contract.
    #[instrument(
        skip(self),
        target = "allocation",
        fields(worker = %worker_id, region = %region)
    )]
    pub async fn reset(&self, worker_id: &str, region: &str) -> Result<u64, AllocError> {
        let worker = self.resolve_worker(worker_id).await?;

        let Some(state) = self.active.get(worker_id, region).await? else {
            return Err(AllocError::NotFound(format!(
                "no active bundle for worker {worker_id} in region {region}"
            )));
        };

        let partition = Partition::new(&worker.location, region);
        let container = format!("{}/", partition.bundle_container_path(state.bundle_no));

        let mut changes: HashMap<String, Option<Value>> = HashMap::new();
        for (path, _) in self.store.scan_prefix(&container).await? {
            changes.insert(path, None);
        }
        changes.insert(
            crate::allocation::model::active_path(worker_id, region),
            None,
        );

        let discarded = changes.len() - 1;
        warn_if_slow("reset_multi_path", self.slow_warn, async {
            self.store.multi_path_update(changes).await
        })
        .await?;

        self.counters.recycle(&partition, state.bundle_no).await?;

        self.metrics.resets.fetch_add(1, Ordering::Relaxed);
        info!(
            bundle_no = state.bundle_no,
            discarded_entries = discarded,
            "bundle reset and number recycled"
        );
        Ok(state.bundle_no)
    }

    /// Admin: permanently marks the bundle's record container as
    /// force-completed and, only if the worker still holds exactly this
    /// bundle, clears the active state. A worker that has since moved to a
    /// different bundle keeps its newer assignment untouched.
    ///
    /// The supplied `bundle_no` is trusted as-is; no referential check.
    /// The number is retired, not recycled.
    #[instrument(
        skip(self),
        target = "allocation",
        fields(worker = %worker_id, location = %location, region = %region, bundle_no)
    )]
    pub async fn force_complete(
        &self,
        worker_id: &str,
        location: &str,
        region: &str,
        bundle_no: u64,
    ) -> Result<(), AllocError> {
        let partition = Partition::new(location, region);

        let audit = BundleAudit {
            is_force_completed: true,
            force_completed_by: worker_id.to_string(),
        };
        let value = serde_json::to_value(&audit)
            .context("audit marker encode failed")
            .map_err(StoreError::from)?;
        self.store
            .set(&partition.bundle_meta_path(bundle_no), value)
            .await?;

        match self.active.get(worker_id, region).await? {
            Some(state) if state.bundle_no == bundle_no => {
                self.active.delete(worker_id, region).await?;
                info!("active state cleared by force-complete");
            }
            Some(state) => {
                debug!(
                    held_bundle = state.bundle_no,
                    "worker moved on; active state left untouched"
                );
            }
            None => {}
        }

        self.metrics.force_completes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Admin: overwrites the worker's active state with the given bundle
    /// number, whatever its current state. The bundle counter is neither
    /// consulted nor updated; colliding with a normally-issued number is
    /// the operator's call.
    #[instrument(
        skip(self),
        target = "allocation",
        fields(worker = %worker_id, region = %region, bundle_no)
    )]
    pub async fn manual_assign(
        &self,
        worker_id: &str,
        region: &str,
        bundle_no: u64,
    ) -> Result<ActiveBundle, AllocError> {
        let state = ActiveBundle::new(bundle_no, region);
        self.active.put(worker_id, &state).await?;

        self.metrics.manual_assigns.fetch_add(1, Ordering::Relaxed);
        info!("bundle manually assigned");
        Ok(state)
    }

    /// Every region in which the worker currently holds a bundle.
    pub async fn get_active_bundles(
        &self,
        worker_id: &str,
    ) -> Result<HashMap<String, ActiveBundle>, AllocError> {
        Ok(self.active.all_for_worker(worker_id).await?)
    }

    /// Read-only diagnostic snapshot of every partition's counter.
    pub async fn get_counters(&self) -> Result<HashMap<Partition, BundleCounter>, AllocError> {
        Ok(self.counters.snapshot().await?)
    }

    /// Issues the next record identifier for the partition.
    #[instrument(skip(self), target = "allocation")]
    pub async fn next_record_id(
        &self,
        location: &str,
        region: &str,
    ) -> Result<String, AllocError> {
        let id = self.ids.next(location, region).await?;
        self.metrics.ids_issued.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Stores a batch of records into the worker's active bundle.
    ///
    /// Identifier issuance is strictly sequential within the batch: no
    /// duplicates and no out-of-order ids inside it, no interleaving
    /// guarantee across batches beyond the store's single-key ordering.
    /// Returns the issued identifiers in submission order.
    #[instrument(
        skip(self, payloads),
        target = "allocation",
        fields(worker = %worker_id, region = %region, batch = payloads.len())
    )]
    pub async fn submit_records(
        &self,
        worker_id: &str,
        region: &str,
        source_file: &str,
        payloads: Vec<serde_json::Map<String, Value>>,
    ) -> Result<Vec<String>, AllocError> {
        let worker = self.resolve_worker(worker_id).await?;

        let Some(state) = self.active.get(worker_id, region).await? else {
            return Err(AllocError::NotFound(format!(
                "no active bundle for worker {worker_id} in region {region}"
            )));
        };

        let partition = Partition::new(&worker.location, region);
        let mut issued = Vec::with_capacity(payloads.len());

        for attrs in payloads {
            let unique_id = self.ids.next(&partition.location, &partition.region).await?;
            self.metrics.ids_issued.fetch_add(1, Ordering::Relaxed);

            let record = ProcessedRecord {
                unique_id: unique_id.clone(),
                bundle_no: state.bundle_no,
                processed_by: worker_id.to_string(),
                processed_at: Utc::now(),
                source_file: source_file.to_string(),
                region: region.to_string(),
                attrs,
            };
            let value = serde_json::to_value(&record)
                .context("record encode failed")
                .map_err(StoreError::from)?;

            self.store
                .set(&partition.record_path(state.bundle_no, &unique_id), value)
                .await?;
            self.metrics.records_written.fetch_add(1, Ordering::Relaxed);

            issued.push(unique_id);
        }

        // Single-writer state: the worker's own submissions serialize
        // through the caller, so a plain overwrite is sufficient.
        let mut updated = state;
        updated.count += issued.len() as u64;
        self.active.put(worker_id, &updated).await?;

        info!(
            bundle_no = updated.bundle_no,
            count = updated.count,
            "records submitted"
        );
        Ok(issued)
    }

    /// Admin, irreversible: deletes every processed record across all
    /// partitions. Counters and active states are untouched; see
    /// [`Self::wipe_allocations`] for those.
    #[instrument(skip(self), target = "allocation")]
    pub async fn wipe_records(&self) -> Result<(), AllocError> {
        let mut changes: HashMap<String, Option<Value>> = HashMap::new();
        for (path, _) in self.store.scan_prefix(RECORDS_ROOT).await? {
            changes.insert(path, None);
        }

        let dropped = changes.len();
        self.store.multi_path_update(changes).await?;

        warn!(dropped, "all processed records wiped");
        Ok(())
    }

    /// Admin, irreversible: deletes every bundle counter and active state
    /// across all partitions. Identifier counters are left in place so
    /// record ids stay unique across a wipe.
    #[instrument(skip(self), target = "allocation")]
    pub async fn wipe_allocations(&self) -> Result<(), AllocError> {
        let mut changes: HashMap<String, Option<Value>> = HashMap::new();
        for (path, _) in self.store.scan_prefix(COUNTERS_ROOT).await? {
            changes.insert(path, None);
        }
        for (path, _) in self.store.scan_prefix(ACTIVE_ROOT).await? {
            changes.insert(path, None);
        }

        let dropped = changes.len();
        self.store.multi_path_update(changes).await?;

        warn!(dropped, "all bundle counters and active states wiped");
        Ok(())
    }
}
