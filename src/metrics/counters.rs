use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub assigns: Arc<AtomicU64>,
    pub assign_conflicts: Arc<AtomicU64>,
    pub gap_reuses: Arc<AtomicU64>,

    pub completes: Arc<AtomicU64>,
    pub resets: Arc<AtomicU64>,
    pub force_completes: Arc<AtomicU64>,
    pub manual_assigns: Arc<AtomicU64>,

    pub ids_issued: Arc<AtomicU64>,
    pub records_written: Arc<AtomicU64>,
}
