use thiserror::Error;

/// Failures surfaced by the store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Optimistic update lost the race on every attempt in the budget.
    /// Commit status of the whole operation is unknown to the caller,
    /// who should retry the operation, not just the key update.
    #[error("update at {path} did not commit after {attempts} attempts")]
    Contention { path: String, attempts: u32 },

    #[error("store backend failure")]
    Backend(#[from] anyhow::Error),
}

/// Failures surfaced by allocation operations.
#[derive(Error, Debug)]
pub enum AllocError {
    /// The worker already holds an active bundle for this region.
    #[error("worker {worker} already has an active bundle for region {region}")]
    Conflict { worker: String, region: String },

    /// The targeted active bundle, worker, or partition does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Worker directory lookup failed (collaborator outage, not a miss).
    #[error("worker directory lookup failed")]
    Directory(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, AllocError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AllocError::NotFound(_))
    }
}
