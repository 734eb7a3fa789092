#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string for the sqlx-backed store.
    pub database_url: String,

    // =========================
    // Store configuration
    // =========================
    /// Upper bound on optimistic-update attempts per key.
    ///
    /// Every counter mutation is a read-modify-write that commits only if
    /// the key is unchanged since the read. Under contention the store
    /// retries internally; once this budget is exhausted the failure is
    /// surfaced to the caller as a transient store error.
    ///
    /// IMPORTANT:
    /// - This bounds latency per operation, not correctness.
    /// - Too low => spurious transient failures under bursty assignment.
    pub store_max_attempts: u32,

    /// Threshold (in milliseconds) above which a single store round-trip
    /// is logged as a slow operation.
    pub slow_store_warn_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://allocator_dev.db".to_string());

        Self {
            database_url,

            // Store defaults:
            // - generous retry budget; counter closures are cheap
            // - 50ms is already an outlier for a single-key round-trip
            store_max_attempts: 16,
            slow_store_warn_ms: 50,
        }
    }
}
