use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Directory entry for a worker. The location anchors which partition the
/// worker's bundles and records live under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub location: String,
}

/// Lookup collaborator owned by the surrounding application.
#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    async fn get_worker(&self, worker_id: &str) -> anyhow::Result<Option<Worker>>;
}

/// Map-backed directory for wiring and tests.
#[derive(Default)]
pub struct StaticWorkerDirectory {
    workers: HashMap<String, Worker>,
}

impl StaticWorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>, location: impl Into<String>) -> Self {
        self.workers.insert(
            worker_id.into(),
            Worker {
                location: location.into(),
            },
        );
        self
    }
}

#[async_trait]
impl WorkerDirectory for StaticWorkerDirectory {
    async fn get_worker(&self, worker_id: &str) -> anyhow::Result<Option<Worker>> {
        Ok(self.workers.get(worker_id).cloned())
    }
}
