pub mod allocation;
pub mod config;
pub mod metrics;
pub mod record_id;
pub mod store;
pub mod worker;

pub mod error;
pub mod logger;
