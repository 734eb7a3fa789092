pub mod active;
pub mod counters;
pub mod model;
pub mod service;
