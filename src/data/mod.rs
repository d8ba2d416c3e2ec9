//! Database models and queries.

pub mod aggregates;
pub mod districts;
pub mod kv;
pub mod metrics;
pub mod models;
pub mod store;
pub mod trends;

pub use store::PgMetricStore;
