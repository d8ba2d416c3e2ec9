//! Postgres-backed [`MetricStore`].

use crate::data::models::MetricRecord;
use crate::data::{aggregates, metrics};
use crate::ingest::MetricStore;
use async_trait::async_trait;
use sqlx::PgPool;

#[derive(Clone)]
pub struct PgMetricStore {
    pool: PgPool,
}

impl PgMetricStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricStore for PgMetricStore {
    async fn upsert_batch(&self, records: &[MetricRecord]) -> anyhow::Result<u64> {
        metrics::upsert_batch(&self.pool, records).await
    }

    async fn refresh_aggregates(&self) -> anyhow::Result<()> {
        aggregates::refresh(&self.pool).await
    }
}
