//! Read access to the `districts` reference table.

use crate::data::models::District;
use anyhow::{Context, Result};
use sqlx::PgPool;

pub async fn get(pool: &PgPool, id: i32) -> Result<Option<District>> {
    sqlx::query_as::<_, District>(
        "SELECT id, state_name, district_name, state_code, district_code \
         FROM districts WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("Failed to load district {id}"))
}

/// Districts ordered by state then name, optionally limited to one state.
pub async fn list(pool: &PgPool, state_name: Option<&str>) -> Result<Vec<District>> {
    sqlx::query_as::<_, District>(
        r#"
        SELECT id, state_name, district_name, state_code, district_code
        FROM districts
        WHERE $1::text IS NULL OR state_name = $1
        ORDER BY state_name, district_name
        "#,
    )
    .bind(state_name)
    .fetch_all(pool)
    .await
    .context("Failed to list districts")
}
