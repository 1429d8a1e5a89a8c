//! PostgreSQL sink for the metrics collectors.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use super::collector::{MetricCounts, MetricsSink, SinkError};

#[derive(Debug, thiserror::Error)]
pub enum MetricsDbError {
    #[error("invalid metrics table name {table:?}")]
    InvalidTable { table: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Table names are spliced into the statements, so only plain identifiers
/// are accepted.
fn valid_table_ident(table: &str) -> bool {
    !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \torg VARCHAR(50) NOT NULL,\n\
         \tdiscovered BIGINT NOT NULL,\n\
         \tdownloaded BIGINT NOT NULL,\n\
         \tupdated BIGINT NOT NULL,\n\
         \tfailed BIGINT NOT NULL\n\
         )"
    )
}

fn add_columns_sql(table: &str) -> String {
    format!(
        "ALTER TABLE {table} \
         ADD COLUMN IF NOT EXISTS discovered BIGINT, \
         ADD COLUMN IF NOT EXISTS downloaded BIGINT, \
         ADD COLUMN IF NOT EXISTS updated BIGINT, \
         ADD COLUMN IF NOT EXISTS failed BIGINT"
    )
}

fn insert_org_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (org, discovered, downloaded, updated, failed) \
         SELECT $1, 0, 0, 0, 0 \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE org = $1)"
    )
}

fn update_sql(table: &str) -> String {
    format!(
        "UPDATE {table} \
         SET discovered = $1, downloaded = $2, updated = $3, failed = $4 \
         WHERE org = $5"
    )
}

/// Connect to the metrics database and prepare it transactionally: create
/// the table if missing, add any missing counter columns, and seed a zeroed
/// row per organization.
pub async fn prepare_db(
    uri: &str,
    table: &str,
    orgs: &[String],
) -> Result<PgPool, MetricsDbError> {
    if !valid_table_ident(table) {
        return Err(MetricsDbError::InvalidTable {
            table: table.to_string(),
        });
    }

    let pool = PgPoolOptions::new().connect(uri).await?;

    let mut tx = pool.begin().await?;
    sqlx::query(&create_table_sql(table)).execute(&mut *tx).await?;
    sqlx::query(&add_columns_sql(table)).execute(&mut *tx).await?;
    for org in orgs {
        sqlx::query(&insert_org_sql(table))
            .bind(org)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    debug!(table, orgs = orgs.len(), "metrics database prepared");
    Ok(pool)
}

/// Sink writing counter snapshots with an idempotent per-org UPDATE.
pub struct DbSink {
    pool: PgPool,
    table: String,
}

impl DbSink {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl MetricsSink for DbSink {
    async fn flush(&self, org: &str, counters: MetricCounts) -> Result<(), SinkError> {
        sqlx::query(&update_sql(&self.table))
            .bind(counters.discovered as i64)
            .bind(counters.downloaded as i64)
            .bind(counters.updated as i64)
            .bind(counters.failed as i64)
            .bind(org)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_idents_are_validated() {
        assert!(valid_table_ident("githoard_metrics"));
        assert!(valid_table_ident("metrics2"));
        assert!(!valid_table_ident(""));
        assert!(!valid_table_ident("2metrics"));
        assert!(!valid_table_ident("metrics; DROP TABLE users"));
        assert!(!valid_table_ident("metrics-table"));
    }

    #[test]
    fn statements_reference_the_configured_table() {
        let sql = update_sql("githoard_metrics");
        assert!(sql.starts_with("UPDATE githoard_metrics SET"));
        assert!(sql.ends_with("WHERE org = $5"));

        let sql = insert_org_sql("githoard_metrics");
        assert!(sql.contains("WHERE NOT EXISTS"));
        assert!(sql.contains("SELECT $1, 0, 0, 0, 0"));

        assert!(create_table_sql("githoard_metrics").contains("CREATE TABLE IF NOT EXISTS githoard_metrics"));
        assert!(add_columns_sql("githoard_metrics").contains("ADD COLUMN IF NOT EXISTS failed"));
    }
}
