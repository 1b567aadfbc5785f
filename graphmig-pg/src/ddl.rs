//! DDL Batch Target
//!
//! The production [`MigrationTarget`]: one attempt is one transaction that
//! applies the session-local lock-wait timeout, creates every table
//! idempotently (nodes before edges), reconciles indexes, and stamps the
//! schema version, in that order, so indexes always follow their owning
//! tables and the version record commits atomically with the DDL.

use crate::error::AdminResult;
use crate::migrate::MigrationTarget;
use crate::reconcile;
use crate::version;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use graphmig_schema::GraphSchema;
use std::sync::Arc;
use std::time::Duration;

/// Runs the schema DDL batch against a live database.
pub struct PgDdlTarget {
    pool: Pool,
    schema: Arc<GraphSchema>,
}

impl PgDdlTarget {
    pub fn new(pool: Pool, schema: Arc<GraphSchema>) -> Self {
        Self { pool, schema }
    }
}

#[async_trait]
impl MigrationTarget for PgDdlTarget {
    async fn needs_migration(&self) -> AdminResult<bool> {
        let conn = self.pool.get().await?;
        version::needs_migration(&conn, &self.schema).await
    }

    async fn run_once(&self, lock_timeout: Duration) -> AdminResult<()> {
        let mut conn = self.pool.get().await?;
        let txn = conn.transaction().await?;

        // One second of headroom so the database-side timeout fires after
        // the caller-side wait, not before it.
        let timeout_secs = lock_timeout.as_secs() + 1;
        tracing::info!(timeout_secs, "setting session-local lock_timeout");
        txn.batch_execute(&format!("SET LOCAL lock_timeout = '{timeout_secs}s'"))
            .await?;

        for table in self.schema.tables() {
            tracing::debug!(table = %table.name, "ensuring table exists");
            txn.batch_execute(&table.create_sql()).await?;
        }

        reconcile::reconcile_indexes(&txn, self.schema.indexes()).await?;
        version::stamp_version(&txn, &self.schema).await?;

        txn.commit().await?;
        Ok(())
    }
}
