//! Schema Version Tracker
//!
//! A singleton row holds the fingerprint of the schema the database was
//! last migrated to. The fingerprint is stamped inside the same
//! transaction as the DDL batch, so version and schema always change
//! atomically: a crash before commit leaves the version unstamped,
//! correctly reflecting the unmigrated state.

use crate::error::AdminResult;
use graphmig_schema::GraphSchema;
use tokio_postgres::{Client, Transaction};

/// Fixed identifier of the singleton row.
pub const VERSION_ROW_ID: &str = "root";

const VERSION_TABLE_EXISTS_SQL: &str =
    "SELECT to_regclass('graph_schema_version') IS NOT NULL";

const CREATE_VERSION_TABLE_SQL: &str = "\
    CREATE TABLE IF NOT EXISTS graph_schema_version (\n\
    \x20   id TEXT PRIMARY KEY,\n\
    \x20   schema_hash TEXT NOT NULL\n\
    )";

const SELECT_VERSION_SQL: &str =
    "SELECT schema_hash FROM graph_schema_version WHERE id = $1";

const UPSERT_VERSION_SQL: &str = "\
    INSERT INTO graph_schema_version (id, schema_hash) VALUES ($1, $2)\n\
    ON CONFLICT (id) DO UPDATE SET schema_hash = EXCLUDED.schema_hash";

/// Whether a stored fingerprint matches the current one.
///
/// A missing record never matches: a database that does not track its
/// version yet must be migrated so the record gets created.
pub fn fingerprint_matches(stored: Option<&str>, current: &str) -> bool {
    stored == Some(current)
}

/// Decide whether the database needs migrating to `schema`.
///
/// True when the version table or the singleton record is absent, or when
/// the stored fingerprint differs from the schema's current one. False
/// only on an exact fingerprint match. Read-only; calling it repeatedly
/// without an intervening stamp returns the same answer.
pub async fn needs_migration(client: &Client, schema: &GraphSchema) -> AdminResult<bool> {
    let row = client.query_one(VERSION_TABLE_EXISTS_SQL, &[]).await?;
    let table_exists: bool = row.get(0);
    if !table_exists {
        tracing::debug!("no version table, migration needed");
        return Ok(true);
    }

    let stored: Option<String> = client
        .query_opt(SELECT_VERSION_SQL, &[&VERSION_ROW_ID])
        .await?
        .map(|row| row.get(0));

    let current = schema.fingerprint();
    let matches = fingerprint_matches(stored.as_deref(), &current);
    tracing::debug!(
        stored = stored.as_deref().unwrap_or("<none>"),
        current = %current,
        matches,
        "compared stored schema version"
    );
    Ok(!matches)
}

/// Stamp the current schema fingerprint onto the singleton record.
///
/// Merge-or-insert: the record is created on the first successful
/// migration and updated on every later one, inside the caller's DDL
/// transaction.
pub async fn stamp_version(txn: &Transaction<'_>, schema: &GraphSchema) -> AdminResult<()> {
    let fingerprint = schema.fingerprint();
    tracing::info!(fingerprint = %fingerprint, "stamping schema version");

    txn.batch_execute(CREATE_VERSION_TABLE_SQL).await?;
    txn.execute(UPSERT_VERSION_SQL, &[&VERSION_ROW_ID, &fingerprint])
        .await?;
    Ok(())
}
