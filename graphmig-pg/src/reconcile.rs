//! Index Reconciler
//!
//! Diffs the indexes the schema declares against the indexes the database
//! actually has, creating missing ones and recreating ones whose
//! uniqueness constraint drifted. Planning is pure; application runs
//! inside the migration transaction, after the owning tables exist.

use crate::error::AdminResult;
use graphmig_schema::IndexSpec;
use std::collections::HashMap;
use tokio_postgres::Transaction;

/// Name -> uniqueness for every index currently in the database.
const EXISTING_INDEXES_SQL: &str = "\
    SELECT i.relname AS name, ix.indisunique AS is_unique\n\
    FROM pg_catalog.pg_class i\n\
    JOIN pg_catalog.pg_index ix ON i.oid = ix.indexrelid";

/// One decision of the reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexAction {
    /// The index does not exist yet.
    Create(IndexSpec),
    /// The index exists but its uniqueness differs; drop then recreate.
    Recreate(IndexSpec),
}

/// What a reconciliation pass actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub recreated: usize,
}

/// Compute the actions needed to make `existing` satisfy `desired`.
///
/// Indexes are independent of each other, so plan order follows desired
/// order. An index that exists with the desired uniqueness produces no
/// action; nothing is ever dropped unless its uniqueness differs.
pub fn plan_index_changes<'a>(
    desired: impl IntoIterator<Item = &'a IndexSpec>,
    existing: &HashMap<String, bool>,
) -> Vec<IndexAction> {
    desired
        .into_iter()
        .filter_map(|spec| match existing.get(&spec.name) {
            None => Some(IndexAction::Create(spec.clone())),
            Some(&is_unique) if is_unique != spec.unique => {
                Some(IndexAction::Recreate(spec.clone()))
            }
            Some(_) => None,
        })
        .collect()
}

/// Read the name -> uniqueness map for every index in the database.
pub async fn existing_index_uniqueness(
    txn: &Transaction<'_>,
) -> AdminResult<HashMap<String, bool>> {
    let rows = txn.query(EXISTING_INDEXES_SQL, &[]).await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("name"), row.get("is_unique")))
        .collect())
}

/// Bring the database's indexes in line with the schema's declared set.
///
/// The catalog is read once per pass; each planned action is then applied
/// within the surrounding migration transaction.
pub async fn reconcile_indexes<'a>(
    txn: &Transaction<'_>,
    desired: impl IntoIterator<Item = &'a IndexSpec>,
) -> AdminResult<ReconcileReport> {
    let existing = existing_index_uniqueness(txn).await?;
    let plan = plan_index_changes(desired, &existing);

    let mut report = ReconcileReport::default();
    for action in plan {
        match action {
            IndexAction::Create(spec) => {
                tracing::info!(index = %spec.name, table = %spec.table, unique = spec.unique, "creating missing index");
                txn.batch_execute(&spec.create_sql()).await?;
                report.created += 1;
            }
            IndexAction::Recreate(spec) => {
                tracing::info!(index = %spec.name, table = %spec.table, unique = spec.unique, "uniqueness changed, recreating index");
                txn.batch_execute(&spec.drop_sql()).await?;
                txn.batch_execute(&spec.create_sql()).await?;
                report.recreated += 1;
            }
        }
    }

    tracing::debug!(
        created = report.created,
        recreated = report.recreated,
        "index reconciliation complete"
    );
    Ok(report)
}
