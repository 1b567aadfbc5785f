//! Lock Monitor and Session Terminator
//!
//! The lock monitor joins `pg_locks` against itself on every conflicting
//! lock attribute to find which sessions hold the locks our tagged DDL
//! session is waiting on. The terminator then ends those sessions by pid,
//! unless any of them carries an application name on the no-kill list, in
//! which case the entire batch is spared (all-or-nothing: a protected
//! blocker makes killing the others pointless, the lock queue is still
//! held up).
//!
//! Blocker information is read fresh from the system views on every call
//! and never persisted.

use crate::error::{AdminError, AdminResult};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::HashSet;
use std::sync::Arc;

/// One session blocking our tagged DDL session, as reported by the system
/// catalogs at a single point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingSession {
    /// Application name of the blocked (our) session.
    pub blocked_app: String,
    /// Backend pid of the blocked session.
    pub blocked_pid: i32,
    /// Application name of the session holding the conflicting lock.
    pub blocking_app: String,
    /// Backend pid of the blocking session.
    pub blocking_pid: i32,
    /// The statement the blocking session is (or was last) running.
    pub blocking_statement: String,
}

/// Self-join of `pg_locks` on conflicting lock attributes, excluding
/// self-blocking, restricted to sessions blocked under our application
/// name. Lock columns are nullable depending on locktype, hence the
/// `IS NOT DISTINCT FROM` comparisons.
const FIND_BLOCKERS_SQL: &str = "\
    SELECT COALESCE(blocked_activity.application_name, '') AS blocked_app,\n\
    \x20      blocked_locks.pid AS blocked_pid,\n\
    \x20      COALESCE(blocking_activity.application_name, '') AS blocking_app,\n\
    \x20      blocking_locks.pid AS blocking_pid,\n\
    \x20      COALESCE(blocking_activity.query, '') AS blocking_statement\n\
    FROM pg_catalog.pg_locks blocked_locks\n\
    JOIN pg_catalog.pg_stat_activity blocked_activity\n\
    \x20    ON blocked_activity.pid = blocked_locks.pid\n\
    JOIN pg_catalog.pg_locks blocking_locks\n\
    \x20    ON blocking_locks.locktype = blocked_locks.locktype\n\
    \x20   AND blocking_locks.database IS NOT DISTINCT FROM blocked_locks.database\n\
    \x20   AND blocking_locks.relation IS NOT DISTINCT FROM blocked_locks.relation\n\
    \x20   AND blocking_locks.page IS NOT DISTINCT FROM blocked_locks.page\n\
    \x20   AND blocking_locks.tuple IS NOT DISTINCT FROM blocked_locks.tuple\n\
    \x20   AND blocking_locks.virtualxid IS NOT DISTINCT FROM blocked_locks.virtualxid\n\
    \x20   AND blocking_locks.transactionid IS NOT DISTINCT FROM blocked_locks.transactionid\n\
    \x20   AND blocking_locks.classid IS NOT DISTINCT FROM blocked_locks.classid\n\
    \x20   AND blocking_locks.objid IS NOT DISTINCT FROM blocked_locks.objid\n\
    \x20   AND blocking_locks.objsubid IS NOT DISTINCT FROM blocked_locks.objsubid\n\
    \x20   AND blocking_locks.pid != blocked_locks.pid\n\
    JOIN pg_catalog.pg_stat_activity blocking_activity\n\
    \x20    ON blocking_activity.pid = blocking_locks.pid\n\
    WHERE NOT blocked_locks.granted\n\
    \x20 AND blocked_activity.application_name = $1\n\
    ORDER BY blocking_locks.pid";

// ============================================================================
// SESSION CONTROL SEAM
// ============================================================================

/// Read and control database sessions.
///
/// The seam between the orchestrator's kill protocol and the live
/// database: production uses [`PgSessionControl`], tests substitute an
/// in-memory fake.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Find the sessions currently blocking sessions tagged `app_name`.
    /// An empty result means nothing is blocking, not an error.
    async fn find_blockers(&self, app_name: &str) -> AdminResult<Vec<BlockingSession>>;

    /// Force-terminate a backend by pid. Returns whether the backend was
    /// actually signalled (false when it was already gone).
    async fn terminate_backend(&self, pid: i32) -> AdminResult<bool>;
}

/// [`SessionControl`] backed by the live system catalogs.
pub struct PgSessionControl {
    pool: Pool,
}

impl PgSessionControl {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionControl for PgSessionControl {
    async fn find_blockers(&self, app_name: &str) -> AdminResult<Vec<BlockingSession>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(FIND_BLOCKERS_SQL, &[&app_name]).await?;

        let blockers = rows
            .iter()
            .map(|row| BlockingSession {
                blocked_app: row.get("blocked_app"),
                blocked_pid: row.get("blocked_pid"),
                blocking_app: row.get("blocking_app"),
                blocking_pid: row.get("blocking_pid"),
                blocking_statement: row.get("blocking_statement"),
            })
            .collect();
        Ok(blockers)
    }

    async fn terminate_backend(&self, pid: i32) -> AdminResult<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one("SELECT pg_terminate_backend($1)", &[&pid])
            .await?;
        Ok(row.get(0))
    }
}

// ============================================================================
// SESSION TERMINATOR
// ============================================================================

/// Terminates blocking sessions, honoring the no-kill allowlist.
pub struct SessionTerminator {
    control: Arc<dyn SessionControl>,
    no_kill: HashSet<String>,
}

impl SessionTerminator {
    pub fn new(control: Arc<dyn SessionControl>, no_kill: impl IntoIterator<Item = String>) -> Self {
        Self {
            control,
            no_kill: no_kill.into_iter().collect(),
        }
    }

    /// The first blocker whose application name is on the no-kill list,
    /// if any.
    pub fn protected_blocker<'a>(
        &self,
        blockers: &'a [BlockingSession],
    ) -> Option<&'a BlockingSession> {
        blockers
            .iter()
            .find(|b| self.no_kill.contains(&b.blocking_app))
    }

    /// Whether any blocker in the batch is protected by the no-kill list.
    pub fn is_protected(&self, blockers: &[BlockingSession]) -> bool {
        self.protected_blocker(blockers).is_some()
    }

    /// Terminate every session in the batch, returning how many backends
    /// were actually signalled.
    ///
    /// If any blocker is protected, no session in the batch is touched:
    /// the refusal is logged and surfaced as
    /// [`AdminError::ProtectedByNoKill`], which callers treat as non-fatal.
    /// Termination failures for individual backends are tolerated: a
    /// backend that is already gone has already freed its locks.
    pub async fn terminate(&self, blockers: &[BlockingSession]) -> AdminResult<usize> {
        if blockers.is_empty() {
            return Ok(0);
        }

        if let Some(protected) = self.protected_blocker(blockers) {
            tracing::warn!(
                app_name = %protected.blocking_app,
                pid = protected.blocking_pid,
                statement = %protected.blocking_statement,
                "blocking session is on the no-kill list, sparing the whole batch"
            );
            return Err(AdminError::ProtectedByNoKill {
                app_name: protected.blocking_app.clone(),
                pid: protected.blocking_pid,
            });
        }

        let mut terminated = 0;
        for blocker in blockers {
            tracing::info!(
                app_name = %blocker.blocking_app,
                pid = blocker.blocking_pid,
                statement = %blocker.blocking_statement,
                "terminating blocking session"
            );
            match self.control.terminate_backend(blocker.blocking_pid).await {
                Ok(true) => terminated += 1,
                Ok(false) => {
                    tracing::debug!(pid = blocker.blocking_pid, "backend already gone");
                }
                Err(err) => {
                    // The goal (freeing the lock) is likely already achieved.
                    tracing::debug!(
                        pid = blocker.blocking_pid,
                        error = %err,
                        "failed to terminate backend, continuing"
                    );
                }
            }
        }
        Ok(terminated)
    }
}
