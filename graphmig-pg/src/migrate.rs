//! Migration Orchestrator
//!
//! A retry state machine around the DDL batch. Each attempt runs the full
//! batch (tables, index reconciliation, version stamp) in one transaction
//! under a bounded database-side lock-wait timeout. On a lock timeout the
//! orchestrator either backs off and retries (patient path) or escalates
//! to terminating the blocking sessions (force-kill path). Non-timeout
//! database errors are fatal and propagate immediately.
//!
//! The force-kill path runs the batch on a spawned worker while this task
//! waits: the blocking-session query only sees lock waits that are still
//! in progress, so a single-threaded attempt-then-inspect would never
//! observe itself as blocked. The worker's sessions carry the
//! orchestrator's application-name tag, which is what the lock monitor
//! filters on.
//!
//! Correctness under concurrent orchestrator instances is not guaranteed:
//! two instances can retry-loop against each other's DDL locks. Accepted
//! limitation.

use crate::config::{generate_app_name, AdminConfig};
use crate::ddl::PgDdlTarget;
use crate::error::{AdminError, AdminResult};
use crate::locks::{PgSessionControl, SessionControl, SessionTerminator};
use async_trait::async_trait;
use graphmig_schema::GraphSchema;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// SETTINGS AND ATTEMPT STATE
// ============================================================================

/// Tuning for one migration invocation.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// How long the database may wait for a DDL lock before an attempt is
    /// declared timed out; also the back-off sleep between patient retries
    /// and the caller-side wait on the force-kill path.
    pub lock_timeout: Duration,
    /// How many retries are allowed after the initial attempt.
    pub max_retries: u32,
    /// Whether to terminate blocking sessions instead of backing off.
    pub force_kill: bool,
    /// How long to give the worker after blockers were terminated before
    /// the cycle is restarted.
    pub kill_grace: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            max_retries: 10,
            force_kill: false,
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl MigrationSettings {
    /// Build settings from CLI-level knobs, reading the kill grace period
    /// from `GRAPHMIG_KILL_GRACE_SECS` (default: 5).
    pub fn new(delay_secs: u64, max_retries: u32, force_kill: bool) -> Self {
        let kill_grace = Duration::from_secs(
            std::env::var("GRAPHMIG_KILL_GRACE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        );
        Self {
            lock_timeout: Duration::from_secs(delay_secs),
            max_retries,
            force_kill,
            kill_grace,
        }
    }
}

/// Transient per-invocation state. Owned exclusively by the runner for the
/// duration of one top-level `run` call; never persisted.
#[derive(Debug)]
struct MigrationAttempt {
    timeout: Duration,
    attempts_remaining: u32,
    force_kill: bool,
}

impl MigrationAttempt {
    fn new(settings: &MigrationSettings) -> Self {
        Self {
            timeout: settings.lock_timeout,
            attempts_remaining: settings.max_retries,
            force_kill: settings.force_kill,
        }
    }

    /// Consume one retry from the budget. False when the budget is spent.
    fn next_retry(&mut self) -> bool {
        if self.attempts_remaining == 0 {
            return false;
        }
        self.attempts_remaining -= 1;
        true
    }
}

// ============================================================================
// MIGRATION TARGET SEAM
// ============================================================================

/// The DDL batch a migration runs, plus the version check that decides
/// whether to run it at all.
///
/// Production uses [`PgDdlTarget`]; tests substitute fakes that time out
/// deterministically.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Whether the stored schema version differs from the current schema.
    async fn needs_migration(&self) -> AdminResult<bool>;

    /// Run the full DDL batch once, in one transaction, with the given
    /// lock-wait timeout applied. Must be safe to call again after a
    /// lock-timeout failure: each call is a fresh transaction.
    async fn run_once(&self, lock_timeout: Duration) -> AdminResult<()>;
}

// ============================================================================
// RUNNER
// ============================================================================

/// Orchestrates a lock-aware schema migration.
pub struct MigrationRunner<T: MigrationTarget> {
    target: Arc<T>,
    control: Arc<dyn SessionControl>,
    terminator: SessionTerminator,
    settings: MigrationSettings,
    app_name: String,
}

impl MigrationRunner<PgDdlTarget> {
    /// Wire a runner against a live database.
    ///
    /// Generates the application-name tag for this orchestrator instance
    /// and threads it through every connection the runner (and its DDL
    /// worker) will open.
    pub fn connect(
        config: &AdminConfig,
        schema: Arc<GraphSchema>,
        settings: MigrationSettings,
    ) -> AdminResult<Self> {
        let app_name = generate_app_name();
        let pool = config.create_pool(&app_name)?;
        let target = Arc::new(PgDdlTarget::new(pool.clone(), schema));
        let control: Arc<dyn SessionControl> = Arc::new(PgSessionControl::new(pool));
        Ok(Self::with_parts(
            target,
            control,
            config.no_kill.clone(),
            app_name,
            settings,
        ))
    }
}

impl<T: MigrationTarget + 'static> MigrationRunner<T> {
    /// Assemble a runner from its collaborators. Used directly by tests.
    pub fn with_parts(
        target: Arc<T>,
        control: Arc<dyn SessionControl>,
        no_kill: Vec<String>,
        app_name: String,
        settings: MigrationSettings,
    ) -> Self {
        let terminator = SessionTerminator::new(Arc::clone(&control), no_kill);
        Self {
            target,
            control,
            terminator,
            settings,
            app_name,
        }
    }

    /// The session tag this runner's connections carry.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Run the migration to completion, honoring the retry budget.
    pub async fn run(&self) -> AdminResult<()> {
        if !self.target.needs_migration().await? {
            tracing::info!(
                app_name = %self.app_name,
                "schema already at current version, nothing to do"
            );
            return Ok(());
        }

        tracing::info!(
            app_name = %self.app_name,
            timeout_secs = self.settings.lock_timeout.as_secs(),
            max_retries = self.settings.max_retries,
            force_kill = self.settings.force_kill,
            "starting schema migration"
        );

        let mut attempt = MigrationAttempt::new(&self.settings);
        if attempt.force_kill {
            self.run_forced(&mut attempt).await
        } else {
            self.run_patient(&mut attempt).await
        }
    }

    /// Back-off path: attempt, and on lock timeout sleep out the delay
    /// before trying again.
    async fn run_patient(&self, attempt: &mut MigrationAttempt) -> AdminResult<()> {
        loop {
            match self.target.run_once(attempt.timeout).await {
                Ok(()) => {
                    tracing::info!("migration committed");
                    return Ok(());
                }
                Err(err) if err.is_lock_timeout() => {
                    tracing::warn!(
                        timeout_secs = attempt.timeout.as_secs(),
                        "DDL attempt timed out waiting for locks"
                    );
                    if !attempt.next_retry() {
                        return Err(AdminError::RetriesExhausted {
                            attempts: self.settings.max_retries,
                        });
                    }
                    tracing::info!(
                        delay_secs = attempt.timeout.as_secs(),
                        retries_remaining = attempt.attempts_remaining,
                        "trying again after delay"
                    );
                    tokio::time::sleep(attempt.timeout).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Kill path: run the batch on a worker, and if it is still waiting
    /// once the delay elapses, terminate whatever is blocking our tag.
    async fn run_forced(&self, attempt: &mut MigrationAttempt) -> AdminResult<()> {
        'cycle: loop {
            let target = Arc::clone(&self.target);
            let lock_timeout = attempt.timeout;
            let mut worker: JoinHandle<AdminResult<()>> =
                tokio::spawn(async move { target.run_once(lock_timeout).await });

            // Give the worker the full delay to finish on its own.
            if let Ok(joined) = tokio::time::timeout(attempt.timeout, &mut worker).await {
                match Self::worker_result(joined) {
                    WorkerVerdict::Done(result) => return result,
                    WorkerVerdict::Retry => {
                        if !attempt.next_retry() {
                            return Err(AdminError::RetriesExhausted {
                                attempts: self.settings.max_retries,
                            });
                        }
                        continue 'cycle;
                    }
                }
            }

            tracing::warn!(
                waited_secs = attempt.timeout.as_secs(),
                app_name = %self.app_name,
                "DDL worker still waiting for locks, inspecting blocking sessions"
            );
            let blockers = match self.control.find_blockers(&self.app_name).await {
                Ok(blockers) => blockers,
                Err(err) => return Err(Self::reap_worker(worker, err).await),
            };
            if blockers.is_empty() {
                tracing::info!("no blocking sessions found");
            } else {
                match self.terminator.terminate(&blockers).await {
                    Ok(_) => {}
                    Err(AdminError::ProtectedByNoKill { .. }) => {
                        // Batch spared. The worker keeps waiting and the
                        // cycle falls through to the grace period.
                    }
                    Err(err) => return Err(Self::reap_worker(worker, err).await),
                }
            }

            // Grace period for the worker to proceed now that (ideally)
            // the locks are free.
            match tokio::time::timeout(self.settings.kill_grace, &mut worker).await {
                Ok(joined) => match Self::worker_result(joined) {
                    WorkerVerdict::Done(result) => return result,
                    WorkerVerdict::Retry => {
                        if !attempt.next_retry() {
                            return Err(AdminError::RetriesExhausted {
                                attempts: self.settings.max_retries,
                            });
                        }
                    }
                },
                Err(_) => {
                    worker.abort();
                    let _ = (&mut worker).await;
                    if !attempt.next_retry() {
                        return Err(AdminError::RetriesExhausted {
                            attempts: self.settings.max_retries,
                        });
                    }
                    tracing::warn!(
                        retries_remaining = attempt.attempts_remaining,
                        "worker still blocked after kill grace period, restarting cycle"
                    );
                }
            }
        }
    }

    /// Abort and drain the DDL worker before surfacing `err`. Dropping the
    /// handle alone would detach the task and let the migration commit in
    /// the background after the caller has already seen a failure.
    async fn reap_worker(worker: JoinHandle<AdminResult<()>>, err: AdminError) -> AdminError {
        worker.abort();
        let _ = worker.await;
        err
    }

    /// Fold a joined worker result into a verdict. A finished worker's
    /// success or fatal error always propagates to the original caller;
    /// only lock timeouts feed back into the retry budget.
    fn worker_result(
        joined: Result<AdminResult<()>, tokio::task::JoinError>,
    ) -> WorkerVerdict {
        match joined {
            Ok(Ok(())) => {
                tracing::info!("migration committed");
                WorkerVerdict::Done(Ok(()))
            }
            Ok(Err(err)) if err.is_lock_timeout() => {
                tracing::warn!("DDL worker timed out waiting for locks");
                WorkerVerdict::Retry
            }
            Ok(Err(err)) => WorkerVerdict::Done(Err(err)),
            Err(join_err) => {
                WorkerVerdict::Done(Err(AdminError::Worker(join_err.to_string())))
            }
        }
    }
}

enum WorkerVerdict {
    Done(AdminResult<()>),
    Retry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::BlockingSession;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    /// Target that always times out, counting attempts.
    struct AlwaysBlocked {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl MigrationTarget for AlwaysBlocked {
        async fn needs_migration(&self) -> AdminResult<bool> {
            Ok(true)
        }

        async fn run_once(&self, _lock_timeout: Duration) -> AdminResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(AdminError::LockTimeout)
        }
    }

    /// Target that hangs until released, then commits.
    struct BlockedUntilReleased {
        released: Arc<Notify>,
        attempts: AtomicU32,
        commits: AtomicU32,
    }

    impl BlockedUntilReleased {
        fn new(released: Arc<Notify>) -> Self {
            Self {
                released,
                attempts: AtomicU32::new(0),
                commits: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MigrationTarget for BlockedUntilReleased {
        async fn needs_migration(&self) -> AdminResult<bool> {
            Ok(true)
        }

        async fn run_once(&self, _lock_timeout: Duration) -> AdminResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.released.notified().await;
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Target that fails with a fatal error.
    struct FatallyBroken;

    #[async_trait]
    impl MigrationTarget for FatallyBroken {
        async fn needs_migration(&self) -> AdminResult<bool> {
            Ok(true)
        }

        async fn run_once(&self, _lock_timeout: Duration) -> AdminResult<()> {
            Err(AdminError::Worker("relation is malformed".to_string()))
        }
    }

    /// Target that reports nothing to do.
    struct UpToDate {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl MigrationTarget for UpToDate {
        async fn needs_migration(&self) -> AdminResult<bool> {
            Ok(false)
        }

        async fn run_once(&self, _lock_timeout: Duration) -> AdminResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Session control reporting a fixed blocker set; terminating releases
    /// the paired target.
    struct FakeSessions {
        blockers: Vec<BlockingSession>,
        terminated: Mutex<Vec<i32>>,
        release_on_kill: Option<Arc<Notify>>,
        fail_find: bool,
    }

    #[async_trait]
    impl SessionControl for FakeSessions {
        async fn find_blockers(&self, _app_name: &str) -> AdminResult<Vec<BlockingSession>> {
            if self.fail_find {
                return Err(AdminError::Worker("pg_locks query failed".to_string()));
            }
            Ok(self.blockers.clone())
        }

        async fn terminate_backend(&self, pid: i32) -> AdminResult<bool> {
            self.terminated.lock().unwrap().push(pid);
            if let Some(release) = &self.release_on_kill {
                release.notify_one();
            }
            Ok(true)
        }
    }

    fn blocker(app: &str, pid: i32) -> BlockingSession {
        BlockingSession {
            blocked_app: "table_creator_9999".to_string(),
            blocked_pid: 7,
            blocking_app: app.to_string(),
            blocking_pid: pid,
            blocking_statement: "UPDATE node_case SET _props = _props".to_string(),
        }
    }

    fn fast_settings(max_retries: u32, force_kill: bool) -> MigrationSettings {
        MigrationSettings {
            lock_timeout: Duration::from_millis(20),
            max_retries,
            force_kill,
            kill_grace: Duration::from_millis(20),
        }
    }

    fn no_sessions() -> Arc<dyn SessionControl> {
        Arc::new(FakeSessions {
            blockers: Vec::new(),
            terminated: Mutex::new(Vec::new()),
            release_on_kill: None,
            fail_find: false,
        })
    }

    fn runner<T: MigrationTarget + 'static>(
        target: Arc<T>,
        control: Arc<dyn SessionControl>,
        no_kill: Vec<String>,
        settings: MigrationSettings,
    ) -> MigrationRunner<T> {
        MigrationRunner::with_parts(
            target,
            control,
            no_kill,
            "table_creator_9999".to_string(),
            settings,
        )
    }

    // ------------------------------------------------------------------
    // Patient path
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn patient_path_exhausts_exact_retry_budget() {
        let target = Arc::new(AlwaysBlocked {
            attempts: AtomicU32::new(0),
        });
        let r = runner(target.clone(), no_sessions(), Vec::new(), fast_settings(3, false));

        let err = r.run().await.unwrap_err();
        assert!(matches!(err, AdminError::RetriesExhausted { attempts: 3 }));
        // Initial attempt plus exactly three retries.
        assert_eq!(target.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn patient_path_with_zero_retries_attempts_once() {
        let target = Arc::new(AlwaysBlocked {
            attempts: AtomicU32::new(0),
        });
        let r = runner(target.clone(), no_sessions(), Vec::new(), fast_settings(0, false));

        let err = r.run().await.unwrap_err();
        assert!(matches!(err, AdminError::RetriesExhausted { attempts: 0 }));
        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let r = runner(
            Arc::new(FatallyBroken),
            no_sessions(),
            Vec::new(),
            fast_settings(5, false),
        );

        let err = r.run().await.unwrap_err();
        assert!(matches!(err, AdminError::Worker(_)));
    }

    #[tokio::test]
    async fn up_to_date_schema_runs_no_ddl() {
        let target = Arc::new(UpToDate {
            attempts: AtomicU32::new(0),
        });
        let r = runner(target.clone(), no_sessions(), Vec::new(), fast_settings(5, false));

        r.run().await.unwrap();
        assert_eq!(target.attempts.load(Ordering::SeqCst), 0);
    }

    // ------------------------------------------------------------------
    // Force-kill path
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn force_kill_terminates_blockers_and_propagates_worker_success() {
        let released = Arc::new(Notify::new());
        let target = Arc::new(BlockedUntilReleased::new(released.clone()));
        let sessions = Arc::new(FakeSessions {
            blockers: vec![blocker("etl_loader", 31)],
            terminated: Mutex::new(Vec::new()),
            release_on_kill: Some(released),
            fail_find: false,
        });

        let r = runner(
            target.clone(),
            sessions.clone(),
            Vec::new(),
            fast_settings(2, true),
        );

        r.run().await.unwrap();
        assert_eq!(*sessions.terminated.lock().unwrap(), vec![31]);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(target.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_kill_respects_no_kill_list_and_exhausts_budget() {
        let released = Arc::new(Notify::new());
        let target = Arc::new(BlockedUntilReleased::new(released.clone()));
        let sessions = Arc::new(FakeSessions {
            blockers: vec![blocker("critical_api", 31)],
            terminated: Mutex::new(Vec::new()),
            release_on_kill: Some(released),
            fail_find: false,
        });

        let r = runner(
            target.clone(),
            sessions.clone(),
            vec!["critical_api".to_string()],
            fast_settings(2, true),
        );

        let err = r.run().await.unwrap_err();
        assert!(matches!(err, AdminError::RetriesExhausted { attempts: 2 }));
        // The protected blocker was never terminated, so the worker never
        // got released and every cycle re-spawned it.
        assert!(sessions.terminated.lock().unwrap().is_empty());
        assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn force_kill_propagates_fatal_worker_errors() {
        let r = runner(
            Arc::new(FatallyBroken),
            no_sessions(),
            Vec::new(),
            fast_settings(4, true),
        );

        let err = r.run().await.unwrap_err();
        assert!(matches!(err, AdminError::Worker(_)));
    }

    #[tokio::test]
    async fn fatal_inspection_errors_reap_the_ddl_worker() {
        let released = Arc::new(Notify::new());
        let target = Arc::new(BlockedUntilReleased::new(released.clone()));
        let sessions = Arc::new(FakeSessions {
            blockers: Vec::new(),
            terminated: Mutex::new(Vec::new()),
            release_on_kill: None,
            fail_find: true,
        });

        let r = runner(target.clone(), sessions, Vec::new(), fast_settings(2, true));

        let err = r.run().await.unwrap_err();
        assert!(matches!(err, AdminError::Worker(_)));
        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);

        // The worker must have been aborted along with the failure, so
        // releasing its lock now cannot let the migration commit behind
        // the caller's back.
        released.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(target.commits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn force_kill_retries_worker_lock_timeouts() {
        let target = Arc::new(AlwaysBlocked {
            attempts: AtomicU32::new(0),
        });
        let r = runner(target.clone(), no_sessions(), Vec::new(), fast_settings(2, true));

        let err = r.run().await.unwrap_err();
        assert!(matches!(err, AdminError::RetriesExhausted { attempts: 2 }));
        assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
    }
}
