//! Admin Configuration
//!
//! Connection settings and orchestrator tuning, loaded from environment
//! variables with sensible defaults for development. Connectivity uses the
//! conventional `PG_*` variables; orchestrator tuning uses `GRAPHMIG_*`.
//!
//! There is no module-level mutable state: the session application-name tag
//! that lets the lock monitor tell the orchestrator's own sessions apart
//! from blockers is generated once per orchestrator and threaded through
//! the pool via `application_name`.

use crate::error::AdminResult;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use rand::Rng;
use tokio_postgres::NoTls;

/// Prefix of the per-orchestrator session tag.
pub const APP_NAME_ROOT: &str = "table_creator_";

/// Generate a fresh session application-name tag.
///
/// The four-digit suffix keeps concurrent invocations distinguishable in
/// `pg_stat_activity` without any coordination.
pub fn generate_app_name() -> String {
    let suffix: u16 = rand::rng().random_range(1000..10000);
    format!("{APP_NAME_ROOT}{suffix}")
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Database connection and admin policy configuration.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub pool_size: usize,
    /// Application names that must never be terminated, even when they are
    /// blocking a migration.
    pub no_kill: Vec<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            pool_size: 4,
            no_kill: Vec::new(),
        }
    }
}

impl AdminConfig {
    /// Create an AdminConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `PG_HOST`: PostgreSQL host (default: localhost)
    /// - `PG_PORT`: PostgreSQL port (default: 5432)
    /// - `PG_NAME`: Database name (default: postgres)
    /// - `PG_USER`: Database user (default: postgres)
    /// - `PG_PASS`: Database password (default: empty)
    /// - `GRAPHMIG_POOL_SIZE`: Maximum pool size (default: 4)
    /// - `GRAPHMIG_NO_KILL`: Comma-separated application names that must
    ///   never be terminated (default: empty)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("PG_HOST").unwrap_or(defaults.host),
            port: std::env::var("PG_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("PG_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("PG_USER").unwrap_or(defaults.user),
            password: std::env::var("PG_PASS").unwrap_or(defaults.password),
            pool_size: std::env::var("GRAPHMIG_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.pool_size),
            no_kill: no_kill_from_env(),
        }
    }

    /// Create a connection pool tagged with the given application name.
    ///
    /// Every connection the pool hands out carries the tag, so the lock
    /// monitor can find sessions blocked *on behalf of* this orchestrator
    /// by filtering `pg_stat_activity.application_name`.
    pub fn create_pool(&self, app_name: &str) -> AdminResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.application_name = Some(app_name.to_string());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(self.pool_size));

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(pool)
    }
}

fn no_kill_from_env() -> Vec<String> {
    std::env::var("GRAPHMIG_NO_KILL")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
