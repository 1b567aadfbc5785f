//! graphmig: lock-aware PostgreSQL schema administration
//!
//! Stateful management of a graph model's PostgreSQL installation:
//! idempotent table and index creation, a content-hash schema version
//! stamped atomically with the DDL, and a retry state machine that detects
//! (and can terminate) sessions holding the locks a migration needs.
//!
//! Modules, leaves first:
//! - [`config`]: connection/policy configuration and the tagged pool
//! - [`error`]: the `AdminError` taxonomy and timeout classification
//! - [`locks`]: blocking-session detection and the kill protocol
//! - [`reconcile`]: desired-vs-existing index diffing
//! - [`version`]: the singleton schema-version record
//! - [`ddl`]: the transactional DDL batch
//! - [`migrate`]: the retry/backoff orchestrator tying it all together
//! - [`grants`]: per-table permission grant/revoke templating

pub mod config;
pub mod ddl;
pub mod error;
pub mod grants;
pub mod locks;
pub mod migrate;
pub mod reconcile;
pub mod version;

pub use config::{generate_app_name, AdminConfig, APP_NAME_ROOT};
pub use ddl::PgDdlTarget;
pub use error::{AdminError, AdminResult};
pub use locks::{BlockingSession, PgSessionControl, SessionControl, SessionTerminator};
pub use migrate::{MigrationRunner, MigrationSettings, MigrationTarget};
pub use reconcile::{plan_index_changes, IndexAction, ReconcileReport};
pub use version::{needs_migration, stamp_version, VERSION_ROW_ID};
