//! Table Permission Grants
//!
//! Fixed SQL templates parameterized by table and role, applied to every
//! table in the schema. Table names come from validated schema descriptors
//! and role names are validated here, since neither can be bound as a
//! statement parameter in GRANT/REVOKE.

use crate::error::{AdminError, AdminResult};
use deadpool_postgres::Pool;
use graphmig_schema::{valid_ident, GraphSchema};

/// Idempotent read grant: skips tables the role can already SELECT from.
const GRANT_READ_SQL: &str = "\
    DO $$\n\
    BEGIN\n\
    \x20 IF NOT EXISTS (SELECT grantee\n\
    \x20   FROM information_schema.role_table_grants\n\
    \x20   WHERE table_name = '{table}' AND grantee = '{user}' AND privilege_type = 'SELECT') THEN\n\
    \x20     GRANT SELECT ON TABLE {table} TO {user};\n\
    \x20 END IF;\n\
    END $$;";

const GRANT_WRITE_SQL: &str =
    "GRANT SELECT, INSERT, UPDATE, DELETE ON TABLE {table} TO {user};";

/// Revoking read access revokes everything.
const REVOKE_READ_SQL: &str =
    "REVOKE SELECT, INSERT, UPDATE, DELETE ON TABLE {table} FROM {user};";

/// Revoking write access leaves read access in place.
const REVOKE_WRITE_SQL: &str =
    "REVOKE INSERT, UPDATE, DELETE ON TABLE {table} FROM {user};";

/// Grant read access on every schema table to `user`.
pub async fn grant_read(pool: &Pool, schema: &GraphSchema, user: &str) -> AdminResult<()> {
    tracing::info!(user, "granting read permissions on graph tables");
    execute_for_all_tables(pool, schema, GRANT_READ_SQL, user).await
}

/// Grant write (and read) access on every schema table to `user`.
pub async fn grant_write(pool: &Pool, schema: &GraphSchema, user: &str) -> AdminResult<()> {
    tracing::info!(user, "granting write permissions on graph tables");
    execute_for_all_tables(pool, schema, GRANT_WRITE_SQL, user).await
}

/// Revoke all access on every schema table from `user`.
pub async fn revoke_read(pool: &Pool, schema: &GraphSchema, user: &str) -> AdminResult<()> {
    tracing::info!(user, "revoking read permissions on graph tables");
    execute_for_all_tables(pool, schema, REVOKE_READ_SQL, user).await
}

/// Revoke write access on every schema table from `user`, keeping read.
pub async fn revoke_write(pool: &Pool, schema: &GraphSchema, user: &str) -> AdminResult<()> {
    tracing::info!(user, "revoking write permissions on graph tables");
    execute_for_all_tables(pool, schema, REVOKE_WRITE_SQL, user).await
}

/// Render `template` for every table in the schema and execute each
/// statement.
async fn execute_for_all_tables(
    pool: &Pool,
    schema: &GraphSchema,
    template: &str,
    user: &str,
) -> AdminResult<()> {
    if !valid_ident(user) {
        return Err(AdminError::InvalidRole(user.to_string()));
    }

    let conn = pool.get().await?;
    for table in schema.tables() {
        let statement = render(template, &table.name, user);
        tracing::debug!(table = %table.name, "applying permission statement");
        conn.batch_execute(&statement).await?;
    }
    Ok(())
}

fn render(template: &str, table: &str, user: &str) -> String {
    template.replace("{table}", table).replace("{user}", user)
}
