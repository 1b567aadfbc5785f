//! graphmig CLI Entry Point
//!
//! Subcommands for idempotent schema creation and table permission
//! management. Connection flags default from the conventional `PG_*`
//! environment variables; the process exits non-zero on exhausted retries
//! or any fatal database error.

use clap::{ArgGroup, Args, Parser, Subcommand};
use graphmig_pg::{AdminConfig, AdminResult, MigrationRunner, MigrationSettings};
use graphmig_pg::grants;
use graphmig_schema::GraphSchema;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "graphmig", about = "Lock-aware PostgreSQL schema administration for graph data models", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Idempotently create all graph tables and indexes
    Create(CreateArgs),
    /// Create all graph tables and indexes, then apply permission grants
    CreateAll(CreateAllArgs),
    /// Grant read and/or write permissions to users
    Grant(GrantArgs),
    /// Revoke read and/or write permissions from users
    Revoke(RevokeArgs),
}

#[derive(Args, Debug)]
struct ConnArgs {
    /// PostgreSQL server host
    #[arg(short = 'H', long, env = "PG_HOST")]
    host: String,

    /// PostgreSQL user
    #[arg(short = 'U', long, env = "PG_USER")]
    user: String,

    /// PostgreSQL password
    #[arg(short = 'P', long, env = "PG_PASS", hide_env_values = true)]
    password: String,

    /// Database name
    #[arg(short = 'D', long, env = "PG_NAME")]
    database: String,

    /// PostgreSQL port
    #[arg(long, env = "PG_PORT", default_value_t = 5432)]
    port: u16,

    /// Path to the schema JSON document
    #[arg(long, env = "GRAPHMIG_SCHEMA")]
    schema: PathBuf,
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[command(flatten)]
    conn: ConnArgs,

    /// How many seconds to wait for blocking processes to finish before
    /// retrying (and terminating them when used with --force)
    #[arg(long, default_value_t = 60)]
    delay: u64,

    /// How many times to retry after waiting `delay` seconds
    #[arg(long, default_value_t = 10)]
    retries: u32,

    /// Terminate blocking processes that are not on the no-kill list
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct CreateAllArgs {
    #[command(flatten)]
    create: CreateArgs,

    /// Users to grant read access to (comma separated)
    #[arg(long)]
    read: Option<String>,

    /// Users to grant read/write access to (comma separated)
    #[arg(long)]
    write: Option<String>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("roles").required(true).multiple(true).args(["read", "write"])))]
struct GrantArgs {
    #[command(flatten)]
    conn: ConnArgs,

    /// Users to grant read access to (comma separated)
    #[arg(long)]
    read: Option<String>,

    /// Users to grant read/write access to (comma separated)
    #[arg(long)]
    write: Option<String>,
}

#[derive(Args, Debug)]
struct RevokeArgs {
    #[command(flatten)]
    conn: ConnArgs,

    /// Users to revoke read access from (comma separated)
    #[arg(long)]
    read: Option<String>,

    /// Users to revoke write access from (comma separated).
    /// NOTE: the user will still have read access
    #[arg(long)]
    write: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "graphmig failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> AdminResult<()> {
    match cli.command {
        Command::Create(args) => {
            run_migration(&args).await?;
        }
        Command::CreateAll(args) => {
            let (config, schema) = run_migration(&args.create).await?;
            apply_grants(&config, &schema, args.read.as_deref(), args.write.as_deref()).await?;
        }
        Command::Grant(args) => {
            let (config, schema) = load(&args.conn)?;
            apply_grants(&config, &schema, args.read.as_deref(), args.write.as_deref()).await?;
        }
        Command::Revoke(args) => {
            let (config, schema) = load(&args.conn)?;
            apply_revokes(&config, &schema, args.read.as_deref(), args.write.as_deref()).await?;
        }
    }
    tracing::info!("done");
    Ok(())
}

/// Build config and schema from the connection flags, logging the banner.
fn load(conn: &ConnArgs) -> AdminResult<(AdminConfig, Arc<GraphSchema>)> {
    let mut config = AdminConfig::from_env();
    config.host = conn.host.clone();
    config.port = conn.port;
    config.user = conn.user.clone();
    config.password = conn.password.clone();
    config.dbname = conn.database.clone();

    tracing::info!(
        host = %config.host,
        database = %config.dbname,
        user = %config.user,
        "graphmig starting"
    );

    let schema = Arc::new(GraphSchema::from_json_file(&conn.schema)?);
    Ok((config, schema))
}

async fn run_migration(args: &CreateArgs) -> AdminResult<(AdminConfig, Arc<GraphSchema>)> {
    let (config, schema) = load(&args.conn)?;
    let settings = MigrationSettings::new(args.delay, args.retries, args.force);
    let runner = MigrationRunner::connect(&config, Arc::clone(&schema), settings)?;
    tracing::info!(app_name = %runner.app_name(), "running table creator");
    runner.run().await?;
    Ok((config, schema))
}

async fn apply_grants(
    config: &AdminConfig,
    schema: &GraphSchema,
    read: Option<&str>,
    write: Option<&str>,
) -> AdminResult<()> {
    let pool = config.create_pool("graphmig_grants")?;
    for user in split_users(read) {
        grants::grant_read(&pool, schema, &user).await?;
    }
    for user in split_users(write) {
        grants::grant_write(&pool, schema, &user).await?;
    }
    Ok(())
}

async fn apply_revokes(
    config: &AdminConfig,
    schema: &GraphSchema,
    read: Option<&str>,
    write: Option<&str>,
) -> AdminResult<()> {
    let pool = config.create_pool("graphmig_grants")?;
    for user in split_users(read) {
        grants::revoke_read(&pool, schema, &user).await?;
    }
    for user in split_users(write) {
        grants::revoke_write(&pool, schema, &user).await?;
    }
    Ok(())
}

fn split_users(list: Option<&str>) -> Vec<String> {
    list.map(|s| {
        s.split(',')
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_users_drops_empties_and_whitespace() {
        assert_eq!(
            split_users(Some("alice, bob,,carol ")),
            vec!["alice", "bob", "carol"]
        );
        assert!(split_users(Some("")).is_empty());
        assert!(split_users(None).is_empty());
    }

    #[test]
    fn cli_parses_create_with_force() {
        let cli = Cli::try_parse_from([
            "graphmig",
            "create",
            "-H", "localhost",
            "-U", "admin",
            "-P", "secret",
            "-D", "graphdb",
            "--schema", "schema.json",
            "--delay", "5",
            "--retries", "2",
            "--force",
        ])
        .unwrap();

        match cli.command {
            Command::Create(args) => {
                assert_eq!(args.delay, 5);
                assert_eq!(args.retries, 2);
                assert!(args.force);
                assert_eq!(args.conn.port, 5432);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn grant_requires_a_role_argument() {
        let result = Cli::try_parse_from([
            "graphmig",
            "grant",
            "-H", "localhost",
            "-U", "admin",
            "-P", "secret",
            "-D", "graphdb",
            "--schema", "schema.json",
        ]);
        assert!(result.is_err());
    }
}
