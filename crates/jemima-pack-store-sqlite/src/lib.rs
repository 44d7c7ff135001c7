//! SQLite persistence: the room store that seeded games are written to and
//! the claim index that keeps a pool pair from being handed out twice.

mod claims;
mod rooms;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

pub use claims::{ClaimIndex, ClaimRecord, ClaimState};
pub use rooms::SqliteRoomStore;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Open a database and configure the runtime pragmas both stores rely on.
fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

/// Apply every migration newer than the recorded schema version, each in
/// its own transaction.
fn apply_migrations(conn: &mut Connection, migrations: &[(i64, &str)]) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let current = current_schema_version(conn)?;
    for (version, sql) in migrations.iter().filter(|(version, _)| *version > current) {
        let tx = conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, *version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    }

    let latest = migrations.last().map_or(0, |(version, _)| *version);
    let version = current_schema_version(conn)?;
    if version != latest {
        return Err(anyhow!("unsupported schema version {version}; expected {latest}"));
    }
    Ok(())
}

fn schema_status(conn: &Connection, migrations: &[(i64, &str)]) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let target_version = migrations.last().map_or(0, |(version, _)| *version);
    let pending_versions = migrations
        .iter()
        .map(|(version, _)| *version)
        .filter(|version| *version > current_version)
        .collect();
    Ok(SchemaStatus { current_version, target_version, pending_versions })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
