//! Schema guard.
//!
//! Migrations are numbered and recorded in `ledger_schema_migrations`; the
//! guard runs once at startup and never on the hot path. Table steps are
//! written with `IF NOT EXISTS` and column steps inspect the live table, so
//! the guard can adopt an older database that already has some of the
//! objects. Nothing is ever dropped or renamed.
use super::Pool;
use crate::error::{LedgerError, Result, SCHEMA_HINT};
use chrono::Utc;
use sqlx::{Executor, Row};
use tracing::{info, instrument};

enum Step {
    Sql(&'static str),
    Columns {
        table: &'static str,
        columns: &'static [(&'static str, &'static str)],
    },
}

struct Migration {
    version: i64,
    description: &'static str,
    step: Step,
}

const GIFT_LINE_SOFT_DELETE_COLUMNS: &[(&str, &str)] = &[
    ("is_deleted", "INTEGER NOT NULL DEFAULT 0"),
    ("deleted_at", "TEXT"),
    ("deleted_by_user", "TEXT"),
    ("deleted_by_machine", "TEXT"),
    ("delete_reason", "TEXT"),
    ("remote_delete_attempted_at", "TEXT"),
    ("remote_delete_succeeded", "INTEGER"),
    ("remote_delete_error", "TEXT"),
];

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core workflow, gift line and sponsorship tables",
        step: Step::Sql(include_str!("../../migrations/0001_core_tables.sql")),
    },
    Migration {
        version: 2,
        description: "gift line soft-delete columns",
        step: Step::Columns {
            table: "gift_lines",
            columns: GIFT_LINE_SOFT_DELETE_COLUMNS,
        },
    },
    Migration {
        version: 3,
        description: "deletion snapshots",
        step: Step::Sql(include_str!("../../migrations/0003_deletion_snapshots.sql")),
    },
    Migration {
        version: 4,
        description: "outbound transaction queue",
        step: Step::Sql(include_str!("../../migrations/0004_outbound_transactions.sql")),
    },
];

pub const REQUIRED_TABLES: &[&str] = &[
    "workflows",
    "gift_lines",
    "sponsorship_reservations",
    "sponsorship_day_locks",
    "deletion_snapshots",
    "outbound_transactions",
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply every migration not yet recorded in the ledger. Returns the versions
/// applied by this call.
#[instrument(skip_all)]
pub async fn ensure(pool: &Pool) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await?;
    (&mut *tx)
        .execute(
            "CREATE TABLE IF NOT EXISTS ledger_schema_migrations (\
                version INTEGER PRIMARY KEY, \
                description TEXT NOT NULL, \
                applied_at TEXT NOT NULL)",
        )
        .await?;
    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM ledger_schema_migrations")
        .fetch_all(&mut *tx)
        .await?;

    let mut newly_applied = Vec::new();
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        match &migration.step {
            Step::Sql(sql) => {
                (&mut *tx).execute(*sql).await?;
            }
            Step::Columns { table, columns } => {
                let existing: Vec<String> =
                    sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
                        .bind(*table)
                        .fetch_all(&mut *tx)
                        .await?;
                for (column, ddl) in columns.iter() {
                    if existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                        continue;
                    }
                    let alter = format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}");
                    (&mut *tx).execute(alter.as_str()).await?;
                    info!(table, column, "added missing column");
                }
            }
        }
        sqlx::query(
            "INSERT INTO ledger_schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
        )
        .bind(migration.version)
        .bind(migration.description)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied schema migration"
        );
        newly_applied.push(migration.version);
    }
    tx.commit().await?;
    Ok(newly_applied)
}

/// Highest applied migration version, or `None` when the ledger table is absent.
pub async fn current_version(pool: &Pool) -> Result<Option<i64>> {
    if !table_exists(pool, "ledger_schema_migrations").await? {
        return Ok(None);
    }
    let version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM ledger_schema_migrations")
            .fetch_one(pool)
            .await?;
    Ok(version)
}

/// Check the schema without changing it. Fails with `SchemaMissing` naming
/// the first absent table or unapplied migration.
#[instrument(skip_all)]
pub async fn verify(pool: &Pool) -> Result<()> {
    for table in REQUIRED_TABLES {
        if !table_exists(pool, table).await? {
            return Err(LedgerError::SchemaMissing {
                object: format!("table {table}"),
                hint: SCHEMA_HINT,
            });
        }
    }
    let latest = latest_version();
    match current_version(pool).await? {
        Some(v) if v >= latest => Ok(()),
        Some(v) => Err(LedgerError::SchemaMissing {
            object: format!("migration {} (database is at version {v})", v + 1),
            hint: SCHEMA_HINT,
        }),
        None => Err(LedgerError::SchemaMissing {
            object: "table ledger_schema_migrations".to_string(),
            hint: SCHEMA_HINT,
        }),
    }
}

async fn table_exists(pool: &Pool, table: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("n") > 0)
}
