//! Database module: schema guard, repositories and row models.
//!
//! - `schema`: versioned migration ledger applied once at startup.
//! - `ledger`: workflow save path (header upsert + child replacement).
//! - `slots`: sponsorship slot allocator, only writer of reservation rows.
//! - `deletion`: soft delete with audit snapshot.
//! - `outbound`: idempotent queue of requests for the remote gift API.
//! - `query`: read-only projections for history and admin screens.
//! - `model`: row/view structs returned by repositories.

pub mod deletion;
pub mod ledger;
pub mod model;
pub mod outbound;
pub mod query;
pub mod schema;
pub mod slots;

use crate::cancel::CancellationToken;
use crate::config;
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;

pub use model::*;

pub type Pool = SqlitePool;
pub type Tx = Transaction<'static, Sqlite>;

pub async fn init_pool(database_url: &str, settings: &config::Database) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with full durability; busy timeout bounds how long writers queue.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(settings.busy_timeout());
    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

/// Open a transaction unless the caller has already cancelled.
pub(crate) async fn begin(pool: &Pool, cancel: &CancellationToken) -> Result<Tx> {
    cancel.check()?;
    Ok(pool.begin().await?)
}

/// Commit unless cancellation arrived while the transaction was open; in that
/// case the transaction is dropped and rolled back.
pub(crate) async fn commit(tx: Tx, cancel: &CancellationToken) -> Result<()> {
    cancel.check()?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://host/db"),
            "postgres://host/db"
        );
    }

    #[test]
    fn file_urls_are_rebuilt_and_parent_created() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("ledger.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested").exists());
    }
}
