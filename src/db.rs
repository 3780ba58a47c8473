use crate::errors::{PoolError, PoolResult};
use crate::state::DbCommand;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type DbPool = Arc<Mutex<Connection>>;

const SCHEMA: &str = include_str!("../migrations/001_init.sql");

pub fn init_db(data_dir: &Path) -> PoolResult<DbPool> {
    std::fs::create_dir_all(data_dir).map_err(|e| PoolError::Database(format!("create dir: {e}")))?;
    let db_path = data_dir.join("pooled_options.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA cache_size=-64000;")?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("database initialized at {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// Journal without a file, for tests.
#[cfg(test)]
pub fn init_memory_db() -> PoolResult<DbPool> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Dedicated DB writer task. Reads commands from bounded channel, executes SQL.
/// This is the ONLY task that writes through the connection.
pub async fn run_db_writer(db: DbPool, mut rx: mpsc::Receiver<DbCommand>) {
    tracing::info!("db writer task started");

    while let Some(cmd) = rx.recv().await {
        if let Err(e) = execute_command(&db, cmd) {
            tracing::error!("db write error: {e}");
        }
    }

    tracing::info!("db writer task shutting down");
}

fn execute_command(db: &DbPool, cmd: DbCommand) -> PoolResult<()> {
    let conn = db.lock().map_err(|e| PoolError::Database(format!("lock poisoned: {e}")))?;

    match cmd {
        DbCommand::InsertEvent {
            id,
            kind,
            account,
            payload,
            created_at,
        } => {
            conn.execute(
                "INSERT INTO pool_events (id, kind, account, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, kind, account, payload, created_at],
            )?;
        }
        DbCommand::InsertPrice { timestamp, price } => {
            conn.execute(
                "INSERT INTO price_updates (timestamp, price) VALUES (?1, ?2)",
                rusqlite::params![timestamp, price],
            )?;
        }
    }
    Ok(())
}

// ── Query helpers (for server REST reads, cold path) ──

pub fn get_recent_events(db: &DbPool, account: Option<&str>, limit: usize) -> PoolResult<Vec<EventRow>> {
    let conn = db.lock().map_err(|e| PoolError::Database(format!("lock: {e}")))?;
    let (sql, params): (&str, Vec<Box<dyn rusqlite::types::ToSql>>) = match account {
        Some(account) => (
            "SELECT id, kind, account, payload, created_at FROM pool_events WHERE account = ?1 ORDER BY seq DESC LIMIT ?2",
            vec![Box::new(account.to_string()), Box::new(limit as i64)],
        ),
        None => (
            "SELECT id, kind, account, payload, created_at FROM pool_events ORDER BY seq DESC LIMIT ?1",
            vec![Box::new(limit as i64)],
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        let payload: String = row.get(3)?;
        Ok(EventRow {
            id: row.get(0)?,
            kind: row.get(1)?,
            account: row.get(2)?,
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            created_at: row.get(4)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_price_series(db: &DbPool, limit: usize) -> PoolResult<Vec<(i64, f64)>> {
    let conn = db.lock().map_err(|e| PoolError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare("SELECT timestamp, price FROM price_updates ORDER BY id DESC LIMIT ?1")?;
    let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut series: Vec<_> = rows.filter_map(|r| r.ok()).collect();
    series.reverse();
    Ok(series)
}

// ── Row types ──

#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRow {
    pub id: String,
    pub kind: String,
    pub account: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
}
