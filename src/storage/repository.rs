use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::sync::{FailedItem, RunSummary};

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn unset_config(conn: &Connection, key: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(count > 0)
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync Runs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunRecord {
    pub id: i64,
    pub sync_date: String,
    pub policy: String,
    pub dry_run: bool,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub total_source: i64,
    pub total_target: i64,
    pub inserted: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub deleted: i64,
    pub failed: i64,
    pub skipped: i64,
    pub errors: i64,
    pub cancelled_in_feed: i64,
    pub ambiguities: i64,
    pub error_message: Option<String>,
}

pub fn insert_sync_run(
    conn: &Connection,
    sync_date: &str,
    policy: &str,
    dry_run: bool,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (sync_date, policy, dry_run, status, started_at)
         VALUES (?1, ?2, ?3, 'running', datetime('now'))",
        params![sync_date, policy, dry_run],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Store the final counts of a run together with its failed items.
pub fn finish_sync_run(
    conn: &mut Connection,
    run_id: i64,
    summary: &RunSummary,
) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = datetime('now'),
            total_source = ?3, total_target = ?4,
            inserted = ?5, updated = ?6, unchanged = ?7, deleted = ?8,
            failed = ?9, skipped = ?10, errors = ?11,
            cancelled_in_feed = ?12, ambiguities = ?13,
            error_message = ?14
         WHERE id = ?1",
        params![
            run_id,
            summary.status().as_str(),
            summary.total_source as i64,
            summary.total_target as i64,
            summary.inserted as i64,
            summary.updated as i64,
            summary.unchanged as i64,
            summary.deleted as i64,
            summary.failed as i64,
            summary.skipped as i64,
            summary.errors as i64,
            summary.cancelled_in_feed as i64,
            summary.ambiguities as i64,
            summary.aborted,
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO sync_failures (run_id, item_key, operation, message)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for item in &summary.failures {
            stmt.execute(params![run_id, item.key, item.operation.as_str(), item.message])?;
        }
    }
    tx.commit()
}

const RUN_COLUMNS: &str = "id, sync_date, policy, dry_run, status, started_at, completed_at,
    total_source, total_target, inserted, updated, unchanged, deleted, failed, skipped,
    errors, cancelled_in_feed, ambiguities, error_message";

fn run_from_row(row: &rusqlite::Row<'_>) -> Result<SyncRunRecord, rusqlite::Error> {
    Ok(SyncRunRecord {
        id: row.get(0)?,
        sync_date: row.get(1)?,
        policy: row.get(2)?,
        dry_run: row.get(3)?,
        status: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        total_source: row.get(7)?,
        total_target: row.get(8)?,
        inserted: row.get(9)?,
        updated: row.get(10)?,
        unchanged: row.get(11)?,
        deleted: row.get(12)?,
        failed: row.get(13)?,
        skipped: row.get(14)?,
        errors: row.get(15)?,
        cancelled_in_feed: row.get(16)?,
        ambiguities: row.get(17)?,
        error_message: row.get(18)?,
    })
}

/// Most recent runs first.
pub fn list_sync_runs(conn: &Connection, limit: u32) -> Result<Vec<SyncRunRecord>, rusqlite::Error> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY id DESC LIMIT ?1");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit], run_from_row)?;
    rows.collect()
}

pub fn get_sync_run(conn: &Connection, run_id: i64) -> Result<Option<SyncRunRecord>, rusqlite::Error> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?1");
    conn.query_row(&sql, params![run_id], run_from_row).optional()
}

/// Latest finished run for a date, if any.
pub fn last_run_for_date(
    conn: &Connection,
    sync_date: &str,
) -> Result<Option<SyncRunRecord>, rusqlite::Error> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM sync_runs
         WHERE sync_date = ?1 AND status != 'running'
         ORDER BY id DESC LIMIT 1"
    );
    conn.query_row(&sql, params![sync_date], run_from_row).optional()
}

// ── Sync Failures ──────────────────────────────────────────────────

pub fn list_sync_failures(conn: &Connection, run_id: i64) -> Result<Vec<FailedItem>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT item_key, operation, message FROM sync_failures
         WHERE run_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        let operation: String = row.get(1)?;
        let operation = serde_json::from_value(serde_json::Value::String(operation.clone()))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    format!("unknown operation {operation}: {e}").into(),
                )
            })?;
        Ok(FailedItem {
            key: row.get(0)?,
            operation,
            message: row.get(2)?,
        })
    })?;
    rows.collect()
}
