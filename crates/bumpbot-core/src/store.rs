use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Ledger and log rows for successful runs expire after a day.
pub const SUCCESS_TTL_S: i64 = 24 * 60 * 60;
/// Failed runs stay around for a week so they can be inspected.
pub const FAILURE_TTL_S: i64 = 7 * 24 * 60 * 60;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id          INTEGER PRIMARY KEY,
    title       TEXT NOT NULL,
    start_time  TEXT NOT NULL,
    end_time    TEXT,
    failed      INTEGER NOT NULL DEFAULT 0,
    expires_at  INTEGER
);

CREATE TABLE IF NOT EXISTS run_logs (
    run_id      INTEGER PRIMARY KEY,
    log         TEXT NOT NULL DEFAULT '',
    expires_at  INTEGER
);

CREATE TABLE IF NOT EXISTS counters (
    name        TEXT PRIMARY KEY,
    value       INTEGER NOT NULL
);
";

/// Durable run ledger: run records, append-only per-run logs, and the
/// process-independent run id counter. Writes from concurrent runs land on
/// disjoint keys; the connection mutex provides per-statement atomicity.
pub struct RunStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: u64,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub failed: bool,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let start: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;
    Ok(RunRecord {
        id: row.get::<_, i64>(0)? as u64,
        title: row.get(1)?,
        start_time: parse_ts(&start),
        end_time: end.as_deref().map(parse_ts),
        failed: row.get::<_, i64>(4)? != 0,
    })
}

impl RunStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next run id: atomic increment, strictly increasing across restarts.
    pub fn next_run_id(&self) -> Result<u64> {
        let conn = self.conn();
        let id: i64 = conn.query_row(
            "INSERT INTO counters (name, value) VALUES ('run_id', 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
            [],
            |row| row.get(0),
        )?;
        Ok(id as u64)
    }

    pub fn record_start(&self, id: u64, title: &str, start_time: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO runs (id, title, start_time, end_time, failed, expires_at)
             VALUES (?1, ?2, ?3, NULL, 0, NULL)",
            params![id as i64, title, start_time.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Close out a run record and set failure-dependent retention on the
    /// record and its log.
    pub fn record_end(&self, id: u64, end_time: DateTime<Utc>, failed: bool) -> Result<()> {
        let ttl = if failed { FAILURE_TTL_S } else { SUCCESS_TTL_S };
        let expires_at = end_time.timestamp() + ttl;
        let conn = self.conn();
        conn.execute(
            "UPDATE runs SET end_time = ?2, failed = ?3, expires_at = ?4 WHERE id = ?1",
            params![id as i64, end_time.to_rfc3339(), failed as i64, expires_at],
        )?;
        conn.execute(
            "UPDATE run_logs SET expires_at = ?2 WHERE run_id = ?1",
            params![id as i64, expires_at],
        )?;
        Ok(())
    }

    /// Atomic append to a run's log.
    pub fn append_log(&self, id: u64, chunk: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO run_logs (run_id, log) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET log = log || excluded.log",
            params![id as i64, chunk],
        )?;
        Ok(())
    }

    pub fn read_log(&self, id: u64) -> Result<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT log FROM run_logs WHERE run_id = ?1",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_run(&self, id: u64) -> Result<Option<RunRecord>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                "SELECT id, title, start_time, end_time, failed FROM runs WHERE id = ?1",
                params![id as i64],
                row_to_record,
            )
            .optional()?)
    }

    /// All run records, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, start_time, end_time, failed FROM runs ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop expired run records and logs. Called opportunistically at run
    /// start; there is no background sweeper.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn();
        let runs = conn.execute(
            "DELETE FROM runs WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        let logs = conn.execute(
            "DELETE FROM run_logs WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        Ok(runs + logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_strictly_increasing() {
        let store = RunStore::open_in_memory().expect("open store");
        let a = store.next_run_id().expect("id");
        let b = store.next_run_id().expect("id");
        let c = store.next_run_id().expect("id");
        assert!(a < b && b < c);
    }

    #[test]
    fn append_log_concatenates() {
        let store = RunStore::open_in_memory().expect("open store");
        store.append_log(7, "first\n").expect("append");
        store.append_log(7, "second\n").expect("append");
        assert_eq!(store.read_log(7).expect("read"), Some("first\nsecond\n".into()));
        assert_eq!(store.read_log(8).expect("read"), None);
    }

    #[test]
    fn record_end_sets_failure_dependent_ttl() {
        let store = RunStore::open_in_memory().expect("open store");
        let now = Utc::now();
        store.record_start(1, "ok run", now).expect("start");
        store.record_start(2, "bad run", now).expect("start");
        store.record_end(1, now, false).expect("end");
        store.record_end(2, now, true).expect("end");

        let conn = store.conn();
        let ok_exp: i64 = conn
            .query_row("SELECT expires_at FROM runs WHERE id = 1", [], |r| r.get(0))
            .expect("ok ttl");
        let bad_exp: i64 = conn
            .query_row("SELECT expires_at FROM runs WHERE id = 2", [], |r| r.get(0))
            .expect("bad ttl");
        assert_eq!(ok_exp, now.timestamp() + SUCCESS_TTL_S);
        assert_eq!(bad_exp, now.timestamp() + FAILURE_TTL_S);
    }

    #[test]
    fn purge_drops_only_expired_rows() {
        let store = RunStore::open_in_memory().expect("open store");
        let long_ago = Utc::now() - chrono::Duration::seconds(FAILURE_TTL_S + 60);
        store.record_start(1, "old", long_ago).expect("start");
        store.record_end(1, long_ago, true).expect("end");
        store.record_start(2, "live", Utc::now()).expect("start");

        let purged = store.purge_expired().expect("purge");
        assert_eq!(purged, 1);
        assert!(store.get_run(1).expect("get").is_none());
        assert!(store.get_run(2).expect("get").is_some());
    }

    #[test]
    fn run_record_round_trips() {
        let store = RunStore::open_in_memory().expect("open store");
        let start = Utc::now();
        store.record_start(3, "bump-deps chef", start).expect("start");
        let rec = store.get_run(3).expect("get").expect("present");
        assert_eq!(rec.title, "bump-deps chef");
        assert!(rec.end_time.is_none());
        assert!(!rec.failed);

        store.record_end(3, Utc::now(), true).expect("end");
        let rec = store.get_run(3).expect("get").expect("present");
        assert!(rec.end_time.is_some());
        assert!(rec.failed);
    }
}
