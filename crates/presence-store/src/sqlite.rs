//! SQLite-backed identity store and attendance ledger.

use chrono::{NaiveDate, NaiveDateTime};
use presence_core::store::{
    AttendanceLedger, AttendanceRecord, CheckinInsert, IdentityRecord, IdentityStore, StoreError,
    StoredIdentity, TIMESTAMP_FORMAT,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_id  TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    embedding    TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS attendance (
    record_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id    TEXT NOT NULL,
    date           TEXT NOT NULL,
    check_in_time  TEXT NOT NULL,
    check_out_time TEXT,
    method         TEXT NOT NULL,
    UNIQUE (identity_id, date)
);
CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance (date);
";

const ATTENDANCE_COLUMNS: &str =
    "record_id, identity_id, date, check_in_time, check_out_time, method";

/// Both stores over one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("date {raw:?}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

/// Raw attendance columns, converted to typed values outside the rusqlite closure.
struct AttendanceRow {
    record_id: i64,
    identity_id: String,
    date: String,
    check_in_time: String,
    check_out_time: Option<String>,
    method: String,
}

impl AttendanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record_id: row.get(0)?,
            identity_id: row.get(1)?,
            date: row.get(2)?,
            check_in_time: row.get(3)?,
            check_out_time: row.get(4)?,
            method: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        Ok(AttendanceRecord {
            record_id: self.record_id,
            identity_id: self.identity_id,
            date: parse_date(&self.date)?,
            check_in_time: parse_timestamp(&self.check_in_time)?,
            check_out_time: self
                .check_out_time
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            method: self.method,
        })
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
            .map_err(backend)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_identity(conn: &Connection, identity_id: &str) -> Result<Option<StoredIdentity>, StoreError> {
        conn.query_row(
            "SELECT identity_id, display_name, embedding, created_at
             FROM identities WHERE identity_id = ?1",
            params![identity_id],
            |row| {
                Ok(StoredIdentity {
                    identity_id: row.get(0)?,
                    display_name: row.get(1)?,
                    embedding_json: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(backend)
    }

    fn read_attendance(conn: &Connection, record_id: i64) -> Result<AttendanceRecord, StoreError> {
        let sql = format!("SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE record_id = ?1");
        conn.query_row(&sql, params![record_id], AttendanceRow::from_row)
            .map_err(backend)?
            .into_record()
    }
}

impl IdentityStore for SqliteStore {
    fn insert(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO identities (identity_id, display_name, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.identity_id,
                record.display_name,
                record.embedding.to_json(),
                record.created_at.format(TIMESTAMP_FORMAT).to_string(),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(record.identity_id.clone())
            } else {
                backend(e)
            }
        })?;
        Ok(())
    }

    fn replace(&self, record: &IdentityRecord) -> Result<StoredIdentity, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;

        let previous = Self::read_identity(&tx, &record.identity_id)?
            .ok_or_else(|| StoreError::NotFound(record.identity_id.clone()))?;

        tx.execute(
            "DELETE FROM identities WHERE identity_id = ?1",
            params![record.identity_id],
        )
        .map_err(backend)?;
        tx.execute(
            "INSERT INTO identities (identity_id, display_name, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.identity_id,
                record.display_name,
                record.embedding.to_json(),
                record.created_at.format(TIMESTAMP_FORMAT).to_string(),
            ],
        )
        .map_err(backend)?;

        tx.commit().map_err(backend)?;
        Ok(previous)
    }

    fn delete(&self, identity_id: &str) -> Result<Option<StoredIdentity>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(backend)?;

        let Some(previous) = Self::read_identity(&tx, identity_id)? else {
            return Ok(None);
        };
        tx.execute(
            "DELETE FROM identities WHERE identity_id = ?1",
            params![identity_id],
        )
        .map_err(backend)?;

        tx.commit().map_err(backend)?;
        Ok(Some(previous))
    }

    fn restore(&self, row: &StoredIdentity) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO identities (identity_id, display_name, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.identity_id, row.display_name, row.embedding_json, row.created_at],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<StoredIdentity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT identity_id, display_name, embedding, created_at
                 FROM identities ORDER BY identity_id",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredIdentity {
                    identity_id: row.get(0)?,
                    display_name: row.get(1)?,
                    embedding_json: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }
}

impl AttendanceLedger for SqliteStore {
    fn find(&self, identity_id: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance WHERE identity_id = ?1 AND date = ?2"
        );
        let row = self
            .conn()
            .query_row(
                &sql,
                params![identity_id, date.format(DATE_FORMAT).to_string()],
                AttendanceRow::from_row,
            )
            .optional()
            .map_err(backend)?;
        row.map(AttendanceRow::into_record).transpose()
    }

    fn insert_checkin(
        &self,
        identity_id: &str,
        date: NaiveDate,
        at: NaiveDateTime,
        method: &str,
    ) -> Result<CheckinInsert, StoreError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO attendance (identity_id, date, check_in_time, check_out_time, method)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![
                identity_id,
                date.format(DATE_FORMAT).to_string(),
                at.format(TIMESTAMP_FORMAT).to_string(),
                method,
            ],
        );
        match inserted {
            Ok(_) => {
                let record_id = conn.last_insert_rowid();
                Ok(CheckinInsert::Inserted(Self::read_attendance(&conn, record_id)?))
            }
            Err(e) if is_unique_violation(&e) => Ok(CheckinInsert::Duplicate),
            Err(e) => Err(backend(e)),
        }
    }

    fn update_checkout(&self, record_id: i64, at: NaiveDateTime) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE attendance SET check_out_time = ?2
                 WHERE record_id = ?1 AND check_out_time IS NULL",
                params![record_id, at.format(TIMESTAMP_FORMAT).to_string()],
            )
            .map_err(backend)?;
        Ok(changed == 1)
    }

    fn list(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let from = from.map(|d| d.format(DATE_FORMAT).to_string());
        let to = to.map(|d| d.format(DATE_FORMAT).to_string());
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance
             WHERE (?1 IS NULL OR date >= ?1) AND (?2 IS NULL OR date <= ?2)
             ORDER BY date DESC, check_in_time DESC"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![from, to], AttendanceRow::from_row)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(AttendanceRow::into_record).collect()
    }
}
