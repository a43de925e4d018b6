pub mod integrity;
pub mod repository;
pub mod roles;
pub mod sqlite;

pub use integrity::*;
pub use repository::*;
pub use roles::*;
pub use sqlite::*;

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Integrity error: {entity_type}.{column} references missing {referenced_type} {referenced_id}")]
    Integrity {
        entity_type: String,
        column: String,
        referenced_type: String,
        referenced_id: String,
    },

    #[error("Cycle error: location {parent} is {node} or one of its descendants")]
    Cycle { node: Uuid, parent: Uuid },

    #[error("Conflict: {entity_type} {id} still has {count} dependent {dependent_type} row(s)")]
    Conflict {
        entity_type: String,
        id: String,
        dependent_type: String,
        count: i64,
    },

    #[error("Concurrent modification of {entity_type} {id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        entity_type: String,
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Duplicate {entity_type}.{field}: {value}")]
    Duplicate {
        entity_type: String,
        field: String,
        value: String,
    },

    #[error("{entity_type} {id} is finalized; append a correction instead")]
    Finalized { entity_type: String, id: String },

    #[error("Schedule conflict: {resource} {id} already has an appointment in this window")]
    ScheduleConflict { resource: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection limit reached for role {role} ({max} open)")]
    ConnectionLimit { role: String, max: u32 },
}

impl DatabaseError {
    pub(crate) fn not_found(entity_type: &str, id: &Uuid) -> Self {
        DatabaseError::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }
}

/// Storage format for timestamps: fixed width, so text order is time order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad date '{raw}': {e}")))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

pub(crate) fn parse_optional_uuid(raw: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    raw.as_deref().map(parse_uuid).transpose()
}

/// Drop sub-microsecond precision from a caller-supplied timestamp.
pub(crate) fn to_stored(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

static LAST_STAMP_MICROS: AtomicI64 = AtomicI64::new(0);

/// Current time truncated to the stored precision, so values read back
/// compare equal to the values written. Strictly increasing within the
/// process, which keeps `(created_at, id)` order equal to insertion order.
pub(crate) fn now() -> DateTime<Utc> {
    let wall = Utc::now().timestamp_micros();
    let mut last = LAST_STAMP_MICROS.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_STAMP_MICROS.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(actual) => last = actual,
        }
    }
}

/// Run `f` inside a SAVEPOINT on `conn`.
///
/// Nests inside a caller-held transaction; outside one it behaves like
/// BEGIN/COMMIT. On error everything `f` wrote is rolled back before the
/// error is returned, so a caller that commits anyway never persists half
/// an operation.
pub fn atomic<T, F>(conn: &Connection, f: F) -> Result<T, DatabaseError>
where
    F: FnOnce(&Connection) -> Result<T, DatabaseError>,
{
    conn.execute_batch("SAVEPOINT opencare_op")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("RELEASE opencare_op")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK TO opencare_op; RELEASE opencare_op") {
                tracing::error!(error = %rollback, "savepoint rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrip_is_lossless() {
        let ts = now();
        let parsed = parse_timestamp(&format_timestamp(&ts)).unwrap();
        assert_eq!(ts, parsed);
    }

    #[test]
    fn timestamp_text_order_matches_time_order() {
        let early = DateTime::from_timestamp(1_700_000_000, 5_000).unwrap();
        let late = DateTime::from_timestamp(1_700_000_000, 120_000_000).unwrap();
        assert!(format_timestamp(&early) < format_timestamp(&late));
    }

    #[test]
    fn atomic_rolls_back_on_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let result: Result<(), DatabaseError> = atomic(&conn, |c| {
            c.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Err(DatabaseError::ConstraintViolation("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn atomic_nests_inside_transaction() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        let tx = conn.transaction().unwrap();
        atomic(&tx, |c| {
            c.execute("INSERT INTO t (v) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();
        let _ = atomic::<(), _>(&tx, |c| {
            c.execute("INSERT INTO t (v) VALUES (2)", [])?;
            Err(DatabaseError::ConstraintViolation("second fails".into()))
        });
        tx.commit().unwrap();

        let values: Vec<i64> = conn
            .prepare("SELECT v FROM t")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(values, vec![1]);
    }
}
