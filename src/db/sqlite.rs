use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags};
use tracing;

use super::DatabaseError;

/// Per-connection pragmas that provisioning may record under `pragma.<name>`
/// in `system_configuration`. Anything else stored under that prefix is ignored.
pub const TUNABLE_PRAGMAS: &[&str] = &["synchronous", "cache_size", "busy_timeout", "temp_store"];

/// Open a SQLite connection to the given path and run migrations
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    apply_resource_settings(&conn)?;
    Ok(conn)
}

/// Open an existing database without running migrations.
///
/// Used by provisioning, which must run before the schema exists.
pub fn open_database_unmigrated(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    Ok(conn)
}

/// Open a read-only, query-only connection (reporting access).
pub fn open_database_read_only(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.execute_batch(
        "PRAGMA foreign_keys=ON;
         PRAGMA query_only=ON;",
    )?;
    apply_resource_settings(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn)?;

    let migrations: Vec<(i64, &str)> = vec![
        (1, include_str!("../../resources/migrations/001_initial.sql")),
        (2, include_str!("../../resources/migrations/002_patient_records.sql")),
        (3, include_str!("../../resources/migrations/003_audit_trail.sql")),
    ];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(&format!("BEGIN;\n{sql}\nCOMMIT;"))
                .map_err(|e| {
                    let _ = conn.execute_batch("ROLLBACK");
                    DatabaseError::MigrationFailed {
                        version,
                        reason: e.to_string(),
                    }
                })?;
        }
    }

    Ok(())
}

/// Current schema version (0 if no schema exists yet)
pub fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    if !table_exists(conn, "schema_version")? {
        return Ok(0);
    }
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Apply the per-connection tuning recorded by provisioning.
pub fn apply_resource_settings(conn: &Connection) -> Result<(), DatabaseError> {
    if !table_exists(conn, "system_configuration")? {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "SELECT key, value FROM system_configuration WHERE key LIKE 'pragma.%' ORDER BY key",
    )?;
    let settings = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (key, value) in settings {
        let name = key.trim_start_matches("pragma.");
        if !TUNABLE_PRAGMAS.contains(&name) || !is_pragma_value(&value) {
            tracing::warn!(setting = %key, "ignoring unrecognised tuning setting");
            continue;
        }
        match (name, value.parse::<i64>()) {
            ("busy_timeout", Ok(ms)) => {
                conn.busy_timeout(Duration::from_millis(ms.max(0) as u64))?
            }
            (_, Ok(number)) => conn.pragma_update(None, name, number)?,
            (_, Err(_)) => conn.pragma_update(None, name, &value)?,
        }
    }
    Ok(())
}

/// Pragma values are restricted to signed integers and bare keywords.
pub(crate) fn is_pragma_value(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        || (!value.is_empty() && value.chars().all(|c| c.is_ascii_alphabetic()))
}

/// Count tables in the database (for verification)
pub fn count_tables(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_initializes_all_tables() {
        let conn = open_memory_database().unwrap();
        // schema_version, system_configuration, role_connection_limits, users, locations,
        // location_closure, health_facilities, health_worker_profiles, work_schedules,
        // performance_evaluations, patients, patient_visits, health_records, vital_signs,
        // medications, laboratory_tests, imaging_studies, record_corrections, appointments,
        // audit_trail
        let count = count_tables(&conn).unwrap();
        assert_eq!(count, 20, "Expected 20 tables, got {count}");
    }

    #[test]
    fn schema_version_is_current() {
        let conn = open_memory_database().unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn empty_database_reports_version_zero() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn migration_idempotent() {
        let conn = open_memory_database().unwrap();
        // Second run is a no-op
        let result = run_migrations(&conn);
        assert!(result.is_ok());
        assert_eq!(get_current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn foreign_keys_enabled() {
        let conn = open_memory_database().unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn stored_tuning_is_applied_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opencare.db");
        {
            let conn = open_database(&path).unwrap();
            conn.execute(
                "INSERT INTO system_configuration (key, value, updated_at)
                 VALUES ('pragma.busy_timeout', '4321', '2024-01-01T00:00:00.000000Z')",
                [],
            )
            .unwrap();
        }
        let conn = open_database(&path).unwrap();
        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 4321);
    }

    #[test]
    fn unknown_tuning_keys_are_ignored() {
        let conn = open_memory_database().unwrap();
        conn.execute(
            "INSERT INTO system_configuration (key, value, updated_at)
             VALUES ('pragma.writable_schema', 'ON', '2024-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();
        apply_resource_settings(&conn).unwrap();
        let writable: i64 = conn
            .query_row("PRAGMA writable_schema", [], |row| row.get(0))
            .unwrap();
        assert_eq!(writable, 0);
    }

    #[test]
    fn pragma_values_are_restricted() {
        assert!(is_pragma_value("NORMAL"));
        assert!(is_pragma_value("-16000"));
        assert!(!is_pragma_value("1; DROP TABLE users"));
        assert!(!is_pragma_value(""));
        assert!(!is_pragma_value("-"));
    }

    #[test]
    fn read_only_connection_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opencare.db");
        drop(open_database(&path).unwrap());

        let conn = open_database_read_only(&path).unwrap();
        let result = conn.execute(
            "INSERT INTO system_configuration (key, value, updated_at) VALUES ('k', 'v', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
