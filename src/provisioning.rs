//! One-time database provisioning.
//!
//! Runs before migrations on a privileged, writable connection. Every step
//! is idempotent, so provisioning an already provisioned database leaves it
//! unchanged. Settings written here are not rolled back if a later step
//! fails; re-running after fixing the cause completes the job.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

use crate::config::Settings;
use crate::db::{format_timestamp, now, set_setting, DatabaseError, DbRole, PROFILE_RETENTION_KEY, TUNABLE_PRAGMAS};

pub const TIMEZONE_KEY: &str = "timezone";

static TIMEZONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(UTC|[A-Z][A-Za-z_]+(/[A-Za-z0-9_+\-]+){1,2})$").expect("valid timezone regex")
});

/// Values recorded under `pragma.<name>` and applied on every open.
const TUNING: &[(&str, &str)] = &[
    ("busy_timeout", "5000"),
    ("cache_size", "-16000"),
    ("synchronous", "NORMAL"),
    ("temp_store", "MEMORY"),
];

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("Required capability missing: {0}")]
    MissingExtension(String),

    #[error("Invalid setting {key} = '{value}': {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    PrivilegeCheck,
    Extensions,
    SettingsTables,
    Timezone,
    ConnectionLimits,
    ResourceTuning,
    RetentionPolicy,
    Statistics,
}

impl ProvisioningStep {
    pub const ALL: [ProvisioningStep; 8] = [
        ProvisioningStep::PrivilegeCheck,
        ProvisioningStep::Extensions,
        ProvisioningStep::SettingsTables,
        ProvisioningStep::Timezone,
        ProvisioningStep::ConnectionLimits,
        ProvisioningStep::ResourceTuning,
        ProvisioningStep::RetentionPolicy,
        ProvisioningStep::Statistics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStep::PrivilegeCheck => "privilege_check",
            ProvisioningStep::Extensions => "extensions",
            ProvisioningStep::SettingsTables => "settings_tables",
            ProvisioningStep::Timezone => "timezone",
            ProvisioningStep::ConnectionLimits => "connection_limits",
            ProvisioningStep::ResourceTuning => "resource_tuning",
            ProvisioningStep::RetentionPolicy => "retention_policy",
            ProvisioningStep::Statistics => "statistics",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: ProvisioningStep,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisioningReport {
    pub steps: Vec<StepOutcome>,
}

impl ProvisioningReport {
    fn record(&mut self, step: ProvisioningStep, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::info!(step = step.as_str(), %detail, "provisioning step complete");
        self.steps.push(StepOutcome { step, detail });
    }
}

/// Manual follow-ups printed once provisioning succeeds.
pub const NEXT_STEPS: [&str; 3] = [
    "run schema migrations (opencare migrate)",
    "create the initial administrative account (opencare create-admin)",
    "load seed data (opencare seed)",
];

/// Run every provisioning step in order. Stops at the first failure.
pub fn provision(conn: &Connection, settings: &Settings) -> Result<ProvisioningReport, ProvisioningError> {
    let mut report = ProvisioningReport::default();

    check_privilege(conn)?;
    report.record(ProvisioningStep::PrivilegeCheck, "connection is writable");

    check_extensions(conn)?;
    report.record(ProvisioningStep::Extensions, "json1 and foreign keys available");

    create_settings_tables(conn)?;
    report.record(ProvisioningStep::SettingsTables, "system_configuration, role_connection_limits");

    let timezone = validate_timezone(&settings.timezone)?;
    set_setting(conn, TIMEZONE_KEY, timezone, "Default timezone for display and reporting")?;
    report.record(ProvisioningStep::Timezone, timezone);

    let limits = store_connection_limits(conn, settings)?;
    report.record(ProvisioningStep::ConnectionLimits, limits);

    let journal = apply_tuning(conn)?;
    report.record(ProvisioningStep::ResourceTuning, format!("journal_mode={journal}"));

    set_setting(
        conn,
        PROFILE_RETENTION_KEY,
        settings.retention.as_str(),
        "Removal of health worker profiles: anonymize or remove",
    )?;
    report.record(ProvisioningStep::RetentionPolicy, settings.retention.as_str());

    conn.execute_batch("ANALYZE")?;
    report.record(ProvisioningStep::Statistics, "analyze complete");

    tracing::info!(
        next_steps = ?NEXT_STEPS,
        "provisioning complete; run schema migrations, create the initial admin, then load seed data"
    );
    Ok(report)
}

fn check_privilege(conn: &Connection) -> Result<(), ProvisioningError> {
    let query_only: i64 = conn.query_row("PRAGMA query_only", [], |row| row.get(0))?;
    if query_only != 0 {
        return Err(ProvisioningError::InsufficientPrivilege(
            "connection is query_only".into(),
        ));
    }

    let created = conn.execute_batch(
        "SAVEPOINT opencare_ddl_check;
         CREATE TABLE main.opencare_privilege_check (x INTEGER);
         ROLLBACK TO opencare_ddl_check;
         RELEASE opencare_ddl_check;",
    );
    if let Err(e) = created {
        let _ = conn.execute_batch("ROLLBACK TO opencare_ddl_check; RELEASE opencare_ddl_check;");
        return Err(ProvisioningError::InsufficientPrivilege(format!(
            "cannot create objects: {e}"
        )));
    }
    Ok(())
}

fn check_extensions(conn: &Connection) -> Result<(), ProvisioningError> {
    let json: Result<i64, _> = conn.query_row("SELECT json_valid('{\"ok\":true}')", [], |row| row.get(0));
    if !matches!(json, Ok(1)) {
        return Err(ProvisioningError::MissingExtension("json1".into()));
    }

    conn.execute_batch("PRAGMA foreign_keys=ON")?;
    let fk: Result<i64, _> = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0));
    if !matches!(fk, Ok(1)) {
        return Err(ProvisioningError::MissingExtension("foreign_keys".into()));
    }
    Ok(())
}

fn create_settings_tables(conn: &Connection) -> Result<(), ProvisioningError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS system_configuration (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            is_public INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS role_connection_limits (
            role TEXT PRIMARY KEY CHECK (role IN ('admin', 'application', 'reporting')),
            max_connections INTEGER NOT NULL CHECK (max_connections > 0),
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Accept `UTC` or an IANA-style `Area/Location[/Sub]` name.
pub fn validate_timezone(tz: &str) -> Result<&str, ProvisioningError> {
    if TIMEZONE_RE.is_match(tz) {
        Ok(tz)
    } else {
        Err(ProvisioningError::InvalidSetting {
            key: TIMEZONE_KEY.into(),
            value: tz.into(),
            reason: "expected UTC or an Area/Location name".into(),
        })
    }
}

fn store_connection_limits(conn: &Connection, settings: &Settings) -> Result<String, ProvisioningError> {
    let stamp = format_timestamp(&now());
    let mut summary = Vec::with_capacity(DbRole::ALL.len());
    for role in DbRole::ALL {
        let max = settings.max_connections(role);
        if max == 0 {
            return Err(ProvisioningError::InvalidSetting {
                key: format!("max_connections.{role}"),
                value: max.to_string(),
                reason: "must be positive".into(),
            });
        }
        conn.execute(
            "INSERT INTO role_connection_limits (role, max_connections, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(role) DO UPDATE SET
                max_connections = excluded.max_connections,
                updated_at = CASE WHEN max_connections = excluded.max_connections
                                  THEN updated_at ELSE excluded.updated_at END",
            params![role.as_str(), max, stamp],
        )?;
        summary.push(format!("{role}={max}"));
    }
    Ok(summary.join(", "))
}

/// Persist WAL for file databases and record the per-connection pragmas.
fn apply_tuning(conn: &Connection) -> Result<String, ProvisioningError> {
    let in_memory = conn.path().map_or(true, |p| p.is_empty());
    let journal: String = if in_memory {
        conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?
    } else {
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?
    };

    for (name, value) in TUNING {
        debug_assert!(TUNABLE_PRAGMAS.contains(name));
        set_setting(conn, &format!("pragma.{name}"), value, "")?;
    }
    crate::db::apply_resource_settings(conn)?;
    Ok(journal.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionPolicy;
    use crate::db::{
        get_setting, list_settings, open_database, open_database_read_only,
        open_database_unmigrated, removal_mode,
    };
    use crate::models::EntityKind;

    fn file_db() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opencare.db");
        (dir, path)
    }

    #[test]
    fn provisions_fresh_database() {
        let (_dir, path) = file_db();
        let conn = open_database_unmigrated(&path).unwrap();
        let settings = Settings {
            timezone: "Africa/Nairobi".into(),
            ..Settings::default()
        };

        let report = provision(&conn, &settings).unwrap();
        let steps: Vec<ProvisioningStep> = report.steps.iter().map(|s| s.step).collect();
        assert_eq!(steps, ProvisioningStep::ALL.to_vec());

        assert_eq!(get_setting(&conn, TIMEZONE_KEY).unwrap().as_deref(), Some("Africa/Nairobi"));
        assert_eq!(get_setting(&conn, PROFILE_RETENTION_KEY).unwrap().as_deref(), Some("anonymize"));
        let journal: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(journal.to_ascii_lowercase(), "wal");
        let limit: i64 = conn
            .query_row(
                "SELECT max_connections FROM role_connection_limits WHERE role = 'application'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(limit, 50);
    }

    #[test]
    fn rerun_yields_same_state() {
        let (_dir, path) = file_db();
        let conn = open_database_unmigrated(&path).unwrap();
        let settings = Settings::default();

        provision(&conn, &settings).unwrap();
        let first = list_settings(&conn, "").unwrap();
        provision(&conn, &settings).unwrap();
        let second = list_settings(&conn, "").unwrap();
        assert_eq!(first, second);

        let limits: i64 = conn
            .query_row("SELECT COUNT(*) FROM role_connection_limits", [], |r| r.get(0))
            .unwrap();
        assert_eq!(limits, 3);
    }

    #[test]
    fn migrations_run_after_provisioning() {
        let (_dir, path) = file_db();
        {
            let conn = open_database_unmigrated(&path).unwrap();
            provision(&conn, &Settings::default()).unwrap();
        }
        let conn = open_database(&path).unwrap();
        assert_eq!(crate::db::get_current_version(&conn).unwrap(), 3);
        assert_eq!(get_setting(&conn, TIMEZONE_KEY).unwrap().as_deref(), Some("UTC"));
        let timeout: i64 = conn.query_row("PRAGMA busy_timeout", [], |r| r.get(0)).unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn read_only_connection_is_rejected() {
        let (_dir, path) = file_db();
        drop(open_database_unmigrated(&path).unwrap());
        let conn = open_database_read_only(&path).unwrap();

        let err = provision(&conn, &Settings::default()).unwrap_err();
        assert!(matches!(err, ProvisioningError::InsufficientPrivilege(_)));
    }

    #[test]
    fn invalid_timezone_is_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        let settings = Settings {
            timezone: "Mars/Olympus Mons; DROP".into(),
            ..Settings::default()
        };
        let err = provision(&conn, &settings).unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidSetting { .. }));
        // Earlier steps are not rolled back.
        assert!(crate::db::table_exists(&conn, "system_configuration").unwrap());
    }

    #[test]
    fn timezone_names() {
        assert!(validate_timezone("UTC").is_ok());
        assert!(validate_timezone("Africa/Nairobi").is_ok());
        assert!(validate_timezone("America/Argentina/Buenos_Aires").is_ok());
        assert!(validate_timezone("Etc/GMT+3").is_ok());
        assert!(validate_timezone("nairobi").is_err());
        assert!(validate_timezone("").is_err());
    }

    #[test]
    fn retention_setting_drives_profile_removal() {
        let conn = crate::db::open_memory_database().unwrap();
        let settings = Settings {
            retention: RetentionPolicy::Remove,
            ..Settings::default()
        };
        provision(&conn, &settings).unwrap();
        assert_eq!(
            removal_mode(&conn, EntityKind::HealthWorkerProfile).unwrap(),
            crate::db::Removal::Hard
        );
    }
}
