//! Repository layer: entity-scoped database operations.
//!
//! Every write takes an [`AuditContext`](crate::models::AuditContext), runs
//! inside a savepoint on the caller's connection and appends exactly one
//! audit entry per mutated row. Reads never write, except [`record_view`].

mod appointment;
mod audit;
mod facility;
mod health_worker;
mod location;
mod patient;
mod record;
mod settings;
mod user;

#[cfg(test)]
pub(crate) mod fixtures;

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::DatabaseError;

pub use appointment::*;
pub use audit::*;
pub use facility::*;
pub use health_worker::*;
pub use location::*;
pub use patient::*;
pub use record::*;
pub use settings::*;
pub use user::*;

/// Optional leading `+`, optional `1`, then 9 to 15 digits.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?1?\d{9,15}$").expect("valid phone regex"));

pub(crate) fn validate_phone(entity: &str, field: &str, value: &str) -> Result<(), DatabaseError> {
    if PHONE_RE.is_match(value) {
        Ok(())
    } else {
        Err(DatabaseError::ConstraintViolation(format!(
            "{entity}.{field}: phone number must be entered in the format '+999999999' (9 to 15 digits)"
        )))
    }
}

pub(crate) fn validate_optional_phone(
    entity: &str,
    field: &str,
    value: Option<&str>,
) -> Result<(), DatabaseError> {
    value.map_or(Ok(()), |v| validate_phone(entity, field, v))
}

pub(crate) fn require_text(entity: &str, field: &str, value: &str) -> Result<(), DatabaseError> {
    if value.trim().is_empty() {
        return Err(DatabaseError::ConstraintViolation(format!(
            "{entity}.{field} must not be empty"
        )));
    }
    Ok(())
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn opt_id(id: Option<Uuid>) -> Option<String> {
    id.map(|id| id.to_string())
}

/// `%needle%` for case-insensitive LIKE matching.
pub(crate) fn like_pattern(needle: Option<&str>) -> Option<String> {
    needle.map(|n| format!("%{}%", n.to_lowercase()))
}

/// Map a UNIQUE violation on `field` to `Duplicate`, pass anything else through.
pub(crate) fn map_unique(
    err: rusqlite::Error,
    entity: &str,
    field: &str,
    value: &str,
) -> DatabaseError {
    match &err {
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && msg.contains("UNIQUE")
                && msg.contains(field) =>
        {
            DatabaseError::Duplicate {
                entity_type: entity.into(),
                field: field.into(),
                value: value.into(),
            }
        }
        _ => err.into(),
    }
}
