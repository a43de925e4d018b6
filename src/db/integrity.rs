//! Referential integrity enforcement.
//!
//! Every foreign relationship between tracked entities is declared once in
//! [`RELATIONSHIPS`]. Creates and updates validate references against it;
//! [`delete_entity`] walks it to apply each relationship's [`DeletePolicy`].

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::repository::{append_audit_entry, get_setting};
use super::{atomic, format_timestamp, now, DatabaseError};
use crate::models::{Actor, AuditAction, AuditContext, ChangeSet, EntityKind};

/// Setting that decides how a health worker profile is removed.
pub const PROFILE_RETENTION_KEY: &str = "retention.health_worker_profile";

/// How an entity is itself removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Removal {
    /// Row is physically deleted.
    Hard,
    /// Row stays, `deleted_at` is set.
    Soft,
    /// Identifying fields are cleared and the row is marked removed.
    Anonymize,
}

impl Removal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Removal::Hard => "hard",
            Removal::Soft => "soft",
            Removal::Anonymize => "anonymize",
        }
    }
}

impl std::fmt::Display for Removal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to dependents when their parent is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Removal fails while dependents exist.
    Restrict,
    /// Dependents are removed with their own removal mode.
    Cascade,
    /// Dependents are soft-deleted.
    SoftDelete,
    /// The referencing column is cleared.
    SetNull,
    /// Attribution only: the dependent keeps pointing at the soft-removed parent.
    Retain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub child: EntityKind,
    pub column: &'static str,
    pub parent: EntityKind,
    pub required: bool,
    pub on_delete: DeletePolicy,
}

const fn rel(
    child: EntityKind,
    column: &'static str,
    parent: EntityKind,
    required: bool,
    on_delete: DeletePolicy,
) -> Relationship {
    Relationship {
        child,
        column,
        parent,
        required,
        on_delete,
    }
}

use DeletePolicy::*;
use EntityKind as K;

pub static RELATIONSHIPS: &[Relationship] = &[
    rel(K::Location, "parent_id", K::Location, false, Restrict),
    rel(K::HealthFacility, "location_id", K::Location, true, Restrict),
    rel(K::HealthWorkerProfile, "user_id", K::User, true, Cascade),
    rel(K::HealthWorkerProfile, "primary_facility_id", K::HealthFacility, false, SetNull),
    rel(K::WorkSchedule, "profile_id", K::HealthWorkerProfile, true, Cascade),
    rel(K::WorkSchedule, "facility_id", K::HealthFacility, true, Cascade),
    rel(K::PerformanceEvaluation, "profile_id", K::HealthWorkerProfile, true, Cascade),
    rel(K::PerformanceEvaluation, "evaluator_id", K::User, true, Retain),
    rel(K::Patient, "registered_facility_id", K::HealthFacility, false, Restrict),
    rel(K::Patient, "home_location_id", K::Location, false, Restrict),
    rel(K::PatientVisit, "patient_id", K::Patient, true, SoftDelete),
    rel(K::PatientVisit, "facility_id", K::HealthFacility, true, Restrict),
    rel(K::PatientVisit, "attending_provider_id", K::User, false, SetNull),
    rel(K::HealthRecord, "patient_id", K::Patient, true, SoftDelete),
    rel(K::HealthRecord, "visit_id", K::PatientVisit, false, Retain),
    rel(K::HealthRecord, "facility_id", K::HealthFacility, true, Restrict),
    rel(K::HealthRecord, "attending_provider_id", K::User, false, Retain),
    rel(K::HealthRecord, "finalized_by", K::User, false, Retain),
    rel(K::VitalSigns, "record_id", K::HealthRecord, true, Cascade),
    rel(K::VitalSigns, "recorded_by", K::User, false, Retain),
    rel(K::Medication, "record_id", K::HealthRecord, true, Cascade),
    rel(K::Medication, "prescribed_by", K::User, false, Retain),
    rel(K::LaboratoryTest, "record_id", K::HealthRecord, true, Cascade),
    rel(K::LaboratoryTest, "ordered_by", K::User, false, Retain),
    rel(K::ImagingStudy, "record_id", K::HealthRecord, true, Cascade),
    rel(K::ImagingStudy, "ordered_by", K::User, false, Retain),
    rel(K::ImagingStudy, "radiologist_id", K::User, false, Retain),
    rel(K::RecordCorrection, "record_id", K::HealthRecord, true, Retain),
    rel(K::RecordCorrection, "author_id", K::User, false, Retain),
    rel(K::Appointment, "patient_id", K::Patient, true, Cascade),
    rel(K::Appointment, "provider_id", K::User, true, Cascade),
    rel(K::Appointment, "facility_id", K::HealthFacility, true, Restrict),
    rel(K::Appointment, "created_by", K::User, false, Retain),
];

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            K::Location => "locations",
            K::HealthFacility => "health_facilities",
            K::User => "users",
            K::HealthWorkerProfile => "health_worker_profiles",
            K::WorkSchedule => "work_schedules",
            K::PerformanceEvaluation => "performance_evaluations",
            K::Patient => "patients",
            K::PatientVisit => "patient_visits",
            K::HealthRecord => "health_records",
            K::VitalSigns => "vital_signs",
            K::Medication => "medications",
            K::LaboratoryTest => "laboratory_tests",
            K::ImagingStudy => "imaging_studies",
            K::RecordCorrection => "record_corrections",
            K::Appointment => "appointments",
        }
    }

    /// Declared removal mode. `None` for append-only entities.
    ///
    /// `Anonymize` may be replaced by `Hard` at run time, see [`removal_mode`].
    pub fn removal(&self) -> Option<Removal> {
        match self {
            K::Location | K::WorkSchedule | K::PerformanceEvaluation => Some(Removal::Hard),
            K::HealthWorkerProfile => Some(Removal::Anonymize),
            K::RecordCorrection => None,
            _ => Some(Removal::Soft),
        }
    }

    fn has_deleted_at(&self) -> bool {
        *self != K::RecordCorrection
    }

    /// Entries that belong to a health record and freeze with it.
    pub fn is_record_entry(&self) -> bool {
        matches!(
            self,
            K::VitalSigns | K::Medication | K::LaboratoryTest | K::ImagingStudy
        )
    }
}

/// Relationships in which `parent` is the referenced side.
pub fn relationships_to(parent: EntityKind) -> impl Iterator<Item = &'static Relationship> {
    RELATIONSHIPS.iter().filter(move |r| r.parent == parent)
}

/// Declared relationship for `child.column`.
pub fn relationship(child: EntityKind, column: &str) -> Option<&'static Relationship> {
    RELATIONSHIPS
        .iter()
        .find(|r| r.child == child && r.column == column)
}

/// Effective removal mode, honouring the configured retention policy.
pub fn removal_mode(conn: &Connection, kind: EntityKind) -> Result<Removal, DatabaseError> {
    match kind.removal() {
        Some(Removal::Anonymize) => {
            let policy = get_setting(conn, PROFILE_RETENTION_KEY)?;
            Ok(match policy.as_deref() {
                Some("remove") => Removal::Hard,
                _ => Removal::Anonymize,
            })
        }
        Some(mode) => Ok(mode),
        None => Err(DatabaseError::ConstraintViolation(format!(
            "{kind} rows are append-only and cannot be removed"
        ))),
    }
}

/// True when the row exists and has not been removed.
pub fn is_live(conn: &Connection, kind: EntityKind, id: &Uuid) -> Result<bool, DatabaseError> {
    let sql = if kind.has_deleted_at() {
        format!("SELECT 1 FROM {} WHERE id = ?1 AND deleted_at IS NULL", kind.table())
    } else {
        format!("SELECT 1 FROM {} WHERE id = ?1", kind.table())
    };
    let found = conn
        .query_row(&sql, params![id.to_string()], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Reject a reference to a missing or removed parent.
pub fn ensure_reference(
    conn: &Connection,
    child: EntityKind,
    column: &str,
    parent: EntityKind,
    id: &Uuid,
) -> Result<(), DatabaseError> {
    if is_live(conn, parent, id)? {
        return Ok(());
    }
    Err(DatabaseError::Integrity {
        entity_type: child.as_str().into(),
        column: column.into(),
        referenced_type: parent.as_str().into(),
        referenced_id: id.to_string(),
    })
}

/// Validate every supplied reference of `child` against the relationship table.
pub fn ensure_references(
    conn: &Connection,
    child: EntityKind,
    references: &[(&str, Option<Uuid>)],
) -> Result<(), DatabaseError> {
    for (column, id) in references {
        let rel = relationship(child, column).ok_or_else(|| {
            DatabaseError::ConstraintViolation(format!("{child}.{column} is not a declared relationship"))
        })?;
        match id {
            Some(id) => ensure_reference(conn, child, column, rel.parent, id)?,
            None if rel.required => {
                return Err(DatabaseError::ConstraintViolation(format!(
                    "{child}.{column} is required"
                )))
            }
            None => {}
        }
    }
    Ok(())
}

/// A user actor must be a live user.
pub fn ensure_actor(conn: &Connection, actor: &Actor) -> Result<(), DatabaseError> {
    match actor {
        Actor::System => Ok(()),
        Actor::User(id) if is_live(conn, K::User, id)? => Ok(()),
        Actor::User(id) => Err(DatabaseError::Integrity {
            entity_type: "audit_trail".into(),
            column: "actor_id".into(),
            referenced_type: K::User.as_str().into(),
            referenced_id: id.to_string(),
        }),
    }
}

/// Run an audited write: actor check, entity write and audit append in one savepoint.
pub fn audited<T, F>(conn: &Connection, ctx: &AuditContext, f: F) -> Result<T, DatabaseError>
where
    F: FnOnce(&Connection) -> Result<T, DatabaseError>,
{
    atomic(conn, |conn| {
        ensure_actor(conn, &ctx.actor)?;
        f(conn)
    })
}

/// Turn a zero-row optimistic update into the right error.
pub(crate) fn ensure_updated(
    conn: &Connection,
    kind: EntityKind,
    id: &Uuid,
    expected: i64,
    changed: usize,
) -> Result<(), DatabaseError> {
    if changed > 0 {
        return Ok(());
    }
    let sql = format!("SELECT version, deleted_at FROM {} WHERE id = ?1", kind.table());
    let current: Option<(i64, Option<String>)> = conn
        .query_row(&sql, params![id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;
    match current {
        Some((actual, None)) => Err(DatabaseError::ConcurrentModification {
            entity_type: kind.as_str().into(),
            id: id.to_string(),
            expected,
            actual,
        }),
        _ => Err(DatabaseError::not_found(kind.as_str(), id)),
    }
}

/// Fail with `Finalized` when `id` is a signed record or an entry of one.
pub(crate) fn ensure_not_finalized(
    conn: &Connection,
    kind: EntityKind,
    id: &Uuid,
) -> Result<(), DatabaseError> {
    let sql = match kind {
        K::HealthRecord => "SELECT finalized_at FROM health_records WHERE id = ?1".to_string(),
        k if k.is_record_entry() => format!(
            "SELECT r.finalized_at FROM {} e JOIN health_records r ON r.id = e.record_id
             WHERE e.id = ?1",
            k.table()
        ),
        _ => return Ok(()),
    };
    let finalized: Option<Option<String>> = conn
        .query_row(&sql, params![id.to_string()], |row| row.get(0))
        .optional()?;
    match finalized {
        Some(Some(_)) => Err(DatabaseError::Finalized {
            entity_type: kind.as_str().into(),
            id: id.to_string(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedEntity {
    pub kind: EntityKind,
    pub id: Uuid,
    pub removal: Removal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearedReference {
    pub kind: EntityKind,
    pub id: Uuid,
    pub column: &'static str,
}

/// Everything a [`delete_entity`] call changed, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionOutcome {
    pub removed: Vec<RemovedEntity>,
    pub cleared: Vec<ClearedReference>,
}

impl DeletionOutcome {
    /// Number of audit entries the deletion produced.
    pub fn mutations(&self) -> usize {
        self.removed.len() + self.cleared.len()
    }
}

/// Remove an entity and apply the delete policy of every relationship that
/// points at it. All or nothing.
pub fn delete_entity(
    conn: &Connection,
    ctx: &AuditContext,
    kind: EntityKind,
    id: &Uuid,
) -> Result<DeletionOutcome, DatabaseError> {
    let outcome = audited(conn, ctx, |conn| {
        let mut outcome = DeletionOutcome::default();
        remove(conn, ctx, kind, *id, None, None, &mut outcome)?;
        Ok(outcome)
    })?;
    tracing::info!(
        entity = %kind,
        id = %id,
        removed = outcome.removed.len(),
        cleared = outcome.cleared.len(),
        "entity removed"
    );
    Ok(outcome)
}

fn remove(
    conn: &Connection,
    ctx: &AuditContext,
    kind: EntityKind,
    id: Uuid,
    cause: Option<(EntityKind, Uuid)>,
    forced: Option<Removal>,
    outcome: &mut DeletionOutcome,
) -> Result<(), DatabaseError> {
    let mode = match forced {
        Some(mode) => mode,
        None => removal_mode(conn, kind)?,
    };
    if !is_live(conn, kind, &id)? {
        return Err(DatabaseError::not_found(kind.as_str(), &id));
    }
    ensure_not_finalized(conn, kind, &id)?;

    let hard = mode == Removal::Hard;
    for rel in relationships_to(kind).filter(|r| r.on_delete == Restrict) {
        let count = count_dependents(conn, rel, &id, hard)?;
        if count > 0 {
            return Err(DatabaseError::Conflict {
                entity_type: kind.as_str().into(),
                id: id.to_string(),
                dependent_type: rel.child.as_str().into(),
                count,
            });
        }
    }

    for rel in relationships_to(kind) {
        match rel.on_delete {
            Cascade => {
                for child in dependents(conn, rel, &id)? {
                    remove(conn, ctx, rel.child, child, Some((kind, id)), None, outcome)?;
                }
            }
            SoftDelete => {
                for child in dependents(conn, rel, &id)? {
                    remove(
                        conn,
                        ctx,
                        rel.child,
                        child,
                        Some((kind, id)),
                        Some(Removal::Soft),
                        outcome,
                    )?;
                }
            }
            SetNull => clear_references(conn, ctx, rel, kind, &id, outcome)?,
            Restrict | Retain => {}
        }
    }

    let ts = format_timestamp(&now());
    let table = kind.table();
    match mode {
        Removal::Hard => {
            conn.execute(
                &format!("DELETE FROM {table} WHERE id = ?1"),
                params![id.to_string()],
            )?;
        }
        Removal::Soft => {
            conn.execute(
                &format!(
                    "UPDATE {table} SET deleted_at = ?2, updated_at = ?2, version = version + 1
                     WHERE id = ?1"
                ),
                params![id.to_string(), ts],
            )?;
        }
        Removal::Anonymize => anonymize(conn, kind, &id, &ts)?,
    }

    let changes = match cause {
        Some((parent, parent_id)) => ChangeSet::summary(format!("cascade from {parent} {parent_id}")),
        None => ChangeSet::summary(format!("{mode} removal")),
    }
    .with_metadata("removal", mode.as_str());
    append_audit_entry(conn, ctx, AuditAction::Delete, kind, &id, &changes)?;

    outcome.removed.push(RemovedEntity {
        kind,
        id,
        removal: mode,
    });
    Ok(())
}

fn anonymize(conn: &Connection, kind: EntityKind, id: &Uuid, ts: &str) -> Result<(), DatabaseError> {
    match kind {
        K::HealthWorkerProfile => {
            conn.execute(
                "UPDATE health_worker_profiles SET license_number = NULL, specialization = NULL,
                 primary_facility_id = NULL, is_licensed = 0, license_expiry_date = NULL,
                 languages_spoken = '[]', qualifications = '[]', bio = NULL,
                 emergency_contact_name = NULL, emergency_contact_phone = NULL,
                 deleted_at = ?2, updated_at = ?2, version = version + 1
                 WHERE id = ?1",
                params![id.to_string(), ts],
            )?;
            Ok(())
        }
        other => Err(DatabaseError::ConstraintViolation(format!(
            "{other} does not support anonymization"
        ))),
    }
}

fn live_filter(kind: EntityKind) -> &'static str {
    if kind.has_deleted_at() {
        " AND deleted_at IS NULL"
    } else {
        ""
    }
}

/// Live dependents through `rel`, in creation order.
fn dependents(conn: &Connection, rel: &Relationship, parent_id: &Uuid) -> Result<Vec<Uuid>, DatabaseError> {
    let sql = format!(
        "SELECT id FROM {} WHERE {} = ?1{} ORDER BY created_at, id",
        rel.child.table(),
        rel.column,
        live_filter(rel.child)
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params![parent_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|s| super::parse_uuid(s)).collect()
}

/// Dependents through `rel`. Removed rows count too when the parent row goes away.
fn count_dependents(
    conn: &Connection,
    rel: &Relationship,
    parent_id: &Uuid,
    include_removed: bool,
) -> Result<i64, DatabaseError> {
    let filter = if include_removed { "" } else { live_filter(rel.child) };
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} = ?1{}",
        rel.child.table(),
        rel.column,
        filter
    );
    let count = conn.query_row(&sql, params![parent_id.to_string()], |row| row.get(0))?;
    Ok(count)
}

fn clear_references(
    conn: &Connection,
    ctx: &AuditContext,
    rel: &'static Relationship,
    parent: EntityKind,
    parent_id: &Uuid,
    outcome: &mut DeletionOutcome,
) -> Result<(), DatabaseError> {
    let ts = format_timestamp(&now());
    let update = format!(
        "UPDATE {} SET {} = NULL, updated_at = ?2, version = version + 1 WHERE id = ?1",
        rel.child.table(),
        rel.column
    );
    for child in dependents(conn, rel, parent_id)? {
        ensure_not_finalized(conn, rel.child, &child)?;
        conn.execute(&update, params![child.to_string(), ts])?;
        let changes = ChangeSet::fields([rel.column])
            .with_summary(format!("cascade from {parent} {parent_id}"));
        append_audit_entry(conn, ctx, AuditAction::Update, rel.child, &child, &changes)?;
        outcome.cleared.push(ClearedReference {
            kind: rel.child,
            id: child,
            column: rel.column,
        });
    }
    Ok(())
}
