use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{
    append_audit_entry, from_json, like_pattern, map_unique, opt_id, require_text, to_json,
    validate_optional_phone,
};
use crate::db::integrity::{audited, ensure_references, ensure_updated};
use crate::db::{
    format_timestamp, now, parse_date, parse_optional_uuid, parse_timestamp, parse_uuid,
    to_stored, DatabaseError,
};
use crate::models::*;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9-]{3,20}$").expect("valid identifier regex"));

const IDENTIFIER_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const IDENTIFIER_ATTEMPTS: usize = 8;

pub(crate) const PATIENT_COLUMNS: &str = "id, patient_identifier, first_name, middle_name, last_name,
    date_of_birth, gender, phone_number, address, registered_facility_id, home_location_id,
    blood_type, allergies, chronic_conditions, registration_date, is_active, created_at,
    updated_at, version";

const VISIT_COLUMNS: &str = "id, patient_id, facility_id, attending_provider_id, visit_type, status,
    visit_at, chief_complaint, diagnosis, notes, created_at, updated_at, version";

/// `PAT-` followed by eight random uppercase alphanumerics.
fn generate_identifier() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| IDENTIFIER_ALPHABET[rng.gen_range(0..IDENTIFIER_ALPHABET.len())] as char)
        .collect();
    format!("PAT-{suffix}")
}

fn identifier_taken(conn: &Connection, identifier: &str) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM patients WHERE patient_identifier = ?1",
            params![identifier],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn assign_identifier(conn: &Connection, requested: Option<&str>) -> Result<String, DatabaseError> {
    if let Some(identifier) = requested {
        if !IDENTIFIER_RE.is_match(identifier) {
            return Err(DatabaseError::ConstraintViolation(format!(
                "patient.patient_identifier '{identifier}' must be 3 to 20 of A-Z, 0-9 or '-'"
            )));
        }
        return Ok(identifier.to_string());
    }
    for _ in 0..IDENTIFIER_ATTEMPTS {
        let candidate = generate_identifier();
        if !identifier_taken(conn, &candidate)? {
            return Ok(candidate);
        }
        tracing::debug!("patient identifier collision, retrying");
    }
    Err(DatabaseError::ConstraintViolation(
        "could not generate a free patient identifier".into(),
    ))
}

fn validate_patient(
    first_name: &str,
    last_name: &str,
    phone_number: Option<&str>,
) -> Result<(), DatabaseError> {
    require_text("patient", "first_name", first_name)?;
    require_text("patient", "last_name", last_name)?;
    validate_optional_phone("patient", "phone_number", phone_number)
}

pub fn create_patient(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewPatient,
) -> Result<Patient, DatabaseError> {
    validate_patient(&new.first_name, &new.last_name, new.phone_number.as_deref())?;

    let patient = audited(conn, ctx, |conn| {
        ensure_references(
            conn,
            EntityKind::Patient,
            &[
                ("registered_facility_id", new.registered_facility_id),
                ("home_location_id", new.home_location_id),
            ],
        )?;

        let identifier = assign_identifier(conn, new.patient_identifier.as_deref())?;
        let ts = now();
        let patient = Patient {
            id: Uuid::new_v4(),
            patient_identifier: identifier,
            first_name: new.first_name.clone(),
            middle_name: new.middle_name.clone(),
            last_name: new.last_name.clone(),
            date_of_birth: new.date_of_birth,
            gender: new.gender,
            phone_number: new.phone_number.clone(),
            address: new.address.clone(),
            registered_facility_id: new.registered_facility_id,
            home_location_id: new.home_location_id,
            blood_type: new.blood_type,
            allergies: new.allergies.clone(),
            chronic_conditions: new.chronic_conditions.clone(),
            registration_date: new.registration_date.map_or(ts, to_stored),
            is_active: true,
            created_at: ts,
            updated_at: ts,
            version: 1,
        };
        ensure_born_by_registration(patient.date_of_birth, &patient.registration_date)?;

        conn.execute(
            "INSERT INTO patients (id, patient_identifier, first_name, middle_name, last_name,
             date_of_birth, gender, phone_number, address, registered_facility_id,
             home_location_id, blood_type, allergies, chronic_conditions, registration_date,
             is_active, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 1, ?16, ?16, 1)",
            params![
                patient.id.to_string(),
                patient.patient_identifier,
                patient.first_name,
                patient.middle_name,
                patient.last_name,
                patient.date_of_birth.to_string(),
                patient.gender.as_str(),
                patient.phone_number,
                patient.address,
                opt_id(patient.registered_facility_id),
                opt_id(patient.home_location_id),
                patient.blood_type.map(|b| b.as_str()),
                to_json(&patient.allergies)?,
                to_json(&patient.chronic_conditions)?,
                format_timestamp(&patient.registration_date),
                format_timestamp(&ts),
            ],
        )
        .map_err(|e| map_unique(e, "patient", "patient_identifier", &patient.patient_identifier))?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::Patient,
            &patient.id,
            &ChangeSet::fields([
                "patient_identifier",
                "first_name",
                "middle_name",
                "last_name",
                "date_of_birth",
                "gender",
                "phone_number",
                "address",
                "registered_facility_id",
                "home_location_id",
                "blood_type",
                "allergies",
                "chronic_conditions",
                "registration_date",
            ]),
        )?;
        Ok(patient)
    })?;

    tracing::info!(id = %patient.id, "patient registered");
    Ok(patient)
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Option<Patient>, DatabaseError> {
    query_patient(conn, "id = ?1", &id.to_string())
}

pub fn get_patient_by_identifier(
    conn: &Connection,
    identifier: &str,
) -> Result<Option<Patient>, DatabaseError> {
    query_patient(conn, "patient_identifier = ?1", identifier)
}

fn query_patient(conn: &Connection, predicate: &str, value: &str) -> Result<Option<Patient>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE {predicate} AND deleted_at IS NULL"),
            params![value],
            read_patient_row,
        )
        .optional()?;
    row.map(patient_from_row).transpose()
}

fn ensure_born_by_registration(
    date_of_birth: NaiveDate,
    registration_date: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    if date_of_birth > registration_date.date_naive() {
        return Err(DatabaseError::ConstraintViolation(
            "patient.date_of_birth is after the registration date".into(),
        ));
    }
    Ok(())
}

pub fn update_patient(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    update: &PatientUpdate,
) -> Result<Patient, DatabaseError> {
    validate_patient(&update.first_name, &update.last_name, update.phone_number.as_deref())?;

    audited(conn, ctx, |conn| {
        let before = get_patient(conn, id)?.ok_or_else(|| DatabaseError::not_found("patient", id))?;
        ensure_born_by_registration(update.date_of_birth, &before.registration_date)?;
        ensure_references(
            conn,
            EntityKind::Patient,
            &[
                ("registered_facility_id", update.registered_facility_id),
                ("home_location_id", update.home_location_id),
            ],
        )?;

        let changed = conn.execute(
            "UPDATE patients SET first_name = ?3, middle_name = ?4, last_name = ?5,
             date_of_birth = ?6, gender = ?7, phone_number = ?8, address = ?9,
             registered_facility_id = ?10, home_location_id = ?11, blood_type = ?12,
             allergies = ?13, chronic_conditions = ?14, is_active = ?15, updated_at = ?16,
             version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
            params![
                id.to_string(),
                expected_version,
                update.first_name,
                update.middle_name,
                update.last_name,
                update.date_of_birth.to_string(),
                update.gender.as_str(),
                update.phone_number,
                update.address,
                opt_id(update.registered_facility_id),
                opt_id(update.home_location_id),
                update.blood_type.map(|b| b.as_str()),
                to_json(&update.allergies)?,
                to_json(&update.chronic_conditions)?,
                update.is_active,
                format_timestamp(&now()),
            ],
        )?;
        ensure_updated(conn, EntityKind::Patient, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::Patient,
            id,
            &ChangeSet::fields(changed_patient_fields(&before, update)),
        )?;
        get_patient(conn, id)?.ok_or_else(|| DatabaseError::not_found("patient", id))
    })
}

fn changed_patient_fields(before: &Patient, after: &PatientUpdate) -> Vec<&'static str> {
    let unchanged = PatientUpdate::from(before);
    let mut fields = Vec::new();
    let mut check = |differs: bool, name: &'static str| {
        if differs {
            fields.push(name);
        }
    };
    check(unchanged.first_name != after.first_name, "first_name");
    check(unchanged.middle_name != after.middle_name, "middle_name");
    check(unchanged.last_name != after.last_name, "last_name");
    check(unchanged.date_of_birth != after.date_of_birth, "date_of_birth");
    check(unchanged.gender != after.gender, "gender");
    check(unchanged.phone_number != after.phone_number, "phone_number");
    check(unchanged.address != after.address, "address");
    check(
        unchanged.registered_facility_id != after.registered_facility_id,
        "registered_facility_id",
    );
    check(unchanged.home_location_id != after.home_location_id, "home_location_id");
    check(unchanged.blood_type != after.blood_type, "blood_type");
    check(unchanged.allergies != after.allergies, "allergies");
    check(unchanged.chronic_conditions != after.chronic_conditions, "chronic_conditions");
    check(unchanged.is_active != after.is_active, "is_active");
    fields
}

/// Live patients matching `filter`, ordered by `(created_at, id)`.
pub fn list_patients(
    conn: &Connection,
    filter: &PatientFilter,
    page: &Page,
) -> Result<Paged<Patient>, DatabaseError> {
    let limit = page.effective_limit();
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patients
         WHERE deleted_at IS NULL
           AND (?1 IS NULL OR registered_facility_id = ?1)
           AND (?2 IS NULL OR gender = ?2)
           AND (?3 IS NULL OR is_active = ?3)
           AND (?4 IS NULL OR lower(first_name || ' ' || last_name) LIKE ?4)
           AND (?5 IS NULL OR created_at > ?5 OR (created_at = ?5 AND id > ?6))
         ORDER BY created_at, id
         LIMIT ?7"
    ))?;
    let rows = stmt
        .query_map(
            params![
                opt_id(filter.registered_facility_id),
                filter.gender.map(|g| g.as_str()),
                filter.is_active,
                like_pattern(filter.name_contains.as_deref()),
                page.after.map(|c| format_timestamp(&c.created_at)),
                page.after.map(|c| c.id.to_string()),
                limit + 1,
            ],
            read_patient_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let patients = rows.into_iter().map(patient_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::from_overfetch(patients, limit))
}

pub(crate) struct PatientRow {
    id: String,
    patient_identifier: String,
    first_name: String,
    middle_name: Option<String>,
    last_name: String,
    date_of_birth: String,
    gender: String,
    phone_number: Option<String>,
    address: String,
    registered_facility_id: Option<String>,
    home_location_id: Option<String>,
    blood_type: Option<String>,
    allergies: String,
    chronic_conditions: String,
    registration_date: String,
    is_active: bool,
    created_at: String,
    updated_at: String,
    version: i64,
}

pub(crate) fn read_patient_row(row: &rusqlite::Row) -> rusqlite::Result<PatientRow> {
    Ok(PatientRow {
        id: row.get(0)?,
        patient_identifier: row.get(1)?,
        first_name: row.get(2)?,
        middle_name: row.get(3)?,
        last_name: row.get(4)?,
        date_of_birth: row.get(5)?,
        gender: row.get(6)?,
        phone_number: row.get(7)?,
        address: row.get(8)?,
        registered_facility_id: row.get(9)?,
        home_location_id: row.get(10)?,
        blood_type: row.get(11)?,
        allergies: row.get(12)?,
        chronic_conditions: row.get(13)?,
        registration_date: row.get(14)?,
        is_active: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
        version: row.get(18)?,
    })
}

pub(crate) fn patient_from_row(row: PatientRow) -> Result<Patient, DatabaseError> {
    Ok(Patient {
        id: parse_uuid(&row.id)?,
        patient_identifier: row.patient_identifier,
        first_name: row.first_name,
        middle_name: row.middle_name,
        last_name: row.last_name,
        date_of_birth: parse_date(&row.date_of_birth)?,
        gender: Gender::from_str(&row.gender)?,
        phone_number: row.phone_number,
        address: row.address,
        registered_facility_id: parse_optional_uuid(row.registered_facility_id)?,
        home_location_id: parse_optional_uuid(row.home_location_id)?,
        blood_type: row.blood_type.as_deref().map(BloodType::from_str).transpose()?,
        allergies: from_json(&row.allergies)?,
        chronic_conditions: from_json(&row.chronic_conditions)?,
        registration_date: parse_timestamp(&row.registration_date)?,
        is_active: row.is_active,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        version: row.version,
    })
}

// ── Visits ──────────────────────────────────────────────────────────────────

/// Visits can only be opened for a live patient, never before registration.
pub fn create_visit(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewPatientVisit,
) -> Result<PatientVisit, DatabaseError> {
    let visit = audited(conn, ctx, |conn| {
        ensure_references(
            conn,
            EntityKind::PatientVisit,
            &[
                ("patient_id", Some(new.patient_id)),
                ("facility_id", Some(new.facility_id)),
                ("attending_provider_id", new.attending_provider_id),
            ],
        )?;
        let patient = get_patient(conn, &new.patient_id)?
            .ok_or_else(|| DatabaseError::not_found("patient", &new.patient_id))?;
        if to_stored(new.visit_at) < patient.registration_date {
            return Err(DatabaseError::ConstraintViolation(
                "patient_visit.visit_at precedes the patient's registration".into(),
            ));
        }

        let ts = now();
        let visit = PatientVisit {
            id: Uuid::new_v4(),
            patient_id: new.patient_id,
            facility_id: new.facility_id,
            attending_provider_id: new.attending_provider_id,
            visit_type: new.visit_type,
            status: new.status,
            visit_at: to_stored(new.visit_at),
            chief_complaint: new.chief_complaint.clone(),
            diagnosis: new.diagnosis.clone(),
            notes: new.notes.clone(),
            created_at: ts,
            updated_at: ts,
            version: 1,
        };
        conn.execute(
            "INSERT INTO patient_visits (id, patient_id, facility_id, attending_provider_id,
             visit_type, status, visit_at, chief_complaint, diagnosis, notes, created_at,
             updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 1)",
            params![
                visit.id.to_string(),
                visit.patient_id.to_string(),
                visit.facility_id.to_string(),
                opt_id(visit.attending_provider_id),
                visit.visit_type.as_str(),
                visit.status.as_str(),
                format_timestamp(&visit.visit_at),
                visit.chief_complaint,
                visit.diagnosis,
                visit.notes,
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::PatientVisit,
            &visit.id,
            &ChangeSet::fields([
                "patient_id",
                "facility_id",
                "attending_provider_id",
                "visit_type",
                "status",
                "visit_at",
                "chief_complaint",
                "diagnosis",
                "notes",
            ]),
        )?;
        Ok(visit)
    })?;

    tracing::debug!(id = %visit.id, patient = %visit.patient_id, "visit created");
    Ok(visit)
}

pub fn get_visit(conn: &Connection, id: &Uuid) -> Result<Option<PatientVisit>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {VISIT_COLUMNS} FROM patient_visits WHERE id = ?1 AND deleted_at IS NULL"),
            params![id.to_string()],
            read_visit_row,
        )
        .optional()?;
    row.map(visit_from_row).transpose()
}

pub fn update_visit(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    update: &PatientVisitUpdate,
) -> Result<PatientVisit, DatabaseError> {
    audited(conn, ctx, |conn| {
        let before = get_visit(conn, id)?.ok_or_else(|| DatabaseError::not_found("patient_visit", id))?;
        ensure_references(
            conn,
            EntityKind::PatientVisit,
            &[("attending_provider_id", update.attending_provider_id)],
        )?;
        let patient = get_patient(conn, &before.patient_id)?
            .ok_or_else(|| DatabaseError::not_found("patient", &before.patient_id))?;
        if to_stored(update.visit_at) < patient.registration_date {
            return Err(DatabaseError::ConstraintViolation(
                "patient_visit.visit_at precedes the patient's registration".into(),
            ));
        }

        let changed = conn.execute(
            "UPDATE patient_visits SET attending_provider_id = ?3, status = ?4, visit_at = ?5,
             chief_complaint = ?6, diagnosis = ?7, notes = ?8, updated_at = ?9,
             version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
            params![
                id.to_string(),
                expected_version,
                opt_id(update.attending_provider_id),
                update.status.as_str(),
                format_timestamp(&update.visit_at),
                update.chief_complaint,
                update.diagnosis,
                update.notes,
                format_timestamp(&now()),
            ],
        )?;
        ensure_updated(conn, EntityKind::PatientVisit, id, expected_version, changed)?;

        let mut fields = Vec::new();
        if before.attending_provider_id != update.attending_provider_id {
            fields.push("attending_provider_id");
        }
        if before.status != update.status {
            fields.push("status");
        }
        if before.visit_at != update.visit_at {
            fields.push("visit_at");
        }
        if before.chief_complaint != update.chief_complaint {
            fields.push("chief_complaint");
        }
        if before.diagnosis != update.diagnosis {
            fields.push("diagnosis");
        }
        if before.notes != update.notes {
            fields.push("notes");
        }
        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::PatientVisit,
            id,
            &ChangeSet::fields(fields),
        )?;
        get_visit(conn, id)?.ok_or_else(|| DatabaseError::not_found("patient_visit", id))
    })
}

pub fn list_visits_for_patient(
    conn: &Connection,
    patient_id: &Uuid,
    page: &Page,
) -> Result<Paged<PatientVisit>, DatabaseError> {
    let limit = page.effective_limit();
    let mut stmt = conn.prepare(&format!(
        "SELECT {VISIT_COLUMNS} FROM patient_visits
         WHERE patient_id = ?1 AND deleted_at IS NULL
           AND (?2 IS NULL OR created_at > ?2 OR (created_at = ?2 AND id > ?3))
         ORDER BY created_at, id
         LIMIT ?4"
    ))?;
    let rows = stmt
        .query_map(
            params![
                patient_id.to_string(),
                page.after.map(|c| format_timestamp(&c.created_at)),
                page.after.map(|c| c.id.to_string()),
                limit + 1,
            ],
            read_visit_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let visits = rows.into_iter().map(visit_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::from_overfetch(visits, limit))
}

struct VisitRow {
    id: String,
    patient_id: String,
    facility_id: String,
    attending_provider_id: Option<String>,
    visit_type: String,
    status: String,
    visit_at: String,
    chief_complaint: Option<String>,
    diagnosis: Option<String>,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

fn read_visit_row(row: &rusqlite::Row) -> rusqlite::Result<VisitRow> {
    Ok(VisitRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        facility_id: row.get(2)?,
        attending_provider_id: row.get(3)?,
        visit_type: row.get(4)?,
        status: row.get(5)?,
        visit_at: row.get(6)?,
        chief_complaint: row.get(7)?,
        diagnosis: row.get(8)?,
        notes: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        version: row.get(12)?,
    })
}

fn visit_from_row(row: VisitRow) -> Result<PatientVisit, DatabaseError> {
    Ok(PatientVisit {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        facility_id: parse_uuid(&row.facility_id)?,
        attending_provider_id: parse_optional_uuid(row.attending_provider_id)?,
        visit_type: VisitType::from_str(&row.visit_type)?,
        status: VisitStatus::from_str(&row.status)?,
        visit_at: parse_timestamp(&row.visit_at)?,
        chief_complaint: row.chief_complaint,
        diagnosis: row.diagnosis,
        notes: row.notes,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        version: row.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::*;
    use chrono::Duration;

    #[test]
    fn generated_identifier_has_expected_shape() {
        let conn = db();
        let patient = patient(&conn, None);
        assert!(patient.patient_identifier.starts_with("PAT-"));
        assert_eq!(patient.patient_identifier.len(), 12);
        assert!(IDENTIFIER_RE.is_match(&patient.patient_identifier));
    }

    #[test]
    fn supplied_identifier_is_validated_and_unique() {
        let conn = db();
        let ctx = AuditContext::system();
        let mut new = new_patient("Amina", "Hassan");
        new.patient_identifier = Some("KE-0001".into());
        create_patient(&conn, &ctx, &new).unwrap();

        let again = create_patient(&conn, &ctx, &new);
        assert!(matches!(
            again,
            Err(DatabaseError::Duplicate { ref field, .. }) if field == "patient_identifier"
        ));

        new.patient_identifier = Some("lower-case".into());
        let bad = create_patient(&conn, &ctx, &new);
        assert!(matches!(bad, Err(DatabaseError::ConstraintViolation(_))));
    }

    #[test]
    fn identifier_is_immutable_in_storage() {
        let conn = db();
        let patient = patient(&conn, None);
        let result = conn.execute(
            "UPDATE patients SET patient_identifier = 'PAT-CHANGED' WHERE id = ?1",
            params![patient.id.to_string()],
        );
        assert!(result.is_err());
        let stored = get_patient(&conn, &patient.id).unwrap().unwrap();
        assert_eq!(stored.patient_identifier, patient.patient_identifier);
    }

    #[test]
    fn lookup_by_identifier() {
        let conn = db();
        let patient = patient(&conn, None);
        let found = get_patient_by_identifier(&conn, &patient.patient_identifier).unwrap().unwrap();
        assert_eq!(found, patient);
    }

    #[test]
    fn missing_facility_is_an_integrity_error() {
        let conn = db();
        let mut new = new_patient("Amina", "Hassan");
        new.registered_facility_id = Some(Uuid::new_v4());
        let result = create_patient(&conn, &AuditContext::system(), &new);
        assert!(matches!(
            result,
            Err(DatabaseError::Integrity { ref column, .. }) if column == "registered_facility_id"
        ));
    }

    #[test]
    fn update_records_only_changed_fields() {
        let conn = db();
        let ctx = AuditContext::system();
        let patient = patient(&conn, None);

        let mut update = PatientUpdate::from(&patient);
        update.blood_type = Some(BloodType::OPositive);
        update.allergies = vec!["penicillin".into()];
        let updated = update_patient(&conn, &ctx, &patient.id, patient.version, &update).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.patient_identifier, patient.patient_identifier);

        let entries = crate::db::entries_for_target(&conn, EntityKind::Patient, &patient.id).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.action, AuditAction::Update);
        let fields: Vec<&str> = last.changes.fields.iter().map(String::as_str).collect();
        assert_eq!(fields, vec!["allergies", "blood_type"]);
    }

    #[test]
    fn update_cannot_move_birth_after_registration() {
        let conn = db();
        let ctx = AuditContext::system();
        let patient = patient(&conn, None);
        let before = crate::db::count_audit_entries(&conn).unwrap();

        let mut update = PatientUpdate::from(&patient);
        update.date_of_birth = patient.registration_date.date_naive() + Duration::days(365);
        let result = update_patient(&conn, &ctx, &patient.id, patient.version, &update);
        assert!(matches!(result, Err(DatabaseError::ConstraintViolation(_))));

        let stored = get_patient(&conn, &patient.id).unwrap().unwrap();
        assert_eq!(stored, patient);
        assert_eq!(crate::db::count_audit_entries(&conn).unwrap(), before);

        update.date_of_birth = patient.registration_date.date_naive();
        let updated = update_patient(&conn, &ctx, &patient.id, patient.version, &update).unwrap();
        assert_eq!(updated.date_of_birth, patient.registration_date.date_naive());
    }

    #[test]
    fn list_patients_pages_and_filters() {
        let conn = db();
        let ctx = AuditContext::system();
        for (first, last) in [("Ann", "Mwangi"), ("Ben", "Mwangi"), ("Cal", "Odhiambo")] {
            create_patient(&conn, &ctx, &new_patient(first, last)).unwrap();
        }

        let first = list_patients(&conn, &PatientFilter::default(), &Page::first(2)).unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next.unwrap();
        let second = list_patients(&conn, &PatientFilter::default(), &Page::after(2, cursor)).unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].first_name, "Cal");
        assert!(second.next.is_none());

        let filter = PatientFilter {
            name_contains: Some("MWANGI".into()),
            ..Default::default()
        };
        let mwangis = list_patients(&conn, &filter, &Page::default()).unwrap();
        assert_eq!(mwangis.items.len(), 2);
    }

    #[test]
    fn visit_cannot_precede_registration() {
        let conn = db();
        let (_, _, county) = location_tree(&conn);
        let facility = facility(&conn, county.id);
        let patient = patient(&conn, Some(facility.id));

        let result = create_visit(
            &conn,
            &AuditContext::system(),
            &NewPatientVisit {
                patient_id: patient.id,
                facility_id: facility.id,
                attending_provider_id: None,
                visit_type: VisitType::Emergency,
                status: VisitStatus::Completed,
                visit_at: patient.registration_date - Duration::hours(1),
                chief_complaint: None,
                diagnosis: None,
                notes: None,
            },
        );
        assert!(matches!(result, Err(DatabaseError::ConstraintViolation(_))));
    }

    #[test]
    fn visit_update_and_listing() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, _, county) = location_tree(&conn);
        let facility = facility(&conn, county.id);
        let patient = patient(&conn, Some(facility.id));
        let visit = visit(&conn, &patient, facility.id);

        let updated = update_visit(
            &conn,
            &ctx,
            &visit.id,
            visit.version,
            &PatientVisitUpdate {
                attending_provider_id: None,
                status: VisitStatus::Completed,
                visit_at: visit.visit_at,
                chief_complaint: visit.chief_complaint.clone(),
                diagnosis: Some("Malaria".into()),
                notes: None,
            },
        )
        .unwrap();
        assert_eq!(updated.diagnosis.as_deref(), Some("Malaria"));
        assert_eq!(updated.version, 2);

        let visits = list_visits_for_patient(&conn, &patient.id, &Page::default()).unwrap();
        assert_eq!(visits.items, vec![updated]);
    }
}
