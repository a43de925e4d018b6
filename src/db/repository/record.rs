use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{append_audit_entry, from_json, opt_id, require_text, to_json};
use crate::db::integrity::{audited, ensure_not_finalized, ensure_references, ensure_updated};
use crate::db::{
    format_timestamp, now, parse_date, parse_optional_timestamp, parse_optional_uuid,
    parse_timestamp, parse_uuid, to_stored, DatabaseError,
};
use crate::models::*;

const RECORD_COLUMNS: &str = "id, patient_id, visit_id, facility_id, attending_provider_id,
    record_type, record_date, chief_complaint, assessment, diagnosis, treatment_plan, notes,
    is_confidential, finalized_at, finalized_by, created_at, updated_at, version";

fn ensure_visit_belongs(
    conn: &Connection,
    visit_id: Option<Uuid>,
    patient_id: &Uuid,
) -> Result<(), DatabaseError> {
    let Some(visit_id) = visit_id else {
        return Ok(());
    };
    let owner: Option<String> = conn
        .query_row(
            "SELECT patient_id FROM patient_visits WHERE id = ?1 AND deleted_at IS NULL",
            params![visit_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        Some(owner) if owner == patient_id.to_string() => Ok(()),
        _ => Err(DatabaseError::ConstraintViolation(format!(
            "health_record.visit_id {visit_id} is not a visit of patient {patient_id}"
        ))),
    }
}

pub fn create_health_record(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewHealthRecord,
) -> Result<HealthRecord, DatabaseError> {
    let record = audited(conn, ctx, |conn| {
        ensure_references(
            conn,
            EntityKind::HealthRecord,
            &[
                ("patient_id", Some(new.patient_id)),
                ("visit_id", new.visit_id),
                ("facility_id", Some(new.facility_id)),
                ("attending_provider_id", new.attending_provider_id),
            ],
        )?;
        ensure_visit_belongs(conn, new.visit_id, &new.patient_id)?;

        let ts = now();
        let record = HealthRecord {
            id: Uuid::new_v4(),
            patient_id: new.patient_id,
            visit_id: new.visit_id,
            facility_id: new.facility_id,
            attending_provider_id: new.attending_provider_id,
            record_type: new.record_type,
            record_date: to_stored(new.record_date),
            chief_complaint: new.chief_complaint.clone(),
            assessment: new.assessment.clone(),
            diagnosis: new.diagnosis.clone(),
            treatment_plan: new.treatment_plan.clone(),
            notes: new.notes.clone(),
            is_confidential: new.is_confidential,
            finalized_at: None,
            finalized_by: None,
            created_at: ts,
            updated_at: ts,
            version: 1,
        };
        conn.execute(
            "INSERT INTO health_records (id, patient_id, visit_id, facility_id,
             attending_provider_id, record_type, record_date, chief_complaint, assessment,
             diagnosis, treatment_plan, notes, is_confidential, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, 1)",
            params![
                record.id.to_string(),
                record.patient_id.to_string(),
                opt_id(record.visit_id),
                record.facility_id.to_string(),
                opt_id(record.attending_provider_id),
                record.record_type.as_str(),
                format_timestamp(&record.record_date),
                record.chief_complaint,
                record.assessment,
                to_json(&record.diagnosis)?,
                record.treatment_plan,
                record.notes,
                record.is_confidential,
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::HealthRecord,
            &record.id,
            &ChangeSet::fields([
                "patient_id",
                "visit_id",
                "facility_id",
                "attending_provider_id",
                "record_type",
                "record_date",
                "chief_complaint",
                "assessment",
                "diagnosis",
                "treatment_plan",
                "notes",
                "is_confidential",
            ]),
        )?;
        Ok(record)
    })?;

    tracing::info!(id = %record.id, kind = %record.record_type, "health record created");
    Ok(record)
}

pub fn get_health_record(conn: &Connection, id: &Uuid) -> Result<Option<HealthRecord>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM health_records WHERE id = ?1 AND deleted_at IS NULL"),
            params![id.to_string()],
            read_record_row,
        )
        .optional()?;
    row.map(record_from_row).transpose()
}

/// Edit an unsigned record. Signed records only accept corrections.
pub fn update_health_record(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    update: &HealthRecordUpdate,
) -> Result<HealthRecord, DatabaseError> {
    audited(conn, ctx, |conn| {
        let before =
            get_health_record(conn, id)?.ok_or_else(|| DatabaseError::not_found("health_record", id))?;
        ensure_not_finalized(conn, EntityKind::HealthRecord, id)?;
        ensure_references(
            conn,
            EntityKind::HealthRecord,
            &[("attending_provider_id", update.attending_provider_id)],
        )?;

        let changed = conn.execute(
            "UPDATE health_records SET attending_provider_id = ?3, chief_complaint = ?4,
             assessment = ?5, diagnosis = ?6, treatment_plan = ?7, notes = ?8,
             is_confidential = ?9, updated_at = ?10, version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL AND finalized_at IS NULL",
            params![
                id.to_string(),
                expected_version,
                opt_id(update.attending_provider_id),
                update.chief_complaint,
                update.assessment,
                to_json(&update.diagnosis)?,
                update.treatment_plan,
                update.notes,
                update.is_confidential,
                format_timestamp(&now()),
            ],
        )?;
        ensure_updated(conn, EntityKind::HealthRecord, id, expected_version, changed)?;

        let unchanged = HealthRecordUpdate::from(&before);
        let mut fields = Vec::new();
        if unchanged.attending_provider_id != update.attending_provider_id {
            fields.push("attending_provider_id");
        }
        if unchanged.chief_complaint != update.chief_complaint {
            fields.push("chief_complaint");
        }
        if unchanged.assessment != update.assessment {
            fields.push("assessment");
        }
        if unchanged.diagnosis != update.diagnosis {
            fields.push("diagnosis");
        }
        if unchanged.treatment_plan != update.treatment_plan {
            fields.push("treatment_plan");
        }
        if unchanged.notes != update.notes {
            fields.push("notes");
        }
        if unchanged.is_confidential != update.is_confidential {
            fields.push("is_confidential");
        }
        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::HealthRecord,
            id,
            &ChangeSet::fields(fields),
        )?;
        get_health_record(conn, id)?.ok_or_else(|| DatabaseError::not_found("health_record", id))
    })
}

/// Sign a record. From here on the record and its entries are frozen.
pub fn finalize_health_record(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
) -> Result<HealthRecord, DatabaseError> {
    let record = audited(conn, ctx, |conn| {
        ensure_not_finalized(conn, EntityKind::HealthRecord, id)?;
        let ts = format_timestamp(&now());
        let changed = conn.execute(
            "UPDATE health_records SET finalized_at = ?3, finalized_by = ?4, updated_at = ?3,
             version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL AND finalized_at IS NULL",
            params![id.to_string(), expected_version, ts, opt_id(ctx.actor.user_id())],
        )?;
        ensure_updated(conn, EntityKind::HealthRecord, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::HealthRecord,
            id,
            &ChangeSet::fields(["finalized_at", "finalized_by"]).with_summary("finalized"),
        )?;
        get_health_record(conn, id)?.ok_or_else(|| DatabaseError::not_found("health_record", id))
    })?;

    tracing::info!(id = %record.id, "health record finalized");
    Ok(record)
}

pub fn list_health_records(
    conn: &Connection,
    filter: &HealthRecordFilter,
    page: &Page,
) -> Result<Paged<HealthRecord>, DatabaseError> {
    let limit = page.effective_limit();
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM health_records
         WHERE deleted_at IS NULL
           AND (?1 IS NULL OR patient_id = ?1)
           AND (?2 IS NULL OR facility_id = ?2)
           AND (?3 IS NULL OR record_type = ?3)
           AND (?4 IS NULL OR (finalized_at IS NOT NULL) = ?4)
           AND (?5 IS NULL OR record_date >= ?5)
           AND (?6 IS NULL OR record_date < ?6)
           AND (?7 IS NULL OR created_at > ?7 OR (created_at = ?7 AND id > ?8))
         ORDER BY created_at, id
         LIMIT ?9"
    ))?;
    let rows = stmt
        .query_map(
            params![
                opt_id(filter.patient_id),
                opt_id(filter.facility_id),
                filter.record_type.map(|t| t.as_str()),
                filter.finalized,
                filter.from.map(|ts| format_timestamp(&ts)),
                filter.to.map(|ts| format_timestamp(&ts)),
                page.after.map(|c| format_timestamp(&c.created_at)),
                page.after.map(|c| c.id.to_string()),
                limit + 1,
            ],
            read_record_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let records = rows.into_iter().map(record_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::from_overfetch(records, limit))
}

struct RecordRow {
    id: String,
    patient_id: String,
    visit_id: Option<String>,
    facility_id: String,
    attending_provider_id: Option<String>,
    record_type: String,
    record_date: String,
    chief_complaint: Option<String>,
    assessment: Option<String>,
    diagnosis: String,
    treatment_plan: Option<String>,
    notes: Option<String>,
    is_confidential: bool,
    finalized_at: Option<String>,
    finalized_by: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

fn read_record_row(row: &rusqlite::Row) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        visit_id: row.get(2)?,
        facility_id: row.get(3)?,
        attending_provider_id: row.get(4)?,
        record_type: row.get(5)?,
        record_date: row.get(6)?,
        chief_complaint: row.get(7)?,
        assessment: row.get(8)?,
        diagnosis: row.get(9)?,
        treatment_plan: row.get(10)?,
        notes: row.get(11)?,
        is_confidential: row.get(12)?,
        finalized_at: row.get(13)?,
        finalized_by: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        version: row.get(17)?,
    })
}

fn record_from_row(row: RecordRow) -> Result<HealthRecord, DatabaseError> {
    Ok(HealthRecord {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        visit_id: parse_optional_uuid(row.visit_id)?,
        facility_id: parse_uuid(&row.facility_id)?,
        attending_provider_id: parse_optional_uuid(row.attending_provider_id)?,
        record_type: RecordType::from_str(&row.record_type)?,
        record_date: parse_timestamp(&row.record_date)?,
        chief_complaint: row.chief_complaint,
        assessment: row.assessment,
        diagnosis: from_json(&row.diagnosis)?,
        treatment_plan: row.treatment_plan,
        notes: row.notes,
        is_confidential: row.is_confidential,
        finalized_at: parse_optional_timestamp(row.finalized_at)?,
        finalized_by: parse_optional_uuid(row.finalized_by)?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        version: row.version,
    })
}

// ── Record entries ──────────────────────────────────────────────────────────

/// Entries can only be added to a live record that has not been signed.
fn ensure_open_record(
    conn: &Connection,
    kind: EntityKind,
    record_id: &Uuid,
    references: &[(&str, Option<Uuid>)],
) -> Result<(), DatabaseError> {
    ensure_references(conn, kind, &[("record_id", Some(*record_id))])?;
    ensure_references(conn, kind, references)?;
    ensure_not_finalized(conn, EntityKind::HealthRecord, record_id)
}

fn check_range(field: &str, value: Option<u32>, max: u32) -> Result<(), DatabaseError> {
    match value {
        Some(v) if v > max => Err(DatabaseError::ConstraintViolation(format!(
            "vital_signs.{field} must be between 0 and {max}, got {v}"
        ))),
        _ => Ok(()),
    }
}

pub fn add_vital_signs(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewVitalSigns,
) -> Result<VitalSigns, DatabaseError> {
    check_range("oxygen_saturation", new.oxygen_saturation, 100)?;
    check_range("pain_scale", new.pain_scale.map(u32::from), 10)?;

    audited(conn, ctx, |conn| {
        ensure_open_record(
            conn,
            EntityKind::VitalSigns,
            &new.record_id,
            &[("recorded_by", new.recorded_by)],
        )?;

        let ts = now();
        let vitals = VitalSigns {
            id: Uuid::new_v4(),
            record_id: new.record_id,
            temperature: new.temperature,
            blood_pressure_systolic: new.blood_pressure_systolic,
            blood_pressure_diastolic: new.blood_pressure_diastolic,
            heart_rate: new.heart_rate,
            respiratory_rate: new.respiratory_rate,
            oxygen_saturation: new.oxygen_saturation,
            height_cm: new.height_cm,
            weight_kg: new.weight_kg,
            bmi: new.bmi(),
            pain_scale: new.pain_scale,
            recorded_by: new.recorded_by,
            recorded_at: ts,
            created_at: ts,
        };
        conn.execute(
            "INSERT INTO vital_signs (id, record_id, temperature, blood_pressure_systolic,
             blood_pressure_diastolic, heart_rate, respiratory_rate, oxygen_saturation,
             height_cm, weight_kg, bmi, pain_scale, recorded_by, recorded_at, created_at,
             updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, ?14, 1)",
            params![
                vitals.id.to_string(),
                vitals.record_id.to_string(),
                vitals.temperature,
                vitals.blood_pressure_systolic,
                vitals.blood_pressure_diastolic,
                vitals.heart_rate,
                vitals.respiratory_rate,
                vitals.oxygen_saturation,
                vitals.height_cm,
                vitals.weight_kg,
                vitals.bmi,
                vitals.pain_scale,
                opt_id(vitals.recorded_by),
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::VitalSigns,
            &vitals.id,
            &ChangeSet::fields(recorded_vitals(new)),
        )?;
        Ok(vitals)
    })
}

fn recorded_vitals(new: &NewVitalSigns) -> Vec<&'static str> {
    let present = [
        ("temperature", new.temperature.is_some()),
        ("blood_pressure_systolic", new.blood_pressure_systolic.is_some()),
        ("blood_pressure_diastolic", new.blood_pressure_diastolic.is_some()),
        ("heart_rate", new.heart_rate.is_some()),
        ("respiratory_rate", new.respiratory_rate.is_some()),
        ("oxygen_saturation", new.oxygen_saturation.is_some()),
        ("height_cm", new.height_cm.is_some()),
        ("weight_kg", new.weight_kg.is_some()),
        ("bmi", new.bmi().is_some()),
        ("pain_scale", new.pain_scale.is_some()),
    ];
    let mut fields: Vec<&'static str> = present
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect();
    fields.push("record_id");
    fields
}

struct VitalSignsRow {
    id: String,
    record_id: String,
    temperature: Option<f64>,
    blood_pressure_systolic: Option<u32>,
    blood_pressure_diastolic: Option<u32>,
    heart_rate: Option<u32>,
    respiratory_rate: Option<u32>,
    oxygen_saturation: Option<u32>,
    height_cm: Option<f64>,
    weight_kg: Option<f64>,
    bmi: Option<f64>,
    pain_scale: Option<u8>,
    recorded_by: Option<String>,
    recorded_at: String,
    created_at: String,
}

pub fn list_vital_signs(conn: &Connection, record_id: &Uuid) -> Result<Vec<VitalSigns>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, record_id, temperature, blood_pressure_systolic, blood_pressure_diastolic,
                heart_rate, respiratory_rate, oxygen_saturation, height_cm, weight_kg, bmi,
                pain_scale, recorded_by, recorded_at, created_at
         FROM vital_signs WHERE record_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![record_id.to_string()], |row| {
            Ok(VitalSignsRow {
                id: row.get(0)?,
                record_id: row.get(1)?,
                temperature: row.get(2)?,
                blood_pressure_systolic: row.get(3)?,
                blood_pressure_diastolic: row.get(4)?,
                heart_rate: row.get(5)?,
                respiratory_rate: row.get(6)?,
                oxygen_saturation: row.get(7)?,
                height_cm: row.get(8)?,
                weight_kg: row.get(9)?,
                bmi: row.get(10)?,
                pain_scale: row.get(11)?,
                recorded_by: row.get(12)?,
                recorded_at: row.get(13)?,
                created_at: row.get(14)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(VitalSigns {
                id: parse_uuid(&row.id)?,
                record_id: parse_uuid(&row.record_id)?,
                temperature: row.temperature,
                blood_pressure_systolic: row.blood_pressure_systolic,
                blood_pressure_diastolic: row.blood_pressure_diastolic,
                heart_rate: row.heart_rate,
                respiratory_rate: row.respiratory_rate,
                oxygen_saturation: row.oxygen_saturation,
                height_cm: row.height_cm,
                weight_kg: row.weight_kg,
                bmi: row.bmi,
                pain_scale: row.pain_scale,
                recorded_by: parse_optional_uuid(row.recorded_by)?,
                recorded_at: parse_timestamp(&row.recorded_at)?,
                created_at: parse_timestamp(&row.created_at)?,
            })
        })
        .collect()
}

pub fn add_medication(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewMedication,
) -> Result<Medication, DatabaseError> {
    require_text("medication", "medication_name", &new.medication_name)?;
    require_text("medication", "dosage", &new.dosage)?;
    if let (Some(start), Some(end)) = (new.start_date, new.end_date) {
        if end < start {
            return Err(DatabaseError::ConstraintViolation(
                "medication.end_date precedes start_date".into(),
            ));
        }
    }

    audited(conn, ctx, |conn| {
        ensure_open_record(
            conn,
            EntityKind::Medication,
            &new.record_id,
            &[("prescribed_by", new.prescribed_by)],
        )?;

        let ts = now();
        let medication = Medication {
            id: Uuid::new_v4(),
            record_id: new.record_id,
            medication_name: new.medication_name.clone(),
            generic_name: new.generic_name.clone(),
            dosage_form: new.dosage_form.clone(),
            strength: new.strength.clone(),
            dosage: new.dosage.clone(),
            frequency: new.frequency.clone(),
            route: new.route.clone(),
            duration: new.duration.clone(),
            prescribed_by: new.prescribed_by,
            start_date: new.start_date,
            end_date: new.end_date,
            instructions: new.instructions.clone(),
            is_active: true,
            created_at: ts,
        };
        conn.execute(
            "INSERT INTO medications (id, record_id, medication_name, generic_name, dosage_form,
             strength, dosage, frequency, route, duration, prescribed_by, start_date, end_date,
             instructions, is_active, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1, ?15, ?15, 1)",
            params![
                medication.id.to_string(),
                medication.record_id.to_string(),
                medication.medication_name,
                medication.generic_name,
                medication.dosage_form,
                medication.strength,
                medication.dosage,
                medication.frequency,
                medication.route,
                medication.duration,
                opt_id(medication.prescribed_by),
                medication.start_date.map(|d| d.to_string()),
                medication.end_date.map(|d| d.to_string()),
                medication.instructions,
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::Medication,
            &medication.id,
            &ChangeSet::fields([
                "record_id",
                "medication_name",
                "generic_name",
                "dosage_form",
                "strength",
                "dosage",
                "frequency",
                "route",
                "duration",
                "prescribed_by",
                "start_date",
                "end_date",
                "instructions",
            ]),
        )?;
        Ok(medication)
    })
}

struct MedicationRow {
    id: String,
    record_id: String,
    medication_name: String,
    generic_name: Option<String>,
    dosage_form: String,
    strength: String,
    dosage: String,
    frequency: String,
    route: String,
    duration: Option<String>,
    prescribed_by: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    instructions: Option<String>,
    is_active: bool,
    created_at: String,
}

pub fn list_medications(conn: &Connection, record_id: &Uuid) -> Result<Vec<Medication>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, record_id, medication_name, generic_name, dosage_form, strength, dosage,
                frequency, route, duration, prescribed_by, start_date, end_date, instructions,
                is_active, created_at
         FROM medications WHERE record_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![record_id.to_string()], |row| {
            Ok(MedicationRow {
                id: row.get(0)?,
                record_id: row.get(1)?,
                medication_name: row.get(2)?,
                generic_name: row.get(3)?,
                dosage_form: row.get(4)?,
                strength: row.get(5)?,
                dosage: row.get(6)?,
                frequency: row.get(7)?,
                route: row.get(8)?,
                duration: row.get(9)?,
                prescribed_by: row.get(10)?,
                start_date: row.get(11)?,
                end_date: row.get(12)?,
                instructions: row.get(13)?,
                is_active: row.get(14)?,
                created_at: row.get(15)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(Medication {
                id: parse_uuid(&row.id)?,
                record_id: parse_uuid(&row.record_id)?,
                medication_name: row.medication_name,
                generic_name: row.generic_name,
                dosage_form: row.dosage_form,
                strength: row.strength,
                dosage: row.dosage,
                frequency: row.frequency,
                route: row.route,
                duration: row.duration,
                prescribed_by: parse_optional_uuid(row.prescribed_by)?,
                start_date: row.start_date.as_deref().map(parse_date).transpose()?,
                end_date: row.end_date.as_deref().map(parse_date).transpose()?,
                instructions: row.instructions,
                is_active: row.is_active,
                created_at: parse_timestamp(&row.created_at)?,
            })
        })
        .collect()
}

pub fn add_laboratory_test(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewLaboratoryTest,
) -> Result<LaboratoryTest, DatabaseError> {
    require_text("laboratory_test", "test_name", &new.test_name)?;

    audited(conn, ctx, |conn| {
        ensure_open_record(
            conn,
            EntityKind::LaboratoryTest,
            &new.record_id,
            &[("ordered_by", new.ordered_by)],
        )?;

        let ts = now();
        let test = LaboratoryTest {
            id: Uuid::new_v4(),
            record_id: new.record_id,
            test_name: new.test_name.clone(),
            test_category: new.test_category.clone(),
            test_code: new.test_code.clone(),
            ordered_by: new.ordered_by,
            collected_at: new.collected_at.map(to_stored),
            result_at: new.result_at.map(to_stored),
            results: new.results.clone(),
            reference_range: new.reference_range.clone(),
            is_abnormal: new.is_abnormal,
            interpretation: new.interpretation.clone(),
            created_at: ts,
        };
        conn.execute(
            "INSERT INTO laboratory_tests (id, record_id, test_name, test_category, test_code,
             ordered_by, collected_at, result_at, results, reference_range, is_abnormal,
             interpretation, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, 1)",
            params![
                test.id.to_string(),
                test.record_id.to_string(),
                test.test_name,
                test.test_category,
                test.test_code,
                opt_id(test.ordered_by),
                test.collected_at.map(|ts| format_timestamp(&ts)),
                test.result_at.map(|ts| format_timestamp(&ts)),
                to_json(&test.results)?,
                to_json(&test.reference_range)?,
                test.is_abnormal,
                test.interpretation,
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::LaboratoryTest,
            &test.id,
            &ChangeSet::fields(["record_id", "test_name", "test_category", "test_code", "ordered_by"])
                .with_count(test.results.len() as i64),
        )?;
        Ok(test)
    })
}

struct LaboratoryTestRow {
    id: String,
    record_id: String,
    test_name: String,
    test_category: String,
    test_code: Option<String>,
    ordered_by: Option<String>,
    collected_at: Option<String>,
    result_at: Option<String>,
    results: String,
    reference_range: String,
    is_abnormal: bool,
    interpretation: Option<String>,
    created_at: String,
}

pub fn list_laboratory_tests(
    conn: &Connection,
    record_id: &Uuid,
) -> Result<Vec<LaboratoryTest>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, record_id, test_name, test_category, test_code, ordered_by, collected_at,
                result_at, results, reference_range, is_abnormal, interpretation, created_at
         FROM laboratory_tests WHERE record_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![record_id.to_string()], |row| {
            Ok(LaboratoryTestRow {
                id: row.get(0)?,
                record_id: row.get(1)?,
                test_name: row.get(2)?,
                test_category: row.get(3)?,
                test_code: row.get(4)?,
                ordered_by: row.get(5)?,
                collected_at: row.get(6)?,
                result_at: row.get(7)?,
                results: row.get(8)?,
                reference_range: row.get(9)?,
                is_abnormal: row.get(10)?,
                interpretation: row.get(11)?,
                created_at: row.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(LaboratoryTest {
                id: parse_uuid(&row.id)?,
                record_id: parse_uuid(&row.record_id)?,
                test_name: row.test_name,
                test_category: row.test_category,
                test_code: row.test_code,
                ordered_by: parse_optional_uuid(row.ordered_by)?,
                collected_at: parse_optional_timestamp(row.collected_at)?,
                result_at: parse_optional_timestamp(row.result_at)?,
                results: from_json(&row.results)?,
                reference_range: from_json(&row.reference_range)?,
                is_abnormal: row.is_abnormal,
                interpretation: row.interpretation,
                created_at: parse_timestamp(&row.created_at)?,
            })
        })
        .collect()
}

pub fn add_imaging_study(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewImagingStudy,
) -> Result<ImagingStudy, DatabaseError> {
    require_text("imaging_study", "study_type", &new.study_type)?;
    require_text("imaging_study", "body_part", &new.body_part)?;

    audited(conn, ctx, |conn| {
        ensure_open_record(
            conn,
            EntityKind::ImagingStudy,
            &new.record_id,
            &[("ordered_by", new.ordered_by), ("radiologist_id", new.radiologist_id)],
        )?;

        let ts = now();
        let study = ImagingStudy {
            id: Uuid::new_v4(),
            record_id: new.record_id,
            study_type: new.study_type.clone(),
            body_part: new.body_part.clone(),
            description: new.description.clone(),
            ordered_by: new.ordered_by,
            radiologist_id: new.radiologist_id,
            performed_at: new.performed_at.map(to_stored),
            contrast_used: new.contrast_used,
            findings: new.findings.clone(),
            impression: new.impression.clone(),
            created_at: ts,
        };
        conn.execute(
            "INSERT INTO imaging_studies (id, record_id, study_type, body_part, description,
             ordered_by, radiologist_id, performed_at, contrast_used, findings, impression,
             created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, 1)",
            params![
                study.id.to_string(),
                study.record_id.to_string(),
                study.study_type,
                study.body_part,
                study.description,
                opt_id(study.ordered_by),
                opt_id(study.radiologist_id),
                study.performed_at.map(|ts| format_timestamp(&ts)),
                study.contrast_used,
                study.findings,
                study.impression,
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::ImagingStudy,
            &study.id,
            &ChangeSet::fields([
                "record_id",
                "study_type",
                "body_part",
                "description",
                "ordered_by",
                "radiologist_id",
                "performed_at",
                "contrast_used",
                "findings",
                "impression",
            ]),
        )?;
        Ok(study)
    })
}

struct ImagingStudyRow {
    id: String,
    record_id: String,
    study_type: String,
    body_part: String,
    description: String,
    ordered_by: Option<String>,
    radiologist_id: Option<String>,
    performed_at: Option<String>,
    contrast_used: bool,
    findings: Option<String>,
    impression: Option<String>,
    created_at: String,
}

pub fn list_imaging_studies(
    conn: &Connection,
    record_id: &Uuid,
) -> Result<Vec<ImagingStudy>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, record_id, study_type, body_part, description, ordered_by, radiologist_id,
                performed_at, contrast_used, findings, impression, created_at
         FROM imaging_studies WHERE record_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![record_id.to_string()], |row| {
            Ok(ImagingStudyRow {
                id: row.get(0)?,
                record_id: row.get(1)?,
                study_type: row.get(2)?,
                body_part: row.get(3)?,
                description: row.get(4)?,
                ordered_by: row.get(5)?,
                radiologist_id: row.get(6)?,
                performed_at: row.get(7)?,
                contrast_used: row.get(8)?,
                findings: row.get(9)?,
                impression: row.get(10)?,
                created_at: row.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(ImagingStudy {
                id: parse_uuid(&row.id)?,
                record_id: parse_uuid(&row.record_id)?,
                study_type: row.study_type,
                body_part: row.body_part,
                description: row.description,
                ordered_by: parse_optional_uuid(row.ordered_by)?,
                radiologist_id: parse_optional_uuid(row.radiologist_id)?,
                performed_at: parse_optional_timestamp(row.performed_at)?,
                contrast_used: row.contrast_used,
                findings: row.findings,
                impression: row.impression,
                created_at: parse_timestamp(&row.created_at)?,
            })
        })
        .collect()
}

// ── Corrections ─────────────────────────────────────────────────────────────

/// Owning record of a correction target, when the target is live.
fn correction_target_record(
    conn: &Connection,
    kind: EntityKind,
    id: &Uuid,
) -> Result<Option<Uuid>, DatabaseError> {
    if kind == EntityKind::HealthRecord {
        return Ok(get_health_record(conn, id)?.map(|r| r.id));
    }
    if !kind.is_record_entry() {
        return Err(DatabaseError::ConstraintViolation(format!(
            "corrections cannot target {kind}"
        )));
    }
    let owner: Option<String> = conn
        .query_row(
            &format!(
                "SELECT record_id FROM {} WHERE id = ?1 AND deleted_at IS NULL",
                kind.table()
            ),
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    owner.as_deref().map(parse_uuid).transpose()
}

/// Append a correction to a signed record or one of its entries.
///
/// The author is the acting user; system corrections carry no author.
pub fn add_correction(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewRecordCorrection,
) -> Result<RecordCorrection, DatabaseError> {
    require_text("record_correction", "field", &new.field)?;
    require_text("record_correction", "reason", &new.reason)?;

    let correction = audited(conn, ctx, |conn| {
        let record = get_health_record(conn, &new.record_id)?
            .ok_or_else(|| DatabaseError::not_found("health_record", &new.record_id))?;
        if !record.is_finalized() {
            return Err(DatabaseError::ConstraintViolation(format!(
                "health_record {} is not finalized; update it directly",
                record.id
            )));
        }
        match correction_target_record(conn, new.target_type, &new.target_id)? {
            Some(owner) if owner == record.id => {}
            Some(_) => {
                return Err(DatabaseError::ConstraintViolation(format!(
                    "{} {} does not belong to health_record {}",
                    new.target_type, new.target_id, record.id
                )))
            }
            None => return Err(DatabaseError::not_found(new.target_type.as_str(), &new.target_id)),
        }

        let correction = RecordCorrection {
            id: Uuid::new_v4(),
            record_id: record.id,
            target_type: new.target_type,
            target_id: new.target_id,
            field: new.field.clone(),
            previous_value: new.previous_value.clone(),
            corrected_value: new.corrected_value.clone(),
            reason: new.reason.clone(),
            author_id: ctx.actor.user_id(),
            created_at: now(),
        };
        conn.execute(
            "INSERT INTO record_corrections (id, record_id, target_type, target_id, field,
             previous_value, corrected_value, reason, author_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                correction.id.to_string(),
                correction.record_id.to_string(),
                correction.target_type.as_str(),
                correction.target_id.to_string(),
                correction.field,
                correction.previous_value,
                correction.corrected_value,
                correction.reason,
                opt_id(correction.author_id),
                format_timestamp(&correction.created_at),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::RecordCorrection,
            &correction.id,
            &ChangeSet::fields(["field", "previous_value", "corrected_value", "reason"])
                .with_metadata("target_type", correction.target_type.as_str()),
        )?;
        Ok(correction)
    })?;

    tracing::info!(id = %correction.id, record = %correction.record_id, "record correction appended");
    Ok(correction)
}

struct CorrectionRow {
    id: String,
    record_id: String,
    target_type: String,
    target_id: String,
    field: String,
    previous_value: Option<String>,
    corrected_value: String,
    reason: String,
    author_id: Option<String>,
    created_at: String,
}

/// Corrections of a record, oldest first. Removed records keep theirs.
pub fn list_corrections(
    conn: &Connection,
    record_id: &Uuid,
) -> Result<Vec<RecordCorrection>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, record_id, target_type, target_id, field, previous_value, corrected_value,
                reason, author_id, created_at
         FROM record_corrections WHERE record_id = ?1
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![record_id.to_string()], |row| {
            Ok(CorrectionRow {
                id: row.get(0)?,
                record_id: row.get(1)?,
                target_type: row.get(2)?,
                target_id: row.get(3)?,
                field: row.get(4)?,
                previous_value: row.get(5)?,
                corrected_value: row.get(6)?,
                reason: row.get(7)?,
                author_id: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(RecordCorrection {
                id: parse_uuid(&row.id)?,
                record_id: parse_uuid(&row.record_id)?,
                target_type: EntityKind::from_str(&row.target_type)?,
                target_id: parse_uuid(&row.target_id)?,
                field: row.field,
                previous_value: row.previous_value,
                corrected_value: row.corrected_value,
                reason: row.reason,
                author_id: parse_optional_uuid(row.author_id)?,
                created_at: parse_timestamp(&row.created_at)?,
            })
        })
        .collect()
}
