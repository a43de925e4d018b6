use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{append_audit_entry, get_patient, get_user, opt_id};
use crate::db::integrity::{audited, ensure_references, ensure_updated};
use crate::db::{
    format_timestamp, now, parse_optional_uuid, parse_timestamp, parse_uuid, to_stored,
    DatabaseError,
};
use crate::models::*;

const APPOINTMENT_COLUMNS: &str = "id, patient_id, provider_id, facility_id, appointment_type,
    reason, status, start_time, end_time, created_by, created_at, updated_at, version";

fn validate_window(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Result<(), DatabaseError> {
    if end <= start {
        return Err(DatabaseError::ConstraintViolation(
            "appointment.end_time must be after start_time".into(),
        ));
    }
    if *end - *start < Duration::minutes(MIN_APPOINTMENT_MINUTES) {
        return Err(DatabaseError::ConstraintViolation(format!(
            "appointment must be at least {MIN_APPOINTMENT_MINUTES} minutes long"
        )));
    }
    Ok(())
}

fn ensure_bookable(conn: &Connection, patient_id: &Uuid, provider_id: &Uuid) -> Result<(), DatabaseError> {
    let provider =
        get_user(conn, provider_id)?.ok_or_else(|| DatabaseError::not_found("user", provider_id))?;
    if !provider.role.can_take_appointments() {
        return Err(DatabaseError::ConstraintViolation(format!(
            "user {provider_id} with role {} is not eligible for appointments",
            provider.role
        )));
    }
    if !provider.is_active {
        return Err(DatabaseError::ConstraintViolation(format!(
            "provider account {provider_id} is inactive"
        )));
    }
    let patient =
        get_patient(conn, patient_id)?.ok_or_else(|| DatabaseError::not_found("patient", patient_id))?;
    if !patient.is_active {
        return Err(DatabaseError::ConstraintViolation(format!(
            "patient {patient_id} is inactive"
        )));
    }
    Ok(())
}

/// Reject a window that overlaps a slot-holding appointment of the same
/// provider, patient or facility. `exclude` skips the appointment being moved.
fn ensure_no_overlap(
    conn: &Connection,
    slot: (&Uuid, &Uuid, &Uuid),
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    exclude: Option<&Uuid>,
) -> Result<(), DatabaseError> {
    let (provider_id, patient_id, facility_id) = slot;
    let holding: Vec<&str> = AppointmentStatus::ALL
        .iter()
        .filter(|s| s.holds_slot())
        .map(|s| s.as_str())
        .collect();
    let statuses = holding
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ");

    for (resource, column, id) in [
        ("provider", "provider_id", provider_id),
        ("patient", "patient_id", patient_id),
        ("facility", "facility_id", facility_id),
    ] {
        let sql = format!(
            "SELECT 1 FROM appointments
             WHERE {column} = ?1 AND deleted_at IS NULL AND status IN ({statuses})
               AND start_time < ?3 AND end_time > ?2
               AND (?4 IS NULL OR id <> ?4)
             LIMIT 1"
        );
        let clash = conn
            .query_row(
                &sql,
                params![
                    id.to_string(),
                    format_timestamp(start),
                    format_timestamp(end),
                    exclude.map(|e| e.to_string()),
                ],
                |_| Ok(()),
            )
            .optional()?;
        if clash.is_some() {
            return Err(DatabaseError::ScheduleConflict {
                resource: resource.into(),
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

pub fn create_appointment(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewAppointment,
) -> Result<Appointment, DatabaseError> {
    let start = to_stored(new.start_time);
    let end = to_stored(new.end_time);
    validate_window(&start, &end)?;

    let appointment = audited(conn, ctx, |conn| {
        ensure_references(
            conn,
            EntityKind::Appointment,
            &[
                ("patient_id", Some(new.patient_id)),
                ("provider_id", Some(new.provider_id)),
                ("facility_id", Some(new.facility_id)),
            ],
        )?;
        ensure_bookable(conn, &new.patient_id, &new.provider_id)?;
        ensure_no_overlap(
            conn,
            (&new.provider_id, &new.patient_id, &new.facility_id),
            &start,
            &end,
            None,
        )?;

        let ts = now();
        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: new.patient_id,
            provider_id: new.provider_id,
            facility_id: new.facility_id,
            appointment_type: new.appointment_type.clone(),
            reason: new.reason.clone(),
            status: AppointmentStatus::Scheduled,
            start_time: start,
            end_time: end,
            created_by: ctx.actor.user_id(),
            created_at: ts,
            updated_at: ts,
            version: 1,
        };
        conn.execute(
            "INSERT INTO appointments (id, patient_id, provider_id, facility_id, appointment_type,
             reason, status, start_time, end_time, created_by, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 1)",
            params![
                appointment.id.to_string(),
                appointment.patient_id.to_string(),
                appointment.provider_id.to_string(),
                appointment.facility_id.to_string(),
                appointment.appointment_type,
                appointment.reason,
                appointment.status.as_str(),
                format_timestamp(&appointment.start_time),
                format_timestamp(&appointment.end_time),
                opt_id(appointment.created_by),
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::Appointment,
            &appointment.id,
            &ChangeSet::fields([
                "patient_id",
                "provider_id",
                "facility_id",
                "appointment_type",
                "reason",
                "status",
                "start_time",
                "end_time",
            ]),
        )?;
        Ok(appointment)
    })?;

    tracing::info!(
        id = %appointment.id,
        provider = %appointment.provider_id,
        "appointment booked"
    );
    Ok(appointment)
}

pub fn get_appointment(conn: &Connection, id: &Uuid) -> Result<Option<Appointment>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1 AND deleted_at IS NULL"),
            params![id.to_string()],
            read_appointment_row,
        )
        .optional()?;
    row.map(appointment_from_row).transpose()
}

fn require_appointment(conn: &Connection, id: &Uuid) -> Result<Appointment, DatabaseError> {
    get_appointment(conn, id)?.ok_or_else(|| DatabaseError::not_found("appointment", id))
}

/// Completed and cancelled appointments are closed.
fn is_closed(status: AppointmentStatus) -> bool {
    matches!(status, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
}

pub fn set_appointment_status(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    status: AppointmentStatus,
) -> Result<Appointment, DatabaseError> {
    audited(conn, ctx, |conn| {
        let current = require_appointment(conn, id)?;
        if is_closed(current.status) && current.status != status {
            return Err(DatabaseError::ConstraintViolation(format!(
                "appointment {id} is {} and cannot become {status}",
                current.status
            )));
        }

        let changed = conn.execute(
            "UPDATE appointments SET status = ?3, updated_at = ?4, version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
            params![id.to_string(), expected_version, status.as_str(), format_timestamp(&now())],
        )?;
        ensure_updated(conn, EntityKind::Appointment, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::Appointment,
            id,
            &ChangeSet::fields(["status"]).with_metadata("status", status.as_str()),
        )?;
        require_appointment(conn, id)
    })
}

/// Move a scheduled appointment to a new window.
pub fn reschedule_appointment(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Result<Appointment, DatabaseError> {
    let start = to_stored(start_time);
    let end = to_stored(end_time);
    validate_window(&start, &end)?;

    audited(conn, ctx, |conn| {
        let current = require_appointment(conn, id)?;
        if current.status != AppointmentStatus::Scheduled {
            return Err(DatabaseError::ConstraintViolation(format!(
                "only scheduled appointments can be moved; {id} is {}",
                current.status
            )));
        }
        ensure_no_overlap(
            conn,
            (&current.provider_id, &current.patient_id, &current.facility_id),
            &start,
            &end,
            Some(id),
        )?;

        let changed = conn.execute(
            "UPDATE appointments SET start_time = ?3, end_time = ?4, updated_at = ?5,
             version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
            params![
                id.to_string(),
                expected_version,
                format_timestamp(&start),
                format_timestamp(&end),
                format_timestamp(&now()),
            ],
        )?;
        ensure_updated(conn, EntityKind::Appointment, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::Appointment,
            id,
            &ChangeSet::fields(["start_time", "end_time"]),
        )?;
        require_appointment(conn, id)
    })
}

/// Live appointments matching `filter`; `from`/`to` bound the start time.
pub fn list_appointments(
    conn: &Connection,
    filter: &AppointmentFilter,
    page: &Page,
) -> Result<Paged<Appointment>, DatabaseError> {
    let limit = page.effective_limit();
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE deleted_at IS NULL
           AND (?1 IS NULL OR patient_id = ?1)
           AND (?2 IS NULL OR provider_id = ?2)
           AND (?3 IS NULL OR facility_id = ?3)
           AND (?4 IS NULL OR status = ?4)
           AND (?5 IS NULL OR start_time >= ?5)
           AND (?6 IS NULL OR start_time < ?6)
           AND (?7 IS NULL OR created_at > ?7 OR (created_at = ?7 AND id > ?8))
         ORDER BY created_at, id
         LIMIT ?9"
    ))?;
    let rows = stmt
        .query_map(
            params![
                opt_id(filter.patient_id),
                opt_id(filter.provider_id),
                opt_id(filter.facility_id),
                filter.status.map(|s| s.as_str()),
                filter.from.map(|ts| format_timestamp(&ts)),
                filter.to.map(|ts| format_timestamp(&ts)),
                page.after.map(|c| format_timestamp(&c.created_at)),
                page.after.map(|c| c.id.to_string()),
                limit + 1,
            ],
            read_appointment_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let appointments = rows
        .into_iter()
        .map(appointment_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::from_overfetch(appointments, limit))
}

struct AppointmentRow {
    id: String,
    patient_id: String,
    provider_id: String,
    facility_id: String,
    appointment_type: String,
    reason: String,
    status: String,
    start_time: String,
    end_time: String,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

fn read_appointment_row(row: &rusqlite::Row) -> rusqlite::Result<AppointmentRow> {
    Ok(AppointmentRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        provider_id: row.get(2)?,
        facility_id: row.get(3)?,
        appointment_type: row.get(4)?,
        reason: row.get(5)?,
        status: row.get(6)?,
        start_time: row.get(7)?,
        end_time: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        version: row.get(12)?,
    })
}

fn appointment_from_row(row: AppointmentRow) -> Result<Appointment, DatabaseError> {
    Ok(Appointment {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        provider_id: parse_uuid(&row.provider_id)?,
        facility_id: parse_uuid(&row.facility_id)?,
        appointment_type: row.appointment_type,
        reason: row.reason,
        status: AppointmentStatus::from_str(&row.status)?,
        start_time: parse_timestamp(&row.start_time)?,
        end_time: parse_timestamp(&row.end_time)?,
        created_by: parse_optional_uuid(row.created_by)?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        version: row.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::delete_entity;
    use crate::db::repository::fixtures::*;
    use chrono::TimeZone;

    struct Clinic {
        conn: Connection,
        patient: Patient,
        doctor: User,
        facility: HealthFacility,
    }

    fn clinic() -> Clinic {
        let conn = db();
        let (_, _, county) = location_tree(&conn);
        let facility = facility(&conn, county.id);
        let patient = patient(&conn, Some(facility.id));
        let doctor = user_with_role(&conn, "dr.ndungu", UserRole::Doctor);
        Clinic {
            conn,
            patient,
            doctor,
            facility,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 5, 6, hour, minute, 0).unwrap()
    }

    fn booking(c: &Clinic, start: DateTime<Utc>, end: DateTime<Utc>) -> NewAppointment {
        NewAppointment {
            patient_id: c.patient.id,
            provider_id: c.doctor.id,
            facility_id: c.facility.id,
            appointment_type: "consultation".into(),
            reason: "Follow-up".into(),
            start_time: start,
            end_time: end,
        }
    }

    #[test]
    fn books_and_reads_back() {
        let c = clinic();
        let receptionist = user_with_role(&c.conn, "r.wairimu", UserRole::Nurse);
        let ctx = AuditContext::user(receptionist.id);
        let appointment = create_appointment(&c.conn, &ctx, &booking(&c, at(9, 0), at(9, 30))).unwrap();

        assert_eq!(appointment.status, AppointmentStatus::Scheduled);
        assert_eq!(appointment.created_by, Some(receptionist.id));
        assert_eq!(get_appointment(&c.conn, &appointment.id).unwrap(), Some(appointment));
    }

    #[test]
    fn too_short_or_backwards_windows_are_rejected() {
        let c = clinic();
        let ctx = AuditContext::system();
        let short = create_appointment(&c.conn, &ctx, &booking(&c, at(9, 0), at(9, 4)));
        assert!(matches!(short, Err(DatabaseError::ConstraintViolation(_))));
        let backwards = create_appointment(&c.conn, &ctx, &booking(&c, at(10, 0), at(9, 0)));
        assert!(matches!(backwards, Err(DatabaseError::ConstraintViolation(_))));
        let exact = create_appointment(&c.conn, &ctx, &booking(&c, at(9, 0), at(9, 5)));
        assert!(exact.is_ok());
    }

    #[test]
    fn ineligible_provider_is_rejected() {
        let c = clinic();
        let pharmacist = user_with_role(&c.conn, "p.kariuki", UserRole::Pharmacist);
        let mut new = booking(&c, at(9, 0), at(9, 30));
        new.provider_id = pharmacist.id;
        let result = create_appointment(&c.conn, &AuditContext::system(), &new);
        assert!(matches!(result, Err(DatabaseError::ConstraintViolation(_))));
    }

    #[test]
    fn overlapping_windows_conflict_per_resource() {
        let c = clinic();
        let ctx = AuditContext::system();
        create_appointment(&c.conn, &ctx, &booking(&c, at(9, 0), at(9, 30))).unwrap();

        let same_provider = create_appointment(&c.conn, &ctx, &booking(&c, at(9, 15), at(9, 45)));
        assert!(matches!(
            same_provider,
            Err(DatabaseError::ScheduleConflict { ref resource, .. }) if resource == "provider"
        ));

        let other_doctor = user_with_role(&c.conn, "dr.omondi", UserRole::Doctor);
        let mut same_patient = booking(&c, at(9, 15), at(9, 45));
        same_patient.provider_id = other_doctor.id;
        let result = create_appointment(&c.conn, &ctx, &same_patient);
        assert!(matches!(
            result,
            Err(DatabaseError::ScheduleConflict { ref resource, .. }) if resource == "patient"
        ));

        let back_to_back = create_appointment(&c.conn, &ctx, &booking(&c, at(9, 30), at(10, 0)));
        assert!(back_to_back.is_ok());
    }

    #[test]
    fn cancelled_appointment_frees_the_slot() {
        let c = clinic();
        let ctx = AuditContext::system();
        let first = create_appointment(&c.conn, &ctx, &booking(&c, at(11, 0), at(11, 30))).unwrap();
        let cancelled =
            set_appointment_status(&c.conn, &ctx, &first.id, first.version, AppointmentStatus::Cancelled)
                .unwrap();
        assert_eq!(cancelled.version, 2);

        create_appointment(&c.conn, &ctx, &booking(&c, at(11, 0), at(11, 30))).unwrap();

        let reopen = set_appointment_status(
            &c.conn,
            &ctx,
            &first.id,
            cancelled.version,
            AppointmentStatus::Scheduled,
        );
        assert!(matches!(reopen, Err(DatabaseError::ConstraintViolation(_))));
    }

    #[test]
    fn no_show_still_holds_the_slot() {
        let c = clinic();
        let ctx = AuditContext::system();
        let first = create_appointment(&c.conn, &ctx, &booking(&c, at(14, 0), at(14, 30))).unwrap();
        set_appointment_status(&c.conn, &ctx, &first.id, first.version, AppointmentStatus::NoShow).unwrap();

        let clash = create_appointment(&c.conn, &ctx, &booking(&c, at(14, 10), at(14, 40)));
        assert!(matches!(clash, Err(DatabaseError::ScheduleConflict { .. })));
    }

    #[test]
    fn reschedule_ignores_its_own_slot() {
        let c = clinic();
        let ctx = AuditContext::system();
        let appointment = create_appointment(&c.conn, &ctx, &booking(&c, at(9, 0), at(9, 30))).unwrap();
        let other = create_appointment(&c.conn, &ctx, &booking(&c, at(10, 0), at(10, 30))).unwrap();

        let moved =
            reschedule_appointment(&c.conn, &ctx, &appointment.id, appointment.version, at(9, 15), at(9, 45))
                .unwrap();
        assert_eq!(moved.start_time, at(9, 15));

        let into_other =
            reschedule_appointment(&c.conn, &ctx, &moved.id, moved.version, at(10, 15), at(10, 45));
        assert!(matches!(into_other, Err(DatabaseError::ScheduleConflict { .. })));
        assert_eq!(get_appointment(&c.conn, &other.id).unwrap().unwrap().start_time, at(10, 0));
    }

    #[test]
    fn list_by_provider_and_window() {
        let c = clinic();
        let ctx = AuditContext::system();
        create_appointment(&c.conn, &ctx, &booking(&c, at(8, 0), at(8, 30))).unwrap();
        create_appointment(&c.conn, &ctx, &booking(&c, at(12, 0), at(12, 30))).unwrap();

        let filter = AppointmentFilter {
            provider_id: Some(c.doctor.id),
            from: Some(at(10, 0)),
            ..Default::default()
        };
        let page = list_appointments(&c.conn, &filter, &Page::default()).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].start_time, at(12, 0));
    }

    #[test]
    fn removing_patient_removes_appointments() {
        let c = clinic();
        let ctx = AuditContext::system();
        let appointment = create_appointment(&c.conn, &ctx, &booking(&c, at(9, 0), at(9, 30))).unwrap();

        delete_entity(&c.conn, &ctx, EntityKind::Patient, &c.patient.id).unwrap();
        assert!(get_appointment(&c.conn, &appointment.id).unwrap().is_none());
    }
}
