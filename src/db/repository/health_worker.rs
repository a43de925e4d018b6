use std::str::FromStr;

use chrono::NaiveTime;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{append_audit_entry, from_json, map_unique, opt_id, to_json, validate_optional_phone};
use crate::db::integrity::{audited, ensure_references, ensure_updated};
use crate::db::{
    format_timestamp, now, parse_date, parse_optional_timestamp, parse_optional_uuid,
    parse_timestamp, parse_uuid, DatabaseError,
};
use crate::models::*;

const PROFILE_COLUMNS: &str = "id, user_id, license_number, specialization, years_of_experience,
    primary_facility_id, is_licensed, license_expiry_date, languages_spoken, qualifications, bio,
    emergency_contact_name, emergency_contact_phone, created_at, updated_at, deleted_at, version";

/// Fixed-width so stored text compares in time order.
const TIME_FORMAT: &str = "%H:%M:%S";

fn map_profile_unique(err: rusqlite::Error, license_number: Option<&str>) -> DatabaseError {
    match license_number {
        Some(license) => map_unique(err, "health_worker_profile", "license_number", license),
        None => err.into(),
    }
}

pub fn create_health_worker_profile(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewHealthWorkerProfile,
) -> Result<HealthWorkerProfile, DatabaseError> {
    validate_optional_phone(
        "health_worker_profile",
        "emergency_contact_phone",
        new.emergency_contact_phone.as_deref(),
    )?;

    let profile = audited(conn, ctx, |conn| {
        ensure_references(
            conn,
            EntityKind::HealthWorkerProfile,
            &[
                ("user_id", Some(new.user_id)),
                ("primary_facility_id", new.primary_facility_id),
            ],
        )?;
        let existing = conn
            .query_row(
                "SELECT 1 FROM health_worker_profiles WHERE user_id = ?1",
                params![new.user_id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        if existing.is_some() {
            return Err(DatabaseError::Duplicate {
                entity_type: "health_worker_profile".into(),
                field: "user_id".into(),
                value: new.user_id.to_string(),
            });
        }

        let ts = now();
        let profile = HealthWorkerProfile {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            license_number: new.license_number.clone(),
            specialization: new.specialization.clone(),
            years_of_experience: new.years_of_experience,
            primary_facility_id: new.primary_facility_id,
            is_licensed: new.is_licensed,
            license_expiry_date: new.license_expiry_date,
            languages_spoken: new.languages_spoken.clone(),
            qualifications: new.qualifications.clone(),
            bio: new.bio.clone(),
            emergency_contact_name: new.emergency_contact_name.clone(),
            emergency_contact_phone: new.emergency_contact_phone.clone(),
            created_at: ts,
            updated_at: ts,
            deleted_at: None,
            version: 1,
        };
        conn.execute(
            "INSERT INTO health_worker_profiles (id, user_id, license_number, specialization,
             years_of_experience, primary_facility_id, is_licensed, license_expiry_date,
             languages_spoken, qualifications, bio, emergency_contact_name,
             emergency_contact_phone, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, 1)",
            params![
                profile.id.to_string(),
                profile.user_id.to_string(),
                profile.license_number,
                profile.specialization,
                profile.years_of_experience,
                opt_id(profile.primary_facility_id),
                profile.is_licensed,
                profile.license_expiry_date.map(|d| d.to_string()),
                to_json(&profile.languages_spoken)?,
                to_json(&profile.qualifications)?,
                profile.bio,
                profile.emergency_contact_name,
                profile.emergency_contact_phone,
                format_timestamp(&ts),
            ],
        )
        .map_err(|e| map_profile_unique(e, new.license_number.as_deref()))?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::HealthWorkerProfile,
            &profile.id,
            &ChangeSet::fields([
                "user_id",
                "license_number",
                "specialization",
                "years_of_experience",
                "primary_facility_id",
                "is_licensed",
                "license_expiry_date",
                "languages_spoken",
                "qualifications",
                "bio",
                "emergency_contact_name",
                "emergency_contact_phone",
            ]),
        )?;
        Ok(profile)
    })?;

    tracing::info!(id = %profile.id, user = %profile.user_id, "health worker profile created");
    Ok(profile)
}

/// Profile by id, including anonymized profiles of removed users.
pub fn get_health_worker_profile(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<HealthWorkerProfile>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {PROFILE_COLUMNS} FROM health_worker_profiles WHERE id = ?1"),
            params![id.to_string()],
            read_profile_row,
        )
        .optional()?;
    row.map(profile_from_row).transpose()
}

/// Live profile of `user_id`.
pub fn get_profile_by_user(
    conn: &Connection,
    user_id: &Uuid,
) -> Result<Option<HealthWorkerProfile>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {PROFILE_COLUMNS} FROM health_worker_profiles
                 WHERE user_id = ?1 AND deleted_at IS NULL"
            ),
            params![user_id.to_string()],
            read_profile_row,
        )
        .optional()?;
    row.map(profile_from_row).transpose()
}

pub fn update_health_worker_profile(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    update: &HealthWorkerProfileUpdate,
) -> Result<HealthWorkerProfile, DatabaseError> {
    validate_optional_phone(
        "health_worker_profile",
        "emergency_contact_phone",
        update.emergency_contact_phone.as_deref(),
    )?;

    audited(conn, ctx, |conn| {
        let before = get_health_worker_profile(conn, id)?
            .filter(|p| p.deleted_at.is_none())
            .ok_or_else(|| DatabaseError::not_found("health_worker_profile", id))?;
        ensure_references(
            conn,
            EntityKind::HealthWorkerProfile,
            &[("primary_facility_id", update.primary_facility_id)],
        )?;

        let changed = conn
            .execute(
                "UPDATE health_worker_profiles SET license_number = ?3, specialization = ?4,
                 years_of_experience = ?5, primary_facility_id = ?6, is_licensed = ?7,
                 license_expiry_date = ?8, languages_spoken = ?9, qualifications = ?10, bio = ?11,
                 emergency_contact_name = ?12, emergency_contact_phone = ?13, updated_at = ?14,
                 version = version + 1
                 WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
                params![
                    id.to_string(),
                    expected_version,
                    update.license_number,
                    update.specialization,
                    update.years_of_experience,
                    opt_id(update.primary_facility_id),
                    update.is_licensed,
                    update.license_expiry_date.map(|d| d.to_string()),
                    to_json(&update.languages_spoken)?,
                    to_json(&update.qualifications)?,
                    update.bio,
                    update.emergency_contact_name,
                    update.emergency_contact_phone,
                    format_timestamp(&now()),
                ],
            )
            .map_err(|e| map_profile_unique(e, update.license_number.as_deref()))?;
        ensure_updated(conn, EntityKind::HealthWorkerProfile, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::HealthWorkerProfile,
            id,
            &ChangeSet::fields(changed_profile_fields(&before, update)),
        )?;
        get_health_worker_profile(conn, id)?
            .ok_or_else(|| DatabaseError::not_found("health_worker_profile", id))
    })
}

fn changed_profile_fields(
    before: &HealthWorkerProfile,
    after: &HealthWorkerProfileUpdate,
) -> Vec<&'static str> {
    let b = HealthWorkerProfileUpdate::from(before);
    [
        ("license_number", b.license_number != after.license_number),
        ("specialization", b.specialization != after.specialization),
        ("years_of_experience", b.years_of_experience != after.years_of_experience),
        ("primary_facility_id", b.primary_facility_id != after.primary_facility_id),
        ("is_licensed", b.is_licensed != after.is_licensed),
        ("license_expiry_date", b.license_expiry_date != after.license_expiry_date),
        ("languages_spoken", b.languages_spoken != after.languages_spoken),
        ("qualifications", b.qualifications != after.qualifications),
        ("bio", b.bio != after.bio),
        ("emergency_contact_name", b.emergency_contact_name != after.emergency_contact_name),
        ("emergency_contact_phone", b.emergency_contact_phone != after.emergency_contact_phone),
    ]
    .into_iter()
    .filter_map(|(field, differs)| differs.then_some(field))
    .collect()
}

struct ProfileRow {
    id: String,
    user_id: String,
    license_number: Option<String>,
    specialization: Option<String>,
    years_of_experience: u32,
    primary_facility_id: Option<String>,
    is_licensed: bool,
    license_expiry_date: Option<String>,
    languages_spoken: String,
    qualifications: String,
    bio: Option<String>,
    emergency_contact_name: Option<String>,
    emergency_contact_phone: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
    version: i64,
}

fn read_profile_row(row: &rusqlite::Row) -> rusqlite::Result<ProfileRow> {
    Ok(ProfileRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        license_number: row.get(2)?,
        specialization: row.get(3)?,
        years_of_experience: row.get(4)?,
        primary_facility_id: row.get(5)?,
        is_licensed: row.get(6)?,
        license_expiry_date: row.get(7)?,
        languages_spoken: row.get(8)?,
        qualifications: row.get(9)?,
        bio: row.get(10)?,
        emergency_contact_name: row.get(11)?,
        emergency_contact_phone: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        deleted_at: row.get(15)?,
        version: row.get(16)?,
    })
}

fn profile_from_row(row: ProfileRow) -> Result<HealthWorkerProfile, DatabaseError> {
    Ok(HealthWorkerProfile {
        id: parse_uuid(&row.id)?,
        user_id: parse_uuid(&row.user_id)?,
        license_number: row.license_number,
        specialization: row.specialization,
        years_of_experience: row.years_of_experience,
        primary_facility_id: parse_optional_uuid(row.primary_facility_id)?,
        is_licensed: row.is_licensed,
        license_expiry_date: row.license_expiry_date.as_deref().map(parse_date).transpose()?,
        languages_spoken: from_json(&row.languages_spoken)?,
        qualifications: from_json(&row.qualifications)?,
        bio: row.bio,
        emergency_contact_name: row.emergency_contact_name,
        emergency_contact_phone: row.emergency_contact_phone,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        deleted_at: parse_optional_timestamp(row.deleted_at)?,
        version: row.version,
    })
}

// ── Work schedules ──────────────────────────────────────────────────────────

fn parse_time(raw: &str) -> Result<NaiveTime, DatabaseError> {
    NaiveTime::parse_from_str(raw, TIME_FORMAT)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad time '{raw}': {e}")))
}

pub fn create_work_schedule(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewWorkSchedule,
) -> Result<WorkSchedule, DatabaseError> {
    if new.day_of_week > 6 {
        return Err(DatabaseError::ConstraintViolation(format!(
            "work_schedule.day_of_week must be 0..=6, got {}",
            new.day_of_week
        )));
    }
    if new.end_time <= new.start_time {
        return Err(DatabaseError::ConstraintViolation(
            "work_schedule.end_time must be after start_time".into(),
        ));
    }
    let start = new.start_time.format(TIME_FORMAT).to_string();

    audited(conn, ctx, |conn| {
        ensure_references(
            conn,
            EntityKind::WorkSchedule,
            &[
                ("profile_id", Some(new.profile_id)),
                ("facility_id", Some(new.facility_id)),
            ],
        )?;

        let ts = now();
        let schedule = WorkSchedule {
            id: Uuid::new_v4(),
            profile_id: new.profile_id,
            facility_id: new.facility_id,
            day_of_week: new.day_of_week,
            start_time: parse_time(&start)?,
            end_time: parse_time(&new.end_time.format(TIME_FORMAT).to_string())?,
            schedule_type: new.schedule_type,
            is_available: true,
            created_at: ts,
            version: 1,
        };
        conn.execute(
            "INSERT INTO work_schedules (id, profile_id, facility_id, day_of_week, start_time,
             end_time, schedule_type, is_available, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8, 1)",
            params![
                schedule.id.to_string(),
                schedule.profile_id.to_string(),
                schedule.facility_id.to_string(),
                schedule.day_of_week,
                start,
                schedule.end_time.format(TIME_FORMAT).to_string(),
                schedule.schedule_type.as_str(),
                format_timestamp(&ts),
            ],
        )
        .map_err(|e| map_unique(e, "work_schedule", "start_time", &start))?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::WorkSchedule,
            &schedule.id,
            &ChangeSet::fields([
                "profile_id",
                "facility_id",
                "day_of_week",
                "start_time",
                "end_time",
                "schedule_type",
            ]),
        )?;
        Ok(schedule)
    })
}

pub fn list_work_schedules(
    conn: &Connection,
    profile_id: &Uuid,
) -> Result<Vec<WorkSchedule>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, profile_id, facility_id, day_of_week, start_time, end_time, schedule_type,
                is_available, created_at, version
         FROM work_schedules WHERE profile_id = ?1 AND deleted_at IS NULL
         ORDER BY day_of_week, start_time, id",
    )?;
    let rows = stmt
        .query_map(params![profile_id.to_string()], |row| {
            Ok(ScheduleRow {
                id: row.get(0)?,
                profile_id: row.get(1)?,
                facility_id: row.get(2)?,
                day_of_week: row.get(3)?,
                start_time: row.get(4)?,
                end_time: row.get(5)?,
                schedule_type: row.get(6)?,
                is_available: row.get(7)?,
                created_at: row.get(8)?,
                version: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(WorkSchedule {
                id: parse_uuid(&row.id)?,
                profile_id: parse_uuid(&row.profile_id)?,
                facility_id: parse_uuid(&row.facility_id)?,
                day_of_week: row.day_of_week,
                start_time: parse_time(&row.start_time)?,
                end_time: parse_time(&row.end_time)?,
                schedule_type: ScheduleType::from_str(&row.schedule_type)?,
                is_available: row.is_available,
                created_at: parse_timestamp(&row.created_at)?,
                version: row.version,
            })
        })
        .collect()
}

struct ScheduleRow {
    id: String,
    profile_id: String,
    facility_id: String,
    day_of_week: u8,
    start_time: String,
    end_time: String,
    schedule_type: String,
    is_available: bool,
    created_at: String,
    version: i64,
}

// ── Performance evaluations ─────────────────────────────────────────────────

pub fn create_performance_evaluation(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewPerformanceEvaluation,
) -> Result<PerformanceEvaluation, DatabaseError> {
    if !new.ratings.all_in_range() {
        return Err(DatabaseError::ConstraintViolation(
            "performance_evaluation ratings must be between 1 and 5".into(),
        ));
    }
    if new.period_start > new.period_end {
        return Err(DatabaseError::ConstraintViolation(
            "performance_evaluation.period_start is after period_end".into(),
        ));
    }

    audited(conn, ctx, |conn| {
        ensure_references(
            conn,
            EntityKind::PerformanceEvaluation,
            &[
                ("profile_id", Some(new.profile_id)),
                ("evaluator_id", Some(new.evaluator_id)),
            ],
        )?;

        let ts = now();
        let evaluation = PerformanceEvaluation {
            id: Uuid::new_v4(),
            profile_id: new.profile_id,
            evaluator_id: new.evaluator_id,
            evaluation_date: new.evaluation_date,
            period_start: new.period_start,
            period_end: new.period_end,
            ratings: new.ratings,
            overall_rating: new.ratings.overall(),
            strengths: new.strengths.clone(),
            areas_for_improvement: new.areas_for_improvement.clone(),
            created_at: ts,
        };
        let r = evaluation.ratings;
        conn.execute(
            "INSERT INTO performance_evaluations (id, profile_id, evaluator_id, evaluation_date,
             period_start, period_end, clinical_skills, communication_skills, teamwork,
             professionalism, productivity, overall_rating, strengths, areas_for_improvement,
             created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15, 1)",
            params![
                evaluation.id.to_string(),
                evaluation.profile_id.to_string(),
                evaluation.evaluator_id.to_string(),
                evaluation.evaluation_date.to_string(),
                evaluation.period_start.to_string(),
                evaluation.period_end.to_string(),
                r.clinical_skills,
                r.communication_skills,
                r.teamwork,
                r.professionalism,
                r.productivity,
                evaluation.overall_rating,
                evaluation.strengths,
                evaluation.areas_for_improvement,
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::PerformanceEvaluation,
            &evaluation.id,
            &ChangeSet::fields([
                "profile_id",
                "evaluator_id",
                "evaluation_date",
                "period_start",
                "period_end",
                "ratings",
                "overall_rating",
                "strengths",
                "areas_for_improvement",
            ]),
        )?;
        Ok(evaluation)
    })
}

struct EvaluationRow {
    id: String,
    profile_id: String,
    evaluator_id: String,
    evaluation_date: String,
    period_start: String,
    period_end: String,
    ratings: Ratings,
    overall_rating: u8,
    strengths: String,
    areas_for_improvement: String,
    created_at: String,
}

pub fn list_evaluations(
    conn: &Connection,
    profile_id: &Uuid,
) -> Result<Vec<PerformanceEvaluation>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, profile_id, evaluator_id, evaluation_date, period_start, period_end,
                clinical_skills, communication_skills, teamwork, professionalism, productivity,
                overall_rating, strengths, areas_for_improvement, created_at
         FROM performance_evaluations WHERE profile_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![profile_id.to_string()], |row| {
            Ok(EvaluationRow {
                id: row.get(0)?,
                profile_id: row.get(1)?,
                evaluator_id: row.get(2)?,
                evaluation_date: row.get(3)?,
                period_start: row.get(4)?,
                period_end: row.get(5)?,
                ratings: Ratings {
                    clinical_skills: row.get(6)?,
                    communication_skills: row.get(7)?,
                    teamwork: row.get(8)?,
                    professionalism: row.get(9)?,
                    productivity: row.get(10)?,
                },
                overall_rating: row.get(11)?,
                strengths: row.get(12)?,
                areas_for_improvement: row.get(13)?,
                created_at: row.get(14)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(PerformanceEvaluation {
                id: parse_uuid(&row.id)?,
                profile_id: parse_uuid(&row.profile_id)?,
                evaluator_id: parse_uuid(&row.evaluator_id)?,
                evaluation_date: parse_date(&row.evaluation_date)?,
                period_start: parse_date(&row.period_start)?,
                period_end: parse_date(&row.period_end)?,
                ratings: row.ratings,
                overall_rating: row.overall_rating,
                strengths: row.strengths,
                areas_for_improvement: row.areas_for_improvement,
                created_at: parse_timestamp(&row.created_at)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::delete_entity;
    use crate::db::repository::fixtures::*;
    use chrono::NaiveDate;

    fn doctor_profile(conn: &Connection, username: &str, license: Option<&str>) -> HealthWorkerProfile {
        let doctor = user_with_role(conn, username, UserRole::Doctor);
        create_health_worker_profile(
            conn,
            &AuditContext::system(),
            &NewHealthWorkerProfile {
                user_id: doctor.id,
                license_number: license.map(str::to_owned),
                specialization: Some("Internal medicine".into()),
                years_of_experience: 8,
                is_licensed: true,
                languages_spoken: vec!["en".into(), "sw".into()],
                qualifications: vec![Qualification {
                    title: "MBChB".into(),
                    institution: "University of Nairobi".into(),
                    completed_on: NaiveDate::from_ymd_opt(2015, 12, 1),
                    expires_on: None,
                }],
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn hours(start: u32, end: u32) -> (NaiveTime, NaiveTime) {
        (
            NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
        )
    }

    #[test]
    fn profile_round_trips_with_qualifications() {
        let conn = db();
        let profile = doctor_profile(&conn, "dr.njoroge", Some("KMPDC-001"));
        let stored = get_health_worker_profile(&conn, &profile.id).unwrap().unwrap();
        assert_eq!(stored, profile);
        assert_eq!(get_profile_by_user(&conn, &profile.user_id).unwrap(), Some(profile));
    }

    #[test]
    fn one_profile_per_user_and_unique_license() {
        let conn = db();
        let ctx = AuditContext::system();
        let profile = doctor_profile(&conn, "dr.kiprop", Some("KMPDC-002"));

        let second = create_health_worker_profile(
            &conn,
            &ctx,
            &NewHealthWorkerProfile {
                user_id: profile.user_id,
                ..Default::default()
            },
        );
        assert!(matches!(
            second,
            Err(DatabaseError::Duplicate { ref field, .. }) if field == "user_id"
        ));

        let nurse = user_with_role(&conn, "n.atieno", UserRole::Nurse);
        let stolen = create_health_worker_profile(
            &conn,
            &ctx,
            &NewHealthWorkerProfile {
                user_id: nurse.id,
                license_number: Some("KMPDC-002".into()),
                ..Default::default()
            },
        );
        assert!(matches!(
            stolen,
            Err(DatabaseError::Duplicate { ref field, .. }) if field == "license_number"
        ));
    }

    #[test]
    fn profile_update_is_optimistic() {
        let conn = db();
        let ctx = AuditContext::system();
        let profile = doctor_profile(&conn, "dr.chege", None);

        let mut update = HealthWorkerProfileUpdate::from(&profile);
        update.years_of_experience = 9;
        let updated =
            update_health_worker_profile(&conn, &ctx, &profile.id, profile.version, &update).unwrap();
        assert_eq!(updated.years_of_experience, 9);
        assert_eq!(updated.version, 2);

        let stale = update_health_worker_profile(&conn, &ctx, &profile.id, profile.version, &update);
        assert!(matches!(stale, Err(DatabaseError::ConcurrentModification { .. })));
    }

    #[test]
    fn schedules_validate_and_reject_duplicates() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, _, county) = location_tree(&conn);
        let facility = facility(&conn, county.id);
        let profile = doctor_profile(&conn, "dr.mwende", None);
        let (start, end) = hours(8, 17);

        let monday = NewWorkSchedule {
            profile_id: profile.id,
            facility_id: facility.id,
            day_of_week: 0,
            start_time: start,
            end_time: end,
            schedule_type: ScheduleType::Regular,
        };
        let created = create_work_schedule(&conn, &ctx, &monday).unwrap();
        assert_eq!(list_work_schedules(&conn, &profile.id).unwrap(), vec![created]);

        let duplicate = create_work_schedule(&conn, &ctx, &monday);
        assert!(matches!(duplicate, Err(DatabaseError::Duplicate { .. })));

        let backwards = NewWorkSchedule {
            start_time: end,
            end_time: start,
            ..monday.clone()
        };
        assert!(matches!(
            create_work_schedule(&conn, &ctx, &backwards),
            Err(DatabaseError::ConstraintViolation(_))
        ));

        let eighth_day = NewWorkSchedule {
            day_of_week: 7,
            ..monday
        };
        assert!(matches!(
            create_work_schedule(&conn, &ctx, &eighth_day),
            Err(DatabaseError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn evaluation_computes_overall_rating() {
        let conn = db();
        let ctx = AuditContext::system();
        let profile = doctor_profile(&conn, "dr.akinyi", None);
        let evaluator = admin(&conn);
        let ratings = Ratings {
            clinical_skills: 5,
            communication_skills: 4,
            teamwork: 4,
            professionalism: 5,
            productivity: 3,
        };
        let new = NewPerformanceEvaluation {
            profile_id: profile.id,
            evaluator_id: evaluator.id,
            evaluation_date: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            ratings,
            strengths: "Diagnostics".into(),
            areas_for_improvement: "Documentation".into(),
        };

        let evaluation = create_performance_evaluation(&conn, &ctx, &new).unwrap();
        assert_eq!(evaluation.overall_rating, 4);
        assert_eq!(list_evaluations(&conn, &profile.id).unwrap(), vec![evaluation]);

        let out_of_range = NewPerformanceEvaluation {
            ratings: Ratings {
                productivity: 6,
                ..ratings
            },
            ..new
        };
        assert!(matches!(
            create_performance_evaluation(&conn, &ctx, &out_of_range),
            Err(DatabaseError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn removing_user_clears_schedules_and_evaluations() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, _, county) = location_tree(&conn);
        let facility = facility(&conn, county.id);
        let profile = doctor_profile(&conn, "dr.barasa", None);
        let (start, end) = hours(9, 13);
        create_work_schedule(
            &conn,
            &ctx,
            &NewWorkSchedule {
                profile_id: profile.id,
                facility_id: facility.id,
                day_of_week: 2,
                start_time: start,
                end_time: end,
                schedule_type: ScheduleType::OnCall,
            },
        )
        .unwrap();

        delete_entity(&conn, &ctx, EntityKind::User, &profile.user_id).unwrap();
        assert!(list_work_schedules(&conn, &profile.id).unwrap().is_empty());
        assert!(get_profile_by_user(&conn, &profile.user_id).unwrap().is_none());
    }
}
