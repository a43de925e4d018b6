//! Initial administrator and sample data.
//!
//! Both entry points are safe to run repeatedly: existing rows are found
//! by their natural keys and reused instead of duplicated.

use chrono::NaiveDate;
use rusqlite::Connection;
use uuid::Uuid;

use crate::db::{
    atomic, count_active_admins, create_facility, create_health_worker_profile, create_location,
    create_patient, create_user, get_patient_by_identifier, get_profile_by_user,
    get_user_by_username, list_children, list_facilities, list_root_locations, DatabaseError,
};
use crate::models::*;

pub const SAMPLE_DOCTOR_USERNAME: &str = "sample.doctor";
pub const SAMPLE_PATIENT_IDENTIFIER: &str = "PAT-SAMPLE01";
const SAMPLE_FACILITY_NAME: &str = "Nairobi Sample Hospital";

/// Create the first administrator. Returns `None` when an active admin
/// already exists.
pub fn create_initial_admin(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewUser,
) -> Result<Option<User>, DatabaseError> {
    if count_active_admins(conn)? > 0 {
        tracing::info!("active administrator exists; skipping");
        return Ok(None);
    }
    let admin = create_user(
        conn,
        ctx,
        &NewUser {
            role: UserRole::Admin,
            ..new.clone()
        },
    )?;
    Ok(Some(admin))
}

/// Ids of the sample rows, whether created now or found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleData {
    pub country_id: Uuid,
    pub region_id: Uuid,
    pub county_id: Uuid,
    pub facility_id: Uuid,
    pub doctor_id: Uuid,
    pub profile_id: Uuid,
    pub patient_id: Uuid,
    /// Rows inserted by this call.
    pub created: usize,
}

/// Kenya → Nairobi → Nairobi County, one hospital, one doctor with a
/// profile and one registered patient.
pub fn load_sample_data(conn: &Connection, ctx: &AuditContext) -> Result<SampleData, DatabaseError> {
    atomic(conn, |conn| {
        let mut created = 0;

        let country = match list_root_locations(conn)?.into_iter().find(|l| l.name == "Kenya") {
            Some(found) => found,
            None => {
                created += 1;
                create_location(conn, ctx, &NewLocation::root("Kenya", LocationType::Country))?
            }
        };
        let region = child_location(conn, ctx, &country, "Nairobi", LocationType::Region, &mut created)?;
        let county = child_location(
            conn,
            ctx,
            &region,
            "Nairobi County",
            LocationType::District,
            &mut created,
        )?;

        let filter = FacilityFilter {
            location_id: Some(county.id),
            name_contains: Some(SAMPLE_FACILITY_NAME.into()),
            ..FacilityFilter::default()
        };
        let facility = match list_facilities(conn, &filter, &Page::first(1))?.items.into_iter().next() {
            Some(found) => found,
            None => {
                created += 1;
                create_facility(conn, ctx, &sample_facility(county.id))?
            }
        };

        let doctor = match get_user_by_username(conn, SAMPLE_DOCTOR_USERNAME)? {
            Some(found) => found,
            None => {
                created += 1;
                create_user(conn, ctx, &sample_doctor())?
            }
        };
        let profile = match get_profile_by_user(conn, &doctor.id)? {
            Some(found) => found,
            None => {
                created += 1;
                create_health_worker_profile(conn, ctx, &sample_profile(doctor.id, facility.id))?
            }
        };

        let patient = match get_patient_by_identifier(conn, SAMPLE_PATIENT_IDENTIFIER)? {
            Some(found) => found,
            None => {
                created += 1;
                create_patient(conn, ctx, &sample_patient(facility.id, county.id))?
            }
        };

        tracing::info!(created, "sample data loaded");
        Ok(SampleData {
            country_id: country.id,
            region_id: region.id,
            county_id: county.id,
            facility_id: facility.id,
            doctor_id: doctor.id,
            profile_id: profile.id,
            patient_id: patient.id,
            created,
        })
    })
}

fn child_location(
    conn: &Connection,
    ctx: &AuditContext,
    parent: &Location,
    name: &str,
    location_type: LocationType,
    created: &mut usize,
) -> Result<Location, DatabaseError> {
    if let Some(found) = list_children(conn, &parent.id)?.into_iter().find(|l| l.name == name) {
        return Ok(found);
    }
    *created += 1;
    create_location(conn, ctx, &NewLocation::child(name, location_type, parent.id))
}

fn sample_facility(location_id: Uuid) -> NewHealthFacility {
    NewHealthFacility {
        name: SAMPLE_FACILITY_NAME.into(),
        facility_type: FacilityType::Hospital,
        location_id,
        address: "Hospital Road, Nairobi".into(),
        phone_number: "+254202000000".into(),
        email: Some("info@sample-hospital.example".into()),
        contact_person_name: "Reception".into(),
        contact_person_phone: "+254202000001".into(),
        is_24_hours: true,
        services_offered: vec!["outpatient".into(), "laboratory".into(), "maternity".into()],
    }
}

fn sample_doctor() -> NewUser {
    NewUser {
        username: SAMPLE_DOCTOR_USERNAME.into(),
        email: "sample.doctor@opencare.example".into(),
        first_name: "Amina".into(),
        last_name: "Otieno".into(),
        role: UserRole::Doctor,
        phone_number: Some("+254711000000".into()),
    }
}

fn sample_profile(user_id: Uuid, facility_id: Uuid) -> NewHealthWorkerProfile {
    NewHealthWorkerProfile {
        user_id,
        license_number: Some("KMPDC-SAMPLE-001".into()),
        specialization: Some("General Practice".into()),
        years_of_experience: 8,
        primary_facility_id: Some(facility_id),
        is_licensed: true,
        languages_spoken: vec!["en".into(), "sw".into()],
        ..NewHealthWorkerProfile::default()
    }
}

fn sample_patient(facility_id: Uuid, home_location_id: Uuid) -> NewPatient {
    NewPatient {
        patient_identifier: Some(SAMPLE_PATIENT_IDENTIFIER.into()),
        first_name: "Juma".into(),
        middle_name: None,
        last_name: "Mwangi".into(),
        date_of_birth: NaiveDate::from_ymd_opt(1985, 4, 12).unwrap_or_default(),
        gender: Gender::Male,
        phone_number: Some("+254722000000".into()),
        address: "Kibera, Nairobi".into(),
        registered_facility_id: Some(facility_id),
        home_location_id: Some(home_location_id),
        blood_type: Some(BloodType::OPositive),
        allergies: vec!["penicillin".into()],
        chronic_conditions: Vec::new(),
        registration_date: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_audit_entries, open_memory_database, patients_within, verify_chain};

    fn admin_request(username: &str) -> NewUser {
        NewUser {
            username: username.into(),
            email: format!("{username}@opencare.example"),
            first_name: "System".into(),
            last_name: "Administrator".into(),
            role: UserRole::Nurse,
            phone_number: None,
        }
    }

    #[test]
    fn initial_admin_is_created_once() {
        let conn = open_memory_database().unwrap();
        let ctx = AuditContext::system();

        let admin = create_initial_admin(&conn, &ctx, &admin_request("root")).unwrap().unwrap();
        assert_eq!(admin.role, UserRole::Admin);

        let again = create_initial_admin(&conn, &ctx, &admin_request("root2")).unwrap();
        assert!(again.is_none());
        assert!(get_user_by_username(&conn, "root2").unwrap().is_none());
        assert_eq!(count_active_admins(&conn).unwrap(), 1);
    }

    #[test]
    fn sample_data_is_idempotent() {
        let conn = open_memory_database().unwrap();
        let ctx = AuditContext::system();

        let first = load_sample_data(&conn, &ctx).unwrap();
        assert_eq!(first.created, 7);
        let entries = count_audit_entries(&conn).unwrap();
        assert_eq!(entries, 7);

        let second = load_sample_data(&conn, &ctx).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(SampleData { created: 7, ..second }, first);
        assert_eq!(count_audit_entries(&conn).unwrap(), entries);
        assert!(verify_chain(&conn).unwrap().is_intact());
    }

    #[test]
    fn sample_patient_lives_in_the_hierarchy() {
        let conn = open_memory_database().unwrap();
        let data = load_sample_data(&conn, &AuditContext::system()).unwrap();

        let in_kenya = patients_within(&conn, &data.country_id).unwrap();
        assert_eq!(in_kenya.len(), 1);
        assert_eq!(in_kenya[0].patient_identifier, SAMPLE_PATIENT_IDENTIFIER);
    }
}
