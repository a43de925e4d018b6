//! Shared builders for repository tests.

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use super::*;
use crate::db::sqlite::open_memory_database;
use crate::models::*;

pub fn db() -> Connection {
    open_memory_database().unwrap()
}

pub fn audit_count(conn: &Connection) -> i64 {
    count_audit_entries(conn).unwrap()
}

pub fn user_with_role(conn: &Connection, username: &str, role: UserRole) -> User {
    create_user(
        conn,
        &AuditContext::system(),
        &NewUser {
            username: username.into(),
            email: format!("{username}@opencare.test"),
            first_name: "Test".into(),
            last_name: username.into(),
            role,
            phone_number: Some("+254700000000".into()),
        },
    )
    .unwrap()
}

pub fn admin(conn: &Connection) -> User {
    user_with_role(conn, "admin", UserRole::Admin)
}

/// Kenya → Nairobi → Nairobi County
pub fn location_tree(conn: &Connection) -> (Location, Location, Location) {
    let ctx = AuditContext::system();
    let country = create_location(conn, &ctx, &NewLocation::root("Kenya", LocationType::Country)).unwrap();
    let region = create_location(
        conn,
        &ctx,
        &NewLocation::child("Nairobi", LocationType::Region, country.id),
    )
    .unwrap();
    let county = create_location(
        conn,
        &ctx,
        &NewLocation::child("Nairobi County", LocationType::District, region.id),
    )
    .unwrap();
    (country, region, county)
}

pub fn new_facility(location_id: Uuid, name: &str) -> NewHealthFacility {
    NewHealthFacility {
        name: name.into(),
        facility_type: FacilityType::Hospital,
        location_id,
        address: "Hospital Road".into(),
        phone_number: "+254202726300".into(),
        email: None,
        contact_person_name: "Front Desk".into(),
        contact_person_phone: "+254202726301".into(),
        is_24_hours: true,
        services_offered: vec!["outpatient".into()],
    }
}

pub fn facility(conn: &Connection, location_id: Uuid) -> HealthFacility {
    create_facility(conn, &AuditContext::system(), &new_facility(location_id, "Mbagathi Hospital")).unwrap()
}

pub fn new_patient(first_name: &str, last_name: &str) -> NewPatient {
    NewPatient {
        patient_identifier: None,
        first_name: first_name.into(),
        middle_name: None,
        last_name: last_name.into(),
        date_of_birth: NaiveDate::from_ymd_opt(1990, 3, 15).unwrap(),
        gender: Gender::Male,
        phone_number: Some("+254711000111".into()),
        address: "Kibera".into(),
        registered_facility_id: None,
        home_location_id: None,
        blood_type: None,
        allergies: vec![],
        chronic_conditions: vec![],
        registration_date: Some(Utc::now() - Duration::days(30)),
    }
}

pub fn patient(conn: &Connection, facility_id: Option<Uuid>) -> Patient {
    let mut new = new_patient("Jane", "Doe");
    new.gender = Gender::Female;
    new.registered_facility_id = facility_id;
    create_patient(conn, &AuditContext::system(), &new).unwrap()
}

pub fn visit(conn: &Connection, patient: &Patient, facility_id: Uuid) -> PatientVisit {
    create_visit(
        conn,
        &AuditContext::system(),
        &NewPatientVisit {
            patient_id: patient.id,
            facility_id,
            attending_provider_id: None,
            visit_type: VisitType::Consultation,
            status: VisitStatus::Completed,
            visit_at: patient.registration_date + Duration::days(1),
            chief_complaint: Some("Fever".into()),
            diagnosis: None,
            notes: None,
        },
    )
    .unwrap()
}

pub fn new_record(patient: &Patient, visit_id: Option<Uuid>, facility_id: Uuid) -> NewHealthRecord {
    NewHealthRecord {
        patient_id: patient.id,
        visit_id,
        facility_id,
        attending_provider_id: None,
        record_type: RecordType::Medical,
        record_date: Utc::now(),
        chief_complaint: Some("Fever".into()),
        assessment: Some("Suspected malaria".into()),
        diagnosis: vec!["B54".into()],
        treatment_plan: None,
        notes: None,
        is_confidential: false,
    }
}

pub fn record(
    conn: &Connection,
    patient: &Patient,
    visit_id: Option<Uuid>,
    facility_id: Uuid,
) -> HealthRecord {
    create_health_record(conn, &AuditContext::system(), &new_record(patient, visit_id, facility_id)).unwrap()
}
