use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{BloodType, Gender, VisitStatus, VisitType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    /// Globally unique, assigned once, never changed.
    pub patient_identifier: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub phone_number: Option<String>,
    pub address: String,
    pub registered_facility_id: Option<Uuid>,
    pub home_location_id: Option<Uuid>,
    pub blood_type: Option<BloodType>,
    pub allergies: Vec<String>,
    pub chronic_conditions: Vec<String>,
    pub registration_date: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Patient {
    pub fn full_name(&self) -> String {
        match &self.middle_name {
            Some(middle) => format!("{} {} {}", self.first_name, middle, self.last_name),
            None => format!("{} {}", self.first_name, self.last_name),
        }
    }

    /// Age in whole years on `today`.
    pub fn age_on(&self, today: NaiveDate) -> u32 {
        today.years_since(self.date_of_birth).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPatient {
    /// Generated as `PAT-XXXXXXXX` when absent.
    pub patient_identifier: Option<String>,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub phone_number: Option<String>,
    pub address: String,
    pub registered_facility_id: Option<Uuid>,
    pub home_location_id: Option<Uuid>,
    pub blood_type: Option<BloodType>,
    pub allergies: Vec<String>,
    pub chronic_conditions: Vec<String>,
    /// Defaults to the time of creation.
    pub registration_date: Option<DateTime<Utc>>,
}

/// Mutable patient fields; the identifier is deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientUpdate {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub phone_number: Option<String>,
    pub address: String,
    pub registered_facility_id: Option<Uuid>,
    pub home_location_id: Option<Uuid>,
    pub blood_type: Option<BloodType>,
    pub allergies: Vec<String>,
    pub chronic_conditions: Vec<String>,
    pub is_active: bool,
}

impl From<&Patient> for PatientUpdate {
    fn from(p: &Patient) -> Self {
        Self {
            first_name: p.first_name.clone(),
            middle_name: p.middle_name.clone(),
            last_name: p.last_name.clone(),
            date_of_birth: p.date_of_birth,
            gender: p.gender,
            phone_number: p.phone_number.clone(),
            address: p.address.clone(),
            registered_facility_id: p.registered_facility_id,
            home_location_id: p.home_location_id,
            blood_type: p.blood_type,
            allergies: p.allergies.clone(),
            chronic_conditions: p.chronic_conditions.clone(),
            is_active: p.is_active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientVisit {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub facility_id: Uuid,
    pub attending_provider_id: Option<Uuid>,
    pub visit_type: VisitType,
    pub status: VisitStatus,
    pub visit_at: DateTime<Utc>,
    pub chief_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPatientVisit {
    pub patient_id: Uuid,
    pub facility_id: Uuid,
    pub attending_provider_id: Option<Uuid>,
    pub visit_type: VisitType,
    pub status: VisitStatus,
    pub visit_at: DateTime<Utc>,
    pub chief_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientVisitUpdate {
    pub attending_provider_id: Option<Uuid>,
    pub status: VisitStatus,
    pub visit_at: DateTime<Utc>,
    pub chief_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub notes: Option<String>,
}
