use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::FacilityType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthFacility {
    pub id: Uuid,
    pub name: String,
    pub facility_type: FacilityType,
    pub location_id: Uuid,
    pub address: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub contact_person_name: String,
    pub contact_person_phone: String,
    pub is_24_hours: bool,
    pub services_offered: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHealthFacility {
    pub name: String,
    pub facility_type: FacilityType,
    pub location_id: Uuid,
    pub address: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub contact_person_name: String,
    pub contact_person_phone: String,
    pub is_24_hours: bool,
    pub services_offered: Vec<String>,
}

/// Mutable facility fields. The location is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthFacilityUpdate {
    pub name: String,
    pub address: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub contact_person_name: String,
    pub contact_person_phone: String,
    pub is_24_hours: bool,
    pub services_offered: Vec<String>,
}

impl From<&HealthFacility> for HealthFacilityUpdate {
    fn from(f: &HealthFacility) -> Self {
        Self {
            name: f.name.clone(),
            address: f.address.clone(),
            phone_number: f.phone_number.clone(),
            email: f.email.clone(),
            contact_person_name: f.contact_person_name.clone(),
            contact_person_phone: f.contact_person_phone.clone(),
            is_24_hours: f.is_24_hours,
            services_offered: f.services_offered.clone(),
        }
    }
}
