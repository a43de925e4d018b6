use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AppointmentStatus, FacilityType, Gender, RecordType};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

/// Keyset position: lists are ordered by `(created_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Entities that can be paged by creation order.
pub trait Keyed {
    fn cursor(&self) -> Cursor;
}

macro_rules! keyed {
    ($($ty:ty),+ $(,)?) => {
        $(impl Keyed for $ty {
            fn cursor(&self) -> Cursor {
                Cursor { created_at: self.created_at, id: self.id }
            }
        })+
    };
}

keyed!(
    super::Location,
    super::HealthFacility,
    super::User,
    super::Patient,
    super::PatientVisit,
    super::HealthRecord,
    super::Appointment,
);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub after: Option<Cursor>,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            after: None,
        }
    }
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self { limit, after: None }
    }

    pub fn after(limit: u32, cursor: Cursor) -> Self {
        Self {
            limit,
            after: Some(cursor),
        }
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    /// Cursor for the following page; `None` on the last page.
    pub next: Option<Cursor>,
}

impl<T: Keyed> Paged<T> {
    /// Build a page from up to `limit + 1` rows fetched in key order.
    pub fn from_overfetch(mut rows: Vec<T>, limit: u32) -> Self {
        let limit = limit as usize;
        let next = if rows.len() > limit {
            rows.truncate(limit);
            rows.last().map(Keyed::cursor)
        } else {
            None
        };
        Self { items: rows, next }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacilityFilter {
    pub facility_type: Option<FacilityType>,
    pub location_id: Option<Uuid>,
    pub is_24_hours: Option<bool>,
    /// Case-insensitive substring of the facility name.
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientFilter {
    pub registered_facility_id: Option<Uuid>,
    pub gender: Option<Gender>,
    pub is_active: Option<bool>,
    /// Case-insensitive substring of first or last name.
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthRecordFilter {
    pub patient_id: Option<Uuid>,
    pub facility_id: Option<Uuid>,
    pub record_type: Option<RecordType>,
    pub finalized: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentFilter {
    pub patient_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub facility_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}
