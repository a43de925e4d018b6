use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::LocationType;

/// A node of the geographic hierarchy (country → region → district …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub location_type: LocationType,
    pub parent_id: Option<Uuid>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLocation {
    pub name: String,
    pub location_type: LocationType,
    pub parent_id: Option<Uuid>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NewLocation {
    pub fn root(name: impl Into<String>, location_type: LocationType) -> Self {
        Self {
            name: name.into(),
            location_type,
            parent_id: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn child(name: impl Into<String>, location_type: LocationType, parent_id: Uuid) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::root(name, location_type)
        }
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }
}

/// Mutable location fields. Re-parenting goes through `attach_location`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl From<&Location> for LocationUpdate {
    fn from(l: &Location) -> Self {
        Self {
            name: l.name.clone(),
            latitude: l.latitude,
            longitude: l.longitude,
        }
    }
}
