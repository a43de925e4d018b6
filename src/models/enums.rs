use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(EntityKind {
    Location => "location",
    HealthFacility => "health_facility",
    User => "user",
    HealthWorkerProfile => "health_worker_profile",
    WorkSchedule => "work_schedule",
    PerformanceEvaluation => "performance_evaluation",
    Patient => "patient",
    PatientVisit => "patient_visit",
    HealthRecord => "health_record",
    VitalSigns => "vital_signs",
    Medication => "medication",
    LaboratoryTest => "laboratory_test",
    ImagingStudy => "imaging_study",
    RecordCorrection => "record_correction",
    Appointment => "appointment",
});

str_enum!(LocationType {
    Country => "country",
    Region => "region",
    District => "district",
    Subcounty => "subcounty",
    Parish => "parish",
    Village => "village",
});

str_enum!(FacilityType {
    Hospital => "hospital",
    HealthCenter => "health_center",
    Clinic => "clinic",
    Dispensary => "dispensary",
    Laboratory => "laboratory",
    Pharmacy => "pharmacy",
});

str_enum!(UserRole {
    Admin => "admin",
    Doctor => "doctor",
    Nurse => "nurse",
    Midwife => "midwife",
    CommunityWorker => "community_worker",
    Pharmacist => "pharmacist",
    LabTechnician => "lab_technician",
});

impl UserRole {
    /// Roles that may be booked as an appointment provider.
    pub fn can_take_appointments(&self) -> bool {
        matches!(
            self,
            UserRole::Doctor | UserRole::Nurse | UserRole::Midwife | UserRole::CommunityWorker
        )
    }
}

str_enum!(Gender {
    Male => "M",
    Female => "F",
    Other => "O",
});

str_enum!(BloodType {
    APositive => "A+",
    ANegative => "A-",
    BPositive => "B+",
    BNegative => "B-",
    AbPositive => "AB+",
    AbNegative => "AB-",
    OPositive => "O+",
    ONegative => "O-",
});

str_enum!(VisitType {
    Consultation => "consultation",
    Emergency => "emergency",
    FollowUp => "follow_up",
    Vaccination => "vaccination",
    Laboratory => "laboratory",
    Pharmacy => "pharmacy",
});

str_enum!(VisitStatus {
    Scheduled => "scheduled",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
    NoShow => "no_show",
});

str_enum!(RecordType {
    Medical => "medical",
    Dental => "dental",
    MentalHealth => "mental_health",
    Maternity => "maternity",
    Pediatric => "pediatric",
    Emergency => "emergency",
    Laboratory => "laboratory",
    Imaging => "imaging",
});

str_enum!(ScheduleType {
    Regular => "regular",
    OnCall => "on_call",
    Overtime => "overtime",
    Emergency => "emergency",
});

str_enum!(AppointmentStatus {
    Scheduled => "scheduled",
    Completed => "completed",
    Cancelled => "cancelled",
    NoShow => "no_show",
});

impl AppointmentStatus {
    /// Statuses that still hold a slot for overlap checks.
    pub fn holds_slot(&self) -> bool {
        matches!(self, AppointmentStatus::Scheduled | AppointmentStatus::NoShow)
    }
}

str_enum!(AuditAction {
    Create => "create",
    Update => "update",
    Delete => "delete",
    View => "view",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn entity_kind_roundtrips_every_variant() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_str(kind.as_str()).unwrap(), *kind);
        }
    }

    #[test]
    fn unknown_value_is_invalid_enum() {
        let err = LocationType::from_str("continent").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { ref field, .. } if field == "LocationType"));
    }

    #[test]
    fn serde_uses_storage_names() {
        let json = serde_json::to_string(&BloodType::AbNegative).unwrap();
        assert_eq!(json, "\"AB-\"");
        let role: UserRole = serde_json::from_str("\"community_worker\"").unwrap();
        assert_eq!(role, UserRole::CommunityWorker);
    }

    #[test]
    fn appointment_eligibility_matches_clinical_roles() {
        assert!(UserRole::Midwife.can_take_appointments());
        assert!(!UserRole::Pharmacist.can_take_appointments());
        assert!(!UserRole::Admin.can_take_appointments());
    }
}
