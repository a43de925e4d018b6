use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{EntityKind, RecordType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub facility_id: Uuid,
    pub attending_provider_id: Option<Uuid>,
    pub record_type: RecordType,
    pub record_date: DateTime<Utc>,
    pub chief_complaint: Option<String>,
    pub assessment: Option<String>,
    pub diagnosis: Vec<String>,
    pub treatment_plan: Option<String>,
    pub notes: Option<String>,
    pub is_confidential: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl HealthRecord {
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHealthRecord {
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub facility_id: Uuid,
    pub attending_provider_id: Option<Uuid>,
    pub record_type: RecordType,
    pub record_date: DateTime<Utc>,
    pub chief_complaint: Option<String>,
    pub assessment: Option<String>,
    pub diagnosis: Vec<String>,
    pub treatment_plan: Option<String>,
    pub notes: Option<String>,
    pub is_confidential: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecordUpdate {
    pub attending_provider_id: Option<Uuid>,
    pub chief_complaint: Option<String>,
    pub assessment: Option<String>,
    pub diagnosis: Vec<String>,
    pub treatment_plan: Option<String>,
    pub notes: Option<String>,
    pub is_confidential: bool,
}

impl From<&HealthRecord> for HealthRecordUpdate {
    fn from(r: &HealthRecord) -> Self {
        Self {
            attending_provider_id: r.attending_provider_id,
            chief_complaint: r.chief_complaint.clone(),
            assessment: r.assessment.clone(),
            diagnosis: r.diagnosis.clone(),
            treatment_plan: r.treatment_plan.clone(),
            notes: r.notes.clone(),
            is_confidential: r.is_confidential,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    pub id: Uuid,
    pub record_id: Uuid,
    pub temperature: Option<f64>,
    pub blood_pressure_systolic: Option<u32>,
    pub blood_pressure_diastolic: Option<u32>,
    pub heart_rate: Option<u32>,
    pub respiratory_rate: Option<u32>,
    pub oxygen_saturation: Option<u32>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub bmi: Option<f64>,
    pub pain_scale: Option<u8>,
    pub recorded_by: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewVitalSigns {
    pub record_id: Uuid,
    pub temperature: Option<f64>,
    pub blood_pressure_systolic: Option<u32>,
    pub blood_pressure_diastolic: Option<u32>,
    pub heart_rate: Option<u32>,
    pub respiratory_rate: Option<u32>,
    pub oxygen_saturation: Option<u32>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub pain_scale: Option<u8>,
    pub recorded_by: Option<Uuid>,
}

impl NewVitalSigns {
    /// Body-mass index rounded to two decimals, when height and weight are both known.
    pub fn bmi(&self) -> Option<f64> {
        match (self.height_cm, self.weight_kg) {
            (Some(h), Some(w)) if h > 0.0 => {
                let metres = h / 100.0;
                Some((w / (metres * metres) * 100.0).round() / 100.0)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub id: Uuid,
    pub record_id: Uuid,
    pub medication_name: String,
    pub generic_name: Option<String>,
    pub dosage_form: String,
    pub strength: String,
    pub dosage: String,
    pub frequency: String,
    pub route: String,
    pub duration: Option<String>,
    pub prescribed_by: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub instructions: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMedication {
    pub record_id: Uuid,
    pub medication_name: String,
    pub generic_name: Option<String>,
    pub dosage_form: String,
    pub strength: String,
    pub dosage: String,
    pub frequency: String,
    pub route: String,
    pub duration: Option<String>,
    pub prescribed_by: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaboratoryTest {
    pub id: Uuid,
    pub record_id: Uuid,
    pub test_name: String,
    pub test_category: String,
    pub test_code: Option<String>,
    pub ordered_by: Option<Uuid>,
    pub collected_at: Option<DateTime<Utc>>,
    pub result_at: Option<DateTime<Utc>>,
    /// Parameter name → measured value.
    pub results: BTreeMap<String, String>,
    /// Parameter name → reference range.
    pub reference_range: BTreeMap<String, String>,
    pub is_abnormal: bool,
    pub interpretation: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLaboratoryTest {
    pub record_id: Uuid,
    pub test_name: String,
    pub test_category: String,
    pub test_code: Option<String>,
    pub ordered_by: Option<Uuid>,
    pub collected_at: Option<DateTime<Utc>>,
    pub result_at: Option<DateTime<Utc>>,
    pub results: BTreeMap<String, String>,
    pub reference_range: BTreeMap<String, String>,
    pub is_abnormal: bool,
    pub interpretation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingStudy {
    pub id: Uuid,
    pub record_id: Uuid,
    pub study_type: String,
    pub body_part: String,
    pub description: String,
    pub ordered_by: Option<Uuid>,
    pub radiologist_id: Option<Uuid>,
    pub performed_at: Option<DateTime<Utc>>,
    pub contrast_used: bool,
    pub findings: Option<String>,
    pub impression: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewImagingStudy {
    pub record_id: Uuid,
    pub study_type: String,
    pub body_part: String,
    pub description: String,
    pub ordered_by: Option<Uuid>,
    pub radiologist_id: Option<Uuid>,
    pub performed_at: Option<DateTime<Utc>>,
    pub contrast_used: bool,
    pub findings: Option<String>,
    pub impression: Option<String>,
}

/// Append-only amendment to a finalized record or one of its entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordCorrection {
    pub id: Uuid,
    pub record_id: Uuid,
    pub target_type: EntityKind,
    pub target_id: Uuid,
    pub field: String,
    pub previous_value: Option<String>,
    pub corrected_value: String,
    pub reason: String,
    pub author_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecordCorrection {
    pub record_id: Uuid,
    pub target_type: EntityKind,
    pub target_id: Uuid,
    pub field: String,
    pub previous_value: Option<String>,
    pub corrected_value: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmi_from_height_and_weight() {
        let vitals = NewVitalSigns {
            height_cm: Some(175.0),
            weight_kg: Some(70.0),
            ..Default::default()
        };
        assert_eq!(vitals.bmi(), Some(22.86));
    }

    #[test]
    fn bmi_needs_both_measurements() {
        let vitals = NewVitalSigns {
            weight_kg: Some(70.0),
            ..Default::default()
        };
        assert_eq!(vitals.bmi(), None);
    }
}
