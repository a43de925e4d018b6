use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::ScheduleType;

/// A professional qualification, stored as part of the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualification {
    pub title: String,
    pub institution: String,
    pub completed_on: Option<NaiveDate>,
    pub expires_on: Option<NaiveDate>,
}

/// Professional extension of a [`super::User`]; exactly one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthWorkerProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub license_number: Option<String>,
    pub specialization: Option<String>,
    pub years_of_experience: u32,
    pub primary_facility_id: Option<Uuid>,
    pub is_licensed: bool,
    pub license_expiry_date: Option<NaiveDate>,
    pub languages_spoken: Vec<String>,
    pub qualifications: Vec<Qualification>,
    pub bio: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the owning user was removed and the profile anonymized.
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewHealthWorkerProfile {
    pub user_id: Uuid,
    pub license_number: Option<String>,
    pub specialization: Option<String>,
    pub years_of_experience: u32,
    pub primary_facility_id: Option<Uuid>,
    pub is_licensed: bool,
    pub license_expiry_date: Option<NaiveDate>,
    pub languages_spoken: Vec<String>,
    pub qualifications: Vec<Qualification>,
    pub bio: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
}

/// Mutable profile fields; the owning user never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthWorkerProfileUpdate {
    pub license_number: Option<String>,
    pub specialization: Option<String>,
    pub years_of_experience: u32,
    pub primary_facility_id: Option<Uuid>,
    pub is_licensed: bool,
    pub license_expiry_date: Option<NaiveDate>,
    pub languages_spoken: Vec<String>,
    pub qualifications: Vec<Qualification>,
    pub bio: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
}

impl From<&HealthWorkerProfile> for HealthWorkerProfileUpdate {
    fn from(p: &HealthWorkerProfile) -> Self {
        Self {
            license_number: p.license_number.clone(),
            specialization: p.specialization.clone(),
            years_of_experience: p.years_of_experience,
            primary_facility_id: p.primary_facility_id,
            is_licensed: p.is_licensed,
            license_expiry_date: p.license_expiry_date,
            languages_spoken: p.languages_spoken.clone(),
            qualifications: p.qualifications.clone(),
            bio: p.bio.clone(),
            emergency_contact_name: p.emergency_contact_name.clone(),
            emergency_contact_phone: p.emergency_contact_phone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSchedule {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub facility_id: Uuid,
    /// 0 = Monday … 6 = Sunday
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub schedule_type: ScheduleType,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkSchedule {
    pub profile_id: Uuid,
    pub facility_id: Uuid,
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub schedule_type: ScheduleType,
}

/// Ratings are on a 1..=5 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratings {
    pub clinical_skills: u8,
    pub communication_skills: u8,
    pub teamwork: u8,
    pub professionalism: u8,
    pub productivity: u8,
}

impl Ratings {
    fn as_array(&self) -> [u8; 5] {
        [
            self.clinical_skills,
            self.communication_skills,
            self.teamwork,
            self.professionalism,
            self.productivity,
        ]
    }

    pub fn all_in_range(&self) -> bool {
        self.as_array().iter().all(|r| (1..=5).contains(r))
    }

    /// Integer mean of the five ratings (rounded down).
    pub fn overall(&self) -> u8 {
        let sum: u32 = self.as_array().iter().map(|&r| u32::from(r)).sum();
        (sum / 5) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEvaluation {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub evaluator_id: Uuid,
    pub evaluation_date: NaiveDate,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub ratings: Ratings,
    pub overall_rating: u8,
    pub strengths: String,
    pub areas_for_improvement: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPerformanceEvaluation {
    pub profile_id: Uuid,
    pub evaluator_id: Uuid,
    pub evaluation_date: NaiveDate,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub ratings: Ratings,
    pub strengths: String,
    pub areas_for_improvement: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_rating_is_floored_mean() {
        let ratings = Ratings {
            clinical_skills: 5,
            communication_skills: 4,
            teamwork: 4,
            professionalism: 5,
            productivity: 3,
        };
        assert_eq!(ratings.overall(), 4);
        assert!(ratings.all_in_range());
    }

    #[test]
    fn zero_rating_is_out_of_range() {
        let ratings = Ratings {
            clinical_skills: 0,
            communication_skills: 4,
            teamwork: 4,
            professionalism: 5,
            productivity: 3,
        };
        assert!(!ratings.all_in_range());
    }
}
