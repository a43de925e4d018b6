use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `system_configuration` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSetting {
    pub key: String,
    pub value: String,
    pub description: String,
    /// Readable by non-admin callers.
    pub is_public: bool,
    pub updated_at: DateTime<Utc>,
}
