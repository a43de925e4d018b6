use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AuditAction, EntityKind};

/// Longest user agent kept on an audit entry.
pub const MAX_USER_AGENT_LEN: usize = 512;

/// Who performed an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    User(Uuid),
    /// Provisioning, seeding and other unattended jobs.
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Actor::User(id) => Some(*id),
            Actor::System => None,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

/// Sanitized change payload stored with each audit entry.
///
/// Only field names are recorded, never values, so the trail holds no
/// clinical data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub fields: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub filters: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

impl ChangeSet {
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.insert(filter.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    /// Build a change set from an arbitrary JSON payload, keeping only the
    /// recognised keys with the expected shapes. Everything else is dropped.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        let string_set = |key: &str| -> BTreeSet<String> {
            obj.get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default()
        };
        let metadata = obj
            .get("metadata")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            fields: string_set("fields"),
            filters: string_set("filters"),
            summary: obj.get("summary").and_then(|v| v.as_str()).map(str::to_owned),
            metadata,
            count: obj.get("count").and_then(|v| v.as_i64()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Client details captured at the API boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(ip_address: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent: user_agent.map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect()),
        }
    }
}

/// Passed to every audited write: who acts, and from where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub actor: Actor,
    pub request: RequestContext,
}

impl AuditContext {
    pub fn system() -> Self {
        Self {
            actor: Actor::System,
            request: RequestContext::default(),
        }
    }

    pub fn user(id: Uuid) -> Self {
        Self {
            actor: Actor::User(id),
            request: RequestContext::default(),
        }
    }

    pub fn with_request(mut self, request: RequestContext) -> Self {
        self.request = request;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub id: Uuid,
    pub actor: Actor,
    pub action: AuditAction,
    pub target_type: EntityKind,
    pub target_id: Uuid,
    pub changes: ChangeSet,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub prev_hash: String,
    pub entry_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_payload_keys_are_dropped() {
        let changes = ChangeSet::from_json(&json!({
            "fields": ["phone_number", "address", "address"],
            "summary": "contact details",
            "diagnosis": "should never be stored",
            "count": 2,
            "metadata": { "source": "api", "nested": { "x": 1 } }
        }));
        assert_eq!(changes.fields.len(), 2);
        assert_eq!(changes.summary.as_deref(), Some("contact details"));
        assert_eq!(changes.count, Some(2));
        assert_eq!(changes.metadata.len(), 1);
        let stored = serde_json::to_string(&changes).unwrap();
        assert!(!stored.contains("diagnosis"));
    }

    #[test]
    fn non_object_payload_is_empty() {
        assert!(ChangeSet::from_json(&json!(["fields"])).is_empty());
    }

    #[test]
    fn long_user_agent_is_truncated() {
        let ctx = RequestContext::new(None, Some("x".repeat(2_000)));
        assert_eq!(ctx.user_agent.unwrap().len(), MAX_USER_AGENT_LEN);
    }
}
