use std::path::PathBuf;

use thiserror::Error;

use crate::db::DbRole;

/// Application-level constants
pub const APP_NAME: &str = "OpenCare";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DATABASE_FILE: &str = "opencare.db";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "opencare=info,warn"
}

/// Data directory: the platform data dir, or the working directory when
/// the platform has none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opencare")
}

pub fn default_database_path() -> PathBuf {
    default_data_dir().join(DATABASE_FILE)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// What removing a health worker profile does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Clear identifying fields, keep the row for attribution.
    #[default]
    Anonymize,
    /// Delete the row.
    Remove,
}

impl RetentionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicy::Anonymize => "anonymize",
            RetentionPolicy::Remove => "remove",
        }
    }
}

impl std::str::FromStr for RetentionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymize" => Ok(RetentionPolicy::Anonymize),
            "remove" => Ok(RetentionPolicy::Remove),
            _ => Err(ConfigError::InvalidValue {
                key: "OPENCARE_RETENTION".into(),
                value: s.into(),
            }),
        }
    }
}

/// Runtime settings, read from `OPENCARE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_path: PathBuf,
    pub timezone: String,
    pub retention: RetentionPolicy,
    pub max_admin_connections: u32,
    pub max_application_connections: u32,
    pub max_reporting_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            timezone: DEFAULT_TIMEZONE.into(),
            retention: RetentionPolicy::default(),
            max_admin_connections: DbRole::Admin.default_max_connections(),
            max_application_connections: DbRole::Application.default_max_connections(),
            max_reporting_connections: DbRole::Reporting.default_max_connections(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(path) = lookup("OPENCARE_DB_PATH").filter(|p| !p.is_empty()) {
            settings.database_path = PathBuf::from(path);
        }
        if let Some(tz) = lookup("OPENCARE_TIMEZONE").filter(|t| !t.is_empty()) {
            settings.timezone = tz;
        }
        if let Some(retention) = lookup("OPENCARE_RETENTION") {
            settings.retention = retention.parse()?;
        }
        for role in DbRole::ALL {
            let key = format!("OPENCARE_MAX_CONNECTIONS_{}", role.as_str().to_ascii_uppercase());
            if let Some(raw) = lookup(&key) {
                let max = parse_limit(&key, &raw)?;
                *settings.max_connections_mut(role) = max;
            }
        }
        Ok(settings)
    }

    pub fn max_connections(&self, role: DbRole) -> u32 {
        match role {
            DbRole::Admin => self.max_admin_connections,
            DbRole::Application => self.max_application_connections,
            DbRole::Reporting => self.max_reporting_connections,
        }
    }

    fn max_connections_mut(&mut self, role: DbRole) -> &mut u32 {
        match role {
            DbRole::Admin => &mut self.max_admin_connections,
            DbRole::Application => &mut self.max_application_connections,
            DbRole::Reporting => &mut self.max_reporting_connections,
        }
    }
}

fn parse_limit(key: &str, raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(max) if max > 0 => Ok(max),
        _ => Err(ConfigError::InvalidValue {
            key: key.into(),
            value: raw.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.timezone, "UTC");
        assert_eq!(settings.retention, RetentionPolicy::Anonymize);
        assert!(settings.database_path.ends_with(DATABASE_FILE));
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("OPENCARE_DB_PATH", "/srv/opencare/data.db"),
            ("OPENCARE_TIMEZONE", "Africa/Nairobi"),
            ("OPENCARE_RETENTION", "Remove"),
            ("OPENCARE_MAX_CONNECTIONS_REPORTING", "4"),
        ]))
        .unwrap();
        assert_eq!(settings.database_path, PathBuf::from("/srv/opencare/data.db"));
        assert_eq!(settings.timezone, "Africa/Nairobi");
        assert_eq!(settings.retention, RetentionPolicy::Remove);
        assert_eq!(settings.max_connections(DbRole::Reporting), 4);
        assert_eq!(settings.max_connections(DbRole::Application), 50);
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = Settings::from_lookup(lookup(&[("OPENCARE_MAX_CONNECTIONS_ADMIN", "0")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "OPENCARE_MAX_CONNECTIONS_ADMIN".into(),
                value: "0".into(),
            }
        );
        assert!(Settings::from_lookup(lookup(&[("OPENCARE_RETENTION", "purge")])).is_err());
    }

    #[test]
    fn data_dir_is_named_after_app() {
        assert!(default_data_dir().ends_with("opencare"));
        assert!(default_database_path().starts_with(default_data_dir()));
    }

    #[test]
    fn app_name_is_opencare() {
        assert_eq!(APP_NAME, "OpenCare");
    }
}
