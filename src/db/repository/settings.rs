use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{format_timestamp, now, parse_timestamp, table_exists, DatabaseError};
use crate::models::SystemSetting;

/// Read one setting. `None` when unset or before the settings table exists.
pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>, DatabaseError> {
    if !table_exists(conn, "system_configuration")? {
        return Ok(None);
    }
    let value = conn
        .query_row(
            "SELECT value FROM system_configuration WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or replace a setting. An empty description keeps the stored one.
pub fn set_setting(
    conn: &Connection,
    key: &str,
    value: &str,
    description: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO system_configuration (key, value, description, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            description = CASE WHEN excluded.description = '' THEN description
                               ELSE excluded.description END,
            updated_at = CASE WHEN value = excluded.value THEN updated_at
                              ELSE excluded.updated_at END",
        params![key, value, description, format_timestamp(&now())],
    )?;
    Ok(())
}

pub fn list_settings(conn: &Connection, prefix: &str) -> Result<Vec<SystemSetting>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT key, value, description, is_public, updated_at FROM system_configuration
         WHERE substr(key, 1, length(?1)) = ?1
         ORDER BY key",
    )?;
    let rows = stmt
        .query_map(params![prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(key, value, description, is_public, updated_at)| {
            Ok(SystemSetting {
                key,
                value,
                description,
                is_public,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn unset_key_reads_none() {
        let conn = open_memory_database().unwrap();
        assert_eq!(get_setting(&conn, "timezone").unwrap(), None);
    }

    #[test]
    fn set_is_an_upsert() {
        let conn = open_memory_database().unwrap();
        set_setting(&conn, "timezone", "UTC", "Default timezone").unwrap();
        set_setting(&conn, "timezone", "Africa/Nairobi", "").unwrap();

        let settings = list_settings(&conn, "time").unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].value, "Africa/Nairobi");
        assert_eq!(settings[0].description, "Default timezone");
    }

    #[test]
    fn prefix_listing_is_literal() {
        let conn = open_memory_database().unwrap();
        set_setting(&conn, "pragma.cache_size", "-16000", "").unwrap();
        set_setting(&conn, "pragmaXother", "1", "").unwrap();
        let keys: Vec<String> = list_settings(&conn, "pragma.")
            .unwrap()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["pragma.cache_size"]);
    }
}
