//! Role-scoped connections with a per-role cap on concurrently open handles.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use super::sqlite::{open_database, open_database_read_only, table_exists};
use super::DatabaseError;

/// Storage-level access role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbRole {
    Admin,
    Application,
    Reporting,
}

impl DbRole {
    pub const ALL: [DbRole; 3] = [DbRole::Admin, DbRole::Application, DbRole::Reporting];

    pub fn as_str(&self) -> &'static str {
        match self {
            DbRole::Admin => "admin",
            DbRole::Application => "application",
            DbRole::Reporting => "reporting",
        }
    }

    /// Cap used when provisioning has not recorded one.
    pub fn default_max_connections(&self) -> u32 {
        match self {
            DbRole::Admin => 5,
            DbRole::Application => 50,
            DbRole::Reporting => 10,
        }
    }
}

impl std::fmt::Display for DbRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open handles per database file and role.
static OPEN_CONNECTIONS: LazyLock<Mutex<HashMap<(PathBuf, DbRole), u32>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn slot_key(path: &Path, role: DbRole) -> (PathBuf, DbRole) {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    (path, role)
}

/// A connection that holds one of its role's slots until dropped.
pub struct RoleConnection {
    conn: Connection,
    role: DbRole,
    key: (PathBuf, DbRole),
}

impl RoleConnection {
    pub fn role(&self) -> DbRole {
        self.role
    }
}

impl Deref for RoleConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for RoleConnection {
    fn drop(&mut self) {
        let mut open = OPEN_CONNECTIONS.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = open.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                open.remove(&self.key);
            }
        }
    }
}

/// Provisioned cap for `role`, falling back to the role default.
pub fn max_connections(conn: &Connection, role: DbRole) -> Result<u32, DatabaseError> {
    if !table_exists(conn, "role_connection_limits")? {
        return Ok(role.default_max_connections());
    }
    let stored = conn
        .query_row(
            "SELECT max_connections FROM role_connection_limits WHERE role = ?1",
            params![role.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(stored
        .and_then(|max| u32::try_from(max).ok())
        .unwrap_or_else(|| role.default_max_connections()))
}

/// Open a connection for `role`.
///
/// Reporting connections are read-only and `query_only`. Fails with
/// [`DatabaseError::ConnectionLimit`] once the role's cap is reached.
pub fn open_role_connection(path: &Path, role: DbRole) -> Result<RoleConnection, DatabaseError> {
    let conn = match role {
        DbRole::Reporting => open_database_read_only(path)?,
        DbRole::Admin | DbRole::Application => open_database(path)?,
    };
    let max = max_connections(&conn, role)?;
    let key = slot_key(path, role);

    {
        let mut open = OPEN_CONNECTIONS.lock().unwrap_or_else(|e| e.into_inner());
        let count = open.entry(key.clone()).or_insert(0);
        if *count >= max {
            tracing::warn!(role = %role, max, "connection limit reached");
            return Err(DatabaseError::ConnectionLimit {
                role: role.to_string(),
                max,
            });
        }
        *count += 1;
    }

    tracing::debug!(role = %role, "role connection opened");
    Ok(RoleConnection { conn, role, key })
}

/// Handles currently held for `role` on the database at `path`.
pub fn open_connection_count(path: &Path, role: DbRole) -> u32 {
    let open = OPEN_CONNECTIONS.lock().unwrap_or_else(|e| e.into_inner());
    open.get(&slot_key(path, role)).copied().unwrap_or(0)
}
