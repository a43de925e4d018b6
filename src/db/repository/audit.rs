use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::integrity::{audited, is_live};
use crate::db::{format_timestamp, now, parse_optional_uuid, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::{Actor, AuditAction, AuditContext, AuditEntry, ChangeSet, EntityKind};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const SELECT_ENTRY: &str = "SELECT seq, id, actor_id, action, target_type, target_id, changes,
    timestamp, ip_address, user_agent, prev_hash, entry_hash FROM audit_trail";

/// Append one entry to the trail. The only write path into `audit_trail`.
///
/// Callers run it inside the same savepoint as the change it describes.
pub fn append_audit_entry(
    conn: &Connection,
    ctx: &AuditContext,
    action: AuditAction,
    target_type: EntityKind,
    target_id: &Uuid,
    changes: &ChangeSet,
) -> Result<AuditEntry, DatabaseError> {
    if let Actor::User(user_id) = ctx.actor {
        let known = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![user_id.to_string()], |_| Ok(()))
            .optional()?;
        if known.is_none() {
            return Err(DatabaseError::Integrity {
                entity_type: "audit_trail".into(),
                column: "actor_id".into(),
                referenced_type: EntityKind::User.as_str().into(),
                referenced_id: user_id.to_string(),
            });
        }
    }

    let timestamp = next_timestamp(conn, target_type, target_id)?;
    let prev_hash: String = conn
        .query_row(
            "SELECT entry_hash FROM audit_trail ORDER BY seq DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| GENESIS_HASH.to_string());

    let mut entry = AuditEntry {
        seq: 0,
        id: Uuid::new_v4(),
        actor: ctx.actor,
        action,
        target_type,
        target_id: *target_id,
        changes: changes.clone(),
        timestamp,
        ip_address: ctx.request.ip_address.clone(),
        user_agent: ctx.request.user_agent.clone(),
        prev_hash,
        entry_hash: String::new(),
    };
    let changes_json = serde_json::to_string(&entry.changes)?;
    entry.entry_hash = entry_hash(&entry, &changes_json);

    conn.execute(
        "INSERT INTO audit_trail (id, actor_id, action, target_type, target_id, changes,
         timestamp, ip_address, user_agent, prev_hash, entry_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id.to_string(),
            entry.actor.user_id().map(|id| id.to_string()),
            entry.action.as_str(),
            entry.target_type.as_str(),
            entry.target_id.to_string(),
            changes_json,
            format_timestamp(&entry.timestamp),
            entry.ip_address,
            entry.user_agent,
            entry.prev_hash,
            entry.entry_hash,
        ],
    )?;
    entry.seq = conn.last_insert_rowid();

    tracing::debug!(
        seq = entry.seq,
        action = %entry.action,
        target = %entry.target_type,
        "audit entry appended"
    );
    Ok(entry)
}

/// Record that `target` was read.
pub fn record_view(
    conn: &Connection,
    ctx: &AuditContext,
    target_type: EntityKind,
    target_id: &Uuid,
    changes: &ChangeSet,
) -> Result<AuditEntry, DatabaseError> {
    audited(conn, ctx, |conn| {
        if !is_live(conn, target_type, target_id)? {
            return Err(DatabaseError::not_found(target_type.as_str(), target_id));
        }
        append_audit_entry(conn, ctx, AuditAction::View, target_type, target_id, changes)
    })
}

/// Never earlier than the target's previous entry, and strictly after it.
fn next_timestamp(
    conn: &Connection,
    target_type: EntityKind,
    target_id: &Uuid,
) -> Result<DateTime<Utc>, DatabaseError> {
    let current = now();
    let last: Option<String> = conn.query_row(
        "SELECT MAX(timestamp) FROM audit_trail WHERE target_type = ?1 AND target_id = ?2",
        params![target_type.as_str(), target_id.to_string()],
        |row| row.get(0),
    )?;
    match last {
        Some(raw) => {
            let last = parse_timestamp(&raw)?;
            if current > last {
                Ok(current)
            } else {
                Ok(last + Duration::microseconds(1))
            }
        }
        None => Ok(current),
    }
}

fn entry_hash(entry: &AuditEntry, changes_json: &str) -> String {
    let actor = entry.actor.to_string();
    let id = entry.id.to_string();
    let target_id = entry.target_id.to_string();
    let timestamp = format_timestamp(&entry.timestamp);
    let fields: [&str; 10] = [
        &entry.prev_hash,
        &id,
        &actor,
        entry.action.as_str(),
        entry.target_type.as_str(),
        &target_id,
        changes_json,
        &timestamp,
        entry.ip_address.as_deref().unwrap_or(""),
        entry.user_agent.as_deref().unwrap_or(""),
    ];

    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

struct AuditRow {
    seq: i64,
    id: String,
    actor_id: Option<String>,
    action: String,
    target_type: String,
    target_id: String,
    changes: String,
    timestamp: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    prev_hash: String,
    entry_hash: String,
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        actor_id: row.get(2)?,
        action: row.get(3)?,
        target_type: row.get(4)?,
        target_id: row.get(5)?,
        changes: row.get(6)?,
        timestamp: row.get(7)?,
        ip_address: row.get(8)?,
        user_agent: row.get(9)?,
        prev_hash: row.get(10)?,
        entry_hash: row.get(11)?,
    })
}

/// Convert a stored row. The raw `changes` text is kept alongside for hashing.
fn entry_from_row(row: AuditRow) -> Result<(AuditEntry, String), DatabaseError> {
    let actor = match parse_optional_uuid(row.actor_id)? {
        Some(id) => Actor::User(id),
        None => Actor::System,
    };
    let value: serde_json::Value = serde_json::from_str(&row.changes)?;
    let entry = AuditEntry {
        seq: row.seq,
        id: parse_uuid(&row.id)?,
        actor,
        action: AuditAction::from_str(&row.action)?,
        target_type: EntityKind::from_str(&row.target_type)?,
        target_id: parse_uuid(&row.target_id)?,
        changes: ChangeSet::from_json(&value),
        timestamp: parse_timestamp(&row.timestamp)?,
        ip_address: row.ip_address,
        user_agent: row.user_agent,
        prev_hash: row.prev_hash,
        entry_hash: row.entry_hash,
    };
    Ok((entry, row.changes))
}

fn query_entries(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<AuditEntry>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("{SELECT_ENTRY} {clause} ORDER BY seq"))?;
    let rows = stmt
        .query_map(params, read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|row| entry_from_row(row).map(|(entry, _)| entry))
        .collect()
}

/// Entries stamped within `[from, to]`.
pub fn entries_between(
    conn: &Connection,
    from: &DateTime<Utc>,
    to: &DateTime<Utc>,
) -> Result<Vec<AuditEntry>, DatabaseError> {
    query_entries(
        conn,
        "WHERE timestamp >= ?1 AND timestamp <= ?2",
        params![format_timestamp(from), format_timestamp(to)],
    )
}

pub fn entries_by_actor(conn: &Connection, actor: &Actor) -> Result<Vec<AuditEntry>, DatabaseError> {
    query_entries(
        conn,
        "WHERE actor_id IS ?1",
        params![actor.user_id().map(|id| id.to_string())],
    )
}

pub fn entries_for_target(
    conn: &Connection,
    target_type: EntityKind,
    target_id: &Uuid,
) -> Result<Vec<AuditEntry>, DatabaseError> {
    query_entries(
        conn,
        "WHERE target_type = ?1 AND target_id = ?2",
        params![target_type.as_str(), target_id.to_string()],
    )
}

pub fn count_audit_entries(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row("SELECT COUNT(*) FROM audit_trail", [], |row| row.get(0))?;
    Ok(count)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub entries_checked: i64,
    /// Sequence number of the first entry whose link or hash does not match.
    pub first_broken_seq: Option<i64>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.first_broken_seq.is_none()
    }
}

/// Recompute the hash chain from the first entry.
pub fn verify_chain(conn: &Connection) -> Result<ChainVerification, DatabaseError> {
    let mut stmt = conn.prepare(&format!("{SELECT_ENTRY} ORDER BY seq"))?;
    let mut rows = stmt.query([])?;

    let mut expected_prev = GENESIS_HASH.to_string();
    let mut checked = 0;
    while let Some(row) = rows.next()? {
        let (entry, changes_json) = entry_from_row(read_row(row)?)?;
        checked += 1;
        if entry.prev_hash != expected_prev || entry_hash(&entry, &changes_json) != entry.entry_hash {
            tracing::warn!(seq = entry.seq, "audit chain broken");
            return Ok(ChainVerification {
                entries_checked: checked,
                first_broken_seq: Some(entry.seq),
            });
        }
        expected_prev = entry.entry_hash;
    }
    Ok(ChainVerification {
        entries_checked: checked,
        first_broken_seq: None,
    })
}
