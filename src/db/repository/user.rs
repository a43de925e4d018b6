use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{append_audit_entry, map_unique, require_text, validate_optional_phone};
use crate::db::integrity::{audited, ensure_updated};
use crate::db::{format_timestamp, now, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::*;

const USER_COLUMNS: &str = "id, username, email, first_name, last_name, role, phone_number,
    is_active, created_at, updated_at, version";

fn validate_email(email: &str) -> Result<(), DatabaseError> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(DatabaseError::ConstraintViolation(format!(
            "user.email '{email}' is not an address"
        ))),
    }
}

pub fn create_user(conn: &Connection, ctx: &AuditContext, new: &NewUser) -> Result<User, DatabaseError> {
    require_text("user", "username", &new.username)?;
    validate_email(&new.email)?;
    validate_optional_phone("user", "phone_number", new.phone_number.as_deref())?;

    let user = audited(conn, ctx, |conn| {
        let ts = now();
        let user = User {
            id: Uuid::new_v4(),
            username: new.username.clone(),
            email: new.email.clone(),
            first_name: new.first_name.clone(),
            last_name: new.last_name.clone(),
            role: new.role,
            phone_number: new.phone_number.clone(),
            is_active: true,
            created_at: ts,
            updated_at: ts,
            version: 1,
        };
        conn.execute(
            "INSERT INTO users (id, username, email, first_name, last_name, role, phone_number,
             is_active, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8, 1)",
            params![
                user.id.to_string(),
                user.username,
                user.email,
                user.first_name,
                user.last_name,
                user.role.as_str(),
                user.phone_number,
                format_timestamp(&ts),
            ],
        )
        .map_err(|e| map_unique(e, "user", "username", &new.username))?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::User,
            &user.id,
            &ChangeSet::fields(["username", "email", "first_name", "last_name", "role", "phone_number"]),
        )?;
        Ok(user)
    })?;

    tracing::info!(id = %user.id, role = %user.role, "user created");
    Ok(user)
}

pub fn get_user(conn: &Connection, id: &Uuid) -> Result<Option<User>, DatabaseError> {
    query_one(conn, "id = ?1", &id.to_string())
}

pub fn get_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>, DatabaseError> {
    query_one(conn, "username = ?1", username)
}

fn query_one(conn: &Connection, predicate: &str, value: &str) -> Result<Option<User>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE {predicate} AND deleted_at IS NULL"),
            params![value],
            read_user_row,
        )
        .optional()?;
    row.map(user_from_row).transpose()
}

pub fn update_user(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    update: &UserUpdate,
) -> Result<User, DatabaseError> {
    validate_email(&update.email)?;
    validate_optional_phone("user", "phone_number", update.phone_number.as_deref())?;

    audited(conn, ctx, |conn| {
        let changed = conn.execute(
            "UPDATE users SET email = ?3, first_name = ?4, last_name = ?5, role = ?6,
             phone_number = ?7, is_active = ?8, updated_at = ?9, version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
            params![
                id.to_string(),
                expected_version,
                update.email,
                update.first_name,
                update.last_name,
                update.role.as_str(),
                update.phone_number,
                update.is_active,
                format_timestamp(&now()),
            ],
        )?;
        ensure_updated(conn, EntityKind::User, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::User,
            id,
            &ChangeSet::fields(["email", "first_name", "last_name", "role", "phone_number", "is_active"]),
        )?;
        get_user(conn, id)?.ok_or_else(|| DatabaseError::not_found("user", id))
    })
}

/// Live users, optionally restricted to one role, in creation order.
pub fn list_users(
    conn: &Connection,
    role: Option<UserRole>,
    page: &Page,
) -> Result<Paged<User>, DatabaseError> {
    let limit = page.effective_limit();
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users
         WHERE deleted_at IS NULL
           AND (?1 IS NULL OR role = ?1)
           AND (?2 IS NULL OR created_at > ?2 OR (created_at = ?2 AND id > ?3))
         ORDER BY created_at, id
         LIMIT ?4"
    ))?;
    let rows = stmt
        .query_map(
            params![
                role.map(|r| r.as_str()),
                page.after.map(|c| format_timestamp(&c.created_at)),
                page.after.map(|c| c.id.to_string()),
                limit + 1,
            ],
            read_user_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let users = rows.into_iter().map(user_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::from_overfetch(users, limit))
}

pub fn count_active_admins(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'admin' AND is_active = 1 AND deleted_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

struct UserRow {
    id: String,
    username: String,
    email: String,
    first_name: String,
    last_name: String,
    role: String,
    phone_number: Option<String>,
    is_active: bool,
    created_at: String,
    updated_at: String,
    version: i64,
}

fn read_user_row(row: &rusqlite::Row) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        role: row.get(5)?,
        phone_number: row.get(6)?,
        is_active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        version: row.get(10)?,
    })
}

fn user_from_row(row: UserRow) -> Result<User, DatabaseError> {
    Ok(User {
        id: parse_uuid(&row.id)?,
        username: row.username,
        email: row.email,
        first_name: row.first_name,
        last_name: row.last_name,
        role: UserRole::from_str(&row.role)?,
        phone_number: row.phone_number,
        is_active: row.is_active,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        version: row.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::delete_entity;
    use crate::db::repository::fixtures::*;

    #[test]
    fn username_is_unique() {
        let conn = db();
        user_with_role(&conn, "dr.otieno", UserRole::Doctor);
        let again = create_user(
            &conn,
            &AuditContext::system(),
            &NewUser {
                username: "dr.otieno".into(),
                email: "other@opencare.test".into(),
                first_name: "Other".into(),
                last_name: "Otieno".into(),
                role: UserRole::Nurse,
                phone_number: None,
            },
        );
        assert!(matches!(
            again,
            Err(DatabaseError::Duplicate { ref field, .. }) if field == "username"
        ));
    }

    #[test]
    fn invalid_email_is_rejected() {
        let conn = db();
        let result = create_user(
            &conn,
            &AuditContext::system(),
            &NewUser {
                username: "nomail".into(),
                email: "nomail".into(),
                first_name: "No".into(),
                last_name: "Mail".into(),
                role: UserRole::Nurse,
                phone_number: None,
            },
        );
        assert!(matches!(result, Err(DatabaseError::ConstraintViolation(_))));
    }

    #[test]
    fn lookup_by_username_hides_removed_users() {
        let conn = db();
        let nurse = user_with_role(&conn, "n.njeri", UserRole::Nurse);
        assert_eq!(get_user_by_username(&conn, "n.njeri").unwrap().unwrap().id, nurse.id);

        delete_entity(&conn, &AuditContext::system(), EntityKind::User, &nurse.id).unwrap();
        assert!(get_user_by_username(&conn, "n.njeri").unwrap().is_none());
    }

    #[test]
    fn removed_user_can_no_longer_act() {
        let conn = db();
        let nurse = user_with_role(&conn, "n.chebet", UserRole::Nurse);
        delete_entity(&conn, &AuditContext::system(), EntityKind::User, &nurse.id).unwrap();

        let result = user_with_role_as(&conn, &AuditContext::user(nurse.id));
        assert!(matches!(result, Err(DatabaseError::Integrity { .. })));
    }

    fn user_with_role_as(conn: &Connection, ctx: &AuditContext) -> Result<User, DatabaseError> {
        create_user(
            conn,
            ctx,
            &NewUser {
                username: "created.by.ghost".into(),
                email: "ghost@opencare.test".into(),
                first_name: "G".into(),
                last_name: "Host".into(),
                role: UserRole::Nurse,
                phone_number: None,
            },
        )
    }

    #[test]
    fn deactivation_and_admin_count() {
        let conn = db();
        let ctx = AuditContext::system();
        let admin = admin(&conn);
        assert_eq!(count_active_admins(&conn).unwrap(), 1);

        let mut update = UserUpdate {
            email: admin.email.clone(),
            first_name: admin.first_name.clone(),
            last_name: admin.last_name.clone(),
            role: admin.role,
            phone_number: admin.phone_number.clone(),
            is_active: false,
        };
        let updated = update_user(&conn, &ctx, &admin.id, admin.version, &update).unwrap();
        assert!(!updated.is_active);
        assert_eq!(count_active_admins(&conn).unwrap(), 0);

        update.is_active = true;
        let stale = update_user(&conn, &ctx, &admin.id, admin.version, &update);
        assert!(matches!(stale, Err(DatabaseError::ConcurrentModification { .. })));
    }

    #[test]
    fn list_by_role() {
        let conn = db();
        admin(&conn);
        user_with_role(&conn, "dr.a", UserRole::Doctor);
        user_with_role(&conn, "dr.b", UserRole::Doctor);

        let doctors = list_users(&conn, Some(UserRole::Doctor), &Page::default()).unwrap();
        let names: Vec<&str> = doctors.items.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["dr.a", "dr.b"]);
        assert!(doctors.next.is_none());
    }
}
