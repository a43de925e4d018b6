use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{
    append_audit_entry, from_json, like_pattern, opt_id, require_text, to_json, validate_phone,
};
use crate::db::integrity::{audited, ensure_references, ensure_updated};
use crate::db::{format_timestamp, now, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::*;

pub(crate) const FACILITY_COLUMNS: &str = "id, name, facility_type, location_id, address, phone_number,
    email, contact_person_name, contact_person_phone, is_24_hours, services_offered,
    created_at, updated_at, version";

fn validate(
    name: &str,
    phone_number: &str,
    contact_person_phone: &str,
) -> Result<(), DatabaseError> {
    require_text("health_facility", "name", name)?;
    validate_phone("health_facility", "phone_number", phone_number)?;
    validate_phone("health_facility", "contact_person_phone", contact_person_phone)
}

pub fn create_facility(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewHealthFacility,
) -> Result<HealthFacility, DatabaseError> {
    validate(&new.name, &new.phone_number, &new.contact_person_phone)?;

    let facility = audited(conn, ctx, |conn| {
        ensure_references(conn, EntityKind::HealthFacility, &[("location_id", Some(new.location_id))])?;

        let ts = now();
        let facility = HealthFacility {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            facility_type: new.facility_type,
            location_id: new.location_id,
            address: new.address.clone(),
            phone_number: new.phone_number.clone(),
            email: new.email.clone(),
            contact_person_name: new.contact_person_name.clone(),
            contact_person_phone: new.contact_person_phone.clone(),
            is_24_hours: new.is_24_hours,
            services_offered: new.services_offered.clone(),
            created_at: ts,
            updated_at: ts,
            version: 1,
        };
        conn.execute(
            "INSERT INTO health_facilities (id, name, facility_type, location_id, address,
             phone_number, email, contact_person_name, contact_person_phone, is_24_hours,
             services_offered, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, 1)",
            params![
                facility.id.to_string(),
                facility.name,
                facility.facility_type.as_str(),
                facility.location_id.to_string(),
                facility.address,
                facility.phone_number,
                facility.email,
                facility.contact_person_name,
                facility.contact_person_phone,
                facility.is_24_hours,
                to_json(&facility.services_offered)?,
                format_timestamp(&ts),
            ],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::HealthFacility,
            &facility.id,
            &ChangeSet::fields([
                "name",
                "facility_type",
                "location_id",
                "address",
                "phone_number",
                "email",
                "contact_person_name",
                "contact_person_phone",
                "is_24_hours",
                "services_offered",
            ]),
        )?;
        Ok(facility)
    })?;

    tracing::info!(id = %facility.id, kind = %facility.facility_type, "facility created");
    Ok(facility)
}

pub fn get_facility(conn: &Connection, id: &Uuid) -> Result<Option<HealthFacility>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {FACILITY_COLUMNS} FROM health_facilities WHERE id = ?1 AND deleted_at IS NULL"
            ),
            params![id.to_string()],
            read_facility_row,
        )
        .optional()?;
    row.map(facility_from_row).transpose()
}

pub fn update_facility(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    update: &HealthFacilityUpdate,
) -> Result<HealthFacility, DatabaseError> {
    validate(&update.name, &update.phone_number, &update.contact_person_phone)?;

    audited(conn, ctx, |conn| {
        let before = get_facility(conn, id)?.ok_or_else(|| DatabaseError::not_found("health_facility", id))?;
        let changed = conn.execute(
            "UPDATE health_facilities SET name = ?3, address = ?4, phone_number = ?5, email = ?6,
             contact_person_name = ?7, contact_person_phone = ?8, is_24_hours = ?9,
             services_offered = ?10, updated_at = ?11, version = version + 1
             WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
            params![
                id.to_string(),
                expected_version,
                update.name,
                update.address,
                update.phone_number,
                update.email,
                update.contact_person_name,
                update.contact_person_phone,
                update.is_24_hours,
                to_json(&update.services_offered)?,
                format_timestamp(&now()),
            ],
        )?;
        ensure_updated(conn, EntityKind::HealthFacility, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::HealthFacility,
            id,
            &ChangeSet::fields(changed_fields(&before, update)),
        )?;
        get_facility(conn, id)?.ok_or_else(|| DatabaseError::not_found("health_facility", id))
    })
}

fn changed_fields(before: &HealthFacility, after: &HealthFacilityUpdate) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if before.name != after.name {
        fields.push("name");
    }
    if before.address != after.address {
        fields.push("address");
    }
    if before.phone_number != after.phone_number {
        fields.push("phone_number");
    }
    if before.email != after.email {
        fields.push("email");
    }
    if before.contact_person_name != after.contact_person_name {
        fields.push("contact_person_name");
    }
    if before.contact_person_phone != after.contact_person_phone {
        fields.push("contact_person_phone");
    }
    if before.is_24_hours != after.is_24_hours {
        fields.push("is_24_hours");
    }
    if before.services_offered != after.services_offered {
        fields.push("services_offered");
    }
    fields
}

/// Keyset-paged facility listing.
pub fn list_facilities(
    conn: &Connection,
    filter: &FacilityFilter,
    page: &Page,
) -> Result<Paged<HealthFacility>, DatabaseError> {
    let limit = page.effective_limit();
    let mut stmt = conn.prepare(&format!(
        "SELECT {FACILITY_COLUMNS} FROM health_facilities
         WHERE deleted_at IS NULL
           AND (?1 IS NULL OR facility_type = ?1)
           AND (?2 IS NULL OR location_id = ?2)
           AND (?3 IS NULL OR is_24_hours = ?3)
           AND (?4 IS NULL OR LOWER(name) LIKE ?4)
           AND (?5 IS NULL OR created_at > ?5 OR (created_at = ?5 AND id > ?6))
         ORDER BY created_at, id
         LIMIT ?7"
    ))?;
    let rows = stmt
        .query_map(
            params![
                filter.facility_type.map(|t| t.as_str()),
                opt_id(filter.location_id),
                filter.is_24_hours,
                like_pattern(filter.name_contains.as_deref()),
                page.after.map(|c| format_timestamp(&c.created_at)),
                page.after.map(|c| c.id.to_string()),
                limit + 1,
            ],
            read_facility_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    let facilities = rows
        .into_iter()
        .map(facility_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Paged::from_overfetch(facilities, limit))
}

pub(crate) struct FacilityRow {
    id: String,
    name: String,
    facility_type: String,
    location_id: String,
    address: String,
    phone_number: String,
    email: Option<String>,
    contact_person_name: String,
    contact_person_phone: String,
    is_24_hours: bool,
    services_offered: String,
    created_at: String,
    updated_at: String,
    version: i64,
}

pub(crate) fn read_facility_row(row: &rusqlite::Row) -> rusqlite::Result<FacilityRow> {
    Ok(FacilityRow {
        id: row.get(0)?,
        name: row.get(1)?,
        facility_type: row.get(2)?,
        location_id: row.get(3)?,
        address: row.get(4)?,
        phone_number: row.get(5)?,
        email: row.get(6)?,
        contact_person_name: row.get(7)?,
        contact_person_phone: row.get(8)?,
        is_24_hours: row.get(9)?,
        services_offered: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        version: row.get(13)?,
    })
}

pub(crate) fn facility_from_row(row: FacilityRow) -> Result<HealthFacility, DatabaseError> {
    Ok(HealthFacility {
        id: parse_uuid(&row.id)?,
        name: row.name,
        facility_type: FacilityType::from_str(&row.facility_type)?,
        location_id: parse_uuid(&row.location_id)?,
        address: row.address,
        phone_number: row.phone_number,
        email: row.email,
        contact_person_name: row.contact_person_name,
        contact_person_phone: row.contact_person_phone,
        is_24_hours: row.is_24_hours,
        services_offered: from_json(&row.services_offered)?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        version: row.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::*;
    use crate::db::repository::entries_for_target;

    #[test]
    fn create_and_read_back() {
        let conn = db();
        let (_, _, county) = location_tree(&conn);
        let created = facility(&conn, county.id);
        let stored = get_facility(&conn, &created.id).unwrap().unwrap();
        assert_eq!(stored, created);
        assert_eq!(stored.services_offered, vec!["outpatient".to_string()]);
    }

    #[test]
    fn bad_phone_number_is_rejected() {
        let conn = db();
        let (_, _, county) = location_tree(&conn);
        let mut new = new_facility(county.id, "Pumwani Maternity");
        new.phone_number = "call us".into();
        let result = create_facility(&conn, &AuditContext::system(), &new);
        assert!(matches!(result, Err(DatabaseError::ConstraintViolation(_))));
    }

    #[test]
    fn update_bumps_version_and_audits_changed_fields() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, _, county) = location_tree(&conn);
        let created = facility(&conn, county.id);

        let mut update = HealthFacilityUpdate::from(&created);
        update.is_24_hours = false;
        update.services_offered.push("maternity".into());
        let updated = update_facility(&conn, &ctx, &created.id, created.version, &update).unwrap();
        assert_eq!(updated.version, 2);
        assert!(!updated.is_24_hours);

        let entries = entries_for_target(&conn, EntityKind::HealthFacility, &created.id).unwrap();
        assert_eq!(entries.len(), 2);
        let fields: Vec<&str> = entries[1].changes.fields.iter().map(String::as_str).collect();
        assert_eq!(fields, vec!["is_24_hours", "services_offered"]);
    }

    #[test]
    fn concurrent_update_loses() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, _, county) = location_tree(&conn);
        let created = facility(&conn, county.id);
        let update = HealthFacilityUpdate::from(&created);

        update_facility(&conn, &ctx, &created.id, 1, &update).unwrap();
        let second = update_facility(&conn, &ctx, &created.id, 1, &update);
        assert!(matches!(second, Err(DatabaseError::ConcurrentModification { .. })));
        assert_eq!(entries_for_target(&conn, EntityKind::HealthFacility, &created.id).unwrap().len(), 2);
    }

    #[test]
    fn listing_pages_through_all_rows() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, _, county) = location_tree(&conn);
        let mut created = Vec::new();
        for i in 0..5 {
            created.push(create_facility(&conn, &ctx, &new_facility(county.id, &format!("Clinic {i}"))).unwrap().id);
        }

        let filter = FacilityFilter::default();
        let first = list_facilities(&conn, &filter, &Page::first(2)).unwrap();
        let second = list_facilities(&conn, &filter, &Page::after(2, first.next.unwrap())).unwrap();
        let third = list_facilities(&conn, &filter, &Page::after(2, second.next.unwrap())).unwrap();
        assert!(third.next.is_none());

        let seen: Vec<Uuid> = [first, second, third]
            .into_iter()
            .flat_map(|p| p.items)
            .map(|f| f.id)
            .collect();
        assert_eq!(seen, created);
    }

    #[test]
    fn listing_filters_by_name_and_type() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, _, county) = location_tree(&conn);
        let mut lab = new_facility(county.id, "Lancet Laboratory");
        lab.facility_type = FacilityType::Laboratory;
        create_facility(&conn, &ctx, &lab).unwrap();
        facility(&conn, county.id);

        let filter = FacilityFilter {
            facility_type: Some(FacilityType::Laboratory),
            ..Default::default()
        };
        let labs = list_facilities(&conn, &filter, &Page::default()).unwrap();
        assert_eq!(labs.items.len(), 1);

        let filter = FacilityFilter {
            name_contains: Some("mbagathi".into()),
            ..Default::default()
        };
        let found = list_facilities(&conn, &filter, &Page::default()).unwrap();
        assert_eq!(found.items[0].name, "Mbagathi Hospital");
    }
}
