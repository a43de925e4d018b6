use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::facility::{facility_from_row, read_facility_row, FACILITY_COLUMNS};
use super::patient::{patient_from_row, read_patient_row, PATIENT_COLUMNS};
use super::{append_audit_entry, map_unique, opt_id, require_text};
use crate::db::integrity::{audited, ensure_references, ensure_updated};
use crate::db::{format_timestamp, now, parse_optional_uuid, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::*;

const LOCATION_COLUMNS: &str =
    "id, name, location_type, parent_id, latitude, longitude, created_at, updated_at, version";

fn validate_coordinates(latitude: Option<f64>, longitude: Option<f64>) -> Result<(), DatabaseError> {
    if let Some(lat) = latitude {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(DatabaseError::ConstraintViolation(format!(
                "location.latitude {lat} outside [-90, 90]"
            )));
        }
    }
    if let Some(lon) = longitude {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(DatabaseError::ConstraintViolation(format!(
                "location.longitude {lon} outside [-180, 180]"
            )));
        }
    }
    Ok(())
}

pub fn create_location(
    conn: &Connection,
    ctx: &AuditContext,
    new: &NewLocation,
) -> Result<Location, DatabaseError> {
    require_text("location", "name", &new.name)?;
    validate_coordinates(new.latitude, new.longitude)?;

    let location = audited(conn, ctx, |conn| {
        ensure_references(conn, EntityKind::Location, &[("parent_id", new.parent_id)])?;

        let ts = now();
        let location = Location {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            location_type: new.location_type,
            parent_id: new.parent_id,
            latitude: new.latitude,
            longitude: new.longitude,
            created_at: ts,
            updated_at: ts,
            version: 1,
        };
        conn.execute(
            "INSERT INTO locations (id, name, location_type, parent_id, latitude, longitude,
             created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1)",
            params![
                location.id.to_string(),
                location.name,
                location.location_type.as_str(),
                opt_id(location.parent_id),
                location.latitude,
                location.longitude,
                format_timestamp(&ts),
            ],
        )
        .map_err(|e| map_unique(e, "location", "name", &new.name))?;

        // Self row plus one row per ancestor of the parent.
        conn.execute(
            "INSERT INTO location_closure (ancestor_id, descendant_id, depth)
             SELECT ancestor_id, ?1, depth + 1 FROM location_closure WHERE descendant_id = ?2
             UNION ALL SELECT ?1, ?1, 0",
            params![location.id.to_string(), opt_id(location.parent_id)],
        )?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Create,
            EntityKind::Location,
            &location.id,
            &ChangeSet::fields(["name", "location_type", "parent_id", "latitude", "longitude"]),
        )?;
        Ok(location)
    })?;

    tracing::info!(id = %location.id, kind = %location.location_type, "location created");
    Ok(location)
}

pub fn get_location(conn: &Connection, id: &Uuid) -> Result<Option<Location>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = ?1 AND deleted_at IS NULL"),
            params![id.to_string()],
            read_location_row,
        )
        .optional()?;
    row.map(location_from_row).transpose()
}

fn require_location(conn: &Connection, id: &Uuid) -> Result<Location, DatabaseError> {
    get_location(conn, id)?.ok_or_else(|| DatabaseError::not_found("location", id))
}

/// Direct children, ordered by `(created_at, id)`.
pub fn list_children(conn: &Connection, id: &Uuid) -> Result<Vec<Location>, DatabaseError> {
    query_locations(
        conn,
        "WHERE parent_id = ?1 AND deleted_at IS NULL ORDER BY created_at, id",
        params![id.to_string()],
    )
}

pub fn list_root_locations(conn: &Connection) -> Result<Vec<Location>, DatabaseError> {
    query_locations(
        conn,
        "WHERE parent_id IS NULL AND deleted_at IS NULL ORDER BY created_at, id",
        [],
    )
}

pub fn update_location(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    expected_version: i64,
    update: &LocationUpdate,
) -> Result<Location, DatabaseError> {
    require_text("location", "name", &update.name)?;
    validate_coordinates(update.latitude, update.longitude)?;

    audited(conn, ctx, |conn| {
        let changed = conn
            .execute(
                "UPDATE locations SET name = ?3, latitude = ?4, longitude = ?5,
                 updated_at = ?6, version = version + 1
                 WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
                params![
                    id.to_string(),
                    expected_version,
                    update.name,
                    update.latitude,
                    update.longitude,
                    format_timestamp(&now()),
                ],
            )
            .map_err(|e| map_unique(e, "location", "name", &update.name))?;
        ensure_updated(conn, EntityKind::Location, id, expected_version, changed)?;

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::Location,
            id,
            &ChangeSet::fields(["name", "latitude", "longitude"]),
        )?;
        require_location(conn, id)
    })
}

/// Move `id` under `parent`, or make it a root with `None`.
///
/// Fails with `Cycle` when `parent` is the node itself or lies in its
/// subtree. Closure rows of the whole moved subtree are rewritten.
pub fn attach_location(
    conn: &Connection,
    ctx: &AuditContext,
    id: &Uuid,
    parent: Option<Uuid>,
    expected_version: i64,
) -> Result<Location, DatabaseError> {
    let location = audited(conn, ctx, |conn| {
        let node = require_location(conn, id)?;
        ensure_references(conn, EntityKind::Location, &[("parent_id", parent)])?;
        if let Some(parent_id) = parent {
            if parent_id == *id || is_within(conn, &parent_id, id)? {
                return Err(DatabaseError::Cycle {
                    node: *id,
                    parent: parent_id,
                });
            }
        }

        let changed = conn
            .execute(
                "UPDATE locations SET parent_id = ?3, updated_at = ?4, version = version + 1
                 WHERE id = ?1 AND version = ?2 AND deleted_at IS NULL",
                params![
                    id.to_string(),
                    expected_version,
                    opt_id(parent),
                    format_timestamp(&now()),
                ],
            )
            .map_err(|e| map_unique(e, "location", "name", &node.name))?;
        ensure_updated(conn, EntityKind::Location, id, expected_version, changed)?;

        // Detach the subtree from its old ancestors, then hang it under the new ones.
        conn.execute(
            "DELETE FROM location_closure
             WHERE descendant_id IN (SELECT descendant_id FROM location_closure WHERE ancestor_id = ?1)
               AND ancestor_id NOT IN (SELECT descendant_id FROM location_closure WHERE ancestor_id = ?1)",
            params![id.to_string()],
        )?;
        if let Some(parent_id) = parent {
            conn.execute(
                "INSERT INTO location_closure (ancestor_id, descendant_id, depth)
                 SELECT up.ancestor_id, down.descendant_id, up.depth + down.depth + 1
                 FROM location_closure up, location_closure down
                 WHERE up.descendant_id = ?1 AND down.ancestor_id = ?2",
                params![parent_id.to_string(), id.to_string()],
            )?;
        }

        append_audit_entry(
            conn,
            ctx,
            AuditAction::Update,
            EntityKind::Location,
            id,
            &ChangeSet::fields(["parent_id"]).with_summary("re-parented"),
        )?;
        require_location(conn, id)
    })?;

    tracing::info!(id = %id, root = parent.is_none(), "location attached");
    Ok(location)
}

/// True when `node` is `ancestor` or one of its descendants.
pub fn is_within(conn: &Connection, node: &Uuid, ancestor: &Uuid) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM location_closure WHERE ancestor_id = ?1 AND descendant_id = ?2",
            params![ancestor.to_string(), node.to_string()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Live facilities located anywhere in the subtree rooted at `location_id`.
pub fn facilities_within(
    conn: &Connection,
    location_id: &Uuid,
) -> Result<Vec<HealthFacility>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FACILITY_COLUMNS} FROM health_facilities
         WHERE deleted_at IS NULL
           AND location_id IN (SELECT descendant_id FROM location_closure WHERE ancestor_id = ?1)
         ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![location_id.to_string()], read_facility_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(facility_from_row).collect()
}

/// Live patients whose home location, or registered facility, lies in the subtree.
pub fn patients_within(conn: &Connection, location_id: &Uuid) -> Result<Vec<Patient>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patients
         WHERE deleted_at IS NULL
           AND (home_location_id IN (SELECT descendant_id FROM location_closure WHERE ancestor_id = ?1)
                OR registered_facility_id IN (
                    SELECT f.id FROM health_facilities f
                    JOIN location_closure c ON c.descendant_id = f.location_id
                    WHERE c.ancestor_id = ?1))
         ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map(params![location_id.to_string()], read_patient_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(patient_from_row).collect()
}

/// Lazy walk from a location's parent up to its root.
///
/// Each step is one lookup. A parent chain that revisits a node yields a
/// `Cycle` error and ends the walk.
#[derive(Clone)]
pub struct Ancestors<'c> {
    conn: &'c Connection,
    start: Uuid,
    current: Uuid,
    seen: HashSet<Uuid>,
    done: bool,
}

impl<'c> Ancestors<'c> {
    /// Rewind to the starting node.
    pub fn restart(&mut self) {
        self.current = self.start;
        self.seen.clear();
        self.seen.insert(self.start);
        self.done = false;
    }

    fn step(&mut self) -> Result<Option<Location>, DatabaseError> {
        let parent: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT parent_id FROM locations WHERE id = ?1",
                params![self.current.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let parent_id = match parent {
            None => return Err(DatabaseError::not_found("location", &self.current)),
            Some(raw) => parse_optional_uuid(raw)?,
        };
        let Some(parent_id) = parent_id else {
            return Ok(None);
        };
        if !self.seen.insert(parent_id) {
            return Err(DatabaseError::Cycle {
                node: self.current,
                parent: parent_id,
            });
        }
        let location = require_location(self.conn, &parent_id)?;
        self.current = parent_id;
        Ok(Some(location))
    }
}

impl Iterator for Ancestors<'_> {
    type Item = Result<Location, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(location)) => Some(Ok(location)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

pub fn ancestors<'c>(conn: &'c Connection, id: &Uuid) -> Ancestors<'c> {
    let mut walk = Ancestors {
        conn,
        start: *id,
        current: *id,
        seen: HashSet::new(),
        done: false,
    };
    walk.restart();
    walk
}

/// Lazy breadth-first walk of a location's subtree, excluding the location.
///
/// Reads the closure table one depth level at a time. Within a level,
/// children follow their parent's position in the level above, and
/// siblings come in `(created_at, id)` order.
pub struct Descendants<'c> {
    conn: &'c Connection,
    root: Uuid,
    depth: i64,
    previous: Vec<Uuid>,
    pending: VecDeque<Location>,
    done: bool,
}

impl Descendants<'_> {
    fn load_next_level(&mut self) -> Result<(), DatabaseError> {
        self.depth += 1;
        let mut level = query_locations(
            self.conn,
            "WHERE deleted_at IS NULL AND id IN (
                SELECT descendant_id FROM location_closure WHERE ancestor_id = ?1 AND depth = ?2)
             ORDER BY created_at, id",
            params![self.root.to_string(), self.depth],
        )?;
        let rank: HashMap<Uuid, usize> = self
            .previous
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        level.retain(|l| l.parent_id.is_some_and(|p| rank.contains_key(&p)));
        level.sort_by_key(|l| l.parent_id.and_then(|p| rank.get(&p).copied()));
        self.previous = level.iter().map(|l| l.id).collect();
        self.pending.extend(level);
        Ok(())
    }
}

impl Iterator for Descendants<'_> {
    type Item = Result<Location, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(location) = self.pending.pop_front() {
                return Some(Ok(location));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.load_next_level() {
                self.done = true;
                return Some(Err(e));
            }
            if self.pending.is_empty() {
                self.done = true;
            }
        }
    }
}

pub fn descendants<'c>(conn: &'c Connection, id: &Uuid) -> Descendants<'c> {
    Descendants {
        conn,
        root: *id,
        depth: 0,
        previous: vec![*id],
        pending: VecDeque::new(),
        done: false,
    }
}

struct LocationRow {
    id: String,
    name: String,
    location_type: String,
    parent_id: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    created_at: String,
    updated_at: String,
    version: i64,
}

fn read_location_row(row: &rusqlite::Row) -> rusqlite::Result<LocationRow> {
    Ok(LocationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        location_type: row.get(2)?,
        parent_id: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        version: row.get(8)?,
    })
}

fn location_from_row(row: LocationRow) -> Result<Location, DatabaseError> {
    Ok(Location {
        id: parse_uuid(&row.id)?,
        name: row.name,
        location_type: LocationType::from_str(&row.location_type)?,
        parent_id: parse_optional_uuid(row.parent_id)?,
        latitude: row.latitude,
        longitude: row.longitude,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
        version: row.version,
    })
}

fn query_locations(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Location>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("SELECT {LOCATION_COLUMNS} FROM locations {clause}"))?;
    let rows = stmt
        .query_map(params, read_location_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(location_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_patient;
    use crate::db::repository::fixtures::*;

    fn ids(locations: impl Iterator<Item = Result<Location, DatabaseError>>) -> Vec<Uuid> {
        locations.map(|l| l.unwrap().id).collect()
    }

    fn closure_rows(conn: &Connection) -> Vec<(String, String, i64)> {
        let mut stmt = conn
            .prepare("SELECT ancestor_id, descendant_id, depth FROM location_closure ORDER BY 1, 2")
            .unwrap();
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn create_writes_closure_rows() {
        let conn = db();
        let (country, region, county) = location_tree(&conn);
        assert!(is_within(&conn, &county.id, &country.id).unwrap());
        assert!(is_within(&conn, &county.id, &county.id).unwrap());
        assert!(!is_within(&conn, &country.id, &region.id).unwrap());
        // 3 self rows + region→country + county→region + county→country
        assert_eq!(closure_rows(&conn).len(), 6);
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let conn = db();
        let new = NewLocation::root("Nowhere", LocationType::Country).with_coordinates(91.0, 0.0);
        let result = create_location(&conn, &AuditContext::system(), &new);
        assert!(matches!(result, Err(DatabaseError::ConstraintViolation(_))));
        assert_eq!(audit_count(&conn), 0);
    }

    #[test]
    fn sibling_names_are_unique_per_type() {
        let conn = db();
        let ctx = AuditContext::system();
        let (country, _, _) = location_tree(&conn);
        let dup = create_location(&conn, &ctx, &NewLocation::child("Nairobi", LocationType::Region, country.id));
        assert!(matches!(dup, Err(DatabaseError::Duplicate { .. })));

        // Same name under a different type is fine.
        create_location(&conn, &ctx, &NewLocation::child("Nairobi", LocationType::District, country.id)).unwrap();
    }

    #[test]
    fn ancestors_walk_up_to_root() {
        let conn = db();
        let (country, region, county) = location_tree(&conn);
        assert_eq!(ids(ancestors(&conn, &county.id)), vec![region.id, country.id]);
        assert!(ancestors(&conn, &country.id).next().is_none());
    }

    #[test]
    fn ancestors_can_be_cloned_and_restarted() {
        let conn = db();
        let (country, region, county) = location_tree(&conn);
        let mut walk = ancestors(&conn, &county.id);
        assert_eq!(walk.next().unwrap().unwrap().id, region.id);

        let copy = walk.clone();
        assert_eq!(ids(copy), vec![country.id]);
        assert_eq!(ids(walk.by_ref()), vec![country.id]);

        walk.restart();
        assert_eq!(ids(walk), vec![region.id, country.id]);
    }

    #[test]
    fn corrupted_parent_chain_yields_cycle_error() {
        let conn = db();
        let (country, _, county) = location_tree(&conn);
        // Bypass the repository to corrupt the chain: country → county.
        conn.execute(
            "UPDATE locations SET parent_id = ?1 WHERE id = ?2",
            params![county.id.to_string(), country.id.to_string()],
        )
        .unwrap();

        let items: Vec<_> = ancestors(&conn, &county.id).collect();
        assert_eq!(items.len(), 3);
        assert!(matches!(items.last(), Some(Err(DatabaseError::Cycle { .. }))));
    }

    #[test]
    fn descendants_are_breadth_first_and_exclude_the_node() {
        let conn = db();
        let ctx = AuditContext::system();
        let (country, region, county) = location_tree(&conn);
        let coast = create_location(&conn, &ctx, &NewLocation::child("Coast", LocationType::Region, country.id)).unwrap();
        let mombasa =
            create_location(&conn, &ctx, &NewLocation::child("Mombasa", LocationType::District, coast.id)).unwrap();

        assert_eq!(
            ids(descendants(&conn, &country.id)),
            vec![region.id, coast.id, county.id, mombasa.id]
        );
        assert!(descendants(&conn, &county.id).next().is_none());
    }

    #[test]
    fn descendants_group_each_level_by_parent() {
        let conn = db();
        let ctx = AuditContext::system();
        let (country, region, county) = location_tree(&conn);
        let coast = create_location(&conn, &ctx, &NewLocation::child("Coast", LocationType::Region, country.id)).unwrap();
        let mombasa =
            create_location(&conn, &ctx, &NewLocation::child("Mombasa", LocationType::District, coast.id)).unwrap();
        // Created after Mombasa but listed first: its parent precedes Coast.
        let kiambu =
            create_location(&conn, &ctx, &NewLocation::child("Kiambu", LocationType::District, region.id)).unwrap();

        assert_eq!(
            ids(descendants(&conn, &country.id)),
            vec![region.id, coast.id, county.id, kiambu.id, mombasa.id]
        );
        assert_eq!(ids(descendants(&conn, &region.id)), vec![county.id, kiambu.id]);
    }

    fn assert_ancestry_extends(conn: &Connection, roots: &[Uuid]) {
        for root in roots {
            let above = ids(ancestors(conn, root));
            for d in ids(descendants(conn, root)) {
                let chain = ids(ancestors(conn, &d));
                assert!(chain.ends_with(&above), "{d} under {root}: {chain:?} vs {above:?}");
                assert!(chain.contains(root));
            }
        }
    }

    #[test]
    fn descendant_ancestry_extends_the_node_ancestry() {
        let conn = db();
        let ctx = AuditContext::system();
        let (country, region, county) = location_tree(&conn);
        let coast = create_location(&conn, &ctx, &NewLocation::child("Coast", LocationType::Region, country.id)).unwrap();
        let mombasa =
            create_location(&conn, &ctx, &NewLocation::child("Mombasa", LocationType::District, coast.id)).unwrap();
        let uganda = create_location(&conn, &ctx, &NewLocation::root("Uganda", LocationType::Country)).unwrap();
        let all = [country.id, region.id, county.id, coast.id, mombasa.id, uganda.id];
        assert_ancestry_extends(&conn, &all);

        attach_location(&conn, &ctx, &region.id, Some(uganda.id), region.version).unwrap();
        assert_ancestry_extends(&conn, &all);
        assert_eq!(ids(descendants(&conn, &uganda.id)), vec![region.id, county.id]);

        let coast = get_location(&conn, &coast.id).unwrap().unwrap();
        attach_location(&conn, &ctx, &coast.id, Some(county.id), coast.version).unwrap();
        assert_ancestry_extends(&conn, &all);
        assert_eq!(
            ids(descendants(&conn, &uganda.id)),
            vec![region.id, county.id, coast.id, mombasa.id]
        );
        assert_eq!(ids(descendants(&conn, &country.id)), Vec::<Uuid>::new());
    }

    #[test]
    fn attach_moves_subtree_and_rewrites_closure() {
        let conn = db();
        let ctx = AuditContext::system();
        let (country, region, county) = location_tree(&conn);
        let uganda = create_location(&conn, &ctx, &NewLocation::root("Uganda", LocationType::Country)).unwrap();

        let moved = attach_location(&conn, &ctx, &region.id, Some(uganda.id), region.version).unwrap();
        assert_eq!(moved.parent_id, Some(uganda.id));
        assert_eq!(moved.version, 2);

        assert!(is_within(&conn, &county.id, &uganda.id).unwrap());
        assert!(!is_within(&conn, &county.id, &country.id).unwrap());
        assert_eq!(ids(ancestors(&conn, &county.id)), vec![region.id, uganda.id]);
        let depth: i64 = conn
            .query_row(
                "SELECT depth FROM location_closure WHERE ancestor_id = ?1 AND descendant_id = ?2",
                params![uganda.id.to_string(), county.id.to_string()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(depth, 2);
    }

    #[test]
    fn attach_to_none_makes_a_root() {
        let conn = db();
        let ctx = AuditContext::system();
        let (country, region, county) = location_tree(&conn);
        attach_location(&conn, &ctx, &region.id, None, region.version).unwrap();

        let roots: Vec<Uuid> = list_root_locations(&conn).unwrap().iter().map(|l| l.id).collect();
        assert_eq!(roots, vec![country.id, region.id]);
        assert!(is_within(&conn, &county.id, &region.id).unwrap());
        assert!(!is_within(&conn, &county.id, &country.id).unwrap());
    }

    #[test]
    fn attach_under_own_descendant_is_a_cycle() {
        let conn = db();
        let ctx = AuditContext::system();
        let (country, _, county) = location_tree(&conn);
        let before = closure_rows(&conn);

        let result = attach_location(&conn, &ctx, &country.id, Some(county.id), country.version);
        assert!(matches!(result, Err(DatabaseError::Cycle { node, parent }) if node == country.id && parent == county.id));

        let self_parent = attach_location(&conn, &ctx, &country.id, Some(country.id), country.version);
        assert!(matches!(self_parent, Err(DatabaseError::Cycle { .. })));
        assert_eq!(closure_rows(&conn), before);
    }

    #[test]
    fn stale_version_is_rejected() {
        let conn = db();
        let ctx = AuditContext::system();
        let (_, region, _) = location_tree(&conn);
        let mut update = LocationUpdate::from(&region);
        update.latitude = Some(-1.29);
        update.longitude = Some(36.82);
        update_location(&conn, &ctx, &region.id, 1, &update).unwrap();

        let stale = update_location(&conn, &ctx, &region.id, 1, &update);
        assert!(matches!(
            stale,
            Err(DatabaseError::ConcurrentModification { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn scoped_queries_follow_the_subtree() {
        let conn = db();
        let (country, region, county) = location_tree(&conn);
        let hospital = facility(&conn, county.id);
        let registered = patient(&conn, Some(hospital.id));

        let ctx = AuditContext::system();
        let coast = create_location(&conn, &ctx, &NewLocation::child("Coast", LocationType::Region, country.id)).unwrap();
        let mut new = new_patient("Ali", "Hassan");
        new.home_location_id = Some(coast.id);
        let coastal = create_patient(&conn, &ctx, &new).unwrap();

        let in_region: Vec<Uuid> = facilities_within(&conn, &region.id).unwrap().iter().map(|f| f.id).collect();
        assert_eq!(in_region, vec![hospital.id]);
        assert!(facilities_within(&conn, &coast.id).unwrap().is_empty());

        let everyone: Vec<Uuid> = patients_within(&conn, &country.id).unwrap().iter().map(|p| p.id).collect();
        assert_eq!(everyone, vec![registered.id, coastal.id]);
        let coast_only: Vec<Uuid> = patients_within(&conn, &coast.id).unwrap().iter().map(|p| p.id).collect();
        assert_eq!(coast_only, vec![coastal.id]);
    }
}
