//! The minimal display-registry collaborator: create-at-activation,
//! lookup by id or name, lifecycle state transitions, last-seen touch.
//!
//! Scheduling, content-health reporting, and richer fleet metadata belong
//! to a different system; this crate carries only what display
//! authentication and the WebSocket upgrade gate need.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use signage_types::{DisplayIdentity, DisplayLocation, DisplayState, Error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayRecord {
    pub id: DisplayIdentity,
    pub name: String,
    pub location: DisplayLocation,
    pub state: DisplayState,
    pub last_seen_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DisplayRecord> {
    let id: String = row.get(0)?;
    let state: String = row.get(5)?;
    Ok(DisplayRecord {
        id: DisplayIdentity::parse(&id).ok_or(rusqlite::Error::InvalidColumnType(
            0,
            "id".into(),
            rusqlite::types::Type::Text,
        ))?,
        name: row.get(1)?,
        location: DisplayLocation {
            site_id: row.get(2)?,
            zone: row.get(3)?,
            position: row.get(4)?,
        },
        state: DisplayState::from_str(&state).ok_or(rusqlite::Error::InvalidColumnType(
            5,
            "state".into(),
            rusqlite::types::Type::Text,
        ))?,
        last_seen_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const SELECT_COLUMNS: &str =
    "id, name, site_id, zone, position, state, last_seen_at, created_at, updated_at";

/// Creates a new display in `PENDING` state and immediately promotes it to
/// `ACTIVE` — this crate models activation as a single step, since by the
/// time a display holds a credential it is, by definition, active. Relies
/// on the `name` UNIQUE constraint rather than a pre-check SELECT, so two
/// concurrent registrations of the same name cannot both succeed: exactly
/// one insert wins and the other observes `Error::Conflict`.
pub fn create_display(
    conn: &Connection,
    name: &str,
    location: &DisplayLocation,
) -> Result<DisplayRecord, Error> {
    let id = DisplayIdentity::new();

    let result = conn.execute(
        "INSERT INTO displays (id, name, site_id, zone, position, state)
         VALUES (?1, ?2, ?3, ?4, ?5, 'ACTIVE')",
        params![
            id.to_string(),
            name,
            location.site_id,
            location.zone,
            location.position
        ],
    );

    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(Error::Conflict(format!("display name '{name}' already registered")));
        }
        Err(e) => return Err(Error::StoreError(e.to_string())),
    }

    get_display_by_id(conn, id)?.ok_or_else(|| Error::Internal("display vanished after insert".into()))
}

pub fn get_display_by_id(conn: &Connection, id: DisplayIdentity) -> Result<Option<DisplayRecord>, Error> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM displays WHERE id = ?1"),
        params![id.to_string()],
        row_to_record,
    )
    .optional()
    .map_err(|e| Error::StoreError(e.to_string()))
}

pub fn get_display_by_name(conn: &Connection, name: &str) -> Result<Option<DisplayRecord>, Error> {
    conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM displays WHERE name = ?1"),
        params![name],
        row_to_record,
    )
    .optional()
    .map_err(|e| Error::StoreError(e.to_string()))
}

/// Looks a display up by either its identifier or its unique name,
/// matching the `{id}` path parameter's dual acceptance.
pub fn find_display(conn: &Connection, id_or_name: &str) -> Result<Option<DisplayRecord>, Error> {
    if let Some(id) = DisplayIdentity::parse(id_or_name) {
        if let Some(record) = get_display_by_id(conn, id)? {
            return Ok(Some(record));
        }
    }
    get_display_by_name(conn, id_or_name)
}

/// Sets the display's lifecycle state. Exposed for completeness and for
/// tests; `disable` is not reachable through any public endpoint in this
/// workspace's HTTP surface.
pub fn set_state(conn: &Connection, id: DisplayIdentity, state: DisplayState) -> Result<(), Error> {
    let changed = conn
        .execute(
            "UPDATE displays SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )
        .map_err(|e| Error::StoreError(e.to_string()))?;

    if changed == 0 {
        return Err(Error::NotFound(format!("display {id} not found")));
    }
    Ok(())
}

pub fn touch_last_seen(conn: &Connection, id: DisplayIdentity) -> Result<(), Error> {
    let now = Utc::now().to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE displays SET last_seen_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id.to_string()],
        )
        .map_err(|e| Error::StoreError(e.to_string()))?;

    if changed == 0 {
        return Err(Error::NotFound(format!("display {id} not found")));
    }
    Ok(())
}
