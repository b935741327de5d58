//! Bearer/refresh token lifecycle bound to a display identity.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use signage_types::{DisplayIdentity, Error};
use uuid::Uuid;

use crate::constant_time::constant_time_eq;

/// Access tokens are valid for one hour.
pub const ACCESS_TOKEN_TTL: ChronoDuration = ChronoDuration::hours(1);
/// Refresh tokens are valid for ninety days.
pub const REFRESH_TOKEN_TTL: ChronoDuration = ChronoDuration::days(90);

/// A freshly issued or refreshed token pair. `access_token`/`refresh_token`
/// are populated only at the moment of issuance — they are never
/// reconstructed from storage, since only their digests are persisted.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: Uuid,
    pub display_id: DisplayIdentity,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

fn random_secret() -> String {
    let mut bytes = [0u8; 24]; // 192 bits, comfortably over the 128-bit floor
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn digest_hex(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Issues a new access/refresh pair for `display_id`, atomically replacing
/// any prior pair for that display. This is the only write path that
/// touches the `tokens` table, which keeps the "one active pair per
/// display" invariant trivial: there is only ever one row per display.
pub fn create_token(conn: &mut Connection, display_id: DisplayIdentity) -> Result<TokenRecord, Error> {
    let access_token = random_secret();
    let refresh_token = random_secret();
    let now = Utc::now();
    let access_expires_at = now + ACCESS_TOKEN_TTL;
    let refresh_expires_at = now + REFRESH_TOKEN_TTL;
    let id = Uuid::new_v4();

    let tx = conn
        .transaction()
        .map_err(|e| Error::StoreError(e.to_string()))?;

    tx.execute(
        "DELETE FROM tokens WHERE display_id = ?1",
        params![display_id.to_string()],
    )
    .map_err(|e| Error::StoreError(e.to_string()))?;

    tx.execute(
        "INSERT INTO tokens (id, display_id, access_hash, refresh_hash, access_expires_at, refresh_expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            display_id.to_string(),
            digest_hex(&access_token),
            digest_hex(&refresh_token),
            access_expires_at.to_rfc3339(),
            refresh_expires_at.to_rfc3339(),
        ],
    )
    .map_err(|e| Error::StoreError(e.to_string()))?;

    tx.commit().map_err(|e| Error::StoreError(e.to_string()))?;

    Ok(TokenRecord {
        id,
        display_id,
        access_token,
        refresh_token,
        access_expires_at,
        refresh_expires_at,
    })
}

struct StoredRow {
    display_id: String,
    hash: String,
    expires_at: String,
}

fn lookup_by_hash(conn: &Connection, column: &str, hash: &str) -> Result<Option<StoredRow>, Error> {
    let sql = format!(
        "SELECT display_id, {column}, {expires} FROM tokens WHERE {column} = ?1",
        column = column,
        expires = if column == "access_hash" {
            "access_expires_at"
        } else {
            "refresh_expires_at"
        }
    );
    conn.query_row(&sql, params![hash], |row| {
        Ok(StoredRow {
            display_id: row.get(0)?,
            hash: row.get(1)?,
            expires_at: row.get(2)?,
        })
    })
    .optional()
    .map_err(|e| Error::StoreError(e.to_string()))
}

/// Validates a bearer access-token secret, returning the display it is
/// bound to. The digest lookup is a plain indexed SELECT (the attacker
/// does not control which row is fetched), but the final equality check
/// against the freshly computed digest runs in constant time as a
/// defense-in-depth measure against timing side channels.
pub fn validate_access_token(conn: &Connection, secret: &str) -> Result<DisplayIdentity, Error> {
    let hash = digest_hex(secret);
    let row = lookup_by_hash(conn, "access_hash", &hash)?.ok_or(Error::TokenNotFound)?;

    if !constant_time_eq(row.hash.as_bytes(), hash.as_bytes()) {
        return Err(Error::TokenInvalid);
    }

    let expires_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&row.expires_at)
        .map_err(|e| Error::StoreError(e.to_string()))?
        .with_timezone(&Utc);

    if expires_at <= Utc::now() {
        return Err(Error::TokenExpired);
    }

    DisplayIdentity::parse(&row.display_id)
        .ok_or_else(|| Error::StoreError("stored display id is not a valid uuid".into()))
}

/// Exchanges a refresh-token secret for a new access/refresh pair. The old
/// pair is invalidated as a side effect of `create_token`'s atomic
/// replacement.
pub fn refresh_token(conn: &mut Connection, secret: &str) -> Result<TokenRecord, Error> {
    let hash = digest_hex(secret);
    let row = lookup_by_hash(conn, "refresh_hash", &hash)?.ok_or(Error::TokenNotFound)?;

    if !constant_time_eq(row.hash.as_bytes(), hash.as_bytes()) {
        return Err(Error::TokenInvalid);
    }

    let expires_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&row.expires_at)
        .map_err(|e| Error::StoreError(e.to_string()))?
        .with_timezone(&Utc);

    if expires_at <= Utc::now() {
        return Err(Error::TokenExpired);
    }

    let display_id = DisplayIdentity::parse(&row.display_id)
        .ok_or_else(|| Error::StoreError("stored display id is not a valid uuid".into()))?;

    create_token(conn, display_id)
}

/// Deletes every token record bound to `display_id`.
pub fn revoke_tokens(conn: &Connection, display_id: DisplayIdentity) -> Result<(), Error> {
    conn.execute(
        "DELETE FROM tokens WHERE display_id = ?1",
        params![display_id.to_string()],
    )
    .map_err(|e| Error::StoreError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use signage_db::run_migrations;

    fn setup() -> (Connection, DisplayIdentity) {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let display_id = DisplayIdentity::new();
        conn.execute(
            "INSERT INTO displays (id, name, site_id, zone, position) VALUES (?1, 'lobby', 'hq', 'lobby', 'north')",
            params![display_id.to_string()],
        )
        .unwrap();
        (conn, display_id)
    }

    #[test]
    fn create_then_validate_round_trips() {
        let (mut conn, display_id) = setup();
        let record = create_token(&mut conn, display_id).unwrap();

        let resolved = validate_access_token(&conn, &record.access_token).unwrap();
        assert_eq!(resolved, display_id);
    }

    #[test]
    fn validate_rejects_unknown_secret() {
        let (conn, _display_id) = setup();
        let err = validate_access_token(&conn, "not-a-real-token").unwrap_err();
        assert!(matches!(err, Error::TokenNotFound));
    }

    #[test]
    fn create_token_replaces_prior_pair() {
        let (mut conn, display_id) = setup();
        let first = create_token(&mut conn, display_id).unwrap();
        let second = create_token(&mut conn, display_id).unwrap();

        assert!(validate_access_token(&conn, &second.access_token).is_ok());
        let err = validate_access_token(&conn, &first.access_token).unwrap_err();
        assert!(matches!(err, Error::TokenNotFound));

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tokens WHERE display_id = ?1",
                params![display_id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "only one active pair should exist per display");
    }

    #[test]
    fn refresh_issues_new_pair_and_invalidates_old_refresh() {
        let (mut conn, display_id) = setup();
        let first = create_token(&mut conn, display_id).unwrap();

        let second = refresh_token(&mut conn, &first.refresh_token).unwrap();
        assert_eq!(second.display_id, display_id);
        assert_ne!(second.access_token, first.access_token);

        let err = refresh_token(&mut conn, &first.refresh_token).unwrap_err();
        assert!(matches!(err, Error::TokenNotFound));
    }

    #[test]
    fn expired_access_token_is_rejected() {
        let (mut conn, display_id) = setup();
        let record = create_token(&mut conn, display_id).unwrap();

        conn.execute(
            "UPDATE tokens SET access_expires_at = ?1 WHERE display_id = ?2",
            params![
                (Utc::now() - ChronoDuration::hours(2)).to_rfc3339(),
                display_id.to_string()
            ],
        )
        .unwrap();

        let err = validate_access_token(&conn, &record.access_token).unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
    }

    #[test]
    fn revoke_removes_all_records_for_display() {
        let (mut conn, display_id) = setup();
        let record = create_token(&mut conn, display_id).unwrap();
        revoke_tokens(&conn, display_id).unwrap();

        let err = validate_access_token(&conn, &record.access_token).unwrap_err();
        assert!(matches!(err, Error::TokenNotFound));
    }

    #[test]
    fn secrets_are_never_persisted_in_plaintext() {
        let (mut conn, display_id) = setup();
        let record = create_token(&mut conn, display_id).unwrap();

        let stored: String = conn
            .query_row(
                "SELECT access_hash FROM tokens WHERE display_id = ?1",
                params![display_id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_ne!(stored, record.access_token);
        assert_eq!(stored, digest_hex(&record.access_token));
    }
}
