//! RFC 8628 Device Authorization Grant: code generation, activation, and
//! the polling state machine.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use signage_types::{DisplayIdentity, Error};

/// Device codes and user codes are valid for 15 minutes.
pub const CODE_TTL: ChronoDuration = ChronoDuration::minutes(15);
/// Devices should not poll more often than this.
pub const POLL_INTERVAL_SECONDS: i64 = 5;

/// Alphabet for user codes. Characters that are easy to confuse when
/// handwritten or displayed on a low-resolution screen (`0`/`O`, `1`/`I`/`L`)
/// are excluded.
const USER_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const USER_CODE_LEN: usize = 8;
const MAX_COLLISION_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct DeviceCodeIssued {
    pub device_code: String,
    pub user_code: String,
    pub expires_at: DateTime<Utc>,
    pub poll_interval: i64,
}

/// Outcome of a device polling its own `device_code`.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Pending,
    Issued(DisplayIdentity),
}

fn random_device_code() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn random_user_code() -> String {
    let mut rng = rand::thread_rng();
    (0..USER_CODE_LEN)
        .map(|_| USER_CODE_ALPHABET[rng.gen_range(0..USER_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Creates a new pending device-authorization grant, retrying on the rare
/// collision against an existing unexpired code.
pub fn generate_code(conn: &Connection) -> Result<DeviceCodeIssued, Error> {
    let now = Utc::now();
    let expires_at = now + CODE_TTL;

    for _ in 0..=MAX_COLLISION_RETRIES {
        let device_code = random_device_code();
        let user_code = random_user_code();

        let result = conn.execute(
            "INSERT INTO device_codes (device_code, user_code, expires_at, poll_interval)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                device_code,
                user_code,
                expires_at.to_rfc3339(),
                POLL_INTERVAL_SECONDS
            ],
        );

        match result {
            Ok(_) => {
                return Ok(DeviceCodeIssued {
                    device_code,
                    user_code,
                    expires_at,
                    poll_interval: POLL_INTERVAL_SECONDS,
                });
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                tracing::warn!("device/user code collision, retrying");
                continue;
            }
            Err(e) => return Err(Error::StoreError(e.to_string())),
        }
    }

    Err(Error::Internal(
        "exhausted retries generating a unique device/user code".into(),
    ))
}

struct CodeRow {
    user_code: String,
    expires_at: String,
    activated: bool,
    display_id: Option<String>,
}

fn fetch_by_user_code(conn: &Connection, user_code: &str) -> Result<Option<CodeRow>, Error> {
    conn.query_row(
        "SELECT user_code, expires_at, activated, display_id FROM device_codes WHERE user_code = ?1",
        params![user_code],
        |row| {
            Ok(CodeRow {
                user_code: row.get(0)?,
                expires_at: row.get(1)?,
                activated: row.get::<_, i64>(2)? != 0,
                display_id: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| Error::StoreError(e.to_string()))
}

fn parse_expiry(expires_at: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(expires_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::StoreError(e.to_string()))
}

/// Binds `user_code` to `display_id`. Uses a single conditional UPDATE so
/// two concurrent activations of the same code cannot both succeed: only
/// the first one affects a row.
pub fn activate_code(
    conn: &Connection,
    user_code: &str,
    display_id: DisplayIdentity,
) -> Result<(), Error> {
    let row = fetch_by_user_code(conn, user_code)?.ok_or(Error::CodeNotFound)?;

    if parse_expiry(&row.expires_at)? <= Utc::now() {
        return Err(Error::CodeExpired);
    }

    if row.activated {
        return if row.display_id.as_deref() == Some(&display_id.to_string()) {
            Ok(())
        } else {
            Err(Error::AlreadyActive)
        };
    }

    let affected = conn
        .execute(
            "UPDATE device_codes SET activated = 1, activated_at = ?1, display_id = ?2
             WHERE user_code = ?3 AND activated = 0",
            params![Utc::now().to_rfc3339(), display_id.to_string(), user_code],
        )
        .map_err(|e| Error::StoreError(e.to_string()))?;

    if affected == 1 {
        return Ok(());
    }

    // Lost the race: re-check who won.
    let row = fetch_by_user_code(conn, user_code)?.ok_or(Error::CodeNotFound)?;
    if row.display_id.as_deref() == Some(&display_id.to_string()) {
        Ok(())
    } else {
        Err(Error::AlreadyActive)
    }
}

/// Polls `device_code`. On the first poll observing `activated = true`,
/// the row is consumed (deleted) and the bound display returned; any
/// later poll for the same code fails with `CodeNotFound`, which the HTTP
/// boundary maps onto the OAuth `invalid_grant` error.
pub fn poll_device_code(conn: &mut Connection, device_code: &str) -> Result<PollOutcome, Error> {
    let tx = conn
        .transaction()
        .map_err(|e| Error::StoreError(e.to_string()))?;

    let row: Option<(String, bool, Option<String>)> = tx
        .query_row(
            "SELECT expires_at, activated, display_id FROM device_codes WHERE device_code = ?1",
            params![device_code],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| Error::StoreError(e.to_string()))?;

    let Some((expires_at, activated, display_id)) = row else {
        return Err(Error::CodeNotFound);
    };

    if parse_expiry(&expires_at)? <= Utc::now() {
        return Err(Error::CodeExpired);
    }

    if !activated {
        return Ok(PollOutcome::Pending);
    }

    let display_id = display_id.ok_or_else(|| {
        Error::Internal("device code marked activated with no bound display".into())
    })?;
    let display_id = DisplayIdentity::parse(&display_id)
        .ok_or_else(|| Error::StoreError("stored display id is not a valid uuid".into()))?;

    tx.execute(
        "DELETE FROM device_codes WHERE device_code = ?1",
        params![device_code],
    )
    .map_err(|e| Error::StoreError(e.to_string()))?;

    tx.commit().map_err(|e| Error::StoreError(e.to_string()))?;

    Ok(PollOutcome::Issued(display_id))
}
