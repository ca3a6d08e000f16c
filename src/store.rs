use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::types::{AppState, Direction, LogEntry, MessageType, Profile, Seat, SeatStatus};

/// Thin adapter over the seat / profile / message-log store: point lookups,
/// inserts and single-field updates only. All policy lives above this
/// layer.

fn parse_seat_row(row: PgRow) -> Seat {
    Seat {
        id: row.get("id"),
        show_id: row.get("show_id"),
        seat_code: row.get("seat_code"),
        phone: row.get("phone"),
        status: SeatStatus::parse(&row.get::<String, _>("status")),
        expires_at: row.get("expires_at"),
        bound_at: row.get("bound_at"),
        profile_id: row.get("profile_id"),
    }
}

const SEAT_COLUMNS: &str =
    "id, show_id, seat_code, phone, status, expires_at, bound_at, profile_id";

pub async fn find_seat_by_code(state: &Arc<AppState>, code: &str) -> Option<Seat> {
    sqlx::query(&format!(
        "SELECT {SEAT_COLUMNS} FROM seats WHERE seat_code = $1 LIMIT 1"
    ))
    .bind(code)
    .fetch_optional(&state.db)
    .await
    .unwrap_or_else(|err| {
        eprintln!("seat lookup by code failed: {err}");
        None
    })
    .map(parse_seat_row)
}

/// All seats carrying this phone, most recently bound first. The chat path
/// picks among them with `binding::select_chat_seat` so a stale revoked row
/// cannot shadow a usable one.
pub async fn find_seats_by_phone(state: &Arc<AppState>, phone: &str) -> Vec<Seat> {
    sqlx::query(&format!(
        "SELECT {SEAT_COLUMNS} FROM seats WHERE phone = $1 \
         ORDER BY bound_at DESC NULLS LAST"
    ))
    .bind(phone)
    .fetch_all(&state.db)
    .await
    .unwrap_or_else(|err| {
        eprintln!("seat lookup by phone failed: {err}");
        Vec::new()
    })
    .into_iter()
    .map(parse_seat_row)
    .collect()
}

pub async fn bind_seat(
    state: &Arc<AppState>,
    seat_id: &str,
    phone: &str,
    now: DateTime<Utc>,
) -> Result<(), String> {
    sqlx::query("UPDATE seats SET phone = $1, status = 'active', bound_at = $2 WHERE id = $3")
        .bind(phone)
        .bind(now)
        .bind(seat_id)
        .execute(&state.db)
        .await
        .map(|_| ())
        .map_err(|err| err.to_string())
}

/// Best-effort write-back of the lazy expiry check.
pub async fn mark_seat_expired(state: &Arc<AppState>, seat_id: &str) {
    let result = sqlx::query("UPDATE seats SET status = 'expired' WHERE id = $1")
        .bind(seat_id)
        .execute(&state.db)
        .await;
    if let Err(err) = result {
        eprintln!("failed to mark seat {seat_id} expired: {err}");
    }
}

pub async fn find_profile(state: &Arc<AppState>, profile_id: &str) -> Option<Profile> {
    let row = sqlx::query(
        "SELECT id, name, role, show_name, performer_type, goals, sleep_environment, \
                dietary_constraints, injury_notes \
         FROM profiles WHERE id = $1 LIMIT 1",
    )
    .bind(profile_id)
    .fetch_optional(&state.db)
    .await
    .unwrap_or_else(|err| {
        eprintln!("profile lookup failed: {err}");
        None
    })?;
    Some(Profile {
        id: row.get("id"),
        name: row.get("name"),
        role: row.get("role"),
        show_name: row.get("show_name"),
        performer_type: row.get("performer_type"),
        goals: row.get("goals"),
        sleep_environment: row.get("sleep_environment"),
        dietary_constraints: row.get("dietary_constraints"),
        injury_notes: row.get("injury_notes"),
    })
}

/// Timestamp of the most recent inbound log entry for a seat. Callers that
/// feed the session-window policy must call this before inserting the
/// current message.
pub async fn last_inbound_at(state: &Arc<AppState>, seat_id: &str) -> Option<DateTime<Utc>> {
    sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT created_at FROM message_log \
         WHERE seat_id = $1 AND direction = 'inbound' \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(seat_id)
    .fetch_optional(&state.db)
    .await
    .unwrap_or_else(|err| {
        eprintln!("last inbound lookup failed: {err}");
        None
    })
}

/// Whether any outbound chat entry for this seat since `since` already
/// carries the given sentence (the disclaimer once-per-24h policy).
pub async fn outbound_contains_since(
    state: &Arc<AppState>,
    seat_id: &str,
    needle: &str,
    since: DateTime<Utc>,
) -> bool {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS( \
           SELECT 1 FROM message_log \
           WHERE seat_id = $1 AND direction = 'outbound' AND message_type = 'chat' \
             AND created_at > $2 AND body LIKE '%' || $3 || '%')",
    )
    .bind(seat_id)
    .bind(since)
    .bind(needle)
    .fetch_one(&state.db)
    .await
    .unwrap_or_else(|err| {
        eprintln!("disclaimer lookup failed: {err}");
        false
    })
}

pub async fn insert_log(state: &Arc<AppState>, entry: &LogEntry) -> Result<(), String> {
    sqlx::query(
        "INSERT INTO message_log (id, seat_id, phone, direction, body, message_type, \
                                  provider_sid, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&entry.id)
    .bind(&entry.seat_id)
    .bind(&entry.phone)
    .bind(entry.direction.as_str())
    .bind(&entry.body)
    .bind(entry.message_type.as_str())
    .bind(&entry.provider_sid)
    .bind(entry.created_at)
    .execute(&state.db)
    .await
    .map(|_| ())
    .map_err(|err| err.to_string())
}

pub fn new_log_entry(
    seat_id: Option<&str>,
    phone: &str,
    direction: Direction,
    body: &str,
    message_type: MessageType,
    provider_sid: &str,
) -> LogEntry {
    LogEntry {
        id: Uuid::new_v4().to_string(),
        seat_id: seat_id.map(str::to_string),
        phone: phone.to_string(),
        direction,
        body: body.to_string(),
        message_type,
        provider_sid: provider_sid.to_string(),
        created_at: Utc::now(),
    }
}
