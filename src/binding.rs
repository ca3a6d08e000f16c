use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::types::{Seat, SeatStatus};

/// Seat resolution decisions. These are pure over an already-fetched seat
/// row; `app.rs` does the store IO around them. Code binding is checked
/// before the chat lookup, so a user who resends their code after binding
/// simply rebinds harmlessly.

pub const SESSION_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// The body is a seat code (either `seat:<CODE>` or a bare token).
    SeatCode(String),
    Chat,
}

pub fn classify_message(body: &str) -> InboundKind {
    let trimmed = body.trim();
    if let Some(rest) = strip_code_prefix(trimmed) {
        let code = rest.trim().to_ascii_uppercase();
        if looks_like_seat_code(&code) {
            return InboundKind::SeatCode(code);
        }
    }
    let bare = trimmed.to_ascii_uppercase();
    if looks_like_seat_code(&bare) {
        return InboundKind::SeatCode(bare);
    }
    InboundKind::Chat
}

fn strip_code_prefix(body: &str) -> Option<&str> {
    let lower = body.to_ascii_lowercase();
    if lower.starts_with("seat:") {
        return Some(&body[5..]);
    }
    None
}

fn looks_like_seat_code(candidate: &str) -> bool {
    let Ok(re) = Regex::new(r"^SC-[A-Z0-9]{4,12}$") else {
        return false;
    };
    re.is_match(candidate)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingOutcome {
    CodeNotFound,
    Expired,
    Revoked,
    /// Seat already bound to a different phone; never rebound (hijack
    /// guard).
    LinkedElsewhere,
    /// Bind or idempotent same-phone rebind.
    Bind {
        rebind: bool,
    },
}

pub fn binding_outcome(seat: Option<&Seat>, phone: &str, now: DateTime<Utc>) -> BindingOutcome {
    let Some(seat) = seat else {
        return BindingOutcome::CodeNotFound;
    };
    match seat.effective_status(now) {
        SeatStatus::Expired => return BindingOutcome::Expired,
        SeatStatus::Revoked => return BindingOutcome::Revoked,
        _ => {}
    }
    match seat.phone.as_deref() {
        Some(bound) if bound != phone => BindingOutcome::LinkedElsewhere,
        Some(_) => BindingOutcome::Bind { rebind: true },
        None => BindingOutcome::Bind { rebind: false },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAccess {
    NoSeat,
    Expired,
    Revoked,
    Allowed,
}

pub fn chat_access(seat: Option<&Seat>, now: DateTime<Utc>) -> ChatAccess {
    let Some(seat) = seat else {
        return ChatAccess::NoSeat;
    };
    match seat.effective_status(now) {
        SeatStatus::Revoked => ChatAccess::Revoked,
        SeatStatus::Expired => ChatAccess::Expired,
        // Pending accepted alongside active: an operator may pre-fill a
        // seat's phone before the holder ever sends the code.
        SeatStatus::Active | SeatStatus::Pending => ChatAccess::Allowed,
    }
}

/// Pick the seat a chat message resolves to when a phone appears on more
/// than one row. A usable seat (active or pending as of `now`) wins over a
/// revoked or expired one regardless of binding recency; with no usable
/// seat the most recent row stands so its state drives the reply.
pub fn select_chat_seat(seats: &[Seat], now: DateTime<Utc>) -> Option<&Seat> {
    seats
        .iter()
        .find(|seat| {
            matches!(
                seat.effective_status(now),
                SeatStatus::Active | SeatStatus::Pending
            )
        })
        .or_else(|| seats.first())
}

/// Provider messaging-window policy: free-form replies are only allowed
/// within 24 h of the user's previous inbound message. The first inbound
/// ever recorded for a seat is always allowed. Callers must pass the
/// timestamp of the previous inbound entry, fetched before the current
/// message is logged.
pub fn session_window_open(previous_inbound_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match previous_inbound_at {
        None => true,
        Some(at) => now - at < Duration::hours(SESSION_WINDOW_HOURS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seat(phone: Option<&str>, status: SeatStatus, expires_at: Option<DateTime<Utc>>) -> Seat {
        Seat {
            id: "seat-1".to_string(),
            show_id: "show-1".to_string(),
            seat_code: "SC-ABC123".to_string(),
            phone: phone.map(str::to_string),
            status,
            expires_at,
            bound_at: None,
            profile_id: None,
        }
    }

    #[test]
    fn classifies_prefixed_and_bare_codes() {
        assert_eq!(
            classify_message("seat:SC-ABC123"),
            InboundKind::SeatCode("SC-ABC123".to_string())
        );
        assert_eq!(
            classify_message("  Seat: sc-abc123  "),
            InboundKind::SeatCode("SC-ABC123".to_string())
        );
        assert_eq!(
            classify_message("sc-abc123"),
            InboundKind::SeatCode("SC-ABC123".to_string())
        );
    }

    #[test]
    fn ordinary_text_is_chat() {
        assert_eq!(classify_message("Hello there"), InboundKind::Chat);
        assert_eq!(classify_message("seat: not a code"), InboundKind::Chat);
        assert_eq!(classify_message("SC-"), InboundKind::Chat);
        assert_eq!(classify_message(""), InboundKind::Chat);
    }

    #[test]
    fn unknown_code_not_found() {
        let now = Utc::now();
        assert_eq!(
            binding_outcome(None, "+15551234567", now),
            BindingOutcome::CodeNotFound
        );
    }

    #[test]
    fn fresh_seat_binds() {
        let now = Utc::now();
        let seat = seat(None, SeatStatus::Pending, None);
        assert_eq!(
            binding_outcome(Some(&seat), "+15551234567", now),
            BindingOutcome::Bind { rebind: false }
        );
    }

    #[test]
    fn same_phone_rebind_is_tolerated() {
        let now = Utc::now();
        let seat = seat(Some("+15551234567"), SeatStatus::Active, None);
        assert_eq!(
            binding_outcome(Some(&seat), "+15551234567", now),
            BindingOutcome::Bind { rebind: true }
        );
    }

    #[test]
    fn other_phone_never_rebinds() {
        let now = Utc::now();
        let seat = seat(Some("+15551234567"), SeatStatus::Active, None);
        assert_eq!(
            binding_outcome(Some(&seat), "+15559999999", now),
            BindingOutcome::LinkedElsewhere
        );
    }

    #[test]
    fn past_expiry_blocks_binding_regardless_of_stored_status() {
        let now = Utc::now();
        let seat = seat(None, SeatStatus::Active, Some(now - Duration::hours(1)));
        assert_eq!(
            binding_outcome(Some(&seat), "+15551234567", now),
            BindingOutcome::Expired
        );
    }

    #[test]
    fn chat_access_reflects_effective_status() {
        let now = Utc::now();
        assert_eq!(chat_access(None, now), ChatAccess::NoSeat);

        let active = seat(Some("+15551234567"), SeatStatus::Active, None);
        assert_eq!(chat_access(Some(&active), now), ChatAccess::Allowed);

        let pending = seat(Some("+15551234567"), SeatStatus::Pending, None);
        assert_eq!(chat_access(Some(&pending), now), ChatAccess::Allowed);

        let revoked = seat(Some("+15551234567"), SeatStatus::Revoked, None);
        assert_eq!(chat_access(Some(&revoked), now), ChatAccess::Revoked);

        let lapsed = seat(
            Some("+15551234567"),
            SeatStatus::Active,
            Some(now - Duration::minutes(5)),
        );
        assert_eq!(chat_access(Some(&lapsed), now), ChatAccess::Expired);
    }

    #[test]
    fn usable_seat_wins_over_newer_revoked_row() {
        let now = Utc::now();
        let mut revoked = seat(Some("+15551234567"), SeatStatus::Revoked, None);
        revoked.id = "seat-revoked".to_string();
        revoked.bound_at = Some(now);
        let mut active = seat(Some("+15551234567"), SeatStatus::Active, None);
        active.id = "seat-active".to_string();
        active.bound_at = Some(now - Duration::days(30));
        // rows arrive most recently bound first
        let seats = vec![revoked, active];
        let picked = select_chat_seat(&seats, now);
        assert_eq!(picked.map(|s| s.id.as_str()), Some("seat-active"));
    }

    #[test]
    fn without_usable_seat_most_recent_row_stands() {
        let now = Utc::now();
        let mut revoked = seat(Some("+15551234567"), SeatStatus::Revoked, None);
        revoked.id = "seat-revoked".to_string();
        let seats = vec![revoked];
        let picked = select_chat_seat(&seats, now);
        assert_eq!(picked.map(|s| s.id.as_str()), Some("seat-revoked"));
        assert!(select_chat_seat(&[], now).is_none());
    }

    #[test]
    fn session_window_policy() {
        let now = Utc::now();
        assert!(session_window_open(None, now));
        assert!(session_window_open(Some(now - Duration::hours(23)), now));
        assert!(!session_window_open(Some(now - Duration::hours(25)), now));
    }
}
