use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Process-local idempotency and rate-limit tables. Both live behind the
/// `AppState` mutex and are the only shared mutable state in the pipeline.
/// The contract is narrow (per-key TTL, counter window) so an external KV
/// store could satisfy it for multi-instance deployments.

const IDEMPOTENCY_TTL_HOURS: i64 = 24;
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    /// First sighting; caller should process, then `mark_processed`.
    NotSeen,
    /// Seen but never marked processed (crash before mark); caller may
    /// retry processing.
    InFlight,
    /// Fully processed; caller must short-circuit with success.
    Processed,
}

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    processed: bool,
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RateBucket {
    count: u32,
    window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// True only on the first rejection in a window; used to send the
    /// rate-limited notice once instead of per denied request.
    pub first_denial: bool,
}

/// Admission verdict for one inbound delivery.
#[derive(Debug, Clone, Copy)]
pub enum InboundGate {
    /// Redelivery of a known message id; acknowledge without processing.
    Duplicate(IdempotencyStatus),
    RateLimited(RateDecision),
    Accepted,
}

#[derive(Default)]
pub struct GuardState {
    idempotency: HashMap<String, IdempotencyEntry>,
    rate: HashMap<String, RateBucket>,
}

impl GuardState {
    /// Combined admission check for one inbound delivery. Duplicates are
    /// detected before the rate counter moves, so provider redeliveries
    /// never consume quota, and a rate-denied message is not recorded as
    /// seen, so a later redelivery can still be processed. Messages
    /// without a provider id skip idempotency tracking entirely.
    pub fn gate_inbound(
        &mut self,
        sid: &str,
        phone: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> InboundGate {
        if !sid.is_empty() {
            match self.peek_message(sid, now) {
                IdempotencyStatus::NotSeen => {}
                status => return InboundGate::Duplicate(status),
            }
        }
        let rate = self.check_rate(phone, limit, window, now);
        if !rate.allowed {
            return InboundGate::RateLimited(rate);
        }
        if !sid.is_empty() {
            self.begin_message(sid, now);
        }
        InboundGate::Accepted
    }

    /// Idempotency status of a message id without recording a sighting.
    fn peek_message(&self, sid: &str, now: DateTime<Utc>) -> IdempotencyStatus {
        let ttl = Duration::hours(IDEMPOTENCY_TTL_HOURS);
        match self.idempotency.get(sid) {
            Some(entry) if now - entry.seen_at < ttl => {
                if entry.processed {
                    IdempotencyStatus::Processed
                } else {
                    IdempotencyStatus::InFlight
                }
            }
            _ => IdempotencyStatus::NotSeen,
        }
    }

    /// Report the idempotency status of a provider message id and record
    /// the sighting when it is new.
    pub fn begin_message(&mut self, sid: &str, now: DateTime<Utc>) -> IdempotencyStatus {
        if self.idempotency.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }
        let ttl = Duration::hours(IDEMPOTENCY_TTL_HOURS);
        match self.idempotency.get(sid) {
            Some(entry) if now - entry.seen_at < ttl => {
                if entry.processed {
                    IdempotencyStatus::Processed
                } else {
                    IdempotencyStatus::InFlight
                }
            }
            _ => {
                self.idempotency.insert(
                    sid.to_string(),
                    IdempotencyEntry {
                        processed: false,
                        seen_at: now,
                    },
                );
                IdempotencyStatus::NotSeen
            }
        }
    }

    pub fn mark_processed(&mut self, sid: &str, now: DateTime<Utc>) {
        self.idempotency.insert(
            sid.to_string(),
            IdempotencyEntry {
                processed: true,
                seen_at: now,
            },
        );
    }

    /// Fixed-window counter per canonical phone.
    pub fn check_rate(
        &mut self,
        phone: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let bucket = self
            .rate
            .entry(phone.to_string())
            .or_insert_with(|| RateBucket {
                count: 0,
                window_start: now,
            });
        if now - bucket.window_start >= window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        let reset_at = bucket.window_start + window;
        if bucket.count >= limit {
            bucket.count += 1;
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                first_denial: bucket.count == limit + 1,
            };
        }
        bucket.count += 1;
        RateDecision {
            allowed: true,
            remaining: limit - bucket.count,
            reset_at,
            first_denial: false,
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) {
        let ttl = Duration::hours(IDEMPOTENCY_TTL_HOURS);
        self.idempotency.retain(|_, entry| now - entry.seen_at < ttl);
        self.rate
            .retain(|_, bucket| now - bucket.window_start < Duration::hours(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_three_states() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        assert_eq!(guards.begin_message("SM1", now), IdempotencyStatus::NotSeen);
        assert_eq!(guards.begin_message("SM1", now), IdempotencyStatus::InFlight);
        guards.mark_processed("SM1", now);
        assert_eq!(
            guards.begin_message("SM1", now),
            IdempotencyStatus::Processed
        );
    }

    #[test]
    fn idempotency_entries_expire_after_ttl() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        guards.begin_message("SM1", now);
        guards.mark_processed("SM1", now);
        let later = now + Duration::hours(25);
        assert_eq!(
            guards.begin_message("SM1", later),
            IdempotencyStatus::NotSeen
        );
    }

    #[test]
    fn rate_limit_counts_down_and_denies() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        let window = Duration::seconds(60);
        for expected_remaining in [2u32, 1, 0] {
            let decision = guards.check_rate("+15551234567", 3, window, now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = guards.check_rate("+15551234567", 3, window, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, now + window);
        assert!(denied.first_denial);
        let denied_again = guards.check_rate("+15551234567", 3, window, now);
        assert!(!denied_again.first_denial);
    }

    #[test]
    fn rate_window_resets() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        let window = Duration::seconds(60);
        for _ in 0..3 {
            guards.check_rate("+15551234567", 3, window, now);
        }
        assert!(!guards.check_rate("+15551234567", 3, window, now).allowed);
        let later = now + Duration::seconds(61);
        assert!(guards.check_rate("+15551234567", 3, window, later).allowed);
    }

    #[test]
    fn redeliveries_do_not_consume_rate_quota() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        let window = Duration::seconds(60);
        let phone = "+15551234567";
        assert!(matches!(
            guards.gate_inbound("SM1", phone, 2, window, now),
            InboundGate::Accepted
        ));
        guards.mark_processed("SM1", now);
        for _ in 0..5 {
            assert!(matches!(
                guards.gate_inbound("SM1", phone, 2, window, now),
                InboundGate::Duplicate(IdempotencyStatus::Processed)
            ));
        }
        // only the one accepted message counted against the limit of 2
        assert!(matches!(
            guards.gate_inbound("SM2", phone, 2, window, now),
            InboundGate::Accepted
        ));
    }

    #[test]
    fn rate_denied_message_is_not_marked_seen() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        let window = Duration::seconds(60);
        let phone = "+15551234567";
        assert!(matches!(
            guards.gate_inbound("SM1", phone, 1, window, now),
            InboundGate::Accepted
        ));
        assert!(matches!(
            guards.gate_inbound("SM2", phone, 1, window, now),
            InboundGate::RateLimited(_)
        ));
        // the provider's redelivery after the window still gets through
        let later = now + Duration::seconds(61);
        assert!(matches!(
            guards.gate_inbound("SM2", phone, 1, window, later),
            InboundGate::Accepted
        ));
    }

    #[test]
    fn messages_without_id_are_never_treated_as_duplicates() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        let window = Duration::seconds(60);
        for _ in 0..3 {
            assert!(matches!(
                guards.gate_inbound("", "+15551234567", 10, window, now),
                InboundGate::Accepted
            ));
        }
    }

    #[test]
    fn rate_buckets_are_per_phone() {
        let mut guards = GuardState::default();
        let now = Utc::now();
        let window = Duration::seconds(60);
        guards.check_rate("+15551111111", 1, window, now);
        assert!(!guards.check_rate("+15551111111", 1, window, now).allowed);
        assert!(guards.check_rate("+15552222222", 1, window, now).allowed);
    }
}
