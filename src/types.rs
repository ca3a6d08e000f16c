use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::templates::MessageTemplates;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatStatus {
    Pending,
    Active,
    Expired,
    Revoked,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Pending => "pending",
            SeatStatus::Active => "active",
            SeatStatus::Expired => "expired",
            SeatStatus::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> SeatStatus {
        match value {
            "active" => SeatStatus::Active,
            "expired" => SeatStatus::Expired,
            "revoked" => SeatStatus::Revoked,
            _ => SeatStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seat {
    pub id: String,
    pub show_id: String,
    pub seat_code: String,
    pub phone: Option<String>,
    pub status: SeatStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub bound_at: Option<DateTime<Utc>>,
    pub profile_id: Option<String>,
}

impl Seat {
    /// Effective status with lazy expiry applied: a seat whose `expires_at`
    /// has passed counts as expired even if the stored row still says
    /// active or pending.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SeatStatus {
        if matches!(self.status, SeatStatus::Revoked | SeatStatus::Expired) {
            return self.status;
        }
        match self.expires_at {
            Some(at) if at <= now => SeatStatus::Expired,
            _ => self.status,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub role: String,
    pub show_name: String,
    pub performer_type: String,
    pub goals: String,
    pub sleep_environment: String,
    pub dietary_constraints: String,
    pub injury_notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Binding,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Binding => "binding",
            MessageType::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: String,
    pub seat_id: Option<String>,
    pub phone: String,
    pub direction: Direction,
    pub body: String,
    pub message_type: MessageType,
    pub provider_sid: String,
    pub created_at: DateTime<Utc>,
}

/// The provider webhook envelope. Field values are pulled out of the raw
/// form parameter map so the same map can feed signature verification.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub message_sid: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub account_sid: String,
}

impl InboundMessage {
    pub fn from_params(params: &HashMap<String, String>) -> InboundMessage {
        let field = |key: &str| params.get(key).cloned().unwrap_or_default();
        InboundMessage {
            message_sid: field("MessageSid"),
            from: field("From"),
            to: field("To"),
            body: field("Body"),
            account_sid: field("AccountSid"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    /// Public URL of the webhook endpoint as the provider sees it; part of
    /// the signed payload.
    pub webhook_url: String,
    /// Account identifiers for which signature verification is bypassed
    /// (provider sandbox / test accounts only).
    pub sandbox_account_sids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub ai: AiConfig,
    pub default_country_code: String,
    pub rate_limit: u32,
    pub rate_window_secs: i64,
    pub segment_limit: usize,
    pub support_contact: String,
}

pub struct AppState {
    pub db: PgPool,
    pub http: reqwest::Client,
    pub guards: Mutex<crate::guard::GuardState>,
    pub templates: MessageTemplates,
    pub config: AppConfig,
}
