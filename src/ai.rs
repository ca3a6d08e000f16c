use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::types::{AiConfig, Profile, Seat};

/// AI answering-backend orchestration: red-flag screening, bounded context
/// construction, the retried backend call, and defensive parsing of the
/// backend's heterogeneous response framings.

const FIELD_CAP: usize = 200;
const CONTEXT_CAP: usize = 3000;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 250;
const RETRY_AFTER_CAP_SECS: u64 = 30;

/// Medical-emergency indicators. Any hit bypasses the backend entirely and
/// escalates; this gate runs before everything else.
const RED_FLAG_TERMS: &[&str] = &[
    "chest pain",
    "can't breathe",
    "cant breathe",
    "cannot breathe",
    "difficulty breathing",
    "shortness of breath",
    "heart attack",
    "stroke",
    "seizure",
    "unconscious",
    "passed out",
    "severe bleeding",
    "bleeding heavily",
    "overdose",
    "suicide",
    "suicidal",
    "kill myself",
    "self-harm",
    "allergic reaction",
    "anaphyla",
];

pub const FALLBACK_REPLY: &str = "We're having a technical difficulty on our side right now. \
     Please try again in a few minutes, or contact support if it keeps happening.";

pub const DISCLAIMER: &str = "Reminder: this assistant shares general wellness guidance and is \
     not a substitute for professional medical advice.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiReply {
    /// Red-flag hit; the caller sends the escalation template instead.
    Escalate,
    /// Parsed backend answer, or the fallback string on persistent failure.
    Answer(String),
}

pub fn contains_red_flag(text: &str) -> bool {
    let lowered = text.to_lowercase();
    RED_FLAG_TERMS.iter().any(|term| lowered.contains(term))
}

pub async fn generate_reply(
    http: &reqwest::Client,
    config: &AiConfig,
    seat: &Seat,
    profile: Option<&Profile>,
    statement: &str,
) -> AiReply {
    if contains_red_flag(statement) {
        return AiReply::Escalate;
    }
    let context = build_context(profile);
    let statement = normalize_whitespace(statement);
    match call_backend(http, config, seat, &context, &statement).await {
        Ok(raw) => {
            let parsed = parse_response(&raw);
            if parsed.trim().is_empty() {
                AiReply::Answer(FALLBACK_REPLY.to_string())
            } else {
                AiReply::Answer(parsed)
            }
        }
        Err(err) => {
            eprintln!("ai backend failed after retries: {err}");
            AiReply::Answer(FALLBACK_REPLY.to_string())
        }
    }
}

/// Prepend the disclaimer unless one already went out to this seat within
/// the rolling window.
pub fn apply_disclaimer(reply: &str, already_sent_recently: bool) -> String {
    if already_sent_recently || reply.contains(DISCLAIMER) {
        reply.to_string()
    } else {
        format!("{DISCLAIMER}\n\n{reply}")
    }
}

/// Bounded personalization block: each field individually capped, the
/// whole block hard-capped with a truncation marker.
pub fn build_context(profile: Option<&Profile>) -> String {
    let Some(profile) = profile else {
        return String::new();
    };
    let fields = [
        ("Name", &profile.name),
        ("Role", &profile.role),
        ("Show", &profile.show_name),
        ("Performer type", &profile.performer_type),
        ("Goals", &profile.goals),
        ("Sleep environment", &profile.sleep_environment),
        ("Dietary constraints", &profile.dietary_constraints),
        ("Injury notes", &profile.injury_notes),
    ];
    let mut block = String::new();
    for (label, value) in fields {
        let value = normalize_whitespace(value);
        if value.is_empty() {
            continue;
        }
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(label);
        block.push_str(": ");
        block.push_str(&cap_chars(&value, FIELD_CAP));
    }
    cap_chars(&block, CONTEXT_CAP)
}

fn cap_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let mut capped: String = text.chars().take(cap).collect();
    capped.push('…');
    capped
}

fn normalize_whitespace(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut in_run = false;
    for ch in unified.chars() {
        if ch == ' ' || ch == '\t' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out.trim().to_string()
}

async fn call_backend(
    http: &reqwest::Client,
    config: &AiConfig,
    seat: &Seat,
    context: &str,
    statement: &str,
) -> Result<String, String> {
    let url = format!("{}/answer", config.base_url.trim_end_matches('/'));
    let mut attempt = 0u32;
    loop {
        let payload = json!({
            "statement": statement,
            "context": context,
            "request_id": Uuid::new_v4().to_string(),
            "session_id": seat.id,
            "seat_code": seat.seat_code,
            "stream": true,
            "locale": "en-US",
            "timezone": "UTC",
        });
        let result = http
            .post(&url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.text().await.map_err(|err| err.to_string());
                }
                let retryable = status.is_server_error() || status.as_u16() == 429;
                if !retryable || attempt >= config.max_retries {
                    return Err(format!("ai backend returned {status}"));
                }
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                tokio::time::sleep(backoff_delay(attempt, retry_after)).await;
            }
            Err(err) => {
                if attempt >= config.max_retries {
                    return Err(format!("ai request failed: {err}"));
                }
                tokio::time::sleep(backoff_delay(attempt, None)).await;
            }
        }
        attempt += 1;
    }
}

fn backoff_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_secs(secs.min(RETRY_AFTER_CAP_SECS));
    }
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// The backend replies in one of several framings. The variant is resolved
/// by pure content sniffing, with one parser per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    UrlEncodedChunks,
    ServerSentEvents,
    Json,
    Plain,
}

pub fn classify_response(body: &str) -> ResponseFormat {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with("[{") {
        return ResponseFormat::Json;
    }
    if body
        .lines()
        .any(|line| line.trim_start().starts_with("data:"))
    {
        return ResponseFormat::ServerSentEvents;
    }
    if body.contains("text=") {
        return ResponseFormat::UrlEncodedChunks;
    }
    ResponseFormat::Plain
}

pub fn parse_response(body: &str) -> String {
    let text = match classify_response(body) {
        ResponseFormat::UrlEncodedChunks => parse_url_encoded_chunks(body),
        ResponseFormat::ServerSentEvents => parse_sse(body),
        ResponseFormat::Json => parse_json(body),
        ResponseFormat::Plain => body.to_string(),
    };
    strip_artifacts(&text)
}

fn parse_url_encoded_chunks(body: &str) -> String {
    let mut out = String::new();
    for piece in body.split(['&', '\n']) {
        let piece = piece.trim();
        if piece == "[DONE]" || piece.starts_with("finish_reason=") {
            break;
        }
        if let Some(encoded) = piece.strip_prefix("text=") {
            out.push_str(&percent_decode(encoded));
        }
    }
    out
}

fn parse_sse(body: &str) -> String {
    let mut out = String::new();
    for line in body.lines() {
        let Some(data) = line.trim_start().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            break;
        }
        if data.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(data) {
                if let Some(delta) = extract_text_field(&value) {
                    out.push_str(&delta);
                    continue;
                }
            }
        }
        out.push_str(data);
    }
    out
}

fn parse_json(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    extract_text_field(&value).unwrap_or_else(|| body.to_string())
}

fn extract_text_field(value: &Value) -> Option<String> {
    for key in ["text", "reply", "answer", "content"] {
        if let Some(text) = value.get(key).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    match value.get("message") {
        Some(Value::String(text)) => return Some(text.clone()),
        Some(message) => {
            if let Some(text) = message.get("content").and_then(Value::as_str) {
                return Some(text.to_string());
            }
        }
        None => {}
    }
    let choice = value.get("choices").and_then(Value::as_array)?.first()?;
    for path in [&["message", "content"][..], &["delta", "content"][..], &["text"][..]] {
        let mut cursor = choice;
        let mut found = true;
        for key in path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(text) = cursor.as_str() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn strip_artifacts(text: &str) -> String {
    let mut cleaned = text.replace("\r\n", "\n").replace("[DONE]", "");
    cleaned = cleaned.replace("text=", "");
    if let Ok(re) = regex::Regex::new(r"finish_reason=\S*") {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    cleaned.trim().to_string()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                // Decode on raw bytes; the escape may sit next to a
                // multibyte char, so string slicing is not safe here.
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
