use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use minijinja::context;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::ai::{self, AiReply};
use crate::binding::{
    self, BindingOutcome, ChatAccess, InboundKind, SESSION_WINDOW_HOURS,
};
use crate::guard::{GuardState, IdempotencyStatus, InboundGate};
use crate::outbound;
use crate::phone::normalize_phone;
use crate::signature::verify_signature;
use crate::store;
use crate::templates::MessageTemplates;
use crate::types::{
    AiConfig, AppConfig, AppState, Direction, InboundMessage, MessageType, ProviderConfig, Seat,
    SeatStatus,
};

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "seatline".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn load_config() -> AppConfig {
    let provider = ProviderConfig {
        api_base: env_or("PROVIDER_API_BASE", "https://api.twilio.com"),
        account_sid: env_or("PROVIDER_ACCOUNT_SID", ""),
        auth_token: env_or("PROVIDER_AUTH_TOKEN", ""),
        from_number: env_or("PROVIDER_FROM_NUMBER", ""),
        webhook_url: env_or("WEBHOOK_PUBLIC_URL", ""),
        sandbox_account_sids: env_or("SANDBOX_ACCOUNT_SIDS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    };
    let ai = AiConfig {
        base_url: env_or("AI_BACKEND_URL", "http://localhost:8080"),
        timeout_secs: env_or("AI_TIMEOUT_SECS", "15").parse().unwrap_or(15),
        max_retries: env_or("AI_MAX_RETRIES", "2").parse().unwrap_or(2),
    };
    AppConfig {
        provider,
        ai,
        default_country_code: env_or("DEFAULT_COUNTRY_CODE", "1"),
        rate_limit: env_or("RATE_LIMIT", "20").parse().unwrap_or(20),
        rate_window_secs: env_or("RATE_WINDOW_SECS", "60").parse().unwrap_or(60),
        segment_limit: env_or("SEGMENT_LIMIT", "4096")
            .parse()
            .unwrap_or(outbound::DEFAULT_SEGMENT_LIMIT),
        support_contact: env_or("SUPPORT_CONTACT", "support@seatline.example"),
    }
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let config = load_config();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        http: reqwest::Client::new(),
        guards: Mutex::new(GuardState::default()),
        templates: MessageTemplates::load(),
        config,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhook/whatsapp", post(whatsapp_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    println!("seatline server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Inbound provider webhook. The response code only reports whether the
/// request itself was authentic and well-formed; every business outcome
/// past gating is a 200 so the provider never redelivers on our policy
/// failures.
async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let msg = InboundMessage::from_params(&params);

    let sandbox = state
        .config
        .provider
        .sandbox_account_sids
        .iter()
        .any(|sid| *sid == msg.account_sid);
    if !sandbox {
        let signature_header = headers
            .get("x-twilio-signature")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(
            &state.config.provider.auth_token,
            signature_header,
            &state.config.provider.webhook_url,
            &params,
        ) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let Ok(phone) = normalize_phone(&msg.from, &state.config.default_country_code) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let now = Utc::now();
    let gate = {
        let mut guards = state.guards.lock().await;
        guards.gate_inbound(
            &msg.message_sid,
            &phone,
            state.config.rate_limit,
            Duration::seconds(state.config.rate_window_secs),
            now,
        )
    };

    match gate {
        InboundGate::Duplicate(IdempotencyStatus::InFlight) => {
            // Concurrent duplicate delivery; the first copy is still being
            // handled, so acknowledge without processing again.
            eprintln!("duplicate in-flight delivery for {}", msg.message_sid);
            return StatusCode::OK.into_response();
        }
        InboundGate::Duplicate(_) => {
            // Redelivery of an already-handled message.
            return StatusCode::OK.into_response();
        }
        InboundGate::RateLimited(rate) => {
            if rate.first_denial {
                let state = state.clone();
                let notice = state.templates.render("rate_limited", context! {});
                let phone = phone.clone();
                tokio::spawn(async move {
                    outbound::dispatch_reply(&state, None, &phone, &notice, MessageType::System)
                        .await;
                });
            }
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
        InboundGate::Accepted => {}
    }

    // Accepted. Webhooks are fire-and-forget from the provider's side, so
    // the pipeline runs detached and the provider gets its 200 immediately.
    tokio::spawn(process_inbound(state, msg, phone));
    StatusCode::OK.into_response()
}

async fn process_inbound(state: Arc<AppState>, msg: InboundMessage, phone: String) {
    match binding::classify_message(&msg.body) {
        InboundKind::SeatCode(code) => handle_binding(&state, &msg, &phone, &code).await,
        InboundKind::Chat => handle_chat(&state, &msg, &phone).await,
    }
    if !msg.message_sid.is_empty() {
        let mut guards = state.guards.lock().await;
        guards.mark_processed(&msg.message_sid, Utc::now());
    }
}

async fn log_inbound(
    state: &Arc<AppState>,
    msg: &InboundMessage,
    phone: &str,
    seat_id: Option<&str>,
    message_type: MessageType,
) {
    let entry = store::new_log_entry(
        seat_id,
        phone,
        Direction::Inbound,
        &msg.body,
        message_type,
        &msg.message_sid,
    );
    if let Err(err) = store::insert_log(state, &entry).await {
        eprintln!("inbound log write failed: {err}");
    }
}

async fn handle_binding(state: &Arc<AppState>, msg: &InboundMessage, phone: &str, code: &str) {
    let now = Utc::now();
    let seat = store::find_seat_by_code(state, code).await;
    log_inbound(
        state,
        msg,
        phone,
        seat.as_ref().map(|s| s.id.as_str()),
        MessageType::Binding,
    )
    .await;

    let Some(seat) = seat else {
        let reply = state.templates.render("code_not_recognized", context! {});
        outbound::dispatch_reply(state, None, phone, &reply, MessageType::System).await;
        return;
    };

    match binding::binding_outcome(Some(&seat), phone, now) {
        BindingOutcome::CodeNotFound => {
            let reply = state.templates.render("code_not_recognized", context! {});
            outbound::dispatch_reply(state, None, phone, &reply, MessageType::System).await;
        }
        BindingOutcome::Expired => {
            if seat.status != SeatStatus::Expired {
                store::mark_seat_expired(state, &seat.id).await;
            }
            let reply = state.templates.render("seat_expired", context! {});
            outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                .await;
        }
        BindingOutcome::Revoked => {
            let reply = state.templates.render("seat_revoked", context! {});
            outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                .await;
        }
        BindingOutcome::LinkedElsewhere => {
            let reply = state.templates.render("code_linked_elsewhere", context! {});
            outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                .await;
        }
        BindingOutcome::Bind { rebind } => {
            if let Err(err) = store::bind_seat(state, &seat.id, phone, now).await {
                eprintln!("seat bind failed for {code}: {err}");
                let reply = state.templates.render("system_error", context! {});
                outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                    .await;
                return;
            }
            if rebind {
                eprintln!("seat {code} rebound to its own phone");
            }
            let profile = match seat.profile_id.as_deref() {
                Some(profile_id) => store::find_profile(state, profile_id).await,
                None => None,
            };
            let (name, show) = profile
                .map(|p| (p.name, p.show_name))
                .unwrap_or_default();
            let reply = state
                .templates
                .render("binding_confirmed", context! { name => name, show => show });
            outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::Binding)
                .await;
        }
    }
}

async fn handle_chat(state: &Arc<AppState>, msg: &InboundMessage, phone: &str) {
    let now = Utc::now();
    let seats = store::find_seats_by_phone(state, phone).await;
    let seat = binding::select_chat_seat(&seats, now).cloned();

    let Some(seat) = seat else {
        log_inbound(state, msg, phone, None, MessageType::Chat).await;
        let reply = state.templates.render("number_not_enabled", context! {});
        outbound::dispatch_reply(state, None, phone, &reply, MessageType::System).await;
        return;
    };

    match binding::chat_access(Some(&seat), now) {
        ChatAccess::NoSeat => {
            let reply = state.templates.render("number_not_enabled", context! {});
            outbound::dispatch_reply(state, None, phone, &reply, MessageType::System).await;
        }
        ChatAccess::Expired => {
            log_inbound(state, msg, phone, Some(&seat.id), MessageType::Chat).await;
            if seat.status != SeatStatus::Expired {
                store::mark_seat_expired(state, &seat.id).await;
            }
            let reply = state.templates.render("seat_expired", context! {});
            outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                .await;
        }
        ChatAccess::Revoked => {
            log_inbound(state, msg, phone, Some(&seat.id), MessageType::Chat).await;
            let reply = state.templates.render("seat_revoked", context! {});
            outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                .await;
        }
        ChatAccess::Allowed => {
            // Window policy needs the previous inbound, so fetch it before
            // this message is logged.
            let previous_inbound = store::last_inbound_at(state, &seat.id).await;
            log_inbound(state, msg, phone, Some(&seat.id), MessageType::Chat).await;

            if !binding::session_window_open(previous_inbound, now) {
                let reply = state.templates.render("resume_session", context! {});
                outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                    .await;
                return;
            }
            answer_chat(state, &seat, phone, &msg.body).await;
        }
    }
}

async fn answer_chat(state: &Arc<AppState>, seat: &Seat, phone: &str, statement: &str) {
    let profile = match seat.profile_id.as_deref() {
        Some(profile_id) => store::find_profile(state, profile_id).await,
        None => None,
    };

    let reply = ai::generate_reply(
        &state.http,
        &state.config.ai,
        seat,
        profile.as_ref(),
        statement,
    )
    .await;

    match reply {
        AiReply::Escalate => {
            let reply = state.templates.render(
                "escalation",
                context! { support_contact => state.config.support_contact },
            );
            outbound::dispatch_reply(state, Some(&seat.id), phone, &reply, MessageType::System)
                .await;
        }
        AiReply::Answer(text) => {
            let since = Utc::now() - Duration::hours(SESSION_WINDOW_HOURS);
            let already_sent =
                store::outbound_contains_since(state, &seat.id, ai::DISCLAIMER, since).await;
            let final_text = ai::apply_disclaimer(&text, already_sent);
            outbound::dispatch_reply(state, Some(&seat.id), phone, &final_text, MessageType::Chat)
                .await;
        }
    }
}
