//! HTTP surface of the bot.
//!
//! | route               | purpose                                            |
//! |---------------------|----------------------------------------------------|
//! | `GET /`             | liveness text                                      |
//! | `GET /{secret}`     | basic-auth protected `pong`, used by the self-test |
//! | `POST /{platform}`  | platform webhook, queued raw on `updates`          |
//! | `POST /chat`        | reply text for `X-Channel`/`X-Destination`         |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use axum::{
    Extension, Router,
    body::Bytes,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use channel_message::{Channel, InboundEvent, OutboundMessage, ReplyTarget};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::context::SharedContext;
use crate::error::BotError;
use crate::meow::{Style, meow_say};
use crate::shutdown::WorkerState;
use crate::supervisor::WorkerContext;

pub const PING_USER: &str = "BigMeow";
pub const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
pub const CHANNEL_HEADER: &str = "x-channel";
pub const DESTINATION_HEADER: &str = "x-destination";

const SELF_TEST_ATTEMPTS: u32 = 3;
const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/", get(index_get))
        .route("/chat", post(chat_post))
        .route("/{segment}", get(ping_get).post(webhook_post))
        .layer(Extension(ctx))
        .layer(TraceLayer::new_for_http())
}

async fn index_get() -> &'static str {
    "Hello world"
}

fn basic_auth_matches(headers: &HeaderMap, password: &str) -> bool {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    decoded.split_once(':') == Some((PING_USER, password))
}

async fn ping_get(
    Extension(ctx): Extension<SharedContext>,
    Path(segment): Path<String>,
    headers: HeaderMap,
) -> Response {
    if segment != ctx.settings.web_secret_ping {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(password) = &ctx.settings.web_secret_password {
        if !basic_auth_matches(&headers, password) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"bigmeow\"")],
            )
                .into_response();
        }
    }
    "pong".into_response()
}

async fn webhook_post(
    Extension(ctx): Extension<SharedContext>,
    Path(segment): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(channel) = Channel::from_str(&segment) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !ctx.settings.toggles.channel(channel) {
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Some(expected) = ctx.settings.inbound_secret(channel) {
        let header_name = match channel {
            Channel::Telegram => TELEGRAM_SECRET_HEADER,
            Channel::Discord | Channel::Slack => WEBHOOK_SECRET_HEADER,
        };
        let given = headers.get(header_name).and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            warn!(%channel, "webhook rejected: bad secret");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%channel, error = %e, "webhook body is not json");
            return (StatusCode::BAD_REQUEST, "invalid json").into_response();
        }
    };

    let kind = payload.get("type").and_then(Value::as_str);
    if channel == Channel::Slack && kind == Some("url_verification") {
        let challenge = payload
            .get("challenge")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return challenge.into_response();
    }

    info!(%channel, "webhook received an update");
    match ctx
        .queues
        .for_channel(channel)
        .updates
        .put(InboundEvent::new(channel, payload))
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(%channel, error = %e, "cannot queue update");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn chat_post(
    Extension(ctx): Extension<SharedContext>,
    headers: HeaderMap,
    text: String,
) -> Response {
    let header_value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let Some(channel) = header_value(CHANNEL_HEADER).and_then(|c| Channel::from_str(c).ok())
    else {
        return (StatusCode::BAD_REQUEST, "invalid channel").into_response();
    };
    let target = match header_value(DESTINATION_HEADER).map(ReplyTarget::from_destination) {
        Some(Ok(target)) => target,
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        None => return (StatusCode::BAD_REQUEST, "missing destination").into_response(),
    };
    if !ctx.settings.toggles.channel(channel) {
        return (StatusCode::NOT_FOUND, "channel is disabled").into_response();
    }

    info!(%channel, destination = %target.to_destination(), "sending chat message");
    let message = OutboundMessage {
        channel,
        target,
        text: meow_say(&text, Style::Say, true),
    };
    match ctx.queues.for_channel(channel).messages.put(message) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!(%channel, error = %e, "cannot queue chat message");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Fetches the secret ping route through the public webhook URL.
pub async fn check_is_reachable(ctx: &SharedContext) -> Result<(), BotError> {
    let settings = &ctx.settings;
    let Some(base) = &settings.webhook_url else {
        warn!("no webhook url; skipping reachability self-test");
        return Ok(());
    };
    let url = format!("{base}/{}", settings.web_secret_ping);
    let client = reqwest::Client::builder()
        .timeout(SELF_TEST_TIMEOUT)
        .build()
        .map_err(|e| BotError::fatal("web", format!("http client: {e}")))?;

    let mut last_error = String::new();
    for attempt in 1..=SELF_TEST_ATTEMPTS {
        let mut request = client.get(&url);
        if let Some(password) = &settings.web_secret_password {
            request = request.basic_auth(PING_USER, Some(password));
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                if body.trim() == "pong" {
                    info!(attempt, "web application is up and reachable");
                    return Ok(());
                }
                last_error = format!("unexpected body {body:?}");
            }
            Ok(response) => last_error = format!("status {}", response.status()),
            Err(e) => last_error = e.to_string(),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(BotError::fatal("web", format!("website is unreachable: {last_error}")))
}

/// The web worker: serves until the exit signal, then shuts down gracefully.
pub async fn run_web(ctx: SharedContext, worker: WorkerContext) -> Result<(), BotError> {
    let exit = worker.exit();
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.settings.webhook_port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            worker.set_state(WorkerState::Failed);
            return Err(BotError::fatal(worker.name(), format!("bind {addr}: {e}")));
        }
    };
    info!(%addr, "web server is starting");

    let shutdown = exit.clone();
    let serve = axum::serve(listener, router(ctx.clone()))
        .with_graceful_shutdown(async move { shutdown.wait().await });
    let mut server = tokio::spawn(async move { serve.await });
    worker.set_state(WorkerState::Running);

    if ctx.settings.web_self_test {
        tokio::select! {
            _ = exit.wait() => info!("shutdown requested during the self-test"),
            checked = check_is_reachable(&ctx) => {
                if let Err(e) = checked {
                    worker.set_state(WorkerState::Failed);
                    server.abort();
                    return Err(e);
                }
            }
        }
    }

    tokio::select! {
        _ = exit.wait() => {}
        ended = &mut server => {
            worker.set_state(WorkerState::Failed);
            return Err(BotError::fatal(worker.name(), format!("server ended: {ended:?}")));
        }
    }

    info!("web server is stopping");
    worker.set_state(WorkerState::Stopping);
    match tokio::time::timeout(ctx.settings.shutdown_grace / 2, &mut server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "web server stopped with an error"),
        Ok(Err(e)) => warn!(error = %e, "web server task failed"),
        Err(_) => {
            warn!("open connections did not close in time");
            server.abort();
        }
    }
    worker.set_state(WorkerState::Stopped);
    Ok(())
}
