//! HTTP surface: the shared webhook endpoint and the management API.
//!
//! The webhook pipeline is strictly ordered: resolve the path token,
//! check the secret header, check the delivery mode, parse, enqueue. Once
//! the token and secret check out the response is always 200 so the
//! provider never retry-storms over downstream trouble.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::error::{ApiError, DispatchError};
use super::health::DeliveryEvent;
use super::registry::ResumeMode;
use crate::FleetCore;
use crate::models::{BotToken, DeliveryMode, DeliveryPath, HealthAlert, InboundUpdate};
use crate::telegram::types::TelegramUpdate;

/// Header Telegram echoes back on every webhook request.
pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

const ALERT_LIST_LIMIT: usize = 100;

/// Build the engine's HTTP router.
pub fn app(core: Arc<FleetCore>) -> Router {
    let cors = cors_layer(&core.config.server.cors_origins);

    Router::new()
        .route("/webhook/{path_token}", post(receive_update))
        .route("/api/bots", get(list_bots).post(create_bot))
        .route("/api/bots/{bot_id}", delete(remove_bot))
        .route("/api/bots/{bot_id}/mode", get(bot_mode))
        .route("/api/bots/{bot_id}/webhook/enable", post(enable_webhook))
        .route("/api/bots/{bot_id}/webhook/disable", post(disable_webhook))
        .route("/api/health", get(engine_health))
        .route("/api/health/bots", get(fleet_health))
        .route("/api/health/bots/{bot_id}", get(bot_health))
        .route("/api/health/alerts", get(recent_alerts))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(core)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Same length and same bytes, compared without early exit.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let a = provided.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn receive_update(
    State(core): State<Arc<FleetCore>>,
    Path(path_token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(bot) = core.registry.resolve_path_token(&path_token) else {
        return Err(DispatchError::AuthenticationFailure.into());
    };

    let provided = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !secrets_match(provided, &bot.webhook_secret) {
        core.recorder.record(DeliveryEvent::rejected(
            &bot.bot_id,
            DeliveryPath::Push,
            "signature_mismatch",
        ));
        return Err(DispatchError::SignatureMismatch.into());
    }

    let mode = core
        .registry
        .committed_mode(&bot.bot_id)
        .map_err(|_| DispatchError::AuthenticationFailure)?;
    if mode != DeliveryMode::Webhook {
        core.recorder.record(DeliveryEvent::rejected(
            &bot.bot_id,
            DeliveryPath::Push,
            "mode_mismatch",
        ));
        return Err(DispatchError::ModeMismatch {
            bot_id: bot.bot_id.clone(),
            mode,
        }
        .into());
    }

    let payload: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            core.recorder.record(DeliveryEvent::rejected(
                &bot.bot_id,
                DeliveryPath::Push,
                "malformed_payload",
            ));
            return Err(DispatchError::MalformedPayload(err.to_string()).into());
        }
    };

    core.recorder
        .record(DeliveryEvent::accepted(&bot.bot_id, DeliveryPath::Push));
    let update = InboundUpdate::new(&bot.bot_id, payload, DeliveryPath::Push);
    let update_id = update.update_id;
    if let Err(err) = core.router.enqueue(update) {
        // Token and secret were valid; ack anyway so the provider does not
        // retry-storm while we are saturated.
        warn!(bot_id = %bot.bot_id, update_id, error = %err, "webhook update refused by router");
        core.recorder.record(DeliveryEvent::failed(
            &bot.bot_id,
            DeliveryPath::Push,
            "queue_full",
        ));
    } else {
        debug!(bot_id = %bot.bot_id, update_id, "webhook update accepted");
    }

    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
struct CreateBotRequest {
    bot_id: String,
    token: String,
}

async fn create_bot(
    State(core): State<Arc<FleetCore>>,
    Json(request): Json<CreateBotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bot = core
        .registry
        .register(&request.bot_id, BotToken::new(request.token))?;
    Ok((StatusCode::CREATED, Json(json!({ "bot": bot.summary() }))))
}

async fn remove_bot(
    State(core): State<Arc<FleetCore>>,
    Path(bot_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    core.registry.deregister(&bot_id).await?;
    Ok(Json(json!({ "deleted": bot_id })))
}

async fn list_bots(
    State(core): State<Arc<FleetCore>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bots: Vec<serde_json::Value> = core
        .registry
        .list()
        .into_iter()
        .map(|bot| {
            let mut summary = bot.summary();
            summary.mode = core
                .registry
                .committed_mode(&bot.bot_id)
                .unwrap_or(summary.mode);
            json!({
                "bot": summary,
                "polling_active": core.scheduler.is_running(&bot.bot_id),
            })
        })
        .collect();
    Ok(Json(json!({ "bots": bots })))
}

async fn bot_mode(
    State(core): State<Arc<FleetCore>>,
    Path(bot_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mode = core.registry.committed_mode(&bot_id)?;
    Ok(Json(json!({
        "bot_id": bot_id,
        "mode": mode.as_str(),
        "polling_active": core.scheduler.is_running(&bot_id),
    })))
}

async fn enable_webhook(
    State(core): State<Arc<FleetCore>>,
    Path(bot_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let transition = core.registry.enable_webhook(&bot_id).await?;
    Ok(Json(json!({
        "bot_id": bot_id,
        "mode": DeliveryMode::Webhook.as_str(),
        "changed": transition.changed(),
    })))
}

#[derive(Debug, Deserialize)]
struct DisableParams {
    resume: Option<String>,
}

async fn disable_webhook(
    State(core): State<Arc<FleetCore>>,
    Path(bot_id): Path<String>,
    Query(params): Query<DisableParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resume = match params.resume.as_deref() {
        None | Some("polling") => ResumeMode::Polling,
        Some("disabled") => ResumeMode::Disabled,
        Some(other) => {
            return Err(DispatchError::Configuration(format!(
                "resume must be polling or disabled, got {other:?}"
            ))
            .into());
        }
    };

    let transition = core.registry.disable_webhook(&bot_id, resume).await?;
    let mode = core.registry.committed_mode(&bot_id)?;
    Ok(Json(json!({
        "bot_id": bot_id,
        "mode": mode.as_str(),
        "changed": transition.changed(),
    })))
}

async fn engine_health(State(core): State<Arc<FleetCore>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_ms": core.uptime_ms(),
        "bots": core.registry.list().len(),
        "queue_depth": core.router.depth(),
    }))
}

async fn fleet_health(State(core): State<Arc<FleetCore>>) -> Json<serde_json::Value> {
    let bots = core.registry.list();
    Json(json!({ "bots": core.aggregator.snapshot_all(&bots) }))
}

async fn bot_health(
    State(core): State<Arc<FleetCore>>,
    Path(bot_id): Path<String>,
) -> Result<Json<crate::models::BotHealth>, ApiError> {
    let mode = core.registry.committed_mode(&bot_id)?;
    Ok(Json(core.aggregator.snapshot(&bot_id, mode)))
}

async fn recent_alerts(
    State(core): State<Arc<FleetCore>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = core
        .storage
        .alerts
        .list_raw()
        .map_err(DispatchError::Storage)?;
    let mut alerts: Vec<HealthAlert> = rows
        .iter()
        .filter_map(|(_, data)| serde_json::from_slice(data).ok())
        .collect();
    // Keys sort by raised_at; newest first for the API.
    alerts.reverse();
    alerts.truncate(ALERT_LIST_LIMIT);
    Ok(Json(json!({ "alerts": alerts })))
}
