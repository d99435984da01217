//! Dispatch error taxonomy and its HTTP mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::models::DeliveryMode;

/// Everything that can go wrong between an inbound request and a committed
/// delivery decision.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Webhook path token did not resolve to a bot.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Secret header missing or not matching the bot's webhook secret.
    #[error("webhook secret mismatch")]
    SignatureMismatch,

    /// Update arrived over a path the bot's mode does not accept.
    #[error("bot {bot_id} is in {mode} mode")]
    ModeMismatch { bot_id: String, mode: DeliveryMode },

    /// Body failed to parse as a provider update.
    #[error("malformed update payload: {0}")]
    MalformedPayload(String),

    /// Provider call inside a transition failed.
    #[error("provider error: {0}")]
    UpstreamProvider(String),

    /// Provider call inside a transition exceeded the bound.
    #[error("transition timed out after {timeout_secs}s")]
    TransitionTimeout { timeout_secs: u64 },

    /// Another transition held the bot's lock past the bound.
    #[error("transition already in progress for bot {bot_id}")]
    DuplicateTransition { bot_id: String },

    /// Bot ID not present in the registry.
    #[error("unknown bot: {0}")]
    UnknownBot(String),

    /// Router refused the update because the dispatch queue is at bound.
    #[error("dispatch queue full")]
    QueueFull,

    /// Invalid provisioning input or missing required configuration.
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl DispatchError {
    /// HTTP status this error maps to at the API boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::AuthenticationFailure => StatusCode::NOT_FOUND,
            DispatchError::SignatureMismatch => StatusCode::UNAUTHORIZED,
            DispatchError::ModeMismatch { .. } => StatusCode::CONFLICT,
            DispatchError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            DispatchError::UpstreamProvider(_) => StatusCode::BAD_GATEWAY,
            DispatchError::TransitionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::DuplicateTransition { .. } => StatusCode::CONFLICT,
            DispatchError::UnknownBot(_) => StatusCode::NOT_FOUND,
            DispatchError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable reason used in health events and REST bodies.
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::AuthenticationFailure => "authentication_failure",
            DispatchError::SignatureMismatch => "signature_mismatch",
            DispatchError::ModeMismatch { .. } => "mode_mismatch",
            DispatchError::MalformedPayload(_) => "malformed_payload",
            DispatchError::UpstreamProvider(_) => "upstream_provider",
            DispatchError::TransitionTimeout { .. } => "transition_timeout",
            DispatchError::DuplicateTransition { .. } => "duplicate_transition",
            DispatchError::UnknownBot(_) => "unknown_bot",
            DispatchError::QueueFull => "queue_full",
            DispatchError::Configuration(_) => "configuration",
            DispatchError::Storage(_) => "storage",
        }
    }
}

/// JSON error envelope for the HTTP surface.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub reason: &'static str,
}

impl ApiError {
    pub fn new(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            reason,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{} not found", resource),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.status.as_u16(),
                "reason": self.reason,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        if matches!(err, DispatchError::Storage(_)) {
            tracing::error!(error = %err, "dispatch storage error");
        }
        Self::new(err.status_code(), err.reason(), err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "API error");
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            DispatchError::AuthenticationFailure.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DispatchError::SignatureMismatch.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            DispatchError::ModeMismatch {
                bot_id: "support-bot".to_string(),
                mode: DeliveryMode::Polling,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DispatchError::MalformedPayload("bad json".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DispatchError::TransitionTimeout { timeout_secs: 10 }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_mode_mismatch_message_names_the_mode() {
        let err = DispatchError::ModeMismatch {
            bot_id: "support-bot".to_string(),
            mode: DeliveryMode::Polling,
        };
        assert_eq!(err.to_string(), "bot support-bot is in polling mode");
        assert_eq!(err.reason(), "mode_mismatch");
    }
}
