//! Webhook pass-through that logs what it receives.

use axum::body::to_bytes;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quadrant_core::WebhookHandler;
use tracing::{info, warn};

/// Largest webhook body read before giving up.
pub const MAX_WEBHOOK_BODY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingWebhook;

#[async_trait::async_trait]
impl WebhookHandler for LoggingWebhook {
    async fn handle(&self, request: Request) -> Response {
        match to_bytes(request.into_body(), MAX_WEBHOOK_BODY).await {
            Ok(body) => {
                info!("Webhook received\n{}", String::from_utf8_lossy(&body));
                StatusCode::OK.into_response()
            }
            Err(e) => {
                warn!("Failed to read webhook body: {}", e);
                StatusCode::BAD_REQUEST.into_response()
            }
        }
    }
}
