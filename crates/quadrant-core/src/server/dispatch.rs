//! Request routing: HTTP request to procedure implementation.

use super::implementation::{DuplexHandler, Handler, RequestContext, StreamHandler, UnaryHandler};
use super::WebhookHandler;
use crate::config::{StreamConfig, WireConfig};
use crate::connection::{panic_message, DuplexCore, Outbound, PushCore, PushFrame, Side};
use crate::error::{Result, RpcError};
use crate::schema::{ApiSchema, Procedure};
use crate::shape::Shape;
use crate::validate::validate;
use crate::wire;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// State shared by every request of one server.
pub(crate) struct DispatchState {
    pub(crate) schema: Arc<ApiSchema>,
    pub(crate) handlers: HashMap<String, HashMap<String, Handler>>,
    pub(crate) webhook: Option<Arc<dyn WebhookHandler>>,
    pub(crate) keep_alive: Duration,
    pub(crate) conn_shutdown: watch::Receiver<bool>,
}

impl DispatchState {
    fn resolve(&self, service: &str, procedure: &str) -> Result<(&Procedure, &Handler)> {
        let declaration = self.schema.lookup(service, procedure)?;
        let handler = self
            .handlers
            .get(service)
            .and_then(|handlers| handlers.get(procedure))
            .ok_or_else(|| RpcError::MissingImplementation {
                service: service.to_string(),
                procedure: procedure.to_string(),
            })?;
        Ok((declaration, handler))
    }
}

pub(crate) fn router(state: Arc<DispatchState>) -> Router {
    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(WireConfig::HEALTH_PATH, get(handle_health))
        .route(WireConfig::SCHEMA_PATH, get(handle_schema))
        .route(
            &format!("{}/:service/:procedure", WireConfig::API_PREFIX),
            get(handle_get).post(handle_post),
        )
        .route(WireConfig::WEBHOOK_PATH, any(handle_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ========================================
// Endpoints
// ========================================

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_schema(State(state): State<Arc<DispatchState>>) -> impl IntoResponse {
    Json(state.schema.as_ref().clone())
}

async fn handle_webhook(State(state): State<Arc<DispatchState>>, request: Request) -> Response {
    match &state.webhook {
        Some(webhook) => webhook.handle(request).await,
        None => (StatusCode::NOT_FOUND, "No webhook handler registered").into_response(),
    }
}

/// QUERY, SUBSCRIPTION and the BIDIRECTIONAL handshake.
async fn handle_get(
    State(state): State<Arc<DispatchState>>,
    Path((service, procedure)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let label = format!("{}.{}", service, procedure);
    let (declaration, handler) = match state.resolve(&service, &procedure) {
        Ok(resolved) => resolved,
        Err(e) => return error_response(&label, e),
    };

    let result = match (handler, upgrade) {
        (Handler::Query(handler), _) => {
            let payload = query.get(WireConfig::PAYLOAD_PARAM).map(String::as_str);
            match wire::decode_payload(&label, payload) {
                Ok(input) => run_unary(&label, declaration, handler, input).await,
                Err(e) => Err(e),
            }
        }
        (Handler::Subscription(handler), _) => {
            let payload = query.get(WireConfig::PAYLOAD_PARAM).map(String::as_str);
            wire::decode_payload(&label, payload).and_then(|input| {
                open_push_stream(&state, label.clone(), declaration, Arc::clone(handler), input)
            })
        }
        (Handler::Bidirectional(handler), Some(upgrade)) => Ok(accept_duplex(
            &state,
            label.clone(),
            declaration,
            Arc::clone(handler),
            upgrade,
            RequestContext { headers, query },
        )),
        (Handler::Bidirectional(_), None) => Err(kind_mismatch(
            &service,
            declaration,
            "expected a WebSocket upgrade",
        )),
        (Handler::Mutation(_), _) => Err(kind_mismatch(&service, declaration, "expected POST")),
    };

    result.unwrap_or_else(|e| error_response(&label, e))
}

/// MUTATION.
async fn handle_post(
    State(state): State<Arc<DispatchState>>,
    Path((service, procedure)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let label = format!("{}.{}", service, procedure);
    let (declaration, handler) = match state.resolve(&service, &procedure) {
        Ok(resolved) => resolved,
        Err(e) => return error_response(&label, e),
    };

    let result = match handler {
        Handler::Mutation(handler) => {
            let body = String::from_utf8_lossy(&body);
            let payload = (!body.trim().is_empty()).then_some(&*body);
            match wire::decode_payload(&label, payload) {
                Ok(input) => run_unary(&label, declaration, handler, input).await,
                Err(e) => Err(e),
            }
        }
        _ => Err(kind_mismatch(&service, declaration, "expected GET")),
    };

    result.unwrap_or_else(|e| error_response(&label, e))
}

fn kind_mismatch(service: &str, declaration: &Procedure, detail: &str) -> RpcError {
    RpcError::KindMismatch {
        service: service.to_string(),
        procedure: declaration.name().to_string(),
        kind: declaration.kind(),
        detail: detail.to_string(),
    }
}

fn error_response(label: &str, err: RpcError) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        warn!("{} failed: {}", label, err);
    } else {
        debug!("{} rejected: {}", label, err);
    }
    (status, err.to_string()).into_response()
}

/// Resolves once the server starts shutting down (or is gone).
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn validate_input(label: &str, declaration: &Procedure, input: &Value) -> Result<Value> {
    validate(declaration.input(), input).map_err(|failure| RpcError::InvalidInput {
        procedure: label.to_string(),
        failure,
    })
}

// ========================================
// QUERY / MUTATION
// ========================================

async fn run_unary(
    label: &str,
    declaration: &Procedure,
    handler: &UnaryHandler,
    input: Value,
) -> Result<Response> {
    let input = validate_input(label, declaration, &input)?;

    debug!("Dispatching {} ({})", label, declaration.kind());
    let output = AssertUnwindSafe(handler(input))
        .catch_unwind()
        .await
        .map_err(|payload| RpcError::Procedure(panic_message(payload.as_ref())))??;

    // Never send a value the caller would reject
    let output = validate(declaration.output(), &output).map_err(|failure| {
        RpcError::InvalidOutput {
            procedure: label.to_string(),
            failure,
        }
    })?;

    Ok(Json(wire::success_envelope(output)).into_response())
}

// ========================================
// SUBSCRIPTION
// ========================================

/// Releases the push connection when the response body is dropped, which
/// is how a client disconnect surfaces.
struct TransportGuard(Arc<PushCore>);

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.0.transport_dropped();
    }
}

fn open_push_stream(
    state: &DispatchState,
    label: String,
    declaration: &Procedure,
    handler: StreamHandler,
    input: Value,
) -> Result<Response> {
    let input = validate_input(&label, declaration, &input)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let core = Arc::new(PushCore::new(label, declaration.output().clone(), tx));
    core.lifecycle().mark_open();
    debug!("Opened push stream {}", core.procedure());

    {
        let core = Arc::clone(&core);
        let shutdown = state.conn_shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_requested(shutdown) => core.close(),
                _ = core.lifecycle().closed() => {}
            }
        });
    }

    {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler(input, Arc::clone(&core)))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => core.fail(&e),
                Err(payload) => core.fail(&RpcError::Procedure(panic_message(payload.as_ref()))),
            }
        });
    }

    let stream = futures::stream::unfold(
        (rx, TransportGuard(core), false),
        |(mut rx, guard, done)| async move {
            if done {
                return None;
            }
            let Some(frame) = rx.recv().await else {
                return None;
            };
            let (event, done) = match frame {
                PushFrame::Event(data) => (
                    Event::default().event(StreamConfig::MESSAGE_EVENT).data(data),
                    false,
                ),
                PushFrame::Error(message) => (
                    Event::default().event(StreamConfig::ERROR_EVENT).data(message),
                    false,
                ),
                PushFrame::Close => (Event::default().event(StreamConfig::CLOSE_EVENT).data(""), true),
            };
            Some((Ok::<_, Infallible>(event), (rx, guard, done)))
        },
    );

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response())
}

// ========================================
// BIDIRECTIONAL
// ========================================

fn accept_duplex(
    state: &DispatchState,
    label: String,
    declaration: &Procedure,
    handler: DuplexHandler,
    upgrade: WebSocketUpgrade,
    context: RequestContext,
) -> Response {
    let send_shape = declaration.output().clone();
    let recv_shape = declaration.input().clone();
    let shutdown = state.conn_shutdown.clone();

    upgrade
        .max_message_size(WireConfig::MAX_DUPLEX_FRAME_SIZE)
        .on_upgrade(move |socket| {
            run_duplex(socket, label, send_shape, recv_shape, handler, context, shutdown)
        })
}

async fn run_duplex(
    socket: WebSocket,
    label: String,
    send_shape: Shape,
    recv_shape: Shape,
    handler: DuplexHandler,
    context: RequestContext,
    shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let core = Arc::new(DuplexCore::new(label, Side::Server, send_shape, recv_shape, tx));

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Close => Message::Close(None),
            };
            if let Err(e) = sink.send(message).await {
                debug!("Duplex writer stopped: {}", e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    core.lifecycle().mark_open();

    {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_requested(shutdown) => core.close(),
                _ = core.lifecycle().closed() => {}
            }
        });
    }

    // Listeners are registered before the first inbound frame is read
    let outcome = AssertUnwindSafe(handler(context, Arc::clone(&core)))
        .catch_unwind()
        .await;
    let setup_failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(payload) => Some(RpcError::Procedure(panic_message(payload.as_ref()))),
    };
    if let Some(err) = setup_failure {
        core.report_failure(err);
        core.close();
    }

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => core.dispatch_inbound(&text).await,
            Ok(Message::Binary(bytes)) => {
                core.dispatch_inbound(&String::from_utf8_lossy(&bytes)).await
            }
            Ok(Message::Close(_)) => {
                core.remote_closed();
                break;
            }
            Ok(_) => {}
            Err(e) => {
                core.transport_lost(RpcError::Transport {
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    core.transport_lost(RpcError::ConnectionClosed);
    let _ = writer.await;
}
