//! Connection handlers for the relay server.
//!
//! This module handles the handshake, the connection lifecycle and event
//! processing.

use crate::auth::{AuthError, Authenticator};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{
        header::{AUTHORIZATION, ORIGIN},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use circle_relay_core::{ConnectionId, Identity, RegistryError, RoomRegistry};
use circle_relay_protocol::{
    codec::{self, Encoded, WireFormat},
    ClientEvent, Connected, ServerEvent,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Multiple of `limits.max_message_size` the socket will buffer for one
/// inbound message. Messages up to the cap are read and dropped by the codec
/// with the connection kept open; anything larger ends the connection.
const INBOUND_READ_HEADROOM: usize = 2;

/// Largest inbound message the WebSocket layer accepts.
fn inbound_read_limit(max_message_size: usize) -> usize {
    max_message_size.saturating_mul(INBOUND_READ_HEADROOM)
}

/// Shared server state.
pub struct AppState {
    /// Room memberships and fan-out.
    pub registry: RoomRegistry,
    /// Handshake token verification.
    pub authenticator: Authenticator,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            registry: RoomRegistry::new(),
            authenticator: Authenticator::from_config(&config.auth),
            config,
        }
    }
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    /// Credential, when not sent as a bearer header.
    pub token: Option<String>,
    /// Outbound encoding (`json` or `msgpack`).
    pub format: Option<String>,
}

/// Build the HTTP router.
///
/// # Errors
///
/// Returns an error if the configured allowed origin is not a valid header
/// value.
pub fn app(state: Arc<AppState>) -> Result<Router> {
    let cors = cors_layer(&state.config.allowed_origin)?;

    Ok(Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(allowed_origin: &str) -> Result<CorsLayer> {
    let origin = if allowed_origin == "*" {
        AllowOrigin::any()
    } else {
        let value = HeaderValue::from_str(allowed_origin)
            .with_context(|| format!("Invalid allowed origin: {allowed_origin}"))?;
        AllowOrigin::exact(value)
    };

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .max_age(Duration::from_secs(60 * 60)))
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));
    let app = app(Arc::clone(&state))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Circle relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Circle relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.room_count,
        "connections": stats.connection_count,
    }))
}

/// Whether a handshake's `Origin` header is acceptable.
///
/// Requests without an `Origin` header come from non-browser clients and are
/// let through; the token still has to verify.
fn origin_allowed(allowed_origin: &str, origin: Option<&HeaderValue>) -> bool {
    if allowed_origin == "*" {
        return true;
    }
    match origin.map(HeaderValue::to_str) {
        None => true,
        Some(Ok(origin)) => origin.trim_end_matches('/') == allowed_origin.trim_end_matches('/'),
        Some(Err(_)) => false,
    }
}

/// WebSocket upgrade handler.
///
/// The credential is verified before any event is read. A rejected client
/// still completes the upgrade so that it receives the reason in a close
/// frame.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HandshakeParams>,
) -> Response {
    if !origin_allowed(&state.config.allowed_origin, headers.get(ORIGIN)) {
        warn!(origin = ?headers.get(ORIGIN), "Rejected handshake from disallowed origin");
        metrics::record_auth_failure("origin");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let format = params
        .format
        .as_deref()
        .and_then(WireFormat::from_param)
        .unwrap_or_default();

    let read_limit = inbound_read_limit(state.config.limits.max_message_size);
    let ws = ws.max_message_size(read_limit).max_frame_size(read_limit);

    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let result = Authenticator::extract_token(authorization, params.token.as_deref())
        .and_then(|token| state.authenticator.authenticate(token));

    match result {
        Ok(identity) => ws
            .on_upgrade(move |socket| handle_websocket(socket, state, identity, format))
            .into_response(),
        Err(e) => {
            warn!(reason = e.code(), "Rejected handshake");
            metrics::record_auth_failure(e.code());
            ws.on_upgrade(move |socket| reject(socket, e))
                .into_response()
        }
    }
}

/// Close a socket that failed authentication.
async fn reject(mut socket: WebSocket, error: AuthError) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Cow::Owned(format!("Authentication error: {error}")),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send authentication close frame");
    }
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    format: WireFormat,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();

    let mut inbox = match state.registry.connect(connection_id.clone(), identity.clone()) {
        Ok(inbox) => inbox,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to register connection");
            return;
        }
    };

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    let heartbeat_interval = Duration::from_millis(state.config.heartbeat.interval_ms);
    let heartbeat_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let max_message_size = state.config.limits.max_message_size;

    let connected = ServerEvent::Connected(Connected {
        connection_id: connection_id.to_string(),
        user: (&identity).into(),
        heartbeat: state.config.heartbeat.interval_ms,
    });

    if send_event(&mut sender, &connected, format).await.is_ok() {
        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;

                // Messages fanned out to this connection
                Some(message) = inbox.recv() => {
                    if send_event(&mut sender, &message.to_event(), format).await.is_err() {
                        break;
                    }
                }

                // Receive from WebSocket
                msg = receiver.next() => {
                    last_seen = Instant::now();
                    let event = match msg {
                        Some(Ok(Message::Text(text))) => {
                            metrics::record_bytes(text.len(), "inbound");
                            codec::decode_text(&text, max_message_size)
                        }
                        Some(Ok(Message::Binary(data))) => {
                            metrics::record_bytes(data.len(), "inbound");
                            codec::decode_binary(&data, max_message_size)
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            // Pongs to client pings are queued by the WebSocket layer
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!(connection = %connection_id, "Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(connection = %connection_id, error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                            break;
                        }
                        None => {
                            debug!(connection = %connection_id, "WebSocket stream ended");
                            break;
                        }
                    };

                    match event {
                        Ok(event) => {
                            if let Err(e) = handle_event(event, &connection_id, &state, &mut sender, format).await {
                                debug!(connection = %connection_id, error = %e, "Send failed");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(connection = %connection_id, error = %e, "Dropped malformed event");
                            metrics::record_error("malformed");
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_timeout {
                        info!(connection = %connection_id, "Heartbeat timeout");
                        break;
                    }
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    } else {
        error!(connection = %connection_id, "Failed to send connected event");
    }

    // Cleanup completes before the task ends
    state.registry.disconnect(&connection_id);
    metrics::set_active_rooms(state.registry.stats().room_count);
}

/// Handle a decoded client event.
///
/// Router errors are logged and dropped; there is no acknowledgment
/// protocol. Only a failed write to the socket is returned as an error.
async fn handle_event(
    event: ClientEvent,
    connection_id: &ConnectionId,
    state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
) -> Result<()> {
    let name = event.name();
    metrics::record_event(name, "inbound");

    let outcome: Result<(), RegistryError> = match event {
        ClientEvent::JoinCircle(circle) => state.registry.join(connection_id, &circle.0).map(|joined| {
            if joined {
                metrics::set_active_rooms(state.registry.stats().room_count);
            }
        }),

        ClientEvent::LeaveCircle(circle) => state.registry.leave(connection_id, &circle.0).map(|left| {
            if left {
                metrics::set_active_rooms(state.registry.stats().room_count);
            }
        }),

        ClientEvent::PostComment(post) => state
            .registry
            .post(connection_id, &post.room_id, &post.text)
            .map(|delivery| {
                debug!(
                    connection = %connection_id,
                    room = %delivery.message.room,
                    recipients = delivery.recipients,
                    "Comment posted"
                );
                metrics::record_fanout("new_comment", delivery.recipients);
            }),

        ClientEvent::Typing(typing) => state
            .registry
            .typing(connection_id, &typing.room_id)
            .map(|delivery| metrics::record_fanout("user_typing", delivery.recipients)),

        ClientEvent::Ping => {
            send_event(sender, &ServerEvent::Pong, format).await?;
            Ok(())
        }
    };

    if let Err(e) = outcome {
        warn!(connection = %connection_id, event = name, error = %e, "Event rejected");
        metrics::record_error("rejected_event");
    }

    Ok(())
}

/// Encode and send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    format: WireFormat,
) -> Result<()> {
    let encoded = codec::encode(event, format)?;
    metrics::record_event(event.name(), "outbound");
    metrics::record_bytes(encoded.len(), "outbound");

    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_allowed() {
        let exact = HeaderValue::from_static("https://app.example.com");
        let other = HeaderValue::from_static("https://evil.example.com");

        assert!(origin_allowed("*", Some(&other)));
        assert!(origin_allowed("https://app.example.com", Some(&exact)));
        assert!(origin_allowed("https://app.example.com/", Some(&exact)));
        assert!(!origin_allowed("https://app.example.com", Some(&other)));
        assert!(origin_allowed("https://app.example.com", None));
    }

    #[test]
    fn test_inbound_read_limit() {
        assert_eq!(inbound_read_limit(64 * 1024), 128 * 1024);
        assert_eq!(inbound_read_limit(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_cors_layer_rejects_bad_origin() {
        assert!(cors_layer("*").is_ok());
        assert!(cors_layer("https://app.example.com").is_ok());
        assert!(cors_layer("bad\norigin").is_err());
    }
}
