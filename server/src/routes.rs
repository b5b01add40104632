//! HTTP and WebSocket routes for the Pipecast server.
//!
//! This module provides the transport around the connection core:
//!
//! - `GET <ws_path>` - WebSocket endpoint (default `/ws`)
//! - `GET /health` - Health check endpoint
//!
//! Every response carries permissive CORS headers that reflect the request
//! `Origin` and allow credentials.
//!
//! # WebSocket Protocol
//!
//! Each text message is a JSON [`Frame`]: `{"event": "...", "data": ...}`.
//!
//! | Direction | Event | Data |
//! |-----------|-------|------|
//! | server → client | `hoge` | serialized envelope `{"timestamp":..,"message":..}` |
//! | client → server | `authRequest` | `{"token": "<jwt>"}` |
//! | client → server | `control` | any string |
//!
//! Authentication produces no reply; its outcome only shows up in logs.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::Method,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::broadcast::BroadcastProducer;
use crate::config::Config;
use crate::lifecycle::{ConnectionEvent, LifecycleHandler};
use crate::registry::{ChannelHandle, ConnectionRegistry};
use crate::types::{Frame, EVENT_AUTH_REQUEST, EVENT_CONTROL};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Live connections, shared with the broadcast producer.
    pub registry: Arc<ConnectionRegistry>,

    /// Applies connection events to the registry.
    pub lifecycle: LifecycleHandler,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state with an empty registry.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pipecast_server::config::Config;
    /// use pipecast_server::routes::AppState;
    ///
    /// let state = AppState::new(Config::new("secret key", 3000));
    /// assert!(state.registry.is_empty());
    /// ```
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let verifier = Arc::new(TokenVerifier::new(&config.jwt_secret));
        let lifecycle = LifecycleHandler::new(Arc::clone(&registry), verifier);

        Self {
            config: Arc::new(config),
            registry,
            lifecycle,
            start_time: Instant::now(),
        }
    }

    /// Returns a producer that broadcasts to this state's registry.
    #[must_use]
    pub fn producer(&self) -> BroadcastProducer {
        BroadcastProducer::new(Arc::clone(&self.registry))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// # Example
///
/// ```rust
/// use pipecast_server::config::Config;
/// use pipecast_server::routes::{create_router, AppState};
///
/// let router = create_router(AppState::new(Config::new("secret key", 3000)));
/// ```
pub fn create_router(state: AppState) -> Router {
    let ws_path = state.config.ws_path.clone();

    Router::new()
        .route(&ws_path, get(get_ws))
        .route("/health", get(get_health))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS policy: reflect whatever origin asked, with credentials.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
}

// ============================================================================
// GET <ws_path> - WebSocket
// ============================================================================

/// Upgrades the request and hands the socket to [`handle_websocket`].
///
/// Connections are accepted without credentials; clients may authenticate
/// afterwards with an `authRequest` frame.
async fn get_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let connection_id = Uuid::new_v4().to_string();
    debug!(connection_id = %connection_id, "WebSocket client connecting");

    ws.on_upgrade(move |socket| handle_websocket(socket, connection_id, state.lifecycle))
}

/// Drives one WebSocket connection until it closes.
///
/// Outbound frames flow from the connection's [`ChannelHandle`] through a
/// dedicated writer task, so broadcasts never wait on this socket. Inbound
/// frames are converted to [`ConnectionEvent`]s. `Disconnect` is always
/// raised on exit.
async fn handle_websocket(socket: WebSocket, connection_id: String, lifecycle: LifecycleHandler) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = ChannelHandle::channel();

    lifecycle.handle(&connection_id, ConnectionEvent::Connect(Arc::new(handle)));

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    error!(connection_id = %writer_id, error = %err, "Failed to serialize frame");
                    continue;
                }
            };
            if let Err(err) = sender.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_id, error = %err, "Failed to write to WebSocket client");
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match inbound_event(text.as_str()) {
                Some(event) => lifecycle.handle(&connection_id, event),
                None => trace!(connection_id = %connection_id, "Ignoring inbound frame"),
            },
            Ok(Message::Close(_)) => {
                debug!(connection_id = %connection_id, "WebSocket client sent close frame");
                break;
            }
            Ok(Message::Ping(data)) => {
                // axum answers pings itself
                trace!(data_len = data.len(), "Received ping");
            }
            Ok(_) => {}
            Err(err) => {
                lifecycle.handle(&connection_id, ConnectionEvent::Error(err.to_string()));
                break;
            }
        }
    }

    lifecycle.handle(&connection_id, ConnectionEvent::Disconnect);
    writer.abort();
}

/// Converts an inbound text message into a lifecycle event.
///
/// Returns `None` for unparsable frames and unknown event names, both of
/// which are logged and otherwise ignored.
pub fn inbound_event(text: &str) -> Option<ConnectionEvent> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "Malformed WebSocket frame");
            return None;
        }
    };

    match frame.event.as_str() {
        EVENT_AUTH_REQUEST => Some(ConnectionEvent::AuthRequest(frame.data_text())),
        EVENT_CONTROL => Some(ConnectionEvent::Control(frame.data_text())),
        other => {
            debug!(event = %other, "Unknown inbound event");
            None
        }
    }
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of registered WebSocket connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    use crate::registry::ConnectionEntry;

    fn test_state() -> AppState {
        AppState::new(Config::new("secret key", 0))
    }

    async fn health(app: Router) -> HealthResponse {
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok_status() {
        let health = health(create_router(test_state())).await;

        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn health_reports_registered_connections() {
        let state = test_state();
        let (handle, _rx) = ChannelHandle::channel();
        state
            .registry
            .insert(ConnectionEntry::new("c1", Arc::new(handle)));

        let health = health(create_router(state)).await;
        assert_eq!(health.connections, 1);
    }

    #[tokio::test]
    async fn responses_reflect_request_origin() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://dashboard.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://dashboard.example"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn preflight_on_ws_path_is_answered() {
        let app = create_router(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/ws")
                    .header(header::ORIGIN, "http://other.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://other.example"
        );
    }

    #[tokio::test]
    async fn ws_path_requires_upgrade() {
        let app = create_router(test_state());

        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn ws_path_follows_config() {
        let mut config = Config::new("secret key", 0);
        config.ws_path = "/stream".to_string();
        let app = create_router(AppState::new(config));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::builder().uri("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn inbound_auth_request_maps_to_event() {
        let event = inbound_event(r#"{"event":"authRequest","data":"{\"token\":\"abc\"}"}"#);
        assert!(matches!(event, Some(ConnectionEvent::AuthRequest(ref p)) if p == r#"{"token":"abc"}"#));
    }

    #[test]
    fn inbound_auth_request_accepts_object_payload() {
        let event = inbound_event(r#"{"event":"authRequest","data":{"token":"abc"}}"#);
        assert!(matches!(event, Some(ConnectionEvent::AuthRequest(ref p)) if p == r#"{"token":"abc"}"#));
    }

    #[test]
    fn inbound_control_maps_to_event() {
        let event = inbound_event(r#"{"event":"control","data":"pause"}"#);
        assert!(matches!(event, Some(ConnectionEvent::Control(ref p)) if p == "pause"));
    }

    #[test]
    fn inbound_unknown_or_malformed_is_ignored() {
        assert!(inbound_event(r#"{"event":"chat message","data":"hi"}"#).is_none());
        assert!(inbound_event("plain text").is_none());
        assert!(inbound_event(r#"{"data":"no event"}"#).is_none());
    }

    #[test]
    fn app_state_debug_does_not_leak_secret() {
        let debug = format!("{:?}", test_state());
        assert!(debug.contains("AppState"));
        assert!(!debug.contains("secret key"));
    }
}
