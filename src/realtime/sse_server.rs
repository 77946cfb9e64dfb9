// Copyright 2024. The Tari Project

use super::{connection::ConnectionId, frame::EventFrame, registry::BroadcastRegistry};
use crate::session::SessionVerifier;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast, sync::mpsc, task::JoinHandle};

const LOG_TARGET: &str = "teamup::realtime::sse_server";

pub const STREAM_PATH: &str = "/api/messages/stream";
pub const HEALTH_PATH: &str = "/health";

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub registry: BroadcastRegistry,
    pub verifier: Arc<dyn SessionVerifier>,
}

impl AppState {
    pub fn new(registry: BroadcastRegistry, verifier: Arc<dyn SessionVerifier>) -> Self {
        Self { registry, verifier }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    access_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_handler))
        .route(HEALTH_PATH, get(health_handler))
        .with_state(state)
}

/// Bearer token from the `Authorization` header, falling back to the
/// `access_token` query parameter used by browser `EventSource` clients.
fn session_token(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    from_header.or(query_token).filter(|token| !token.is_empty())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn stream_handler(
    State(state): State<AppState>,
    query: Option<Query<StreamQuery>>,
    headers: HeaderMap,
) -> Response {
    // An unparsable query string counts as carrying no token
    let query_token = query.and_then(|Query(query)| query.access_token);
    let Some(token) = session_token(&headers, query_token) else {
        log::debug!(target: LOG_TARGET, "Stream request without session token");
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    };

    let user_id = match state.verifier.verify(&token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            log::debug!(target: LOG_TARGET, "Stream request rejected: {}", e);
            return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    };

    let Some((connection_id, receiver)) = state.registry.open_stream(&user_id) else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Shutting down");
    };
    log::info!(target: LOG_TARGET, "Opened event stream {} for user {}", connection_id, user_id);

    let connection = OpenStream {
        registry: state.registry.clone(),
        user_id,
        connection_id,
        receiver,
    };

    (
        [(X_ACCEL_BUFFERING, HeaderValue::from_static("no"))],
        Sse::new(event_stream(connection)),
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": state.registry.connection_count(),
    }))
}

/// Server side of one stream. Dropped together with the response body, which
/// happens when the client goes away or the registry closes the channel.
struct OpenStream {
    registry: BroadcastRegistry,
    user_id: String,
    connection_id: ConnectionId,
    receiver: mpsc::Receiver<EventFrame>,
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        if self.registry.release(&self.user_id, self.connection_id) {
            log::info!(target: LOG_TARGET, "Client of user {} went away", self.user_id);
        } else {
            log::debug!(target: LOG_TARGET, "Stream {} ended", self.connection_id);
        }
    }
}

fn event_stream(connection: OpenStream) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(connection, |mut connection| async move {
        loop {
            let frame = connection.receiver.recv().await?;
            match frame.to_sse_event() {
                Ok(event) => return Some((Ok(event), connection)),
                Err(e) => {
                    log::error!(target: LOG_TARGET, "Dropping {} frame: {}", frame.event_type(), e);
                }
            }
        }
    })
}

/// HTTP server hosting the stream endpoint
pub struct RealtimeServer {
    state: AppState,
    bind_address: String,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeServer {
    pub fn new(state: AppState, bind_address: impl Into<String>) -> Self {
        Self {
            state,
            bind_address: bind_address.into(),
            local_addr: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Address actually bound, known once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and start serving in the background
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let local_addr = listener.local_addr()?;
        log::info!(target: LOG_TARGET, "Realtime server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let router = build_router(self.state.clone());

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                log::error!(target: LOG_TARGET, "Realtime server failed: {}", e);
            }
            log::info!(target: LOG_TARGET, "Realtime server stopped");
        });

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting requests, close all open streams and wait for the
    /// server task to finish.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        // Open streams never end on their own, graceful shutdown waits for them
        self.state.registry.shutdown();

        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionError;

    /// Accepts any non-empty token as the id of the user it names
    struct TokenIsUserId;

    #[async_trait::async_trait]
    impl SessionVerifier for TokenIsUserId {
        async fn verify(&self, token: &str) -> Result<String, SessionError> {
            Ok(token.to_string())
        }
    }

    fn state() -> AppState {
        AppState::new(BroadcastRegistry::default(), Arc::new(TokenIsUserId))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token)).unwrap());
        headers
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_stream_refused_after_shutdown() {
        let state = state();
        state.registry.shutdown();

        let response = stream_handler(State(state.clone()), None, bearer("alice")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await, json!({"error": "Shutting down"}));
        assert!(!state.registry.is_connected("alice"));
    }

    #[tokio::test]
    async fn test_unparsable_query_is_unauthorized() {
        let state = state();

        // Extraction of a duplicated or malformed query yields no `Query`
        let response = stream_handler(State(state.clone()), None, HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await, json!({"error": "Unauthorized"}));
        assert_eq!(state.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_opened_with_query_token() {
        let state = state();
        let query = Query(StreamQuery {
            access_token: Some("bob".to_string()),
        });

        let response = stream_handler(State(state.clone()), Some(query), HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-accel-buffering"], "no");
        assert!(state.registry.is_connected("bob"));
    }

    #[test]
    fn test_token_from_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(
            session_token(&headers, Some("from-query".to_string())),
            Some("abc.def.ghi".to_string())
        );
    }

    #[test]
    fn test_token_from_query() {
        let headers = HeaderMap::new();
        assert_eq!(
            session_token(&headers, Some("from-query".to_string())),
            Some("from-query".to_string())
        );
    }

    #[test]
    fn test_missing_or_foreign_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_token(&headers, None), None);
        assert_eq!(session_token(&headers, Some(String::new())), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(session_token(&headers, None), None);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_connection() {
        let registry = BroadcastRegistry::default();
        let (connection_id, receiver) = registry.open_stream("alice").unwrap();
        let connection = OpenStream {
            registry: registry.clone(),
            user_id: "alice".to_string(),
            connection_id,
            receiver,
        };
        assert!(registry.is_connected("alice"));

        drop(event_stream(connection));
        assert!(!registry.is_connected("alice"));
    }

    #[tokio::test]
    async fn test_replaced_stream_does_not_release_replacement() {
        let registry = BroadcastRegistry::default();
        let (first_id, first_rx) = registry.open_stream("alice").unwrap();
        let (second_id, _second_rx) = registry.open_stream("alice").unwrap();

        drop(OpenStream {
            registry: registry.clone(),
            user_id: "alice".to_string(),
            connection_id: first_id,
            receiver: first_rx,
        });

        assert_eq!(registry.connection_id("alice"), Some(second_id));
    }
}
