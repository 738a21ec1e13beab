//! Tower's HTTP surface.
//!
//! `/stream` (continuous MP3), `/status` and `/tower/buffer` (operator
//! JSON), `/tower/events/ingest` (validated event ingest) and the
//! `/tower/events` WebSocket feed.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::tower::broadcast::ConnectionManager;
use crate::tower::events::IngestEnvelope;
use crate::tower::service::TowerService;

#[derive(Clone)]
pub struct TowerState {
    pub service: Arc<TowerService>,
}

pub fn router(service: Arc<TowerService>) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/status", get(status))
        .route("/tower/buffer", get(buffer))
        .route("/tower/events/ingest", post(ingest_event))
        .route("/tower/events", get(events_ws))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::new().allow_origin(tower_http::cors::Any))
        .with_state(TowerState { service })
}

/// Removes the client from the fanout table when the response body is
/// dropped, i.e. on listener disconnect.
struct ClientGuard {
    id: u64,
    connections: Arc<ConnectionManager>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.connections.remove_client(self.id, "disconnected");
    }
}

async fn stream(State(state): State<TowerState>) -> Response {
    use futures::StreamExt;

    let connections = state.service.connections();
    let (id, rx) = connections.add_client();
    let guard = ClientGuard {
        id,
        connections: Arc::clone(&connections),
    };

    let body = Body::from_stream(
        tokio_stream::wrappers::ReceiverStream::new(rx).map(move |frame: Bytes| {
            // The guard lives inside the stream: dropping the body
            // unregisters the client.
            let _ = &guard;
            Ok::<_, Infallible>(frame)
        }),
    );

    (
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

async fn status(State(state): State<TowerState>) -> Json<crate::tower::service::TowerStatus> {
    Json(state.service.status())
}

async fn buffer(State(state): State<TowerState>) -> Json<crate::audio::BufferStats> {
    Json(state.service.buffer_stats())
}

async fn ingest_event(
    State(state): State<TowerState>,
    Json(envelope): Json<IngestEnvelope>,
) -> Result<StatusCode, AppError> {
    state.service.events().ingest(envelope)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn events_ws(State(state): State<TowerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state))
}

/// One WebSocket subscriber.
///
/// Idle connections live forever; inbound data frames are ignored; PINGs
/// are answered; only a send stall past the client timeout drops the
/// subscriber, and doing so never touches the others.
async fn serve_subscriber(socket: WebSocket, state: TowerState) {
    use futures::{SinkExt, StreamExt};

    let mut events = state.service.events().subscribe();
    let client_timeout = state.service.config().client_timeout;
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Decouple event fanout from socket writes so one slow subscriber
    // only ever lags its own queue.
    let (tx, mut rx) = mpsc::channel::<String>(32);

    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if tx.send(json).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("event serialization failed: {e}"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "websocket subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(json) = queued else { break };
                let send = ws_tx.send(Message::Text(json));
                match tokio::time::timeout(client_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!("websocket send failed: {e}");
                        break;
                    }
                    Err(_) => {
                        tracing::info!("websocket subscriber dropped: send stall");
                        break;
                    }
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    // Inbound text/binary/pong frames are ignored.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    forwarder.abort();
}
