use std::{future::IntoFuture, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::{signal, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::hub::{Attachment, Hub};
use crate::notify;
use crate::protocol::decode_frame;
use crate::reaper::{Reaper, StatusReporter};

pub struct AppState {
    pub hub: Hub,
    pub heartbeat_interval: Duration,
    pub metrics: Option<PrometheusHandle>,
}

/// Browser-facing routes: the websocket plus operational endpoints.
pub fn router(state: Arc<AppState>, allowed_origin: HeaderValue) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .route("/ws", get(websocket_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Collaborator routes. Served on their own listener with no CORS layer, so
/// browsers never reach them.
pub fn internal_router(hub: Hub) -> Router {
    notify::routes(hub)
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let hub = Hub::new(config.hub_config());
    let state = Arc::new(AppState {
        hub: hub.clone(),
        heartbeat_interval: config.heartbeat_interval,
        metrics,
    });

    let reaper = Reaper::new(hub.clone(), config.reaper_interval).spawn();
    let reporter = StatusReporter::new(hub.clone(), config.status_interval).spawn();

    let app = router(state, config.allowed_origin.clone());
    let internal = internal_router(hub);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let internal_listener = tokio::net::TcpListener::bind(config.internal_addr)
        .await
        .context("failed to bind internal listener")?;

    info!("beach-classroom listening on {}", config.listen_addr);
    info!("internal collaborator API listening on {}", config.internal_addr);

    // The internal listener follows the public one down, including when the
    // public server exits with an error and drops the sender.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let internal_server =
        axum::serve(internal_listener, internal).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
    let public_server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let (public, internal) =
        tokio::join!(public_server.into_future(), internal_server.into_future());
    public.context("server shutdown with error")?;
    internal.context("internal server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    for task in [reaper, reporter].into_iter().flatten() {
        task.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.status())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// WebSocket upgrade handler
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let Attachment {
        connection_id,
        mut receiver,
    } = state.hub.attach();
    let (mut sender, mut stream) = socket.split();

    info!(connection_id = %connection_id, "websocket connected");

    let heartbeat = state.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            tokio::select! {
                outbound = receiver.recv() => {
                    let Some(message) = outbound else { break };
                    let closing = matches!(message, Message::Close(_));
                    if sender.send(message).await.is_err() || closing {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving message");
                break;
            }
        };
        if !state.hub.touch(&connection_id) {
            info!(connection_id = %connection_id, "connection reaped, closing reader");
            break;
        }

        match &frame {
            Message::Close(close) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?close.as_ref().map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Text(_) | Message::Binary(_) => match decode_frame(&frame) {
                Ok(Some(message)) => state.hub.dispatch(&connection_id, message),
                Ok(None) => {}
                Err(err) => {
                    counter!(
                        "beach_classroom_malformed_frames_total",
                        1,
                        "reason" => err.metric_label()
                    );
                    warn!(connection_id = %connection_id, "ignoring malformed frame: {err}");
                }
            },
            _ => continue,
        }
    }

    state.hub.detach(&connection_id);
    writer.abort();

    info!(connection_id = %connection_id, "websocket disconnected");
}
