use crate::net::capacity::NicCard;
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
struct DashState {
    cards_rx: watch::Receiver<Vec<NicCard>>,
    shutdown: CancellationToken,
}

#[derive(Serialize)]
struct UiPacket<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    running: bool,
    timestamp: i64,
    cards: &'a [NicCard],
}

/// Monitoring UI: one embedded page, a WebSocket pushing a JSON frame per
/// capacity tick, and a stop control wired to global cancellation.
pub async fn run(
    addr: SocketAddr,
    cards_rx: watch::Receiver<Vec<NicCard>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = DashState {
        cards_rx,
        shutdown: shutdown.clone(),
    };
    let app = Router::new()
        .route("/", get(home))
        .route("/ws", get(ws_upgrade))
        .route("/api/control", get(control))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind dashboard on {addr}"))?;
    info!("dashboard at http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("dashboard server failed")
}

async fn home() -> Html<&'static str> {
    Html(include_str!("../assets/dashboard.html"))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<DashState>) -> axum::response::Response {
    ws.on_upgrade(move |socket| push_updates(socket, state))
}

async fn push_updates(mut socket: WebSocket, mut state: DashState) {
    loop {
        if state.cards_rx.changed().await.is_err() {
            return;
        }
        let frame = {
            let cards = state.cards_rx.borrow_and_update();
            let packet = UiPacket {
                kind: "update",
                running: !state.shutdown.is_cancelled(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                cards: &cards,
            };
            match serde_json::to_string(&packet) {
                Ok(json) => json,
                Err(e) => {
                    debug!("failed to serialize dashboard frame: {e}");
                    return;
                }
            }
        };
        if socket.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }
}

async fn control(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<DashState>,
) -> StatusCode {
    match params.get("action").map(String::as_str) {
        Some("stop") => {
            info!("stop requested from dashboard");
            state.shutdown.cancel();
        }
        Some("start") => {
            info!("start requested from dashboard (restart the process instead)");
        }
        _ => {}
    }
    StatusCode::OK
}
