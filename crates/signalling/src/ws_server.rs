//! WebSocket listener endpoints using Axum.
//!
//! Three routers share one [`Relay`]: players (plus `/health`), streamers and
//! the SFU. Every accepted socket is split into a reader loop, which feeds
//! frames to the relay, and a writer task draining the connection's channel.

use crate::connection::Connection;
use crate::error::{ProtocolError, Result};
use crate::router::Relay;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// How long a forced close waits for its close frame to be written.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared application state.
pub struct AppState {
    pub relay: Arc<Relay>,
}

/// Bound listeners for the three endpoints.
pub struct Listeners {
    pub player: TcpListener,
    pub streamer: TcpListener,
    pub sfu: TcpListener,
}

/// Create the player-facing router: `/health` plus WebSocket upgrades on any
/// other path.
pub fn create_player_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(player_ws_handler)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create the streamer router.
pub fn create_streamer_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(streamer_ws_handler).with_state(state)
}

/// Create the SFU router.
pub fn create_sfu_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(sfu_ws_handler).with_state(state)
}

/// Serve all three endpoints until `shutdown` flips to true.
pub async fn run_servers(
    listeners: Listeners,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let player = axum::serve(listeners.player, create_player_router(state.clone()))
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()));
    let streamer = axum::serve(listeners.streamer, create_streamer_router(state.clone()))
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()));
    let sfu = axum::serve(listeners.sfu, create_sfu_router(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown));

    tokio::try_join!(player.into_future(), streamer.into_future(), sfu.into_future())?;
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also means shutdown
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.health())
}

// ============================================================================
// Upgrade handlers
// ============================================================================

async fn player_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let browser_sends_offer = params
        .get("OfferToReceive")
        .is_some_and(|value| value != "false");
    ws.on_upgrade(move |socket| handle_player_socket(socket, state, browser_sends_offer))
}

async fn streamer_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_streamer_socket(socket, state))
}

async fn sfu_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_sfu_socket(socket, state))
}

// ============================================================================
// Connection tasks
// ============================================================================

async fn handle_player_socket(socket: WebSocket, state: Arc<AppState>, browser_sends_offer: bool) {
    let (connection, rx) = Connection::new();
    let player_id = match state.relay.player_connected(connection.clone(), browser_sends_offer) {
        Ok(id) => id,
        Err(e) => {
            reject(socket, e.close_code(), e.to_string()).await;
            return;
        }
    };

    let (ws_tx, ws_rx) = socket.split();
    let writer = spawn_writer(ws_tx, rx, connection.clone());
    let label = format!("player {}", player_id);

    read_frames(ws_rx, &connection, &label, |text| {
        state.relay.handle_player_message(&player_id, text)
    })
    .await;

    debug!("{} session lasted {} ms", label, connection.age_ms());
    state.relay.player_disconnected(&player_id, &connection);
    counter!("signalling_disconnections_total", "role" => "player").increment(1);
    finish_writer(&connection, writer).await;
}

async fn handle_streamer_socket(socket: WebSocket, state: Arc<AppState>) {
    let (connection, rx) = Connection::new();
    let (ws_tx, ws_rx) = socket.split();
    let writer = spawn_writer(ws_tx, rx, connection.clone());
    info!("Streamer connected ({})", connection.id);

    let mut session = state.relay.streamer_connected(connection.clone());
    let label = format!("streamer {}", connection.id);

    read_frames(ws_rx, &connection, &label, |text| {
        state.relay.handle_streamer_message(&mut session, text)
    })
    .await;

    debug!("{} session lasted {} ms", label, connection.age_ms());
    state.relay.streamer_disconnected(&session);
    counter!("signalling_disconnections_total", "role" => "streamer").increment(1);
    finish_writer(&connection, writer).await;
}

async fn handle_sfu_socket(socket: WebSocket, state: Arc<AppState>) {
    let (connection, rx) = Connection::new();
    if let Err(e) = state.relay.sfu_connected(connection.clone()) {
        reject(socket, e.close_code(), e.to_string()).await;
        return;
    }

    let (ws_tx, ws_rx) = socket.split();
    let writer = spawn_writer(ws_tx, rx, connection.clone());

    read_frames(ws_rx, &connection, "SFU", |text| state.relay.handle_sfu_message(text)).await;

    debug!("SFU session lasted {} ms", connection.age_ms());
    state.relay.sfu_disconnected(&connection);
    counter!("signalling_disconnections_total", "role" => "sfu").increment(1);
    finish_writer(&connection, writer).await;
}

/// Refuse a freshly upgraded socket with a close frame.
async fn reject(mut socket: WebSocket, code: u16, reason: String) {
    info!("Rejecting connection: {} ({})", reason, code);
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send rejection close frame: {}", e);
    }
}

/// Forward queued messages to the socket. A close frame ends the task; a
/// write failure marks the connection dead so its reader loop stops too.
fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    connection: Arc<Connection>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = ws_tx.send(msg).await {
                debug!("Write to connection {} failed: {}", connection.id, e);
                connection.abort();
                break;
            }
            if is_close {
                break;
            }
        }
    })
}

/// Feed inbound frames to `on_text` until the peer goes away, the socket
/// errors, or the connection is closed locally. A protocol error closes the
/// connection with its code and reason.
async fn read_frames<F>(
    mut ws_rx: SplitStream<WebSocket>,
    connection: &Connection,
    label: &str,
    mut on_text: F,
) where
    F: FnMut(&str) -> std::result::Result<(), ProtocolError>,
{
    loop {
        tokio::select! {
            biased;

            _ = connection.closed() => {
                debug!("{} closed locally", label);
                break;
            }

            frame = ws_rx.next() => {
                let result = match frame {
                    Some(Ok(Message::Text(text))) => on_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => on_text(&String::from_utf8_lossy(&data)),
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(frame) => info!("{} disconnected: {} - {}", label, frame.code, frame.reason.as_str()),
                            None => info!("{} disconnected", label),
                        }
                        break;
                    }
                    // Ping/pong are answered by the socket itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("{} connection error: {}", label, e);
                        break;
                    }
                    None => break,
                };

                if let Err(e) = result {
                    connection.close(e.close_code(), e.close_reason());
                    break;
                }
            }
        }
    }
}

/// Let a pending close frame reach the peer, then stop the writer.
async fn finish_writer(connection: &Connection, mut writer: JoinHandle<()>) {
    if connection.is_closing()
        && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
            .await
            .is_ok()
    {
        return;
    }
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaker::MatchmakerNotifier;
    use crate::registry::SharedRegistry;
    use crate::router::RelayOptions;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        relay: Arc<Relay>,
        player_port: u16,
        streamer_port: u16,
        sfu_port: u16,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<Result<()>>,
    }

    async fn start(options: RelayOptions) -> TestServer {
        let player = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let streamer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sfu = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let player_port = player.local_addr().unwrap().port();
        let streamer_port = streamer.local_addr().unwrap().port();
        let sfu_port = sfu.local_addr().unwrap().port();

        let relay = Arc::new(Relay::new(
            Arc::new(SharedRegistry::new()),
            MatchmakerNotifier::disabled(),
            options,
        ));
        let state = Arc::new(AppState { relay: relay.clone() });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_servers(
            Listeners { player, streamer, sfu },
            state,
            shutdown_rx,
        ));

        TestServer {
            relay,
            player_port,
            streamer_port,
            sfu_port,
            shutdown,
            handle,
        }
    }

    async fn connect(port: u16, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}{}", port, path))
            .await
            .unwrap();
        ws
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    async fn next_of_type(ws: &mut Client, kind: &str) -> Value {
        loop {
            let msg = next_json(ws).await;
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    async fn next_close(ws: &mut Client) -> (u16, String) {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for close")
                .expect("stream ended without a close frame")
                .expect("websocket error");
            match msg {
                WsMessage::Close(Some(frame)) => {
                    return (frame.code.into(), frame.reason.as_str().to_string())
                }
                WsMessage::Close(None) => panic!("close frame without a code"),
                _ => continue,
            }
        }
    }

    async fn send(ws: &mut Client, msg: Value) {
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_end_to_end_routing() {
        let server = start(RelayOptions::default()).await;

        let mut streamer = connect(server.streamer_port, "/").await;
        assert_eq!(next_json(&mut streamer).await["type"], "config");
        assert_eq!(next_json(&mut streamer).await, json!({"type": "identify"}));
        send(&mut streamer, json!({"type": "endpointId", "id": "S1"})).await;
        let relay = server.relay.clone();
        wait_until(|| relay.registry().lock().has_streamer("S1")).await;

        let mut player = connect(server.player_port, "/").await;
        assert_eq!(next_json(&mut player).await["type"], "config");
        assert_eq!(next_json(&mut player).await, json!({"type": "playerCount", "count": 1}));

        send(&mut player, json!({"type": "subscribe", "streamerId": "S1"})).await;
        assert_eq!(
            next_json(&mut streamer).await,
            json!({"type": "playerConnected", "playerId": "1", "dataChannel": true, "sfu": false, "sendOffer": true})
        );

        send(&mut streamer, json!({"type": "offer", "playerId": "1", "sdp": "v=0"})).await;
        assert_eq!(next_json(&mut player).await, json!({"type": "offer", "sdp": "v=0"}));

        send(&mut player, json!({"type": "iceCandidate", "candidate": {"sdpMid": "0"}})).await;
        assert_eq!(
            next_json(&mut streamer).await,
            json!({"type": "iceCandidate", "candidate": {"sdpMid": "0"}, "playerId": "1"})
        );

        streamer.close(None).await.unwrap();
        assert_eq!(next_close(&mut player).await, (1000, "streamer disconnected".to_string()));

        let relay = server.relay.clone();
        wait_until(|| {
            let registry = relay.registry().lock();
            registry.player_count() == 0 && registry.streamer_count() == 0
        })
        .await;

        server.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_offer_to_receive_query() {
        let server = start(RelayOptions::default()).await;
        let mut streamer = connect(server.streamer_port, "/").await;
        send(&mut streamer, json!({"type": "endpointId", "id": "S1"})).await;
        let relay = server.relay.clone();
        wait_until(|| relay.registry().lock().has_streamer("S1")).await;

        let mut player = connect(server.player_port, "/?OfferToReceive=true").await;
        send(&mut player, json!({"type": "subscribe", "streamerId": "S1"})).await;

        let announced = next_of_type(&mut streamer, "playerConnected").await;
        assert_eq!(announced["sendOffer"], false);
    }

    #[tokio::test]
    async fn test_player_capacity_rejection() {
        let server = start(RelayOptions {
            max_player_count: 1,
            ..Default::default()
        })
        .await;

        let _first = connect(server.player_port, "/").await;
        let relay = server.relay.clone();
        wait_until(|| relay.registry().lock().player_count() == 1).await;

        let mut second = connect(server.player_port, "/").await;
        assert_eq!(
            next_close(&mut second).await,
            (1013, "too many connections. max: 1, current: 1".to_string())
        );
        assert_eq!(server.relay.registry().lock().player_count(), 1);
    }

    #[tokio::test]
    async fn test_second_sfu_rejected() {
        let server = start(RelayOptions::default()).await;

        let _first = connect(server.sfu_port, "/").await;
        let relay = server.relay.clone();
        wait_until(|| relay.registry().lock().sfu().is_some()).await;

        let mut second = connect(server.sfu_port, "/").await;
        assert_eq!(next_close(&mut second).await, (1013, "Already have an SFU".to_string()));
    }

    #[tokio::test]
    async fn test_bad_frames_close_only_that_connection() {
        let server = start(RelayOptions::default()).await;

        let mut bad = connect(server.player_port, "/").await;
        let mut good = connect(server.player_port, "/").await;
        let relay = server.relay.clone();
        wait_until(|| relay.registry().lock().player_count() == 2).await;

        bad.send(WsMessage::Text("not json".into())).await.unwrap();
        assert_eq!(next_close(&mut bad).await, (1008, "Cannot parse".to_string()));

        send(&mut good, json!({"type": "bogus"})).await;
        assert_eq!(next_close(&mut good).await, (1008, "Unsupported message type".to_string()));

        let mut streamer = connect(server.streamer_port, "/").await;
        streamer.send(WsMessage::Binary(b"{\"type\":\"nope\"}".to_vec().into())).await.unwrap();
        assert_eq!(next_close(&mut streamer).await.0, 1008);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let server = start(RelayOptions::default()).await;

        let mut stream = TcpStream::connect(("127.0.0.1", server.player_port)).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        let body = &response[response.find("\r\n\r\n").unwrap() + 4..];
        assert_eq!(
            serde_json::from_str::<Value>(body).unwrap(),
            json!({"status": "ok", "streamers": 0, "players": 0, "sfu": false})
        );
    }
}
