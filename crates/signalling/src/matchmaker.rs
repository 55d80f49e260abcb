//! Matchmaker client: availability reporting over a persistent TCP link.
//!
//! The link itself (connect, fixed-interval retry, keepalive) is a
//! [`common::LinkManager`]; this module supplies the matchmaker protocol on
//! top of it. Messages are bare JSON objects with no delimiter.

use crate::registry::SharedRegistry;
use async_trait::async_trait;
use common::{LinkCommand, LinkHandler, LinkManager, LinkManagerConfig, LinkState};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages sent to the matchmaker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MatchmakerMessage {
    /// Handshake sent on every (re)connect.
    Connect {
        address: String,
        port: u16,
        /// At least one streamer is registered.
        ready: bool,
        /// At least one player is registered, so the matchmaker must not
        /// route a new arrival here after a link drop.
        player_connected: bool,
    },
    /// Keepalive.
    Ping,
    StreamerConnected,
    StreamerDisconnected,
    ClientConnected,
    ClientDisconnected,
}

/// Configuration for the matchmaker link.
#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    /// Matchmaker host.
    pub address: String,
    /// Matchmaker port.
    pub port: u16,
    /// Address advertised to the matchmaker.
    pub public_address: String,
    /// Player-facing port advertised to the matchmaker.
    pub public_port: u16,
    /// Fixed delay before every reconnect.
    pub retry_interval: Duration,
    /// Keepalive ping period.
    pub keepalive_interval: Duration,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9999,
            public_address: "127.0.0.1".to_string(),
            public_port: 80,
            retry_interval: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Matchmaker protocol plugged into the link manager.
pub struct MatchmakerHandler {
    address: String,
    public_address: String,
    public_port: u16,
    registry: Arc<SharedRegistry>,
}

impl MatchmakerHandler {
    pub fn new(config: &MatchmakerConfig, registry: Arc<SharedRegistry>) -> Self {
        Self {
            address: format!("{}:{}", config.address, config.port),
            public_address: config.public_address.clone(),
            public_port: config.public_port,
            registry,
        }
    }

    /// The handshake reflecting the registry at this instant.
    pub fn connect_message(&self) -> MatchmakerMessage {
        let registry = self.registry.lock();
        MatchmakerMessage::Connect {
            address: self.public_address.clone(),
            port: self.public_port,
            ready: registry.streamer_count() > 0,
            player_connected: registry.player_count() > 0,
        }
    }
}

#[async_trait]
impl LinkHandler for MatchmakerHandler {
    fn address(&self) -> &str {
        &self.address
    }

    fn on_connect_message(&self) -> Option<String> {
        let msg = self.connect_message();
        info!("Connected to matchmaker {}: {:?}", self.address, msg);
        serde_json::to_string(&msg).ok()
    }

    fn keepalive_message(&self) -> Option<String> {
        serde_json::to_string(&MatchmakerMessage::Ping).ok()
    }

    async fn on_data(&self, data: &[u8]) {
        debug!("Matchmaker sent {} bytes: {}", data.len(), String::from_utf8_lossy(data));
    }

    async fn on_disconnect(&self) {
        info!("Matchmaker connection to {} closed", self.address);
    }
}

/// Fire-and-forget handle for lifecycle notifications.
///
/// A disabled notifier swallows everything. Failures are logged and never
/// reach the caller; the link restores itself independently.
#[derive(Debug, Clone, Default)]
pub struct MatchmakerNotifier {
    tx: Option<mpsc::UnboundedSender<LinkCommand>>,
}

impl MatchmakerNotifier {
    /// A notifier for a deployment without a matchmaker.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn streamer_connected(&self) {
        self.notify(MatchmakerMessage::StreamerConnected);
    }

    pub fn streamer_disconnected(&self) {
        self.notify(MatchmakerMessage::StreamerDisconnected);
    }

    pub fn client_connected(&self) {
        self.notify(MatchmakerMessage::ClientConnected);
    }

    pub fn client_disconnected(&self) {
        self.notify(MatchmakerMessage::ClientDisconnected);
    }

    /// Stop the link task.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LinkCommand::Shutdown);
        }
    }

    fn notify(&self, msg: MatchmakerMessage) {
        let Some(tx) = &self.tx else {
            return;
        };
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if tx.send(LinkCommand::Send(json)).is_err() {
                    counter!("signalling_matchmaker_errors_total").increment(1);
                    warn!("ERROR sending {:?}: matchmaker link is not running", msg);
                }
            }
            Err(e) => warn!("Failed to serialize matchmaker message: {}", e),
        }
    }
}

/// Running matchmaker link.
pub struct MatchmakerClient {
    pub notifier: MatchmakerNotifier,
    pub state: watch::Receiver<LinkState>,
    pub handle: JoinHandle<common::error::Result<()>>,
}

impl MatchmakerClient {
    /// Spawn the link task. It connects immediately and reconnects forever.
    pub fn spawn(config: &MatchmakerConfig, registry: Arc<SharedRegistry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let link_config = LinkManagerConfig {
            retry_interval: config.retry_interval,
            keepalive_interval: config.keepalive_interval,
            label: "matchmaker".to_string(),
            ..Default::default()
        };
        let manager = LinkManager::new(MatchmakerHandler::new(config, registry), link_config, rx);
        let state = manager.state();
        let handle = tokio::spawn(manager.run());

        info!(
            "Matchmaker client started for {}:{} (retry {:?}, keepalive {:?})",
            config.address, config.port, config.retry_interval, config.keepalive_interval
        );

        Self {
            notifier: MatchmakerNotifier::new(tx),
            state,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::registry::{Player, PlayerKind};
    use serde_json::{json, Value};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn read_messages(socket: &mut TcpStream, count: usize) -> Vec<Value> {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let values: Vec<Value> = serde_json::Deserializer::from_slice(&data)
                .into_iter::<Value>()
                .filter_map(|v| v.ok())
                .collect();
            if values.len() >= count {
                return values;
            }
            let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
                .await
                .expect("timed out waiting for matchmaker data")
                .unwrap();
            assert!(n > 0, "link closed early");
            data.extend_from_slice(&buf[..n]);
        }
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("timed out waiting for matchmaker connect")
            .unwrap()
            .0
    }

    #[test]
    fn test_message_shapes() {
        let msg = MatchmakerMessage::Connect {
            address: "1.2.3.4".to_string(),
            port: 80,
            ready: true,
            player_connected: false,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type":"connect","address":"1.2.3.4","port":80,"ready":true,"playerConnected":false})
        );
        assert_eq!(
            serde_json::to_value(&MatchmakerMessage::ClientDisconnected).unwrap(),
            json!({"type":"clientDisconnected"})
        );
    }

    #[test]
    fn test_connect_message_reflects_registry() {
        let registry = Arc::new(SharedRegistry::new());
        let handler = MatchmakerHandler::new(&MatchmakerConfig::default(), registry.clone());

        match handler.connect_message() {
            MatchmakerMessage::Connect { ready, player_connected, .. } => {
                assert!(!ready);
                assert!(!player_connected);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let (streamer, _srx) = Connection::new();
        let (player, _prx) = Connection::new();
        {
            let mut reg = registry.lock();
            reg.register_streamer("S1", streamer);
            reg.register_player(Player::new("1", player, PlayerKind::Regular, false));
        }

        match handler.connect_message() {
            MatchmakerMessage::Connect { ready, player_connected, .. } => {
                assert!(ready);
                assert!(player_connected);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_disabled_notifier_is_silent() {
        let notifier = MatchmakerNotifier::disabled();
        assert!(notifier.tx.is_none());
        notifier.streamer_connected();
        notifier.shutdown();
    }

    #[test]
    fn test_notifier_survives_dead_link() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let notifier = MatchmakerNotifier::new(tx);
        notifier.client_connected();
    }

    #[tokio::test]
    async fn test_reconnect_resends_current_readiness() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = Arc::new(SharedRegistry::new());
        let config = MatchmakerConfig {
            address: "127.0.0.1".to_string(),
            port,
            public_address: "10.0.0.1".to_string(),
            public_port: 8080,
            retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(60),
        };
        let client = MatchmakerClient::spawn(&config, registry.clone());

        let mut first = accept(&listener).await;
        let messages = read_messages(&mut first, 1).await;
        assert_eq!(
            messages[0],
            json!({"type":"connect","address":"10.0.0.1","port":8080,"ready":false,"playerConnected":false})
        );

        // A streamer arrives, then the link is severed mid-session
        let (streamer, _srx) = Connection::new();
        registry.lock().register_streamer("S1", streamer);
        drop(first);

        let mut second = accept(&listener).await;
        let messages = read_messages(&mut second, 1).await;
        assert_eq!(messages[0]["type"], "connect");
        assert_eq!(messages[0]["ready"], true);

        // The connect bytes were already consumed above
        client.notifier.streamer_disconnected();
        let messages = read_messages(&mut second, 1).await;
        assert_eq!(messages[0], json!({"type":"streamerDisconnected"}));

        client.notifier.shutdown();
        tokio::time::timeout(Duration::from_secs(5), client.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
