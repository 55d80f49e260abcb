//! Message router: connection lifecycle and per-role dispatch.
//!
//! [`Relay`] is the single entry point for every streamer, SFU and player
//! event. Each inbound frame is decoded into the role's message-kind enum and
//! dispatched; every handler takes the registry lock once, so the transition
//! it performs is observed atomically by other connection tasks.

use crate::cascade::disconnect_subscribers;
use crate::connection::Connection;
use crate::error::{CapacityError, ProtocolError};
use crate::matchmaker::MatchmakerNotifier;
use crate::message_log::MessageLog;
use crate::protocol::{
    close_code, decode, id_field, player_id_of, Inbound, Payload, PlayerMessageType,
    ServerMessage, SfuMessageType, StreamerMessageType, PLAYER_ID_FIELD,
};
use crate::registry::{Player, PlayerKind, Registry, SharedRegistry, LEGACY_STREAMER_ID, SFU_ID};
use crate::subscription::SubscriptionManager;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Relay behaviour knobs.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Maximum concurrent regular players. Negative means unlimited.
    pub max_player_count: i64,
    /// Sent verbatim to streamers and players in the `config` greeting.
    pub peer_connection_options: Value,
    /// Log every routed message at info instead of debug.
    pub log_verbose: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            max_player_count: -1,
            peer_connection_options: Value::Object(Map::new()),
            log_verbose: false,
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub streamers: usize,
    pub players: usize,
    pub sfu: bool,
}

/// Per-socket state of a streamer connection.
#[derive(Debug)]
pub struct StreamerSession {
    id: String,
    connection: Arc<Connection>,
}

impl StreamerSession {
    /// The id this connection is currently registered under.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

/// Routes signalling messages between streamers, the SFU and players.
pub struct Relay {
    registry: Arc<SharedRegistry>,
    matchmaker: MatchmakerNotifier,
    subscriptions: SubscriptionManager,
    log: MessageLog,
    options: RelayOptions,
}

impl Relay {
    /// Create a new relay over a shared registry.
    pub fn new(
        registry: Arc<SharedRegistry>,
        matchmaker: MatchmakerNotifier,
        options: RelayOptions,
    ) -> Self {
        let log = MessageLog::new(options.log_verbose);
        Self {
            registry,
            matchmaker,
            subscriptions: SubscriptionManager::new(log),
            log,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    pub fn health(&self) -> HealthStatus {
        let registry = self.registry.lock();
        HealthStatus {
            status: "ok",
            streamers: registry.streamer_count(),
            players: registry.regular_player_count(),
            sfu: registry.sfu().is_some(),
        }
    }

    // ========================================================================
    // Streamers
    // ========================================================================

    /// Greet a new streamer and hold it under the legacy id until it
    /// identifies itself.
    pub fn streamer_connected(&self, connection: Arc<Connection>) -> StreamerSession {
        counter!("signalling_connections_total", "role" => "streamer").increment(1);
        self.matchmaker.streamer_connected();

        self.send_config("unknown", &connection);
        let identify = ServerMessage::Identify;
        self.log.outgoing("unknown", &identify);
        if let Err(e) = connection.send(&identify) {
            debug!("Failed to send identify: {}", e);
        }

        let mut registry = self.registry.lock();
        if registry.has_streamer(LEGACY_STREAMER_ID) {
            warn!(
                "Another streamer is still unidentified; the newest connection takes {}",
                LEGACY_STREAMER_ID
            );
        }
        registry.register_streamer(LEGACY_STREAMER_ID, connection.clone());
        self.update_gauges(&registry);

        StreamerSession {
            id: LEGACY_STREAMER_ID.to_string(),
            connection,
        }
    }

    /// Dispatch one frame from a streamer. An error means the connection
    /// must be closed with the error's code and reason.
    pub fn handle_streamer_message(
        &self,
        session: &mut StreamerSession,
        text: &str,
    ) -> Result<(), ProtocolError> {
        let Inbound { kind, payload } = decode::<StreamerMessageType>(text)
            .map_err(|e| self.protocol_error(&session.id, text, e))?;

        match kind {
            StreamerMessageType::EndpointId => self.on_endpoint_id(session, &payload),
            StreamerMessageType::Ping => {
                self.log.incoming(&session.id, &payload);
                let pong = ServerMessage::Pong {
                    time: payload.get("time").cloned(),
                };
                self.log.outgoing(&session.id, &pong);
                if let Err(e) = session.connection.send(&pong) {
                    debug!("Failed to send pong to {}: {}", session.id, e);
                }
            }
            StreamerMessageType::Offer
            | StreamerMessageType::Answer
            | StreamerMessageType::IceCandidate => {
                self.forward_to_player(&session.id, payload, true);
            }
            StreamerMessageType::DisconnectPlayer => self.on_disconnect_player(session, &payload),
            StreamerMessageType::LayerPreference => {
                let registry = self.registry.lock();
                if registry.sfu().is_some() {
                    self.log.outgoing(SFU_ID, &payload);
                    self.subscriptions.send_to(&registry, SFU_ID, &payload);
                } else {
                    debug!("No SFU connected, dropping layerPreference from {}", session.id);
                }
            }
        }
        Ok(())
    }

    fn on_endpoint_id(&self, session: &mut StreamerSession, payload: &Payload) {
        self.log.incoming(&session.id, payload);
        let Some(new_id) = id_field(payload, "id") else {
            warn!("Streamer {} sent endpointId without an id", session.id);
            return;
        };

        let mut registry = self.registry.lock();
        let old_id = std::mem::replace(&mut session.id, new_id.clone());

        // Same connection changing id: its subscribers follow it
        if old_id != new_id && registry.streamer_is(&old_id, session.connection.id) {
            registry.unregister_streamer(&old_id);
            let moved = registry.rebind_subscribers(&old_id, &new_id);
            if moved > 0 {
                debug!("Moved {} subscriptions from {} to {}", moved, old_id, new_id);
            }
        }
        registry.register_streamer(new_id.clone(), session.connection.clone());

        // Any identified streamer retires the legacy placeholder
        if new_id != LEGACY_STREAMER_ID && registry.has_streamer(LEGACY_STREAMER_ID) {
            disconnect_subscribers(&mut registry, &self.subscriptions, LEGACY_STREAMER_ID);
            registry.unregister_streamer(LEGACY_STREAMER_ID);
        }

        // The SFU follows the latest identified streamer
        if new_id != SFU_ID && registry.sfu().is_some() {
            self.subscriptions.subscribe(&mut registry, SFU_ID, &new_id);
        }

        self.update_gauges(&registry);
    }

    fn on_disconnect_player(&self, session: &StreamerSession, payload: &Payload) {
        self.log.incoming(&session.id, payload);
        let Some(player_id) = player_id_of(payload) else {
            warn!("Streamer {} sent disconnectPlayer without a playerId", session.id);
            return;
        };
        let reason = payload.get("reason").and_then(Value::as_str).unwrap_or_default();

        let registry = self.registry.lock();
        match registry.player(&player_id) {
            Some(player) => {
                info!("Streamer {} disconnects player {}: {}", session.id, player_id, reason);
                player.connection.close(close_code::INTERNAL_ERROR, reason);
            }
            None => {
                counter!("signalling_routing_misses_total", "kind" => "player").increment(1);
                warn!("disconnectPlayer: player {} is not connected", player_id);
            }
        }
    }

    /// Clean up after a streamer socket closed or failed.
    pub fn streamer_disconnected(&self, session: &StreamerSession) {
        let mut registry = self.registry.lock();
        if !registry.streamer_is(&session.id, session.connection.id) {
            debug!(
                "Streamer {} closed after its id was taken over; nothing to clean up",
                session.id
            );
            return;
        }
        info!("Streamer {} disconnected", session.id);

        // Media relayed by the SFU from this streamer is gone too
        if registry.sfu().is_some_and(|sfu| sfu.is_subscribed_to(&session.id)) {
            let msg = ServerMessage::StreamerDisconnected;
            self.log.outgoing(SFU_ID, &msg);
            self.subscriptions.send_to(&registry, SFU_ID, &msg);
            disconnect_subscribers(&mut registry, &self.subscriptions, SFU_ID);
        }

        let outcome = disconnect_subscribers(&mut registry, &self.subscriptions, &session.id);
        if outcome.sfu_unsubscribed {
            debug!("SFU unsubscribed from departed streamer {}", session.id);
        }
        if !outcome.closed_players.is_empty() {
            info!(
                "Closed players {:?} of departed streamer {}",
                outcome.closed_players, session.id
            );
        }
        registry.unregister_streamer(&session.id);
        self.update_gauges(&registry);
        drop(registry);

        self.matchmaker.streamer_disconnected();
    }

    // ========================================================================
    // SFU
    // ========================================================================

    /// Admit the SFU: register it as a player and as a streamer, subscribed
    /// to some existing streamer. A second SFU is refused.
    pub fn sfu_connected(&self, connection: Arc<Connection>) -> Result<(), CapacityError> {
        let mut registry = self.registry.lock();
        if registry.sfu().is_some() {
            counter!("signalling_rejections_total", "reason" => "sfu_exists").increment(1);
            warn!("Rejecting SFU connection: an SFU is already registered");
            return Err(CapacityError::SfuAlreadyConnected);
        }

        counter!("signalling_connections_total", "role" => "sfu").increment(1);
        registry.register_player(Player::new(SFU_ID, connection.clone(), PlayerKind::Sfu, false));
        info!("SFU connected");

        if let Some(streamer_id) = registry.any_streamer_id(SFU_ID) {
            self.subscriptions.subscribe(&mut registry, SFU_ID, &streamer_id);
        }

        registry.register_streamer(SFU_ID, connection);
        self.update_gauges(&registry);
        Ok(())
    }

    /// Dispatch one frame from the SFU.
    pub fn handle_sfu_message(&self, text: &str) -> Result<(), ProtocolError> {
        let Inbound { kind, mut payload } = decode::<SfuMessageType>(text)
            .map_err(|e| self.protocol_error(SFU_ID, text, e))?;

        match kind {
            // Forwarded exactly as received, playerId included
            SfuMessageType::Offer => self.forward_to_player(SFU_ID, payload, false),
            SfuMessageType::Answer | SfuMessageType::StreamerDataChannels => {
                payload.insert("sfuId".to_string(), Value::String(SFU_ID.to_string()));
                let mut registry = self.registry.lock();
                self.subscriptions.send_from(&mut registry, SFU_ID, payload);
            }
            SfuMessageType::PeerDataChannels => {
                let Some(player_id) = player_id_of(&payload) else {
                    warn!("SFU sent peerDataChannels without a playerId");
                    return Ok(());
                };
                let mut registry = self.registry.lock();
                self.log.forward(SFU_ID, &player_id, &payload);
                if self.subscriptions.send_to(&registry, &player_id, &payload) {
                    if let Some(player) = registry.player_mut(&player_id) {
                        player.has_data_channel = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Clean up after the SFU socket closed or failed.
    pub fn sfu_disconnected(&self, connection: &Connection) {
        let mut registry = self.registry.lock();
        if !registry
            .sfu()
            .is_some_and(|sfu| sfu.connection.id == connection.id)
        {
            return;
        }
        info!("disconnecting SFU from streamer");

        disconnect_subscribers(&mut registry, &self.subscriptions, SFU_ID);
        self.subscriptions.unsubscribe(&mut registry, SFU_ID);
        if let Some(sfu) = registry.unregister_player(SFU_ID) {
            sfu.connection.close(close_code::SFU_DISCONNECTED, "SFU Disconnected");
        }
        registry.unregister_streamer(SFU_ID);
        self.update_gauges(&registry);
    }

    // ========================================================================
    // Players
    // ========================================================================

    /// Admit a player, or refuse it if the player limit is reached.
    /// Returns the allocated player id.
    pub fn player_connected(
        &self,
        connection: Arc<Connection>,
        browser_sends_offer: bool,
    ) -> Result<String, CapacityError> {
        let mut registry = self.registry.lock();

        let max = self.options.max_player_count;
        let current = registry.regular_player_count();
        if max >= 0 && current as i64 + 1 > max {
            info!(
                "new connection would exceed number of allowed concurrent connections. Max: {}, Current {}",
                max, current
            );
            counter!("signalling_rejections_total", "reason" => "too_many_players").increment(1);
            return Err(CapacityError::TooManyPlayers { max, current });
        }

        let player_id = registry.allocate_player_id();
        registry.register_player(Player::new(
            player_id.clone(),
            connection.clone(),
            PlayerKind::Regular,
            browser_sends_offer,
        ));
        counter!("signalling_connections_total", "role" => "player").increment(1);
        info!("player {} connected", player_id);

        self.matchmaker.client_connected();
        self.send_config(&player_id, &connection);
        self.broadcast_player_count(&registry);
        self.update_gauges(&registry);
        Ok(player_id)
    }

    /// Dispatch one frame from a player.
    pub fn handle_player_message(&self, player_id: &str, text: &str) -> Result<(), ProtocolError> {
        self.dispatch_player_message(player_id, text)
            .map_err(|e| self.protocol_error(player_id, text, e))
    }

    fn dispatch_player_message(&self, player_id: &str, text: &str) -> Result<(), ProtocolError> {
        let decoded = decode::<PlayerMessageType>(text);
        if let Err(err @ ProtocolError::Unparseable(_)) = &decoded {
            return Err(err.clone());
        }
        if self.registry.lock().player(player_id).is_none() {
            return Err(ProtocolError::UnknownPlayer(player_id.to_string()));
        }
        let Inbound { kind, payload } = decoded?;

        match kind {
            PlayerMessageType::Subscribe => {
                self.log.incoming(player_id, &payload);
                match id_field(&payload, "streamerId") {
                    Some(streamer_id) => {
                        let mut registry = self.registry.lock();
                        self.subscriptions.subscribe(&mut registry, player_id, &streamer_id);
                    }
                    None => warn!("Player {} sent subscribe without a streamerId", player_id),
                }
            }
            PlayerMessageType::Unsubscribe => {
                self.log.incoming(player_id, &payload);
                let mut registry = self.registry.lock();
                self.subscriptions.unsubscribe(&mut registry, player_id);
            }
            PlayerMessageType::Offer
            | PlayerMessageType::Answer
            | PlayerMessageType::IceCandidate
            | PlayerMessageType::DataChannelRequest
            | PlayerMessageType::PeerDataChannelsReady => {
                let mut registry = self.registry.lock();
                self.subscriptions.send_from(&mut registry, player_id, payload);
            }
            PlayerMessageType::ListStreamers => {
                self.log.incoming(player_id, &payload);
                let registry = self.registry.lock();
                let reply = ServerMessage::StreamerList {
                    ids: registry.streamer_ids(),
                };
                self.log.outgoing(player_id, &reply);
                self.subscriptions.send_to(&registry, player_id, &reply);
            }
            PlayerMessageType::Stats => {
                let data = payload.get("data").cloned().unwrap_or_default();
                info!("player {}: stats\n{}", player_id, data);
            }
        }
        Ok(())
    }

    /// Clean up after a player socket closed or failed.
    pub fn player_disconnected(&self, player_id: &str, connection: &Connection) {
        let mut registry = self.registry.lock();
        if !registry
            .player(player_id)
            .is_some_and(|p| p.connection.id == connection.id)
        {
            return;
        }

        self.subscriptions.unsubscribe(&mut registry, player_id);
        registry.unregister_player(player_id);
        info!("player {} disconnected", player_id);
        self.broadcast_player_count(&registry);
        self.update_gauges(&registry);
        drop(registry);

        self.matchmaker.client_disconnected();
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Forward a message to the player named by its `playerId`.
    fn forward_to_player(&self, source: &str, mut payload: Payload, strip_player_id: bool) {
        let Some(player_id) = player_id_of(&payload) else {
            counter!("signalling_routing_misses_total", "kind" => "player").increment(1);
            let message = Value::Object(payload);
            warn!(
                "No playerId specified, cannot forward message from {}: {}",
                source, message
            );
            return;
        };
        if strip_player_id {
            payload.remove(PLAYER_ID_FIELD);
        }

        let registry = self.registry.lock();
        if registry.player(&player_id).is_none() {
            counter!("signalling_routing_misses_total", "kind" => "player").increment(1);
            warn!("Player {} is gone, dropping message from {}", player_id, source);
            return;
        }
        self.log.forward(source, &player_id, &payload);
        self.subscriptions.send_to(&registry, &player_id, &payload);
    }

    fn send_config(&self, dest: &str, connection: &Connection) {
        let config = ServerMessage::Config {
            peer_connection_options: self.options.peer_connection_options.clone(),
        };
        self.log.outgoing(dest, &config);
        if let Err(e) = connection.send(&config) {
            debug!("Failed to send config to {}: {}", dest, e);
        }
    }

    fn broadcast_player_count(&self, registry: &Registry) {
        let msg = ServerMessage::PlayerCount {
            count: registry.player_count(),
        };
        self.log.outgoing("[players]", &msg);
        registry.broadcast_to_players(&msg);
    }

    fn update_gauges(&self, registry: &Registry) {
        gauge!("signalling_active_streamers").set(registry.streamer_count() as f64);
        gauge!("signalling_active_players").set(registry.regular_player_count() as f64);
    }

    fn protocol_error(&self, source: &str, raw: &str, err: ProtocolError) -> ProtocolError {
        let reason = match err {
            ProtocolError::Unparseable(_) => "unparseable",
            ProtocolError::UnsupportedType(_) => "unsupported_type",
            ProtocolError::UnknownPlayer(_) => "unknown_player",
        };
        counter!("signalling_protocol_errors_total", "reason" => reason).increment(1);
        self.log.unsupported(source, raw);
        error!("{}: {}", source, err);
        err
    }
}
