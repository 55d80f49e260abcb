//! Player ↔ streamer subscriptions.
//!
//! A subscription is the directed relation from a player to the streamer it
//! exchanges session messages with. Attaching and detaching announce the
//! player to the streamer (`playerConnected` / `playerDisconnected`).
//!
//! Every operation takes the locked [`Registry`], so a caller composes several
//! of them into one atomic transition.

use crate::message_log::MessageLog;
use crate::protocol::{Payload, ServerMessage, PLAYER_ID_FIELD};
use crate::registry::{PlayerKind, Registry};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

/// Subscription operations on players held in a [`Registry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionManager {
    log: MessageLog,
}

impl SubscriptionManager {
    pub fn new(log: MessageLog) -> Self {
        Self { log }
    }

    /// Attach a player to a streamer and announce it with `playerConnected`.
    ///
    /// Fails (logged, no state change) if the streamer is not registered.
    /// A player subscribed elsewhere is unsubscribed from there first.
    pub fn subscribe(&self, registry: &mut Registry, player_id: &str, streamer_id: &str) -> bool {
        if !registry.has_streamer(streamer_id) {
            error!(
                "subscribe: Player {} tried to subscribe to a non-existent streamer {}",
                player_id, streamer_id
            );
            counter!("signalling_routing_misses_total", "kind" => "subscribe").increment(1);
            return false;
        }

        let previous = match registry.player(player_id) {
            Some(player) => player.subscribed_streamer_id.clone(),
            None => {
                warn!("subscribe: Player {} is not registered", player_id);
                return false;
            }
        };
        if previous.as_deref().is_some_and(|prev| prev != streamer_id) {
            self.unsubscribe(registry, player_id);
        }

        let Some(player) = registry.player_mut(player_id) else {
            return false;
        };
        player.subscribed_streamer_id = Some(streamer_id.to_string());

        let msg = ServerMessage::PlayerConnected {
            player_id: player_id.to_string(),
            data_channel: true,
            sfu: player.kind == PlayerKind::Sfu,
            send_offer: !player.browser_sends_offer,
        };
        self.log.outgoing(streamer_id, &msg);
        self.send_to_streamer(registry, player_id, streamer_id, &msg);
        true
    }

    /// Detach a player. The streamer is told with `playerDisconnected` if it
    /// is still registered; the subscription is cleared either way.
    pub fn unsubscribe(&self, registry: &mut Registry, player_id: &str) {
        let Some(player) = registry.player_mut(player_id) else {
            return;
        };
        let Some(streamer_id) = player.subscribed_streamer_id.take() else {
            return;
        };

        if registry.has_streamer(&streamer_id) {
            let msg = ServerMessage::PlayerDisconnected {
                player_id: player_id.to_string(),
            };
            self.log.outgoing(&streamer_id, &msg);
            self.send_to_streamer(registry, player_id, &streamer_id, &msg);
        }
    }

    /// Proxy a message from a player to its streamer, stamping `playerId`
    /// unless the message already carries one.
    ///
    /// An unsubscribed player falls back to some registered streamer, which
    /// then becomes its subscription. With no streamer at all the message is
    /// dropped.
    pub fn send_from(&self, registry: &mut Registry, player_id: &str, mut payload: Payload) -> bool {
        let subscribed = match registry.player(player_id) {
            Some(player) => player.subscribed_streamer_id.clone(),
            None => {
                warn!("sendFrom: Player {} is not registered", player_id);
                return false;
            }
        };

        let streamer_id = match subscribed {
            Some(id) => id,
            None => match registry.any_streamer_id(player_id) {
                Some(id) => {
                    info!(
                        "Player {} attempted to send an outgoing message without having subscribed first. Defaulting to {}",
                        player_id, id
                    );
                    if let Some(player) = registry.player_mut(player_id) {
                        player.subscribed_streamer_id = Some(id.clone());
                    }
                    id
                }
                None => {
                    info!(
                        "Player {} attempted to send an outgoing message without having subscribed first. No streamer connected so this message isn't going anywhere!",
                        player_id
                    );
                    counter!("signalling_routing_misses_total", "kind" => "no_streamer").increment(1);
                    return false;
                }
            },
        };

        let stamped = payload
            .get(PLAYER_ID_FIELD)
            .is_some_and(|v| !v.is_null() && v.as_str() != Some(""));
        if !stamped {
            payload.insert(PLAYER_ID_FIELD.to_string(), Value::String(player_id.to_string()));
        }

        self.log.forward(player_id, &streamer_id, &payload);
        self.send_to_streamer(registry, player_id, &streamer_id, &payload)
    }

    /// Send a message straight to a player's own connection.
    pub fn send_to<T: Serialize + ?Sized>(&self, registry: &Registry, player_id: &str, msg: &T) -> bool {
        let Some(player) = registry.player(player_id) else {
            warn!("sendTo: Player {} is not registered", player_id);
            counter!("signalling_routing_misses_total", "kind" => "player").increment(1);
            return false;
        };
        match player.connection.send(msg) {
            Ok(()) => {
                counter!("signalling_messages_forwarded_total").increment(1);
                true
            }
            Err(e) => {
                warn!("Failed to send to player {}: {}", player_id, e);
                false
            }
        }
    }

    fn send_to_streamer<T: Serialize + ?Sized>(
        &self,
        registry: &Registry,
        player_id: &str,
        streamer_id: &str,
        msg: &T,
    ) -> bool {
        let Some(streamer) = registry.streamer(streamer_id) else {
            error!(
                "sendFrom: Player {} subscribed to non-existent streamer: {}",
                player_id, streamer_id
            );
            counter!("signalling_routing_misses_total", "kind" => "streamer").increment(1);
            return false;
        };
        match streamer.send(msg) {
            Ok(()) => {
                counter!("signalling_messages_forwarded_total").increment(1);
                true
            }
            Err(e) => {
                warn!("Failed to send to streamer {}: {}", streamer_id, e);
                false
            }
        }
    }
}
