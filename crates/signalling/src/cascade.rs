//! Disconnect cascade: tear down every subscription to a departing streamer.
//!
//! Regular players subscribed to the streamer are closed (their own socket
//! task then runs the usual player cleanup). The SFU is only unsubscribed; its
//! connection stays open.

use crate::protocol::close_code;
use crate::registry::{PlayerKind, Registry};
use crate::subscription::SubscriptionManager;
use metrics::counter;
use tracing::info;

/// What a cascade did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Regular players whose connections were closed.
    pub closed_players: Vec<String>,
    /// Whether the SFU was among the subscribers and got unsubscribed.
    pub sfu_unsubscribed: bool,
}

/// Sever every subscription to `streamer_id`.
///
/// Iterates a snapshot of the subscribers. Every subscriber is unsubscribed
/// before its connection is closed, so no player references the streamer once
/// this returns, even before the closed sockets' tasks finish.
pub fn disconnect_subscribers(
    registry: &mut Registry,
    subscriptions: &SubscriptionManager,
    streamer_id: &str,
) -> CascadeOutcome {
    info!("unsubscribing all players on {}", streamer_id);
    let mut outcome = CascadeOutcome::default();

    for player_id in registry.subscribers_of(streamer_id) {
        let kind = match registry.player(&player_id) {
            Some(player) => player.kind,
            None => continue,
        };

        match kind {
            PlayerKind::Sfu => {
                subscriptions.unsubscribe(registry, &player_id);
                outcome.sfu_unsubscribed = true;
            }
            PlayerKind::Regular => {
                subscriptions.unsubscribe(registry, &player_id);
                if let Some(player) = registry.player(&player_id) {
                    player
                        .connection
                        .close(close_code::NORMAL, "streamer disconnected");
                    outcome.closed_players.push(player_id);
                }
            }
        }
    }

    counter!("signalling_cascade_closed_players_total")
        .increment(outcome.closed_players.len() as u64);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::registry::{Player, SFU_ID};
    use axum::extract::ws::Message;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn subscribed_player(
        registry: &mut Registry,
        id: &str,
        kind: PlayerKind,
        streamer_id: &str,
    ) -> (Arc<Connection>, UnboundedReceiver<Message>) {
        let (conn, rx) = Connection::new();
        let mut player = Player::new(id, conn.clone(), kind, false);
        player.subscribed_streamer_id = Some(streamer_id.to_string());
        registry.register_player(player);
        (conn, rx)
    }

    #[test]
    fn test_closes_all_regular_subscribers() {
        let mut registry = Registry::new();
        let (streamer, _srx) = Connection::new();
        registry.register_streamer("S1", streamer);
        let (other, _orx) = Connection::new();
        registry.register_streamer("S2", other);

        let subscribed: Vec<_> = (1..=3)
            .map(|n| subscribed_player(&mut registry, &n.to_string(), PlayerKind::Regular, "S1"))
            .collect();
        let (bystander, _brx) = subscribed_player(&mut registry, "4", PlayerKind::Regular, "S2");

        let mut outcome = disconnect_subscribers(&mut registry, &SubscriptionManager::default(), "S1");
        registry.unregister_streamer("S1");

        outcome.closed_players.sort();
        assert_eq!(outcome.closed_players, vec!["1", "2", "3"]);
        assert!(!outcome.sfu_unsubscribed);
        for (conn, _) in &subscribed {
            assert!(conn.is_closing());
        }
        assert!(!bystander.is_closing());
        assert!(registry.subscribers_of("S1").is_empty());
        assert!(registry.subscriptions_consistent());
    }

    #[test]
    fn test_closed_player_receives_close_frame() {
        let mut registry = Registry::new();
        let (streamer, _srx) = Connection::new();
        registry.register_streamer("S1", streamer);
        let (_conn, mut rx) = subscribed_player(&mut registry, "1", PlayerKind::Regular, "S1");

        disconnect_subscribers(&mut registry, &SubscriptionManager::default(), "S1");

        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_sfu_is_unsubscribed_not_closed() {
        let mut registry = Registry::new();
        let (streamer, mut streamer_rx) = Connection::new();
        registry.register_streamer("S1", streamer);
        let (sfu, _sfu_rx) = subscribed_player(&mut registry, SFU_ID, PlayerKind::Sfu, "S1");

        let outcome = disconnect_subscribers(&mut registry, &SubscriptionManager::default(), "S1");

        assert!(outcome.sfu_unsubscribed);
        assert!(outcome.closed_players.is_empty());
        assert!(!sfu.is_closing());
        assert!(registry.sfu().unwrap().subscribed_streamer_id.is_none());

        // Streamer still registered at this point, so it hears about the SFU leaving
        match streamer_rx.try_recv().unwrap() {
            Message::Text(text) => assert!(text.as_str().contains("playerDisconnected")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_no_subscribers_is_empty_outcome() {
        let mut registry = Registry::new();
        let outcome = disconnect_subscribers(&mut registry, &SubscriptionManager::default(), "S1");
        assert_eq!(outcome, CascadeOutcome::default());
    }
}
