//! Connection registry: streamer id → connection, player id → player.
//!
//! The registry is a plain state container with no I/O. It is shared behind
//! a single mutex ([`SharedRegistry`]) so that a subscribe, unsubscribe or
//! disconnect cascade is observed atomically by every other connection task.
//! Nothing inside the lock ever awaits: sends are channel pushes.

use crate::connection::{Connection, ConnectionId};
use crate::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Reserved id of the SFU, used in both the player and streamer maps.
pub const SFU_ID: &str = "SFU";

/// Placeholder id of a streamer that has not sent `endpointId` yet.
/// At most one unidentified streamer is tracked at a time.
pub const LEGACY_STREAMER_ID: &str = "__LEGACY__";

/// Role of a player entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    /// A browser viewer.
    Regular,
    /// The selective forwarding unit.
    Sfu,
}

/// A registered player (or the SFU).
#[derive(Debug)]
pub struct Player {
    pub id: String,
    pub connection: Arc<Connection>,
    pub kind: PlayerKind,
    /// The browser originates the SDP offer instead of the streamer.
    pub browser_sends_offer: bool,
    /// Streamer this player currently exchanges session messages with.
    pub subscribed_streamer_id: Option<String>,
    /// The SFU announced a peer data channel for this player.
    pub has_data_channel: bool,
}

impl Player {
    pub fn new(
        id: impl Into<String>,
        connection: Arc<Connection>,
        kind: PlayerKind,
        browser_sends_offer: bool,
    ) -> Self {
        Self {
            id: id.into(),
            connection,
            kind,
            browser_sends_offer,
            subscribed_streamer_id: None,
            has_data_channel: false,
        }
    }

    pub fn is_sfu(&self) -> bool {
        self.kind == PlayerKind::Sfu
    }

    /// Whether this player is subscribed to `streamer_id`.
    pub fn is_subscribed_to(&self, streamer_id: &str) -> bool {
        self.subscribed_streamer_id.as_deref() == Some(streamer_id)
    }
}

/// Streamer and player maps.
pub struct Registry {
    streamers: HashMap<String, Arc<Connection>>,
    players: HashMap<String, Player>,
    next_player_id: u64,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            streamers: HashMap::new(),
            players: HashMap::new(),
            next_player_id: 1,
        }
    }

    // ------------------------------------------------------------------
    // Streamers
    // ------------------------------------------------------------------

    /// Register a streamer, replacing any entry under the same id.
    /// Returns the replaced connection.
    pub fn register_streamer(
        &mut self,
        id: impl Into<String>,
        connection: Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        let id = id.into();
        let replaced = self.streamers.insert(id.clone(), connection);
        if replaced.is_some() {
            info!("Streamer {} re-registered", id);
        } else {
            info!("Streamer {} registered", id);
        }
        replaced
    }

    /// Remove a streamer. Absent ids are a no-op.
    pub fn unregister_streamer(&mut self, id: &str) -> Option<Arc<Connection>> {
        let removed = self.streamers.remove(id);
        if removed.is_some() {
            info!("Streamer {} unregistered", id);
        }
        removed
    }

    /// Get a streamer connection by id.
    pub fn streamer(&self, id: &str) -> Option<&Arc<Connection>> {
        self.streamers.get(id)
    }

    pub fn has_streamer(&self, id: &str) -> bool {
        self.streamers.contains_key(id)
    }

    /// Whether `id` is currently registered to exactly this connection.
    pub fn streamer_is(&self, id: &str, connection: ConnectionId) -> bool {
        self.streamers.get(id).is_some_and(|c| c.id == connection)
    }

    /// All registered streamer ids, sorted.
    pub fn streamer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streamers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Some registered streamer other than `except`, in map iteration order.
    /// Not a stable choice.
    pub fn any_streamer_id(&self, except: &str) -> Option<String> {
        self.streamers.keys().find(|id| id.as_str() != except).cloned()
    }

    pub fn streamer_count(&self) -> usize {
        self.streamers.len()
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Allocate the next regular player id ("1", "2", ...).
    pub fn allocate_player_id(&mut self) -> String {
        let id = self.next_player_id;
        self.next_player_id += 1;
        id.to_string()
    }

    /// Register a player under its id.
    pub fn register_player(&mut self, player: Player) {
        debug!("Player {} registered ({:?})", player.id, player.kind);
        if let Some(previous) = self.players.insert(player.id.clone(), player) {
            warn!("Player {} replaced an existing entry", previous.id);
        }
    }

    /// Remove a player. Absent ids are a no-op.
    pub fn unregister_player(&mut self, id: &str) -> Option<Player> {
        let removed = self.players.remove(id);
        if removed.is_some() {
            debug!("Player {} unregistered", id);
        }
        removed
    }

    /// Get a player by id.
    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn player_mut(&mut self, id: &str) -> Option<&mut Player> {
        self.players.get_mut(id)
    }

    /// The SFU, if one is connected.
    pub fn sfu(&self) -> Option<&Player> {
        self.players.get(SFU_ID).filter(|p| p.is_sfu())
    }

    /// Number of player entries, SFU included.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Number of regular (non-SFU) players.
    pub fn regular_player_count(&self) -> usize {
        self.players.values().filter(|p| !p.is_sfu()).count()
    }

    /// Snapshot of the ids of all players subscribed to `streamer_id`.
    pub fn subscribers_of(&self, streamer_id: &str) -> Vec<String> {
        self.players
            .values()
            .filter(|p| p.is_subscribed_to(streamer_id))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Point every subscription of `from` at `to` without notifying anyone.
    /// Used when a streamer changes id on the same connection.
    pub fn rebind_subscribers(&mut self, from: &str, to: &str) -> usize {
        let mut count = 0;
        for player in self.players.values_mut() {
            if player.is_subscribed_to(from) {
                player.subscribed_streamer_id = Some(to.to_string());
                count += 1;
            }
        }
        count
    }

    /// Send a message to every player. Failures are logged and skipped.
    pub fn broadcast_to_players(&self, msg: &ServerMessage) {
        // Pre-serialize the message once
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };

        for player in self.players.values() {
            if let Err(e) = player.connection.send_text(json.clone()) {
                debug!("Failed to send to player {}: {}", player.id, e);
            }
        }
    }

    /// Whether every subscription references a registered streamer.
    pub fn subscriptions_consistent(&self) -> bool {
        self.players.values().all(|p| {
            p.subscribed_streamer_id
                .as_deref()
                .map_or(true, |id| self.streamers.contains_key(id))
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry shared between connection tasks and the matchmaker link.
#[derive(Default)]
pub struct SharedRegistry {
    inner: Mutex<Registry>,
}

impl SharedRegistry {
    /// Create a new empty shared registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry. A poisoned lock is recovered: the maps stay usable
    /// even if a handler panicked while holding it.
    pub fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
