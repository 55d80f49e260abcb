//! Signalling relay for WebRTC sessions between streamers and players.
//!
//! This service:
//! - Accepts WebSocket connections from streamers, players and one optional SFU
//! - Tracks who is connected and which player is subscribed to which streamer
//! - Relays SDP offers/answers and ICE candidates between the two sides
//! - Tears down dependent players when a streamer or the SFU goes away
//! - Reports availability to a matchmaker over a persistent TCP link
//!
//! ## Architecture
//!
//! ```text
//! streamers ─┐                          ┌─ players
//!            ├─ ws_server ─► Relay ◄────┤
//!      SFU  ─┘                │         └─ /health
//!                             ▼
//!                  SharedRegistry (one mutex)
//!                             │
//!                             ▼
//!            MatchmakerNotifier ─► LinkManager ─► matchmaker (TCP)
//! ```
//!
//! Payloads are opaque: only `type`, `playerId` and `streamerId` are ever
//! inspected.

pub mod cascade;
pub mod config;
pub mod connection;
pub mod error;
pub mod matchmaker;
pub mod message_log;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod subscription;
pub mod ws_server;

pub use cascade::{disconnect_subscribers, CascadeOutcome};
pub use config::SignallingConfig;
pub use connection::{Connection, ConnectionId};
pub use error::{CapacityError, ProtocolError, Result, SignallingError};
pub use matchmaker::{MatchmakerClient, MatchmakerConfig, MatchmakerMessage, MatchmakerNotifier};
pub use protocol::{PlayerMessageType, ServerMessage, SfuMessageType, StreamerMessageType};
pub use registry::{Player, PlayerKind, Registry, SharedRegistry, LEGACY_STREAMER_ID, SFU_ID};
pub use router::{HealthStatus, Relay, RelayOptions, StreamerSession};
pub use subscription::SubscriptionManager;
pub use ws_server::{run_servers, AppState, Listeners};
