//! WebSocket protocol message types.
//!
//! Inbound frames are JSON objects with a `type` field. Each connection role
//! has its own enum of supported types; everything besides the routing fields
//! (`type`, `playerId`, `streamerId`) is passed through untouched, so the
//! decoded payload is kept as a raw JSON object.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw JSON object of an inbound or forwarded message.
pub type Payload = Map<String, Value>;

/// Name of the routing field that identifies a player.
pub const PLAYER_ID_FIELD: &str = "playerId";

/// Close codes used as a signalling vocabulary.
pub mod close_code {
    /// Normal closure (cascade teardown).
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (stale player socket).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation: bad JSON, unsupported type.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Internal error; also used by `disconnectPlayer`.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Capacity/policy rejection: too many players, duplicate SFU.
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// SFU forcibly disconnected.
    pub const SFU_DISCONNECTED: u16 = 4000;
}

// ============================================================================
// Inbound message types
// ============================================================================

/// Messages accepted from a streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamerMessageType {
    /// Streamer announces its id.
    EndpointId,
    /// Latency probe, answered with `pong`.
    Ping,
    Offer,
    Answer,
    IceCandidate,
    /// Force-close a player.
    DisconnectPlayer,
    /// Simulcast layer choice, relayed to the SFU.
    LayerPreference,
}

/// Messages accepted from the SFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SfuMessageType {
    Offer,
    Answer,
    StreamerDataChannels,
    PeerDataChannels,
}

/// Messages accepted from a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerMessageType {
    Subscribe,
    Unsubscribe,
    Offer,
    Answer,
    IceCandidate,
    DataChannelRequest,
    PeerDataChannelsReady,
    ListStreamers,
    Stats,
}

/// A decoded inbound frame: its kind plus the untouched JSON object.
#[derive(Debug, Clone)]
pub struct Inbound<K> {
    pub kind: K,
    pub payload: Payload,
}

/// Decode a text frame for a role whose supported types are `K`.
///
/// Invalid JSON is [`ProtocolError::Unparseable`]; a non-object, a missing
/// `type` or a `type` outside `K` is [`ProtocolError::UnsupportedType`].
pub fn decode<K: DeserializeOwned>(text: &str) -> Result<Inbound<K>, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Unparseable(e.to_string()))?;

    let payload = match value {
        Value::Object(payload) => payload,
        other => return Err(ProtocolError::UnsupportedType(other.to_string())),
    };

    let type_name = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::UnsupportedType("<missing>".to_string()))?;

    let kind = serde_json::from_value(Value::String(type_name.clone()))
        .map_err(|_| ProtocolError::UnsupportedType(type_name))?;

    Ok(Inbound { kind, payload })
}

/// Read an id-like field, accepting both strings and numbers.
pub fn id_field(payload: &Payload, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The `playerId` a message is addressed to or stamped with.
pub fn player_id_of(payload: &Payload) -> Option<String> {
    id_field(payload, PLAYER_ID_FIELD)
}

// ============================================================================
// Server → peer messages
// ============================================================================

/// Messages originated by the relay itself.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Greeting carrying the peer connection options.
    Config { peer_connection_options: Value },
    /// Ask a streamer to announce its id.
    Identify,
    /// Answer to a streamer `ping`.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<Value>,
    },
    /// Tell a streamer a player subscribed to it.
    PlayerConnected {
        player_id: String,
        data_channel: bool,
        sfu: bool,
        send_offer: bool,
    },
    /// Tell a streamer a player went away.
    PlayerDisconnected { player_id: String },
    /// Answer to `listStreamers`.
    StreamerList { ids: Vec<String> },
    /// Number of registered players, broadcast on every admit/leave.
    PlayerCount { count: usize },
    /// Tell the SFU its streamer went away.
    StreamerDisconnected,
}
