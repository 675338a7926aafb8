use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Kinds of caller actions that may be held back while offline
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Tap,
    PurchaseGenerator,
    PurchaseUpgrade,
    SyncRequest,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Tap => "tap",
            ActionKind::PurchaseGenerator => "purchase_generator",
            ActionKind::PurchaseUpgrade => "purchase_upgrade",
            ActionKind::SyncRequest => "sync_request",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Tap {
        count: u32,
        combo_multiplier: f64,
        client_seqs: Vec<u64>,
    },
    #[serde(rename_all = "camelCase")]
    PurchaseGenerator {
        generator_id: String,
        count: u32,
        client_seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    PurchaseUpgrade { upgrade_id: String, client_seq: u64 },
    SyncRequest {},
    Pong {},
}

impl ClientMessage {
    /// `None` for keepalive traffic, which is never queued
    pub fn action_kind(&self) -> Option<ActionKind> {
        match self {
            ClientMessage::Tap { .. } => Some(ActionKind::Tap),
            ClientMessage::PurchaseGenerator { .. } => Some(ActionKind::PurchaseGenerator),
            ClientMessage::PurchaseUpgrade { .. } => Some(ActionKind::PurchaseUpgrade),
            ClientMessage::SyncRequest {} => Some(ActionKind::SyncRequest),
            ClientMessage::Pong {} => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    StateFull(StateFull),
    StateDelta(StateDelta),
    TapConfirmed(TapConfirmed),
    ActionRejected(ActionRejected),
    Error(Value),
    Ping {},
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::StateFull(_) => "state_full",
            ServerMessage::StateDelta(_) => "state_delta",
            ServerMessage::TapConfirmed(_) => "tap_confirmed",
            ServerMessage::ActionRejected(_) => "action_rejected",
            ServerMessage::Error(_) => "error",
            ServerMessage::Ping {} => "ping",
        }
    }
}

/// Merged authoritative + speculative view handed to observers
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GameStateSnapshot {
    pub essence: f64,
    pub lifetime_essence: f64,
    pub production_per_second: f64,
    pub click_power: f64,
    pub crit_chance: f64,
    pub crit_multiplier: f64,
    pub total_clicks: u64,
    pub generators: BTreeMap<String, u64>,
    pub purchased_upgrades: Vec<String>,
    pub confirmed_server_seq: u64,
    pub last_sync_timestamp: u64,
}

impl GameStateSnapshot {
    /// Fresh session state before the first server sync: one essence per tap.
    pub fn new() -> Self {
        Self {
            click_power: 1.0,
            crit_multiplier: 1.0,
            ..Self::default()
        }
    }
}

/// Full restatement of the authoritative state. Every field is required.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StateFull {
    pub essence: f64,
    pub lifetime_essence: f64,
    pub production_per_second: f64,
    pub click_power: f64,
    pub crit_chance: f64,
    pub crit_multiplier: f64,
    pub total_clicks: u64,
    pub generators: BTreeMap<String, u64>,
    pub purchased_upgrades: Vec<String>,
    pub seq: u64,
    pub server_timestamp: u64,
}

/// Subset of authoritative fields; absent fields are left untouched
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub essence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime_essence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crit_chance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crit_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_clicks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generators: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchased_upgrades: Option<Vec<String>>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        *self == StatePatch::default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    #[serde(flatten)]
    pub patch: StatePatch,
    /// Every clientSeq up to and including this one has been applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_client_seq: Option<u64>,
    pub seq: u64,
    pub server_timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TapConfirmed {
    pub essence: f64,
    pub lifetime_essence: f64,
    pub total_clicks: u64,
    pub confirmed_client_seqs: Vec<u64>,
    pub seq: u64,
    #[serde(default)]
    pub completed_challenges: Vec<String>,
    pub server_timestamp: u64,
}

impl TapConfirmed {
    pub fn patch(&self) -> StatePatch {
        StatePatch {
            essence: Some(self.essence),
            lifetime_essence: Some(self.lifetime_essence),
            total_clicks: Some(self.total_clicks),
            ..StatePatch::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionRejected {
    #[serde(default)]
    pub reason: String,
    pub client_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_state: Option<StatePatch>,
}

/// Outer frame of every message: `{"type": ..., "payload": ...}`
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not a JSON object with a string `type` field
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid '{kind}' payload: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

const SERVER_MESSAGE_TYPES: [&str; 6] = [
    "state_full",
    "state_delta",
    "tap_confirmed",
    "action_rejected",
    "error",
    "ping",
];

pub fn encode_client_message(message: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decodes a server frame. A missing or `null` payload is read as `{}` so that
/// bare `{"type":"ping"}` frames are accepted.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError::Malformed)?;

    if !SERVER_MESSAGE_TYPES.contains(&envelope.kind.as_str()) {
        return Err(DecodeError::UnknownType(envelope.kind));
    }

    let payload = match envelope.payload {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };

    let mut frame = serde_json::Map::new();
    frame.insert("type".to_string(), Value::String(envelope.kind.clone()));
    frame.insert("payload".to_string(), payload);

    serde_json::from_value(Value::Object(frame)).map_err(|source| DecodeError::InvalidPayload {
        kind: envelope.kind,
        source,
    })
}

/// Used by servers and test harnesses speaking the same protocol
pub fn decode_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
