//! Message names, the JSON envelope and the inbound payload structures.
//!
//! The wire format drifted between client builds: newer ones wrap their
//! fields in a `data` object, older ones put them at the top level. The
//! parser accepts both dialects; outgoing traffic is always the wrapped,
//! canonical form.

use crate::maze::GridPos;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// Client -> Server.

/// Binds the connection to a player identity.
pub const MSG_AUTH: &str = "auth";
/// Position report, validated server-side.
pub const MSG_MOVE: &str = "move";
/// Buy an item for this-match coins.
pub const MSG_PURCHASE_ITEM: &str = "purchase_item";
/// Use an item from the inventory.
pub const MSG_USE_ITEM: &str = "use_item";
/// Chat line; also broadcast back out under the same name.
pub const MSG_CHAT: &str = "chat_message";
/// Latency probe, answered with `pong`.
pub const MSG_PING: &str = "ping";

// Server -> Client.

pub const MSG_AUTH_SUCCESS: &str = "auth_success";
pub const MSG_AUTH_FAILED: &str = "auth_failed";
pub const MSG_PLAYER_DATA: &str = "player_data";
pub const MSG_MAZE_DATA: &str = "maze_data";
pub const MSG_PLAYER_JOIN: &str = "player_join";
pub const MSG_PLAYER_LEAVE: &str = "player_leave";
pub const MSG_PLAYER_MOVED: &str = "player_moved";
pub const MSG_GAME_STATE: &str = "game_state";
pub const MSG_ITEM_EFFECT: &str = "item_effect";
pub const MSG_GAME_EVENT: &str = "game_event";
pub const MSG_PONG: &str = "pong";
pub const MSG_ERROR: &str = "error";

// The `eventType` values inside `game_event`.

pub const EVENT_PLAYER_REACHED_GOAL: &str = "player_reached_goal";
pub const EVENT_COIN_COLLECTED: &str = "coin_collected";
pub const EVENT_GAME_OVER: &str = "game_over";

/// The error kinds carried inside `error` messages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorCode {
    InvalidMove,
    InsufficientCoins,
    ItemNotOwned,
    PlayerNotFound,
    InvalidTarget,
    GameNotRunning,
    AuthFailed,
    ProtocolError,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMove => "INVALID_MOVE",
            ErrorCode::InsufficientCoins => "INSUFFICIENT_COINS",
            ErrorCode::ItemNotOwned => "ITEM_NOT_OWNED",
            ErrorCode::PlayerNotFound => "PLAYER_NOT_FOUND",
            ErrorCode::InvalidTarget => "INVALID_TARGET",
            ErrorCode::GameNotRunning => "GAME_NOT_RUNNING",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// A decoded inbound message: its type name and the payload fields,
/// normalized to the wrapped dialect.
#[derive(Debug)]
pub struct Inbound {
    pub kind: String,
    pub data: Value,
}

/// Parses one inbound text message.
///
/// Accepts both the canonical `{type, timestamp, data:{..}}` form and the
/// historical flat form where the payload fields sit next to `type`.
pub fn parse_envelope(raw: &str) -> Result<Inbound, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| format!("not valid JSON: {e}"))?;
    let Value::Object(mut fields) = value else {
        return Err("message is not a JSON object".into());
    };
    let kind = match fields.get("type") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err("missing message type".into()),
    };
    let data = match fields.remove("data") {
        Some(data @ Value::Object(_)) => data,
        // Flat dialect: everything except the envelope fields is payload.
        _ => {
            let mut rest = Map::new();
            for (key, value) in fields {
                if key != "type" && key != "timestamp" {
                    rest.insert(key, value);
                }
            }
            Value::Object(rest)
        }
    };
    Ok(Inbound { kind, data })
}

/// Builds one outbound text message in the canonical wrapped form.
pub fn envelope(kind: &str, timestamp_ms: i64, data: Value) -> String {
    json!({
        "type": kind,
        "timestamp": timestamp_ms,
        "data": data,
    })
    .to_string()
}

/// Payload of `auth`.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    #[serde(default)]
    pub player_id: Option<String>,
    pub player_name: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Payload of `move`.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MoveReport {
    pub position: crate::maze::FloatPos,
    #[serde(default)]
    pub rotation: f32,
}

/// Payload of `purchase_item`.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub item_type: String,
}

/// Payload of `use_item`.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UseItemRequest {
    pub item_type: String,
    #[serde(default)]
    pub target_player_id: Option<String>,
    #[serde(default)]
    pub target_position: Option<TargetCell>,
}

/// Target cells arrive either as `[x, y, z]` or as `{x, y, z}`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(untagged)]
pub enum TargetCell {
    Triple([i32; 3]),
    Named(GridPos),
}

impl From<TargetCell> for GridPos {
    fn from(cell: TargetCell) -> Self {
        match cell {
            TargetCell::Triple([x, y, z]) => GridPos::new(x, y, z),
            TargetCell::Named(pos) => pos,
        }
    }
}

/// Payload of `chat_message`.
#[derive(Deserialize, Serialize, Debug)]
pub struct ChatLine {
    pub message: String,
}

/// Payload of `ping`. The timestamp is echoed back untouched, whatever its type.
#[derive(Deserialize, Serialize, Debug)]
pub struct PingProbe {
    #[serde(default)]
    pub timestamp: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_dialect_is_accepted() {
        let inbound =
            parse_envelope(r#"{"type":"auth","timestamp":1,"data":{"playerName":"Alice"}}"#)
                .unwrap();
        assert_eq!(inbound.kind, "auth");
        assert_eq!(inbound.data["playerName"], "Alice");
    }

    #[test]
    fn flat_dialect_is_normalized() {
        let inbound = parse_envelope(r#"{"type":"auth","playerName":"Bob"}"#).unwrap();
        assert_eq!(inbound.kind, "auth");
        assert_eq!(inbound.data["playerName"], "Bob");
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(parse_envelope(r#"{"timestamp":5}"#).is_err());
        assert!(parse_envelope("[1,2,3]").is_err());
    }

    #[test]
    fn outbound_is_always_wrapped() {
        let raw = envelope(MSG_PONG, 42, serde_json::json!({"timestamp": 7}));
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["timestamp"], 42);
        assert_eq!(value["data"]["timestamp"], 7);
    }

    #[test]
    fn target_cell_accepts_both_shapes() {
        let as_array: UseItemRequest =
            serde_json::from_str(r#"{"itemType":"hammer","targetPosition":[2,0,3]}"#).unwrap();
        let as_object: UseItemRequest =
            serde_json::from_str(r#"{"itemType":"hammer","targetPosition":{"x":2,"y":0,"z":3}}"#)
                .unwrap();
        assert_eq!(
            GridPos::from(as_array.target_position.unwrap()),
            GridPos::new(2, 0, 3)
        );
        assert_eq!(
            GridPos::from(as_object.target_position.unwrap()),
            GridPos::new(2, 0, 3)
        );
    }
}
