//! Here the inbound messages become game state transitions. The dispatcher
//! binds connections to player identities, validates every payload, drives
//! the registry and the engine through their exclusion regions and fans the
//! resulting events out through the broadcaster.
//!
//! The engine never calls back in here; everything it has to say comes back
//! as return values that this module translates into wire messages.

use crate::broadcaster::Broadcaster;
use crate::engine::{EngineEvent, GameEngine, ItemEffect, PlayerState};
use crate::persistence::Persistence;
use crate::registry::PlayerRegistry;
use protocol::{
    AuthRequest, ChatLine, ErrorCode, FloatPos, GridPos, ItemKind, MoveReport, PingProbe,
    PurchaseRequest, UseItemRequest, envelope, messages,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::Mutex;

/// The sender name used for operator announcements.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Bijection between bound connections and players. A player holds at most
/// one live connection at any instant.
#[derive(Default)]
struct Sessions {
    by_conn: HashMap<u64, String>,
    by_player: HashMap<String, u64>,
}

pub struct Dispatcher {
    engine: Arc<Mutex<GameEngine>>,
    registry: Arc<Mutex<PlayerRegistry>>,
    broadcaster: Arc<Broadcaster>,
    persistence: Arc<Persistence>,
    sessions: StdMutex<Sessions>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A fingerprint stand-in for clients that did not present an identity,
/// derived from the connection id in the canonical separator form.
fn surrogate_fingerprint(conn_id: u64) -> String {
    let bytes = conn_id.to_be_bytes();
    bytes[2..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn player_data_json(state: &PlayerState) -> Value {
    json!({
        "playerId": state.player_id,
        "name": state.display_name,
        "position": state.position,
        "rotation": state.yaw,
        "alive": state.alive,
        "hasCompass": state.has_compass,
        "coins": state.coins,
        "inventory": state.inventory,
        "reachedGoal": state.reached_goal,
        "finishRank": state.finish_rank,
    })
}

fn game_state_json(engine: &GameEngine, state: &PlayerState) -> Value {
    json!({
        "coins": state.coins,
        "inventory": state.inventory,
        "hasCompass": state.has_compass,
        "remainingCoins": engine.remaining_coins(),
        "finishedCount": engine.finished_count(),
        "running": engine.running(),
    })
}

impl Dispatcher {
    pub fn new(
        engine: Arc<Mutex<GameEngine>>,
        registry: Arc<Mutex<PlayerRegistry>>,
        broadcaster: Arc<Broadcaster>,
        persistence: Arc<Persistence>,
    ) -> Self {
        Dispatcher {
            engine,
            registry,
            broadcaster,
            persistence,
            sessions: StdMutex::new(Sessions::default()),
        }
    }

    pub fn bound_player(&self, conn_id: u64) -> Option<String> {
        self.sessions.lock().unwrap().by_conn.get(&conn_id).cloned()
    }

    pub fn connection_of(&self, player_id: &str) -> Option<u64> {
        self.sessions
            .lock()
            .unwrap()
            .by_player
            .get(player_id)
            .copied()
    }

    fn send(&self, conn_id: u64, kind: &str, data: Value) {
        self.broadcaster.send(conn_id, envelope(kind, now_ms(), data));
    }

    fn broadcast(&self, kind: &str, data: Value) {
        self.broadcaster.broadcast(envelope(kind, now_ms(), data));
    }

    fn broadcast_except(&self, conn_id: u64, kind: &str, data: Value) {
        self.broadcaster
            .broadcast_except(conn_id, envelope(kind, now_ms(), data));
    }

    fn send_error(&self, conn_id: u64, code: ErrorCode, message: &str) {
        self.send(
            conn_id,
            messages::MSG_ERROR,
            json!({ "code": code.as_str(), "message": message }),
        );
    }

    /// Entry point for every decoded text frame of a connection.
    pub async fn handle_message(&self, conn_id: u64, raw: &str) {
        let inbound = match protocol::parse_envelope(raw) {
            Ok(inbound) => inbound,
            Err(reason) => {
                tracing::warn!(conn_id, reason, "Unparseable message, closing.");
                self.send_error(conn_id, ErrorCode::ProtocolError, "malformed message");
                self.broadcaster.request_close(conn_id);
                return;
            }
        };

        match inbound.kind.as_str() {
            messages::MSG_AUTH => self.handle_auth(conn_id, inbound.data).await,
            messages::MSG_PING => self.handle_ping(conn_id, inbound.data),
            kind => {
                let Some(player_id) = self.bound_player(conn_id) else {
                    // Movement from unauthenticated peers is silently dropped,
                    // everything else earns a complaint.
                    if kind != messages::MSG_MOVE {
                        self.send_error(conn_id, ErrorCode::AuthFailed, "authenticate first");
                    }
                    return;
                };
                match kind {
                    messages::MSG_MOVE => self.handle_move(conn_id, &player_id, inbound.data).await,
                    messages::MSG_PURCHASE_ITEM => {
                        self.handle_purchase(conn_id, &player_id, inbound.data).await
                    }
                    messages::MSG_USE_ITEM => {
                        self.handle_use_item(conn_id, &player_id, inbound.data).await
                    }
                    messages::MSG_CHAT => self.handle_chat(conn_id, &player_id, inbound.data).await,
                    other => {
                        tracing::debug!(conn_id, other, "Unknown message type, closing.");
                        self.send_error(conn_id, ErrorCode::ProtocolError, "unknown message type");
                        self.broadcaster.request_close(conn_id);
                    }
                }
            }
        }
    }

    // ===================================================================
    // Auth.
    // ===================================================================

    async fn handle_auth(&self, conn_id: u64, data: Value) {
        let request: AuthRequest = match serde_json::from_value(data) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(conn_id, ?err, "Bad auth payload.");
                self.auth_failed(conn_id, "malformed auth payload");
                return;
            }
        };
        if self.bound_player(conn_id).is_some() {
            self.send_error(conn_id, ErrorCode::AuthFailed, "already authenticated");
            return;
        }

        let mut registry = self.registry.lock().await;
        let presented = request
            .player_id
            .as_deref()
            .filter(|id| registry.is_valid(id))
            .map(str::to_string);
        let player_id = match presented {
            Some(id) => id,
            None => {
                match registry
                    .register_or_resolve(&surrogate_fingerprint(conn_id), &request.player_name)
                {
                    Ok(id) => id,
                    Err(reason) => {
                        drop(registry);
                        tracing::warn!(conn_id, reason, "Registration failed.");
                        self.auth_failed(conn_id, "registration failed");
                        return;
                    }
                }
            }
        };
        let outcome = match registry.login(&player_id) {
            Ok(outcome) => outcome,
            Err(reason) => {
                drop(registry);
                tracing::warn!(conn_id, reason, "Login failed.");
                self.auth_failed(conn_id, "login failed");
                return;
            }
        };
        drop(registry);

        // A second session for the same player supersedes the first one.
        let prior_conn = {
            let mut sessions = self.sessions.lock().unwrap();
            let prior = sessions.by_player.remove(&player_id);
            if let Some(prior) = prior {
                sessions.by_conn.remove(&prior);
            }
            sessions.by_conn.insert(conn_id, player_id.clone());
            sessions.by_player.insert(player_id.clone(), conn_id);
            prior
        };
        if let Some(prior) = prior_conn {
            tracing::info!(player_id, prior, conn_id, "Session superseded.");
            self.broadcaster.request_close(prior);
        } else if outcome.superseded {
            tracing::warn!(player_id, "Online flag was stale, proceeding.");
        }

        let (player_json, maze_json) = {
            let mut engine = self.engine.lock().await;
            if engine.player(&player_id).is_none() {
                if let Err(err) = engine.add_player(&player_id, &request.player_name) {
                    drop(engine);
                    tracing::error!(player_id, ?err, "Could not add player to the match.");
                    self.auth_failed(conn_id, "could not join the match");
                    return;
                }
            }
            let state = engine.player(&player_id).expect("player was just added");
            (player_data_json(state), serde_json::to_value(engine.maze()).unwrap_or(Value::Null))
        };

        let token = format!("session_{}", chrono::Utc::now().timestamp());
        self.send(
            conn_id,
            messages::MSG_AUTH_SUCCESS,
            json!({ "playerId": player_id, "token": token }),
        );
        self.send(conn_id, messages::MSG_PLAYER_DATA, player_json.clone());
        self.send(conn_id, messages::MSG_MAZE_DATA, maze_json);
        self.broadcast_except(conn_id, messages::MSG_PLAYER_JOIN, player_json);
        tracing::info!(conn_id, player_id, "Player authenticated.");
    }

    fn auth_failed(&self, conn_id: u64, reason: &str) {
        self.send(
            conn_id,
            messages::MSG_AUTH_FAILED,
            json!({ "reason": reason }),
        );
        self.broadcaster.request_close(conn_id);
    }

    // ===================================================================
    // Gameplay.
    // ===================================================================

    async fn handle_move(&self, conn_id: u64, player_id: &str, data: Value) {
        let report: MoveReport = match serde_json::from_value(data) {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(conn_id, ?err, "Bad move payload.");
                self.send_error(conn_id, ErrorCode::ProtocolError, "malformed move");
                self.broadcaster.request_close(conn_id);
                return;
            }
        };

        let result = {
            let mut engine = self.engine.lock().await;
            engine.submit_position(player_id, report.position, report.rotation, Instant::now())
        };
        match result {
            Ok(outcome) => {
                self.broadcast_except(
                    conn_id,
                    messages::MSG_PLAYER_MOVED,
                    json!({
                        "playerId": player_id,
                        "position": outcome.position,
                        "rotation": outcome.yaw,
                    }),
                );
                if outcome.clamped {
                    // Tell the sender where it actually is.
                    self.send(
                        conn_id,
                        messages::MSG_PLAYER_MOVED,
                        json!({
                            "playerId": player_id,
                            "position": outcome.position,
                            "rotation": outcome.yaw,
                        }),
                    );
                }
                self.announce_events(&outcome.events).await;
            }
            Err(err) => self.send_error(conn_id, err.code(), &err.to_string()),
        }
    }

    async fn handle_purchase(&self, conn_id: u64, player_id: &str, data: Value) {
        let request: PurchaseRequest = match serde_json::from_value(data) {
            Ok(request) => request,
            Err(_) => {
                self.send_error(conn_id, ErrorCode::ProtocolError, "malformed purchase");
                return;
            }
        };
        let Some(kind) = ItemKind::parse(&request.item_type) else {
            self.send_error(conn_id, ErrorCode::InvalidTarget, "unknown item kind");
            return;
        };

        let result = {
            let mut engine = self.engine.lock().await;
            engine.purchase_item(player_id, kind).map(|_| {
                let state = engine.player(player_id).expect("buyer exists");
                game_state_json(&engine, state)
            })
        };
        match result {
            Ok(state_json) => self.send(conn_id, messages::MSG_GAME_STATE, state_json),
            Err(err) => self.send_error(conn_id, err.code(), &err.to_string()),
        }
    }

    async fn handle_use_item(&self, conn_id: u64, player_id: &str, data: Value) {
        let request: UseItemRequest = match serde_json::from_value(data) {
            Ok(request) => request,
            Err(_) => {
                self.send_error(conn_id, ErrorCode::ProtocolError, "malformed use_item");
                return;
            }
        };
        let Some(kind) = ItemKind::parse(&request.item_type) else {
            self.send_error(conn_id, ErrorCode::InvalidTarget, "unknown item kind");
            return;
        };
        let target_cell: Option<GridPos> = request.target_position.map(GridPos::from);

        let result = {
            let mut engine = self.engine.lock().await;
            engine
                .use_item(
                    player_id,
                    kind,
                    request.target_player_id.as_deref(),
                    target_cell,
                    Instant::now(),
                )
                .map(|effect| {
                    let state = engine.player(player_id).expect("user exists");
                    (effect, game_state_json(&engine, state))
                })
        };
        match result {
            Ok((effect, state_json)) => {
                self.broadcast(
                    messages::MSG_ITEM_EFFECT,
                    item_effect_json(player_id, kind, &effect),
                );
                self.send(conn_id, messages::MSG_GAME_STATE, state_json);
                self.announce_position_changes(&effect);
            }
            Err(err) => self.send_error(conn_id, err.code(), &err.to_string()),
        }
    }

    /// Swap and kill move other players around; everyone gets the
    /// authoritative positions.
    fn announce_position_changes(&self, effect: &ItemEffect) {
        let mut moved: Vec<(&str, FloatPos)> = Vec::new();
        match effect {
            ItemEffect::PlayerKilled { target_id, respawn } => {
                moved.push((target_id, *respawn));
            }
            ItemEffect::PositionsSwapped {
                user_id,
                user_pos,
                target_id,
                target_pos,
            } => {
                moved.push((user_id, *user_pos));
                moved.push((target_id, *target_pos));
            }
            _ => {}
        }
        for (moved_id, position) in moved {
            self.broadcast(
                messages::MSG_PLAYER_MOVED,
                json!({ "playerId": moved_id, "position": position }),
            );
        }
    }

    async fn handle_chat(&self, conn_id: u64, player_id: &str, data: Value) {
        let line: ChatLine = match serde_json::from_value(data) {
            Ok(line) => line,
            Err(_) => {
                self.send_error(conn_id, ErrorCode::ProtocolError, "malformed chat message");
                return;
            }
        };
        let message: String = line.message.chars().take(protocol::CHAT_MESSAGE_LIMIT).collect();
        self.persistence.append_chat(player_id, &message).await;
        self.broadcast(
            messages::MSG_CHAT,
            json!({ "sender": player_id, "message": message }),
        );
    }

    fn handle_ping(&self, conn_id: u64, data: Value) {
        let probe: PingProbe = serde_json::from_value(data).unwrap_or(PingProbe {
            timestamp: Value::Null,
        });
        self.send(
            conn_id,
            messages::MSG_PONG,
            json!({ "timestamp": probe.timestamp }),
        );
    }

    // ===================================================================
    // Events and lifecycle.
    // ===================================================================

    /// Turns engine events into the `game_event` broadcasts and keeps the
    /// durable win counter in step.
    pub async fn announce_events(&self, events: &[EngineEvent]) {
        for event in events {
            match event {
                EngineEvent::CoinCollected {
                    player_id,
                    coin_index,
                    remaining,
                } => {
                    self.broadcast(
                        messages::MSG_GAME_EVENT,
                        json!({
                            "eventType": messages::EVENT_COIN_COLLECTED,
                            "playerId": player_id,
                            "coinIndex": coin_index,
                            "remainingCoins": remaining,
                        }),
                    );
                    self.send_game_state(player_id).await;
                }
                EngineEvent::ReachedGoal {
                    player_id,
                    finish_rank,
                    bonus,
                } => {
                    self.broadcast(
                        messages::MSG_GAME_EVENT,
                        json!({
                            "eventType": messages::EVENT_PLAYER_REACHED_GOAL,
                            "playerId": player_id,
                            "finishRank": finish_rank,
                            "bonus": bonus,
                        }),
                    );
                    if *finish_rank == 1 {
                        let mut registry = self.registry.lock().await;
                        registry.record_win(player_id);
                    }
                    self.send_game_state(player_id).await;
                }
                EngineEvent::GameOver => {
                    self.broadcast(
                        messages::MSG_GAME_EVENT,
                        json!({ "eventType": messages::EVENT_GAME_OVER }),
                    );
                }
            }
        }
    }

    async fn send_game_state(&self, player_id: &str) {
        let Some(conn_id) = self.connection_of(player_id) else {
            return;
        };
        let state_json = {
            let engine = self.engine.lock().await;
            engine
                .player(player_id)
                .map(|state| game_state_json(&engine, state))
        };
        if let Some(state_json) = state_json {
            self.send(conn_id, messages::MSG_GAME_STATE, state_json);
        }
    }

    /// Called by the endpoint for every closed socket, bound or not.
    pub async fn handle_disconnect(&self, conn_id: u64) {
        self.broadcaster.unregister(conn_id);
        let player_id = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.by_conn.remove(&conn_id) {
                // Only unbind when this connection is still the current one;
                // a superseded session must not log out its successor.
                Some(player_id) if sessions.by_player.get(&player_id) == Some(&conn_id) => {
                    sessions.by_player.remove(&player_id);
                    Some(player_id)
                }
                _ => None,
            }
        };
        let Some(player_id) = player_id else {
            return;
        };

        let records = {
            let mut registry = self.registry.lock().await;
            registry.logout(&player_id);
            registry.records()
        };
        if let Err(err) = self.persistence.save_players(&records).await {
            tracing::warn!(?err, "Could not persist players after logout.");
        }
        let events = {
            let mut engine = self.engine.lock().await;
            engine.remove_player(&player_id)
        };
        self.broadcast(
            messages::MSG_PLAYER_LEAVE,
            json!({ "playerId": player_id }),
        );
        self.announce_events(&events).await;
        tracing::info!(conn_id, player_id, "Player left.");
    }

    // ===================================================================
    // Operator paths.
    // ===================================================================

    /// Kick: log the player out and close the bound connection.
    pub async fn kick(&self, player_id: &str, reason: &str) -> bool {
        let conn = self.connection_of(player_id);
        {
            let mut registry = self.registry.lock().await;
            registry.logout(player_id);
        }
        match conn {
            Some(conn_id) => {
                self.send(
                    conn_id,
                    messages::MSG_CHAT,
                    json!({ "sender": SYSTEM_SENDER, "message": format!("kicked: {reason}") }),
                );
                self.broadcaster.request_close(conn_id);
                true
            }
            None => false,
        }
    }

    /// Operator announcement into the chat.
    pub async fn system_chat(&self, message: &str) {
        self.persistence.append_chat(SYSTEM_SENDER, message).await;
        self.broadcast(
            messages::MSG_CHAT,
            json!({ "sender": SYSTEM_SENDER, "message": message }),
        );
    }

    /// Broadcasts an authoritative position set by an operator command.
    pub fn announce_player_position(&self, player_id: &str, position: FloatPos) {
        self.broadcast(
            messages::MSG_PLAYER_MOVED,
            json!({ "playerId": player_id, "position": position }),
        );
    }

    /// Answers a transport-level ping inline through the outbound queue.
    pub fn pong(&self, conn_id: u64, payload: Vec<u8>) {
        self.broadcaster
            .send_frame(conn_id, crate::broadcaster::OutboundFrame::Pong(payload));
    }

    /// A malformed frame costs the sender its connection.
    pub fn protocol_violation(&self, conn_id: u64) {
        self.broadcaster.request_close(conn_id);
    }

    /// Lets the writer flush its close frame and stop.
    pub fn request_close(&self, conn_id: u64) {
        self.broadcaster.request_close(conn_id);
    }

    /// Sends everyone a fresh maze snapshot, used after resets and repairs.
    pub async fn broadcast_maze(&self) {
        let maze_json = {
            let engine = self.engine.lock().await;
            serde_json::to_value(engine.maze()).unwrap_or(Value::Null)
        };
        self.broadcast(messages::MSG_MAZE_DATA, maze_json);
    }
}

fn item_effect_json(player_id: &str, kind: ItemKind, effect: &ItemEffect) -> Value {
    let mut data = json!({
        "playerId": player_id,
        "itemType": kind.wire_name(),
    });
    let extra = match effect {
        ItemEffect::SpeedBoost { .. } | ItemEffect::CompassActivated { .. } => json!({}),
        ItemEffect::WallBroken { cell } => json!({ "cell": cell }),
        ItemEffect::TrapPlaced { cell } => json!({ "cell": cell }),
        ItemEffect::PlayerKilled { target_id, .. } => json!({ "targetPlayerId": target_id }),
        ItemEffect::PositionsSwapped { target_id, .. } => json!({ "targetPlayerId": target_id }),
    };
    if let (Value::Object(data), Value::Object(extra)) = (&mut data, extra) {
        data.extend(extra);
    }
    data
}
