//! The authoritative game state engine. This is the single source of truth
//! for the maze, the coin pool, player runtime states and all timed effects.
//! Every public operation runs inside the engine-wide exclusion region that
//! the callers hold; nothing in here ever waits on I/O.
//!
//! Events flow outward through return values only. The engine knows nothing
//! about connections, sockets or the dispatcher.

mod player;

pub use player::PlayerState;

use protocol::{CellKind, ErrorCode, FloatPos, GridPos, ItemKind, MazeData};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Distance a player may cover with one movement step.
pub const MOVE_STEP: f32 = 1.0;
/// Tolerance applied on top of the step limit for float jitter.
const STEP_EPSILON: f32 = 0.05;
/// How long a speed potion lasts.
pub const SPEED_BOOST_SECS: u64 = 10;
/// A hammered wall grows back after this long.
pub const WALL_REPAIR_SECS: u64 = 60;
/// A slow trap evaporates after this long.
pub const TRAP_LIFETIME_SECS: u64 = 30;
/// Finish bonus is `GOAL_BONUS_BASE - finish_rank` coins.
pub const GOAL_BONUS_BASE: u32 = 61;
/// While standing on a trap, the step limit shrinks by this factor.
const TRAP_SLOW_FACTOR: f32 = 0.5;

/// Failures of engine operations. The dispatcher turns these into `error`
/// messages for the offending connection, the console into `{success:false}`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GameError {
    #[error("movement rejected")]
    InvalidMove,
    #[error("not enough coins, need {needed} but have {have}")]
    InsufficientCoins { needed: u32, have: u32 },
    #[error("item not in inventory")]
    ItemNotOwned,
    #[error("unknown player {0}")]
    PlayerNotFound(String),
    #[error("invalid target")]
    InvalidTarget,
    #[error("the match is not running")]
    GameNotRunning,
    #[error("player is already in the match")]
    AlreadyPresent,
}

impl GameError {
    /// The wire error code carried inside `error` messages.
    pub fn code(&self) -> ErrorCode {
        match self {
            GameError::InvalidMove => ErrorCode::InvalidMove,
            GameError::InsufficientCoins { .. } => ErrorCode::InsufficientCoins,
            GameError::ItemNotOwned => ErrorCode::ItemNotOwned,
            GameError::PlayerNotFound(_) => ErrorCode::PlayerNotFound,
            GameError::InvalidTarget => ErrorCode::InvalidTarget,
            GameError::GameNotRunning => ErrorCode::GameNotRunning,
            GameError::AlreadyPresent => ErrorCode::Internal,
        }
    }
}

/// State changes that the dispatcher has to announce to the participants.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    CoinCollected {
        player_id: String,
        coin_index: usize,
        remaining: usize,
    },
    ReachedGoal {
        player_id: String,
        finish_rank: u32,
        bonus: u32,
    },
    /// Every player in the match has reached the goal.
    GameOver,
}

/// Result of a movement operation. `clamped` means the submitted position was
/// not reachable and the authoritative position stayed where it was.
#[derive(Debug, PartialEq)]
pub struct MoveOutcome {
    pub position: FloatPos,
    pub yaw: f32,
    pub clamped: bool,
    pub events: Vec<EngineEvent>,
}

/// What a successful `use_item` did, for the `item_effect` broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEffect {
    SpeedBoost {
        player_id: String,
    },
    CompassActivated {
        player_id: String,
    },
    WallBroken {
        cell: GridPos,
    },
    PlayerKilled {
        target_id: String,
        respawn: FloatPos,
    },
    TrapPlaced {
        cell: GridPos,
    },
    PositionsSwapped {
        user_id: String,
        user_pos: FloatPos,
        target_id: String,
        target_pos: FloatPos,
    },
}

/// Expirations fired by one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub repaired_walls: Vec<GridPos>,
    pub expired_traps: Vec<GridPos>,
    pub expired_boosts: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.repaired_walls.is_empty() && self.expired_traps.is_empty()
    }
}

/// The four horizontal directions plus the two stair directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
}

struct BrokenWall {
    cell: GridPos,
    repair_at: Instant,
}

struct SlowTrap {
    cell: GridPos,
    placed_at: Instant,
}

pub struct GameEngine {
    maze: MazeData,
    players: HashMap<String, PlayerState>,
    broken_walls: Vec<BrokenWall>,
    slow_traps: Vec<SlowTrap>,
    /// playerId -> administrative level 0..3. The console pseudo-user is
    /// seeded as super-admin.
    admin_levels: HashMap<String, u8>,
    running: bool,
    finished_count: u32,
    next_finish_rank: u32,
}

impl GameEngine {
    pub fn new(maze: MazeData) -> Self {
        let mut admin_levels = HashMap::new();
        admin_levels.insert("console".to_string(), 3);
        GameEngine {
            maze,
            players: HashMap::new(),
            broken_walls: Vec::new(),
            slow_traps: Vec::new(),
            admin_levels,
            running: true,
            finished_count: 0,
            next_finish_rank: 1,
        }
    }

    /// Checks the structural invariants of a maze before it is adopted:
    /// exactly one start on layer 0, exactly one end, walls all around.
    pub fn validate_maze(maze: &MazeData) -> Result<(), String> {
        let mut starts = Vec::new();
        let mut ends = Vec::new();
        for z in 0..maze.layers {
            for y in 0..maze.height {
                for x in 0..maze.width {
                    let pos = GridPos::new(x, y, z);
                    let cell = maze.cell(pos).unwrap_or(CellKind::Wall);
                    match cell {
                        CellKind::Start => starts.push(pos),
                        CellKind::End => ends.push(pos),
                        _ => {}
                    }
                    let on_shell =
                        x == 0 || y == 0 || x == maze.width - 1 || y == maze.height - 1;
                    if on_shell && cell != CellKind::Wall {
                        return Err(format!("outer shell open at {pos:?}"));
                    }
                }
            }
        }
        if starts.len() != 1 {
            return Err(format!("expected exactly one start, found {}", starts.len()));
        }
        if starts[0].z != 0 {
            return Err("start is not on layer 0".into());
        }
        if ends.len() != 1 {
            return Err(format!("expected exactly one end, found {}", ends.len()));
        }
        if starts[0] != maze.start || ends[0] != maze.end {
            return Err("start/end fields disagree with the grid".into());
        }
        for (index, coin) in maze.coin_positions.iter().enumerate() {
            let cell = maze
                .cell(coin.position)
                .ok_or_else(|| format!("coin {index} out of bounds"))?;
            if cell == CellKind::Wall {
                return Err(format!("coin {index} sits in a wall"));
            }
            if coin.position == maze.start || coin.position == maze.end {
                return Err(format!("coin {index} sits on start or end"));
            }
        }
        Ok(())
    }

    // ===================================================================
    // Accessors used by the dispatcher and the HTTP surface.
    // ===================================================================

    pub fn maze(&self) -> &MazeData {
        &self.maze
    }

    pub fn player(&self, player_id: &str) -> Option<&PlayerState> {
        self.players.get(player_id)
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn remaining_coins(&self) -> usize {
        self.maze.remaining_coins()
    }

    pub fn finished_count(&self) -> u32 {
        self.finished_count
    }

    pub fn admin_level(&self, user: &str) -> u8 {
        self.admin_levels.get(user).copied().unwrap_or(0)
    }

    pub fn set_admin_level(&mut self, user: &str, level: u8) {
        self.admin_levels.insert(user.to_string(), level.min(3));
    }

    fn require_player(&mut self, player_id: &str) -> Result<&mut PlayerState, GameError> {
        self.players
            .get_mut(player_id)
            .ok_or_else(|| GameError::PlayerNotFound(player_id.to_string()))
    }

    // ===================================================================
    // Player lifecycle.
    // ===================================================================

    /// Creates a runtime state standing on the start cell. Fails if the
    /// player is already part of the match.
    pub fn add_player(
        &mut self,
        player_id: &str,
        display_name: &str,
    ) -> Result<&PlayerState, GameError> {
        if self.players.contains_key(player_id) {
            return Err(GameError::AlreadyPresent);
        }
        let state = PlayerState::new(
            player_id.to_string(),
            display_name.to_string(),
            self.maze.start.into(),
        );
        self.players.insert(player_id.to_string(), state);
        Ok(&self.players[player_id])
    }

    /// Drops the runtime state. The durable record is untouched. Removing the
    /// last unfinished player can end the match.
    pub fn remove_player(&mut self, player_id: &str) -> Vec<EngineEvent> {
        if self.players.remove(player_id).is_none() {
            return Vec::new();
        }
        let mut events = Vec::new();
        if self.running
            && !self.players.is_empty()
            && self.players.values().all(|p| p.reached_goal)
        {
            self.running = false;
            events.push(EngineEvent::GameOver);
        }
        events
    }

    // ===================================================================
    // Movement.
    // ===================================================================

    /// Moves one step from the current yaw. Used by direction-based clients
    /// and shares all validation with [`submit_position`](Self::submit_position).
    pub fn move_player(
        &mut self,
        player_id: &str,
        direction: MoveDirection,
        now: Instant,
    ) -> Result<MoveOutcome, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let player = self
            .players
            .get(player_id)
            .ok_or_else(|| GameError::PlayerNotFound(player_id.to_string()))?;
        if !player.alive {
            return Err(GameError::InvalidMove);
        }
        let step = MOVE_STEP * player.speed_factor(now) * self.trap_factor(player.position);
        let (sin, cos) = (player.yaw.sin(), player.yaw.cos());
        let from = player.position;
        let candidate = match direction {
            MoveDirection::Forward => FloatPos::new(from.x + sin * step, from.y + cos * step, from.z),
            MoveDirection::Backward => {
                FloatPos::new(from.x - sin * step, from.y - cos * step, from.z)
            }
            MoveDirection::Left => FloatPos::new(from.x - cos * step, from.y + sin * step, from.z),
            MoveDirection::Right => FloatPos::new(from.x + cos * step, from.y - sin * step, from.z),
            MoveDirection::Up => FloatPos::new(from.x, from.y, from.z + 1.0),
            MoveDirection::Down => FloatPos::new(from.x, from.y, from.z - 1.0),
        };
        if !self.step_is_legal(from, candidate, now, player_id) {
            return Err(GameError::InvalidMove);
        }
        let yaw = player.yaw;
        Ok(self.settle_position(player_id, candidate, yaw))
    }

    /// Validates a client-reported position. The server is authoritative:
    /// an unreachable report is clamped to the last accepted position and
    /// flagged, never trusted.
    pub fn submit_position(
        &mut self,
        player_id: &str,
        reported: FloatPos,
        yaw: f32,
        now: Instant,
    ) -> Result<MoveOutcome, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let player = self
            .players
            .get(player_id)
            .ok_or_else(|| GameError::PlayerNotFound(player_id.to_string()))?;
        let from = player.position;
        if !player.alive || !self.step_is_legal(from, reported, now, player_id) {
            // Keep the old position, only the view direction is accepted.
            if let Some(p) = self.players.get_mut(player_id) {
                p.yaw = yaw;
            }
            return Ok(MoveOutcome {
                position: from,
                yaw,
                clamped: true,
                events: Vec::new(),
            });
        }
        Ok(self.settle_position(player_id, reported, yaw))
    }

    /// Whether one movement step from `from` to `to` is allowed right now.
    fn step_is_legal(&self, from: FloatPos, to: FloatPos, now: Instant, player_id: &str) -> bool {
        let target_cell = to.to_cell();
        if self.maze.is_blocking(target_cell) {
            return false;
        }
        let from_cell = from.to_cell();
        if target_cell.z != from_cell.z {
            if !self.is_stair_transition(from_cell, target_cell) {
                return false;
            }
        } else if (to.z - from.z).abs() > STEP_EPSILON {
            return false;
        }
        let limit = self
            .players
            .get(player_id)
            .map(|p| MOVE_STEP * p.speed_factor(now) * self.trap_factor(from))
            .unwrap_or(MOVE_STEP);
        let (dx, dy) = (to.x - from.x, to.y - from.y);
        (dx * dx + dy * dy).sqrt() <= limit + STEP_EPSILON
    }

    /// Layer changes are only legal across a stair pair.
    fn is_stair_transition(&self, from: GridPos, to: GridPos) -> bool {
        if from.x != to.x || from.y != to.y {
            return false;
        }
        let from_kind = self.maze.cell(from);
        let to_kind = self.maze.cell(to);
        match (from_kind, to_kind) {
            (Some(CellKind::StairUp), Some(CellKind::StairDown)) => to.z == from.z + 1,
            (Some(CellKind::StairDown), Some(CellKind::StairUp)) => to.z == from.z - 1,
            _ => false,
        }
    }

    /// Step limit shrinks while standing on a live slow trap.
    fn trap_factor(&self, position: FloatPos) -> f32 {
        let cell = position.to_cell();
        if self.slow_traps.iter().any(|t| t.cell == cell) {
            TRAP_SLOW_FACTOR
        } else {
            1.0
        }
    }

    /// Commits an accepted position and fires whatever the landing cell
    /// triggers: coin pickup and the goal check.
    fn settle_position(&mut self, player_id: &str, position: FloatPos, yaw: f32) -> MoveOutcome {
        let mut events = Vec::new();
        let cell = position.to_cell();
        if let Some(player) = self.players.get_mut(player_id) {
            player.position = position;
            player.yaw = yaw;
        }
        if let Some(index) = self
            .maze
            .coin_positions
            .iter()
            .position(|c| !c.collected && c.position == cell)
        {
            // The landing cell held a coin, pick it up along the way.
            if let Ok(event) = self.collect_coin(player_id, index) {
                events.push(event);
            }
        }
        if cell == self.maze.end {
            events.extend(self.check_goal(player_id));
        }
        MoveOutcome {
            position,
            yaw,
            clamped: false,
            events,
        }
    }

    /// Awards finish rank and bonus the first time a player stands on the
    /// end cell. Ends the match once everyone is through.
    fn check_goal(&mut self, player_id: &str) -> Vec<EngineEvent> {
        let Some(player) = self.players.get_mut(player_id) else {
            return Vec::new();
        };
        if player.reached_goal {
            return Vec::new();
        }
        player.reached_goal = true;
        player.finish_rank = self.next_finish_rank;
        let bonus = GOAL_BONUS_BASE.saturating_sub(self.next_finish_rank);
        player.coins += bonus;
        let rank = self.next_finish_rank;
        self.next_finish_rank += 1;
        self.finished_count += 1;
        let mut events = vec![EngineEvent::ReachedGoal {
            player_id: player_id.to_string(),
            finish_rank: rank,
            bonus,
        }];
        if self.players.values().all(|p| p.reached_goal) {
            self.running = false;
            events.push(EngineEvent::GameOver);
        }
        events
    }

    // ===================================================================
    // Coins and items.
    // ===================================================================

    /// Collects one coin. Idempotent: a second collect of the same index
    /// fails and changes nothing.
    pub fn collect_coin(
        &mut self,
        player_id: &str,
        coin_index: usize,
    ) -> Result<EngineEvent, GameError> {
        if !self.players.contains_key(player_id) {
            return Err(GameError::PlayerNotFound(player_id.to_string()));
        }
        let Some(coin) = self.maze.coin_positions.get_mut(coin_index) else {
            return Err(GameError::InvalidTarget);
        };
        if coin.collected {
            return Err(GameError::InvalidTarget);
        }
        coin.collected = true;
        let remaining = self.maze.remaining_coins();
        let player = self.require_player(player_id)?;
        player.coins += 1;
        Ok(EngineEvent::CoinCollected {
            player_id: player_id.to_string(),
            coin_index,
            remaining,
        })
    }

    /// Buys one item. Only on success the coins are subtracted and the
    /// inventory counter incremented. Returns the new coin balance.
    pub fn purchase_item(&mut self, player_id: &str, kind: ItemKind) -> Result<u32, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let player = self.require_player(player_id)?;
        let price = kind.price();
        if player.coins < price {
            return Err(GameError::InsufficientCoins {
                needed: price,
                have: player.coins,
            });
        }
        player.coins -= price;
        player.grant_item(kind, 1);
        Ok(player.coins)
    }

    /// Applies an item effect. The inventory counter is decremented only
    /// after the effect preconditions held.
    pub fn use_item(
        &mut self,
        player_id: &str,
        kind: ItemKind,
        target_player: Option<&str>,
        target_cell: Option<GridPos>,
        now: Instant,
    ) -> Result<ItemEffect, GameError> {
        if !self.running {
            return Err(GameError::GameNotRunning);
        }
        let player = self.require_player(player_id)?;
        if player.item_count(kind) == 0 {
            return Err(GameError::ItemNotOwned);
        }

        let effect = match kind {
            ItemKind::SpeedPotion => {
                let player = self.require_player(player_id)?;
                player.speed_boost_until = Some(now + Duration::from_secs(SPEED_BOOST_SECS));
                ItemEffect::SpeedBoost {
                    player_id: player_id.to_string(),
                }
            }
            ItemKind::Compass => {
                let player = self.require_player(player_id)?;
                player.has_compass = true;
                ItemEffect::CompassActivated {
                    player_id: player_id.to_string(),
                }
            }
            ItemKind::Hammer => {
                let cell = target_cell.ok_or(GameError::InvalidTarget)?;
                self.break_wall(cell, now)?
            }
            ItemKind::KillSword => {
                let target = target_player.ok_or(GameError::InvalidTarget)?;
                if target == player_id || !self.players.contains_key(target) {
                    return Err(GameError::InvalidTarget);
                }
                let respawn = self.respawn(target)?;
                ItemEffect::PlayerKilled {
                    target_id: target.to_string(),
                    respawn,
                }
            }
            ItemKind::SlowTrap => {
                let cell = target_cell.ok_or(GameError::InvalidTarget)?;
                if self.maze.is_blocking(cell) {
                    return Err(GameError::InvalidTarget);
                }
                self.slow_traps.push(SlowTrap {
                    cell,
                    placed_at: now,
                });
                ItemEffect::TrapPlaced { cell }
            }
            ItemKind::SwapItem => {
                let target = target_player.ok_or(GameError::InvalidTarget)?;
                if target == player_id || !self.players.contains_key(target) {
                    return Err(GameError::InvalidTarget);
                }
                let user_pos = self.players[player_id].position;
                let target_pos = self.players[target].position;
                if let Some(user) = self.players.get_mut(player_id) {
                    user.position = target_pos;
                }
                if let Some(other) = self.players.get_mut(target) {
                    other.position = user_pos;
                }
                ItemEffect::PositionsSwapped {
                    user_id: player_id.to_string(),
                    user_pos: target_pos,
                    target_id: target.to_string(),
                    target_pos: user_pos,
                }
            }
        };

        let player = self.require_player(player_id)?;
        player.consume_item(kind);
        Ok(effect)
    }

    /// Converts a wall into a path and schedules the repair. The outer shell
    /// stays untouchable so the maze can never leak.
    fn break_wall(&mut self, cell: GridPos, now: Instant) -> Result<ItemEffect, GameError> {
        if !self.maze.in_bounds(cell) || self.maze.cell(cell) != Some(CellKind::Wall) {
            return Err(GameError::InvalidTarget);
        }
        let on_shell = cell.x == 0
            || cell.y == 0
            || cell.x == self.maze.width - 1
            || cell.y == self.maze.height - 1;
        if on_shell {
            return Err(GameError::InvalidTarget);
        }
        self.maze.set_cell(cell, CellKind::Path);
        self.broken_walls.push(BrokenWall {
            cell,
            repair_at: now + Duration::from_secs(WALL_REPAIR_SECS),
        });
        Ok(ItemEffect::WallBroken { cell })
    }

    /// Drops the target on a uniformly random non-blocking cell, alive, with
    /// compass and speed boost cleared. Coins and inventory survive.
    fn respawn(&mut self, player_id: &str) -> Result<FloatPos, GameError> {
        let spot = self.random_open_cell();
        let player = self.require_player(player_id)?;
        player.alive = true;
        player.has_compass = false;
        player.speed_boost_until = None;
        player.position = spot.into();
        Ok(player.position)
    }

    fn random_open_cell(&self) -> GridPos {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let candidate = GridPos::new(
                rng.gen_range(0..self.maze.width),
                rng.gen_range(0..self.maze.height),
                rng.gen_range(0..self.maze.layers),
            );
            if !self.maze.is_blocking(candidate) {
                return candidate;
            }
        }
        // Degenerate maze, the start cell is always open.
        self.maze.start
    }

    // ===================================================================
    // Tick.
    // ===================================================================

    /// Advances the timed effects: expired traps vanish, repaired walls turn
    /// back into walls, stale speed boosts are cleared.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        let trap_lifetime = Duration::from_secs(TRAP_LIFETIME_SECS);
        self.slow_traps.retain(|trap| {
            if now.duration_since(trap.placed_at) >= trap_lifetime {
                report.expired_traps.push(trap.cell);
                false
            } else {
                true
            }
        });

        let mut repaired = Vec::new();
        self.broken_walls.retain(|wall| {
            if wall.repair_at <= now {
                repaired.push(wall.cell);
                false
            } else {
                true
            }
        });
        for cell in &repaired {
            self.maze.set_cell(*cell, CellKind::Wall);
        }
        report.repaired_walls = repaired;

        for player in self.players.values_mut() {
            if let Some(until) = player.speed_boost_until {
                if until <= now {
                    player.speed_boost_until = None;
                    report.expired_boosts.push(player.player_id.clone());
                }
            }
        }

        report
    }

    // ===================================================================
    // Operator-privileged operations.
    // ===================================================================

    /// Drops items into a player's inventory without payment.
    pub fn give(&mut self, player_id: &str, kind: ItemKind, count: u32) -> Result<(), GameError> {
        let player = self.require_player(player_id)?;
        player.grant_item(kind, count);
        Ok(())
    }

    /// Moves a player to an arbitrary cell. Rejected when the cell is out of
    /// bounds or blocking. Does not award the goal.
    pub fn teleport(&mut self, player_id: &str, cell: GridPos) -> Result<FloatPos, GameError> {
        if self.maze.is_blocking(cell) {
            return Err(GameError::InvalidTarget);
        }
        let player = self.require_player(player_id)?;
        player.position = cell.into();
        Ok(player.position)
    }

    /// Operator kill, same respawn rules as the sword.
    pub fn kill(&mut self, player_id: &str) -> Result<FloatPos, GameError> {
        if !self.players.contains_key(player_id) {
            return Err(GameError::PlayerNotFound(player_id.to_string()));
        }
        self.respawn(player_id)
    }

    /// Sets the this-match coin counter to an absolute amount.
    pub fn set_coins(&mut self, player_id: &str, amount: u32) -> Result<(), GameError> {
        let player = self.require_player(player_id)?;
        player.coins = amount;
        Ok(())
    }

    /// Back to square one: positions, liveness, effects, coin pool, ranks.
    /// This-match coins and inventories are deliberately preserved.
    pub fn reset(&mut self) {
        for wall in &self.broken_walls {
            self.maze.set_cell(wall.cell, CellKind::Wall);
        }
        self.broken_walls.clear();
        self.slow_traps.clear();
        for coin in &mut self.maze.coin_positions {
            coin.collected = false;
        }
        let start = self.maze.start.into();
        for player in self.players.values_mut() {
            player.position = start;
            player.alive = true;
            player.has_compass = false;
            player.speed_boost_until = None;
            player.reached_goal = false;
            player.finish_rank = 0;
        }
        self.running = true;
        self.finished_count = 0;
        self.next_finish_rank = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::CoinSpot;

    /// A 7x7 two-layer maze with an open interior, a stair pair at (3,1) and
    /// the end on the upper layer.
    fn test_maze() -> MazeData {
        let width = 7;
        let height = 7;
        let layers = 2;
        let mut cells = vec![vec![vec![CellKind::Wall; width]; height]; layers];
        for z in 0..layers {
            for y in 1..height - 1 {
                for x in 1..width - 1 {
                    cells[z][y][x] = CellKind::Path;
                }
            }
        }
        cells[0][1][1] = CellKind::Start;
        cells[0][1][3] = CellKind::StairUp;
        cells[1][1][3] = CellKind::StairDown;
        cells[1][5][5] = CellKind::End;
        // One interior wall to hammer at (2,3,0).
        cells[0][3][2] = CellKind::Wall;
        MazeData {
            width: width as i32,
            height: height as i32,
            layers: layers as i32,
            cells,
            start: GridPos::new(1, 1, 0),
            end: GridPos::new(5, 5, 1),
            coin_positions: vec![
                CoinSpot {
                    position: GridPos::new(2, 1, 0),
                    collected: false,
                },
                CoinSpot {
                    position: GridPos::new(4, 4, 0),
                    collected: false,
                },
            ],
        }
    }

    fn engine_with(players: &[&str]) -> GameEngine {
        let mut engine = GameEngine::new(test_maze());
        for id in players {
            engine.add_player(id, id).unwrap();
        }
        engine
    }

    #[test]
    fn the_test_maze_is_structurally_sound() {
        GameEngine::validate_maze(&test_maze()).unwrap();
    }

    #[test]
    fn adding_twice_fails() {
        let mut engine = engine_with(&["A"]);
        assert_eq!(engine.add_player("A", "A"), Err(GameError::AlreadyPresent));
    }

    #[test]
    fn players_start_on_the_start_cell_with_nothing() {
        let engine = engine_with(&["A"]);
        let player = engine.player("A").unwrap();
        assert_eq!(player.position.to_cell(), GridPos::new(1, 1, 0));
        assert_eq!(player.coins, 0);
        assert!(player.inventory.is_empty());
        assert!(player.alive);
    }

    #[test]
    fn movement_into_the_shell_is_rejected() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        let outcome = engine
            .submit_position("A", FloatPos::new(1.0, 0.0, 0.0), 0.0, now)
            .unwrap();
        assert!(outcome.clamped);
        assert_eq!(outcome.position.to_cell(), GridPos::new(1, 1, 0));
    }

    #[test]
    fn movement_never_lands_on_a_blocking_cell() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        // (2,3,0) is the interior wall of the test maze.
        engine.teleport("A", GridPos::new(2, 2, 0)).unwrap();
        let outcome = engine
            .submit_position("A", FloatPos::new(2.0, 3.0, 0.0), 0.0, now)
            .unwrap();
        assert!(outcome.clamped);
        assert!(!engine
            .maze()
            .is_blocking(engine.player("A").unwrap().position.to_cell()));
    }

    #[test]
    fn a_leap_across_the_map_is_clamped() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        let outcome = engine
            .submit_position("A", FloatPos::new(5.0, 5.0, 0.0), 0.0, now)
            .unwrap();
        assert!(outcome.clamped);
    }

    #[test]
    fn layer_change_needs_the_stair_pair() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        // Not on a stair: vertical move is clamped.
        let outcome = engine
            .submit_position("A", FloatPos::new(1.0, 1.0, 1.0), 0.0, now)
            .unwrap();
        assert!(outcome.clamped);
        // On the stair-up cell the transition works.
        engine.teleport("A", GridPos::new(3, 1, 0)).unwrap();
        let outcome = engine
            .submit_position("A", FloatPos::new(3.0, 1.0, 1.0), 0.0, now)
            .unwrap();
        assert!(!outcome.clamped);
        assert_eq!(engine.player("A").unwrap().position.to_cell().z, 1);
        // And back down again.
        let outcome = engine
            .submit_position("A", FloatPos::new(3.0, 1.0, 0.0), 0.0, now)
            .unwrap();
        assert!(!outcome.clamped);
    }

    #[test]
    fn direction_moves_follow_the_yaw() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        // Yaw 0 looks along +y, one forward step lands on (1,2).
        let outcome = engine.move_player("A", MoveDirection::Forward, now).unwrap();
        assert_eq!(outcome.position.to_cell(), GridPos::new(1, 2, 0));
        // Walking backward into the shell is rejected.
        engine.teleport("A", GridPos::new(1, 1, 0)).unwrap();
        assert_eq!(
            engine.move_player("A", MoveDirection::Backward, now),
            Err(GameError::InvalidMove)
        );
        // Going up without a stair is rejected as well.
        assert_eq!(
            engine.move_player("A", MoveDirection::Up, now),
            Err(GameError::InvalidMove)
        );
    }

    #[test]
    fn a_finished_match_rejects_gameplay() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        engine.teleport("A", GridPos::new(5, 4, 1)).unwrap();
        engine
            .submit_position("A", FloatPos::new(5.0, 5.0, 1.0), 0.0, now)
            .unwrap();
        // The only player finished, so the match is over.
        assert!(!engine.running());
        assert_eq!(
            engine.move_player("A", MoveDirection::Forward, now),
            Err(GameError::GameNotRunning)
        );
        assert_eq!(
            engine.purchase_item("A", ItemKind::Compass),
            Err(GameError::GameNotRunning)
        );
        engine.reset();
        assert!(engine.running());
    }

    #[test]
    fn landing_on_a_coin_collects_it_exactly_once() {
        let mut engine = engine_with(&["A", "B"]);
        let now = Instant::now();
        let outcome = engine
            .submit_position("A", FloatPos::new(2.0, 1.0, 0.0), 0.0, now)
            .unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(engine.player("A").unwrap().coins, 1);
        assert_eq!(engine.remaining_coins(), 1);
        // B walking over the same cell finds nothing.
        engine.teleport("B", GridPos::new(2, 2, 0)).unwrap();
        let outcome = engine
            .submit_position("B", FloatPos::new(2.0, 1.0, 0.0), 0.0, now)
            .unwrap();
        assert!(outcome.events.is_empty());
        assert_eq!(engine.player("B").unwrap().coins, 0);
    }

    #[test]
    fn collect_coin_is_idempotent_and_bounded() {
        let mut engine = engine_with(&["A"]);
        engine.collect_coin("A", 0).unwrap();
        assert_eq!(engine.collect_coin("A", 0), Err(GameError::InvalidTarget));
        assert_eq!(engine.collect_coin("A", 99), Err(GameError::InvalidTarget));
        // remaining + collected stays the pool size.
        let collected = engine
            .maze()
            .coin_positions
            .iter()
            .filter(|c| c.collected)
            .count();
        assert_eq!(
            engine.remaining_coins() + collected,
            engine.maze().coin_positions.len()
        );
    }

    #[test]
    fn purchase_needs_the_full_price() {
        let mut engine = engine_with(&["A"]);
        engine.set_coins("A", 59).unwrap();
        assert_eq!(
            engine.purchase_item("A", ItemKind::SwapItem),
            Err(GameError::InsufficientCoins {
                needed: 60,
                have: 59
            })
        );
        engine.set_coins("A", 30).unwrap();
        let left = engine.purchase_item("A", ItemKind::Compass).unwrap();
        assert_eq!(left, 5);
        assert_eq!(engine.player("A").unwrap().item_count(ItemKind::Compass), 1);
    }

    #[test]
    fn using_an_unowned_item_fails() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        assert_eq!(
            engine.use_item("A", ItemKind::Compass, None, None, now),
            Err(GameError::ItemNotOwned)
        );
    }

    #[test]
    fn kill_sword_without_target_keeps_the_inventory() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        engine.give("A", ItemKind::KillSword, 1).unwrap();
        assert_eq!(
            engine.use_item("A", ItemKind::KillSword, None, None, now),
            Err(GameError::InvalidTarget)
        );
        assert_eq!(
            engine.player("A").unwrap().item_count(ItemKind::KillSword),
            1
        );
    }

    #[test]
    fn kill_sword_respawns_the_target_alive_and_stripped() {
        let mut engine = engine_with(&["A", "B"]);
        let now = Instant::now();
        engine.give("A", ItemKind::KillSword, 1).unwrap();
        engine.give("B", ItemKind::Hammer, 2).unwrap();
        engine.set_coins("B", 17).unwrap();
        if let Some(b) = engine.players.get_mut("B") {
            b.has_compass = true;
            b.speed_boost_until = Some(now + Duration::from_secs(5));
        }
        let effect = engine
            .use_item("A", ItemKind::KillSword, Some("B"), None, now)
            .unwrap();
        let ItemEffect::PlayerKilled { respawn, .. } = effect else {
            panic!("wrong effect");
        };
        let b = engine.player("B").unwrap();
        assert!(b.alive);
        assert!(!b.has_compass);
        assert!(b.speed_boost_until.is_none());
        assert_eq!(b.coins, 17);
        assert_eq!(b.item_count(ItemKind::Hammer), 2);
        assert_eq!(b.position, respawn);
        assert!(!engine.maze().is_blocking(respawn.to_cell()));
        assert_eq!(
            engine.player("A").unwrap().item_count(ItemKind::KillSword),
            0
        );
    }

    #[test]
    fn hammer_breaks_and_the_tick_repairs() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        let wall = GridPos::new(2, 3, 0);
        engine.give("A", ItemKind::Hammer, 1).unwrap();
        engine
            .use_item("A", ItemKind::Hammer, None, Some(wall), now)
            .unwrap();
        assert_eq!(engine.maze().cell(wall), Some(CellKind::Path));
        // One second early nothing happens.
        let report = engine.tick(now + Duration::from_secs(WALL_REPAIR_SECS - 1));
        assert!(report.repaired_walls.is_empty());
        let report = engine.tick(now + Duration::from_secs(WALL_REPAIR_SECS));
        assert_eq!(report.repaired_walls, vec![wall]);
        assert_eq!(engine.maze().cell(wall), Some(CellKind::Wall));
    }

    #[test]
    fn hammer_rejects_the_outer_shell_and_open_cells() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        engine.give("A", ItemKind::Hammer, 1).unwrap();
        assert_eq!(
            engine.use_item("A", ItemKind::Hammer, None, Some(GridPos::new(0, 3, 0)), now),
            Err(GameError::InvalidTarget)
        );
        assert_eq!(
            engine.use_item("A", ItemKind::Hammer, None, Some(GridPos::new(2, 1, 0)), now),
            Err(GameError::InvalidTarget)
        );
        assert_eq!(engine.player("A").unwrap().item_count(ItemKind::Hammer), 1);
    }

    #[test]
    fn traps_expire_after_their_lifetime() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        engine.give("A", ItemKind::SlowTrap, 1).unwrap();
        let cell = GridPos::new(4, 1, 0);
        engine
            .use_item("A", ItemKind::SlowTrap, None, Some(cell), now)
            .unwrap();
        let report = engine.tick(now + Duration::from_secs(TRAP_LIFETIME_SECS - 1));
        assert!(report.expired_traps.is_empty());
        let report = engine.tick(now + Duration::from_secs(TRAP_LIFETIME_SECS));
        assert_eq!(report.expired_traps, vec![cell]);
    }

    #[test]
    fn speed_potion_expires_via_tick() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        engine.give("A", ItemKind::SpeedPotion, 1).unwrap();
        engine
            .use_item("A", ItemKind::SpeedPotion, None, None, now)
            .unwrap();
        assert_eq!(engine.player("A").unwrap().speed_factor(now), 2.0);
        let report = engine.tick(now + Duration::from_secs(SPEED_BOOST_SECS + 1));
        assert_eq!(report.expired_boosts, vec!["A".to_string()]);
        assert!(engine.player("A").unwrap().speed_boost_until.is_none());
    }

    #[test]
    fn swap_exchanges_both_positions() {
        let mut engine = engine_with(&["A", "B"]);
        let now = Instant::now();
        engine.teleport("B", GridPos::new(4, 4, 0)).unwrap();
        engine.give("A", ItemKind::SwapItem, 1).unwrap();
        engine
            .use_item("A", ItemKind::SwapItem, Some("B"), None, now)
            .unwrap();
        assert_eq!(
            engine.player("A").unwrap().position.to_cell(),
            GridPos::new(4, 4, 0)
        );
        assert_eq!(
            engine.player("B").unwrap().position.to_cell(),
            GridPos::new(1, 1, 0)
        );
    }

    #[test]
    fn finish_ranks_are_contiguous_and_pay_the_bonus() {
        let mut engine = engine_with(&["A", "B"]);
        let now = Instant::now();
        // Walk both onto the end cell via teleport next to it.
        engine.teleport("A", GridPos::new(5, 4, 1)).unwrap();
        let events = engine
            .submit_position("A", FloatPos::new(5.0, 5.0, 1.0), 0.0, now)
            .unwrap()
            .events;
        assert!(matches!(
            events[0],
            EngineEvent::ReachedGoal {
                finish_rank: 1,
                bonus: 60,
                ..
            }
        ));
        engine.teleport("B", GridPos::new(5, 4, 1)).unwrap();
        let events = engine
            .submit_position("B", FloatPos::new(5.0, 5.0, 1.0), 0.0, now)
            .unwrap()
            .events;
        assert!(matches!(
            events[0],
            EngineEvent::ReachedGoal {
                finish_rank: 2,
                bonus: 59,
                ..
            }
        ));
        // Everyone is through, the match ends.
        assert!(events.contains(&EngineEvent::GameOver));
        assert_eq!(engine.finished_count(), 2);
        assert!(!engine.running());
        let a = engine.player("A").unwrap();
        assert!(a.reached_goal && a.finish_rank == 1);
    }

    #[test]
    fn standing_on_the_end_again_awards_nothing() {
        let mut engine = engine_with(&["A", "B"]);
        let now = Instant::now();
        engine.teleport("A", GridPos::new(5, 4, 1)).unwrap();
        engine
            .submit_position("A", FloatPos::new(5.0, 5.0, 1.0), 0.0, now)
            .unwrap();
        let coins = engine.player("A").unwrap().coins;
        engine.teleport("A", GridPos::new(5, 4, 1)).unwrap();
        let events = engine
            .submit_position("A", FloatPos::new(5.0, 5.0, 1.0), 0.0, now)
            .unwrap()
            .events;
        assert!(events.is_empty());
        assert_eq!(engine.player("A").unwrap().coins, coins);
    }

    #[test]
    fn reset_restores_the_arena_but_keeps_the_loot() {
        let mut engine = engine_with(&["A"]);
        let now = Instant::now();
        engine.collect_coin("A", 0).unwrap();
        engine.give("A", ItemKind::Hammer, 1).unwrap();
        engine
            .use_item("A", ItemKind::Hammer, None, Some(GridPos::new(2, 3, 0)), now)
            .unwrap();
        engine.teleport("A", GridPos::new(5, 4, 1)).unwrap();
        engine
            .submit_position("A", FloatPos::new(5.0, 5.0, 1.0), 0.0, now)
            .unwrap();
        let coins_before = engine.player("A").unwrap().coins;

        engine.reset();

        let a = engine.player("A").unwrap();
        assert_eq!(a.position.to_cell(), GridPos::new(1, 1, 0));
        assert!(!a.reached_goal);
        assert_eq!(a.finish_rank, 0);
        assert_eq!(a.coins, coins_before);
        assert_eq!(engine.maze().cell(GridPos::new(2, 3, 0)), Some(CellKind::Wall));
        assert_eq!(engine.remaining_coins(), 2);
        assert!(engine.running());
        assert_eq!(engine.finished_count(), 0);
    }

    #[test]
    fn operator_teleport_rejects_walls() {
        let mut engine = engine_with(&["A"]);
        assert_eq!(
            engine.teleport("A", GridPos::new(0, 0, 0)),
            Err(GameError::InvalidTarget)
        );
        assert_eq!(
            engine.teleport("A", GridPos::new(90, 0, 0)),
            Err(GameError::InvalidTarget)
        );
    }

    #[test]
    fn console_is_seeded_as_super_admin() {
        let mut engine = engine_with(&[]);
        assert_eq!(engine.admin_level("console"), 3);
        assert_eq!(engine.admin_level("PLAYER_000001"), 0);
        engine.set_admin_level("PLAYER_000001", 7);
        assert_eq!(engine.admin_level("PLAYER_000001"), 3);
    }
}
