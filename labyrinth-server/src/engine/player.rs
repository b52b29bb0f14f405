//! Runtime state of a single player inside the current match. The durable
//! record (total coins, games played) lives in the registry, not here.

use protocol::{FloatPos, ItemKind};
use std::collections::BTreeMap;
use std::time::Instant;

/// Everything the engine tracks about one connected player.
#[derive(Debug, PartialEq)]
pub struct PlayerState {
    pub player_id: String,
    /// The name the player announced during auth, only used for display.
    pub display_name: String,
    pub position: FloatPos,
    pub yaw: f32,
    pub alive: bool,
    pub has_compass: bool,
    /// Set while a speed potion is active, cleared by the tick loop.
    pub speed_boost_until: Option<Instant>,
    /// Coins picked up or earned during this match.
    pub coins: u32,
    pub inventory: BTreeMap<ItemKind, u32>,
    pub reached_goal: bool,
    /// 0 until the player finishes, then the 1-based arrival ordinal.
    pub finish_rank: u32,
}

impl PlayerState {
    /// A fresh player standing on the start cell with empty pockets.
    pub fn new(player_id: String, display_name: String, start: FloatPos) -> Self {
        PlayerState {
            player_id,
            display_name,
            position: start,
            yaw: 0.0,
            alive: true,
            has_compass: false,
            speed_boost_until: None,
            coins: 0,
            inventory: BTreeMap::new(),
            reached_goal: false,
            finish_rank: 0,
        }
    }

    pub fn item_count(&self, kind: ItemKind) -> u32 {
        self.inventory.get(&kind).copied().unwrap_or(0)
    }

    pub fn grant_item(&mut self, kind: ItemKind, count: u32) {
        *self.inventory.entry(kind).or_insert(0) += count;
    }

    /// Takes one item out of the inventory. Returns false when none is left,
    /// in which case nothing changes.
    pub fn consume_item(&mut self, kind: ItemKind) -> bool {
        match self.inventory.get_mut(&kind) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Movement speed multiplier at `now`: doubled while a potion is active.
    pub fn speed_factor(&self, now: Instant) -> f32 {
        match self.speed_boost_until {
            Some(until) if until > now => 2.0,
            _ => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn consuming_below_zero_is_impossible() {
        let mut player = PlayerState::new("P".into(), "P".into(), FloatPos::default());
        assert!(!player.consume_item(ItemKind::Hammer));
        player.grant_item(ItemKind::Hammer, 1);
        assert!(player.consume_item(ItemKind::Hammer));
        assert!(!player.consume_item(ItemKind::Hammer));
        assert_eq!(player.item_count(ItemKind::Hammer), 0);
    }

    #[test]
    fn speed_factor_follows_the_boost_window() {
        let now = Instant::now();
        let mut player = PlayerState::new("P".into(), "P".into(), FloatPos::default());
        assert_eq!(player.speed_factor(now), 1.0);
        player.speed_boost_until = Some(now + Duration::from_secs(10));
        assert_eq!(player.speed_factor(now), 2.0);
        assert_eq!(player.speed_factor(now + Duration::from_secs(11)), 1.0);
    }
}
