//! The closed set of purchasable items and their fixed prices.

use serde::{Deserialize, Serialize};

/// Everything a player can buy and carry during a match.
///
/// The pseudo-item `coin` that the operator `give` command accepts is *not*
/// part of this set; it never lives in an inventory.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    SpeedPotion,
    Compass,
    Hammer,
    /// Older client builds send `sword` for this one.
    #[serde(alias = "sword")]
    KillSword,
    SlowTrap,
    SwapItem,
}

impl ItemKind {
    /// All kinds in wire order, handy for iteration.
    pub const ALL: [ItemKind; 6] = [
        ItemKind::SpeedPotion,
        ItemKind::Compass,
        ItemKind::Hammer,
        ItemKind::KillSword,
        ItemKind::SlowTrap,
        ItemKind::SwapItem,
    ];

    /// Price in this-match coins.
    pub fn price(self) -> u32 {
        match self {
            ItemKind::SpeedPotion => 20,
            ItemKind::Compass => 25,
            ItemKind::Hammer => 50,
            ItemKind::KillSword => 50,
            ItemKind::SlowTrap => 30,
            ItemKind::SwapItem => 60,
        }
    }

    /// The canonical string as it appears on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            ItemKind::SpeedPotion => "speed_potion",
            ItemKind::Compass => "compass",
            ItemKind::Hammer => "hammer",
            ItemKind::KillSword => "kill_sword",
            ItemKind::SlowTrap => "slow_trap",
            ItemKind::SwapItem => "swap_item",
        }
    }

    /// Parses a wire string, accepting the historical `sword` alias.
    pub fn parse(name: &str) -> Option<ItemKind> {
        match name {
            "speed_potion" => Some(ItemKind::SpeedPotion),
            "compass" => Some(ItemKind::Compass),
            "hammer" => Some(ItemKind::Hammer),
            "kill_sword" | "sword" => Some(ItemKind::KillSword),
            "slow_trap" => Some(ItemKind::SlowTrap),
            "swap_item" => Some(ItemKind::SwapItem),
            _ => None,
        }
    }
}
