//! The maze data model. The same structure is broadcast as `maze_data` and
//! persisted to `maze_data.json`, so a serialize/deserialize round trip must
//! yield an equal maze.

use serde::{Deserialize, Serialize};

/// What a single grid cell is.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Wall,
    Path,
    StairUp,
    StairDown,
    Start,
    End,
    /// A path cell that holds a collectible.
    Coin,
}

impl CellKind {
    /// The derived blocking view: walls block, everything else is traversable.
    pub fn is_blocking(self) -> bool {
        self == CellKind::Wall
    }
}

/// Integer cell coordinates.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl GridPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        GridPos { x, y, z }
    }
}

/// Continuous player coordinates. Rounding yields the occupied cell.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
pub struct FloatPos {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl FloatPos {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        FloatPos { x, y, z }
    }

    /// The integer cell this position occupies.
    pub fn to_cell(self) -> GridPos {
        GridPos {
            x: self.x.round() as i32,
            y: self.y.round() as i32,
            z: self.z.round() as i32,
        }
    }
}

impl From<GridPos> for FloatPos {
    fn from(cell: GridPos) -> Self {
        FloatPos {
            x: cell.x as f32,
            y: cell.y as f32,
            z: cell.z as f32,
        }
    }
}

/// One entry of the ordered coin pool.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
pub struct CoinSpot {
    pub position: GridPos,
    pub collected: bool,
}

/// The full three-dimensional grid plus the coin pool and the two special cells.
///
/// Cells are stored layer by layer, row by row (`cells[z][y][x]`).
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct MazeData {
    pub width: i32,
    pub height: i32,
    pub layers: i32,
    pub cells: Vec<Vec<Vec<CellKind>>>,
    pub start: GridPos,
    pub end: GridPos,
    pub coin_positions: Vec<CoinSpot>,
}

impl MazeData {
    pub fn in_bounds(&self, pos: GridPos) -> bool {
        pos.x >= 0
            && pos.y >= 0
            && pos.z >= 0
            && pos.x < self.width
            && pos.y < self.height
            && pos.z < self.layers
    }

    /// The cell at `pos`, or `None` when out of bounds.
    pub fn cell(&self, pos: GridPos) -> Option<CellKind> {
        if !self.in_bounds(pos) {
            return None;
        }
        Some(self.cells[pos.z as usize][pos.y as usize][pos.x as usize])
    }

    pub fn set_cell(&mut self, pos: GridPos, kind: CellKind) {
        if self.in_bounds(pos) {
            self.cells[pos.z as usize][pos.y as usize][pos.x as usize] = kind;
        }
    }

    /// Out-of-bounds counts as blocking.
    pub fn is_blocking(&self, pos: GridPos) -> bool {
        self.cell(pos).is_none_or(CellKind::is_blocking)
    }

    /// Count of coins that have not been picked up yet.
    pub fn remaining_coins(&self) -> usize {
        self.coin_positions.iter().filter(|c| !c.collected).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_maze() -> MazeData {
        let mut cells = vec![vec![vec![CellKind::Wall; 5]; 5]; 2];
        cells[0][1][1] = CellKind::Start;
        cells[0][1][2] = CellKind::Path;
        cells[0][1][3] = CellKind::StairUp;
        cells[1][1][3] = CellKind::StairDown;
        cells[1][3][3] = CellKind::End;
        MazeData {
            width: 5,
            height: 5,
            layers: 2,
            cells,
            start: GridPos::new(1, 1, 0),
            end: GridPos::new(3, 3, 1),
            coin_positions: vec![CoinSpot {
                position: GridPos::new(2, 1, 0),
                collected: false,
            }],
        }
    }

    #[test]
    fn only_walls_block() {
        let maze = tiny_maze();
        assert!(maze.is_blocking(GridPos::new(0, 0, 0)));
        assert!(!maze.is_blocking(GridPos::new(1, 1, 0)));
        assert!(!maze.is_blocking(GridPos::new(3, 1, 0)));
    }

    #[test]
    fn out_of_bounds_blocks() {
        let maze = tiny_maze();
        assert!(maze.is_blocking(GridPos::new(-1, 0, 0)));
        assert!(maze.is_blocking(GridPos::new(5, 1, 0)));
        assert!(maze.is_blocking(GridPos::new(1, 1, 2)));
    }

    #[test]
    fn json_round_trip_yields_equal_maze() {
        let maze = tiny_maze();
        let encoded = serde_json::to_string(&maze).unwrap();
        let decoded: MazeData = serde_json::from_str(&encoded).unwrap();
        assert_eq!(maze, decoded);
    }

    #[test]
    fn rounding_picks_the_nearest_cell() {
        assert_eq!(
            FloatPos::new(1.4, 2.6, 0.2).to_cell(),
            GridPos::new(1, 3, 0)
        );
    }
}
