//! Produces the maze data model when no persisted maze exists: layered
//! depth-first carving, one stair pair between adjacent layers, and a coin
//! placement pass. A maze loaded from disk is authoritative and never passes
//! through here.

use protocol::{CellKind, CoinSpot, GridPos, MazeData};
use rand::Rng;
use rand::seq::SliceRandom;

/// How many coins the placement pass aims for on a full-size maze.
const COIN_TARGET: usize = 110;

/// Carves a multi-layer maze. Dimensions below 5x5x1 are bumped up to keep
/// the shell and at least one room.
pub fn generate(width: i32, height: i32, layers: i32) -> MazeData {
    let width = width.max(5);
    let height = height.max(5);
    let layers = layers.max(1);
    let mut rng = rand::thread_rng();

    let mut cells =
        vec![vec![vec![CellKind::Wall; width as usize]; height as usize]; layers as usize];
    for layer in cells.iter_mut() {
        carve_layer(layer, width, height, &mut rng);
    }

    // The start sits in the near corner of the ground layer, the end in the
    // far corner of the top layer. Both are rooms of the odd lattice.
    let start = GridPos::new(1, 1, 0);
    let end = GridPos::new(far_odd(width), far_odd(height), layers - 1);
    cells[start.z as usize][start.y as usize][start.x as usize] = CellKind::Start;
    cells[end.z as usize][end.y as usize][end.x as usize] = CellKind::End;

    // One stair pair between each pair of adjacent layers keeps the end
    // reachable from the start.
    for z in 0..(layers - 1) as usize {
        loop {
            let x = random_odd(width, &mut rng);
            let y = random_odd(height, &mut rng);
            let below = cells[z][y as usize][x as usize];
            let above = cells[z + 1][y as usize][x as usize];
            if below == CellKind::Path && above == CellKind::Path {
                cells[z][y as usize][x as usize] = CellKind::StairUp;
                cells[z + 1][y as usize][x as usize] = CellKind::StairDown;
                break;
            }
        }
    }

    let mut candidates = Vec::new();
    for (z, layer) in cells.iter().enumerate() {
        for (y, row) in layer.iter().enumerate() {
            for (x, cell) in row.iter().enumerate() {
                if *cell == CellKind::Path {
                    candidates.push(GridPos::new(x as i32, y as i32, z as i32));
                }
            }
        }
    }
    candidates.shuffle(&mut rng);
    candidates.truncate(COIN_TARGET);
    let coin_positions = candidates
        .iter()
        .map(|position| {
            cells[position.z as usize][position.y as usize][position.x as usize] = CellKind::Coin;
            CoinSpot {
                position: *position,
                collected: false,
            }
        })
        .collect();

    MazeData {
        width,
        height,
        layers,
        cells,
        start,
        end,
        coin_positions,
    }
}

/// Classic depth-first carving on the odd lattice of one layer.
fn carve_layer(layer: &mut [Vec<CellKind>], width: i32, height: i32, rng: &mut impl Rng) {
    let mut visited = vec![vec![false; width as usize]; height as usize];
    let mut stack = vec![(1i32, 1i32)];
    visited[1][1] = true;
    layer[1][1] = CellKind::Path;

    while let Some((x, y)) = stack.last().copied() {
        let mut neighbors: Vec<(i32, i32)> = [(2, 0), (-2, 0), (0, 2), (0, -2)]
            .iter()
            .map(|(dx, dy)| (x + dx, y + dy))
            .filter(|(nx, ny)| {
                *nx >= 1
                    && *ny >= 1
                    && *nx < width - 1
                    && *ny < height - 1
                    && !visited[*ny as usize][*nx as usize]
            })
            .collect();
        if neighbors.is_empty() {
            stack.pop();
            continue;
        }
        neighbors.shuffle(rng);
        let (nx, ny) = neighbors[0];
        // Open the room and the wall between.
        layer[ny as usize][nx as usize] = CellKind::Path;
        layer[((y + ny) / 2) as usize][((x + nx) / 2) as usize] = CellKind::Path;
        visited[ny as usize][nx as usize] = true;
        stack.push((nx, ny));
    }
}

/// The largest odd coordinate that stays clear of the shell.
fn far_odd(extent: i32) -> i32 {
    if (extent - 2) % 2 == 1 {
        extent - 2
    } else {
        extent - 3
    }
}

fn random_odd(extent: i32, rng: &mut impl Rng) -> i32 {
    let rooms = (extent - 1) / 2;
    rng.gen_range(0..rooms) * 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GameEngine;

    #[test]
    fn the_default_maze_passes_validation() {
        let maze = generate(50, 50, 7);
        GameEngine::validate_maze(&maze).unwrap();
    }

    #[test]
    fn coin_pool_is_within_the_band() {
        let maze = generate(50, 50, 7);
        assert!((100..=120).contains(&maze.coin_positions.len()));
        for coin in &maze.coin_positions {
            assert_eq!(maze.cell(coin.position), Some(CellKind::Coin));
        }
    }

    #[test]
    fn stairs_come_in_pairs() {
        let maze = generate(21, 21, 3);
        for z in 0..maze.layers {
            for y in 0..maze.height {
                for x in 0..maze.width {
                    let pos = GridPos::new(x, y, z);
                    match maze.cell(pos) {
                        Some(CellKind::StairUp) => {
                            assert_eq!(
                                maze.cell(GridPos::new(x, y, z + 1)),
                                Some(CellKind::StairDown)
                            );
                        }
                        Some(CellKind::StairDown) => {
                            assert_eq!(
                                maze.cell(GridPos::new(x, y, z - 1)),
                                Some(CellKind::StairUp)
                            );
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    #[test]
    fn tiny_dimensions_are_clamped() {
        let maze = generate(0, 0, 0);
        GameEngine::validate_maze(&maze).unwrap();
    }
}
