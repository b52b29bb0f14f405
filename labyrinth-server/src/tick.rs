//! The fixed-period driver for the engine's timed effects. One task, one
//! interval, one short visit to the exclusion region per tick.

use crate::dispatch::Dispatcher;
use crate::engine::GameEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};

/// Cadence of the tick loop.
pub const TICK_PERIOD: Duration = Duration::from_millis(100);

/// Runs until shutdown. A tick that overruns its deadline makes the next one
/// fire immediately, after that the interval falls back into cadence.
pub async fn run_tick_loop(
    engine: Arc<Mutex<GameEngine>>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(TICK_PERIOD);
    // One immediate catch-up tick after an overrun, then back in cadence.
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let report = {
                    let mut engine = engine.lock().await;
                    engine.tick(Instant::now())
                };
                if !report.is_empty() {
                    tracing::debug!(
                        repaired = report.repaired_walls.len(),
                        expired = report.expired_traps.len(),
                        "Tick fired expirations."
                    );
                    // Walls and traps changed, everyone gets a fresh maze.
                    dispatcher.broadcast_maze().await;
                }
            }
        }
    }
    tracing::info!("Tick loop stopped.");
}
