//! Wires every component together and owns the shutdown ordering: flag,
//! listener, connections, workers, tick loop, console, persistence. All
//! collaborators are built here and passed down explicitly; there is no
//! ambient global state.

use crate::broadcaster::Broadcaster;
use crate::config;
use crate::console::{self, ConsoleContext, ConsoleSink};
use crate::dispatch::Dispatcher;
use crate::engine::GameEngine;
use crate::listener;
use crate::persistence::Persistence;
use crate::registry::PlayerRegistry;
use crate::tick;
use crate::web::{self, HttpState};
use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};

/// Everything the command line decides.
pub struct Options {
    pub http_port: u16,
    pub data_dir: PathBuf,
    pub web_dir: PathBuf,
}

/// How long the console worker gets to drain before it is detached.
const CONSOLE_DRAIN_DEADLINE: Duration = Duration::from_millis(500);

/// Brings the server up, runs until a shutdown signal arrives, then takes
/// everything down in order. Any error before the accept loops start is an
/// initialization failure and bubbles up.
pub async fn run(options: Options, sink: ConsoleSink) -> Result<()> {
    let started_at = Instant::now();

    // Storage first, everything else feeds from it.
    let persistence = Arc::new(Persistence::new(&options.data_dir));
    persistence.ensure_layout().await?;
    let server_config = config::load_or_create(&options.data_dir.join("config.json")).await?;

    let maze = match persistence.load_maze().await? {
        Some(maze) => {
            GameEngine::validate_maze(&maze)
                .map_err(|reason| anyhow!("persisted maze is invalid: {reason}"))?;
            tracing::info!("Loaded the persisted maze.");
            maze
        }
        None => {
            let maze = crate::maze_gen::generate(
                server_config.maze_width,
                server_config.maze_height,
                server_config.maze_layers,
            );
            persistence.save_maze(&maze).await?;
            tracing::info!(
                coins = maze.coin_positions.len(),
                "Generated and persisted a fresh maze."
            );
            maze
        }
    };

    let registry = Arc::new(Mutex::new(PlayerRegistry::from_records(
        persistence.load_players().await?,
    )));
    let engine = Arc::new(Mutex::new(GameEngine::new(maze)));
    let broadcaster = Arc::new(Broadcaster::new());
    let dispatcher = Arc::new(Dispatcher::new(
        engine.clone(),
        registry.clone(),
        broadcaster.clone(),
        persistence.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // HTTP surface on the base port.
    let http_listener = TcpListener::bind(("0.0.0.0", options.http_port))
        .await
        .with_context(|| format!("binding HTTP port {}", options.http_port))?;
    let websocket_port = options.http_port + 1;
    let http_state = Arc::new(HttpState {
        config: server_config,
        websocket_port,
        registry: registry.clone(),
        broadcaster: broadcaster.clone(),
        started_at,
    });
    let router = web::router(http_state, options.web_dir.clone());
    let mut http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        let result = axum::serve(http_listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await;
        if let Err(err) = result {
            tracing::error!(?err, "HTTP surface failed.");
        }
    });

    // Game socket on the next port up.
    let game_listener = TcpListener::bind(("0.0.0.0", websocket_port))
        .await
        .with_context(|| format!("binding game port {websocket_port}"))?;
    let listener_task = tokio::spawn(listener::run_listener(
        game_listener,
        dispatcher.clone(),
        broadcaster.clone(),
        shutdown_rx.clone(),
    ));

    let tick_task = tokio::spawn(tick::run_tick_loop(
        engine.clone(),
        dispatcher.clone(),
        shutdown_rx.clone(),
    ));

    let console_shutdown = Arc::new(AtomicBool::new(false));
    let console_task = console::spawn_console(
        ConsoleContext {
            engine: engine.clone(),
            registry: registry.clone(),
            dispatcher: dispatcher.clone(),
        },
        sink,
        tokio::runtime::Handle::current(),
        console_shutdown.clone(),
    );

    tracing::info!(
        http_port = options.http_port,
        websocket_port,
        data_dir = ?options.data_dir,
        "Server is up."
    );

    wait_for_signal().await;
    tracing::info!("Shutdown signal received.");

    // (1) Flip the flag; every worker observes it at its next suspension.
    let _ = shutdown_tx.send(true);
    console_shutdown.store(true, Ordering::Relaxed);

    // (2)-(4) The listener closes its socket, closes every connection and
    // joins the endpoint workers with a bounded deadline.
    if let Err(err) = listener_task.await {
        tracing::warn!(?err, "Listener task ended badly.");
    }

    // (5) Tick loop stops before the engine is torn down.
    if let Err(err) = tick_task.await {
        tracing::warn!(?err, "Tick task ended badly.");
    }
    if let Err(err) = http_task.await {
        tracing::warn!(?err, "HTTP task ended badly.");
    }

    // (6) Console drain, bounded; a stuck read is detached, not awaited.
    let joined = tokio::time::timeout(
        CONSOLE_DRAIN_DEADLINE,
        tokio::task::spawn_blocking(move || console_task.join()),
    )
    .await;
    match joined {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(_))) => tracing::warn!("Console thread panicked."),
        Ok(Err(err)) => tracing::warn!(?err, "Console join failed."),
        Err(_) => tracing::warn!("Console drain deadline hit, detaching."),
    }

    // (7) Durable state last. Failures are logged, shutdown continues.
    let records = {
        let registry = registry.lock().await;
        registry.records()
    };
    if let Err(err) = persistence.save_players(&records).await {
        tracing::error!(?err, "Could not persist player records during shutdown.");
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}

/// Interrupt and terminate both initiate the shutdown sequence.
async fn wait_for_signal() {
    let interrupt = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(err) => {
                    tracing::warn!(?err, "No SIGTERM handler, relying on interrupt only.");
                    let _ = interrupt.await;
                    return;
                }
            };
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }
}
