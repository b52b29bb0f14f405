//! The accept loop of the game socket. Mints connection ids, hands every
//! socket to a fresh endpoint worker and owns the drain sequence for those
//! workers when the server goes down.

use crate::broadcaster::Broadcaster;
use crate::connection;
use crate::dispatch::Dispatcher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// How long the drain waits for connection workers before detaching them.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Runs until the shutdown flag flips. On the way out the listener socket is
/// closed first so nobody new gets in, then every live connection is asked
/// to close and the workers are joined with a bounded deadline.
pub async fn run_listener(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    broadcaster: Arc<Broadcaster>,
    mut shutdown: watch::Receiver<bool>,
) {
    let next_conn_id = AtomicU64::new(1);
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(?err, "Accept failed.");
                        continue;
                    }
                };
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                workers.spawn(connection::handle_connection(
                    stream,
                    conn_id,
                    peer,
                    dispatcher.clone(),
                    broadcaster.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }

    // Refuse new connections from here on.
    drop(listener);
    tracing::info!("Listener closed, draining connections.");

    // Ask every connection to close, then join with a deadline. Whatever is
    // still around afterwards gets aborted rather than blocking shutdown.
    broadcaster.close_all();
    let drained = tokio::time::timeout(DRAIN_DEADLINE, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Connection drain deadline hit, detaching workers.");
        workers.abort_all();
    }
}
