//! Fan-out of outbound messages. Every connection has one bounded queue
//! consumed by its writer task; within a connection the wire order is the
//! enqueue order, across connections nothing is promised. Broadcasts never
//! wait for a slow consumer: a queue that stays full past the grace period
//! gets its connection closed instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::sync::mpsc;

/// What travels through a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Pong(Vec<u8>),
    /// Tells the writer to send a close frame and hang up.
    Close,
}

struct ConnEntry {
    sender: mpsc::Sender<OutboundFrame>,
    close: Arc<Notify>,
    /// First moment a try_send found the queue full, cleared on success.
    full_since: Option<Instant>,
}

pub struct Broadcaster {
    /// Held only for lookups and bookkeeping, never across a suspension.
    connections: Mutex<HashMap<u64, ConnEntry>>,
    full_grace: Duration,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_grace(Duration::from_secs(2))
    }

    pub fn with_grace(full_grace: Duration) -> Self {
        Broadcaster {
            connections: Mutex::new(HashMap::new()),
            full_grace,
        }
    }

    /// Adds a connection's queue and its close signal.
    pub fn register(&self, conn_id: u64, sender: mpsc::Sender<OutboundFrame>, close: Arc<Notify>) {
        let mut connections = self.connections.lock().unwrap();
        connections.insert(
            conn_id,
            ConnEntry {
                sender,
                close,
                full_since: None,
            },
        );
    }

    pub fn unregister(&self, conn_id: u64) {
        let mut connections = self.connections.lock().unwrap();
        connections.remove(&conn_id);
    }

    pub fn connected_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Queues a message for one connection.
    pub fn send(&self, conn_id: u64, message: String) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(entry) = connections.get_mut(&conn_id) {
            Self::push(entry, OutboundFrame::Text(message), self.full_grace, conn_id);
        }
    }

    pub fn send_frame(&self, conn_id: u64, frame: OutboundFrame) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(entry) = connections.get_mut(&conn_id) {
            Self::push(entry, frame, self.full_grace, conn_id);
        }
    }

    /// Queues a message for everyone.
    pub fn broadcast(&self, message: String) {
        let mut connections = self.connections.lock().unwrap();
        for (conn_id, entry) in connections.iter_mut() {
            Self::push(
                entry,
                OutboundFrame::Text(message.clone()),
                self.full_grace,
                *conn_id,
            );
        }
    }

    /// Queues a message for everyone except `skipped`.
    pub fn broadcast_except(&self, skipped: u64, message: String) {
        let mut connections = self.connections.lock().unwrap();
        for (conn_id, entry) in connections.iter_mut() {
            if *conn_id != skipped {
                Self::push(
                    entry,
                    OutboundFrame::Text(message.clone()),
                    self.full_grace,
                    *conn_id,
                );
            }
        }
    }

    /// Asks a connection's tasks to shut the socket down.
    pub fn request_close(&self, conn_id: u64) {
        let close = {
            let connections = self.connections.lock().unwrap();
            connections.get(&conn_id).map(|entry| entry.close.clone())
        };
        if let Some(close) = close {
            close.notify_one();
        }
    }

    /// Signals every connection to close. The handles are collected under
    /// the lock, the notification happens outside of it.
    pub fn close_all(&self) {
        let handles: Vec<Arc<Notify>> = {
            let connections = self.connections.lock().unwrap();
            connections.values().map(|entry| entry.close.clone()).collect()
        };
        for close in handles {
            close.notify_one();
        }
    }

    fn push(entry: &mut ConnEntry, frame: OutboundFrame, grace: Duration, conn_id: u64) {
        match entry.sender.try_send(frame) {
            Ok(()) => entry.full_since = None,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let since = *entry.full_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= grace {
                    tracing::warn!(conn_id, "Outbound queue stuck, closing the connection.");
                    entry.close.notify_one();
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Writer already gone, the connection is on its way out.
            }
        }
    }
}
