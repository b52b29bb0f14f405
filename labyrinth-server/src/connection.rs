//! Per-connection handling after the handshake: one reader task feeding the
//! dispatcher, one writer task draining the bounded outbound queue. Whichever
//! side finishes first takes the other one down with it, then the dispatcher
//! is told about the disconnect exactly once.

use crate::broadcaster::{Broadcaster, OutboundFrame};
use crate::dispatch::Dispatcher;
use crate::frame::{self, Frame};
use crate::hand_shake;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, watch};

/// How long the writer gets to flush its close frame once the reader ends.
const WRITER_FLUSH_GRACE: Duration = Duration::from_millis(200);

/// Does the whole lifetime of one game socket: handshake, the two pumping
/// tasks, and the disconnect notification at the end.
pub async fn handle_connection(
    mut stream: TcpStream,
    conn_id: u64,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    broadcaster: Arc<Broadcaster>,
    shutdown: watch::Receiver<bool>,
) {
    let Some(request) = hand_shake::perform_handshake(&mut stream).await else {
        tracing::debug!(conn_id, %peer, "Handshake failed, no connection record.");
        return;
    };
    tracing::info!(conn_id, %peer, path = request.path, "Game socket connected.");

    let (queue_tx, queue_rx) = mpsc::channel(protocol::OUTBOUND_QUEUE_SIZE);
    let close = Arc::new(Notify::new());
    broadcaster.register(conn_id, queue_tx, close.clone());

    let (read_half, write_half) = stream.into_split();

    let reader_dispatcher = dispatcher.clone();
    let reader_shutdown = shutdown.clone();
    let mut read_task = tokio::spawn(async move {
        read_loop(read_half, conn_id, reader_dispatcher, reader_shutdown).await
    });
    let mut write_task =
        tokio::spawn(async move { write_loop(write_half, queue_rx, close, shutdown).await });

    // If any one of the tasks runs to completion, we take the other one
    // down. The writer gets a moment to put the close frame on the wire.
    let reason = tokio::select! {
        res_a = &mut read_task => {
            let _ = tokio::time::timeout(WRITER_FLUSH_GRACE, &mut write_task).await;
            write_task.abort();
            res_a
        }
        res_b = &mut write_task => { read_task.abort(); res_b }
    };
    let reason = reason.unwrap_or_else(|err| {
        tracing::error!(conn_id, ?err, "Connection task panicked.");
        "internal panic"
    });

    tracing::info!(conn_id, %peer, reason, "Game socket closed.");
    dispatcher.handle_disconnect(conn_id).await;
}

/// Pumps bytes from the socket through the frame decoder into the
/// dispatcher. Control frames never leave this loop.
async fn read_loop(
    mut socket: OwnedReadHalf,
    conn_id: u64,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> &'static str {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        // Drain every complete frame already buffered.
        loop {
            match frame::decode(&buffer, true) {
                Ok(None) => break,
                Ok(Some((decoded, used))) => {
                    buffer.advance(used);
                    match decoded {
                        Frame::Text(text) => dispatcher.handle_message(conn_id, &text).await,
                        Frame::Ping(payload) => {
                            dispatcher.pong(conn_id, payload);
                        }
                        Frame::Pong(_) => {}
                        Frame::Close => {
                            dispatcher.request_close(conn_id);
                            return "peer sent close";
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(conn_id, %err, "Protocol error on read.");
                    dispatcher.protocol_violation(conn_id);
                    return "protocol error";
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return "server shutdown",
            read = socket.read_buf(&mut buffer) => match read {
                Ok(0) => return "connection lost",
                Ok(_) => {}
                Err(_) => return "connection lost",
            },
        }
    }
}

/// Drains the outbound queue onto the wire. Ends with a best-effort close
/// frame on every exit path.
async fn write_loop(
    mut socket: OwnedWriteHalf,
    mut queue: mpsc::Receiver<OutboundFrame>,
    close: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> &'static str {
    let reason = loop {
        tokio::select! {
            _ = close.notified() => break "close requested",
            _ = shutdown.changed() => break "server shutdown",
            frame = queue.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if socket.write_all(&frame::encode_text(&text, None)).await.is_err() {
                        return "connection lost";
                    }
                }
                Some(OutboundFrame::Pong(payload)) => {
                    if socket.write_all(&frame::encode_pong(&payload, None)).await.is_err() {
                        return "connection lost";
                    }
                }
                Some(OutboundFrame::Close) => break "close requested",
                None => break "queue closed",
            },
        }
    };
    // Flush what was queued before the close decision, an error or
    // auth_failed answer must still reach the peer.
    while let Ok(pending) = queue.try_recv() {
        match pending {
            OutboundFrame::Text(text) => {
                if socket.write_all(&frame::encode_text(&text, None)).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Pong(payload) => {
                if socket.write_all(&frame::encode_pong(&payload, None)).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Close => break,
        }
    }
    let _ = socket.write_all(&frame::encode_close(None)).await;
    let _ = socket.shutdown().await;
    reason
}

