//! Connection handles.
//!
//! A [`Connection`] is the writable half of an accepted WebSocket: messages
//! are queued on an unbounded channel drained by the socket's writer task, so
//! every send is a synchronous, non-blocking, fallible operation.

use crate::error::{Result, SignallingError};
use axum::extract::ws::{CloseFrame, Message};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Writable handle to one WebSocket connection.
pub struct Connection {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Channel to the connection's writer task.
    tx: mpsc::UnboundedSender<Message>,
    /// Set once a close has been requested.
    closing: AtomicBool,
    /// Wakes the connection's reader loop on a forced close.
    shutdown: Notify,
    /// Timestamp when the connection was accepted.
    pub connected_at: i64,
}

impl Connection {
    /// Create a connection handle and the receiver its writer task drains.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            tx,
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            connected_at: Utc::now().timestamp_millis(),
        });
        (connection, rx)
    }

    /// Serialize and send a message.
    pub fn send<T: Serialize + ?Sized>(&self, msg: &T) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.send_text(json)
    }

    /// Send a pre-serialized text frame.
    pub fn send_text(&self, text: String) -> Result<()> {
        if self.is_closing() {
            return Err(SignallingError::ConnectionClosed);
        }
        self.tx.send(Message::Text(text.into()))?;
        Ok(())
    }

    /// Close the connection immediately with a code and reason.
    /// Later sends fail; calling this more than once has no further effect.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason: String = reason.into();
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if self.tx.send(Message::Close(Some(frame))).is_err() {
            debug!("Connection {} writer already gone, close frame not queued", self.id);
        }
        self.shutdown.notify_one();
    }

    /// Mark the connection dead without a close frame (write failure).
    pub(crate) fn abort(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Whether a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been closed or aborted.
    pub async fn closed(&self) {
        self.shutdown.notified().await
    }

    /// Milliseconds since the connection was accepted.
    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.connected_at
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_queues_text_frame() {
        let (conn, mut rx) = Connection::new();
        conn.send(&json!({"type": "ping"})).unwrap();

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"type":"ping"}"#),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_sends() {
        let (conn, mut rx) = Connection::new();
        conn.close(1008, "Cannot parse");
        conn.close(1000, "again");

        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1008);
                assert_eq!(frame.reason.as_str(), "Cannot parse");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            conn.send(&json!({})),
            Err(SignallingError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (conn, _rx) = Connection::new();
        conn.close(1000, "");
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }

    #[test]
    fn test_send_after_writer_gone_fails() {
        let (conn, rx) = Connection::new();
        drop(rx);
        assert!(matches!(
            conn.send(&json!({})),
            Err(SignallingError::ChannelSend)
        ));
    }

    #[tokio::test]
    async fn test_close_after_writer_gone_still_wakes_reader() {
        let (conn, rx) = Connection::new();
        drop(rx);
        conn.close(1000, "streamer disconnected");

        assert!(conn.is_closing());
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }
}
