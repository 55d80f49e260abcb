//! Persistent outbound TCP link with fixed-interval reconnection and keepalive.
//!
//! The link moves through an explicit state machine:
//!
//! ```text
//!            retry_interval elapsed
//!   Disconnected ──────────────────► Connecting ──► Connected
//!        ▲                               │              │
//!        └───────── connect error ───────┘              │
//!        └───────── close / read / write error ─────────┘
//! ```
//!
//! There is no retry limit and no backoff growth: a supervised service keeps
//! trying forever at the same interval.

use crate::error::{Error, Result};
use crate::link_handler::LinkHandler;
use crate::messages::{LinkCommand, LinkState};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Size of the read buffer for inbound bytes.
const READ_BUFFER_SIZE: usize = 4096;

/// Configuration for the link manager.
#[derive(Debug, Clone)]
pub struct LinkManagerConfig {
    /// Fixed delay between a disconnect and the next connect attempt.
    pub retry_interval: Duration,
    /// Interval between keepalive writes while connected.
    pub keepalive_interval: Duration,
    /// Upper bound on a single TCP connect attempt.
    pub connect_timeout: Duration,
    /// Label for logs and metrics (e.g., "matchmaker").
    pub label: String,
}

impl Default for LinkManagerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            label: "link".to_string(),
        }
    }
}

/// Outbound link manager.
/// Handles connection lifecycle, keepalive, reconnection and best-effort sends.
pub struct LinkManager<H: LinkHandler> {
    handler: Arc<H>,
    config: LinkManagerConfig,
    command_rx: mpsc::UnboundedReceiver<LinkCommand>,
    state_tx: watch::Sender<LinkState>,
}

impl<H: LinkHandler> LinkManager<H> {
    /// Create a new link manager.
    pub fn new(
        handler: H,
        config: LinkManagerConfig,
        command_rx: mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            handler: Arc::new(handler),
            config,
            command_rx,
            state_tx,
        }
    }

    /// Subscribe to link state changes.
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Run the link. Reconnects on every disconnect until shutdown.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.connect_and_run_loop().await {
                Ok(()) => {
                    info!("[{}] Link closed gracefully", self.config.label);
                    break;
                }
                Err(e) => {
                    self.set_state(LinkState::Disconnected);
                    counter!("link_disconnects_total", "link" => self.config.label.clone())
                        .increment(1);
                    warn!(
                        "[{}] Link to {} lost: {}, reconnecting in {:?}",
                        self.config.label,
                        self.handler.address(),
                        e,
                        self.config.retry_interval
                    );
                    self.handler.on_disconnect().await;

                    if self.wait_for_retry().await {
                        info!("[{}] Shutdown requested while disconnected", self.config.label);
                        break;
                    }
                }
            }
        }

        self.set_state(LinkState::Disconnected);
        Ok(())
    }

    /// Wait out the retry interval. Sends issued meanwhile are dropped.
    /// Returns true if shutdown was requested.
    async fn wait_for_retry(&mut self) -> bool {
        let delay = tokio::time::sleep(self.config.retry_interval);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return false,
                cmd = self.command_rx.recv() => match cmd {
                    Some(LinkCommand::Send(payload)) => self.drop_payload(&payload),
                    Some(LinkCommand::Shutdown) | None => return true,
                }
            }
        }
    }

    async fn connect_and_run_loop(&mut self) -> Result<()> {
        let address = self.handler.address().to_string();
        self.set_state(LinkState::Connecting);
        info!("[{}] Connecting to {}", self.config.label, address);

        let connect = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address));
        tokio::pin!(connect);

        let stream = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(Ok(stream)) => break stream,
                    Ok(Err(e)) => return Err(Error::Io(e)),
                    Err(_) => return Err(Error::ConnectTimeout(self.handler.address().to_string())),
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(LinkCommand::Send(payload)) => self.drop_payload(&payload),
                    Some(LinkCommand::Shutdown) | None => return Ok(()),
                }
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] Failed to set TCP_NODELAY: {}", self.config.label, e);
        }
        let (mut reader, mut writer) = stream.into_split();

        self.set_state(LinkState::Connected);
        counter!("link_connects_total", "link" => self.config.label.clone()).increment(1);
        info!("[{}] Connected to {}", self.config.label, address);

        // Handshake on every (re)connect
        if let Some(msg) = self.handler.on_connect_message() {
            debug!("[{}] Sending handshake: {}", self.config.label, msg);
            writer.write_all(msg.as_bytes()).await?;
        }

        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.reset(); // Don't fire immediately

        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("[{}] Peer closed the link", self.config.label);
                        return Err(Error::ConnectionClosed);
                    }
                    Ok(n) => self.handler.on_data(&buf[..n]).await,
                    Err(e) => return Err(Error::Io(e)),
                },

                cmd = self.command_rx.recv() => match cmd {
                    Some(LinkCommand::Send(payload)) => {
                        debug!("[{}] Sending: {}", self.config.label, payload);
                        writer.write_all(payload.as_bytes()).await?;
                    }
                    Some(LinkCommand::Shutdown) | None => {
                        info!("[{}] Received shutdown command", self.config.label);
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                },

                _ = keepalive.tick() => {
                    if let Some(msg) = self.handler.keepalive_message() {
                        debug!("[{}] Sending keepalive", self.config.label);
                        writer.write_all(msg.as_bytes()).await?;
                    }
                }
            }
        }
    }

    fn drop_payload(&self, payload: &str) {
        counter!("link_dropped_messages_total", "link" => self.config.label.clone()).increment(1);
        warn!(
            "[{}] Link is down, dropping message: {}",
            self.config.label, payload
        );
    }

    fn set_state(&self, state: LinkState) {
        gauge!("link_connected", "link" => self.config.label.clone())
            .set(if state == LinkState::Connected { 1.0 } else { 0.0 });
        self.state_tx.send_replace(state);
    }
}
