//! Link handler trait for services that keep a persistent outbound link.

use async_trait::async_trait;

/// Trait that services implement to plug their protocol into a
/// [`LinkManager`](crate::LinkManager). The manager calls these methods when
/// link events occur.
#[async_trait]
pub trait LinkHandler: Send + Sync + 'static {
    /// Returns the `host:port` address to connect to.
    fn address(&self) -> &str;

    /// Returns the message to send immediately after every (re)connect.
    /// Return None if no handshake is needed.
    fn on_connect_message(&self) -> Option<String>;

    /// Returns the message written on every keepalive tick.
    /// Return None to disable keepalive writes.
    fn keepalive_message(&self) -> Option<String> {
        None
    }

    /// Called with any bytes received from the peer.
    /// Default implementation ignores them.
    async fn on_data(&self, _data: &[u8]) {}

    /// Called when the connection is lost (before the reconnect delay).
    async fn on_disconnect(&self) {}
}
