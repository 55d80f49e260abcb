//! Control messages for a running link.

/// Commands that can be sent to a [`LinkManager`](crate::LinkManager) at runtime.
#[derive(Debug, Clone)]
pub enum LinkCommand {
    /// Write a payload to the peer. Dropped if the link is currently down.
    Send(String),
    /// Graceful shutdown
    Shutdown,
}

/// Connection state of a link, observable through
/// [`LinkManager::state`](crate::LinkManager::state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection; a reconnect is scheduled after the retry interval.
    Disconnected,
    /// A TCP connect attempt is in flight.
    Connecting,
    /// Connected and exchanging messages.
    Connected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}
