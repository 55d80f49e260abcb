//! Message tracing for routed signalling traffic.
//!
//! With verbose logging on, every incoming, outgoing and forwarded message is
//! logged at `info`; otherwise at `debug`.

use serde::Serialize;
use tracing::{debug, enabled, info, Level};

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageLog {
    verbose: bool,
}

impl MessageLog {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// A message received from `source`.
    pub fn incoming<T: Serialize + ?Sized>(&self, source: &str, msg: &T) {
        if let Some(json) = self.render(msg) {
            if self.verbose {
                info!("{} -> {}", source, json);
            } else {
                debug!("{} -> {}", source, json);
            }
        }
    }

    /// A message originated by the relay for `dest`.
    pub fn outgoing<T: Serialize + ?Sized>(&self, dest: &str, msg: &T) {
        if let Some(json) = self.render(msg) {
            if self.verbose {
                info!("{} <- {}", dest, json);
            } else {
                debug!("{} <- {}", dest, json);
            }
        }
    }

    /// A message relayed from `source` to `dest`.
    pub fn forward<T: Serialize + ?Sized>(&self, source: &str, dest: &str, msg: &T) {
        if let Some(json) = self.render(msg) {
            if self.verbose {
                info!("{} -> {} {}", source, dest, json);
            } else {
                debug!("{} -> {} {}", source, dest, json);
            }
        }
    }

    /// A raw frame that had no handler. Only logged when verbose.
    pub fn unsupported(&self, source: &str, raw: &str) {
        if self.verbose {
            info!("{} sent unsupported frame: {}", source, raw);
        }
    }

    fn render<T: Serialize + ?Sized>(&self, msg: &T) -> Option<String> {
        if !self.verbose && !enabled!(Level::DEBUG) {
            return None;
        }
        serde_json::to_string(msg).ok()
    }
}
