//! Common transport building blocks shared by the relay services.

pub mod error;
pub mod link_handler;
pub mod link_manager;
pub mod messages;

pub use error::Error;
pub use link_handler::LinkHandler;
pub use link_manager::{LinkManager, LinkManagerConfig};
pub use messages::{LinkCommand, LinkState};
