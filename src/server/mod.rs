//! WebSocket server module
//!
//! Handles WebSocket connections from bridge clients and routes messages
//! to the hosted colonies.

mod handler;
mod protocol;
mod websocket;

pub use handler::*;
pub use protocol::*;
pub use websocket::*;
