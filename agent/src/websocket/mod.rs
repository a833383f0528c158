//! WebSocket push channel for the UI layer.
//!
//! Connected clients receive every engine event and cache change as it
//! happens, and may submit mutations over the same socket.

mod manager;
mod protocol;

pub use manager::{ConnectionManager, MessageSender};
pub use protocol::*;
