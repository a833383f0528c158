//! Request handlers shared by the HTTP routes and the websocket.

mod mutations;
mod queue;
mod websocket;

pub use mutations::*;
pub use queue::*;
pub use websocket::*;
