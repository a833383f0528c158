//! Moving data between the engine and the remote backend.

pub mod drain;
mod refresh;

pub use drain::{drain_once, DrainReport};
pub use refresh::refresh_all;
