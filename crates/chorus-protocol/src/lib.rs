//! Chorus Protocol
//!
//! Wire types shared between the signaling server and its clients.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
