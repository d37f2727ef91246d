//! Wire protocol for the signaling channel.

pub mod messages;

pub use messages::*;
