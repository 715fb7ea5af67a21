//! Protocol message model used by the session core
//!
//! Packets are modelled as a tagged union so that every dispatch site
//! (`send`, ack handling, inbound handling) matches on the kind exhaustively.

pub mod messages;

pub use messages::*;
