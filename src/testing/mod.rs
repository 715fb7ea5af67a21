//! Testing utilities and mock implementations
//!
//! Lets the session, the comms tasks and the client façade be exercised
//! without a real MQTT server.

pub mod mocks;

pub use mocks::*;
