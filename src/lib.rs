//! MQTT client session core
//!
//! The session and delivery state machine of an MQTT 3.1.1 client: message
//! id allocation, in-flight windowing, QoS 0/1/2 handshakes, durable restore
//! of unfinished deliveries, keep-alive, and the connection lifecycle that
//! ties the sender, receiver, completion notifier and pinger together.
//!
//! Wire encoding is kept behind the [`transport::Codec`] seam; the crate
//! ships a length-prefixed JSON codec for in-process and test transports.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_session::{ClientConfig, MqttClient, QoS};
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::new("tcp://localhost:1883");
//! let client = MqttClient::new(config)?;
//! client.connect().await?;
//!
//! let token = client.publish("sensors/7/temp", b"21.5".to_vec(), QoS::AtLeastOnce, false)?;
//! token.wait_for_completion(None).await?;
//!
//! client.disconnect().await?;
//! # Ok::<(), mqtt_session::MqttError>(())
//! # });
//! ```

pub mod client;
pub mod comms;
pub mod config;
pub mod error;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod token;
pub mod transport;

pub use client::MqttClient;
pub use comms::{Connection, ConnectionState, MqttCallback};
pub use config::{ClientConfig, ConfigError};
pub use error::{MqttError, MqttResult};
pub use protocol::{Message, MessageKind, Publish, QoS};
pub use session::Session;
pub use token::{ActionListener, Token, TokenRegistry};
