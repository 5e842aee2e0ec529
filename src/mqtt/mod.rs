//! # MQTT Engine
//!
//! An embeddable MQTT 3.1.1 client: wire codec, session state machine, subscription
//! registry and an async client façade that owns the transport and reconnect policy.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── packet.rs       - Control packet model (QoS, Message, Packet)
//! ├── codec.rs        - Byte encoding/decoding, tokio-util codec
//! ├── topic.rs        - Topic validation and wildcard matching
//! ├── session.rs      - Sans-I/O session state machine and in-flight tables
//! ├── keepalive.rs    - PINGREQ scheduling and response deadline
//! ├── reconnect.rs    - Exponential backoff policy
//! ├── registry.rs     - Filter registrations and handler fan-out
//! ├── transport.rs    - Connector seam and plain TCP connector
//! ├── handler.rs      - Connection task (handshake, serve loop, reconnects)
//! ├── client.rs       - Public client handle and event stream
//! ├── message_log.rs  - Bounded history of received messages and its topic tree
//! ├── config.rs       - Connection options and client settings
//! └── error.rs        - Error taxonomy
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! transport ──► MqttCodec ──► Session::handle ──► Step { outbound, events }
//!                                                     │            │
//!                                  connection task ◄──┘            ▼
//!                                                     registry handlers + Event channel
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use mqtt_explorer::mqtt::{Client, ClientSettings, ConnectionOptions, Message, QoS};
//!
//! # async fn demo() -> Result<(), mqtt_explorer::mqtt::MqttError> {
//! let (client, mut events) = Client::tcp(ClientSettings::default());
//! client.connect(ConnectionOptions::new("localhost", 1883)).await?;
//! client
//!     .subscribe_with_handler("sensors/#", QoS::AtLeastOnce, |m| println!("{}", m.topic))
//!     .await?;
//! client
//!     .publish(Message::new("sensors/temperature", "21.5", QoS::AtLeastOnce))
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
mod handler;
pub mod keepalive;
pub mod message_log;
pub mod packet;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod topic;
pub mod transport;

pub use client::{Client, ClientStatus, ConnectOutcome, DisconnectReason, Event};
pub use config::{ClientSettings, ConnectionOptions, LastWill, TransportScheme};
pub use error::{MqttError, ProtocolError, TransportError, ValidationError};
pub use message_log::{LoggedMessage, MessageLog, TopicNode};
pub use packet::{Message, Packet, QoS, SubscribeReturnCode};
pub use reconnect::ReconnectPolicy;
pub use registry::{HandlerId, MessageHandler};
pub use session::SessionState;
pub use topic::{matches, TopicFilter};
pub use transport::{Connector, TcpConnector, Transport};
