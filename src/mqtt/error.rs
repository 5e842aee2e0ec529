//! Error taxonomy for the MQTT engine
//!
//! Every failure the engine can report falls into one of the categories below. The
//! category decides what happens to the connection:
//!
//! | Category            | Connection effect                         |
//! |---------------------|-------------------------------------------|
//! | `Transport`         | closed, reconnect policy applies          |
//! | `Protocol` (fatal)  | closed, reconnect from scratch            |
//! | `Auth`              | closed, no automatic retry                |
//! | `Timeout`           | none, the session continues               |
//! | `Validation`        | none, rejected before any network I/O     |
//! | `DeliveryAbandoned` | none, the in-flight entry was given up    |

use std::io;

use super::packet::{ConnectReturnCode, Message, PacketType};

/// Top-level error returned by client, session and codec operations
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// Socket or stream failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed packet or protocol violation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The broker refused the CONNECT
    ///
    /// The client never retries automatically with the same credentials.
    #[error("Connection refused by broker: {0}")]
    Auth(ConnectReturnCode),

    /// A local wait for an acknowledgement expired
    ///
    /// The packet id is set when the wait concerned a tracked packet. The in-flight
    /// entry is kept and will be resent on the next reconnect unless aborted.
    #[error("Timed out waiting for broker response (packet id: {packet_id:?})")]
    Timeout { packet_id: Option<u16> },

    /// Input rejected before any I/O happened
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// An in-flight message was given up
    #[error("Delivery of packet {packet_id} to '{}' abandoned", .message.topic)]
    DeliveryAbandoned { packet_id: u16, message: Message },

    /// Operation not allowed in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl MqttError {
    /// Whether the error must tear down the current connection
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            MqttError::Transport(_) | MqttError::Auth(_) => true,
            MqttError::Protocol(e) => e.is_fatal(),
            MqttError::Timeout { .. }
            | MqttError::Validation(_)
            | MqttError::DeliveryAbandoned { .. }
            | MqttError::InvalidState(_) => false,
        }
    }
}

impl From<io::Error> for MqttError {
    fn from(e: io::Error) -> Self {
        MqttError::Transport(TransportError::Io(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Not connected")]
    NotConnected,

    #[error("Connect attempt timed out")]
    ConnectTimeout,

    #[error("No response to keep-alive ping")]
    KeepAliveTimeout,

    #[error("Unsupported transport scheme: {0}")]
    UnsupportedScheme(String),
}

/// Wire-level and state-level protocol violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed remaining length")]
    MalformedRemainingLength,

    #[error("Packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Invalid fixed header flags {flags:#06b} for {packet_type:?}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },

    #[error("Invalid QoS value: {0}")]
    InvalidQoS(u8),

    #[error("Truncated packet while reading {0}")]
    Truncated(&'static str),

    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Unsupported protocol name '{name}' level {level}")]
    InvalidProtocol { name: String, level: u8 },

    #[error("Invalid connect flags: {0:#010b}")]
    InvalidConnectFlags(u8),

    #[error("Invalid return code: {0:#04x}")]
    InvalidReturnCode(u8),

    #[error("{0:?} must carry at least one topic")]
    EmptyTopicList(PacketType),

    #[error("Packet identifier must not be zero")]
    ZeroPacketId,

    #[error("Field too long to encode: {0} bytes")]
    FieldTooLong(usize),

    #[error("Unexpected {packet:?} in state {state}")]
    UnexpectedPacket { packet: PacketType, state: String },

    #[error("Unexpected {packet:?} for packet id {packet_id}")]
    UnexpectedAck { packet: PacketType, packet_id: u16 },
}

impl ProtocolError {
    /// Out-of-order or unknown acknowledgements are logged and ignored; everything else
    /// closes the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::UnexpectedAck { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Topic must not be empty")]
    EmptyTopic,

    #[error("Topic name '{0}' must not contain wildcards")]
    WildcardInTopic(String),

    #[error("Topic or filter exceeds 65535 bytes ({0} bytes)")]
    TooLong(usize),

    #[error("Topic or filter contains a NUL character")]
    NullCharacter,

    #[error("Invalid topic filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: &'static str },

    #[error("Payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Client id must not be empty when resuming a session")]
    EmptyClientId,

    #[error("At least one topic filter is required")]
    NoFilters,

    #[error("All 65535 packet identifiers are in use")]
    PacketIdsExhausted,
}
