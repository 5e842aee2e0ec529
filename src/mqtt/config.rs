//! Connection options and client tuning
//!
//! [`ConnectionOptions`] describes one broker connection and is fixed for the lifetime of
//! a session. [`ClientSettings`] tunes the engine around it (timeouts, reconnect policy,
//! size limits) and can be loaded from the `[client]` table of the application config.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::packet::{Connect, QoS, Will};
use super::reconnect::ReconnectPolicy;

/// Transport scheme requested for the connection
///
/// The engine itself only speaks MQTT over a byte stream; which schemes can actually be
/// opened depends on the [`Connector`](super::transport::Connector) in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportScheme {
    #[default]
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self {
            TransportScheme::Tcp => "tcp",
            TransportScheme::Tls => "tls",
            TransportScheme::Ws => "ws",
            TransportScheme::Wss => "wss",
        };
        f.write_str(scheme)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

/// Everything needed to open and identify one broker session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub transport: TransportScheme,
    /// WebSocket sub-path, only meaningful for `ws`/`wss` connectors
    pub path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Empty means "generate one" for clean sessions
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub last_will: Option<LastWill>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            transport: TransportScheme::Tcp,
            path: None,
            username: None,
            password: None,
            client_id: String::new(),
            clean_session: true,
            keep_alive_secs: 60,
            last_will: None,
        }
    }
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    /// `host:port` as used for socket connects
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the CONNECT packet for these options
    pub fn to_connect(&self) -> Connect {
        Connect {
            client_id: self.client_id.clone(),
            clean_session: self.clean_session,
            keep_alive: self.keep_alive_secs,
            will: self.last_will.as_ref().map(|will| Will {
                topic: will.topic.clone(),
                payload: Bytes::from(will.message.clone().into_bytes()),
                qos: will.qos,
                retain: will.retain,
            }),
            username: self.username.clone(),
            password: self
                .password
                .as_ref()
                .map(|pw| Bytes::from(pw.clone().into_bytes())),
        }
    }
}

impl fmt::Display for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)?;
        if let Some(path) = &self.path {
            write!(f, "{}", path)?;
        }
        Ok(())
    }
}

/// Engine tuning independent of any particular broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub reconnect: ReconnectPolicy,
    /// Default wait for PUBACK/PUBCOMP/SUBACK/UNSUBACK
    pub ack_timeout_ms: u64,
    /// Covers the socket connect plus the CONNACK wait
    pub connect_timeout_ms: u64,
    /// Resends on reconnect before an in-flight entry is abandoned
    pub max_redeliveries: u32,
    pub max_packet_size: usize,
    pub max_payload_size: usize,
    pub event_capacity: usize,
    /// Ping response deadline as a percentage of the keep-alive interval
    pub keep_alive_timeout_percent: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            ack_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            max_redeliveries: 5,
            max_packet_size: 256 * 1024,
            max_payload_size: 128 * 1024,
            event_capacity: 100,
            keep_alive_timeout_percent: 150,
        }
    }
}

impl ClientSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ConnectionOptions = toml::from_str(
            r#"
            host = "test.mosquitto.org"
            transport = "ws"
            path = "/mqtt"
            "#,
        )
        .unwrap();
        assert_eq!(options.port, 1883);
        assert_eq!(options.transport, TransportScheme::Ws);
        assert!(options.clean_session);
        assert_eq!(options.to_string(), "ws://test.mosquitto.org:1883/mqtt");
    }

    #[test]
    fn connect_packet_carries_will_and_credentials() {
        let options = ConnectionOptions::new("localhost", 1883)
            .with_client_id("explorer-1")
            .with_credentials("test", "test")
            .with_last_will(LastWill {
                topic: "explorer/status".into(),
                message: "gone".into(),
                qos: QoS::AtLeastOnce,
                retain: true,
            });
        let connect = options.to_connect();
        assert_eq!(connect.client_id, "explorer-1");
        assert_eq!(connect.username.as_deref(), Some("test"));
        assert_eq!(connect.password.as_deref(), Some(&b"test"[..]));
        let will = connect.will.unwrap();
        assert_eq!(&will.payload[..], b"gone");
        assert!(will.retain);
    }
}
