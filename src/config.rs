use crate::mqtt::{ClientSettings, ConnectionOptions};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Application configuration loaded from TOML
///
/// ```toml
/// profiles_path = "/home/me/.config/mqtt-explorer/profiles.toml"
///
/// [connection]
/// host = "localhost"
/// port = 1883
/// keep_alive_secs = 30
///
/// [client]
/// ack_timeout_ms = 5000
///
/// [client.reconnect]
/// initial_delay_ms = 500
/// max_delay_ms = 10000
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Overrides the default profile file location
    pub profiles_path: Option<PathBuf>,
    /// Absent when the file has no `[connection]` table
    pub connection: Option<ConnectionOptions>,
    pub client: ClientSettings,
}

impl AppConfig {
    /// Loads the config file; a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::parse(&content)
            .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Options to start from when no profile is selected
    ///
    /// An explicit `[connection]` table wins over the remembered last connection.
    pub fn base_connection(&self, last: Option<ConnectionOptions>) -> ConnectionOptions {
        self.connection
            .clone()
            .or(last)
            .unwrap_or_default()
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::TransportScheme;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = AppConfig::parse(
            r#"
            [connection]
            host = "broker.hivemq.com"
            client_id = "explorer"
            clean_session = false

            [client]
            ack_timeout_ms = 2500

            [client.reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();

        let connection = config.connection.as_ref().unwrap();
        assert_eq!(connection.host, "broker.hivemq.com");
        assert_eq!(connection.port, 1883);
        assert_eq!(connection.transport, TransportScheme::Tcp);
        assert!(!connection.clean_session);
        assert_eq!(config.client.ack_timeout_ms, 2500);
        assert_eq!(config.client.reconnect.max_attempts, Some(3));
        assert!(config.client.reconnect.enabled);
        assert_eq!(config.client.event_capacity, 100);
        assert_eq!(config.profiles_path, None);
    }

    #[test]
    fn last_connection_fills_in_for_missing_table() {
        let last = ConnectionOptions::new("test.mosquitto.org", 1884).with_client_id("again");

        let bare = AppConfig::parse("[client]\nack_timeout_ms = 1000\n").unwrap();
        assert_eq!(bare.connection, None);
        assert_eq!(bare.base_connection(Some(last.clone())), last);
        assert_eq!(bare.base_connection(None), ConnectionOptions::default());

        let explicit = AppConfig::parse("[connection]\nhost = \"10.0.0.2\"\n").unwrap();
        assert_eq!(explicit.base_connection(Some(last)).host, "10.0.0.2");
    }

    #[test]
    fn rejects_unknown_qos() {
        let result = AppConfig::parse(
            r#"
            [connection.last_will]
            topic = "a"
            message = "b"
            qos = 3
            "#,
        );
        assert!(result.is_err());
    }
}
