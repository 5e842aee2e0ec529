//! # Persistence Module
//!
//! Stores named connection profiles and the last used connection for the application
//! layer. The MQTT engine never depends on it; the CLI reads a profile, turns it into
//! [`ConnectionOptions`] and hands those to the client.
//!
//! ## Error Handling Strategy
//! Uses `color_eyre` for rich error context in file operations. A missing profile file is
//! treated as an empty store so a fresh installation works without setup.

pub mod toml_store;

use std::collections::BTreeMap;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::mqtt::ConnectionOptions;

pub use toml_store::TomlProfileStore;

/// A named, saved set of connection options
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// Stable key used for get/set/delete
    pub id: String,
    /// Display name
    pub name: String,
    /// Filters to subscribe after connecting
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl ConnectionProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, options: ConnectionOptions) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            subscriptions: Vec::new(),
            options,
        }
    }
}

/// Key-value storage for profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile(&self, id: &str) -> Result<Option<ConnectionProfile>>;

    /// Inserts or replaces the profile with the same id
    async fn save_profile(&self, profile: ConnectionProfile) -> Result<()>;

    /// Returns whether a profile was removed
    async fn delete_profile(&self, id: &str) -> Result<bool>;

    async fn profiles(&self) -> Result<Vec<ConnectionProfile>>;

    async fn save_last_connection(&self, options: ConnectionOptions) -> Result<()>;

    async fn last_connection(&self) -> Result<Option<ConnectionOptions>>;
}

/// Everything a store persists, in one serializable document
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileDocument {
    #[serde(default)]
    pub last_connection: Option<ConnectionOptions>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ConnectionProfile>,
}

/// Store kept in memory only, used in tests and when no profile file is wanted
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    document: RwLock<ProfileDocument>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn profile(&self, id: &str) -> Result<Option<ConnectionProfile>> {
        Ok(self.document.read().await.profiles.get(id).cloned())
    }

    async fn save_profile(&self, profile: ConnectionProfile) -> Result<()> {
        self.document
            .write()
            .await
            .profiles
            .insert(profile.id.clone(), profile);
        Ok(())
    }

    async fn delete_profile(&self, id: &str) -> Result<bool> {
        Ok(self.document.write().await.profiles.remove(id).is_some())
    }

    async fn profiles(&self) -> Result<Vec<ConnectionProfile>> {
        Ok(self.document.read().await.profiles.values().cloned().collect())
    }

    async fn save_last_connection(&self, options: ConnectionOptions) -> Result<()> {
        self.document.write().await.last_connection = Some(options);
        Ok(())
    }

    async fn last_connection(&self) -> Result<Option<ConnectionOptions>> {
        Ok(self.document.read().await.last_connection.clone())
    }
}
