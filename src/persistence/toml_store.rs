use super::{ConnectionProfile, ProfileDocument, ProfileStore};
use crate::mqtt::ConnectionOptions;
use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/mqtt-explorer";
const PROFILES_FILE: &str = "profiles.toml";

/// Profile store backed by a single TOML file
///
/// Every mutation rewrites the whole file. The mutex serializes read-modify-write cycles
/// within one process.
pub struct TomlProfileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TomlProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at `~/.config/mqtt-explorer/profiles.toml`
    pub fn default_location() -> Self {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(PROFILES_FILE);
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<ProfileDocument> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check profile file {}: {}", self.path.display(), e))?
        {
            debug!("No profile file at {}, starting empty", self.path.display());
            return Ok(ProfileDocument::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read profile file {}: {}", self.path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse profile file {}: {}", self.path.display(), e))
    }

    async fn store(&self, document: &ProfileDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create profile directory: {}", e))?;
        }

        let content = toml::to_string_pretty(document)
            .map_err(|e| eyre!("Failed to serialize profiles: {}", e))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write profile file {}: {}", self.path.display(), e))?;
        debug!("Wrote {} profiles to {}", document.profiles.len(), self.path.display());
        Ok(())
    }

    async fn modify<F, T>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut ProfileDocument) -> T + Send,
        T: Send,
    {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let result = change(&mut document);
        self.store(&document).await?;
        Ok(result)
    }
}

#[async_trait]
impl ProfileStore for TomlProfileStore {
    async fn profile(&self, id: &str) -> Result<Option<ConnectionProfile>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.profiles.remove(id))
    }

    async fn save_profile(&self, profile: ConnectionProfile) -> Result<()> {
        info!("Saving profile '{}'", profile.id);
        self.modify(move |document| {
            document.profiles.insert(profile.id.clone(), profile);
        })
        .await
    }

    async fn delete_profile(&self, id: &str) -> Result<bool> {
        let removed = self
            .modify(|document| document.profiles.remove(id).is_some())
            .await?;
        if !removed {
            warn!("Profile '{}' does not exist", id);
        }
        Ok(removed)
    }

    async fn profiles(&self) -> Result<Vec<ConnectionProfile>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.profiles.into_values().collect())
    }

    async fn save_last_connection(&self, options: ConnectionOptions) -> Result<()> {
        self.modify(move |document| document.last_connection = Some(options))
            .await
    }

    async fn last_connection(&self) -> Result<Option<ConnectionOptions>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.last_connection)
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
