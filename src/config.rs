//! Persistent client settings.
//!
//! Stored as TOML under the user's config directory. A default file is
//! written on first start so the broker address can be edited by hand.

use crate::command::{CommandError, Identity, IdentityProvider};
use crate::mqtt::MqttConfig;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "dndclient";
const CONFIG_FILE: &str = "config.toml";

pub const USER_ID_ENV: &str = "DNDCLIENT_USER_ID";
pub const PRIVATE_KEY_ENV: &str = "DNDCLIENT_PRIVATE_KEY";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,
}

/// Credentials issued by the account backend.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub user_id: String,
    /// Base64 Ed25519 secret key
    pub private_key: String,
    /// Register the dummy device once connected
    pub register_self: bool,
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("user_id", &self.user_id)
            .field("private_key", &"<redacted>")
            .field("register_self", &self.register_self)
            .finish()
    }
}

impl IdentityConfig {
    pub fn new(user_id: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            private_key: private_key.into(),
            register_self: false,
        }
    }
}

impl IdentityProvider for IdentityConfig {
    fn identity(&self) -> Result<Identity, CommandError> {
        Identity::from_base64_key(&self.user_id, &self.private_key)
    }
}

impl AppConfig {
    pub fn default_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| eyre!("No config directory found"))?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Writes a default config to `path` unless a file already exists there.
    pub async fn ensure_default(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            debug!("Config file present at {}", path.display());
            return Ok(());
        }

        info!("Creating default config at {}", path.display());
        AppConfig::default().save(path).await
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;

        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Identity from the environment, falling back to the file per field.
    pub fn resolved_identity(&self) -> Option<IdentityConfig> {
        self.identity_with_overrides(
            std::env::var(USER_ID_ENV).ok(),
            std::env::var(PRIVATE_KEY_ENV).ok(),
        )
    }

    fn identity_with_overrides(
        &self,
        user_id: Option<String>,
        private_key: Option<String>,
    ) -> Option<IdentityConfig> {
        let mut identity = self.identity.clone();

        if user_id.is_some() || private_key.is_some() {
            let entry = identity.get_or_insert_with(IdentityConfig::default);
            if let Some(user_id) = user_id {
                entry.user_id = user_id;
            }
            if let Some(private_key) = private_key {
                entry.private_key = private_key;
            }
        }

        match identity {
            Some(identity) if identity.user_id.trim().is_empty() => {
                warn!("Ignoring identity without user ID");
                None
            }
            other => other,
        }
    }
}
