//! Plugin configuration.
//!
//! Configuration is read once (TOML file or env vars), validated, and then
//! shared as an immutable snapshot: readers clone an `Arc<PluginConfig>` and
//! never observe a half-updated struct; changes swap in a whole new snapshot.

use crate::credentials::encryption;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Validation and lookup failures for the plugin configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("OAuth2ClientSecret is not configured")]
    MissingClientSecret,
    #[error("OAuth2ClientID is not configured")]
    MissingClientId,
    #[error("OAuth2Authority is not configured")]
    MissingAuthority,
    #[error("error fetching siteUrl")]
    MissingSiteUrl,
}

/// External configuration of the plugin, as exposed by the host.
///
/// `encryption_key` is the AES key for token encryption at rest. An empty
/// key is an explicit weak mode: tokens are persisted in clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Azure AD tenant ("common", "organizations", or a tenant id). A full
    /// `http(s)://` base URL is also accepted, which points the OAuth
    /// endpoints at a local stand-in during tests.
    #[serde(default)]
    pub oauth2_authority: String,

    #[serde(default)]
    pub oauth2_client_id: String,

    #[serde(default)]
    pub oauth2_client_secret: String,

    /// Key for token encryption at rest. Auto-generated once, before the
    /// client id is first configured; never regenerated afterwards, since
    /// that would invalidate every stored credential.
    #[serde(default)]
    pub encryption_key: String,

    /// Externally reachable base URL of the host server. All redirect and
    /// callback URLs derive from it.
    #[serde(default)]
    pub site_url: String,
}

impl PluginConfig {
    /// Checks that all fields required to serve OAuth flows are set.
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        if self.oauth2_client_secret.is_empty() {
            return Err(ConfigError::MissingClientSecret);
        }
        if self.oauth2_client_id.is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.oauth2_authority.is_empty() {
            return Err(ConfigError::MissingAuthority);
        }
        Ok(())
    }

    /// Fills in an encryption key on first use.
    ///
    /// Once the client id has been set we never touch the key: silently
    /// regenerating it would orphan every connected user. Returns whether
    /// the configuration changed.
    pub fn set_defaults(&mut self) -> bool {
        if !self.oauth2_client_id.is_empty() {
            return false;
        }

        if self.encryption_key.is_empty() {
            self.encryption_key = encryption::generate_secret();
            return true;
        }

        false
    }

    /// The host's externally reachable base URL, or an error when it was
    /// never configured. Connect links must fail closed rather than render
    /// with an empty base.
    pub fn site_url(&self) -> Result<&str, ConfigError> {
        if self.site_url.is_empty() {
            return Err(ConfigError::MissingSiteUrl);
        }
        Ok(&self.site_url)
    }

    /// Build from env vars, falling back to empty fields.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("MSTMEET_OAUTH2_AUTHORITY") {
            cfg.oauth2_authority = v;
        }
        if let Ok(v) = std::env::var("MSTMEET_OAUTH2_CLIENT_ID") {
            cfg.oauth2_client_id = v;
        }
        if let Ok(v) = std::env::var("MSTMEET_OAUTH2_CLIENT_SECRET") {
            cfg.oauth2_client_secret = v;
        }
        if let Ok(v) = std::env::var("MSTMEET_ENCRYPTION_KEY") {
            cfg.encryption_key = v;
        }
        if let Ok(v) = std::env::var("MSTMEET_SITE_URL") {
            cfg.site_url = v;
        }

        cfg
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<PluginConfig, anyhow::Error> {
    let contents = std::fs::read_to_string(path)?;
    let config: PluginConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Shared configuration handle: readers snapshot, writers swap.
pub type SharedConfig = Arc<RwLock<Arc<PluginConfig>>>;

pub fn new_shared_config(config: PluginConfig) -> SharedConfig {
    Arc::new(RwLock::new(Arc::new(config)))
}

/// Current immutable snapshot. Cheap (one `Arc` clone); the snapshot stays
/// coherent even if a swap happens mid-request.
pub fn snapshot(shared: &SharedConfig) -> Arc<PluginConfig> {
    shared.read().unwrap().clone()
}

/// Atomically replace the configuration. Returns the previous snapshot so
/// the caller can detect a real change and invalidate stored tokens.
pub fn swap(shared: &SharedConfig, next: PluginConfig) -> Arc<PluginConfig> {
    let mut guard = shared.write().unwrap();
    std::mem::replace(&mut *guard, Arc::new(next))
}
