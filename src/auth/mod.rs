//! Authentication orchestrator.
//!
//! Decides, for a chat user and channel, whether a usable remote session
//! exists. When it does not, the failure carries a rendered "click here to
//! connect" prompt pointing at the connect endpoint; rendering the prompt
//! itself fails closed when the site base URL is unknown.

use crate::config::{ConfigError, PluginConfig};
use crate::credentials::{StoreError, UserStore};
use crate::remote::{RemoteClient, RemoteUser};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Plugin id, part of every host-routed plugin URL.
pub const PLUGIN_ID: &str = "com.mattermost.msteamsmeetings";

/// Authentication failures.
///
/// `NotAuthenticated` is the recoverable case: the carried message is the
/// connect prompt to show the user. `SiteUrl` means the prompt could not be
/// built at all — surfaced as an error rather than a broken link.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cannot build the connect link: {0}")]
    SiteUrl(#[from] ConfigError),

    #[error("{message}")]
    NotAuthenticated { message: String },
}

/// Base URL of this plugin's OAuth routes on the host.
pub fn plugin_oauth_url(config: &PluginConfig) -> Result<String, ConfigError> {
    let site_url = config.site_url()?;
    Ok(format!(
        "{}/plugins/{PLUGIN_ID}/oauth2",
        site_url.trim_end_matches('/')
    ))
}

/// The Markdown connect prompt for `channel_id`.
pub fn connect_message(config: &PluginConfig, channel_id: &str) -> Result<String, ConfigError> {
    let oauth_url = plugin_oauth_url(config)?;
    Ok(format!(
        "[Click here to link your Microsoft account.]({oauth_url}/connect?channelID={})",
        urlencoding::encode(channel_id)
    ))
}

/// Redirect URI registered with the OAuth provider.
pub fn oauth_redirect_uri(config: &PluginConfig) -> Result<String, ConfigError> {
    Ok(format!("{}/complete", plugin_oauth_url(config)?))
}

/// Resolves stored credentials into a validated remote identity.
#[derive(Clone)]
pub struct Authenticator {
    store: UserStore,
    remote: Arc<dyn RemoteClient>,
}

impl Authenticator {
    pub fn new(store: UserStore, remote: Arc<dyn RemoteClient>) -> Self {
        Self { store, remote }
    }

    /// Fetches the stored credential for `user_id` and validates it with a
    /// remote "who am I" call.
    ///
    /// Reads only; never mutates stored state, so it is safe to race with a
    /// disconnect — the loser sees an absent or stale credential and gets
    /// the connect prompt.
    pub async fn authenticate_and_fetch_user(
        &self,
        config: &PluginConfig,
        user_id: &str,
        channel_id: &str,
    ) -> Result<RemoteUser, AuthError> {
        // Built up front: if the site URL is unresolvable we fail before
        // touching the store rather than answering with a broken link.
        let message = connect_message(config, channel_id)?;

        let info = match self.store.get_user_info(user_id, &config.encryption_key) {
            Ok(info) => info,
            Err(StoreError::NotConnected) => {
                debug!(user_id, "user has no stored credential");
                return Err(AuthError::NotAuthenticated { message });
            }
            Err(err) => {
                warn!(user_id, error = %err, "stored credential is unusable");
                return Err(AuthError::NotAuthenticated { message });
            }
        };

        let Some(token) = info.oauth_token else {
            debug!(user_id, "stored record carries no token");
            return Err(AuthError::NotAuthenticated { message });
        };

        match self.remote.who_am_i(&token).await {
            Ok(user) => Ok(user),
            Err(err) => {
                warn!(user_id, error = %err, "remote validation of stored token failed");
                Err(AuthError::NotAuthenticated { message })
            }
        }
    }

    /// Unlinks the user's Microsoft account.
    pub fn disconnect(&self, config: &PluginConfig, user_id: &str) -> Result<(), StoreError> {
        self.store.remove_user(user_id, &config.encryption_key)
    }
}
