//! Azure AD OAuth endpoints.

use crate::config::PluginConfig;
use serde::{Deserialize, Serialize};

const AZURE_AD_BASE: &str = "https://login.microsoftonline.com";

/// Scopes requested for the meeting bridge. `offline_access` asks Azure for
/// a refresh token so stored credentials outlive the first access token.
const SCOPES: [&str; 2] = ["offline_access", "OnlineMeetings.ReadWrite"];

/// Resolved OAuth endpoints and client credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Required OAuth scopes
    pub scopes: Vec<String>,

    pub client_id: String,

    pub client_secret: String,
}

impl OAuthProviderConfig {
    /// Build the authorization URL carrying the CSRF state and redirect URI.
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }
}

/// Azure AD endpoints for the configured authority.
///
/// The authority is normally a tenant name ("common", "organizations", or a
/// tenant id). An authority that is itself an `http(s)://` URL is used as
/// the endpoint base directly, which is how tests point the flow at a local
/// stand-in server.
pub fn azure_provider(config: &PluginConfig) -> OAuthProviderConfig {
    let base = if config.oauth2_authority.starts_with("http://")
        || config.oauth2_authority.starts_with("https://")
    {
        config.oauth2_authority.trim_end_matches('/').to_string()
    } else {
        format!("{AZURE_AD_BASE}/{}", config.oauth2_authority)
    };

    OAuthProviderConfig {
        auth_url: format!("{base}/oauth2/v2.0/authorize"),
        token_url: format!("{base}/oauth2/v2.0/token"),
        scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
        client_id: config.oauth2_client_id.clone(),
        client_secret: config.oauth2_client_secret.clone(),
    }
}
