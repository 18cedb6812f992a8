//! HTTP surface mounted under the plugin route prefix.
//!
//! The connect flow:
//! 1. User clicks the connect link in chat
//! 2. GET /oauth2/connect → state issued, redirect to Azure AD
//! 3. User authorizes on Microsoft's site
//! 4. Azure AD redirects to GET /oauth2/complete
//! 5. State consumed, code exchanged, credential stored encrypted
//! 6. The user can now start meetings (POST /api/v1/meetings)

use crate::auth::{oauth_redirect_uri, AuthError, Authenticator};
use crate::channel::{ChannelApi, Post};
use crate::config::{self, PluginConfig, SharedConfig};
use crate::credentials::{UserInfo, UserStore};
use crate::kv::KvStore;
use crate::meetings;
use crate::oauth::{azure_provider, exchange_code_for_token, StateError, StateStore};
use crate::remote::RemoteClient;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Header carrying the host-authenticated caller identity.
pub const USER_ID_HEADER: &str = "Mattermost-User-ID";

const COMPLETE_HTML: &str = r#"<!DOCTYPE html>
<html>
	<head>
		<script>
			window.close();
		</script>
	</head>
	<body>
		<p>Completed connecting to Microsoft. Please close this window.</p>
	</body>
</html>
"#;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for the plugin endpoints
#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotConfigured,
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotConfigured => (
                StatusCode::NOT_IMPLEMENTED,
                "OAuth2 is not configured".to_string(),
            ),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Shared application state for the plugin router
#[derive(Clone)]
pub struct PluginState {
    pub kv: Arc<dyn KvStore>,
    pub channels: Arc<dyn ChannelApi>,
    pub remote: Arc<dyn RemoteClient>,
    pub config: SharedConfig,
}

impl PluginState {
    pub fn new(
        kv: Arc<dyn KvStore>,
        channels: Arc<dyn ChannelApi>,
        remote: Arc<dyn RemoteClient>,
        config: PluginConfig,
    ) -> Self {
        Self {
            kv,
            channels,
            remote,
            config: config::new_shared_config(config),
        }
    }

    pub fn user_store(&self) -> UserStore {
        UserStore::new(self.kv.clone())
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.kv.clone())
    }

    pub fn authenticator(&self) -> Authenticator {
        Authenticator::new(self.user_store(), self.remote.clone())
    }

    pub fn config_snapshot(&self) -> Arc<PluginConfig> {
        config::snapshot(&self.config)
    }

    /// Swaps in a new configuration snapshot. A real change to an
    /// already-populated configuration invalidates every stored token:
    /// the encryption key or OAuth2 app may no longer match, so all users
    /// must reconnect.
    pub fn on_configuration_change(&self, mut next: PluginConfig) {
        next.set_defaults();
        let prev = config::swap(&self.config, next.clone());

        if *prev != PluginConfig::default() && *prev != next {
            info!("OAuth2 configuration changed, resetting user tokens; all users will need to reconnect to Microsoft Teams");
            match self.user_store().reset_all_tokens() {
                Ok(summary) => {
                    info!(reset = summary.reset, failed = summary.failed, "token reset sweep finished")
                }
                Err(err) => warn!(error = %err, "token reset sweep failed"),
            }
        }
    }
}

/// Query parameters for GET /oauth2/connect
#[derive(Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "channelID")]
    channel_id: Option<String>,
    #[serde(rename = "justConnect")]
    just_connect: Option<String>,
}

/// Query parameters for GET /oauth2/complete
#[derive(Deserialize)]
pub struct CompleteParams {
    code: Option<String>,
    state: Option<String>,
}

/// Query parameters for POST /api/v1/meetings
#[derive(Deserialize)]
pub struct StartMeetingParams {
    force: Option<String>,
}

#[derive(Deserialize)]
pub struct StartMeetingRequest {
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    topic: String,
}

#[derive(Serialize)]
struct StartMeetingResponse {
    meeting_url: String,
}

/// Create the plugin API router
pub fn create_plugin_router(state: PluginState) -> Router {
    Router::new()
        .route("/oauth2/connect", get(connect_user))
        .route("/oauth2/complete", get(complete_oauth))
        .route("/api/v1/meetings", post(start_meeting))
        .with_state(Arc::new(state))
}

fn authed_user(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::Unauthorized("Not authorized, missing Mattermost user id".to_string())
        })
}

/// GET /oauth2/connect?channelID=<id>[&justConnect=true]
///
/// Issues the per-user CSRF state and redirects to the Azure AD
/// authorization endpoint. A second connect attempt before completion
/// overwrites the pending state, invalidating the earlier redirect.
async fn connect_user(
    State(state): State<Arc<PluginState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    let user_id = authed_user(&headers)?;

    let channel_id = params
        .channel_id
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("channelID missing".to_string()))?;
    let just_connect = params.just_connect.as_deref() == Some("true");

    let config = state.config_snapshot();
    config.is_valid().map_err(|_| AppError::NotConfigured)?;

    let csrf_state = state
        .state_store()
        .store_state(&user_id, &channel_id, just_connect)
        .map_err(|e| AppError::ServerError(e.to_string()))?;

    let redirect_uri =
        oauth_redirect_uri(&config).map_err(|e| AppError::ServerError(e.to_string()))?;
    let auth_url = azure_provider(&config).build_auth_url(&csrf_state, &redirect_uri);

    info!(user_id = %user_id, channel_id = %channel_id, "redirecting to OAuth provider");
    Ok(Redirect::temporary(&auth_url))
}

/// GET /oauth2/complete?code=<c>&state=<s>
///
/// The callback half of the flow: consume the state, exchange the code,
/// fetch the remote identity, persist the encrypted credential, then
/// confirm in the channel the connect started from.
async fn complete_oauth(
    State(state): State<Arc<PluginState>>,
    Query(params): Query<CompleteParams>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let authed_user_id = authed_user(&headers)?;

    let config = state.config_snapshot();
    config.is_valid().map_err(|_| AppError::NotConfigured)?;

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing authorization code".to_string()))?;
    let presented = params
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing state".to_string()))?;

    let state_data = state
        .state_store()
        .validate_and_consume(&presented, &authed_user_id)
        .map_err(|e| match e {
            StateError::Malformed | StateError::Invalid => {
                AppError::BadRequest("invalid state".to_string())
            }
            StateError::NotFound => AppError::BadRequest("missing stored state".to_string()),
            StateError::Unauthorized => {
                AppError::Unauthorized("Not authorized, incorrect user".to_string())
            }
            StateError::Kv(e) => AppError::ServerError(e.to_string()),
        })?;

    let provider = azure_provider(&config);
    let redirect_uri =
        oauth_redirect_uri(&config).map_err(|e| AppError::ServerError(e.to_string()))?;

    let token = exchange_code_for_token(
        &provider.token_url,
        &code,
        &redirect_uri,
        &provider.client_id,
        &provider.client_secret,
    )
    .await
    .map_err(|e| {
        debug!(error = %e, "error getting token");
        AppError::ServerError(e.to_string())
    })?;

    let remote_user = state.remote.who_am_i(&token).await.map_err(|e| {
        debug!(error = %e, "error getting user");
        AppError::ServerError(e.to_string())
    })?;

    let upn = remote_user.user_principal_name.clone().unwrap_or_default();
    let user_info = UserInfo {
        email: remote_user.mail.clone().unwrap_or_else(|| upn.clone()),
        oauth_token: Some(token),
        encrypted_oauth_token: String::new(),
        user_id: state_data.user_id.clone(),
        remote_id: remote_user.id.clone(),
        upn,
    };

    state
        .user_store()
        .store_user_info(&user_info, &config.encryption_key)
        .map_err(|e| {
            debug!(error = %e, "error storing the user info");
            AppError::ServerError("Unable to connect user to Microsoft".to_string())
        })?;

    info!(user_id = %state_data.user_id, remote_id = %remote_user.id, "connected Microsoft account");

    if state_data.just_connect {
        let post = Post::new(
            "",
            &state_data.channel_id,
            "Your Microsoft account is now connected.",
        );
        state
            .channels
            .send_ephemeral_post(&state_data.user_id, post)
            .map_err(|e| AppError::ServerError(e.to_string()))?;
    } else {
        meetings::post_meeting(
            state.channels.as_ref(),
            state.remote.as_ref(),
            &state.user_store(),
            &config,
            &state_data.user_id,
            &state_data.channel_id,
            "",
        )
        .await
        .map_err(|e| {
            debug!(error = %e, "error posting meeting");
            AppError::ServerError(e.to_string())
        })?;
    }

    Ok(Html(COMPLETE_HTML).into_response())
}

/// POST /api/v1/meetings[?force=true]
///
/// Starts a meeting in the request's channel. Without `force` the
/// duplicate guard may short-circuit into an ephemeral confirmation
/// prompt, returned with an empty `meeting_url`.
async fn start_meeting(
    State(state): State<Arc<PluginState>>,
    Query(params): Query<StartMeetingParams>,
    headers: HeaderMap,
    Json(req): Json<StartMeetingRequest>,
) -> Result<Json<StartMeetingResponse>, AppError> {
    let user_id = authed_user(&headers)?;

    let config = state.config_snapshot();
    config.is_valid().map_err(|_| AppError::NotConfigured)?;

    if req.channel_id.is_empty() {
        return Err(AppError::BadRequest("channel_id missing".to_string()));
    }

    let member = state
        .channels
        .is_channel_member(&req.channel_id, &user_id)
        .map_err(|e| AppError::ServerError(e.to_string()))?;
    if !member {
        return Err(AppError::Forbidden("Forbidden".to_string()));
    }

    if params.force.as_deref().unwrap_or_default().is_empty() {
        let recent = meetings::recent_meeting(state.channels.as_ref(), &req.channel_id)
            .map_err(|e| AppError::ServerError(e.to_string()))?;

        if let Some(recent) = recent {
            debug!(channel_id = %req.channel_id, "recent meeting found, suppressing creation");
            meetings::post_confirm(
                state.channels.as_ref(),
                &req.channel_id,
                &req.topic,
                &user_id,
                &recent,
            )
            .map_err(|e| AppError::ServerError(e.to_string()))?;
            return Ok(Json(StartMeetingResponse {
                meeting_url: String::new(),
            }));
        }
    }

    match state
        .authenticator()
        .authenticate_and_fetch_user(&config, &user_id, &req.channel_id)
        .await
    {
        Ok(_) => {}
        Err(AuthError::NotAuthenticated { message }) => {
            let post = Post::new("", &req.channel_id, &message);
            state
                .channels
                .send_ephemeral_post(&user_id, post)
                .map_err(|e| AppError::ServerError(e.to_string()))?;
            return Ok(Json(StartMeetingResponse {
                meeting_url: String::new(),
            }));
        }
        Err(AuthError::SiteUrl(e)) => return Err(AppError::ServerError(e.to_string())),
    }

    let meeting = meetings::post_meeting(
        state.channels.as_ref(),
        state.remote.as_ref(),
        &state.user_store(),
        &config,
        &user_id,
        &req.channel_id,
        &req.topic,
    )
    .await
    .map_err(|e| AppError::ServerError(e.to_string()))?;

    Ok(Json(StartMeetingResponse {
        meeting_url: meeting.join_url,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_connect_params_parse() {
        let params: ConnectParams =
            serde_urlencoded::from_str("channelID=chanX&justConnect=true").unwrap();
        assert_eq!(params.channel_id.as_deref(), Some("chanX"));
        assert_eq!(params.just_connect.as_deref(), Some("true"));

        let params: ConnectParams = serde_urlencoded::from_str("channelID=chanX").unwrap();
        assert!(params.just_connect.is_none());
    }

    #[test]
    fn test_authed_user_requires_header() {
        let mut headers = HeaderMap::new();
        assert!(authed_user(&headers).is_err());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static(""));
        assert!(authed_user(&headers).is_err());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("user42"));
        assert_eq!(authed_user(&headers).unwrap(), "user42");
    }
}
