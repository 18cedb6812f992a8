//! Microsoft Graph client capability.
//!
//! The rest of the crate only sees the [`RemoteClient`] trait: identity
//! lookup and meeting creation. There are exactly two implementations — the
//! production [`GraphClient`] here and a recording double in the tests —
//! selected by injection at construction, never by runtime inspection.

use crate::credentials::{OAuthToken, UserInfo};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Default span of a created meeting.
const MEETING_DURATION_HOURS: i64 = 1;

/// Remote API failures. Surfaced to the user as "try again"; nothing in
/// this core retries them internally.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote call failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("remote returned an empty user")]
    EmptyUser,
}

/// The remote identity, as Graph reports it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteUser {
    pub id: String,

    #[serde(default)]
    pub mail: Option<String>,

    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,

    #[serde(rename = "userPrincipalName", default)]
    pub user_principal_name: Option<String>,
}

/// A created online meeting.
#[derive(Clone, Debug, Deserialize)]
pub struct Meeting {
    #[serde(rename = "joinWebUrl")]
    pub join_url: String,

    #[serde(default)]
    pub subject: Option<String>,
}

/// Identity lookup and meeting creation against the meeting provider.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// "Who am I" with the given token; validates that the stored
    /// credential is still usable.
    async fn who_am_i(&self, token: &OAuthToken) -> Result<RemoteUser, RemoteError>;

    /// Creates an online meeting organized by `organizer`, inviting
    /// `attendees`.
    async fn create_meeting(
        &self,
        token: &OAuthToken,
        organizer: &UserInfo,
        attendees: &[UserInfo],
        subject: &str,
    ) -> Result<Meeting, RemoteError>;
}

/// Production client against the Microsoft Graph REST API.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for GraphClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphClient {
    pub fn new() -> Self {
        Self::with_base_url(GRAPH_BASE_URL)
    }

    /// Client against a non-default Graph base URL (local stand-ins in
    /// tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn participant(info: &UserInfo) -> serde_json::Value {
        json!({
            "identity": { "user": { "id": info.remote_id } },
            "upn": info.upn,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "graph API call failed");
            return Err(RemoteError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteClient for GraphClient {
    async fn who_am_i(&self, token: &OAuthToken) -> Result<RemoteUser, RemoteError> {
        let response = self
            .http
            .get(format!("{}/me", self.base_url))
            .bearer_auth(&token.access_token)
            .send()
            .await?;

        let user: RemoteUser = Self::check(response).await?.json().await?;
        if user.id.is_empty() {
            return Err(RemoteError::EmptyUser);
        }
        Ok(user)
    }

    async fn create_meeting(
        &self,
        token: &OAuthToken,
        organizer: &UserInfo,
        attendees: &[UserInfo],
        subject: &str,
    ) -> Result<Meeting, RemoteError> {
        let start = Utc::now();
        let end = start + Duration::hours(MEETING_DURATION_HOURS);

        let body = json!({
            "startDateTime": start.to_rfc3339(),
            "endDateTime": end.to_rfc3339(),
            "subject": subject,
            "participants": {
                "organizer": Self::participant(organizer),
                "attendees": attendees.iter().map(Self::participant).collect::<Vec<_>>(),
            },
        });

        let response = self
            .http
            .post(format!(
                "{}/users/{}/onlineMeetings",
                self.base_url, organizer.remote_id
            ))
            .bearer_auth(&token.access_token)
            .json(&body)
            .send()
            .await?;

        let meeting: Meeting = Self::check(response).await?.json().await?;
        Ok(meeting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> OAuthToken {
        OAuthToken {
            access_token: "access-token".to_string(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
        }
    }

    fn organizer() -> UserInfo {
        UserInfo {
            user_id: "user42".to_string(),
            remote_id: "remote-99".to_string(),
            upn: "alice@contoso.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_who_am_i() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me")
            .match_header("authorization", "Bearer access-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "remote-99",
                    "mail": "alice@example.com",
                    "displayName": "Alice",
                    "userPrincipalName": "alice@contoso.com"
                }"#,
            )
            .create_async()
            .await;

        let client = GraphClient::with_base_url(server.url());
        let user = client.who_am_i(&token()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(user.id, "remote-99");
        assert_eq!(user.mail.as_deref(), Some("alice@example.com"));
        assert_eq!(user.user_principal_name.as_deref(), Some("alice@contoso.com"));
    }

    #[tokio::test]
    async fn test_who_am_i_expired_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/me")
            .with_status(401)
            .with_body(r#"{"error":{"code":"InvalidAuthenticationToken"}}"#)
            .create_async()
            .await;

        let client = GraphClient::with_base_url(server.url());
        let err = client.who_am_i(&token()).await.unwrap_err();

        assert!(matches!(err, RemoteError::Api { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_create_meeting() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/users/remote-99/onlineMeetings")
            .match_header("authorization", "Bearer access-token")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "joinWebUrl": "https://teams.microsoft.com/l/meetup-join/abc",
                    "subject": "Standup"
                }"#,
            )
            .create_async()
            .await;

        let client = GraphClient::with_base_url(server.url());
        let meeting = client
            .create_meeting(&token(), &organizer(), &[], "Standup")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            meeting.join_url,
            "https://teams.microsoft.com/l/meetup-join/abc"
        );
        assert_eq!(meeting.subject.as_deref(), Some("Standup"));
    }
}
