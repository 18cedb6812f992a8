//! Authorization-code exchange against the token endpoint.

use crate::credentials::OAuthToken;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Token endpoint response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Exchange an authorization code for a token pair.
///
/// `redirect_uri` must be the exact URI used in the authorization request.
/// Failures come back as errors for the caller to surface; nothing is
/// retried here.
pub async fn exchange_code_for_token(
    token_url: &str,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<OAuthToken> {
    let client = reqwest::Client::new();

    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "authorization_code");
    form_data.insert("code", code);
    form_data.insert("redirect_uri", redirect_uri);
    form_data.insert("client_id", client_id);
    form_data.insert("client_secret", client_secret);

    tracing::debug!("exchanging authorization code for token at {}", token_url);

    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form_data)
        .send()
        .await
        .context("failed to send token exchange request")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(anyhow!("token exchange failed with status {status}: {body}"));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .context("failed to parse token response")?;

    tracing::debug!(
        has_refresh_token = token_response.refresh_token.is_some(),
        expires_in = ?token_response.expires_in,
        "token exchange successful"
    );

    let expires_at = token_response
        .expires_in
        .map(|seconds| Utc::now() + Duration::seconds(seconds));

    Ok(OAuthToken {
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        token_type: token_response.token_type.unwrap_or_default(),
        expires_at,
    })
}
