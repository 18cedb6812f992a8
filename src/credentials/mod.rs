//! Encrypted credential records for connected Microsoft accounts.
//!
//! A connected user is a [`UserInfo`] record persisted in the host key-value
//! store under two keys: `token_<user_id>` (primary) and `tbyrid_<remote_id>`
//! (secondary lookup). The OAuth token branch is encrypted at rest with the
//! site encryption key; with no key configured the token is stored in clear,
//! an explicit weak mode.
//!
//! # Security
//! - Token blobs encrypted with AES-CFB, fresh IV per write
//! - Wrong-key decrypts fail typed (`DecryptionFailed`), never silently
//! - Dual-key writes are not transactional; a partial write is a known,
//!   documented inconsistency of the design

use crate::kv::KvError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod encryption;
mod storage;

pub use encryption::CryptoError;
pub use storage::{ResetSummary, UserStore, RESET_PAGE_SIZE};

/// Primary key prefix: chat user id -> record
pub const TOKEN_KEY_PREFIX: &str = "token_";

/// Secondary key prefix: remote user id -> the same record
pub const TOKEN_KEY_BY_REMOTE_ID_PREFIX: &str = "tbyrid_";

pub fn token_key(user_id: &str) -> String {
    format!("{TOKEN_KEY_PREFIX}{user_id}")
}

pub fn remote_id_key(remote_id: &str) -> String {
    format!("{TOKEN_KEY_BY_REMOTE_ID_PREFIX}{remote_id}")
}

/// OAuth access/refresh token pair with type and expiry. Sensitive; only
/// ever persisted through the encrypted branch of [`UserInfo`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub token_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// One linked remote account for one chat user.
///
/// In any persisted form exactly one of `oauth_token` and
/// `encrypted_oauth_token` is non-empty: the clear branch when no site
/// encryption key is configured, the encrypted branch otherwise.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub email: String,

    #[serde(rename = "oauthToken", default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<OAuthToken>,

    #[serde(
        rename = "encryptedOAuthToken",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub encrypted_oauth_token: String,

    /// Chat-platform user id (owner, primary key)
    #[serde(rename = "userID")]
    pub user_id: String,

    /// Remote-system user id (secondary lookup key)
    #[serde(rename = "remoteID")]
    pub remote_id: String,

    /// Remote login name, required for meeting participant resolution
    #[serde(rename = "userPrincipalName", default)]
    pub upn: String,
}

impl UserInfo {
    /// Whether the record still carries a token, in either representation.
    pub fn has_token(&self) -> bool {
        self.oauth_token.is_some() || !self.encrypted_oauth_token.is_empty()
    }
}

/// Credential store failures.
///
/// `NotConnected` is recoverable (triggers the connect flow);
/// `DecryptionFailed` is recoverable only by reconnecting — typically the
/// site encryption key was rotated under the stored records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user account is not connected to Microsoft")]
    NotConnected,

    #[error("failed to decrypt previously stored user access token")]
    DecryptionFailed(#[source] CryptoError),

    #[error("unable to parse the stored credential record")]
    Corrupt(#[source] serde_json::Error),

    #[error("error occurred while encrypting the access token")]
    Encrypt(#[source] CryptoError),

    #[error("unable to serialize the credential record")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Kv(#[from] KvError),
}
