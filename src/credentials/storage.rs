//! Credential persistence over the host key-value store.

use super::{encryption, remote_id_key, token_key, OAuthToken, StoreError, UserInfo};
use crate::kv::KvStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page size used by the global token reset sweep.
pub const RESET_PAGE_SIZE: usize = 100;

/// Outcome of [`UserStore::reset_all_tokens`]: per-key failures are counted,
/// never fatal.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ResetSummary {
    pub reset: usize,
    pub failed: usize,
}

/// Durable map from chat user / remote user to an encrypted credential
/// record.
///
/// Every record is written under both the primary (`token_<user_id>`) and
/// secondary (`tbyrid_<remote_id>`) key. The two writes are not
/// transactional: if the second fails the first is left in place and the
/// error is returned, a documented best-effort trade-off.
#[derive(Clone)]
pub struct UserStore {
    kv: Arc<dyn KvStore>,
}

impl UserStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Persists `info` under both keys, encrypting the token branch when a
    /// non-empty site encryption key is configured.
    ///
    /// With an empty key the token is stored in clear — the explicit weak
    /// mode for sites that never configured encryption.
    pub fn store_user_info(&self, info: &UserInfo, encryption_key: &str) -> Result<(), StoreError> {
        let mut record = info.clone();

        if !encryption_key.is_empty() {
            if let Some(token) = record.oauth_token.take() {
                let blob = serde_json::to_string(&token).map_err(StoreError::Serialize)?;
                record.encrypted_oauth_token =
                    encryption::encrypt(encryption_key.as_bytes(), &blob)
                        .map_err(StoreError::Encrypt)?;
                debug!(user_id = %record.user_id, "encrypted user token");
            }
        }

        let bytes = serde_json::to_vec(&record).map_err(StoreError::Serialize)?;

        self.kv.set(&token_key(&record.user_id), &bytes)?;
        self.kv.set(&remote_id_key(&record.remote_id), &bytes)?;

        Ok(())
    }

    /// Reads and decrypts the record for `user_id`.
    ///
    /// Absence is `NotConnected`; a record whose encrypted branch cannot be
    /// decrypted under the current key is `DecryptionFailed` — a distinct,
    /// reconnect-only failure usually caused by a rotated encryption key.
    pub fn get_user_info(&self, user_id: &str, encryption_key: &str) -> Result<UserInfo, StoreError> {
        let bytes = self
            .kv
            .get(&token_key(user_id))?
            .ok_or(StoreError::NotConnected)?;

        let mut record: UserInfo =
            serde_json::from_slice(&bytes).map_err(StoreError::Corrupt)?;

        if !record.encrypted_oauth_token.is_empty() {
            if encryption_key.is_empty() {
                // Encrypted record but no key configured anymore: the token
                // is unrecoverable, same remedy as a rotated key.
                warn!(user_id, "stored token is encrypted but no encryption key is configured");
                return Err(StoreError::DecryptionFailed(
                    encryption::CryptoError::BadKeyLength(0),
                ));
            }

            let blob = encryption::decrypt(
                encryption_key.as_bytes(),
                &record.encrypted_oauth_token,
            )
            .map_err(|err| {
                warn!(user_id, error = %err, "failed to decrypt stored access token");
                StoreError::DecryptionFailed(err)
            })?;

            let token: OAuthToken =
                serde_json::from_str(&blob).map_err(StoreError::Corrupt)?;
            record.oauth_token = Some(token);
            record.encrypted_oauth_token = String::new();
        }

        Ok(record)
    }

    /// Deletes the record under both keys.
    ///
    /// The record is fetched first to learn the secondary key, so removing
    /// an absent user fails with `NotConnected`. Both deletes are attempted;
    /// the first error encountered wins even when the other delete
    /// succeeded.
    pub fn remove_user(&self, user_id: &str, encryption_key: &str) -> Result<(), StoreError> {
        let info = self.get_user_info(user_id, encryption_key)?;

        let primary = self.kv.delete(&token_key(user_id));
        let secondary = self.kv.delete(&remote_id_key(&info.remote_id));

        primary?;
        secondary?;
        Ok(())
    }

    /// Strips the token branch from every credential record in the
    /// namespace.
    ///
    /// Pages through the whole key-value namespace; values that do not
    /// decode as a credential record are unrelated data and silently
    /// skipped. Individual failures are counted and logged but never abort
    /// the sweep — this is best-effort mass invalidation, not a
    /// point-in-time snapshot.
    pub fn reset_all_tokens(&self) -> Result<ResetSummary, StoreError> {
        let mut summary = ResetSummary::default();
        let mut page = 0;

        loop {
            let keys = self.kv.list_keys(page, RESET_PAGE_SIZE)?;
            if keys.is_empty() {
                break;
            }

            for key in &keys {
                match self.reset_key(key) {
                    Ok(true) => summary.reset += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(key = %key, error = %err, "failed to reset stored token");
                        summary.failed += 1;
                    }
                }
            }

            if keys.len() < RESET_PAGE_SIZE {
                break;
            }
            page += 1;
        }

        info!(
            reset = summary.reset,
            failed = summary.failed,
            "finished resetting stored OAuth tokens"
        );
        Ok(summary)
    }

    /// Clears the token branch of a single key. `Ok(false)` means the key
    /// held no credential record (or an already token-less one).
    fn reset_key(&self, key: &str) -> Result<bool, StoreError> {
        let Some(bytes) = self.kv.get(key)? else {
            return Ok(false);
        };

        let Ok(mut record) = serde_json::from_slice::<UserInfo>(&bytes) else {
            return Ok(false);
        };
        if !record.has_token() {
            return Ok(false);
        }

        record.oauth_token = None;
        record.encrypted_oauth_token = String::new();

        let cleared = serde_json::to_vec(&record).map_err(StoreError::Serialize)?;
        self.kv.set(key, &cleared)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvError, MemoryKvStore};
    use serde_json::Value;

    const KEY: &str = "0123456789abcdef";

    fn store() -> (Arc<MemoryKvStore>, UserStore) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = UserStore::new(kv.clone() as Arc<dyn KvStore>);
        (kv, store)
    }

    fn sample_info() -> UserInfo {
        UserInfo {
            email: "alice@example.com".to_string(),
            oauth_token: Some(OAuthToken {
                access_token: "access-12345".to_string(),
                refresh_token: Some("refresh-67890".to_string()),
                token_type: "Bearer".to_string(),
                expires_at: None,
            }),
            encrypted_oauth_token: String::new(),
            user_id: "user42".to_string(),
            remote_id: "remote-99".to_string(),
            upn: "alice@contoso.com".to_string(),
        }
    }

    #[test]
    fn test_store_and_fetch_encrypted() {
        let (kv, store) = store();
        let info = sample_info();

        store.store_user_info(&info, KEY).unwrap();

        // Fetched record equals the input (wire representation differs)
        let fetched = store.get_user_info("user42", KEY).unwrap();
        assert_eq!(fetched, info);

        // On the wire only the encrypted branch is populated
        let raw = kv.get("token_user42").unwrap().unwrap();
        let json: Value = serde_json::from_slice(&raw).unwrap();
        assert!(json.get("oauthToken").is_none());
        assert!(!json["encryptedOAuthToken"].as_str().unwrap().is_empty());
        assert!(!String::from_utf8_lossy(&raw).contains("access-12345"));

        // Secondary key carries the same record
        let by_remote = kv.get("tbyrid_remote-99").unwrap().unwrap();
        assert_eq!(by_remote, raw);
    }

    #[test]
    fn test_store_and_fetch_clear_mode() {
        let (kv, store) = store();
        let info = sample_info();

        // Empty key: explicit weak mode, token stored in clear
        store.store_user_info(&info, "").unwrap();
        let fetched = store.get_user_info("user42", "").unwrap();
        assert_eq!(fetched, info);

        let raw = kv.get("token_user42").unwrap().unwrap();
        let json: Value = serde_json::from_slice(&raw).unwrap();
        assert!(json.get("encryptedOAuthToken").is_none());
        assert_eq!(json["oauthToken"]["access_token"], "access-12345");
    }

    #[test]
    fn test_fetch_not_connected() {
        let (_kv, store) = store();
        assert!(matches!(
            store.get_user_info("nobody", KEY),
            Err(StoreError::NotConnected)
        ));
    }

    #[test]
    fn test_rotated_key_is_decryption_failed() {
        let (_kv, store) = store();
        store.store_user_info(&sample_info(), KEY).unwrap();

        // Rotated key: distinct from NotConnected, reconnect-only. The
        // garbage plaintext occasionally survives the unpad check, in which
        // case the JSON parse catches it instead.
        let err = store.get_user_info("user42", "fedcba9876543210").unwrap_err();
        assert!(matches!(
            err,
            StoreError::DecryptionFailed(_) | StoreError::Corrupt(_)
        ));

        // No key at all is the same failure class
        assert!(matches!(
            store.get_user_info("user42", ""),
            Err(StoreError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_remove_deletes_both_keys() {
        let (kv, store) = store();
        store.store_user_info(&sample_info(), KEY).unwrap();

        store.remove_user("user42", KEY).unwrap();

        assert!(matches!(
            store.get_user_info("user42", KEY),
            Err(StoreError::NotConnected)
        ));
        assert_eq!(kv.get("tbyrid_remote-99").unwrap(), None);
    }

    #[test]
    fn test_remove_absent_user() {
        let (_kv, store) = store();
        assert!(matches!(
            store.remove_user("nobody", KEY),
            Err(StoreError::NotConnected)
        ));
    }

    #[test]
    fn test_replacement_not_merge() {
        let (_kv, store) = store();
        store.store_user_info(&sample_info(), KEY).unwrap();

        let mut replacement = sample_info();
        replacement.email = "alice+new@example.com".to_string();
        replacement.oauth_token.as_mut().unwrap().access_token = "access-v2".to_string();
        store.store_user_info(&replacement, KEY).unwrap();

        let fetched = store.get_user_info("user42", KEY).unwrap();
        assert_eq!(fetched, replacement);
    }

    #[test]
    fn test_reset_all_tokens_sweep() {
        let (kv, store) = store();

        // Two connected users, one in clear mode
        store.store_user_info(&sample_info(), KEY).unwrap();
        let mut other = sample_info();
        other.user_id = "user43".to_string();
        other.remote_id = "remote-100".to_string();
        store.store_user_info(&other, "").unwrap();

        // Unrelated keys the sweep must skip silently
        kv.set("msteamsmeetinguserstate_user42", b"msteamsmeetinguserstate_user42_chan_true")
            .unwrap();
        kv.set("unrelated_json", br#"{"some":"value"}"#).unwrap();

        let summary = store.reset_all_tokens().unwrap();
        // Each record lives under two keys, so four rewrites
        assert_eq!(summary, ResetSummary { reset: 4, failed: 0 });

        // Records survive token-less; unrelated keys untouched
        let raw = kv.get("token_user42").unwrap().unwrap();
        let json: Value = serde_json::from_slice(&raw).unwrap();
        assert!(json.get("oauthToken").is_none());
        assert!(json.get("encryptedOAuthToken").is_none());
        assert_eq!(json["userID"], "user42");
        assert_eq!(
            kv.get("unrelated_json").unwrap().unwrap(),
            br#"{"some":"value"}"#.to_vec()
        );

        // A second sweep finds nothing left to reset
        let summary = store.reset_all_tokens().unwrap();
        assert_eq!(summary, ResetSummary { reset: 0, failed: 0 });
    }

    #[test]
    fn test_reset_sweeps_past_one_page() {
        let (kv, store) = store();

        for i in 0..(RESET_PAGE_SIZE + 20) {
            let mut info = sample_info();
            info.user_id = format!("user{i:03}");
            info.remote_id = format!("remote{i:03}");
            store.store_user_info(&info, "").unwrap();
        }
        let total_keys = kv.len();

        let summary = store.reset_all_tokens().unwrap();
        assert_eq!(summary.reset, total_keys);
        assert_eq!(summary.failed, 0);
    }

    /// KV double whose secondary-index writes fail, to pin down the
    /// accepted partial-write behavior.
    struct FailSecondaryKv {
        inner: MemoryKvStore,
    }

    impl KvStore for FailSecondaryKv {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
            if key.starts_with("tbyrid_") {
                return Err(KvError::new("set", "disk full"));
            }
            self.inner.set(key, value)
        }
        fn delete(&self, key: &str) -> Result<(), KvError> {
            self.inner.delete(key)
        }
        fn list_keys(&self, page: usize, per_page: usize) -> Result<Vec<String>, KvError> {
            self.inner.list_keys(page, per_page)
        }
    }

    #[test]
    fn test_partial_write_is_returned_not_rolled_back() {
        let kv = Arc::new(FailSecondaryKv {
            inner: MemoryKvStore::new(),
        });
        let store = UserStore::new(kv.clone() as Arc<dyn KvStore>);

        let err = store.store_user_info(&sample_info(), KEY).unwrap_err();
        assert!(matches!(err, StoreError::Kv(_)));

        // The primary write stays in place; the inconsistency is accepted
        assert!(store.get_user_info("user42", KEY).is_ok());
    }
}
