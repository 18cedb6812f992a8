//! CSRF state tokens for the OAuth redirect flow.
//!
//! A state token binds a (user, channel, intent) tuple to one in-flight
//! authorization redirect. The storage key is deterministic per user, so at
//! most one state is live per user at a time: issuing a new one silently
//! overwrites any pending one. Concurrent multi-device connect flows for
//! one user are not supported.

use crate::kv::{KvError, KvStore};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Fixed prefix of every state storage key.
pub const STATE_KEY_PREFIX: &str = "msteamsmeetinguserstate";

/// A state string has exactly this many underscore-joined fields:
/// prefix, user id, channel id, justConnect flag.
const STATE_FIELD_COUNT: usize = 4;

/// Deterministic per-user state key.
///
/// User and channel ids are host-issued alphanumeric ids and never contain
/// underscores, which keeps the field encoding unambiguous.
pub fn state_key(user_id: &str) -> String {
    format!("{STATE_KEY_PREFIX}_{user_id}")
}

/// The tuple a state string encodes.
#[derive(Debug, Clone, PartialEq)]
pub struct StateData {
    /// Storage key, rebuilt from the first two fields
    pub key: String,
    pub user_id: String,
    pub channel_id: String,
    /// True when the flow should only link the account, without starting a
    /// meeting afterwards
    pub just_connect: bool,
}

/// State machine failures. All of them are terminal for the request that
/// presented the state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid state, expected {STATE_FIELD_COUNT} fields")]
    Malformed,

    #[error("missing stored state")]
    NotFound,

    #[error("invalid state, stored value does not match")]
    Invalid,

    #[error("not authorized, incorrect user")]
    Unauthorized,

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Issues, validates, and burns state tokens over the host key-value store.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Issues a state string for `user_id` and persists it verbatim under
    /// the per-user key. Returns the state for embedding in the outbound
    /// authorization URL.
    pub fn store_state(
        &self,
        user_id: &str,
        channel_id: &str,
        just_connect: bool,
    ) -> Result<String, StateError> {
        let key = state_key(user_id);
        let state = format!("{key}_{channel_id}_{just_connect}");

        self.kv.set(&key, state.as_bytes())?;
        Ok(state)
    }

    /// Splits a presented state string back into its fields.
    pub fn parse_state(state: &str) -> Result<StateData, StateError> {
        let fields: Vec<&str> = state.split('_').collect();
        if fields.len() != STATE_FIELD_COUNT {
            debug!(state, field_count = fields.len(), "state mismatch");
            return Err(StateError::Malformed);
        }

        Ok(StateData {
            key: format!("{}_{}", fields[0], fields[1]),
            user_id: fields[1].to_string(),
            channel_id: fields[2].to_string(),
            just_connect: fields[3] == "true",
        })
    }

    /// Raw read-back of the stored state.
    pub fn get_state(&self, key: &str) -> Result<String, StateError> {
        let bytes = self.kv.get(key)?.ok_or(StateError::NotFound)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Deletes the stored state. Called exactly once per flow; the deletion
    /// is not re-verified.
    pub fn delete_state(&self, key: &str) -> Result<(), StateError> {
        self.kv.delete(key)?;
        Ok(())
    }

    /// The callback validation protocol, in strict order, each step failing
    /// closed:
    ///
    /// 1. the presented state must parse;
    /// 2. a stored state must exist under the derived key;
    /// 3. the stored value must equal the presented state exactly;
    /// 4. the state is burned before any further trust decision;
    /// 5. the authenticated caller must be the user embedded in the state.
    ///
    /// Step 5 runs after the burn on purpose: a cross-user completion
    /// attempt consumes the victim's pending state rather than leaving it
    /// replayable.
    pub fn validate_and_consume(
        &self,
        presented: &str,
        authed_user_id: &str,
    ) -> Result<StateData, StateError> {
        let data = Self::parse_state(presented)?;

        let stored = self.get_state(&data.key)?;
        if stored != presented {
            debug!(key = %data.key, "presented state does not match stored state");
            return Err(StateError::Invalid);
        }

        self.delete_state(&data.key)?;

        if data.user_id != authed_user_id {
            debug!(
                expected = %data.user_id,
                actual = %authed_user_id,
                "state does not belong to the authenticated user"
            );
            return Err(StateError::Unauthorized);
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn state_store() -> StateStore {
        StateStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_issue_then_parse_round_trips() {
        let store = state_store();

        let state = store.store_state("user42", "chanX", true).unwrap();
        let data = StateStore::parse_state(&state).unwrap();

        assert_eq!(data.user_id, "user42");
        assert_eq!(data.channel_id, "chanX");
        assert!(data.just_connect);
        assert_eq!(data.key, "msteamsmeetinguserstate_user42");
    }

    #[test]
    fn test_parse_fixed_scenarios() {
        let data = StateStore::parse_state("abc123_user42_chanX_true").unwrap();
        assert_eq!(data.key, "abc123_user42");
        assert_eq!(data.user_id, "user42");
        assert_eq!(data.channel_id, "chanX");
        assert!(data.just_connect);

        let data = StateStore::parse_state("abc123_user42_chanX_false").unwrap();
        assert!(!data.just_connect);

        assert!(matches!(
            StateStore::parse_state("abc_user42_chanX"),
            Err(StateError::Malformed)
        ));
        assert!(matches!(
            StateStore::parse_state("a_b_c_d_e"),
            Err(StateError::Malformed)
        ));
        assert!(matches!(
            StateStore::parse_state(""),
            Err(StateError::Malformed)
        ));
    }

    #[test]
    fn test_state_is_burned_on_consume() {
        let store = state_store();

        let state = store.store_state("user42", "chanX", false).unwrap();
        let data = store.validate_and_consume(&state, "user42").unwrap();
        assert_eq!(data.channel_id, "chanX");

        // Replay of the consumed state must fail
        assert!(matches!(
            store.get_state(&data.key),
            Err(StateError::NotFound)
        ));
        assert!(matches!(
            store.validate_and_consume(&state, "user42"),
            Err(StateError::NotFound)
        ));
    }

    #[test]
    fn test_cross_user_completion_rejected() {
        let store = state_store();

        let state = store.store_state("user42", "chanX", false).unwrap();

        // Steps 1-4 all pass; only the caller identity differs
        assert!(matches!(
            store.validate_and_consume(&state, "mallory"),
            Err(StateError::Unauthorized)
        ));

        // The burn already happened: the victim's state is gone
        assert!(matches!(
            store.get_state("msteamsmeetinguserstate_user42"),
            Err(StateError::NotFound)
        ));
    }

    #[test]
    fn test_tampered_state_rejected() {
        let store = state_store();

        store.store_state("user42", "chanX", false).unwrap();

        // Same key derivation, different channel: lookup succeeds but the
        // stored value comparison catches the tampering
        let forged = "msteamsmeetinguserstate_user42_otherchan_false";
        assert!(matches!(
            store.validate_and_consume(forged, "user42"),
            Err(StateError::Invalid)
        ));
    }

    #[test]
    fn test_at_most_one_state_in_flight_per_user() {
        let store = state_store();

        let first = store.store_state("user42", "chanA", false).unwrap();
        let second = store.store_state("user42", "chanB", true).unwrap();

        // The second issue overwrote the first; the stale state fails the
        // exact-match comparison
        assert!(matches!(
            store.validate_and_consume(&first, "user42"),
            Err(StateError::Invalid)
        ));

        // Consuming step 3's failure did not burn the live state
        let data = store.validate_and_consume(&second, "user42").unwrap();
        assert_eq!(data.channel_id, "chanB");
    }
}
