//! OAuth 2.0 connect flow for Microsoft accounts.
//!
//! The pieces of the authorization code flow this core owns:
//! 1. Connect request → [`state::StateStore`] issues a CSRF state token
//! 2. User authorizes against Azure AD ([`provider`] builds the URL)
//! 3. Callback validates and burns the state token
//! 4. [`exchange`] trades the code for a token pair
//! 5. The credential store persists the encrypted record
//!
//! The HTTP handlers wiring these together live in [`crate::api`].

pub mod exchange;
pub mod provider;
pub mod state;

pub use exchange::exchange_code_for_token;
pub use provider::{azure_provider, OAuthProviderConfig};
pub use state::{state_key, StateData, StateError, StateStore, STATE_KEY_PREFIX};
