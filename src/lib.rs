// Host collaborator surfaces (key-value store, channels/posts)
pub mod channel;
pub mod kv;

// Plugin configuration
pub mod config;

// Encrypted credential storage
pub mod credentials;

// OAuth2 connect flow (CSRF state, provider endpoints, code exchange)
pub mod oauth;

// Authentication orchestration
pub mod auth;

// Meeting creation and the duplicate-meeting guard
pub mod meetings;

// Microsoft Graph client
pub mod remote;

// HTTP API
pub mod api;
