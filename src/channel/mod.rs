//! Host channel/post collaborator.
//!
//! The chat host owns users, channels, and message history; this core reads
//! recent posts (for the duplicate-meeting guard) and asks the host to
//! create posts on its behalf. [`MemoryChannels`] is the double backing
//! tests and the dev harness.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Error reported by the host channel API; opaque detail, kept for logs.
#[derive(Debug, Error)]
#[error("channel API {op} failed: {message}")]
pub struct ChannelError {
    pub op: &'static str,
    pub message: String,
}

impl ChannelError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

/// A channel message, with the free-form props the host attaches to it.
#[derive(Debug, Clone)]
pub struct Post {
    pub user_id: String,
    pub channel_id: String,
    pub message: String,
    pub post_type: String,
    pub props: HashMap<String, serde_json::Value>,
    pub create_at: DateTime<Utc>,
}

impl Post {
    pub fn new(user_id: &str, channel_id: &str, message: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            message: message.to_string(),
            post_type: String::new(),
            props: HashMap::new(),
            create_at: Utc::now(),
        }
    }

    pub fn with_type(mut self, post_type: &str) -> Self {
        self.post_type = post_type.to_string();
        self
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.props.insert(key.to_string(), value.into());
        self
    }

    /// String prop, `None` when absent, non-string, or empty.
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// A chat-platform user, as far as this core needs one.
#[derive(Debug, Clone)]
pub struct ChatUser {
    pub id: String,
    pub username: String,
    pub email: String,
}

/// Contract consumed from the host's channel surface.
pub trait ChannelApi: Send + Sync {
    /// Posts in `channel_id` created at or after `since`. Order is the
    /// host's choice; callers that care re-sort.
    fn posts_since(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Post>, ChannelError>;

    /// Creates a regular channel post and returns it as stored.
    fn create_post(&self, post: Post) -> Result<Post, ChannelError>;

    /// Posts visible only to `user_id`.
    fn send_ephemeral_post(&self, user_id: &str, post: Post) -> Result<(), ChannelError>;

    fn user(&self, user_id: &str) -> Result<ChatUser, ChannelError>;

    fn is_channel_member(&self, channel_id: &str, user_id: &str) -> Result<bool, ChannelError>;
}

/// In-memory channel double for tests and the dev harness.
#[derive(Default)]
pub struct MemoryChannels {
    posts: Mutex<Vec<Post>>,
    ephemeral: Mutex<Vec<(String, Post)>>,
    users: DashMap<String, ChatUser>,
    members: DashMap<String, Vec<String>>,
}

impl MemoryChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: ChatUser) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn add_member(&self, channel_id: &str, user_id: &str) {
        self.members
            .entry(channel_id.to_string())
            .or_default()
            .push(user_id.to_string());
    }

    /// All regular posts, for assertions.
    pub fn posts(&self) -> Vec<Post> {
        self.posts.lock().unwrap().clone()
    }

    /// All ephemeral posts as (recipient, post) pairs, for assertions.
    pub fn ephemeral_posts(&self) -> Vec<(String, Post)> {
        self.ephemeral.lock().unwrap().clone()
    }
}

impl ChannelApi for MemoryChannels {
    fn posts_since(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Post>, ChannelError> {
        Ok(self
            .posts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.channel_id == channel_id && p.create_at >= since)
            .cloned()
            .collect())
    }

    fn create_post(&self, post: Post) -> Result<Post, ChannelError> {
        self.posts.lock().unwrap().push(post.clone());
        Ok(post)
    }

    fn send_ephemeral_post(&self, user_id: &str, post: Post) -> Result<(), ChannelError> {
        self.ephemeral
            .lock()
            .unwrap()
            .push((user_id.to_string(), post));
        Ok(())
    }

    fn user(&self, user_id: &str) -> Result<ChatUser, ChannelError> {
        self.users
            .get(user_id)
            .map(|u| u.value().clone())
            .ok_or_else(|| ChannelError::new("get_user", format!("unknown user {user_id}")))
    }

    fn is_channel_member(&self, channel_id: &str, user_id: &str) -> Result<bool, ChannelError> {
        Ok(self
            .members
            .get(channel_id)
            .map(|m| m.value().iter().any(|u| u == user_id))
            .unwrap_or(false))
    }
}
