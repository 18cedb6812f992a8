//! Meeting creation, the duplicate-meeting guard, and the channel posts
//! that announce the results.
//!
//! The guard is a heuristic, not a lock: it inspects the trailing
//! 30-second window of channel history for a post carrying meeting marker
//! props. Two requests that land inside the window before either meeting
//! post is visible can still both create meetings.

use crate::auth::connect_message;
use crate::channel::{ChannelApi, ChannelError, Post};
use crate::config::{ConfigError, PluginConfig};
use crate::credentials::{StoreError, UserStore};
use crate::remote::{Meeting, RemoteClient, RemoteError};
use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::info;

/// Fixed duplicate-suppression window, in seconds. Not configurable.
pub const MEETING_WINDOW_SECS: i64 = 30;

/// Post type shared by every meeting-related post this core emits.
pub const MEETING_POST_TYPE: &str = "custom_mstmeetings";

/// `meeting_status` prop on a freshly created meeting post.
pub const STATUS_STARTED: &str = "STARTED";
/// `meeting_status` prop on the ephemeral "join the recent one instead" post.
pub const STATUS_RECENTLY_CREATED: &str = "RECENTLY_CREATED";

/// `meeting_provider` prop value for meetings created by this core.
pub const PROVIDER_NAME: &str = "Microsoft Teams Meetings";

#[derive(Debug, Error)]
pub enum MeetingError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A meeting marker found in the guard window.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentMeeting {
    pub link: String,
    pub creator_name: String,
    pub provider_name: String,
}

/// Scans the trailing window of channel history for a meeting marker: a
/// post with non-empty `meeting_provider` and `meeting_link` props.
///
/// Posts are re-sorted newest-first before scanning, so when several
/// markers fall inside the window the most recent one wins regardless of
/// the order the host hands them back in.
pub fn recent_meeting(
    channels: &dyn ChannelApi,
    channel_id: &str,
) -> Result<Option<RecentMeeting>, MeetingError> {
    let since = Utc::now() - Duration::seconds(MEETING_WINDOW_SECS);
    let mut posts = channels.posts_since(channel_id, since)?;
    posts.sort_by(|a, b| b.create_at.cmp(&a.create_at));

    for post in &posts {
        let provider = match post.prop_str("meeting_provider") {
            Some(p) => p,
            None => continue,
        };
        let link = match post.prop_str("meeting_link") {
            Some(l) => l,
            None => continue,
        };
        return Ok(Some(RecentMeeting {
            link: link.to_string(),
            creator_name: post
                .prop_str("meeting_creator_username")
                .unwrap_or_default()
                .to_string(),
            provider_name: provider.to_string(),
        }));
    }

    Ok(None)
}

/// Creates a meeting for `creator_id` and announces it in the channel.
///
/// The creator must already hold a usable credential; callers run the
/// authentication path first and fall back to [`post_connect`] when it
/// fails. Returns the created meeting so handlers can report the join URL.
pub async fn post_meeting(
    channels: &dyn ChannelApi,
    remote: &dyn RemoteClient,
    store: &UserStore,
    config: &PluginConfig,
    creator_id: &str,
    channel_id: &str,
    topic: &str,
) -> Result<Meeting, MeetingError> {
    let creator = channels.user(creator_id)?;
    let info = store.get_user_info(creator_id, &config.encryption_key)?;
    let token = info.oauth_token.clone().ok_or(StoreError::NotConnected)?;

    let meeting = remote.create_meeting(&token, &info, &[], topic).await?;
    info!(
        user_id = creator_id,
        channel_id, "created meeting {}", meeting.join_url
    );

    let post = Post::new(
        creator_id,
        channel_id,
        &format!("Meeting started at [this link]({}).", meeting.join_url),
    )
    .with_type(MEETING_POST_TYPE)
    .with_prop("meeting_link", meeting.join_url.clone())
    .with_prop("meeting_status", STATUS_STARTED)
    .with_prop("meeting_personal", true)
    .with_prop("meeting_topic", topic)
    .with_prop("meeting_creator_username", creator.username.clone())
    .with_prop("meeting_provider", PROVIDER_NAME);
    channels.create_post(post)?;

    Ok(meeting)
}

/// Ephemeral "join the recent one instead" post shown to the requester
/// when the guard finds a marker and `force` is not set.
pub fn post_confirm(
    channels: &dyn ChannelApi,
    channel_id: &str,
    topic: &str,
    user_id: &str,
    recent: &RecentMeeting,
) -> Result<(), MeetingError> {
    let message = if recent.provider_name == PROVIDER_NAME {
        "There is another recent meeting created on this channel.".to_string()
    } else {
        format!(
            "There is another recent meeting created on this channel with {}.",
            recent.provider_name
        )
    };

    let post = Post::new("", channel_id, &message)
        .with_type(MEETING_POST_TYPE)
        .with_prop("type", MEETING_POST_TYPE)
        .with_prop("meeting_link", recent.link.clone())
        .with_prop("meeting_status", STATUS_RECENTLY_CREATED)
        .with_prop("meeting_personal", true)
        .with_prop("meeting_topic", topic)
        .with_prop("meeting_creator_username", recent.creator_name.clone())
        .with_prop("meeting_provider", recent.provider_name.clone());
    channels.send_ephemeral_post(user_id, post)?;
    Ok(())
}

/// Ephemeral connect prompt shown when meeting creation needs a linked
/// account the requester does not have.
pub fn post_connect(
    channels: &dyn ChannelApi,
    config: &PluginConfig,
    channel_id: &str,
    user_id: &str,
) -> Result<(), MeetingError> {
    let message = connect_message(config, channel_id)?;
    channels.send_ephemeral_post(user_id, Post::new("", channel_id, &message))?;
    Ok(())
}
