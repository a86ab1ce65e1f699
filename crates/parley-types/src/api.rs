//! REST endpoint paths and wire payload shapes.
//!
//! Wire structs mirror what the backend actually sends (Mongo-style `_id`,
//! camelCase keys, user references that are sometimes ids and sometimes
//! embedded documents). Every `into_*` conversion here is the only place those
//! ambiguities are resolved; nothing past it sees a wire type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::{
    ConversationSummary, FriendRequest, FriendRequestStatus, FriendshipStatus, MediaRef, Message,
    MessageContent, MessageId, MessageKind, UserId, UserProfile, UserSummary,
};

// -- Paths --

pub mod paths {
    use crate::models::{MessageId, MessageKind, UserId};

    pub const REGISTER: &str = "auth/register";
    pub const LOGIN: &str = "auth/login";
    pub const REFRESH: &str = "auth/refresh-token";

    pub const PROFILE: &str = "user/profile";
    pub const PROFILE_PICTURE: &str = "user/profile/picture";
    pub const SEARCH_USERS: &str = "user/search";

    pub const FRIENDS: &str = "friends";
    pub const PENDING_REQUESTS: &str = "friends/requests/pending";
    pub const SENT_REQUESTS: &str = "friends/requests/sent";

    pub const CONVERSATIONS: &str = "messages/conversations";

    pub fn user(id: &UserId) -> String {
        format!("user/{}", id)
    }

    pub fn send_friend_request(user: &UserId) -> String {
        format!("friends/request/{}", user)
    }

    pub fn accept_friend_request(request_id: &str) -> String {
        format!("friends/accept/{}", request_id)
    }

    pub fn reject_friend_request(request_id: &str) -> String {
        format!("friends/reject/{}", request_id)
    }

    pub fn cancel_friend_request(request_id: &str) -> String {
        format!("friends/cancel/{}", request_id)
    }

    pub fn remove_friend(friend: &UserId) -> String {
        format!("friends/remove/{}", friend)
    }

    pub fn friendship_status(user: &UserId) -> String {
        format!("friends/status/{}", user)
    }

    pub fn history(counterpart: &UserId) -> String {
        format!("messages/conversation/{}", counterpart)
    }

    pub fn send_message(kind: MessageKind, counterpart: &UserId) -> String {
        format!("messages/{}/{}", kind.as_str(), counterpart)
    }

    pub fn mark_read(message: &MessageId) -> String {
        format!("messages/read/{}", message)
    }

    pub fn mark_all_read(counterpart: &UserId) -> String {
        format!("messages/{}/read-all", counterpart)
    }

    pub fn delete_message(message: &MessageId) -> String {
        format!("messages/{}", message)
    }
}

// -- Envelope --

/// Pull the payload out of a response body.
///
/// The backend wraps payloads as `{ "data": ... }`, sometimes as
/// `{ "<key>": ... }`, and occasionally sends them bare. An explicit
/// `"success": false` is an application error carrying the server's message.
pub fn unwrap_envelope(body: serde_json::Value, key: Option<&str>) -> Result<serde_json::Value, ApiError> {
    use serde_json::Value;

    let Value::Object(mut map) = body else {
        return Ok(body);
    };
    if map.get("success").and_then(Value::as_bool) == Some(false) {
        let message = map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        return Err(ApiError::Application(message));
    }
    if let Some(data) = map.remove("data") {
        return Ok(data);
    }
    if let Some(data) = key.and_then(|k| map.remove(k)) {
        return Ok(data);
    }
    Ok(Value::Object(map))
}

// -- Auth --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Token payload of login and refresh responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub user: Option<WireUser>,
}

// -- Profile --

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

// -- Messages --

#[derive(Debug, Serialize)]
pub struct SendTextRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SendLinkRequest {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub current_page: Option<u32>,
}

// -- Users --

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUser {
    #[serde(rename = "_id", default)]
    pub mongo_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_online: bool,
}

impl WireUser {
    pub fn user_id(&self) -> Option<UserId> {
        self.mongo_id
            .as_deref()
            .or(self.id.as_deref())
            .map(UserId::from)
    }

    pub fn into_summary(self) -> Result<UserSummary, ApiError> {
        let id = self
            .user_id()
            .ok_or_else(|| ApiError::Decode("user without id".into()))?;
        Ok(UserSummary {
            username: self.username.unwrap_or_else(|| id.to_string()),
            id,
            full_name: self.full_name,
            avatar: self.profile_picture.or(self.avatar),
            is_online: self.is_online,
        })
    }

    pub fn into_profile(self) -> Result<UserProfile, ApiError> {
        let id = self
            .user_id()
            .ok_or_else(|| ApiError::Decode("profile without id".into()))?;
        Ok(UserProfile {
            username: self.username.unwrap_or_else(|| id.to_string()),
            id,
            email: self.email,
            full_name: self.full_name,
            bio: self.bio,
            avatar: self.profile_picture.or(self.avatar),
        })
    }
}

/// A user reference that is either a bare id or an embedded document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireUserRef {
    Id(String),
    User(WireUser),
}

impl WireUserRef {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Id(id) => Some(UserId::from(id.as_str())),
            Self::User(user) => user.user_id(),
        }
    }

    /// Embedded profile data, if the server sent any.
    pub fn summary(&self) -> Option<UserSummary> {
        match self {
            Self::Id(_) => None,
            Self::User(user) => user.clone().into_summary().ok(),
        }
    }
}

// -- Messages --

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id", default)]
    pub mongo_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    pub sender: WireUserRef,
    pub receiver: WireUserRef,
    #[serde(default)]
    pub message_type: Option<MessageKind>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub document_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl WireMessage {
    pub fn into_message(self) -> Result<Message, ApiError> {
        let id = self
            .mongo_id
            .as_deref()
            .or(self.id.as_deref())
            .map(MessageId::from)
            .ok_or_else(|| ApiError::Decode("message without id".into()))?;
        let sender = self
            .sender
            .user_id()
            .ok_or_else(|| ApiError::Decode(format!("message {} without sender", id)))?;
        let receiver = self
            .receiver
            .user_id()
            .ok_or_else(|| ApiError::Decode(format!("message {} without receiver", id)))?;

        let kind = self.message_type.unwrap_or(MessageKind::Text);
        let media = |primary: Option<String>| -> Result<MediaRef, ApiError> {
            let url = self
                .file_url
                .clone()
                .or(primary)
                .or_else(|| self.content.clone())
                .ok_or_else(|| ApiError::Decode(format!("{} message {} without url", kind, id)))?;
            Ok(MediaRef {
                url,
                caption: self.caption.clone(),
                file_name: self.file_name.clone(),
                file_size: self.file_size,
            })
        };

        let content = match kind {
            MessageKind::Text => MessageContent::Text {
                body: self.content.clone().unwrap_or_default(),
            },
            MessageKind::Image => {
                MessageContent::Image(media(self.image_url.clone().or(self.url.clone()))?)
            }
            MessageKind::Video => MessageContent::Video(media(self.video_url.clone())?),
            MessageKind::Audio => MessageContent::Audio(media(self.audio_url.clone())?),
            MessageKind::Document => MessageContent::Document(media(self.document_url.clone())?),
            MessageKind::Link => MessageContent::Link {
                url: self
                    .url
                    .clone()
                    .or_else(|| self.content.clone())
                    .ok_or_else(|| ApiError::Decode(format!("link message {} without url", id)))?,
                title: self.title.clone(),
                description: self.description.clone(),
            },
        };

        Ok(Message {
            id,
            sender,
            receiver,
            content,
            created_at: self.created_at,
            read: self.is_read || self.read_at.is_some(),
            read_at: self.read_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConversation {
    pub friend: WireUser,
    #[serde(default)]
    pub last_message: Option<WireMessage>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

impl WireConversation {
    pub fn into_summary(self) -> Result<ConversationSummary, ApiError> {
        let last_message = self.last_message.map(WireMessage::into_message).transpose()?;
        let last_message_at = self
            .last_message_time
            .or_else(|| last_message.as_ref().map(|m| m.created_at));
        Ok(ConversationSummary {
            counterpart: self.friend.into_summary()?,
            last_message,
            last_message_at,
            unread_count: self.unread_count,
        })
    }
}

// -- Friends --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFriendRequest {
    #[serde(rename = "_id", default)]
    pub mongo_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "sender")]
    pub from: Option<WireUserRef>,
    #[serde(default, alias = "receiver")]
    pub to: Option<WireUserRef>,
    #[serde(default)]
    pub status: Option<FriendRequestStatus>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl WireFriendRequest {
    pub fn into_request(self) -> Result<FriendRequest, ApiError> {
        let id = self
            .mongo_id
            .or(self.id)
            .ok_or_else(|| ApiError::Decode("friend request without id".into()))?;
        let side = |user: Option<WireUserRef>, role: &str| -> Result<UserSummary, ApiError> {
            let user = user.ok_or_else(|| {
                ApiError::Decode(format!("friend request {} without {}", id, role))
            })?;
            match user.summary() {
                Some(summary) => Ok(summary),
                None => user
                    .user_id()
                    .map(UserSummary::unknown)
                    .ok_or_else(|| ApiError::Decode(format!("friend request {} bad {}", id, role))),
            }
        };
        Ok(FriendRequest {
            from: side(self.from, "sender")?,
            to: side(self.to, "receiver")?,
            id,
            status: self.status.unwrap_or(FriendRequestStatus::Pending),
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WireFriendshipStatus {
    pub status: String,
}

impl WireFriendshipStatus {
    pub fn into_status(self) -> FriendshipStatus {
        match self.status.as_str() {
            "friends" => FriendshipStatus::Friends,
            "pending" => FriendshipStatus::PendingReceived,
            "sent" => FriendshipStatus::PendingSent,
            _ => FriendshipStatus::None,
        }
    }
}
