use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::api::WireMessage;
use crate::error::ApiError;
use crate::models::{Message, MessageId, UserId};

pub const EVENT_RECEIVE_MESSAGE: &str = "receive-message";
pub const EVENT_MESSAGE_DELETED: &str = "message-deleted";
pub const EVENT_MESSAGE_READ: &str = "message-read";
pub const EVENT_ALL_MESSAGES_READ: &str = "all-messages-read";
pub const EVENT_TYPING_START: &str = "typing-start";
pub const EVENT_TYPING_STOP: &str = "typing-stop";
pub const EVENT_USER_ONLINE: &str = "user-online";
pub const EVENT_USER_OFFLINE: &str = "user-offline";
pub const EVENT_ONLINE_USERS: &str = "online-users";

pub const EVENT_SEND_MESSAGE: &str = "send-message";
pub const EVENT_MARK_AS_READ: &str = "mark-as-read";
pub const EVENT_DELETE_MESSAGE: &str = "delete-message";

/// Events pushed by the server over the real-time channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    MessageReceived(Message),
    MessageDeleted {
        message_id: MessageId,
    },
    MessageRead {
        message_id: MessageId,
        read_at: Option<DateTime<Utc>>,
    },
    /// `reader` has read everything in their conversation with us.
    ///
    /// The backend's mark-all-read handler emits `all-messages-read` with
    /// `{friendId: <reader>}` to the other participant, so the messages it
    /// covers are the ones this client sent to `reader`. Matching on the
    /// sender instead would mark our own inbox read because a peer opened
    /// theirs.
    AllMessagesRead {
        reader: UserId,
        read_at: Option<DateTime<Utc>>,
    },
    TypingStarted {
        user_id: UserId,
        username: Option<String>,
    },
    TypingStopped {
        user_id: UserId,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    /// Snapshot of everyone online, sent once after connecting.
    OnlineUsers(Vec<UserId>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    message_id: MessageId,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendRef {
    friend_id: UserId,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRef {
    user_id: UserId,
    #[serde(default)]
    username: Option<String>,
}

impl RealtimeEvent {
    /// Decode a named event. Unknown names yield `Ok(None)`.
    pub fn from_wire(name: &str, payload: Value) -> Result<Option<Self>, ApiError> {
        let event = match name {
            EVENT_RECEIVE_MESSAGE => {
                let wire: WireMessage = serde_json::from_value(payload)?;
                Self::MessageReceived(wire.into_message()?)
            }
            EVENT_MESSAGE_DELETED => {
                let r: MessageRef = serde_json::from_value(payload)?;
                Self::MessageDeleted {
                    message_id: r.message_id,
                }
            }
            EVENT_MESSAGE_READ => {
                let r: MessageRef = serde_json::from_value(payload)?;
                Self::MessageRead {
                    message_id: r.message_id,
                    read_at: r.read_at,
                }
            }
            EVENT_ALL_MESSAGES_READ => {
                let r: FriendRef = serde_json::from_value(payload)?;
                Self::AllMessagesRead {
                    reader: r.friend_id,
                    read_at: r.read_at,
                }
            }
            EVENT_TYPING_START => {
                let r: UserRef = serde_json::from_value(payload)?;
                Self::TypingStarted {
                    user_id: r.user_id,
                    username: r.username,
                }
            }
            EVENT_TYPING_STOP => {
                let r: UserRef = serde_json::from_value(payload)?;
                Self::TypingStopped { user_id: r.user_id }
            }
            EVENT_USER_ONLINE => {
                let r: UserRef = serde_json::from_value(payload)?;
                Self::UserOnline { user_id: r.user_id }
            }
            EVENT_USER_OFFLINE => {
                let r: UserRef = serde_json::from_value(payload)?;
                Self::UserOffline { user_id: r.user_id }
            }
            EVENT_ONLINE_USERS => Self::OnlineUsers(serde_json::from_value(payload)?),
            other => {
                debug!("Ignoring unknown realtime event '{}'", other);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

/// Events emitted by this client over the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeCommand {
    /// Post-persist notification: the REST send already succeeded.
    SendMessage { message_id: MessageId },
    TypingStart { friend_id: UserId },
    TypingStop { friend_id: UserId },
    MarkAsRead { message_id: MessageId },
    DeleteMessage { message_id: MessageId },
}

impl RealtimeCommand {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => EVENT_SEND_MESSAGE,
            Self::TypingStart { .. } => EVENT_TYPING_START,
            Self::TypingStop { .. } => EVENT_TYPING_STOP,
            Self::MarkAsRead { .. } => EVENT_MARK_AS_READ,
            Self::DeleteMessage { .. } => EVENT_DELETE_MESSAGE,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::SendMessage { message_id }
            | Self::MarkAsRead { message_id }
            | Self::DeleteMessage { message_id } => json!({ "messageId": message_id }),
            Self::TypingStart { friend_id } | Self::TypingStop { friend_id } => {
                json!({ "friendId": friend_id })
            }
        }
    }
}
