use thiserror::Error;

use parley_types::UserId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The history response belongs to a selection that has since changed.
    #[error("history page {page} for {conversation} is stale")]
    StaleTicket { conversation: UserId, page: u32 },

    #[error("unknown conversation {0}")]
    UnknownConversation(UserId),
}
