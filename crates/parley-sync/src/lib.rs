//! Conversation synchronizer: folds history pages, confirmed sends and push
//! events into one ordered, deduplicated message list per conversation, and
//! keeps presence and typing state alongside.
//!
//! Everything here is a synchronous reducer. No I/O happens in this crate;
//! callers fetch, then apply.

pub mod clock;
pub mod conversation;
pub mod error;
pub mod pending;
pub mod store;
pub mod typing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conversation::{Conversation, LoadPhase};
pub use error::SyncError;
pub use pending::{PendingId, PendingMessage, PendingSends};
pub use store::{ConversationSync, HistoryTicket, RemovedMessage, TypingEntry};
pub use typing::{TypingDebouncer, TypingSignal};
