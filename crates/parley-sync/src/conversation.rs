use chrono::{DateTime, Utc};

use parley_types::models::{ConversationSummary, Message, MessageId, UserSummary};

/// History load state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Empty,
    Loading,
    Ready,
}

/// One counterpart's thread: ordered messages plus the listing summary.
#[derive(Debug, Clone)]
pub struct Conversation {
    counterpart: UserSummary,
    messages: Vec<Message>,
    phase: LoadPhase,
    page: u32,
    has_more: bool,
    last_message: Option<Message>,
    last_message_at: Option<DateTime<Utc>>,
    unread: u32,
}

impl Conversation {
    pub fn new(counterpart: UserSummary) -> Self {
        Self {
            counterpart,
            messages: Vec::new(),
            phase: LoadPhase::Empty,
            page: 1,
            has_more: false,
            last_message: None,
            last_message_at: None,
            unread: 0,
        }
    }

    pub fn from_summary(summary: ConversationSummary) -> Self {
        let mut conversation = Self::new(summary.counterpart);
        conversation.last_message = summary.last_message;
        conversation.last_message_at = summary.last_message_at;
        conversation.unread = summary.unread_count;
        conversation
    }

    pub fn counterpart(&self) -> &UserSummary {
        &self.counterpart
    }

    /// Creation-time ascending, ties in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Last page applied to the sequence.
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.last_message.as_ref()
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_at
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    // -- Reducer internals --

    pub(crate) fn counterpart_mut(&mut self) -> &mut UserSummary {
        &mut self.counterpart
    }

    pub(crate) fn set_phase(&mut self, phase: LoadPhase) {
        self.phase = phase;
    }

    pub(crate) fn set_listing(&mut self, summary: ConversationSummary) {
        self.counterpart = summary.counterpart;
        self.last_message = summary.last_message;
        self.last_message_at = summary.last_message_at;
        self.unread = summary.unread_count;
    }

    /// Drop the sequence and go back to page 1.
    pub(crate) fn reset(&mut self) {
        self.messages.clear();
        self.phase = LoadPhase::Empty;
        self.page = 1;
        self.has_more = false;
    }

    pub(crate) fn set_pagination(&mut self, page: u32, has_more: bool) {
        self.page = page;
        self.has_more = has_more;
        self.phase = LoadPhase::Ready;
    }

    pub(crate) fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.refresh_last();
    }

    /// Insert after every message with the same or an earlier timestamp.
    /// Returns the index used, or `None` if the id was already present.
    pub(crate) fn insert(&mut self, message: Message) -> Option<usize> {
        if self.contains(&message.id) {
            return None;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.note_last(&message);
        self.messages.insert(at, message);
        Some(at)
    }

    /// Put a previously removed message back at `hint` if that is still its
    /// chronological slot, otherwise at the slot [`Self::insert`] would pick.
    pub(crate) fn reinsert(&mut self, message: Message, hint: usize) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let fits = hint <= self.messages.len()
            && self.messages[..hint]
                .last()
                .is_none_or(|m| m.created_at <= message.created_at)
            && self
                .messages
                .get(hint)
                .is_none_or(|m| m.created_at >= message.created_at);
        if fits {
            self.note_last(&message);
            self.messages.insert(hint, message);
        } else {
            self.insert(message);
        }
        true
    }

    pub(crate) fn remove(&mut self, id: &MessageId) -> Option<(usize, Message)> {
        let at = self.messages.iter().position(|m| &m.id == id)?;
        let message = self.messages.remove(at);
        if self.last_message.as_ref().is_some_and(|m| &m.id == id) {
            self.last_message = None;
            self.last_message_at = None;
            self.refresh_last();
        }
        Some((at, message))
    }

    pub(crate) fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    pub(crate) fn messages_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut()
    }

    pub(crate) fn last_message_mut(&mut self) -> Option<&mut Message> {
        self.last_message.as_mut()
    }

    pub(crate) fn bump_unread(&mut self) {
        self.unread = self.unread.saturating_add(1);
    }

    pub(crate) fn drop_unread(&mut self) {
        self.unread = self.unread.saturating_sub(1);
    }

    pub(crate) fn clear_unread(&mut self) {
        self.unread = 0;
    }

    fn refresh_last(&mut self) {
        if let Some(newest) = self.messages.last().cloned() {
            self.note_last(&newest);
        }
    }

    fn note_last(&mut self, message: &Message) {
        let newer = self
            .last_message_at
            .is_none_or(|at| message.created_at >= at);
        if newer {
            self.last_message_at = Some(message.created_at);
            self.last_message = Some(message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use parley_types::UserId;
    use parley_types::models::MessageContent;

    use super::*;

    fn at(id: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            sender: UserId::from("bob"),
            receiver: UserId::from("me"),
            content: MessageContent::Text { body: id.into() },
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            read: false,
            read_at: None,
        }
    }

    fn ids(c: &Conversation) -> Vec<&str> {
        c.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut c = Conversation::new(UserSummary::unknown(UserId::from("bob")));
        c.insert(at("a", 10));
        c.insert(at("b", 10));
        c.insert(at("early", 5));
        c.insert(at("c", 10));
        assert_eq!(ids(&c), ["early", "a", "b", "c"]);
        assert_eq!(c.last_message().unwrap().id.as_str(), "c");
    }

    #[test]
    fn removing_the_newest_rolls_summary_back() {
        let mut c = Conversation::new(UserSummary::unknown(UserId::from("bob")));
        c.insert(at("a", 1));
        c.insert(at("b", 2));
        c.remove(&MessageId::from("b"));
        assert_eq!(c.last_message().unwrap().id.as_str(), "a");
    }

    #[test]
    fn reinsert_falls_back_when_hint_is_wrong() {
        let mut c = Conversation::new(UserSummary::unknown(UserId::from("bob")));
        c.insert(at("a", 1));
        c.insert(at("c", 3));
        assert!(c.reinsert(at("b", 2), 0));
        assert_eq!(ids(&c), ["a", "b", "c"]);
        assert!(!c.reinsert(at("b", 2), 1));
    }
}
