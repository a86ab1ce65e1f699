use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use parley_types::models::{
    ConversationSummary, HistoryPage, Message, MessageId, UserId, UserSummary,
};

use crate::clock::Clock;
use crate::conversation::{Conversation, LoadPhase};
use crate::error::SyncError;

/// Proof that a history fetch was started for the current selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub conversation: UserId,
    pub page: u32,
    generation: u64,
}

/// A message taken out by [`ConversationSync::remove_message`], kept so the
/// removal can be undone if the server refuses the delete.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedMessage {
    pub conversation: UserId,
    pub message: Message,
    index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub is_typing: bool,
    pub display_name: Option<String>,
}

/// All client-side chat state for the signed-in user.
pub struct ConversationSync {
    local: UserId,
    clock: Arc<dyn Clock>,
    active: Option<UserId>,
    /// Bumped on every selection change; invalidates outstanding tickets.
    generation: u64,
    conversations: HashMap<UserId, Conversation>,
    friends: HashMap<UserId, UserSummary>,
    presence: HashMap<UserId, bool>,
    typing: HashMap<UserId, TypingEntry>,
    /// Deleted ids. A late echo of one of these is ignored. Kept until the
    /// session ends, since an echo may name a conversation no longer listed.
    tombstones: HashSet<MessageId>,
    /// Messages whose read stamp came from the server. Entries leave with
    /// the message when a page or listing drops it.
    server_read: HashSet<MessageId>,
}

impl ConversationSync {
    pub fn new(local: UserId, clock: Arc<dyn Clock>) -> Self {
        Self {
            local,
            clock,
            active: None,
            generation: 0,
            conversations: HashMap::new(),
            friends: HashMap::new(),
            presence: HashMap::new(),
            typing: HashMap::new(),
            tombstones: HashSet::new(),
            server_read: HashSet::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn active(&self) -> Option<&UserId> {
        self.active.as_ref()
    }

    pub fn conversation(&self, counterpart: &UserId) -> Option<&Conversation> {
        self.conversations.get(counterpart)
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.as_ref().and_then(|id| self.conversations.get(id))
    }

    pub fn messages(&self, counterpart: &UserId) -> &[Message] {
        self.conversations
            .get(counterpart)
            .map(Conversation::messages)
            .unwrap_or_default()
    }

    pub fn friend(&self, id: &UserId) -> Option<&UserSummary> {
        self.friends.get(id)
    }

    pub fn friends(&self) -> impl Iterator<Item = &UserSummary> {
        self.friends.values()
    }

    /// `None` when the user was never reported on.
    pub fn is_online(&self, user: &UserId) -> Option<bool> {
        self.presence.get(user).copied()
    }

    pub fn presence(&self) -> &HashMap<UserId, bool> {
        &self.presence
    }

    pub fn typing(&self, user: &UserId) -> Option<&TypingEntry> {
        self.typing.get(user)
    }

    pub fn is_deleted(&self, id: &MessageId) -> bool {
        self.tombstones.contains(id)
    }

    /// Whether any conversation currently holds `id`.
    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.locate(id).is_some()
    }

    // -- Selection --

    /// Make `counterpart` the open conversation. The previous sequence is
    /// dropped right away and the new one starts over from page 1.
    pub fn select_conversation(&mut self, counterpart: UserSummary) {
        if let Some(previous) = self.active.take() {
            if let Some(conversation) = self.conversations.get_mut(&previous) {
                Self::reset(conversation, &mut self.server_read);
            }
        }
        self.generation += 1;

        let id = counterpart.id.clone();
        let online = self.presence.get(&id).copied();
        let conversation = self
            .conversations
            .entry(id.clone())
            .or_insert_with(|| Conversation::new(counterpart.clone()));
        *conversation.counterpart_mut() = counterpart;
        if let Some(online) = online {
            conversation.counterpart_mut().is_online = online;
        }
        Self::reset(conversation, &mut self.server_read);
        debug!("Selected conversation with {}", id);
        self.active = Some(id);
    }

    pub fn clear_conversation(&mut self, counterpart: &UserId) {
        if let Some(conversation) = self.conversations.get_mut(counterpart) {
            Self::reset(conversation, &mut self.server_read);
        }
        if self.active.as_ref() == Some(counterpart) {
            self.active = None;
        }
        self.generation += 1;
    }

    fn reset(conversation: &mut Conversation, server_read: &mut HashSet<MessageId>) {
        for message in conversation.messages() {
            server_read.remove(&message.id);
        }
        conversation.reset();
    }

    // -- History --

    pub fn begin_history(
        &mut self,
        counterpart: &UserId,
        page: u32,
    ) -> Result<HistoryTicket, SyncError> {
        let conversation = self
            .conversations
            .get_mut(counterpart)
            .ok_or_else(|| SyncError::UnknownConversation(counterpart.clone()))?;
        conversation.set_phase(LoadPhase::Loading);
        Ok(HistoryTicket {
            conversation: counterpart.clone(),
            page: page.max(1),
            generation: self.generation,
        })
    }

    /// Merge a fetched page. Page 1 replaces the sequence; later pages are
    /// older and go in front.
    pub fn apply_history(
        &mut self,
        ticket: HistoryTicket,
        page: HistoryPage,
    ) -> Result<usize, SyncError> {
        self.check(&ticket)?;

        let mut incoming = page.messages;
        incoming.retain(|m| !self.tombstones.contains(&m.id));
        // Pages come newest-first; bring them to chronological order before merging.
        if incoming
            .first()
            .zip(incoming.last())
            .is_some_and(|(first, last)| first.created_at > last.created_at)
        {
            incoming.reverse();
        }
        incoming.sort_by_key(|m| m.created_at);
        for message in &incoming {
            if message.read_at.is_some() {
                self.server_read.insert(message.id.clone());
            }
        }

        let conversation = self
            .conversations
            .get_mut(&ticket.conversation)
            .ok_or_else(|| SyncError::UnknownConversation(ticket.conversation.clone()))?;

        let mut seen = HashSet::new();
        let added = if ticket.page <= 1 {
            // Anything held that the page does not cover survives: pushes that
            // raced the fetch, or everything when the page is empty.
            let oldest = incoming.first().map(|m| m.created_at);
            let page_ids: HashSet<MessageId> = incoming.iter().map(|m| m.id.clone()).collect();
            let (carried, dropped): (Vec<Message>, Vec<Message>) = conversation
                .messages()
                .iter()
                .filter(|m| !page_ids.contains(&m.id))
                .cloned()
                .partition(|m| oldest.is_none_or(|o| m.created_at >= o));
            for message in &dropped {
                self.server_read.remove(&message.id);
            }

            let mut merged = Vec::with_capacity(incoming.len());
            for message in incoming {
                if seen.insert(message.id.clone()) {
                    merged.push(message);
                }
            }
            conversation.replace_messages(merged);
            for message in carried {
                conversation.insert(message);
            }
            conversation.messages().len()
        } else {
            let mut count = 0;
            for message in incoming {
                if seen.insert(message.id.clone()) && conversation.insert(message).is_some() {
                    count += 1;
                }
            }
            count
        };

        conversation.set_pagination(ticket.page, page.has_more);
        trace!(
            "Applied history page {} for {}: {} new, has_more={}",
            ticket.page, ticket.conversation, added, page.has_more
        );
        Ok(added)
    }

    /// The fetch failed. Whatever was already shown stays.
    pub fn fail_history(&mut self, ticket: HistoryTicket) -> Result<(), SyncError> {
        self.check(&ticket)?;
        if let Some(conversation) = self.conversations.get_mut(&ticket.conversation) {
            let phase = if conversation.messages().is_empty() {
                LoadPhase::Empty
            } else {
                LoadPhase::Ready
            };
            conversation.set_phase(phase);
        }
        Ok(())
    }

    fn check(&self, ticket: &HistoryTicket) -> Result<(), SyncError> {
        if ticket.generation != self.generation {
            debug!(
                "Discarding stale history page {} for {}",
                ticket.page, ticket.conversation
            );
            return Err(SyncError::StaleTicket {
                conversation: ticket.conversation.clone(),
                page: ticket.page,
            });
        }
        Ok(())
    }

    // -- Messages --

    /// Which conversation a message belongs to: the open one if it takes
    /// part, else a known friend on either side, else the non-local side.
    fn owner_of(&self, message: &Message) -> UserId {
        if let Some(active) = self.active.as_ref().filter(|a| message.involves(a)) {
            return active.clone();
        }
        [&message.sender, &message.receiver]
            .into_iter()
            .find(|side| **side != self.local && self.friends.contains_key(*side))
            .unwrap_or_else(|| message.counterpart_of(&self.local))
            .clone()
    }

    /// Fold in a message from the real-time channel. Returns `false` if it
    /// was already known or has been deleted.
    pub fn ingest_push_message(&mut self, message: Message) -> bool {
        if self.tombstones.contains(&message.id) {
            debug!("Ignoring echo of deleted message {}", message.id);
            return false;
        }
        let owner = self.owner_of(&message);
        let inbound = message.receiver == self.local && message.sender != self.local;
        let unread = inbound && !message.read && self.active.as_ref() != Some(&owner);
        if message.read_at.is_some() {
            self.server_read.insert(message.id.clone());
        }

        let profile = self
            .friends
            .get(&owner)
            .cloned()
            .unwrap_or_else(|| UserSummary::unknown(owner.clone()));
        let online = self.presence.get(&owner).copied();
        let conversation = self.conversations.entry(owner).or_insert_with(|| {
            let mut conversation = Conversation::new(profile);
            if let Some(online) = online {
                conversation.counterpart_mut().is_online = online;
            }
            conversation
        });

        let inserted = conversation.insert(message).is_some();
        if inserted && unread {
            conversation.bump_unread();
        }
        inserted
    }

    /// Record a send the server accepted. Safe to call when the push echo
    /// of the same message got here first, or arrives later.
    pub fn confirm_send(&mut self, message: Message) -> bool {
        self.ingest_push_message(message)
    }

    fn locate(&self, id: &MessageId) -> Option<UserId> {
        self.conversations
            .iter()
            .find(|(_, c)| c.contains(id))
            .map(|(owner, _)| owner.clone())
    }

    /// Take a message out of its conversation and remember that it is gone.
    pub fn remove_message(&mut self, id: &MessageId) -> Option<RemovedMessage> {
        self.tombstones.insert(id.clone());
        let owner = self.locate(id)?;
        let conversation = self.conversations.get_mut(&owner)?;
        let (index, message) = conversation.remove(id)?;
        Some(RemovedMessage {
            conversation: owner,
            message,
            index,
        })
    }

    /// Undo [`Self::remove_message`] after the server rejected the delete.
    pub fn restore_message(&mut self, removed: RemovedMessage) -> bool {
        self.tombstones.remove(&removed.message.id);
        match self.conversations.get_mut(&removed.conversation) {
            Some(conversation) => conversation.reinsert(removed.message, removed.index),
            None => false,
        }
    }

    /// The server says this message is gone.
    pub fn confirm_deleted(&mut self, id: &MessageId) -> bool {
        self.remove_message(id).is_some()
    }

    // -- Read state --

    /// Returns whether the stored stamp changed. `server_stamp` of `None`
    /// means a local mark stamped by the clock; it never overrides a
    /// server stamp.
    fn apply_read(
        server_read: &mut HashSet<MessageId>,
        message: &mut Message,
        stamp: DateTime<Utc>,
        from_server: bool,
    ) -> bool {
        if from_server {
            if server_read.contains(&message.id) && message.read_at.is_some_and(|at| at >= stamp) {
                return false;
            }
            server_read.insert(message.id.clone());
        } else if message.read {
            return false;
        }
        message.read = true;
        message.read_at = Some(stamp);
        true
    }

    pub fn mark_read(&mut self, id: &MessageId, server_stamp: Option<DateTime<Utc>>) -> bool {
        let Some(owner) = self.locate(id) else {
            return false;
        };
        let stamp = server_stamp.unwrap_or_else(|| self.clock.now());
        let local = self.local.clone();
        let active = self.active.clone();
        let Some(conversation) = self.conversations.get_mut(&owner) else {
            return false;
        };

        let Some(message) = conversation.message_mut(id) else {
            return false;
        };
        let was_read = message.read;
        let inbound = message.receiver == local;
        let changed =
            Self::apply_read(&mut self.server_read, message, stamp, server_stamp.is_some());
        let snapshot = message.clone();

        if changed && !was_read && inbound && active.as_ref() != Some(&owner) {
            conversation.drop_unread();
        }
        if let Some(last) = conversation.last_message_mut().filter(|m| m.id == *id) {
            *last = snapshot;
        }
        changed
    }

    /// Mark every message `reader` received in the conversation with
    /// `counterpart` as read. Returns how many stamps changed.
    pub fn mark_all_read(
        &mut self,
        counterpart: &UserId,
        reader: &UserId,
        server_stamp: Option<DateTime<Utc>>,
    ) -> usize {
        let stamp = server_stamp.unwrap_or_else(|| self.clock.now());
        let Some(conversation) = self.conversations.get_mut(counterpart) else {
            return 0;
        };

        let mut changed = 0;
        for message in conversation.messages_mut() {
            if &message.receiver == reader
                && Self::apply_read(&mut self.server_read, message, stamp, server_stamp.is_some())
            {
                changed += 1;
            }
        }
        if let Some(last) = conversation.last_message_mut() {
            if &last.receiver == reader && !last.read {
                last.read = true;
                last.read_at = Some(stamp);
            }
        }
        if reader == &self.local {
            conversation.clear_unread();
        }
        changed
    }

    // -- Presence and typing --

    pub fn set_presence(&mut self, user: &UserId, online: bool) {
        self.presence.insert(user.clone(), online);
        if let Some(conversation) = self.conversations.get_mut(user) {
            conversation.counterpart_mut().is_online = online;
        }
        if let Some(friend) = self.friends.get_mut(user) {
            friend.is_online = online;
        }
    }

    /// Replace the whole presence map with the users in `online`.
    pub fn set_bulk_presence(&mut self, online: impl IntoIterator<Item = UserId>) {
        self.presence = online.into_iter().map(|id| (id, true)).collect();
        for (id, conversation) in &mut self.conversations {
            conversation.counterpart_mut().is_online = self.presence.contains_key(id);
        }
        for (id, friend) in &mut self.friends {
            friend.is_online = self.presence.contains_key(id);
        }
        debug!("{} user(s) online", self.presence.len());
    }

    pub fn set_typing(&mut self, user: &UserId, is_typing: bool, display_name: Option<String>) {
        if is_typing {
            self.typing.insert(
                user.clone(),
                TypingEntry {
                    is_typing,
                    display_name,
                },
            );
        } else {
            self.typing.remove(user);
        }
    }

    // -- Listings --

    /// Load the conversation listing. Sequences already held are kept.
    pub fn set_conversations(&mut self, summaries: Vec<ConversationSummary>) {
        let mut next = HashMap::with_capacity(summaries.len());
        for mut summary in summaries {
            let id = summary.counterpart.id.clone();
            if let Some(online) = self.presence.get(&id) {
                summary.counterpart.is_online = *online;
            }
            let conversation = match self.conversations.remove(&id) {
                Some(mut existing) => {
                    existing.set_listing(summary);
                    existing
                }
                None => Conversation::from_summary(summary),
            };
            next.insert(id, conversation);
        }
        if let Some(active) = &self.active {
            if let Some(conversation) = self.conversations.remove(active) {
                next.insert(active.clone(), conversation);
            }
        }
        for dropped in std::mem::replace(&mut self.conversations, next).into_values() {
            for message in dropped.messages() {
                self.server_read.remove(&message.id);
            }
        }
    }

    pub fn set_friends(&mut self, friends: Vec<UserSummary>) {
        self.friends = friends
            .into_iter()
            .map(|mut friend| {
                if let Some(online) = self.presence.get(&friend.id) {
                    friend.is_online = *online;
                }
                (friend.id.clone(), friend)
            })
            .collect();
    }

    /// Most recent activity first; conversations with none go last.
    pub fn sorted_conversations(&self) -> Vec<&Conversation> {
        let mut all: Vec<&Conversation> = self.conversations.values().collect();
        all.sort_by(|a, b| {
            b.last_message_at()
                .cmp(&a.last_message_at())
                .then_with(|| a.counterpart().username.cmp(&b.counterpart().username))
        });
        all
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(Conversation::unread).sum()
    }
}
