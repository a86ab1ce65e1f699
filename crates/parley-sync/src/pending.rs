use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use parley_types::models::{MediaRef, Message, MessageContent, UserId};

use crate::clock::Clock;

/// How far a confirmed message's timestamp may drift from the local send
/// time and still count as the same message.
const MATCH_WINDOW_SECS: i64 = 30;

/// Local handle for a message the UI is showing before the server confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingId(Uuid);

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub id: PendingId,
    pub conversation: UserId,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

/// Optimistic bubbles owned by the caller. The synchronizer itself only ever
/// holds confirmed messages; this list is rendered next to it and shrinks as
/// sends settle, fail, or are overtaken by their own push echo.
pub struct PendingSends {
    clock: Arc<dyn Clock>,
    entries: Vec<PendingMessage>,
}

impl PendingSends {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, conversation: UserId, content: MessageContent) -> PendingId {
        let id = PendingId(Uuid::new_v4());
        self.entries.push(PendingMessage {
            id,
            conversation,
            content,
            created_at: self.clock.now(),
        });
        id
    }

    /// The send succeeded; the confirmed copy now lives in the synchronizer.
    pub fn settle(&mut self, id: PendingId) -> Option<PendingMessage> {
        self.take(id)
    }

    /// The send failed. The returned entry is what the UI should roll back.
    pub fn fail(&mut self, id: PendingId) -> Option<PendingMessage> {
        self.take(id)
    }

    fn take(&mut self, id: PendingId) -> Option<PendingMessage> {
        let at = self.entries.iter().position(|p| p.id == id)?;
        Some(self.entries.remove(at))
    }

    pub fn for_conversation<'a>(
        &'a self,
        conversation: &'a UserId,
    ) -> impl Iterator<Item = &'a PendingMessage> + 'a {
        self.entries
            .iter()
            .filter(move |p| &p.conversation == conversation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `confirmed` just arrived on the push channel. If it is the echo of
    /// one of our own sends, drop the oldest matching entry and return it.
    /// Messages already in the synchronizer are never considered, so a send
    /// that settled earlier cannot absorb a later identical one.
    pub fn reconcile(&mut self, local: &UserId, confirmed: &Message) -> Option<PendingId> {
        if &confirmed.sender != local {
            return None;
        }
        let window = Duration::seconds(MATCH_WINDOW_SECS);
        let at = self.entries.iter().position(|pending| {
            confirmed.involves(&pending.conversation)
                && (confirmed.created_at - pending.created_at).abs() <= window
                && same_payload(&pending.content, &confirmed.content)
        })?;
        Some(self.entries.remove(at).id)
    }
}

fn media(content: &MessageContent) -> Option<&MediaRef> {
    match content {
        MessageContent::Image(m)
        | MessageContent::Video(m)
        | MessageContent::Audio(m)
        | MessageContent::Document(m) => Some(m),
        _ => None,
    }
}

/// Uploads get a server URL, so media is matched by kind and file name.
fn same_payload(pending: &MessageContent, confirmed: &MessageContent) -> bool {
    if pending.kind() != confirmed.kind() {
        return false;
    }
    match (pending, confirmed) {
        (MessageContent::Text { body: a }, MessageContent::Text { body: b }) => a == b,
        (MessageContent::Link { url: a, .. }, MessageContent::Link { url: b, .. }) => a == b,
        _ => match (media(pending), media(confirmed)) {
            (Some(a), Some(b)) => match (&a.file_name, &b.file_name) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use parley_types::models::{MessageId, UserSummary};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::ConversationSync;

    fn setup() -> (ConversationSync, PendingSends, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let mut sync = ConversationSync::new(UserId::from("me"), clock.clone());
        sync.select_conversation(UserSummary::unknown(UserId::from("bob")));
        (sync, PendingSends::new(clock.clone()), clock)
    }

    fn confirmed_text(
        id: &str,
        sender: &UserId,
        receiver: &UserId,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        Message {
            id: MessageId::from(id),
            sender: sender.clone(),
            receiver: receiver.clone(),
            content: MessageContent::Text { body: body.into() },
            created_at,
            read: false,
            read_at: None,
        }
    }

    fn text(body: &str) -> MessageContent {
        MessageContent::Text { body: body.into() }
    }

    #[test]
    fn settle_and_fail_remove_the_entry() {
        let (_, mut pending, _) = setup();
        let bob = UserId::from("bob");
        let a = pending.push(bob.clone(), text("hi"));
        let b = pending.push(bob.clone(), text("there"));

        assert_eq!(pending.settle(a).unwrap().content, text("hi"));
        let failed = pending.fail(b).unwrap();
        assert_eq!(failed.conversation, bob);
        assert!(pending.is_empty());
        assert!(pending.fail(b).is_none());
    }

    #[test]
    fn echo_that_wins_the_race_absorbs_one_bubble() {
        let (mut sync, mut pending, clock) = setup();
        let me = UserId::from("me");
        let bob = UserId::from("bob");

        let first = pending.push(bob.clone(), text("ok"));
        let second = pending.push(bob.clone(), text("ok"));
        let other = pending.push(bob.clone(), text("different"));

        clock.advance(Duration::seconds(2));
        let echo = confirmed_text("s1", &me, &bob, "ok", clock.now());
        assert!(sync.ingest_push_message(echo.clone()));

        assert_eq!(pending.reconcile(&me, &echo), Some(first));
        let left: Vec<PendingId> = pending.for_conversation(&bob).map(|p| p.id).collect();
        assert_eq!(left, vec![second, other]);
    }

    #[test]
    fn stale_confirmations_do_not_match() {
        let (_, mut pending, clock) = setup();
        let me = UserId::from("me");
        let bob = UserId::from("bob");

        let old = confirmed_text("old", &me, &bob, "ok", clock.now());
        clock.advance(Duration::minutes(10));
        pending.push(bob, text("ok"));

        assert_eq!(pending.reconcile(&me, &old), None);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn settled_send_does_not_absorb_a_later_identical_one() {
        let (mut sync, mut pending, clock) = setup();
        let me = UserId::from("me");
        let bob = UserId::from("bob");

        let first = pending.push(bob.clone(), text("ok"));
        sync.confirm_send(confirmed_text("s1", &me, &bob, "ok", clock.now()));
        pending.settle(first);

        clock.advance(Duration::seconds(5));
        let second = pending.push(bob.clone(), text("ok"));

        let unrelated = confirmed_text("in1", &bob, &me, "hey", clock.now());
        assert!(sync.ingest_push_message(unrelated.clone()));
        assert_eq!(pending.reconcile(&me, &unrelated), None);

        let left: Vec<PendingId> = pending.for_conversation(&bob).map(|p| p.id).collect();
        assert_eq!(left, vec![second]);
        assert!(pending.fail(second).is_some());
    }

    #[test]
    fn echo_only_settles_its_own_conversation() {
        let (_, mut pending, clock) = setup();
        let me = UserId::from("me");
        let carol = UserId::from("carol");

        pending.push(UserId::from("bob"), text("ok"));
        let to_carol = confirmed_text("c1", &me, &carol, "ok", clock.now());

        assert_eq!(pending.reconcile(&me, &to_carol), None);
        assert_eq!(pending.len(), 1);
    }
}
