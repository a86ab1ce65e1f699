use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use parley_api::{ApiClient, MediaUpload};
use parley_realtime::{ChannelConfig, ChannelStatus, RealtimeChannel};
use parley_session::{CredentialStore, SessionEvent, SessionGateway, Transport, UploadProgress};
use parley_sync::{
    Clock, ConversationSync, LoadPhase, PendingMessage, PendingSends, SyncError, TypingDebouncer,
    TypingSignal,
};
use parley_types::ApiError;
use parley_types::events::{RealtimeCommand, RealtimeEvent};
use parley_types::models::{
    MediaRef, Message, MessageContent, MessageId, MessageKind, UserId, UserProfile, UserSummary,
};

use crate::error::ClientError;

/// How often a quiet typing burst is checked for its idle timeout.
const TYPING_POLL: Duration = Duration::from_millis(250);

struct ChatState {
    profile: UserProfile,
    sync: ConversationSync,
    pending: PendingSends,
    typing: TypingDebouncer,
    /// Conversation the current local typing burst belongs to.
    typing_to: Option<UserId>,
}

impl ChatState {
    /// End the local typing burst, if any.
    fn stop_typing(&mut self) -> Option<RealtimeCommand> {
        let to = self.typing_to.take();
        self.typing
            .sent()
            .zip(to)
            .map(|(_, friend_id)| RealtimeCommand::TypingStop { friend_id })
    }
}

struct Live {
    channel: RealtimeChannel,
    pump: JoinHandle<()>,
}

struct Inner<T, S> {
    api: ApiClient<T, S>,
    clock: Arc<dyn Clock>,
    page_size: u32,
    state: Mutex<Option<ChatState>>,
    live: Mutex<Option<Live>>,
    updates: broadcast::Sender<RealtimeEvent>,
}

/// REST calls, the real-time channel and the synchronizer behind one handle.
///
/// Every mutation follows the same shape: reduce under the state lock, do
/// I/O with the lock released, reduce again with the result. The lock is
/// never held across an `.await`.
pub struct ChatClient<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for ChatClient<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S> ChatClient<T, S>
where
    T: Transport,
    S: CredentialStore,
{
    pub fn new(api: ApiClient<T, S>, clock: Arc<dyn Clock>, page_size: u32) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                api,
                clock,
                page_size: page_size.max(1),
                state: Mutex::new(None),
                live: Mutex::new(None),
                updates,
            }),
        }
    }

    pub fn api(&self) -> &ApiClient<T, S> {
        &self.inner.api
    }

    pub fn gateway(&self) -> &SessionGateway<T, S> {
        self.inner.api.gateway()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> Result<R, ClientError> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.as_mut().map(f).ok_or(ClientError::NoSession)
    }

    /// Read-only view of the synchronizer.
    pub fn read<R>(&self, f: impl FnOnce(&ConversationSync) -> R) -> Result<R, ClientError> {
        self.with_state(|state| f(&state.sync))
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.with_state(|state| state.profile.clone()).ok()
    }

    /// Unconfirmed sends for `counterpart`, oldest first.
    pub fn pending(&self, counterpart: &UserId) -> Vec<PendingMessage> {
        self.with_state(|state| state.pending.for_conversation(counterpart).cloned().collect())
            .unwrap_or_default()
    }

    /// Every real-time event, after it has been applied.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.updates.subscribe()
    }

    // -- Session --

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, ClientError> {
        let profile = match self.inner.api.login(email, password).await? {
            Some(profile) => profile,
            None => self.inner.api.profile().await?,
        };
        self.start(profile.clone());
        Ok(profile)
    }

    /// Pick up a session from the stored credential.
    pub async fn resume(&self) -> Result<UserProfile, ClientError> {
        if self.gateway().credential().is_none() {
            return Err(ClientError::NoSession);
        }
        let profile = self.inner.api.profile().await?;
        self.start(profile.clone());
        Ok(profile)
    }

    fn start(&self, profile: UserProfile) {
        let clock = Arc::clone(&self.inner.clock);
        info!("Session started for {}", profile.username);
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ChatState {
            sync: ConversationSync::new(profile.id.clone(), Arc::clone(&clock)),
            pending: PendingSends::new(Arc::clone(&clock)),
            typing: TypingDebouncer::new(clock),
            typing_to: None,
            profile,
        });
    }

    pub async fn sign_out(&self) {
        self.disconnect().await;
        self.gateway().cancel_all();
        self.inner.api.logout();
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    // -- Listings and history --

    /// Reload the conversation list and friend records.
    pub async fn refresh_listings(&self) -> Result<(), ClientError> {
        let (conversations, friends) =
            tokio::try_join!(self.inner.api.conversations(), self.inner.api.friends())?;
        debug!(
            "Listing: {} conversations, {} friends",
            conversations.len(),
            friends.len()
        );
        self.with_state(|state| {
            state.sync.set_friends(friends);
            state.sync.set_conversations(conversations);
        })
    }

    /// Open the conversation with `counterpart` and load its newest page.
    pub async fn select_conversation(&self, counterpart: UserSummary) -> Result<usize, ClientError> {
        let id = counterpart.id.clone();
        let stop = self.with_state(|state| {
            let switching = state.typing_to.as_ref().is_some_and(|to| *to != id);
            let stop = if switching { state.stop_typing() } else { None };
            state.sync.select_conversation(counterpart);
            stop
        })?;
        if let Some(command) = stop {
            self.emit(command);
        }
        self.load_history(&id, 1).await
    }

    /// Fetch `page` and merge it. A response that arrives after the user
    /// switched conversations is dropped and reported as zero messages.
    pub async fn load_history(&self, counterpart: &UserId, page: u32) -> Result<usize, ClientError> {
        let ticket = self.with_state(|state| state.sync.begin_history(counterpart, page))??;

        match self
            .inner
            .api
            .history(counterpart, ticket.page, self.inner.page_size, None)
            .await
        {
            Ok(page) => match self.with_state(|state| state.sync.apply_history(ticket, page))? {
                Ok(added) => Ok(added),
                Err(stale @ SyncError::StaleTicket { .. }) => {
                    debug!("{}", stale);
                    Ok(0)
                }
                Err(e) => Err(e.into()),
            },
            Err(e) => {
                if let Err(stale) = self.with_state(|state| state.sync.fail_history(ticket))? {
                    debug!("{}", stale);
                }
                Err(e.into())
            }
        }
    }

    /// Load the next older page if the server reported one.
    pub async fn load_more(&self, counterpart: &UserId) -> Result<usize, ClientError> {
        let next = self.with_state(|state| {
            state
                .sync
                .conversation(counterpart)
                .filter(|c| c.phase() == LoadPhase::Ready && c.has_more())
                .map(|c| c.page() + 1)
        })?;
        match next {
            Some(page) => self.load_history(counterpart, page).await,
            None => Ok(0),
        }
    }

    // -- Sending --

    pub async fn send_text(&self, counterpart: &UserId, text: &str) -> Result<Message, ClientError> {
        let placeholder = MessageContent::Text {
            body: text.to_string(),
        };
        self.send(counterpart, placeholder, self.inner.api.send_text(counterpart, text))
            .await
    }

    pub async fn send_link(&self, counterpart: &UserId, url: &str) -> Result<Message, ClientError> {
        let placeholder = MessageContent::Link {
            url: url.to_string(),
            title: None,
            description: None,
        };
        self.send(counterpart, placeholder, self.inner.api.send_link(counterpart, url))
            .await
    }

    pub async fn send_media(
        &self,
        counterpart: &UserId,
        upload: MediaUpload,
        progress: Option<Arc<UploadProgress>>,
    ) -> Result<Message, ClientError> {
        let media = MediaRef {
            url: String::new(),
            caption: None,
            file_name: Some(upload.file_name.clone()),
            file_size: Some(upload.data.len() as u64),
        };
        let placeholder = match upload.kind {
            MessageKind::Image => MessageContent::Image(media),
            MessageKind::Video => MessageContent::Video(media),
            MessageKind::Audio => MessageContent::Audio(media),
            MessageKind::Document => MessageContent::Document(media),
            other => {
                return Err(
                    ApiError::status(400, format!("{} messages are not uploads", other)).into(),
                );
            }
        };
        self.send(
            counterpart,
            placeholder,
            self.inner.api.send_media(counterpart, upload, progress),
        )
        .await
    }

    /// Show `placeholder` as pending while `request` runs, then swap it for
    /// the confirmed message or drop it.
    async fn send(
        &self,
        counterpart: &UserId,
        placeholder: MessageContent,
        request: impl Future<Output = Result<Message, ApiError>>,
    ) -> Result<Message, ClientError> {
        let (pending, stop) = self.with_state(|state| {
            let pending = state.pending.push(counterpart.clone(), placeholder);
            (pending, state.stop_typing())
        })?;
        if let Some(command) = stop {
            self.emit(command);
        }

        match request.await {
            Ok(message) => {
                self.with_state(|state| {
                    state.pending.settle(pending);
                    state.sync.confirm_send(message.clone());
                })?;
                self.emit(RealtimeCommand::SendMessage {
                    message_id: message.id.clone(),
                });
                Ok(message)
            }
            Err(e) => {
                warn!("Send to {} failed: {}", counterpart, e);
                let _ = self.with_state(|state| state.pending.fail(pending));
                Err(e.into())
            }
        }
    }

    // -- Read state and deletion --

    pub async fn mark_read(&self, message: &MessageId) -> Result<bool, ClientError> {
        self.inner.api.mark_read(message).await?;
        let changed = self.with_state(|state| state.sync.mark_read(message, None))?;
        self.emit(RealtimeCommand::MarkAsRead {
            message_id: message.clone(),
        });
        Ok(changed)
    }

    pub async fn mark_all_read(&self, counterpart: &UserId) -> Result<usize, ClientError> {
        self.inner.api.mark_all_read(counterpart).await?;
        self.with_state(|state| {
            let me = state.profile.id.clone();
            state.sync.mark_all_read(counterpart, &me, None)
        })
    }

    /// Remove the message right away and put it back if the server refuses.
    pub async fn delete_message(&self, message: &MessageId) -> Result<(), ClientError> {
        let removed = self.with_state(|state| {
            if state.sync.contains_message(message) {
                state.sync.remove_message(message)
            } else {
                None
            }
        })?;

        match self.inner.api.delete_message(message).await {
            Ok(()) => {
                if removed.is_none() {
                    self.with_state(|state| state.sync.confirm_deleted(message))?;
                }
                self.emit(RealtimeCommand::DeleteMessage {
                    message_id: message.clone(),
                });
                Ok(())
            }
            Err(e) => {
                if let Some(removed) = removed {
                    debug!("Delete of {} refused, restoring", message);
                    self.with_state(|state| state.sync.restore_message(removed))?;
                }
                Err(e.into())
            }
        }
    }

    // -- Typing --

    /// Local keystroke in the composer for `counterpart`.
    pub fn keystroke(&self, counterpart: &UserId) -> Result<(), ClientError> {
        let commands = self.with_state(|state| {
            let mut commands = Vec::new();
            if state.typing_to.as_ref() != Some(counterpart) {
                commands.extend(state.stop_typing());
                state.typing_to = Some(counterpart.clone());
            }
            if state.typing.keystroke() == Some(TypingSignal::Start) {
                commands.push(RealtimeCommand::TypingStart {
                    friend_id: counterpart.clone(),
                });
            }
            commands
        })?;
        for command in commands {
            self.emit(command);
        }
        Ok(())
    }

    /// Emit `typing-stop` once the composer has been idle long enough.
    pub fn poll_typing(&self) {
        let stop = self
            .with_state(|state| match state.typing.poll() {
                Some(TypingSignal::Stop) => state
                    .typing_to
                    .take()
                    .map(|friend_id| RealtimeCommand::TypingStop { friend_id }),
                _ => None,
            })
            .ok()
            .flatten();
        if let Some(command) = stop {
            self.emit(command);
        }
    }

    // -- Real-time --

    /// Fold one pushed event into the synchronizer and republish it.
    pub fn apply(&self, event: RealtimeEvent) -> Result<(), ClientError> {
        self.with_state(|state| match &event {
            RealtimeEvent::MessageReceived(message) => {
                if state.sync.ingest_push_message(message.clone()) {
                    let local = state.sync.local_user();
                    if let Some(settled) = state.pending.reconcile(local, message) {
                        trace!("Push echo {} settled pending send {}", message.id, settled);
                    }
                }
            }
            RealtimeEvent::MessageDeleted { message_id } => {
                state.sync.confirm_deleted(message_id);
            }
            RealtimeEvent::MessageRead {
                message_id,
                read_at,
            } => {
                let stamp = read_at.unwrap_or_else(|| state.sync.clock().now());
                state.sync.mark_read(message_id, Some(stamp));
            }
            RealtimeEvent::AllMessagesRead { reader, read_at } => {
                let stamp = read_at.unwrap_or_else(|| state.sync.clock().now());
                state.sync.mark_all_read(reader, reader, Some(stamp));
            }
            RealtimeEvent::TypingStarted { user_id, username } => {
                state.sync.set_typing(user_id, true, username.clone());
            }
            RealtimeEvent::TypingStopped { user_id } => {
                state.sync.set_typing(user_id, false, None);
            }
            RealtimeEvent::UserOnline { user_id } => state.sync.set_presence(user_id, true),
            RealtimeEvent::UserOffline { user_id } => state.sync.set_presence(user_id, false),
            RealtimeEvent::OnlineUsers(users) => state.sync.set_bulk_presence(users.iter().cloned()),
        })?;
        let _ = self.inner.updates.send(event);
        Ok(())
    }

    /// Open the real-time channel, replacing any existing one.
    pub async fn connect(&self, config: ChannelConfig) -> Result<(), ClientError> {
        self.disconnect().await;

        let gateway = self.gateway().clone();
        let tokens = move || gateway.credential().map(|c| c.access_token);
        let (channel, events) = RealtimeChannel::connect(config, tokens).await?;
        let pump = tokio::spawn(self.clone().pump(events, self.gateway().subscribe_events()));

        *self.inner.live.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Live { channel, pump });
        Ok(())
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(ChannelStatus::Disconnected, |live| live.channel.status())
    }

    /// Close the channel. No event is applied after this returns.
    pub async fn disconnect(&self) {
        let live = self
            .inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Live { channel, pump }) = live {
            channel.disconnect().await;
            if let Err(e) = pump.await {
                warn!("Event pump ended abnormally: {}", e);
            }
            info!("Real-time channel closed");
        }
    }

    fn emit(&self, command: RealtimeCommand) {
        let live = self.inner.live.lock().unwrap_or_else(PoisonError::into_inner);
        match live.as_ref() {
            Some(live) => {
                if let Err(e) = live.channel.emit(command) {
                    debug!("Dropped outbound event: {}", e);
                }
            }
            None => trace!("Offline, not sending {}", command.event_name()),
        }
    }

    async fn pump(
        self,
        mut events: mpsc::UnboundedReceiver<RealtimeEvent>,
        mut session: broadcast::Receiver<SessionEvent>,
    ) {
        let mut ticker = tokio::time::interval(TYPING_POLL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session_open = true;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.apply(event) {
                            debug!("Event ignored: {}", e);
                        }
                    }
                    None => break,
                },
                update = session.recv(), if session_open => match update {
                    Ok(SessionEvent::Terminated { reason }) => {
                        warn!("Session terminated ({}), closing real-time channel", reason);
                        // Dropping the channel cancels its task.
                        self.inner
                            .live
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Missed {} session event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => session_open = false,
                },
                _ = ticker.tick() => self.poll_typing(),
            }
        }
        debug!("Event pump stopped");
    }
}
