use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{ChatMessage, MessageId, MessageKind, PresenceEntry, ReplyPreview, UserId},
    protocol::{HandshakeUser, SendMessageRequest, ServerEvent, TypingPayload},
    rich_text::{first_text_run, plain_text_document},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod error;
pub mod message_cache;
pub mod normalizer;
pub mod presence;
pub mod store;
pub mod transport;
pub mod typing;

pub use api::{ChatApi, HttpChatApi, LocalAttachment};
pub use config::{load_settings, prepare_database_url, ClientSettings};
pub use error::{ReactionError, SendError};
pub use message_cache::{DurableMessageCache, MessageCache, NoopMessageCache};
pub use transport::{
    ConnectionState, Credentials, RealtimeTransport, ReconnectPolicy, TransportEvent,
    TransportSession,
};

use normalizer::{normalize_message, REPLY_PLACEHOLDER_TEXT};
use presence::PresenceAggregator;
use store::{merge_history, MessageStore};
use transport::TransportTypingSink;
use typing::TypingDebouncer;

/// Change notifications for screens. Payload-free; receivers
/// re-read the views they care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessagesChanged,
    PresenceChanged,
    TypingChanged,
    ConnectionChanged(bool),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: UserId,
    pub username: String,
    pub name: String,
}

impl LocalIdentity {
    fn handshake_user(&self) -> HandshakeUser {
        HandshakeUser {
            id: self.id.clone(),
            username: self.username.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub identity: LocalIdentity,
    pub token: String,
    pub history_limit: u32,
    pub typing_timeout: Duration,
}

impl SessionOptions {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        let name = if settings.display_name.trim().is_empty() {
            settings.username.clone()
        } else {
            settings.display_name.clone()
        };
        Self {
            identity: LocalIdentity {
                id: UserId::new(settings.user_id.clone()),
                username: settings.username.clone(),
                name,
            },
            token: settings.token.clone(),
            history_limit: settings.history_limit(),
            typing_timeout: settings.typing_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendIntent {
    pub text: String,
    pub attachment: Option<LocalAttachment>,
}

impl SendIntent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: LocalAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn start(&self);
    async fn send_message(&self, intent: SendIntent) -> Result<ChatMessage, SendError>;
    async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ChatMessage, ReactionError>;
    async fn set_replying_to(&self, message_id: Option<MessageId>) -> Option<ReplyPreview>;
    async fn notify_typing(&self);
    async fn logout(&self);
    async fn messages(&self) -> Vec<ChatMessage>;
    async fn members(&self) -> Vec<PresenceEntry>;
    async fn typing_users(&self) -> Vec<String>;
    async fn is_connected(&self) -> bool;
    async fn replying_to(&self) -> Option<ReplyPreview>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

struct ChatState {
    store: MessageStore,
    presence: PresenceAggregator,
    connected: bool,
    logged_out: bool,
    replying_to: Option<MessageId>,
    pending_reactions: HashMap<Uuid, MessageId>,
}

/// Owns every piece of chat state and serializes all mutations through one
/// lock. Network calls never run while the lock is held.
pub struct RealtimeClient {
    identity: LocalIdentity,
    token: String,
    history_limit: u32,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn RealtimeTransport>,
    cache: Arc<dyn MessageCache>,
    typing: TypingDebouncer,
    inner: Mutex<ChatState>,
    events: broadcast::Sender<ClientEvent>,
    persisted: watch::Sender<Vec<ChatMessage>>,
}

impl RealtimeClient {
    /// Must be called inside a tokio runtime: the persistence writer is
    /// spawned here.
    pub fn new_with_dependencies(
        options: SessionOptions,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn RealtimeTransport>,
        cache: Arc<dyn MessageCache>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (persisted, snapshots) = watch::channel(Vec::new());
        spawn_persistence_writer(Arc::clone(&cache), snapshots);

        let typing = TypingDebouncer::new(
            Arc::new(TransportTypingSink(Arc::clone(&transport))),
            options.typing_timeout,
        );

        Arc::new(Self {
            identity: options.identity,
            token: options.token,
            history_limit: options.history_limit.clamp(1, 100),
            api,
            transport,
            cache,
            typing,
            inner: Mutex::new(ChatState {
                store: MessageStore::new(),
                presence: PresenceAggregator::new(options.typing_timeout),
                connected: false,
                logged_out: false,
                replying_to: None,
                pending_reactions: HashMap::new(),
            }),
            events,
            persisted,
        })
    }

    pub async fn from_settings(settings: &ClientSettings) -> Result<Arc<Self>> {
        settings.require_identity()?;
        let cache: Arc<dyn MessageCache> =
            match prepare_database_url(&settings.database_url) {
                Ok(database_url) => match DurableMessageCache::initialize(&database_url).await {
                    Ok(cache) => Arc::new(cache),
                    Err(err) => {
                        warn!(error = %err, "message cache unavailable; continuing without persistence");
                        Arc::new(NoopMessageCache)
                    }
                },
                Err(err) => {
                    warn!(error = %err, "invalid database url; continuing without persistence");
                    Arc::new(NoopMessageCache)
                }
            };

        let api = Arc::new(HttpChatApi::new(
            settings.server_url.clone(),
            settings.token.clone(),
        ));
        let ws_url = settings
            .resolved_websocket_url()
            .context("failed to resolve websocket url")?;
        let (session, transport_events) =
            TransportSession::new(ws_url, settings.reconnect_policy());

        let client = Self::new_with_dependencies(
            SessionOptions::from_settings(settings),
            api,
            Arc::new(session),
            cache,
        );
        client.attach_transport_events(transport_events);
        Ok(client)
    }

    pub fn attach_transport_events(
        self: &Arc<Self>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                client.handle_transport_event(event).await;
            }
            debug!("transport event stream closed");
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            token: self.token.clone(),
            user: self.identity.handshake_user(),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn persist(&self, state: &ChatState) {
        self.persisted.send_replace(state.store.snapshot());
    }

    /// Restores the cached log, connects, then loads history and the
    /// directory concurrently. Fetch failures keep whatever is already shown.
    pub async fn start(self: &Arc<Self>) {
        self.inner.lock().await.logged_out = false;
        self.restore_cache().await;
        self.transport.connect(self.credentials()).await;

        let (history, directory) = tokio::join!(self.load_history(), self.load_directory());
        if let Err(err) = history {
            warn!(error = %err, "history load failed; keeping cached messages");
            self.emit(ClientEvent::Error(format!("{err:#}")));
        }
        if let Err(err) = directory {
            warn!(error = %err, "directory load failed");
            self.emit(ClientEvent::Error(format!("{err:#}")));
        }
    }

    async fn restore_cache(&self) {
        let cached = match self.cache.load().await {
            Ok(Some(cached)) => cached,
            Ok(None) => {
                debug!("no cached messages");
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to read message cache");
                return;
            }
        };

        let mut state = self.inner.lock().await;
        if !state.store.is_empty() {
            return;
        }
        state.store.seed(cached);
        info!(count = state.store.len(), "restored cached messages");
        drop(state);
        self.emit(ClientEvent::MessagesChanged);
    }

    pub async fn load_history(&self) -> Result<usize> {
        let raw = self
            .api
            .history(self.history_limit)
            .await
            .context("failed to load message history")?;
        let fresh: Vec<ChatMessage> = raw.iter().map(normalize_message).collect();

        let mut state = self.inner.lock().await;
        let merged = merge_history(fresh, state.store.messages());
        state.store.seed(merged);
        let count = state.store.len();
        self.persist(&state);
        drop(state);

        info!(count, "message history loaded");
        self.emit(ClientEvent::MessagesChanged);
        Ok(count)
    }

    pub async fn load_directory(&self) -> Result<usize> {
        let users = self
            .api
            .directory()
            .await
            .context("failed to load user directory")?;

        let mut state = self.inner.lock().await;
        state.presence.set_directory(users);
        let count = state.presence.directory().len();
        drop(state);

        debug!(count, "user directory loaded");
        self.emit(ClientEvent::PresenceChanged);
        Ok(count)
    }

    pub async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.inner.lock().await.connected = true;
                info!("chat connection established");
                self.emit(ClientEvent::ConnectionChanged(true));
            }
            TransportEvent::Disconnected => self.mark_offline().await,
            TransportEvent::Server(event) => self.handle_server_event(event).await,
        }
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(raw) => {
                let message = normalize_message(&raw);
                let message_id = message.id.clone();
                let mut state = self.inner.lock().await;
                if !state.store.append(message) {
                    debug!(%message_id, "duplicate message delivery ignored");
                    return;
                }
                self.persist(&state);
                drop(state);
                self.emit(ClientEvent::MessagesChanged);
            }
            ServerEvent::MessageUpdated(raw) => {
                let message = normalize_message(&raw);
                let message_id = message.id.clone();
                let mut state = self.inner.lock().await;
                if !state.store.replace(&message_id, message) {
                    debug!(%message_id, "update for unknown message ignored");
                    return;
                }
                self.persist(&state);
                drop(state);
                self.emit(ClientEvent::MessagesChanged);
            }
            ServerEvent::OnlineUsers(users) => {
                self.inner.lock().await.presence.replace_online(users);
                self.emit(ClientEvent::PresenceChanged);
            }
            ServerEvent::UserTyping(payload) => self.apply_typing(payload).await,
        }
    }

    async fn apply_typing(self: &Arc<Self>, payload: TypingPayload) {
        if payload.username == self.identity.username {
            return;
        }

        let now = Instant::now();
        let (changed, deadline) = {
            let mut state = self.inner.lock().await;
            let changed = state
                .presence
                .set_typing(&payload.username, payload.is_typing, now);
            (changed, state.presence.typing_deadline(&payload.username))
        };

        if let Some(deadline) = deadline {
            self.schedule_typing_expiry(deadline);
        }
        if changed {
            self.emit(ClientEvent::TypingChanged);
        }
    }

    // Peers that vanish without sending `false` still drop out of the set.
    fn schedule_typing_expiry(self: &Arc<Self>, deadline: Instant) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let pruned = client
                .inner
                .lock()
                .await
                .presence
                .prune_typing(Instant::now());
            if pruned {
                client.emit(ClientEvent::TypingChanged);
            }
        });
    }

    async fn mark_offline(&self) {
        let typing_cleared = {
            let mut state = self.inner.lock().await;
            let was_connected = std::mem::replace(&mut state.connected, false);
            if was_connected {
                info!("chat connection lost");
            }
            state.presence.clear_online();
            state.presence.clear_typing()
        };
        self.emit(ClientEvent::ConnectionChanged(false));
        self.emit(ClientEvent::PresenceChanged);
        if typing_cleared {
            self.emit(ClientEvent::TypingChanged);
        }
    }

    pub async fn send_message(&self, intent: SendIntent) -> Result<ChatMessage, SendError> {
        let reply_to = {
            let state = self.inner.lock().await;
            if state.logged_out {
                return Err(SendError::Session);
            }
            state.replying_to.clone()
        };
        let text = intent.text.trim();
        if text.is_empty() && intent.attachment.is_none() {
            return Err(SendError::Empty);
        }

        self.typing.stop().await;
        let request_id = Uuid::new_v4();

        let (kind, media_url, filename) = match &intent.attachment {
            Some(attachment) => {
                let media_url = self.api.upload(attachment).await.map_err(|err| {
                    warn!(%request_id, error = %err, "attachment upload failed; send aborted");
                    SendError::Upload(err)
                })?;
                let kind = if attachment.kind.is_media() {
                    attachment.kind
                } else {
                    MessageKind::File
                };
                (kind, Some(media_url), Some(attachment.filename.clone()))
            }
            None => (MessageKind::Text, None, None),
        };

        let request = SendMessageRequest {
            content: plain_text_document(text),
            kind,
            media_url,
            filename,
            reply_to: reply_to.clone(),
        };
        let raw = self.api.post_message(&request).await.map_err(|err| {
            warn!(%request_id, error = %err, "message submit failed");
            SendError::Submit(err)
        })?;
        let message = normalize_message(&raw);

        let appended = {
            let mut state = self.inner.lock().await;
            // A pointer re-targeted while the send was in flight is left alone.
            if state.replying_to == reply_to {
                state.replying_to = None;
            }
            let appended = state.store.append(message.clone());
            if appended {
                self.persist(&state);
            }
            appended
        };
        debug!(%request_id, message_id = %message.id, appended, "message sent");
        if appended {
            self.emit(ClientEvent::MessagesChanged);
        }
        Ok(message)
    }

    pub async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ChatMessage, ReactionError> {
        let correlation = Uuid::new_v4();
        let snapshot = {
            let mut state = self.inner.lock().await;
            if state.logged_out {
                return Err(ReactionError::Session);
            }
            let Some(current) = state.store.get(message_id) else {
                return Err(ReactionError::UnknownMessage(message_id.clone()));
            };
            let optimistic = current.with_reaction_toggled(&self.identity.id, emoji);
            let snapshot = state.store.snapshot();
            state.store.replace(message_id, optimistic);
            state
                .pending_reactions
                .insert(correlation, message_id.clone());
            self.persist(&state);
            snapshot
        };
        self.emit(ClientEvent::MessagesChanged);

        let outcome = self.api.patch_reaction(message_id, emoji).await;

        let mut state = self.inner.lock().await;
        state.pending_reactions.remove(&correlation);
        match outcome {
            Ok(raw) => {
                let mut confirmed = normalize_message(&raw);
                // An echo without an id would otherwise rekey the record to "".
                if confirmed.id.as_str().is_empty() {
                    confirmed.id = message_id.clone();
                }
                if !state.store.replace(message_id, confirmed.clone()) {
                    debug!(%message_id, "reacted message vanished before confirmation");
                }
                self.persist(&state);
                drop(state);
                self.emit(ClientEvent::MessagesChanged);
                Ok(confirmed)
            }
            Err(err) => {
                warn!(%message_id, %correlation, error = %err, "reaction failed; rolling back");
                state.store.seed(snapshot);
                self.persist(&state);
                drop(state);
                self.emit(ClientEvent::MessagesChanged);
                self.emit(ClientEvent::Error(format!("reaction failed: {err:#}")));
                Err(ReactionError::Submit(err))
            }
        }
    }

    pub async fn has_pending_reaction(&self, message_id: &MessageId) -> bool {
        self.inner
            .lock()
            .await
            .pending_reactions
            .values()
            .any(|pending| pending == message_id)
    }

    pub async fn set_replying_to(&self, message_id: Option<MessageId>) -> Option<ReplyPreview> {
        let mut state = self.inner.lock().await;
        let Some(message_id) = message_id else {
            state.replying_to = None;
            return None;
        };
        let preview = state.store.get(&message_id).map(reply_preview_for)?;
        state.replying_to = Some(message_id);
        Some(preview)
    }

    pub async fn replying_to(&self) -> Option<ReplyPreview> {
        let state = self.inner.lock().await;
        let message_id = state.replying_to.as_ref()?;
        match state.store.get(message_id) {
            Some(message) => Some(reply_preview_for(message)),
            None => Some(ReplyPreview {
                id: message_id.clone(),
                username: String::new(),
                text_preview: REPLY_PLACEHOLDER_TEXT.to_string(),
            }),
        }
    }

    pub async fn notify_typing(&self) {
        if self.inner.lock().await.logged_out {
            return;
        }
        self.typing.keystroke().await;
    }

    /// Terminal disconnect: no reconnect until [`Self::start`] runs again.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        self.mark_offline().await;
    }

    pub async fn logout(&self) {
        self.typing.stop().await;
        {
            let mut state = self.inner.lock().await;
            state.logged_out = true;
            state.replying_to = None;
        }
        self.disconnect().await;
        info!(username = %self.identity.username, "logged out");
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.store.snapshot()
    }

    pub async fn members(&self) -> Vec<PresenceEntry> {
        self.inner.lock().await.presence.members()
    }

    pub async fn typing_users(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .presence
            .typing_users(Instant::now())
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connected
    }
}

pub fn reply_preview_for(message: &ChatMessage) -> ReplyPreview {
    let username = if message.author.username.is_empty() {
        message.author.name.clone()
    } else {
        message.author.username.clone()
    };
    let text_preview = first_text_run(&message.content)
        .or_else(|| message.filename.clone())
        .unwrap_or_else(|| REPLY_PLACEHOLDER_TEXT.to_string());
    ReplyPreview {
        id: message.id.clone(),
        username,
        text_preview,
    }
}

fn spawn_persistence_writer(
    cache: Arc<dyn MessageCache>,
    mut snapshots: watch::Receiver<Vec<ChatMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Intermediate snapshots are skipped; only the newest one is written.
        while snapshots.changed().await.is_ok() {
            let messages = snapshots.borrow_and_update().clone();
            if let Err(err) = cache.save(&messages).await {
                warn!(error = %err, count = messages.len(), "failed to persist message log");
            }
        }
    })
}

#[async_trait]
impl ClientHandle for Arc<RealtimeClient> {
    async fn start(&self) {
        RealtimeClient::start(self).await
    }

    async fn send_message(&self, intent: SendIntent) -> Result<ChatMessage, SendError> {
        RealtimeClient::send_message(self, intent).await
    }

    async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<ChatMessage, ReactionError> {
        RealtimeClient::toggle_reaction(self, message_id, emoji).await
    }

    async fn set_replying_to(&self, message_id: Option<MessageId>) -> Option<ReplyPreview> {
        RealtimeClient::set_replying_to(self, message_id).await
    }

    async fn notify_typing(&self) {
        RealtimeClient::notify_typing(self).await
    }

    async fn logout(&self) {
        RealtimeClient::logout(self).await
    }

    async fn messages(&self) -> Vec<ChatMessage> {
        RealtimeClient::messages(self).await
    }

    async fn members(&self) -> Vec<PresenceEntry> {
        RealtimeClient::members(self).await
    }

    async fn typing_users(&self) -> Vec<String> {
        RealtimeClient::typing_users(self).await
    }

    async fn is_connected(&self) -> bool {
        RealtimeClient::is_connected(self).await
    }

    async fn replying_to(&self) -> Option<ReplyPreview> {
        RealtimeClient::replying_to(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
