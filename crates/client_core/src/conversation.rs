use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId, ParticipantId},
    protocol::{Attachment, ChannelEvent, MarkReadResponse, Message, OutboundMessage, ReadEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelEndpoint, ChannelNotice, ChannelState, CloseReason, LiveChannel},
    config::ReconnectSettings,
    error::ClientError,
    gateway::{ApiResponse, Gateway, RequestDescriptor},
    history::HistoryLoader,
    session::SessionContext,
    timeline::{Timeline, TimelineChange},
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    TimelineUpdated,
    TypingChanged(Vec<ParticipantId>),
    ChannelStateChanged(ChannelState),
    HistoryLoaded { count: usize },
    ReadReceiptsDropped(Vec<ReadEvent>),
    Error(String),
}

pub(crate) struct ViewDependencies {
    pub session: Arc<SessionContext>,
    pub gateway: Arc<Gateway>,
    pub history: HistoryLoader,
    pub live_root: String,
    pub reconnect: ReconnectSettings,
    pub pending_read_ttl: std::time::Duration,
}

struct ViewShared {
    conversation_id: ConversationId,
    session: Arc<SessionContext>,
    gateway: Arc<Gateway>,
    history: HistoryLoader,
    endpoint: ChannelEndpoint,
    reconnect: ReconnectSettings,
    timeline: Mutex<Timeline>,
    channel: Mutex<Option<LiveChannel>>,
    load_generation: AtomicU64,
    closed: AtomicBool,
    events: broadcast::Sender<ConversationEvent>,
}

pub struct ConversationView {
    shared: Arc<ViewShared>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConversationView {
    pub(crate) async fn open(
        deps: ViewDependencies,
        conversation_id: ConversationId,
    ) -> Result<Self, ClientError> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(ViewShared {
            conversation_id,
            session: deps.session,
            gateway: deps.gateway,
            history: deps.history,
            endpoint: ChannelEndpoint {
                live_root: deps.live_root,
                conversation_id,
            },
            reconnect: deps.reconnect,
            timeline: Mutex::new(Timeline::new(conversation_id, deps.pending_read_ttl)),
            channel: Mutex::new(None),
            load_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events,
        });

        let (notices, access_token) = shared.connect().await?;
        shared.spawn_history_load();
        let driver = tokio::spawn(drive(Arc::clone(&shared), notices, access_token));
        info!(conversation_id = conversation_id.0, "conversation: opened");

        Ok(Self {
            shared,
            driver: std::sync::Mutex::new(Some(driver)),
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.shared.conversation_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.shared.events.subscribe()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.shared.timeline.lock().await.messages()
    }

    pub async fn message(&self, id: MessageId) -> Option<Message> {
        self.shared.timeline.lock().await.get(&id).cloned()
    }

    pub async fn typing_participants(&self) -> Vec<ParticipantId> {
        self.shared.timeline.lock().await.typing_participants()
    }

    pub async fn pending_read_count(&self) -> usize {
        self.shared.timeline.lock().await.pending_read_count()
    }

    pub async fn unconfirmed(&self) -> Vec<Message> {
        self.shared.timeline.lock().await.unconfirmed()
    }

    pub async fn failed(&self) -> Vec<Message> {
        self.shared.timeline.lock().await.failed()
    }

    pub async fn channel_state(&self) -> ChannelState {
        match self.shared.channel.lock().await.as_ref() {
            Some(channel) => channel.state(),
            None => ChannelState::Closed(CloseReason::Teardown),
        }
    }

    pub async fn wait_for_channel(&self) -> ChannelState {
        let channel = self.shared.channel.lock().await.clone();
        match channel {
            Some(channel) => channel.wait_until_settled().await,
            None => ChannelState::Closed(CloseReason::Teardown),
        }
    }

    pub fn reload_history(&self) {
        self.shared.spawn_history_load();
    }

    /// Shows the message immediately, then delivers it over the live channel
    /// when it is open and through the REST endpoint otherwise.
    pub async fn send_message(
        &self,
        body: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message, ClientError> {
        let identity = self
            .shared
            .session
            .identity()
            .await
            .ok_or_else(|| ClientError::Auth("not logged in".into()))?;

        let message = Message {
            id: MessageId::new(),
            conversation_id: self.shared.conversation_id,
            sender: Some(identity.participant_id),
            body: body.into(),
            attachments,
            created_at: Utc::now(),
            edited_at: None,
            receipts: Vec::new(),
        };

        let change = self
            .shared
            .timeline
            .lock()
            .await
            .insert_local(message.clone());
        self.shared.publish_change(change, Vec::new());

        let outbound = OutboundMessage::from(&message);
        let channel = self.shared.channel.lock().await.clone();
        let sent_live = match channel {
            Some(channel) if channel.state().is_open() => {
                match channel.send_message(outbound.clone()).await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(%err, "conversation: live send refused");
                        false
                    }
                }
            }
            _ => false,
        };

        if !sent_live {
            info!(
                conversation_id = self.shared.conversation_id.0,
                message_id = %message.id,
                "conversation: live channel not open, sending over rest"
            );
            if let Err(err) = self.shared.post_fallback(&outbound).await {
                let change = self.shared.timeline.lock().await.mark_failed(message.id);
                self.shared.publish_change(change, Vec::new());
                return Err(err);
            }
        }

        Ok(message)
    }

    pub async fn send_typing(&self, is_typing: bool) {
        if let Some(channel) = self.shared.channel.lock().await.as_ref() {
            channel.send_typing(is_typing);
        }
    }

    pub async fn mark_read(&self, message_id: MessageId) -> Result<(), ClientError> {
        let identity = self
            .shared
            .session
            .identity()
            .await
            .ok_or_else(|| ClientError::Auth("not logged in".into()))?;
        let request = RequestDescriptor::post(format!(
            "/conversations/{}/messages/{}/read",
            self.shared.conversation_id.0, message_id
        ));
        let read_at = match self.shared.gateway.execute(&request, true).await? {
            ApiResponse::Body(value) => match serde_json::from_value::<MarkReadResponse>(value) {
                Ok(response) => response.read_at,
                Err(err) => {
                    debug!(%err, "conversation: unreadable mark-read response, using local time");
                    None
                }
            },
            ApiResponse::Empty => None,
        }
        .unwrap_or_else(Utc::now);

        let change = self.shared.timeline.lock().await.apply_read(
            ReadEvent {
                message_id,
                participant: identity.participant_id,
                read_at,
            },
            Instant::now(),
        );
        self.shared.publish_change(change, Vec::new());
        Ok(())
    }

    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.load_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = self.shared.channel.lock().await.take() {
            channel.close();
        }
        if let Some(driver) = self.take_driver() {
            driver.abort();
        }
        let change = self.shared.timeline.lock().await.channel_closed();
        self.shared.publish_change(change, Vec::new());
        let _ = self
            .shared
            .events
            .send(ConversationEvent::ChannelStateChanged(ChannelState::Closed(
                CloseReason::Teardown,
            )));
        info!(
            conversation_id = self.shared.conversation_id.0,
            "conversation: closed"
        );
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        match self.driver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.load_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(driver) = self.take_driver() {
            driver.abort();
        }
        if let Ok(channel) = self.shared.channel.try_lock() {
            if let Some(channel) = channel.as_ref() {
                channel.close();
            }
        }
    }
}

impl ViewShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(mpsc::Receiver<ChannelNotice>, String), ClientError> {
        let access_token = self
            .session
            .access_token()
            .await
            .ok_or_else(|| ClientError::Auth("not logged in".into()))?;
        let (channel, notices) = LiveChannel::open(&self.endpoint, &access_token)?;
        *self.channel.lock().await = Some(channel);
        Ok((notices, access_token))
    }

    fn spawn_history_load(self: &Arc<Self>) {
        let generation = self.load_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = shared.history.load(shared.conversation_id).await;
            let mut timeline = shared.timeline.lock().await;
            if shared.is_closed() || shared.load_generation.load(Ordering::SeqCst) != generation {
                debug!(
                    conversation_id = shared.conversation_id.0,
                    generation, "conversation: discarding stale history result"
                );
                return;
            }
            match result {
                Ok(messages) => {
                    let count = messages.len();
                    let change = timeline.seed_history(messages);
                    let expired = timeline.expire_pending_reads(Instant::now());
                    drop(timeline);
                    let _ = shared
                        .events
                        .send(ConversationEvent::HistoryLoaded { count });
                    shared.publish_change(change, expired);
                }
                Err(err) => {
                    drop(timeline);
                    warn!(
                        conversation_id = shared.conversation_id.0,
                        %err,
                        "conversation: history load failed"
                    );
                    let _ = shared
                        .events
                        .send(ConversationEvent::Error(format!("history load failed: {err}")));
                }
            }
        });
    }

    async fn apply_notice_event(&self, event: ChannelEvent) {
        let now = Instant::now();
        let mut timeline = self.timeline.lock().await;
        let change = timeline.apply_event(event, now);
        let expired = timeline.expire_pending_reads(now);
        let typing = change.typing.then(|| timeline.typing_participants());
        drop(timeline);
        self.publish_change(change, expired);
        if let Some(typing) = typing {
            let _ = self.events.send(ConversationEvent::TypingChanged(typing));
        }
    }

    async fn on_channel_closed(&self) {
        let change = self.timeline.lock().await.channel_closed();
        if change.typing {
            let _ = self.events.send(ConversationEvent::TypingChanged(Vec::new()));
        }
    }

    fn publish_change(&self, change: TimelineChange, expired: Vec<ReadEvent>) {
        if change.messages || change.receipts {
            let _ = self.events.send(ConversationEvent::TimelineUpdated);
        }
        if !expired.is_empty() {
            warn!(
                conversation_id = self.conversation_id.0,
                count = expired.len(),
                "conversation: dropping read receipts whose message never arrived"
            );
            let _ = self
                .events
                .send(ConversationEvent::ReadReceiptsDropped(expired));
        }
    }

    async fn post_fallback(&self, outbound: &OutboundMessage) -> Result<(), ClientError> {
        let request = RequestDescriptor::post(format!(
            "/conversations/{}/messages",
            self.conversation_id.0
        ))
        .json(outbound)?;
        match self.gateway.execute(&request, true).await? {
            ApiResponse::Body(value) => {
                let confirmed: Message = serde_json::from_value(value)
                    .map_err(|err| ClientError::Decode(err.to_string()))?;
                let change = self.timeline.lock().await.apply_server_message(confirmed);
                self.publish_change(change, Vec::new());
            }
            ApiResponse::Empty => {}
        }
        Ok(())
    }

    /// Messages written to a socket that then dropped may never have reached
    /// the server; the server keys messages by client id, so posting them
    /// again is safe.
    async fn resend_unconfirmed(&self) {
        let pending = self.timeline.lock().await.unconfirmed();
        for message in pending {
            let outbound = OutboundMessage::from(&message);
            if let Err(err) = self.post_fallback(&outbound).await {
                warn!(
                    conversation_id = self.conversation_id.0,
                    message_id = %message.id,
                    %err,
                    "conversation: resend after disconnect failed"
                );
                let change = self.timeline.lock().await.mark_failed(message.id);
                self.publish_change(change, Vec::new());
                let _ = self.events.send(ConversationEvent::Error(format!(
                    "message {} may not have been delivered: {err}",
                    message.id
                )));
            }
        }
    }
}

async fn drive(
    shared: Arc<ViewShared>,
    mut notices: mpsc::Receiver<ChannelNotice>,
    mut access_token: String,
) {
    let mut attempt: u32 = 0;
    let mut resync = false;

    loop {
        let mut close_reason = None;
        while let Some(notice) = notices.recv().await {
            match notice {
                ChannelNotice::Event(event) => shared.apply_notice_event(event).await,
                ChannelNotice::State(state) => {
                    let _ = shared
                        .events
                        .send(ConversationEvent::ChannelStateChanged(state.clone()));
                    match state {
                        ChannelState::Connecting => {}
                        ChannelState::Open => {
                            attempt = 0;
                            if resync {
                                shared.spawn_history_load();
                            }
                        }
                        ChannelState::Closed(reason) => {
                            shared.on_channel_closed().await;
                            close_reason = Some(reason);
                            break;
                        }
                    }
                }
            }
        }

        let reason = close_reason
            .unwrap_or_else(|| CloseReason::Transport("channel task ended".into()));
        if shared.is_closed() || reason == CloseReason::Teardown {
            return;
        }

        shared.resend_unconfirmed().await;

        let Some(delay) = shared.reconnect.delay_for(attempt) else {
            warn!(
                conversation_id = shared.conversation_id.0,
                ?reason,
                "conversation: live channel closed, not reconnecting"
            );
            let _ = shared.events.send(ConversationEvent::Error(format!(
                "live channel closed: {reason:?}"
            )));
            return;
        };
        attempt += 1;
        info!(
            conversation_id = shared.conversation_id.0,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "conversation: reconnecting live channel"
        );
        tokio::time::sleep(delay).await;
        if shared.is_closed() {
            return;
        }

        if reason == CloseReason::Unauthorized {
            if let Err(err) = shared
                .gateway
                .refresher()
                .refresh_after_rejection(&access_token)
                .await
            {
                warn!(
                    conversation_id = shared.conversation_id.0,
                    %err,
                    "conversation: live channel credentials could not be renewed"
                );
                let _ = shared.events.send(ConversationEvent::Error(format!(
                    "live channel rejected credentials: {err}"
                )));
                return;
            }
        }

        match shared.connect().await {
            Ok((next, token)) => {
                notices = next;
                access_token = token;
                resync = true;
            }
            Err(err) => {
                warn!(
                    conversation_id = shared.conversation_id.0,
                    %err,
                    "conversation: reconnect failed"
                );
                let _ = shared
                    .events
                    .send(ConversationEvent::Error(format!("reconnect failed: {err}")));
                return;
            }
        }
    }
}
