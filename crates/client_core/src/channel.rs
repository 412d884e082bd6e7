use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use shared::{
    domain::ConversationId,
    protocol::{ChannelCommand, ChannelEvent, OutboundMessage},
};
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ClientError;

const COMMAND_QUEUE_DEPTH: usize = 64;
const NOTICE_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Remote,
    Transport(String),
    Unauthorized,
    HandshakeFailed(String),
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed(CloseReason),
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Everything the channel reports to its consumer, in arrival order: state
/// transitions travel in-band with events so the consumer never sees an
/// event after the close that ended it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    State(ChannelState),
    Event(ChannelEvent),
}

#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    pub live_root: String,
    pub conversation_id: ConversationId,
}

impl ChannelEndpoint {
    /// The access token rides in the query string: this transport has no
    /// per-message headers.
    pub fn url(&self, access_token: &str) -> Result<Url, ClientError> {
        let raw = format!(
            "{}/conversations/{}/ws",
            self.live_root.trim_end_matches('/'),
            self.conversation_id.0
        );
        let mut url = Url::parse(&raw)
            .map_err(|err| ClientError::Channel(format!("invalid live channel url: {err}")))?;
        url.query_pairs_mut().append_pair("token", access_token);
        Ok(url)
    }
}

#[derive(Clone)]
pub struct LiveChannel {
    conversation_id: ConversationId,
    state: watch::Receiver<ChannelState>,
    commands: mpsc::Sender<ChannelCommand>,
    shutdown: Arc<Notify>,
}

impl LiveChannel {
    pub fn open(
        endpoint: &ChannelEndpoint,
        access_token: &str,
    ) -> Result<(Self, mpsc::Receiver<ChannelNotice>), ClientError> {
        let url = endpoint.url(access_token)?;
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_DEPTH);
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(run_socket(
            url,
            endpoint.conversation_id,
            state_tx,
            notice_tx,
            command_rx,
            Arc::clone(&shutdown),
        ));

        Ok((
            Self {
                conversation_id: endpoint.conversation_id,
                state: state_rx,
                commands: command_tx,
                shutdown,
            },
            notice_rx,
        ))
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub async fn wait_until_settled(&self) -> ChannelState {
        let mut state = self.state.clone();
        let settled = match state
            .wait_for(|current| !matches!(current, ChannelState::Connecting))
            .await
        {
            Ok(settled) => (*settled).clone(),
            Err(_) => self.state(),
        };
        settled
    }

    /// Emits a message-creation request. Fails without sending unless the
    /// channel is `Open`; callers fall back to the REST path.
    pub async fn send_message(&self, message: OutboundMessage) -> Result<(), ClientError> {
        let state = self.state();
        if !state.is_open() {
            return Err(ClientError::Channel(format!(
                "live channel is not open ({state:?})"
            )));
        }
        self.commands
            .send(ChannelCommand::SendMessage(message))
            .await
            .map_err(|_| ClientError::Channel("live channel is closed".into()))
    }

    pub fn send_typing(&self, is_typing: bool) {
        if !self.state().is_open() {
            return;
        }
        if let Err(err) = self.commands.try_send(ChannelCommand::Typing { is_typing }) {
            debug!(%err, "channel: dropped typing update");
        }
    }

    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

async fn run_socket(
    url: Url,
    conversation_id: ConversationId,
    state_tx: watch::Sender<ChannelState>,
    notice_tx: mpsc::Sender<ChannelNotice>,
    mut commands: mpsc::Receiver<ChannelCommand>,
    shutdown: Arc<Notify>,
) {
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = shutdown.notified() => {
            publish(&state_tx, &notice_tx, ChannelState::Closed(CloseReason::Teardown)).await;
            return;
        }
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(err) => {
            warn!(conversation_id = conversation_id.0, %err, "channel: handshake failed");
            let reason = match &err {
                WsError::Http(response) if response.status().as_u16() == 401 => {
                    CloseReason::Unauthorized
                }
                _ => CloseReason::HandshakeFailed(err.to_string()),
            };
            publish(&state_tx, &notice_tx, ChannelState::Closed(reason)).await;
            return;
        }
    };

    info!(conversation_id = conversation_id.0, "channel: open");
    publish(&state_tx, &notice_tx, ChannelState::Open).await;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = ws_writer.send(WsMessage::Close(None)).await;
                break CloseReason::Teardown;
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = ws_writer.send(WsMessage::Close(None)).await;
                    break CloseReason::Teardown;
                };
                let frame = match serde_json::to_string(&command) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%err, "channel: failed to encode command");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(WsMessage::Text(frame)).await {
                    break CloseReason::Transport(err.to_string());
                }
            }
            frame = ws_reader.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ChannelEvent>(&text) {
                        Ok(event) => {
                            if notice_tx.send(ChannelNotice::Event(event)).await.is_err() {
                                let _ = ws_writer.send(WsMessage::Close(None)).await;
                                break CloseReason::Teardown;
                            }
                        }
                        Err(err) => {
                            warn!(
                                conversation_id = conversation_id.0,
                                %err,
                                "channel: skipping malformed frame"
                            );
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break CloseReason::Remote,
                Some(Ok(_)) => {}
                Some(Err(err)) => break CloseReason::Transport(err.to_string()),
            }
        }
    };

    info!(conversation_id = conversation_id.0, ?reason, "channel: closed");
    publish(&state_tx, &notice_tx, ChannelState::Closed(reason)).await;
}

async fn publish(
    state_tx: &watch::Sender<ChannelState>,
    notice_tx: &mpsc::Sender<ChannelNotice>,
    state: ChannelState,
) {
    state_tx.send_replace(state.clone());
    let _ = notice_tx.send(ChannelNotice::State(state)).await;
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
