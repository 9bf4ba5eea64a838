//! Persistent connection to the chat server.
//!
//! One background task owns the websocket. It performs the handshake, pumps
//! inbound frames into [`TransportEvent`]s and reconnects with jittered
//! exponential backoff until [`TransportSession::disconnect`] is called.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::protocol::{ClientFrame, Handshake, HandshakeUser, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::typing::TypingSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user: HandshakeUser,
}

impl Credentials {
    fn handshake(&self) -> ClientFrame {
        ClientFrame::Auth(Handshake {
            token: self.token.clone(),
            user: self.user.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Server(ServerEvent),
}

/// Full-jitter exponential backoff: attempt `n` sleeps a random duration in
/// `[0, min(max_delay, initial_delay * 2^n)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, credentials: Credentials);
    async fn disconnect(&self);
    /// Writes a frame if connected. Frames are never queued for later.
    async fn send(&self, frame: ClientFrame) -> bool;
    fn state(&self) -> ConnectionState;
}

pub struct TransportTypingSink(pub Arc<dyn RealtimeTransport>);

#[async_trait]
impl TypingSink for TransportTypingSink {
    async fn send_typing(&self, is_typing: bool) -> bool {
        self.0.send(ClientFrame::Typing(is_typing)).await
    }
}

struct ActiveSession {
    credentials: Credentials,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    task: JoinHandle<()>,
}

pub struct TransportSession {
    url: String,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    session: Mutex<Option<ActiveSession>>,
}

impl TransportSession {
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                url: url.into(),
                policy,
                events,
                state: Arc::new(state),
                session: Mutex::new(None),
            },
            events_rx,
        )
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[async_trait]
impl RealtimeTransport for TransportSession {
    async fn connect(&self, credentials: Credentials) {
        let mut guard = self.session.lock().await;
        if let Some(active) = guard.as_ref() {
            if active.credentials == credentials && !active.task.is_finished() {
                debug!("transport: connect ignored, session already running");
                return;
            }
        }
        if let Some(previous) = guard.take() {
            previous.task.abort();
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            self.url.clone(),
            self.policy,
            credentials.clone(),
            outbound_rx,
            self.events.clone(),
            Arc::clone(&self.state),
        ));
        *guard = Some(ActiveSession {
            credentials,
            outbound,
            task,
        });
    }

    async fn disconnect(&self) {
        let Some(active) = self.session.lock().await.take() else {
            return;
        };
        active.task.abort();
        // The task may be mid-poll on another worker; let it finish unwinding
        // before publishing the final state.
        let _ = active.task.await;
        let was_connected = self.state.send_replace(ConnectionState::Disconnected)
            == ConnectionState::Connected;
        if was_connected {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
        info!("transport: disconnected by caller");
    }

    async fn send(&self, frame: ClientFrame) -> bool {
        if *self.state.borrow() != ConnectionState::Connected {
            return false;
        }
        match self.session.lock().await.as_ref() {
            Some(active) => active.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

async fn run_session(
    url: String,
    policy: ReconnectPolicy,
    credentials: Credentials,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut attempt: u32 = 0;
    loop {
        state.send_replace(ConnectionState::Connecting);
        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                match serve_connection(ws_stream, &credentials, &mut outbound, &events, &state).await
                {
                    Ok(()) => {
                        attempt = 0;
                        warn!(url = %url, "transport: connection dropped");
                    }
                    Err(err) => warn!(url = %url, error = %err, "transport: handshake failed"),
                }
            }
            Err(err) => {
                warn!(url = %url, attempt, error = %err, "transport: connect failed");
            }
        }

        state.send_replace(ConnectionState::Disconnected);
        let delay = policy.delay_for(attempt, &mut rand::thread_rng());
        attempt = attempt.saturating_add(1);
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "transport: scheduling reconnect"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Runs one established connection until it drops.
///
/// Returns `Err` only if the handshake could not be written, in which case
/// the session never reported itself connected.
async fn serve_connection(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    credentials: &Credentials,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    state: &watch::Sender<ConnectionState>,
) -> Result<()> {
    let (mut writer, mut reader) = ws_stream.split();
    let handshake = encode_frame(&credentials.handshake())?;
    writer
        .send(Message::Text(handshake))
        .await
        .context("failed to write handshake")?;

    // frames queued while offline are stale
    while outbound.try_recv().is_ok() {}
    state.send_replace(ConnectionState::Connected);
    let _ = events.send(TransportEvent::Connected);
    info!("transport: connected");

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let text = match encode_frame(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "transport: dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    warn!(error = %err, "transport: write failed");
                    break;
                }
            }
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        let _ = events.send(TransportEvent::Server(event));
                    }
                    Err(err) => warn!(error = %err, "transport: invalid server event"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "transport: receive failed");
                    break;
                }
            },
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    let _ = events.send(TransportEvent::Disconnected);
    Ok(())
}

fn encode_frame(frame: &ClientFrame) -> Result<String> {
    serde_json::to_string(frame).context("failed to encode client frame")
}

pub fn websocket_url(server_url: &str) -> Result<String> {
    let mut url = Url::parse(server_url)
        .with_context(|| format!("invalid server url '{server_url}'"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("server_url must be http:// or https://, got {other}://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch '{server_url}' to {scheme}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
