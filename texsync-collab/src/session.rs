//! Connection-level protocol state machine.
//!
//! ```text
//!              connect()                    disconnect(reason)
//! Disconnected ─────────► Connecting ──► Connected ─────────────► Disconnected
//!                                            │
//!                              frame 0 / 7 / socket EOF
//! ```
//!
//! A [`ProtocolSession`] owns one socket. It runs two tasks:
//! - the receive loop parses frames, routes replies (code 6) to their
//!   pending requests, answers server heartbeats and forwards decoded
//!   events as [`Inbound`] items. Replies to document commands
//!   (`joinDoc`, `applyOtUpdate`) travel the inbound stream as well, so
//!   the consumer sees them in wire order relative to events;
//! - the heartbeat task writes `2::` periodically.
//!
//! Both stop on [`ProtocolSession::disconnect`], which is idempotent and
//! fails every pending request with [`CollabError::Cancelled`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{CollabError, DisconnectReason};
use crate::protocol::{ClientEvent, Command, Frame, FrameCode, ProtocolError, Reply, ServerEvent};
use crate::transport::{Socket, Transport};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Items forwarded from the receive loop.
#[derive(Debug)]
pub enum Inbound {
    /// Code 1: the server acknowledged the handshake
    Handshake,
    /// Code 5: a decoded server event
    Event(ServerEvent),
    /// Code 6 answering a document command
    Reply(OrderedReply),
}

/// A reply whose effects must be applied before any later event.
///
/// The consumer applies it, then calls [`complete`](Self::complete) to wake
/// the requester. Dropping it fails the requester with `Cancelled`.
#[derive(Debug)]
pub struct OrderedReply {
    pub command: Command,
    pub reply: Reply,
    respond: oneshot::Sender<Result<Reply, CollabError>>,
}

impl OrderedReply {
    /// Hand the reply to the requester, or `outcome`'s error instead.
    pub fn complete(self, outcome: Result<(), CollabError>) {
        let Self { reply, respond, .. } = self;
        let _ = respond.send(outcome.map(|()| reply));
    }
}

/// An outstanding command awaiting its code-6 reply.
struct PendingRequest {
    command: Command,
    reply: oneshot::Sender<Result<Reply, CollabError>>,
}

/// Completion handle returned by [`ProtocolSession::request`].
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Result<Reply, CollabError>>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply. Resolves to `Cancelled` when the session goes down.
    pub async fn wait(self) -> Result<Reply, CollabError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CollabError::Cancelled),
        }
    }
}

struct Shared {
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    reason: Mutex<Option<DisconnectReason>>,
}

/// One protocol connection. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct ProtocolSession {
    shared: Arc<Shared>,
}

impl ProtocolSession {
    /// Open a socket through `transport` and start the session tasks.
    pub async fn connect(
        transport: &dyn Transport,
        url: &str,
        cookie: &str,
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<Inbound>), CollabError> {
        log::info!("Connecting to {url}");
        let socket = transport.connect(url, cookie).await?;
        Ok(Self::attach(socket, config))
    }

    /// Start the session tasks on an already connected socket.
    pub fn attach(socket: Socket, config: &SessionConfig) -> (Self, mpsc::Receiver<Inbound>) {
        let Socket { outgoing, incoming } = socket;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));

        let session = Self {
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Connected),
                outgoing: Mutex::new(Some(outgoing)),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                reason: Mutex::new(None),
            }),
        };

        tokio::spawn(session.clone().receive_loop(incoming, inbound_tx));
        tokio::spawn(session.clone().heartbeat_loop(config.heartbeat_interval));
        (session, inbound_rx)
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Number of commands still waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Names of the commands still waiting for a reply, by id.
    pub async fn pending_commands(&self) -> Vec<(u64, &'static str)> {
        let pending = self.shared.pending.lock().await;
        let mut out: Vec<_> = pending.iter().map(|(id, p)| (*id, p.command.name())).collect();
        out.sort_unstable();
        out
    }

    /// Send `2::`.
    pub async fn heartbeat(&self) -> Result<(), CollabError> {
        self.send_frame(Frame::heartbeat()).await
    }

    /// Fire-and-forget event (`5:::{json}`).
    pub async fn emit(&self, event: ClientEvent) -> Result<(), CollabError> {
        self.send_frame(Frame::event(event.to_json().to_string())).await
    }

    /// Send a command expecting a reply (`5:{id}+::{json}`).
    ///
    /// The request is registered before the frame is written, so the reply
    /// can never outrun its registration.
    pub async fn request(&self, command: Command) -> Result<PendingReply, CollabError> {
        let payload = command.to_json().to_string();
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut pending = self.shared.pending.lock().await;
            if self.is_closed() {
                return Err(CollabError::NotConnected);
            }
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            log::debug!("Request #{id}: {}", command.name());
            pending.insert(id, PendingRequest { command, reply: tx });
            id
        };

        if let Err(e) = self.send_frame(Frame::request(id, payload)).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }
        Ok(PendingReply { id, rx })
    }

    /// Tear the session down. Returns `false` if it was already down.
    pub async fn disconnect(&self, reason: DisconnectReason) -> bool {
        {
            let mut state = self.shared.state.write().await;
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }
        *self.shared.reason.lock().await = Some(reason.clone());
        self.shared.cancel.cancel();

        // Dropping the sender ends the writer task, which closes the socket.
        self.shared.outgoing.lock().await.take();

        let pending: Vec<_> = self.shared.pending.lock().await.drain().collect();
        for (id, request) in pending {
            log::debug!("Cancelling #{id} ({})", request.command.name());
            let _ = request.reply.send(Err(CollabError::Cancelled));
        }

        log::info!("Session closed: {reason:?}");
        true
    }

    /// Resolves once the session is down, with the reason it went down.
    pub async fn closed(&self) -> DisconnectReason {
        self.shared.cancel.cancelled().await;
        self.shared
            .reason
            .lock()
            .await
            .clone()
            .unwrap_or(DisconnectReason::Requested)
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), CollabError> {
        let tx = self
            .shared
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or(CollabError::NotConnected)?;
        let text = frame.to_string();
        log::debug!("-> {text}");
        tx.send(text)
            .await
            .map_err(|_| CollabError::Transport("socket writer closed".to_string()))
    }

    async fn resolve(&self, frame: &Frame, inbound: &mpsc::Sender<Inbound>) {
        let reply = match Reply::from_frame(frame) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Bad reply frame: {e}");
                return;
            }
        };
        let pending = self.shared.pending.lock().await.remove(&reply.id);
        match pending {
            Some(request) => {
                log::debug!("Reply #{} to {}", reply.id, request.command.name());
                if request.command.is_ordered() {
                    let ordered = OrderedReply {
                        command: request.command,
                        reply,
                        respond: request.reply,
                    };
                    self.forward(inbound, Inbound::Reply(ordered)).await;
                } else {
                    let _ = request.reply.send(Ok(reply));
                }
            }
            None => log::warn!("{}", ProtocolError::UnmatchedReply(reply.id)),
        }
    }

    async fn forward(&self, inbound: &mpsc::Sender<Inbound>, item: Inbound) {
        tokio::select! {
            _ = self.shared.cancel.cancelled() => {}
            sent = inbound.send(item) => {
                if sent.is_err() {
                    log::debug!("Inbound receiver dropped; event discarded");
                }
            }
        }
    }

    async fn receive_loop(self, mut incoming: mpsc::Receiver<String>, inbound: mpsc::Sender<Inbound>) {
        let cancel = self.shared.cancel.clone();
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                raw = incoming.recv() => raw,
            };
            let Some(raw) = raw else {
                self.disconnect(DisconnectReason::TransportLost("socket closed".to_string()))
                    .await;
                break;
            };
            log::debug!("<- {raw}");

            let frame = match Frame::parse(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("{e}");
                    continue;
                }
            };

            match frame.code {
                FrameCode::Close => {
                    self.disconnect(DisconnectReason::ServerClosed).await;
                    break;
                }
                FrameCode::Unauthorized => {
                    self.disconnect(DisconnectReason::Unauthorized).await;
                    break;
                }
                FrameCode::Handshake => self.forward(&inbound, Inbound::Handshake).await,
                FrameCode::Heartbeat => {
                    if let Err(e) = self.heartbeat().await {
                        log::warn!("Heartbeat reply failed: {e}");
                    }
                }
                FrameCode::Reply => self.resolve(&frame, &inbound).await,
                FrameCode::Event => match ServerEvent::parse(&frame.payload) {
                    Ok(event) => self.forward(&inbound, Inbound::Event(event)).await,
                    Err(e) => log::warn!("Ignoring event: {e}"),
                },
            }
        }
        log::debug!("Receive loop exited");
    }

    async fn heartbeat_loop(self, period: Duration) {
        let cancel = self.shared.cancel.clone();
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.heartbeat().await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
