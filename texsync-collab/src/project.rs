//! Project-level orchestration.
//!
//! ```text
//!                     ┌──────────── ProjectSession ─────────────┐
//!  ProjectApi ──HTTP──┤ listing, pending comments, cursors      │
//!                     │                                         │
//!  socket ─► Protocol ─► dispatch loop ─► documents (Mutex each) ├─► SurfaceEvent
//!            Session  ◄─ flight tasks  ◄─ drain loop ◄─ OpQueue ◄── send_local_edit
//!                     └─────────────────────────────────────────┘
//! ```
//!
//! One connection ("link") at a time. Tearing it down, for whatever reason,
//! goes through a single path that cancels the loops, deactivates every open
//! document exactly once and publishes a status line.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use texsync_core::Op;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::api::{CompileOutcome, HttpProjectApi, ProjectApi, ThreadAction, ThreadListing, ThreadMessage, ThreadRecord};
use crate::config::{Credentials, SessionConfig};
use crate::document::Document;
use crate::error::{CollabError, DisconnectReason};
use crate::ids;
use crate::presence::{CursorTracker, RemoteCursor};
use crate::protocol::{
    ClientEvent, Command, ConnectedUser, CursorUpdate, JoinDocReply, JoinProjectReply, OutboundUpdate, RemoteUpdate,
    Reply, ServerEvent, ThreadEventKind,
};
use crate::queue::{OpQueue, OpSender, OutboundBatch, QueuedEdit};
use crate::session::{ConnectionState, Inbound, OrderedReply, ProtocolSession};
use crate::surface::{HighlightKind, SurfaceEvent, TextRange};
use crate::transport::{Transport, WebSocketTransport};

#[derive(Debug, Clone, PartialEq)]
enum JoinState {
    Pending,
    Joined,
    Down(DisconnectReason),
}

/// The live connection and the loops hanging off it.
struct Link {
    protocol: ProtocolSession,
    ops: OpSender,
    cancel: CancellationToken,
}

/// A comment created locally whose anchor op has not been acknowledged yet.
#[derive(Debug, Clone)]
struct PendingComment {
    doc_id: String,
    pos: usize,
    text: String,
    published: bool,
}

struct ProjectInner {
    project_id: String,
    credentials: Credentials,
    config: SessionConfig,
    api: Arc<dyn ProjectApi>,
    transport: Arc<dyn Transport>,
    surface: mpsc::UnboundedSender<SurfaceEvent>,
    state: RwLock<ConnectionState>,
    link: RwLock<Option<Link>>,
    documents: Mutex<HashMap<String, Arc<Mutex<Document>>>>,
    listing: Mutex<ThreadListing>,
    pending_comments: Mutex<HashMap<String, PendingComment>>,
    cursors: Mutex<CursorTracker>,
    project: RwLock<Option<JoinProjectReply>>,
    joined: watch::Sender<JoinState>,
    track_changes: AtomicBool,
    comment_counter: AtomicU32,
}

/// Synchronization session for one project. Cheap to clone.
#[derive(Clone)]
pub struct ProjectSession {
    inner: Arc<ProjectInner>,
}

impl ProjectSession {
    pub fn new(
        project_id: impl Into<String>,
        credentials: Credentials,
        config: SessionConfig,
        api: Arc<dyn ProjectApi>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let (surface, events) = mpsc::unbounded_channel();
        let (joined, _) = watch::channel(JoinState::Pending);
        let inner = ProjectInner {
            project_id: project_id.into(),
            credentials,
            track_changes: AtomicBool::new(config.track_changes),
            config,
            api,
            transport,
            surface,
            state: RwLock::new(ConnectionState::Disconnected),
            link: RwLock::new(None),
            documents: Mutex::new(HashMap::new()),
            listing: Mutex::new(ThreadListing::new()),
            pending_comments: Mutex::new(HashMap::new()),
            cursors: Mutex::new(CursorTracker::new()),
            project: RwLock::new(None),
            joined,
            comment_counter: AtomicU32::new(0),
        };
        (Self { inner: Arc::new(inner) }, events)
    }

    /// Session talking to a real server over HTTP and WebSocket.
    pub fn over_http(
        project_id: impl Into<String>,
        credentials: Credentials,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let project_id = project_id.into();
        let api = Arc::new(HttpProjectApi::new(credentials.clone(), project_id.clone()));
        let transport = Arc::new(WebSocketTransport::new(config.inbound_capacity));
        Self::new(project_id, credentials, config, api, transport)
    }

    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn project_name(&self) -> Option<String> {
        let project = self.inner.project.read().await;
        project.as_ref().and_then(|p| p.name()).map(str::to_owned)
    }

    pub async fn root_doc_id(&self) -> Option<String> {
        let project = self.inner.project.read().await;
        project.as_ref().and_then(|p| p.root_doc_id()).map(str::to_owned)
    }

    /// Our id as seen by other collaborators.
    pub async fn public_id(&self) -> Option<String> {
        self.inner.cursors.lock().await.local_id().map(str::to_owned)
    }

    pub fn set_track_changes(&self, enabled: bool) {
        self.inner.track_changes.store(enabled, Ordering::Relaxed);
    }

    pub async fn open_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.documents.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn document_lines(&self, doc_id: &str) -> Option<Vec<String>> {
        let doc = self.document(doc_id).await.ok()?;
        let lines = doc.lock().await.lines().to_vec();
        Some(lines)
    }

    pub async fn document_version(&self, doc_id: &str) -> Option<u64> {
        let doc = self.document(doc_id).await.ok()?;
        let version = doc.lock().await.version();
        Some(version)
    }

    /// Snapshot of the comment threads.
    pub async fn threads(&self) -> ThreadListing {
        self.inner.listing.lock().await.clone()
    }

    // ───────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ───────────────────────────────────────────────────────────────

    /// Open the socket. The project is joined in the background once the
    /// server accepts the connection; see [`wait_until_joined`](Self::wait_until_joined).
    pub async fn connect(&self) -> Result<(), CollabError> {
        {
            let mut state = self.inner.state.write().await;
            if matches!(*state, ConnectionState::Connected | ConnectionState::Connecting) {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.joined.send_replace(JoinState::Pending);
        self.status("Connecting...");

        if let Err(e) = self.open_link().await {
            log::warn!("Connecting project {} failed: {e}", self.inner.project_id);
            *self.inner.state.write().await = ConnectionState::Disconnected;
            let reason = DisconnectReason::TransportLost(e.to_string());
            self.status(reason.status_text());
            self.inner.joined.send_replace(JoinState::Down(reason));
            return Err(e);
        }
        Ok(())
    }

    /// Resolves once `joinProject` succeeded, or fails when the session
    /// goes down first or `join_timeout` passes.
    pub async fn wait_until_joined(&self) -> Result<(), CollabError> {
        let limit = self.inner.config.join_timeout;
        let mut joined = self.inner.joined.subscribe();
        let state = match timeout(limit, joined.wait_for(|state| *state != JoinState::Pending)).await {
            Err(_) => return Err(CollabError::AckTimeout(limit)),
            Ok(Err(_)) => return Err(CollabError::Cancelled),
            Ok(Ok(state)) => state.clone(),
        };
        match state {
            JoinState::Joined => Ok(()),
            JoinState::Down(reason) => Err(CollabError::Disconnected(reason)),
            JoinState::Pending => Err(CollabError::Cancelled),
        }
    }

    pub async fn disconnect(&self) {
        self.disconnect_with(DisconnectReason::Requested).await;
    }

    /// Drop the current connection (if any) and open a fresh one.
    pub async fn reconnect(&self) -> Result<(), CollabError> {
        self.disconnect_with(DisconnectReason::Requested).await;
        *self.inner.state.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    async fn open_link(&self) -> Result<(), CollabError> {
        let url = self.inner.api.socket_url().await?;
        self.refresh_threads().await;

        let (protocol, inbound) = ProtocolSession::connect(
            self.inner.transport.as_ref(),
            &url,
            &self.inner.credentials.cookie,
            &self.inner.config,
        )
        .await?;

        let queue = OpQueue::new();
        let cancel = CancellationToken::new();
        *self.inner.link.write().await = Some(Link {
            protocol: protocol.clone(),
            ops: queue.sender(),
            cancel: cancel.clone(),
        });
        *self.inner.state.write().await = ConnectionState::Connected;

        tokio::spawn(self.clone().dispatch_loop(protocol.clone(), inbound, cancel.clone()));
        tokio::spawn(self.clone().drain_loop(protocol, queue, cancel));
        Ok(())
    }

    /// The one teardown path. Idempotent per link.
    async fn disconnect_with(&self, reason: DisconnectReason) {
        let Some(link) = self.inner.link.write().await.take() else {
            return;
        };
        link.cancel.cancel();
        link.protocol.disconnect(reason.clone()).await;
        *self.inner.state.write().await = ConnectionState::Disconnected;
        self.inner.joined.send_replace(JoinState::Down(reason.clone()));

        let documents: Vec<(String, Arc<Mutex<Document>>)> = self.inner.documents.lock().await.drain().collect();
        for (doc_id, doc) in &documents {
            self.deactivate(doc_id, doc).await;
        }
        self.inner.pending_comments.lock().await.clear();
        let peers = self.inner.cursors.lock().await.clear();
        for client_id in peers {
            self.emit(SurfaceEvent::ClearRemoteCursor { client_id });
        }

        log::info!("Project {} disconnected: {reason:?}", self.inner.project_id);
        self.status(reason.status_text());
    }

    async fn link_parts(&self) -> Result<(ProtocolSession, OpSender), CollabError> {
        self.inner
            .link
            .read()
            .await
            .as_ref()
            .map(|link| (link.protocol.clone(), link.ops.clone()))
            .ok_or(CollabError::NotConnected)
    }

    /// Request with the join deadline; error replies become `ServerRejection`.
    async fn call(&self, protocol: &ProtocolSession, command: Command) -> Result<Reply, CollabError> {
        let name = command.name();
        let limit = self.inner.config.join_timeout;
        let pending = protocol.request(command).await?;
        let reply = timeout(limit, pending.wait())
            .await
            .map_err(|_| CollabError::AckTimeout(limit))??;
        match reply.error() {
            Some(err) => Err(CollabError::ServerRejection(format!("{name}: {err}"))),
            None => Ok(reply),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Inbound events
    // ───────────────────────────────────────────────────────────────

    async fn dispatch_loop(self, protocol: ProtocolSession, mut inbound: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = inbound.recv() => item,
            };
            match item {
                Some(Inbound::Handshake) => log::debug!("Handshake acknowledged"),
                Some(Inbound::Event(event)) => self.handle_event(&protocol, event).await,
                Some(Inbound::Reply(ordered)) => self.handle_reply(&protocol, &cancel, ordered).await,
                None => {
                    let reason = protocol.closed().await;
                    if !cancel.is_cancelled() {
                        self.disconnect_with(reason).await;
                    }
                    break;
                }
            }
        }
        log::debug!("Dispatch loop exited");
    }

    async fn handle_event(&self, protocol: &ProtocolSession, event: ServerEvent) {
        match event {
            ServerEvent::ConnectionAccepted { public_id } => {
                log::info!("Connection accepted as {public_id:?}");
                self.inner.cursors.lock().await.set_local_id(public_id);
                tokio::spawn(self.clone().join_project(protocol.clone()));
            }
            ServerEvent::ConnectionRejected { reason } => {
                self.disconnect_with(DisconnectReason::Rejected(reason)).await;
            }
            ServerEvent::ForceDisconnect { reason } => {
                self.disconnect_with(DisconnectReason::ForceDisconnect(reason)).await;
            }
            ServerEvent::OtUpdateError { message } => {
                log::error!("Server refused an update: {message}");
                self.disconnect_with(DisconnectReason::UpdateError(message)).await;
            }
            ServerEvent::BroadcastDocMeta => log::debug!("Ignoring broadcastDocMeta"),
            ServerEvent::ClientUpdated(updates) => {
                for update in updates {
                    self.update_cursor(update).await;
                }
            }
            ServerEvent::ClientDisconnected(client_ids) => {
                for client_id in client_ids {
                    self.inner.cursors.lock().await.remove(&client_id);
                    self.emit(SurfaceEvent::ClearRemoteCursor { client_id });
                }
            }
            ServerEvent::OtUpdateApplied(updates) => {
                for update in updates {
                    self.apply_remote_update(update).await;
                }
            }
            ServerEvent::ThreadChanged { kind, thread_id } => self.thread_changed(kind, thread_id).await,
        }
    }

    /// Apply a `joinDoc` or `applyOtUpdate` reply in wire order, then wake
    /// whoever sent the command.
    async fn handle_reply(&self, protocol: &ProtocolSession, cancel: &CancellationToken, ordered: OrderedReply) {
        if ordered.reply.error().is_some() {
            // The requester turns it into a rejection or a disconnect
            ordered.complete(Ok(()));
            return;
        }
        let outcome = match &ordered.command {
            Command::JoinDoc { doc_id } => self.load_document(doc_id, &ordered.reply).await,
            Command::ApplyOtUpdate { doc_id, update } => {
                self.acknowledge(protocol, cancel, doc_id, ordered.reply.id, &update.op)
                    .await
            }
            other => {
                log::debug!("No ordered handling for {}", other.name());
                Ok(())
            }
        };
        ordered.complete(outcome);
    }

    async fn join_project(self, protocol: ProtocolSession) {
        let command = Command::JoinProject {
            project_id: self.inner.project_id.clone(),
        };
        let joined = self
            .call(&protocol, command)
            .await
            .and_then(|reply| Ok(JoinProjectReply::from_reply(&reply)?));
        let project = match joined {
            Ok(project) => project,
            Err(CollabError::Cancelled) => return,
            Err(e) => {
                log::error!("joinProject failed: {e}");
                if !protocol.is_closed() {
                    self.disconnect_with(DisconnectReason::Rejected(e.to_string())).await;
                }
                return;
            }
        };

        log::info!(
            "Joined project {}",
            project.name().unwrap_or(self.inner.project_id.as_str())
        );
        *self.inner.project.write().await = Some(project);
        self.status("Connected");
        self.inner.joined.send_replace(JoinState::Joined);

        let users = self
            .call(&protocol, Command::GetConnectedUsers)
            .await
            .and_then(|reply| Ok(reply.arg_or_default::<Vec<ConnectedUser>>(1)?));
        match users {
            Ok(users) => {
                log::debug!("{} collaborator(s) connected", users.len());
                for user in users {
                    self.update_cursor(user.into_cursor_update()).await;
                }
            }
            Err(e) => log::warn!("Could not list connected users: {e}"),
        }
    }

    async fn apply_remote_update(&self, update: RemoteUpdate) {
        let doc_id = update.doc.clone();
        let Ok(doc) = self.document(&doc_id).await else {
            log::debug!("Update for unopened document {doc_id}");
            return;
        };

        let rehighlight = {
            let mut guard = doc.lock().await;
            match guard.apply_remote(&update) {
                Ok(ops) => {
                    for op in ops.iter().filter(|op| !op.is_comment()) {
                        self.emit(SurfaceEvent::ApplyOp {
                            doc_id: doc_id.clone(),
                            op: op.clone(),
                        });
                    }
                    ops.iter().any(Op::is_comment) || (!ops.is_empty() && !guard.threads().is_empty())
                }
                Err(e) => {
                    log::error!("{doc_id}: {e}; resynchronizing");
                    drop(guard);
                    tokio::spawn(self.clone().resync(doc_id));
                    return;
                }
            }
        };
        if rehighlight {
            self.rehighlight(&doc).await;
        }
    }

    async fn resync(self, doc_id: String) {
        self.status(format!("Resynchronizing {doc_id}"));
        let result = async {
            let (protocol, _) = self.link_parts().await?;
            self.call(&protocol, Command::LeaveDoc { doc_id: doc_id.clone() })
                .await?;
            self.join_document(&doc_id).await
        }
        .await;
        if let Err(e) = result {
            log::warn!("Resync of {doc_id} failed: {e}");
        }
    }

    async fn update_cursor(&self, update: CursorUpdate) {
        let (placed, stale) = {
            let mut cursors = self.inner.cursors.lock().await;
            let placed = cursors.handle_update(update).cloned();
            (placed, cursors.cleanup_idle_peers())
        };
        for client_id in stale {
            self.emit(SurfaceEvent::ClearRemoteCursor { client_id });
        }

        let Some(cursor) = placed else {
            return;
        };
        let Some((doc_id, _, _)) = cursor.position() else {
            return;
        };
        if let Ok(doc) = self.document(doc_id).await {
            let guard = doc.lock().await;
            self.paint_cursor(doc_id, &cursor, guard.lines());
        }
    }

    fn paint_cursor(&self, doc_id: &str, cursor: &RemoteCursor, lines: &[String]) {
        if let Some((line, start_col, end_col)) = cursor.cell(lines) {
            self.emit(SurfaceEvent::RemoteCursor {
                doc_id: doc_id.to_string(),
                client_id: cursor.client_id.clone(),
                name: cursor.name.clone(),
                line,
                start_col,
                end_col,
            });
        }
    }

    async fn thread_changed(&self, kind: ThreadEventKind, thread_id: String) {
        log::debug!("Thread {thread_id}: {kind:?}");
        {
            let mut listing = self.inner.listing.lock().await;
            match kind {
                ThreadEventKind::Resolved => {
                    if let Some(thread) = listing.get_mut(&thread_id) {
                        thread.resolved = true;
                    }
                }
                ThreadEventKind::Reopened => {
                    if let Some(thread) = listing.get_mut(&thread_id) {
                        thread.resolved = false;
                    }
                }
                ThreadEventKind::Deleted => {
                    listing.remove(&thread_id);
                }
                ThreadEventKind::NewComment
                | ThreadEventKind::MessageEdited
                | ThreadEventKind::MessageDeleted => {}
            }
        }
        if kind == ThreadEventKind::NewComment {
            self.publish_pending_comment(&thread_id).await;
        }
        self.refresh_threads().await;
        self.rehighlight_all().await;
    }

    /// The server created a thread we started: anchor it in the document.
    async fn publish_pending_comment(&self, thread_id: &str) {
        let pending = {
            let mut pending = self.inner.pending_comments.lock().await;
            match pending.get_mut(thread_id) {
                Some(comment) if !comment.published => {
                    comment.published = true;
                    comment.clone()
                }
                _ => return,
            }
        };
        let Ok((_, ops)) = self.link_parts().await else {
            return;
        };
        let Ok(doc) = self.document(&pending.doc_id).await else {
            log::warn!("Thread {thread_id}: document {} is gone", pending.doc_id);
            return;
        };

        let guard = doc.lock().await;
        let found = guard
            .buffer()
            .slice(pending.pos, pending.pos + pending.text.chars().count());
        if found != pending.text {
            log::warn!("Thread {thread_id}: anchor text moved since the comment was created");
        }
        let op = Op::comment(pending.pos, pending.text, thread_id);
        log::info!("Publishing comment anchor for {thread_id}");
        ops.enqueue(pending.doc_id, vec![op], guard.buffer().content_hash(), false);
    }

    /// Our comment anchors were acknowledged.
    async fn confirm_comments(&self, doc_id: &str, ops: &[Op]) {
        let confirmed: Vec<&str> = ops.iter().filter_map(Op::thread_id).collect();
        if confirmed.is_empty() {
            return;
        }
        {
            let mut pending = self.inner.pending_comments.lock().await;
            for thread_id in &confirmed {
                pending.remove(*thread_id);
            }
        }
        self.emit(SurfaceEvent::ClearHighlights {
            doc_id: doc_id.to_string(),
            kind: HighlightKind::Pending,
        });
        self.refresh_threads().await;
        if let Ok(doc) = self.document(doc_id).await {
            self.rehighlight(&doc).await;
        }
    }

    /// Reload the listing, keeping local records of not yet confirmed threads.
    async fn refresh_threads(&self) {
        let fresh = match self.inner.api.list_threads().await {
            Ok(listing) => listing,
            Err(e) => {
                log::warn!("Could not refresh comment threads: {e}");
                return;
            }
        };
        let pending: HashSet<String> = self.inner.pending_comments.lock().await.keys().cloned().collect();
        let mut listing = self.inner.listing.lock().await;
        let mut merged = fresh;
        for thread_id in pending {
            if let Some(local) = listing.remove(&thread_id) {
                merged.entry(thread_id).or_insert(local);
            }
        }
        *listing = merged;
    }

    async fn open_threads(&self) -> HashSet<String> {
        self.inner
            .listing
            .lock()
            .await
            .iter()
            .filter(|(_, thread)| !thread.resolved)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn rehighlight(&self, doc: &Mutex<Document>) {
        let open = self.open_threads().await;
        let guard = doc.lock().await;
        if !guard.is_active() {
            return;
        }
        for event in guard.highlight_events(&open) {
            self.emit(event);
        }
    }

    async fn rehighlight_all(&self) {
        let documents: Vec<Arc<Mutex<Document>>> = self.inner.documents.lock().await.values().cloned().collect();
        for doc in documents {
            self.rehighlight(&doc).await;
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Outbound edits
    // ───────────────────────────────────────────────────────────────

    async fn drain_loop(self, protocol: ProtocolSession, mut queue: OpQueue, cancel: CancellationToken) {
        loop {
            let round = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                round = queue.next_round() => round,
            };
            let Some(round) = round else {
                break;
            };
            for QueuedEdit {
                doc_id,
                ops,
                hash,
                track_changes,
            } in round
            {
                let Ok(doc) = self.document(&doc_id).await else {
                    log::debug!("Dropping edit for closed document {doc_id}");
                    continue;
                };
                let batch = doc.lock().await.push_outbound(ops, hash, track_changes);
                if let Some(batch) = batch {
                    tokio::spawn(self.clone().fly(protocol.clone(), doc_id, doc, batch, cancel.clone()));
                }
            }
        }
        log::debug!("Op drain loop exited");
    }

    /// Send one batch and watch its deadline. The acknowledgement itself is
    /// applied by the dispatch loop, which also launches the next batch.
    async fn fly(
        self,
        protocol: ProtocolSession,
        doc_id: String,
        doc: Arc<Mutex<Document>>,
        batch: OutboundBatch,
        cancel: CancellationToken,
    ) {
        let ack_timeout = self.inner.config.ack_timeout;
        let pending = {
            // Held until the request id is recorded, so the reply cannot be
            // processed before the document knows about it.
            let mut guard = doc.lock().await;
            if !guard.is_active() {
                return;
            }
            let version = guard.version();
            let mut update = OutboundUpdate::new(doc_id.as_str(), batch.ops, version, batch.hash);
            if batch.track_changes {
                update = update.with_track_change(ids::change_id());
            }
            log::debug!("{doc_id}: sending {} op(s) at v{version}", update.op.len());

            let command = Command::ApplyOtUpdate {
                doc_id: doc_id.clone(),
                update,
            };
            match protocol.request(command).await {
                Ok(pending) => {
                    guard.mark_in_flight(pending.id());
                    pending
                }
                Err(e) => {
                    drop(guard);
                    if !matches!(e, CollabError::NotConnected) && !cancel.is_cancelled() {
                        self.disconnect_with(DisconnectReason::TransportLost(e.to_string()))
                            .await;
                    }
                    return;
                }
            }
        };
        let request_id = pending.id();

        let failure = match timeout(ack_timeout, pending.wait()).await {
            Ok(Ok(reply)) => reply.error().map(DisconnectReason::UpdateError),
            Ok(Err(CollabError::Cancelled | CollabError::NotConnected)) => None,
            Ok(Err(e)) => {
                log::error!("{doc_id}: acknowledgement could not be applied: {e}");
                None
            }
            Err(_) => {
                if doc.lock().await.owns_flight(request_id) {
                    log::error!("{doc_id}: no acknowledgement within {ack_timeout:?}");
                    Some(DisconnectReason::AckTimeout(ack_timeout))
                } else {
                    log::debug!("{doc_id}: request #{request_id} outlived its document");
                    None
                }
            }
        };
        if let Some(reason) = failure {
            if !cancel.is_cancelled() {
                self.disconnect_with(reason).await;
            }
        }
    }

    /// The server took request `request_id`. Stale acknowledgements (the
    /// document was reloaded or closed since) are ignored.
    async fn acknowledge(
        &self,
        protocol: &ProtocolSession,
        cancel: &CancellationToken,
        doc_id: &str,
        request_id: u64,
        sent: &[Op],
    ) -> Result<(), CollabError> {
        let Ok(doc) = self.document(doc_id).await else {
            log::debug!("{doc_id}: acknowledgement #{request_id} after leaving");
            return Err(CollabError::Cancelled);
        };
        let next = {
            let mut guard = doc.lock().await;
            if !guard.owns_flight(request_id) {
                log::debug!("{doc_id}: ignoring stale acknowledgement #{request_id}");
                return Err(CollabError::Cancelled);
            }
            let next = guard.acknowledge(sent);
            log::debug!("{doc_id}: acknowledged, now v{}", guard.version());
            next
        };
        if let Some(batch) = next {
            tokio::spawn(self.clone().fly(protocol.clone(), doc_id.to_string(), doc, batch, cancel.clone()));
        }
        self.confirm_comments(doc_id, sent).await;
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Surface calls
    // ───────────────────────────────────────────────────────────────

    /// Join `doc_id` and publish its content, highlights and the cursors
    /// already inside it. The content is loaded by the dispatch loop before
    /// any update that follows the reply on the wire.
    pub async fn join_document(&self, doc_id: &str) -> Result<(), CollabError> {
        let (protocol, _) = self.link_parts().await?;
        self.call(&protocol, Command::JoinDoc { doc_id: doc_id.to_string() })
            .await?;
        Ok(())
    }

    async fn load_document(&self, doc_id: &str, reply: &Reply) -> Result<(), CollabError> {
        let content = JoinDocReply::from_reply(reply)?;
        let doc = self
            .inner
            .documents
            .lock()
            .await
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Document::new(doc_id))))
            .clone();
        {
            let mut guard = doc.lock().await;
            if let Err(e) = guard.load(content) {
                guard.deactivate();
                drop(guard);
                self.inner.documents.lock().await.remove(doc_id);
                return Err(e.into());
            }
            log::info!("Joined {doc_id} at v{}", guard.version());
            self.emit(SurfaceEvent::Write {
                doc_id: doc_id.to_string(),
                lines: guard.lines().to_vec(),
            });
        }
        self.rehighlight(&doc).await;

        let placed: Vec<RemoteCursor> = self.inner.cursors.lock().await.cursors_in(doc_id).cloned().collect();
        let guard = doc.lock().await;
        for cursor in &placed {
            self.paint_cursor(doc_id, cursor, guard.lines());
        }
        Ok(())
    }

    /// Stop syncing `doc_id` and tell the server.
    pub async fn leave_document(&self, doc_id: &str) -> Result<(), CollabError> {
        let doc = self
            .inner
            .documents
            .lock()
            .await
            .remove(doc_id)
            .ok_or_else(|| CollabError::UnknownDocument(doc_id.to_string()))?;
        self.deactivate(doc_id, &doc).await;

        let (protocol, _) = self.link_parts().await?;
        self.call(&protocol, Command::LeaveDoc { doc_id: doc_id.to_string() })
            .await?;
        Ok(())
    }

    /// The editor's content of `doc_id` is now `lines`. Queues the
    /// difference; returns how many ops it took.
    pub async fn send_local_edit(&self, doc_id: &str, lines: &[String]) -> Result<usize, CollabError> {
        let (_, ops_tx) = self.link_parts().await?;
        let doc = self.document(doc_id).await?;

        let (count, has_threads) = {
            let mut guard = doc.lock().await;
            if !guard.is_active() {
                return Err(CollabError::UnknownDocument(doc_id.to_string()));
            }
            let ops = match guard.apply_local(lines) {
                Ok(ops) => ops,
                Err(e) => {
                    drop(guard);
                    log::error!("{doc_id}: {e}; resynchronizing");
                    tokio::spawn(self.clone().resync(doc_id.to_string()));
                    return Err(e.into());
                }
            };
            if ops.is_empty() {
                return Ok(0);
            }
            let count = ops.len();
            let hash = guard.buffer().content_hash();
            let track = self.inner.track_changes.load(Ordering::Relaxed);
            log::debug!("{doc_id}: queueing {count} local op(s)");
            if !ops_tx.enqueue(doc_id, ops, hash, track) {
                return Err(CollabError::NotConnected);
            }
            (count, !guard.threads().is_empty())
        };
        if has_threads {
            self.rehighlight(&doc).await;
        }
        Ok(count)
    }

    /// Publish the local cursor, throttled. Returns whether it was sent.
    pub async fn move_cursor(&self, doc_id: &str, line: usize, column: usize) -> Result<bool, CollabError> {
        let (protocol, _) = self.link_parts().await?;
        if !self.inner.cursors.lock().await.update_local_cursor() {
            return Ok(false);
        }
        protocol
            .emit(ClientEvent::UpdatePosition {
                doc_id: doc_id.to_string(),
                row: line,
                column,
            })
            .await?;
        Ok(true)
    }

    /// Start a thread on `selection` with a first message.
    ///
    /// Returns the new thread id, or `None` when the message or the
    /// selected text is empty. The anchor op is published once the server
    /// announces the thread.
    pub async fn create_comment(
        &self,
        doc_id: &str,
        selection: TextRange,
        content: &str,
    ) -> Result<Option<String>, CollabError> {
        if content.trim().is_empty() {
            return Ok(None);
        }
        let doc = self.document(doc_id).await?;
        let (pos, text) = {
            let guard = doc.lock().await;
            let begin = guard.offset_of(selection.start_line, selection.start_col);
            let end = guard.offset_of(selection.end_line, selection.end_col);
            let (begin, end) = (begin.min(end), begin.max(end));
            (begin, guard.buffer().slice(begin, end))
        };
        if text.is_empty() {
            return Ok(None);
        }

        let counter = self.inner.comment_counter.fetch_add(1, Ordering::Relaxed);
        let thread_id = ids::comment_id(counter);
        self.inner.listing.lock().await.insert(
            thread_id.clone(),
            ThreadRecord {
                messages: vec![ThreadMessage::pending(content)],
                resolved: false,
            },
        );
        self.inner.pending_comments.lock().await.insert(
            thread_id.clone(),
            PendingComment {
                doc_id: doc_id.to_string(),
                pos,
                text,
                published: false,
            },
        );
        self.emit(SurfaceEvent::Highlight {
            doc_id: doc_id.to_string(),
            kind: HighlightKind::Pending,
            range: selection,
        });

        let action = ThreadAction::Message(content.to_string());
        if let Err(e) = self.inner.api.thread_action(&thread_id, action).await {
            log::warn!("Creating thread {thread_id} failed: {e}");
            self.inner.listing.lock().await.remove(&thread_id);
            self.inner.pending_comments.lock().await.remove(&thread_id);
            self.emit(SurfaceEvent::ClearHighlights {
                doc_id: doc_id.to_string(),
                kind: HighlightKind::Pending,
            });
            return Err(e);
        }
        Ok(Some(thread_id))
    }

    pub async fn resolve_comment(&self, thread_id: &str) -> Result<(), CollabError> {
        self.set_resolved(thread_id, true).await
    }

    pub async fn reopen_comment(&self, thread_id: &str) -> Result<(), CollabError> {
        self.set_resolved(thread_id, false).await
    }

    /// Flip the flag locally right away; restore it if the server refuses.
    async fn set_resolved(&self, thread_id: &str, resolved: bool) -> Result<(), CollabError> {
        let previous = self
            .inner
            .listing
            .lock()
            .await
            .get_mut(thread_id)
            .map(|thread| std::mem::replace(&mut thread.resolved, resolved));
        self.rehighlight_all().await;

        let action = if resolved {
            ThreadAction::Resolve
        } else {
            ThreadAction::Reopen
        };
        if let Err(e) = self.inner.api.thread_action(thread_id, action).await {
            log::warn!("Thread {thread_id}: {e}");
            if let Some(previous) = previous {
                if let Some(thread) = self.inner.listing.lock().await.get_mut(thread_id) {
                    thread.resolved = previous;
                }
            }
            self.rehighlight_all().await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn reply_comment(&self, thread_id: &str, content: &str) -> Result<(), CollabError> {
        if content.trim().is_empty() {
            return Ok(());
        }
        if let Some(thread) = self.inner.listing.lock().await.get_mut(thread_id) {
            thread.messages.push(ThreadMessage::pending(content));
        }

        let action = ThreadAction::Message(content.to_string());
        if let Err(e) = self.inner.api.thread_action(thread_id, action).await {
            if let Some(thread) = self.inner.listing.lock().await.get_mut(thread_id) {
                if let Some(at) = thread
                    .messages
                    .iter()
                    .rposition(|m| m.pending && m.content == content)
                {
                    thread.messages.remove(at);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Next thread after the cursor: `(line, col, ordinal)`, wrapping.
    pub async fn next_comment(
        &self,
        doc_id: &str,
        line: usize,
        col: usize,
    ) -> Result<Option<(usize, usize, usize)>, CollabError> {
        let doc = self.document(doc_id).await?;
        let found = doc.lock().await.next_thread(line, col);
        Ok(found)
    }

    pub async fn prev_comment(
        &self,
        doc_id: &str,
        line: usize,
        col: usize,
    ) -> Result<Option<(usize, usize, usize)>, CollabError> {
        let doc = self.document(doc_id).await?;
        let found = doc.lock().await.prev_thread(line, col);
        Ok(found)
    }

    /// Listed threads under the cursor, in start order.
    pub async fn threads_at(
        &self,
        doc_id: &str,
        line: usize,
        col: usize,
    ) -> Result<Vec<(String, ThreadRecord)>, CollabError> {
        let doc = self.document(doc_id).await?;
        let ids = doc.lock().await.threads_at(line, col);
        let listing = self.inner.listing.lock().await;
        Ok(ids
            .into_iter()
            .filter_map(|id| listing.get(&id).cloned().map(|thread| (id, thread)))
            .collect())
    }

    /// Compile the project's root document.
    pub async fn compile(&self) -> Result<CompileOutcome, CollabError> {
        let root = self.root_doc_id().await.ok_or(CollabError::NotConnected)?;
        self.status("Compiling...");
        match self.inner.api.compile(&root).await {
            Ok(outcome) => {
                if outcome.is_success() {
                    self.status("Compiled.");
                } else {
                    self.status(format!("Compile failed: {}", outcome.status));
                }
                Ok(outcome)
            }
            Err(e) => {
                self.status(format!("Compile error: {e}"));
                Err(e)
            }
        }
    }

    pub async fn sync_git(&self, message: &str) -> Result<(), CollabError> {
        self.status("Syncing with git...");
        match self.inner.api.sync_git(message).await {
            Ok(()) => {
                self.status("Git sync done.");
                Ok(())
            }
            Err(e) => {
                self.status(format!("Git sync error: {e}"));
                Err(e)
            }
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Helpers
    // ───────────────────────────────────────────────────────────────

    async fn document(&self, doc_id: &str) -> Result<Arc<Mutex<Document>>, CollabError> {
        self.inner
            .documents
            .lock()
            .await
            .get(doc_id)
            .cloned()
            .ok_or_else(|| CollabError::UnknownDocument(doc_id.to_string()))
    }

    async fn deactivate(&self, doc_id: &str, doc: &Mutex<Document>) {
        if !doc.lock().await.deactivate() {
            return;
        }
        for kind in [HighlightKind::Comment, HighlightKind::Double, HighlightKind::Pending] {
            self.emit(SurfaceEvent::ClearHighlights {
                doc_id: doc_id.to_string(),
                kind,
            });
        }
        self.emit(SurfaceEvent::Detached {
            doc_id: doc_id.to_string(),
        });
    }

    fn emit(&self, event: SurfaceEvent) {
        if self.inner.surface.send(event).is_err() {
            log::debug!("Surface receiver dropped");
        }
    }

    fn status(&self, text: impl Into<String>) {
        self.emit(SurfaceEvent::Status(text.into()));
    }
}
