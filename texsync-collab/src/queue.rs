//! Outbound edit flow control.
//!
//! Two layers:
//!
//! ```text
//!  producers ──enqueue──► OpQueue ──next_round──► per-doc FlowControl ──► wire
//!   (many)               (unbounded)  coalesced      Idle ⇄ AwaitingAck
//! ```
//!
//! `OpQueue` collects edits from any task and hands them to a single drain
//! loop in rounds, one coalesced edit per document. `FlowControl` guarantees
//! at most one unacknowledged batch per document: everything that arrives
//! while a batch is in flight is buffered and sent as one combined batch
//! after the acknowledgement.

use texsync_core::Op;
use tokio::sync::mpsc;

/// A document's outbound state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Idle,
    AwaitingAck,
}

/// One batch ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBatch {
    pub ops: Vec<Op>,
    /// Content hash after applying `ops`
    pub hash: String,
    pub track_changes: bool,
}

/// Single-flight gate for one document.
#[derive(Debug, Default)]
pub struct FlowControl {
    state: FlowState,
    buffer: Vec<Op>,
    hash: String,
    track_changes: bool,
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `ops`. Returns a batch to send when the document was idle.
    pub fn push(&mut self, ops: Vec<Op>, hash: String, track_changes: bool) -> Option<OutboundBatch> {
        self.buffer.extend(ops);
        self.hash = hash;
        self.track_changes = track_changes;
        match self.state {
            FlowState::Idle => self.take_batch(),
            FlowState::AwaitingAck => None,
        }
    }

    /// The in-flight batch was acknowledged. Returns the next batch when
    /// anything accumulated meanwhile.
    pub fn acknowledge(&mut self) -> Option<OutboundBatch> {
        self.state = FlowState::Idle;
        self.take_batch()
    }

    /// Forget everything, e.g. on deactivation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Ops waiting behind the in-flight batch.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take_batch(&mut self) -> Option<OutboundBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        self.state = FlowState::AwaitingAck;
        Some(OutboundBatch {
            ops: std::mem::take(&mut self.buffer),
            hash: self.hash.clone(),
            track_changes: self.track_changes,
        })
    }
}

/// One local edit waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEdit {
    pub doc_id: String,
    pub ops: Vec<Op>,
    pub hash: String,
    pub track_changes: bool,
}

/// Producer half of an [`OpQueue`].
#[derive(Debug, Clone)]
pub struct OpSender {
    tx: mpsc::UnboundedSender<QueuedEdit>,
}

impl OpSender {
    /// Returns `false` once the drain loop is gone.
    pub fn enqueue(
        &self,
        doc_id: impl Into<String>,
        ops: Vec<Op>,
        hash: impl Into<String>,
        track_changes: bool,
    ) -> bool {
        self.tx
            .send(QueuedEdit {
                doc_id: doc_id.into(),
                ops,
                hash: hash.into(),
                track_changes,
            })
            .is_ok()
    }
}

/// Multi-producer, single-consumer queue of local edits.
#[derive(Debug)]
pub struct OpQueue {
    sender: OpSender,
    rx: mpsc::UnboundedReceiver<QueuedEdit>,
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OpQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: OpSender { tx },
            rx,
        }
    }

    /// Handle for producers.
    pub fn sender(&self) -> OpSender {
        self.sender.clone()
    }

    pub fn enqueue(&self, doc_id: impl Into<String>, ops: Vec<Op>, hash: impl Into<String>, track_changes: bool) -> bool {
        self.sender.enqueue(doc_id, ops, hash, track_changes)
    }

    /// Wait for at least one edit, then drain whatever else is queued and
    /// coalesce per document: ops concatenated in arrival order, the last
    /// hash and track flag win. Documents keep first-arrival order.
    ///
    /// The queue keeps a sender of its own, so this only ends through the
    /// caller dropping the future (the drain loop selects on cancellation).
    pub async fn next_round(&mut self) -> Option<Vec<QueuedEdit>> {
        let first = self.rx.recv().await?;
        let mut round = vec![first];

        while let Ok(edit) = self.rx.try_recv() {
            match round.iter_mut().find(|queued| queued.doc_id == edit.doc_id) {
                Some(queued) => {
                    queued.ops.extend(edit.ops);
                    queued.hash = edit.hash;
                    queued.track_changes = edit.track_changes;
                }
                None => round.push(edit),
            }
        }

        log::debug!("Drained {} document(s) from the op queue", round.len());
        Some(round)
    }
}
