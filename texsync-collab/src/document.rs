//! One joined document: content, version, outbound flow and comment spans.
//!
//! ```text
//!            load(joinDoc reply)
//!                   │
//!   remote ops ──► apply_remote() ──┐
//!                                   ├──► TextBuffer + ThreadIndex
//!   editor lines ─► apply_local() ──┘            │
//!                        │                       ▼
//!                        └─► push_outbound() ─► FlowControl ─► acknowledge()
//! ```
//!
//! `Document` is plain data; the session keeps each one behind its own
//! async mutex so that remote application and local diffing never
//! interleave.

use std::collections::HashSet;

use texsync_core::{apply_op, build_ops, decode_wire_line, Op, Span, SyncError, TextBuffer, ThreadIndex};

use crate::protocol::{JoinDocReply, RemoteUpdate};
use crate::queue::{FlowControl, FlowState, OutboundBatch};
use crate::surface::{HighlightKind, SurfaceEvent, TextRange};

#[derive(Debug)]
pub struct Document {
    id: String,
    version: u64,
    buffer: TextBuffer,
    flow: FlowControl,
    threads: ThreadIndex,
    active: bool,
    /// Request id of the unacknowledged `applyOtUpdate`
    in_flight: Option<u64>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            buffer: TextBuffer::new(),
            flow: FlowControl::new(),
            threads: ThreadIndex::new(),
            active: false,
            in_flight: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn buffer(&self) -> &TextBuffer {
        &self.buffer
    }

    pub fn lines(&self) -> &[String] {
        self.buffer.lines()
    }

    pub fn threads(&self) -> &ThreadIndex {
        &self.threads
    }

    pub fn flow_state(&self) -> FlowState {
        self.flow.state()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Take over the content of a `joinDoc` reply.
    ///
    /// Anything local (threads, buffered ops) is discarded. Updates bundled
    /// in the reply are applied on top of the snapshot.
    pub fn load(&mut self, reply: JoinDocReply) -> Result<(), SyncError> {
        let lines = reply.lines.iter().map(|line| decode_wire_line(line)).collect();
        self.buffer.write(lines);
        self.version = reply.version;
        self.threads.clear();
        self.flow.reset();
        self.in_flight = None;
        self.active = true;

        let len = self.buffer.char_len();
        for range in &reply.ranges.comments {
            let begin = range.op.pos;
            let end = begin + range.op.text.chars().count();
            if self.threads.create(range.thread_id(), begin, end, len).is_none() {
                log::debug!("{}: dropping unanchorable thread {}", self.id, range.thread_id());
            }
        }

        for update in &reply.updates {
            self.apply_remote(update)?;
        }
        log::debug!(
            "{}: loaded v{} ({} lines, {} threads)",
            self.id,
            self.version,
            self.buffer.line_count(),
            self.threads.len()
        );
        Ok(())
    }

    /// Apply a broadcast update. Returns the ops that were applied.
    ///
    /// The version becomes `max(version, v + 1)` whether or not ops are
    /// attached, except for the op-less echo of our own in-flight batch: the
    /// acknowledgement accounts for that one. On error the ops before the
    /// failing one stay applied; the caller resynchronizes.
    pub fn apply_remote(&mut self, update: &RemoteUpdate) -> Result<Vec<Op>, SyncError> {
        let own_echo = update.op.is_none()
            && self.flow.state() == FlowState::AwaitingAck
            && update.v == Some(self.version);
        if own_echo {
            log::debug!("{}: echo of v{} ahead of its acknowledgement", self.id, self.version);
            return Ok(Vec::new());
        }
        if let Some(v) = update.v {
            self.version = self.version.max(v + 1);
        }
        let Some(ops) = &update.op else {
            return Ok(Vec::new());
        };
        for op in ops {
            apply_op(&mut self.buffer, op)?;
            self.track(op);
        }
        Ok(ops.clone())
    }

    /// Diff the editor's lines against the last synced snapshot and adopt
    /// them. Returns the ops in application order.
    pub fn apply_local(&mut self, lines: &[String]) -> Result<Vec<Op>, SyncError> {
        let ops = build_ops(self.buffer.lines(), lines);
        for op in &ops {
            apply_op(&mut self.buffer, op)?;
            self.track(op);
        }
        if self.buffer.lines() != lines {
            log::error!("{}: local diff did not reproduce the editor content", self.id);
            self.buffer.write(lines.to_vec());
        }
        Ok(ops)
    }

    /// Hand ops to the flow gate. Returns a batch when nothing is in flight.
    pub fn push_outbound(&mut self, ops: Vec<Op>, hash: String, track_changes: bool) -> Option<OutboundBatch> {
        if !self.active {
            return None;
        }
        self.flow.push(ops, hash, track_changes)
    }

    /// Record the request carrying the batch returned by `push_outbound`
    /// or `acknowledge`.
    pub fn mark_in_flight(&mut self, request_id: u64) {
        self.in_flight = Some(request_id);
    }

    /// Whether `request_id` carries the batch this document waits for.
    /// False once the document was reloaded or deactivated.
    pub fn owns_flight(&self, request_id: u64) -> bool {
        self.active && self.in_flight == Some(request_id)
    }

    /// The in-flight batch `sent` was acknowledged.
    ///
    /// Bumps the version, anchors the comment threads the batch carried and
    /// returns the next batch if edits accumulated meanwhile.
    pub fn acknowledge(&mut self, sent: &[Op]) -> Option<OutboundBatch> {
        if !self.active {
            return None;
        }
        self.in_flight = None;
        self.version += 1;
        let len = self.buffer.char_len();
        for op in sent {
            if let Op::Comment { pos, text, thread_id } = op {
                self.threads.create(thread_id.clone(), *pos, pos + text.chars().count(), len);
            }
        }
        self.flow.acknowledge()
    }

    /// Stop syncing. Returns `false` if already inactive.
    pub fn deactivate(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.threads.clear();
        self.flow.reset();
        self.in_flight = None;
        true
    }

    /// Char offset of an editor position.
    pub fn offset_of(&self, line: usize, col: usize) -> usize {
        self.buffer.index().offset_of(line, col).min(self.buffer.char_len())
    }

    pub fn range_of(&self, span: Span) -> TextRange {
        TextRange::from_span(self.buffer.index(), span)
    }

    /// Next thread start after `(line, col)`: `(line, col, ordinal)`.
    pub fn next_thread(&self, line: usize, col: usize) -> Option<(usize, usize, usize)> {
        let (pos, ordinal) = self.threads.next_from(self.offset_of(line, col))?;
        let (line, col) = self.buffer.index().locate(pos);
        Some((line, col, ordinal))
    }

    pub fn prev_thread(&self, line: usize, col: usize) -> Option<(usize, usize, usize)> {
        let (pos, ordinal) = self.threads.prev_from(self.offset_of(line, col))?;
        let (line, col) = self.buffer.index().locate(pos);
        Some((line, col, ordinal))
    }

    pub fn threads_at(&self, line: usize, col: usize) -> Vec<String> {
        self.threads
            .at(self.offset_of(line, col))
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Surface events repainting comment highlights.
    ///
    /// Only threads in `open` are painted; regions shared by two or more of
    /// them get the double highlight.
    pub fn highlight_events(&self, open: &HashSet<String>) -> Vec<SurfaceEvent> {
        let mut events = vec![
            SurfaceEvent::ClearHighlights {
                doc_id: self.id.clone(),
                kind: HighlightKind::Comment,
            },
            SurfaceEvent::ClearHighlights {
                doc_id: self.id.clone(),
                kind: HighlightKind::Double,
            },
        ];

        let len = self.buffer.char_len();
        let mut painted = ThreadIndex::new();
        for (id, span) in self.threads.iter().filter(|(id, _)| open.contains(*id)) {
            painted.create(id, span.begin, span.end, len);
            events.push(self.highlight(HighlightKind::Comment, span));
        }
        for span in painted.overlaps() {
            events.push(self.highlight(HighlightKind::Double, span));
        }
        events
    }

    fn highlight(&self, kind: HighlightKind, span: Span) -> SurfaceEvent {
        SurfaceEvent::Highlight {
            doc_id: self.id.clone(),
            kind,
            range: self.range_of(span),
        }
    }

    fn track(&mut self, op: &Op) {
        match op {
            Op::Insert { pos, text } => self.threads.shift_on_insert(*pos, text.chars().count()),
            Op::Delete { pos, text } => {
                for id in self.threads.shift_on_delete(*pos, pos + text.chars().count()) {
                    log::debug!("{}: thread {id} lost its text", self.id);
                }
            }
            Op::Comment { pos, text, thread_id } => {
                let len = self.buffer.char_len();
                self.threads
                    .create(thread_id.clone(), *pos, pos + text.chars().count(), len);
            }
        }
    }
}
