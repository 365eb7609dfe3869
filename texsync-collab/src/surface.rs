//! Boundary to the editor surface.
//!
//! The session never touches editor buffers. It publishes [`SurfaceEvent`]s
//! on a channel; the editor adapter renders them and calls back into
//! [`ProjectSession`](crate::project::ProjectSession) for local edits. The
//! adapter keeps its own [`BufferRegistry`] to map editor buffer handles to
//! document ids.

use std::collections::HashMap;
use std::hash::Hash;

use texsync_core::{Op, PositionIndex, Span};

/// Highlight layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HighlightKind {
    /// Span of an open comment thread
    Comment,
    /// Region covered by two or more threads
    Double,
    /// Selection of a comment that is still being created
    Pending,
}

/// Inclusive-start, exclusive-end range in editor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRange {
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl TextRange {
    pub fn from_span(index: &PositionIndex, span: Span) -> Self {
        let (start_line, start_col) = index.locate(span.begin);
        let (end_line, end_col) = index.locate(span.end);
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }
}

/// Everything the session asks the editor to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    /// Replace the whole buffer
    Write { doc_id: String, lines: Vec<String> },
    /// Apply one remote op (already applied to the session's own copy)
    ApplyOp { doc_id: String, op: Op },
    Highlight {
        doc_id: String,
        kind: HighlightKind,
        range: TextRange,
    },
    ClearHighlights { doc_id: String, kind: HighlightKind },
    RemoteCursor {
        doc_id: String,
        client_id: String,
        name: Option<String>,
        line: usize,
        start_col: usize,
        end_col: usize,
    },
    ClearRemoteCursor { client_id: String },
    /// Short status line
    Status(String),
    /// The document is no longer synchronized; the buffer goes read-only
    Detached { doc_id: String },
}

/// Two-way map between editor buffer handles and document ids.
#[derive(Debug, Clone)]
pub struct BufferRegistry<H> {
    by_handle: HashMap<H, String>,
    by_doc: HashMap<String, H>,
}

impl<H> Default for BufferRegistry<H> {
    fn default() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_doc: HashMap::new(),
        }
    }
}

impl<H: Clone + Eq + Hash> BufferRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handle` to `doc_id`, replacing any previous binding of either.
    pub fn register(&mut self, handle: H, doc_id: impl Into<String>) {
        let doc_id = doc_id.into();
        self.unregister_handle(&handle);
        self.unregister_doc(&doc_id);
        self.by_doc.insert(doc_id.clone(), handle.clone());
        self.by_handle.insert(handle, doc_id);
    }

    pub fn doc_for(&self, handle: &H) -> Option<&str> {
        self.by_handle.get(handle).map(String::as_str)
    }

    pub fn handle_for(&self, doc_id: &str) -> Option<&H> {
        self.by_doc.get(doc_id)
    }

    pub fn unregister_handle(&mut self, handle: &H) -> Option<String> {
        let doc_id = self.by_handle.remove(handle)?;
        self.by_doc.remove(&doc_id);
        Some(doc_id)
    }

    pub fn unregister_doc(&mut self, doc_id: &str) -> Option<H> {
        let handle = self.by_doc.remove(doc_id)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&H, &str)> {
        self.by_handle.iter().map(|(h, d)| (h, d.as_str()))
    }
}
