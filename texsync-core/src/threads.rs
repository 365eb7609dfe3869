//! Comment-thread spans over a document, kept in sync with edits.
//!
//! Every thread anchors a half-open char interval `[begin, end)`. Edits
//! remap the intervals:
//!
//! ```text
//!   insert at x     x <= begin        → both ends shift
//!                   begin < x < end   → end grows
//!                   x >= end          → unchanged
//!
//!   delete [s, e)   boundary b <= s   → b
//!                   s < b <= e        → s
//!                   b > e             → b - (e - s)
//! ```
//!
//! Intervals that collapse to zero width are dropped.

use std::collections::{BTreeMap, BTreeSet};

/// Half-open char interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub begin: usize,
    pub end: usize,
}

impl Span {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.begin <= offset && offset < self.end
    }

    /// Non-empty intersection with `other`.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let span = Span::new(self.begin.max(other.begin), self.end.min(other.end));
        (!span.is_empty()).then_some(span)
    }
}

/// Thread id → span map with edit remapping and cursor navigation.
#[derive(Debug, Clone, Default)]
pub struct ThreadIndex {
    spans: BTreeMap<String, Span>,
}

impl ThreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `thread_id` over `[begin, end)`, replacing any previous span.
    ///
    /// A zero-width anchor widens by one char on each side (clamped to
    /// `[0, doc_len]`) so that it stays visible. Returns `None` when nothing
    /// non-empty can be anchored, e.g. in an empty document.
    pub fn create(
        &mut self,
        thread_id: impl Into<String>,
        begin: usize,
        end: usize,
        doc_len: usize,
    ) -> Option<Span> {
        let (mut begin, mut end) = (begin.min(end), end.max(begin));
        if begin == end {
            begin = begin.saturating_sub(1);
            end = (end + 1).min(doc_len);
        }
        let span = Span::new(begin, end);
        if span.is_empty() {
            return None;
        }
        self.spans.insert(thread_id.into(), span);
        Some(span)
    }

    /// Remap spans after `len` chars were inserted at `at`.
    pub fn shift_on_insert(&mut self, at: usize, len: usize) {
        if len == 0 {
            return;
        }
        for span in self.spans.values_mut() {
            if at <= span.begin {
                span.begin += len;
                span.end += len;
            } else if at < span.end {
                span.end += len;
            }
        }
    }

    /// Remap spans after `[start, end)` was deleted.
    ///
    /// Returns the ids of threads whose span was deleted entirely.
    pub fn shift_on_delete(&mut self, start: usize, end: usize) -> Vec<String> {
        if end <= start {
            return Vec::new();
        }
        let map = |x: usize| {
            if x <= start {
                x
            } else if x <= end {
                start
            } else {
                x - (end - start)
            }
        };

        let mut removed = Vec::new();
        self.spans.retain(|id, span| {
            span.begin = map(span.begin);
            span.end = map(span.end);
            if span.is_empty() {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Every region covered by at least two threads, deduplicated.
    pub fn overlaps(&self) -> BTreeSet<Span> {
        let spans: Vec<&Span> = self.spans.values().collect();
        let mut out = BTreeSet::new();
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                if let Some(shared) = a.intersect(b) {
                    out.insert(shared);
                }
            }
        }
        out
    }

    /// Start of the next thread after `offset`, wrapping around.
    ///
    /// Threads containing `offset` are skipped. Returns the start offset and
    /// the thread's 1-based ordinal in start order.
    pub fn next_from(&self, offset: usize) -> Option<(usize, usize)> {
        let ordered = &self.ordered();
        let candidates = move || ordered.iter().filter(move |(_, span)| !span.contains(offset));
        candidates()
            .filter(|(_, span)| span.begin > offset)
            .min_by_key(|(_, span)| span.begin)
            .or_else(|| {
                candidates()
                    .filter(|(_, span)| span.end <= offset)
                    .min_by_key(|(_, span)| span.begin)
            })
            .map(|(ordinal, span)| (span.begin, ordinal + 1))
    }

    /// Start of the previous thread before `offset`, wrapping around.
    pub fn prev_from(&self, offset: usize) -> Option<(usize, usize)> {
        let ordered = &self.ordered();
        let candidates = move || ordered.iter().filter(move |(_, span)| !span.contains(offset));
        candidates()
            .filter(|(_, span)| span.end <= offset)
            .max_by_key(|(_, span)| span.begin)
            .or_else(|| {
                candidates()
                    .filter(|(_, span)| span.begin > offset)
                    .max_by_key(|(_, span)| span.begin)
            })
            .map(|(ordinal, span)| (span.begin, ordinal + 1))
    }

    /// Threads whose span contains `offset`, in start order.
    pub fn at(&self, offset: usize) -> Vec<&str> {
        let mut hits: Vec<(&Span, &str)> = self
            .spans
            .iter()
            .filter(|(_, span)| span.contains(offset))
            .map(|(id, span)| (span, id.as_str()))
            .collect();
        hits.sort();
        hits.into_iter().map(|(_, id)| id).collect()
    }

    pub fn span(&self, thread_id: &str) -> Option<Span> {
        self.spans.get(thread_id).copied()
    }

    pub fn remove(&mut self, thread_id: &str) -> Option<Span> {
        self.spans.remove(thread_id)
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Span)> {
        self.spans.iter().map(|(id, span)| (id.as_str(), *span))
    }

    // (rank, span) sorted by start; ties broken by end, then id.
    fn ordered(&self) -> Vec<(usize, Span)> {
        let mut spans: Vec<(Span, &String)> = self.spans.iter().map(|(id, s)| (*s, id)).collect();
        spans.sort();
        spans
            .into_iter()
            .enumerate()
            .map(|(rank, (span, _))| (rank, span))
            .collect()
    }
}
