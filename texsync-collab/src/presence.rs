//! Remote collaborator cursors.
//!
//! ```text
//! clientTracking.clientUpdated ──► CursorTracker::handle_update() ──► SurfaceEvent::RemoteCursor
//! clientTracking.clientDisconnected ──► remove() ──► SurfaceEvent::ClearRemoteCursor
//! local cursor move ──► update_local_cursor() (throttled) ──► clientTracking.updatePosition
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::CursorUpdate;

// ───────────────────────────────────────────────────────────────────
// Remote cursor state
// ───────────────────────────────────────────────────────────────────

/// Last known position of one remote collaborator.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub client_id: String,
    pub name: Option<String>,
    pub doc_id: Option<String>,
    pub row: Option<usize>,
    pub column: Option<usize>,
    last_update: Instant,
}

impl RemoteCursor {
    fn new(client_id: String) -> Self {
        Self {
            client_id,
            name: None,
            doc_id: None,
            row: None,
            column: None,
            last_update: Instant::now(),
        }
    }

    fn merge(&mut self, update: CursorUpdate) {
        if update.name.is_some() {
            self.name = update.name;
        }
        if update.doc_id.is_some() {
            self.doc_id = update.doc_id;
        }
        if update.row.is_some() {
            self.row = update.row;
        }
        if update.column.is_some() {
            self.column = update.column;
        }
        self.last_update = Instant::now();
    }

    /// `(doc_id, row, column)` once all three are known.
    pub fn position(&self) -> Option<(&str, usize, usize)> {
        Some((self.doc_id.as_deref()?, self.row?, self.column?))
    }

    /// One-char cell to paint for this cursor in `lines`.
    ///
    /// Returns `(row, start_col, end_col)`. The row is clamped to the last
    /// line; a cursor at end of line paints the char before it.
    pub fn cell(&self, lines: &[String]) -> Option<(usize, usize, usize)> {
        let (_, row, column) = self.position()?;
        let row = row.min(lines.len().saturating_sub(1));
        let len = lines.get(row).map_or(0, |l| l.chars().count());
        if column >= len {
            Some((row, len.saturating_sub(1), len))
        } else {
            Some((row, column, column + 1))
        }
    }

    /// Check if this cursor has been idle for `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Cursor state for every remote collaborator in a project.
#[derive(Debug)]
pub struct CursorTracker {
    /// Our public id; updates about ourselves are ignored.
    local_id: Option<String>,
    peers: HashMap<String, RemoteCursor>,
    /// Rate limiter: last time we published our cursor, if ever.
    last_local_broadcast: Option<Instant>,
    /// Rate limiter: minimum interval between cursor publications.
    local_interval: Duration,
    idle_timeout: Duration,
}

impl Default for CursorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(33))
    }

    /// Create with custom publication interval (for testing).
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            local_id: None,
            peers: HashMap::new(),
            last_local_broadcast: None,
            local_interval: interval,
            idle_timeout: Duration::from_secs(300),
        }
    }

    pub fn set_local_id(&mut self, id: Option<String>) {
        self.local_id = id;
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    /// Merge an update. Returns the cursor when it is now fully placed.
    pub fn handle_update(&mut self, update: CursorUpdate) -> Option<&RemoteCursor> {
        if self.local_id.as_deref() == Some(update.id.as_str()) {
            return None;
        }
        let cursor = self
            .peers
            .entry(update.id.clone())
            .or_insert_with(|| RemoteCursor::new(update.id.clone()));
        cursor.merge(update);
        cursor.position().is_some().then_some(&*cursor)
    }

    pub fn remove(&mut self, client_id: &str) -> Option<RemoteCursor> {
        self.peers.remove(client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Placed cursors inside `doc_id`.
    pub fn cursors_in<'a>(&'a self, doc_id: &'a str) -> impl Iterator<Item = &'a RemoteCursor> + 'a {
        self.peers
            .values()
            .filter(move |c| matches!(c.position(), Some((doc, _, _)) if doc == doc_id))
    }

    /// Whether a local cursor move should be published now.
    pub fn update_local_cursor(&mut self) -> bool {
        if self
            .last_local_broadcast
            .is_some_and(|last| last.elapsed() < self.local_interval)
        {
            return false;
        }
        self.last_local_broadcast = Some(Instant::now());
        true
    }

    /// Remove peers that have been idle for longer than the timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Forget every peer. Returns their ids.
    pub fn clear(&mut self) -> Vec<String> {
        self.peers.drain().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str, doc: Option<&str>, row: Option<usize>, column: Option<usize>) -> CursorUpdate {
        CursorUpdate {
            id: id.into(),
            name: Some(format!("user-{id}")),
            doc_id: doc.map(Into::into),
            row,
            column,
        }
    }

    #[test]
    fn test_own_updates_are_ignored() {
        let mut tracker = CursorTracker::new();
        tracker.set_local_id(Some("me".into()));
        assert!(tracker.handle_update(update("me", Some("d"), Some(0), Some(0))).is_none());
        assert_eq!(tracker.peer_count(), 0);
    }

    #[test]
    fn test_partial_updates_merge() {
        let mut tracker = CursorTracker::new();
        assert!(tracker.handle_update(update("a", Some("d"), None, None)).is_none());
        let placed = tracker.handle_update(update("a", None, Some(3), Some(1))).unwrap();
        assert_eq!(placed.position(), Some(("d", 3, 1)));
        assert_eq!(tracker.cursors_in("d").count(), 1);
        assert_eq!(tracker.cursors_in("other").count(), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut tracker = CursorTracker::new();
        tracker.handle_update(update("a", Some("d"), Some(0), Some(0)));
        tracker.handle_update(update("b", Some("d"), Some(0), Some(0)));
        assert!(tracker.remove("a").is_some());
        assert!(tracker.remove("a").is_none());
        assert_eq!(tracker.clear(), vec!["b".to_string()]);
        assert_eq!(tracker.peer_count(), 0);
    }

    #[test]
    fn test_cell_clamps_to_buffer() {
        let lines = vec!["abc".to_string(), "de".to_string()];
        let mut tracker = CursorTracker::new();

        let cursor = tracker.handle_update(update("a", Some("d"), Some(0), Some(1))).unwrap();
        assert_eq!(cursor.cell(&lines), Some((0, 1, 2)));

        // End of line paints the previous char
        let cursor = tracker.handle_update(update("a", None, Some(1), Some(2))).unwrap();
        assert_eq!(cursor.cell(&lines), Some((1, 1, 2)));

        // Row beyond the buffer clamps to the last line
        let cursor = tracker.handle_update(update("a", None, Some(9), Some(0))).unwrap();
        assert_eq!(cursor.cell(&lines), Some((1, 0, 1)));
    }

    #[test]
    fn test_local_cursor_throttle() {
        let mut tracker = CursorTracker::with_interval(Duration::from_secs(60));
        assert!(tracker.update_local_cursor());
        assert!(!tracker.update_local_cursor());

        let mut unthrottled = CursorTracker::with_interval(Duration::ZERO);
        assert!(unthrottled.update_local_cursor());
        assert!(unthrottled.update_local_cursor());
    }

    #[test]
    fn test_first_local_cursor_is_published_at_once() {
        let mut tracker = CursorTracker::with_interval(Duration::from_secs(u64::MAX));
        assert!(tracker.update_local_cursor());
        assert!(!tracker.update_local_cursor());
    }

    #[test]
    fn test_cleanup_idle_peers() {
        let mut tracker = CursorTracker::new();
        tracker.handle_update(update("a", Some("d"), Some(0), Some(0)));
        tracker.set_idle_timeout(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.cleanup_idle_peers(), vec!["a".to_string()]);
        assert_eq!(tracker.peer_count(), 0);
    }
}
