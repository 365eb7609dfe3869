//! Offset ↔ (line, column) translation for a mutable line sequence.
//!
//! Content is addressed as the lines joined by a single `\n`, so every line
//! except the last owns one terminator character:
//!
//! ```text
//! lines:   "foo"   "bar"   "baz"
//! lengths:  3+1     3+1     3
//! starts:   0       4       8      total = 11
//! ```
//!
//! Starts are kept as a plain prefix-sum array. Mutations recompute the
//! suffix from the first touched line, which is O(n) in the worst case but
//! edits are local and documents are bounded.

/// Cumulative line-length index over a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionIndex {
    /// Text length of each line in chars, terminator excluded.
    lengths: Vec<usize>,
    /// `starts[i]` = absolute offset of the first char of line `i`.
    starts: Vec<usize>,
}

impl PositionIndex {
    /// Create an empty index (zero lines).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from per-line text lengths.
    pub fn from_lengths(lengths: impl IntoIterator<Item = usize>) -> Self {
        let mut index = Self::new();
        index.initialize(lengths);
        index
    }

    /// Reset from a full set of line lengths (terminators excluded).
    pub fn initialize(&mut self, lengths: impl IntoIterator<Item = usize>) {
        self.lengths = lengths.into_iter().collect();
        self.starts = vec![0; self.lengths.len()];
        self.recompute_from(0);
    }

    /// Number of lines tracked.
    pub fn line_count(&self) -> usize {
        self.lengths.len()
    }

    /// Text length of line `line`, terminator excluded.
    pub fn line_len(&self, line: usize) -> Option<usize> {
        self.lengths.get(line).copied()
    }

    /// Absolute offset of the first char of `line`.
    pub fn line_start(&self, line: usize) -> Option<usize> {
        self.starts.get(line).copied()
    }

    /// Total char length of the joined content.
    pub fn total_len(&self) -> usize {
        match (self.starts.last(), self.lengths.last()) {
            (Some(start), Some(len)) => start + len,
            _ => 0,
        }
    }

    /// Absolute offset of `(line, col)`.
    ///
    /// Lines past the end resolve against the end of the buffer so that an
    /// editor cursor on a phantom trailing line still maps somewhere sane.
    pub fn offset_of(&self, line: usize, col: usize) -> usize {
        match self.starts.get(line) {
            Some(start) => start + col,
            None => self.total_len() + col,
        }
    }

    /// Translate an absolute offset into `(line, col)`.
    ///
    /// Offsets beyond end-of-buffer clamp to the end of the last line.
    pub fn locate(&self, offset: usize) -> (usize, usize) {
        if self.lengths.is_empty() {
            return (0, 0);
        }
        // Last line whose start is <= offset.
        let line = self.starts.partition_point(|&start| start <= offset) - 1;
        let col = offset - self.starts[line];
        let last = self.lengths.len() - 1;
        if line == last {
            (line, col.min(self.lengths[last]))
        } else {
            (line, col)
        }
    }

    /// Insert a new line of `len` chars so that it becomes line `at`.
    pub fn insert_line(&mut self, at: usize, len: usize) {
        let at = at.min(self.lengths.len());
        self.lengths.insert(at, len);
        self.starts.insert(at, 0);
        self.recompute_from(at.saturating_sub(1));
    }

    /// Remove line `at`. Out-of-range indices are ignored.
    pub fn remove_line(&mut self, at: usize) {
        if at >= self.lengths.len() {
            return;
        }
        self.lengths.remove(at);
        self.starts.remove(at);
        self.recompute_from(at.saturating_sub(1));
    }

    /// Change the text length of line `line`.
    pub fn set_line_length(&mut self, line: usize, len: usize) {
        if let Some(slot) = self.lengths.get_mut(line) {
            *slot = len;
            self.recompute_from(line);
        }
    }

    fn recompute_from(&mut self, from: usize) {
        if self.lengths.is_empty() {
            return;
        }
        let from = from.min(self.lengths.len() - 1);
        let mut offset = if from == 0 {
            0
        } else {
            self.starts[from - 1] + self.lengths[from - 1] + 1
        };
        for line in from..self.lengths.len() {
            self.starts[line] = offset;
            offset += self.lengths[line] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_for(lines: &[&str]) -> PositionIndex {
        PositionIndex::from_lengths(lines.iter().map(|l| l.chars().count()))
    }

    #[test]
    fn test_offsets_match_joined_content() {
        let lines = ["foo", "bar", "", "quux"];
        let index = index_for(&lines);
        let joined = lines.join("\n");

        assert_eq!(index.total_len(), joined.chars().count());
        assert_eq!(index.offset_of(1, 0), 4);
        assert_eq!(index.offset_of(2, 0), 8);
        assert_eq!(index.offset_of(3, 2), 11);
    }

    #[test]
    fn test_locate_roundtrips_every_position() {
        let lines = ["alpha", "", "beta gamma", "d"];
        let index = index_for(&lines);

        for (line, text) in lines.iter().enumerate() {
            for col in 0..=text.chars().count() {
                let offset = index.offset_of(line, col);
                assert_eq!(index.locate(offset), (line, col), "line {line} col {col}");
            }
        }
    }

    #[test]
    fn test_locate_clamps_past_end() {
        let index = index_for(&["ab", "cd"]);
        assert_eq!(index.locate(5), (1, 2));
        assert_eq!(index.locate(500), (1, 2));
    }

    #[test]
    fn test_empty_index() {
        let index = PositionIndex::new();
        assert_eq!(index.line_count(), 0);
        assert_eq!(index.total_len(), 0);
        assert_eq!(index.locate(0), (0, 0));
        assert_eq!(index.locate(10), (0, 0));
        assert_eq!(index.offset_of(0, 0), 0);
    }

    #[test]
    fn test_total_is_sum_of_lengths_with_terminators() {
        let index = index_for(&["a", "bc", "def"]);
        // 1+1 + 2+1 + 3
        assert_eq!(index.total_len(), 8);
    }

    #[test]
    fn test_insert_line_middle_and_end() {
        let mut index = index_for(&["foo", "bar"]);

        index.insert_line(1, 5);
        assert_eq!(index, index_for(&["foo", "xxxxx", "bar"]));

        index.insert_line(3, 2);
        assert_eq!(index, index_for(&["foo", "xxxxx", "bar", "yy"]));
        assert_eq!(index.total_len(), 3 + 1 + 5 + 1 + 3 + 1 + 2);
    }

    #[test]
    fn test_insert_into_empty() {
        let mut index = PositionIndex::new();
        index.insert_line(0, 4);
        assert_eq!(index.total_len(), 4);
        assert_eq!(index.locate(2), (0, 2));
    }

    #[test]
    fn test_remove_line() {
        let mut index = index_for(&["foo", "bar", "baz"]);

        index.remove_line(1);
        assert_eq!(index, index_for(&["foo", "baz"]));

        index.remove_line(1);
        assert_eq!(index, index_for(&["foo"]));
        assert_eq!(index.total_len(), 3);

        // Ignored
        index.remove_line(7);
        assert_eq!(index.line_count(), 1);
    }

    #[test]
    fn test_set_line_length() {
        let mut index = index_for(&["foo", "bar", "baz"]);
        index.set_line_length(0, 1);
        assert_eq!(index, index_for(&["f", "bar", "baz"]));
        assert_eq!(index.line_start(2), Some(6));
    }
}
