//! Line buffer, diff (`build_ops`) and patch (`apply_op`) for OT sync.
//!
//! ```text
//!   saved snapshot ──build_ops──► [op_n … op_1]  (reverse generation order)
//!         ▲                              │
//!         │                              ▼
//!   TextBuffer ◄──────apply_op──── remote / local ops
//! ```
//!
//! Offsets are char offsets into the lines joined by `\n`. `build_ops`
//! diffs line runs first and only falls back to a char-level diff inside
//! "replace" runs, which keeps payloads small for typical typing.

use sha1::{Digest, Sha1};
use similar::{capture_diff_slices, Algorithm, DiffOp};
use thiserror::Error;

use crate::op::Op;
use crate::position::PositionIndex;

/// The buffer and its index disagree with an op. Never expected during
/// normal operation; callers resynchronize the document when they see it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("offset {pos} is outside the document (length {len})")]
    OffsetOutOfBounds { pos: usize, len: usize },
    #[error("delete at {pos} expected {expected:?} but found {found:?}")]
    DeleteMismatch {
        pos: usize,
        expected: String,
        found: String,
    },
}

/// Document content as lines, with a [`PositionIndex`] kept in lockstep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    lines: Vec<String>,
    index: PositionIndex,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lines(lines: Vec<String>) -> Self {
        let index = PositionIndex::from_lengths(lines.iter().map(|l| l.chars().count()));
        Self { lines, index }
    }

    /// Replace the whole content.
    pub fn write(&mut self, lines: Vec<String>) {
        *self = Self::from_lines(lines);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn index(&self) -> &PositionIndex {
        &self.index
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Char length of the joined content.
    pub fn char_len(&self) -> usize {
        self.index.total_len()
    }

    /// Lines joined by `\n`.
    pub fn content(&self) -> String {
        self.lines.join("\n")
    }

    /// SHA-1 content hash of the current lines.
    pub fn content_hash(&self) -> String {
        content_hash(&self.lines)
    }

    /// Text in `[begin, end)`; the range is clipped to the document.
    pub fn slice(&self, begin: usize, end: usize) -> String {
        let end = end.min(self.char_len());
        if begin >= end {
            return String::new();
        }
        let (first, first_col) = self.index.locate(begin);
        let (last, last_col) = self.index.locate(end);

        if first == last {
            return self.lines[first]
                .chars()
                .skip(first_col)
                .take(last_col - first_col)
                .collect();
        }

        let mut out: String = self.lines[first].chars().skip(first_col).collect();
        for line in &self.lines[first + 1..last] {
            out.push('\n');
            out.push_str(line);
        }
        out.push('\n');
        out.extend(self.lines[last].chars().take(last_col));
        out
    }

    /// Ops that turn this buffer into `new`, in application order.
    pub fn diff_to(&self, new: &[String]) -> Vec<Op> {
        build_ops(&self.lines, new)
    }

    fn insert(&mut self, pos: usize, text: &str) -> Result<(), SyncError> {
        let len = self.char_len();
        if pos > len {
            return Err(SyncError::OffsetOutOfBounds { pos, len });
        }
        if text.is_empty() {
            return Ok(());
        }
        if self.lines.is_empty() {
            self.lines.push(String::new());
            self.index.insert_line(0, 0);
        }

        let (line, col) = self.index.locate(pos);
        let split_at = byte_offset(&self.lines[line], col);
        let tail = self.lines[line].split_off(split_at);

        let mut pieces = text.split('\n');
        self.lines[line].push_str(pieces.next().unwrap_or_default());
        let rest: Vec<&str> = pieces.collect();

        if rest.is_empty() {
            self.lines[line].push_str(&tail);
            self.index.set_line_length(line, self.lines[line].chars().count());
            return Ok(());
        }

        self.index.set_line_length(line, self.lines[line].chars().count());
        let last = rest.len() - 1;
        for (k, piece) in rest.into_iter().enumerate() {
            let mut new_line = piece.to_owned();
            if k == last {
                new_line.push_str(&tail);
            }
            self.index.insert_line(line + 1 + k, new_line.chars().count());
            self.lines.insert(line + 1 + k, new_line);
        }
        Ok(())
    }

    fn delete(&mut self, pos: usize, text: &str) -> Result<(), SyncError> {
        let len = self.char_len();
        let count = text.chars().count();
        if pos + count > len {
            return Err(SyncError::OffsetOutOfBounds {
                pos: pos + count,
                len,
            });
        }
        if count == 0 {
            return Ok(());
        }
        let found = self.slice(pos, pos + count);
        if found != text {
            return Err(SyncError::DeleteMismatch {
                pos,
                expected: text.to_owned(),
                found,
            });
        }

        let (line, col) = self.index.locate(pos);
        let (end_line, end_col) = self.index.locate(pos + count);
        let tail_start = byte_offset(&self.lines[end_line], end_col);
        let tail = self.lines[end_line][tail_start..].to_owned();

        let head_end = byte_offset(&self.lines[line], col);
        self.lines[line].truncate(head_end);
        self.lines[line].push_str(&tail);

        for _ in line + 1..=end_line {
            self.lines.remove(line + 1);
            self.index.remove_line(line + 1);
        }
        self.index.set_line_length(line, self.lines[line].chars().count());
        Ok(())
    }
}

fn byte_offset(line: &str, col: usize) -> usize {
    line.char_indices()
        .nth(col)
        .map_or(line.len(), |(byte, _)| byte)
}

/// Apply one op to `buffer`, keeping its index consistent.
///
/// Comment ops anchor a thread and leave the text untouched. On error the
/// buffer is left unchanged.
pub fn apply_op(buffer: &mut TextBuffer, op: &Op) -> Result<(), SyncError> {
    match op {
        Op::Insert { pos, text } => buffer.insert(*pos, text),
        Op::Delete { pos, text } => buffer.delete(*pos, text),
        Op::Comment { pos, text, .. } => {
            let len = buffer.char_len();
            let end = pos + text.chars().count();
            if end > len {
                return Err(SyncError::OffsetOutOfBounds { pos: end, len });
            }
            Ok(())
        }
    }
}

/// Compute the ops turning `old` into `new`.
///
/// Positions are offsets into `old`. The result is in reverse generation
/// order: applying it front to back never invalidates a later op's offset.
pub fn build_ops(old: &[String], new: &[String]) -> Vec<Op> {
    if old == new {
        return Vec::new();
    }

    let starts = PositionIndex::from_lengths(old.iter().map(|l| l.chars().count()));
    let mut ops = Vec::new();

    for diff in capture_diff_slices(Algorithm::Myers, old, new) {
        match diff {
            DiffOp::Equal { .. } => {}
            DiffOp::Insert {
                old_index,
                new_index,
                new_len,
            } => {
                let block = new[new_index..new_index + new_len].join("\n");
                if old.is_empty() {
                    ops.push(Op::insert(0, block));
                } else if old_index < old.len() {
                    ops.push(Op::insert(starts.offset_of(old_index, 0), block + "\n"));
                } else {
                    // Appending after the last line: the new lines hang off
                    // the old last line's (implicit) terminator.
                    ops.push(Op::insert(starts.total_len(), format!("\n{block}")));
                }
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                let block = old[old_index..old_index + old_len].join("\n");
                if old_index + old_len < old.len() {
                    ops.push(Op::delete(starts.offset_of(old_index, 0), block + "\n"));
                } else if old_index > 0 {
                    ops.push(Op::delete(
                        starts.offset_of(old_index, 0) - 1,
                        format!("\n{block}"),
                    ));
                } else {
                    ops.push(Op::delete(0, block));
                }
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                let before: Vec<char> = old[old_index..old_index + old_len]
                    .join("\n")
                    .chars()
                    .collect();
                let after: Vec<char> = new[new_index..new_index + new_len]
                    .join("\n")
                    .chars()
                    .collect();
                let base = starts.offset_of(old_index, 0);
                push_char_ops(&mut ops, base, &before, &after);
            }
        }
    }

    log::debug!("build_ops: {} ops for {} → {} lines", ops.len(), old.len(), new.len());
    ops.reverse();
    ops
}

fn push_char_ops(ops: &mut Vec<Op>, base: usize, before: &[char], after: &[char]) {
    for diff in capture_diff_slices(Algorithm::Myers, before, after) {
        match diff {
            DiffOp::Equal { .. } => {}
            DiffOp::Insert {
                old_index,
                new_index,
                new_len,
            } => {
                let text: String = after[new_index..new_index + new_len].iter().collect();
                ops.push(Op::insert(base + old_index, text));
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                let text: String = before[old_index..old_index + old_len].iter().collect();
                ops.push(Op::delete(base + old_index, text));
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                // Insert is generated first so that, once the batch is
                // reversed, the delete lands before the insert at this offset.
                let inserted: String = after[new_index..new_index + new_len].iter().collect();
                let deleted: String = before[old_index..old_index + old_len].iter().collect();
                ops.push(Op::insert(base + old_index, inserted));
                ops.push(Op::delete(base + old_index, deleted));
            }
        }
    }
}

/// Canonical content hash shared with the server: the git blob hash of the
/// joined lines, `sha1("blob <len>\0<content>")`, as lowercase hex.
pub fn content_hash<S: AsRef<str>>(lines: &[S]) -> String {
    let joined = lines
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\n");
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", joined.chars().count()).as_bytes());
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Undo the server's line encoding: document lines arrive as UTF-8 bytes
/// smuggled through Latin-1 chars. Lines that are not in that form are
/// returned as-is.
pub fn decode_wire_line(line: &str) -> String {
    let bytes: Option<Vec<u8>> = line
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();
    bytes
        .and_then(|b| String::from_utf8(b).ok())
        .unwrap_or_else(|| line.to_owned())
}
