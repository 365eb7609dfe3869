//! Positional text operations exchanged with the server.
//!
//! Wire format (JSON objects, keyed by single letters):
//! ```text
//! {"p": 6, "i": "z"}               insert "z" at offset 6
//! {"p": 6, "d": "r"}               delete "r" starting at offset 6
//! {"p": 0, "c": "foo", "t": "…"}   comment thread anchored on "foo"
//! ```

use serde::{Deserialize, Serialize};

/// One edit against the joined document content.
///
/// `pos` is an absolute char offset. Ops are immutable once built; ordering
/// within a batch matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Op {
    // Listed first: untagged decoding tries variants in order and a comment
    // carries the most fields.
    Comment {
        #[serde(rename = "p")]
        pos: usize,
        #[serde(rename = "c")]
        text: String,
        #[serde(rename = "t")]
        thread_id: String,
    },
    Insert {
        #[serde(rename = "p")]
        pos: usize,
        #[serde(rename = "i")]
        text: String,
    },
    Delete {
        #[serde(rename = "p")]
        pos: usize,
        #[serde(rename = "d")]
        text: String,
    },
}

impl Op {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Op::Insert { pos, text: text.into() }
    }

    pub fn delete(pos: usize, text: impl Into<String>) -> Self {
        Op::Delete { pos, text: text.into() }
    }

    pub fn comment(pos: usize, text: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Op::Comment {
            pos,
            text: text.into(),
            thread_id: thread_id.into(),
        }
    }

    /// Absolute offset the op applies at.
    pub fn pos(&self) -> usize {
        match self {
            Op::Insert { pos, .. } | Op::Delete { pos, .. } | Op::Comment { pos, .. } => *pos,
        }
    }

    /// The op's text payload.
    pub fn text(&self) -> &str {
        match self {
            Op::Insert { text, .. } | Op::Delete { text, .. } | Op::Comment { text, .. } => text,
        }
    }

    /// Length of the payload in chars (the unit offsets are measured in).
    pub fn char_len(&self) -> usize {
        self.text().chars().count()
    }

    pub fn is_comment(&self) -> bool {
        matches!(self, Op::Comment { .. })
    }

    /// Thread id for comment ops.
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Op::Comment { thread_id, .. } => Some(thread_id),
            _ => None,
        }
    }
}
