//! # texsync-core: Text synchronization primitives
//!
//! Pure, synchronous building blocks for keeping a local line buffer in
//! step with a remote OT server:
//!
//! ```text
//!  ┌───────────────┐  offsets  ┌───────────────┐  ops   ┌──────────────┐
//!  │ PositionIndex │ ◄───────► │  TextBuffer   │ ─────► │ ThreadIndex  │
//!  │ (line starts) │           │ build/apply   │        │ (comment     │
//!  └───────────────┘           └───────────────┘        │  spans)      │
//!                                                       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`position`]: offset ↔ (line, column) translation
//! - [`op`]: positional insert/delete/comment ops and their wire shape
//! - [`text`]: line buffer, `build_ops`, `apply_op`, content hash
//! - [`threads`]: comment-thread interval index

pub mod op;
pub mod position;
pub mod text;
pub mod threads;

pub use op::Op;
pub use position::PositionIndex;
pub use text::{apply_op, build_ops, content_hash, decode_wire_line, SyncError, TextBuffer};
pub use threads::{Span, ThreadIndex};
