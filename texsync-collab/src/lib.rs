//! Real-time collaboration client for texsync.
//!
//! Keeps local documents in step with a LaTeX collaboration server over a
//! socket.io-style WebSocket protocol:
//!
//! ```text
//! ┌──────────┐  SurfaceEvent   ┌────────────────┐  frames   ┌────────┐
//! │  Editor  │ ◄────────────── │ ProjectSession │ ◄───────► │ Server │
//! │ surface  │ ──────────────► │  (documents,   │   HTTP    │        │
//! └──────────┘  local edits    │   op queue)    │ ◄───────► │        │
//!                              └────────────────┘           └────────┘
//! ```
//!
//! - [`protocol`]: frame codec, server events, commands and replies
//! - [`transport`]: socket abstraction and the WebSocket implementation
//! - [`session`]: request/reply correlation, heartbeats, teardown
//! - [`queue`]: outbound coalescing and single-flight per document
//! - [`project`]: the orchestrator the editor talks to
//! - [`api`]: HTTP side (threads, compile, git sync)

pub mod api;
pub mod config;
pub mod document;
pub mod error;
pub mod ids;
pub mod presence;
pub mod project;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod surface;
pub mod transport;

pub use api::{CompileOutcome, HttpProjectApi, ProjectApi, ThreadAction, ThreadListing, ThreadRecord};
pub use config::{Credentials, SessionConfig};
pub use error::{CollabError, DisconnectReason};
pub use project::ProjectSession;
pub use protocol::{Frame, FrameCode, ProtocolError, ServerEvent};
pub use queue::{FlowControl, OpQueue};
pub use session::{ConnectionState, ProtocolSession};
pub use surface::{BufferRegistry, HighlightKind, SurfaceEvent, TextRange};
pub use transport::{Socket, Transport, WebSocketTransport};
