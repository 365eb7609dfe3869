//! Text frame protocol spoken over the collaboration socket.
//!
//! Wire format (one frame per WebSocket text message):
//! ```text
//! code ":" [awaitId ["+"]] ":" [ ":" [answerId ["+"]] payload ]
//!
//!   2::                         heartbeat (both directions)
//!   5:::{"name":..,"args":..}   fire-and-forget event
//!   5:7+::{"name":..,..}        command expecting reply #7
//!   6:::7+[err, ...]            reply to command #7
//! ```
//!
//! | code | meaning                |
//! |------|------------------------|
//! | 0    | fatal close            |
//! | 1    | handshake acknowledged |
//! | 2    | heartbeat              |
//! | 5    | named JSON event       |
//! | 6    | correlated reply       |
//! | 7    | unauthorized           |
//!
//! JSON event payloads are decoded exactly once into [`ServerEvent`];
//! outbound traffic is built from [`Command`] and [`ClientEvent`].

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use texsync_core::Op;
use thiserror::Error;

/// Protocol-level errors. Always recoverable: the receive loop logs them and
/// moves on.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0:?}")]
    MalformedFrame(String),

    #[error("Unknown frame code: {0}")]
    UnknownCode(u8),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Unexpected payload for {what}: {reason}")]
    BadPayload { what: String, reason: String },

    #[error("Reply #{0} matches no pending request")]
    UnmatchedReply(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    fn bad_payload(what: &str, reason: impl fmt::Display) -> Self {
        ProtocolError::BadPayload {
            what: what.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Frames
// ───────────────────────────────────────────────────────────────────

/// Frame kinds, by their leading digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCode {
    Close = 0,
    Handshake = 1,
    Heartbeat = 2,
    Event = 5,
    Reply = 6,
    Unauthorized = 7,
}

impl TryFrom<u8> for FrameCode {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(FrameCode::Close),
            1 => Ok(FrameCode::Handshake),
            2 => Ok(FrameCode::Heartbeat),
            5 => Ok(FrameCode::Event),
            6 => Ok(FrameCode::Reply),
            7 => Ok(FrameCode::Unauthorized),
            other => Err(ProtocolError::UnknownCode(other)),
        }
    }
}

/// One parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: FrameCode,
    /// Id the sender expects a reply for
    pub await_id: Option<u64>,
    pub await_mult: bool,
    /// Id of the request this frame answers
    pub answer_id: Option<u64>,
    pub answer_mult: bool,
    pub payload: String,
}

impl Frame {
    pub fn new(code: FrameCode) -> Self {
        Self {
            code,
            await_id: None,
            await_mult: false,
            answer_id: None,
            answer_mult: false,
            payload: String::new(),
        }
    }

    /// `2::`
    pub fn heartbeat() -> Self {
        Self::new(FrameCode::Heartbeat)
    }

    /// `5:::{payload}`
    pub fn event(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::new(FrameCode::Event)
        }
    }

    /// `5:{id}+::{payload}`
    pub fn request(id: u64, payload: impl Into<String>) -> Self {
        Self {
            await_id: Some(id),
            await_mult: true,
            payload: payload.into(),
            ..Self::new(FrameCode::Event)
        }
    }

    /// `6:::{id}+{payload}`
    pub fn reply(id: u64, payload: impl Into<String>) -> Self {
        Self {
            answer_id: Some(id),
            answer_mult: true,
            payload: payload.into(),
            ..Self::new(FrameCode::Reply)
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        raw.parse()
    }
}

// `"" → (None, false)`, `"12" → (Some(12), false)`, `"12+" → (Some(12), true)`
fn parse_await(part: &str) -> Option<(Option<u64>, bool)> {
    if part.is_empty() {
        return Some((None, false));
    }
    let (digits, mult) = match part.strip_suffix('+') {
        Some(digits) => (digits, true),
        None => (part, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|id| (Some(id), mult))
}

impl FromStr for Frame {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::MalformedFrame(raw.to_string());

        let mut parts = raw.splitn(3, ':');
        let code_part = parts.next().unwrap_or_default();
        let await_part = parts.next().ok_or_else(malformed)?;
        let rest = parts.next().unwrap_or_default();

        if code_part.len() != 1 {
            return Err(malformed());
        }
        let code = code_part
            .bytes()
            .next()
            .filter(u8::is_ascii_digit)
            .ok_or_else(malformed)?;
        let code = FrameCode::try_from(code - b'0')?;

        let (await_id, await_mult) = parse_await(await_part).ok_or_else(malformed)?;
        let mut frame = Frame {
            await_id,
            await_mult,
            ..Frame::new(code)
        };
        if rest.is_empty() {
            return Ok(frame);
        }

        let rest = rest.strip_prefix(':').ok_or_else(malformed)?;
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (digits, tail) = rest.split_at(digits_end);
        if !digits.is_empty() {
            frame.answer_id = Some(digits.parse().map_err(|_| malformed())?);
            if let Some(payload) = tail.strip_prefix('+') {
                frame.answer_mult = true;
                frame.payload = payload.to_string();
                return Ok(frame);
            }
        }
        frame.payload = tail.to_string();
        Ok(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.code as u8)?;
        if let Some(id) = self.await_id {
            write!(f, "{id}{}", if self.await_mult { "+" } else { "" })?;
        }
        f.write_str(":")?;
        if self.answer_id.is_some() || !self.payload.is_empty() {
            f.write_str(":")?;
            if let Some(id) = self.answer_id {
                write!(f, "{id}{}", if self.answer_mult { "+" } else { "" })?;
            }
            f.write_str(&self.payload)?;
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client events
// ───────────────────────────────────────────────────────────────────

/// A JSON event before its name is interpreted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// A remote collaborator's cursor as broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CursorUpdate {
    /// Public client id of the collaborator
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub row: Option<usize>,
    #[serde(default)]
    pub column: Option<usize>,
}

/// One applied update broadcast to project members.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteUpdate {
    pub doc: String,
    /// Missing when the update echoes our own acknowledged batch
    #[serde(default)]
    pub op: Option<Vec<Op>>,
    /// Server version the ops were applied at
    #[serde(default)]
    pub v: Option<u64>,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Comment-thread notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEventKind {
    Resolved,
    Reopened,
    NewComment,
    MessageEdited,
    MessageDeleted,
    Deleted,
}

/// Every server event this client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConnectionAccepted { public_id: Option<String> },
    ConnectionRejected { reason: String },
    ForceDisconnect { reason: String },
    BroadcastDocMeta,
    ClientUpdated(Vec<CursorUpdate>),
    ClientDisconnected(Vec<String>),
    OtUpdateApplied(Vec<RemoteUpdate>),
    OtUpdateError { message: String },
    ThreadChanged { kind: ThreadEventKind, thread_id: String },
}

fn first_as_text(args: &[Value]) -> String {
    match args.first() {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}

fn each_arg<T: DeserializeOwned>(what: &str, args: Vec<Value>) -> Result<Vec<T>, ProtocolError> {
    args.into_iter()
        .map(|arg| serde_json::from_value(arg).map_err(|e| ProtocolError::bad_payload(what, e)))
        .collect()
}

impl ServerEvent {
    /// Decode the payload of a code-5 frame.
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let raw: RawEvent = serde_json::from_str(payload)?;
        Self::decode(raw)
    }

    pub fn decode(raw: RawEvent) -> Result<Self, ProtocolError> {
        let RawEvent { name, args } = raw;
        let thread_kind = match name.as_str() {
            "connectionAccepted" => {
                let public_id = args.get(1).and_then(Value::as_str).map(str::to_owned);
                return Ok(ServerEvent::ConnectionAccepted { public_id });
            }
            "connectionRejected" => {
                return Ok(ServerEvent::ConnectionRejected {
                    reason: first_as_text(&args),
                })
            }
            "forceDisconnect" => {
                return Ok(ServerEvent::ForceDisconnect {
                    reason: first_as_text(&args),
                })
            }
            "broadcastDocMeta" => return Ok(ServerEvent::BroadcastDocMeta),
            "clientTracking.clientUpdated" => {
                return Ok(ServerEvent::ClientUpdated(each_arg(&name, args)?))
            }
            "clientTracking.clientDisconnected" => {
                return Ok(ServerEvent::ClientDisconnected(each_arg(&name, args)?))
            }
            "otUpdateApplied" => return Ok(ServerEvent::OtUpdateApplied(each_arg(&name, args)?)),
            "otUpdateError" => {
                return Ok(ServerEvent::OtUpdateError {
                    message: first_as_text(&args),
                })
            }
            "resolve-thread" => ThreadEventKind::Resolved,
            "reopen-thread" => ThreadEventKind::Reopened,
            "new-comment" => ThreadEventKind::NewComment,
            "edit-message" => ThreadEventKind::MessageEdited,
            "delete-message" => ThreadEventKind::MessageDeleted,
            "delete-thread" => ThreadEventKind::Deleted,
            _ => return Err(ProtocolError::UnknownEvent(name)),
        };

        let thread_id = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::bad_payload(&name, "missing thread id"))?;
        Ok(ServerEvent::ThreadChanged {
            kind: thread_kind,
            thread_id: thread_id.to_string(),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Client → server traffic
// ───────────────────────────────────────────────────────────────────

/// Track-changes marker attached to an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeta {
    pub tc: String,
}

/// Body of an `applyOtUpdate` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundUpdate {
    pub doc: String,
    pub op: Vec<Op>,
    pub v: u64,
    #[serde(rename = "lastV")]
    pub last_v: i64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<UpdateMeta>,
}

impl OutboundUpdate {
    pub fn new(doc: impl Into<String>, op: Vec<Op>, version: u64, hash: impl Into<String>) -> Self {
        Self {
            doc: doc.into(),
            op,
            v: version,
            last_v: version as i64 - 1,
            hash: hash.into(),
            meta: None,
        }
    }

    pub fn with_track_change(mut self, change_id: impl Into<String>) -> Self {
        self.meta = Some(UpdateMeta { tc: change_id.into() });
        self
    }
}

/// Commands that expect a correlated reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    JoinProject { project_id: String },
    JoinDoc { doc_id: String },
    LeaveDoc { doc_id: String },
    ApplyOtUpdate { doc_id: String, update: OutboundUpdate },
    GetConnectedUsers,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::JoinProject { .. } => "joinProject",
            Command::JoinDoc { .. } => "joinDoc",
            Command::LeaveDoc { .. } => "leaveDoc",
            Command::ApplyOtUpdate { .. } => "applyOtUpdate",
            Command::GetConnectedUsers => "clientTracking.getConnectedUsers",
        }
    }

    /// Replies that change document state; the receive loop delivers them
    /// in order with events instead of waking the requester directly.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Command::JoinDoc { .. } | Command::ApplyOtUpdate { .. })
    }

    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Command::JoinDoc { doc_id }
            | Command::LeaveDoc { doc_id }
            | Command::ApplyOtUpdate { doc_id, .. } => Some(doc_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        let args = match self {
            Command::JoinProject { project_id } => json!([{ "project_id": project_id }]),
            Command::JoinDoc { doc_id } => json!([doc_id, { "encodeRanges": true }]),
            Command::LeaveDoc { doc_id } => json!([doc_id]),
            Command::ApplyOtUpdate { doc_id, update } => json!([doc_id, update]),
            Command::GetConnectedUsers => json!([]),
        };
        json!({ "name": self.name(), "args": args })
    }
}

/// Fire-and-forget events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Zero-based row and column of the local cursor.
    UpdatePosition { doc_id: String, row: usize, column: usize },
}

impl ClientEvent {
    pub fn to_json(&self) -> Value {
        match self {
            ClientEvent::UpdatePosition { doc_id, row, column } => json!({
                "name": "clientTracking.updatePosition",
                "args": [{ "doc_id": doc_id, "row": row, "column": column }],
            }),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Replies
// ───────────────────────────────────────────────────────────────────

/// A code-6 frame: `[err, ...results]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub args: Vec<Value>,
}

impl Reply {
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let id = frame
            .answer_id
            .ok_or_else(|| ProtocolError::MalformedFrame(frame.to_string()))?;
        let args = match frame.payload.trim() {
            "" => Vec::new(),
            payload => match serde_json::from_str(payload)? {
                Value::Array(args) => args,
                single => vec![single],
            },
        };
        Ok(Self { id, args })
    }

    /// Server-side error, if the first slot is not null.
    pub fn error(&self) -> Option<String> {
        match self.args.first() {
            None | Some(Value::Null) => None,
            Some(_) => Some(first_as_text(&self.args)),
        }
    }

    /// Deserialize slot `index`; `null`/missing slots decode as `T::default()`.
    pub fn arg_or_default<T: DeserializeOwned + Default>(&self, index: usize) -> Result<T, ProtocolError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ProtocolError::bad_payload(&format!("reply #{} slot {index}", self.id), e)),
        }
    }

    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ProtocolError> {
        let value = self.args.get(index).cloned().ok_or_else(|| {
            ProtocolError::bad_payload(&format!("reply #{}", self.id), format!("missing slot {index}"))
        })?;
        serde_json::from_value(value)
            .map_err(|e| ProtocolError::bad_payload(&format!("reply #{} slot {index}", self.id), e))
    }
}

/// Anchor of an existing comment inside a `joinDoc` reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommentAnchor {
    #[serde(rename = "p")]
    pub pos: usize,
    #[serde(rename = "c")]
    pub text: String,
    #[serde(rename = "t", default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommentRange {
    pub id: String,
    pub op: CommentAnchor,
}

impl CommentRange {
    pub fn thread_id(&self) -> &str {
        self.op.thread_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ranges {
    #[serde(default)]
    pub comments: Vec<CommentRange>,
}

/// `joinDoc` reply: `[err, lines, version, updates, ranges]`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinDocReply {
    /// Raw lines, still in the wire encoding
    pub lines: Vec<String>,
    pub version: u64,
    pub updates: Vec<RemoteUpdate>,
    pub ranges: Ranges,
}

impl JoinDocReply {
    pub fn from_reply(reply: &Reply) -> Result<Self, ProtocolError> {
        Ok(Self {
            lines: reply.arg(1)?,
            version: reply.arg(2)?,
            updates: reply.arg_or_default(3)?,
            ranges: reply.arg_or_default(4)?,
        })
    }
}

/// `joinProject` reply: `[err, project, permissionsLevel, protocolVersion]`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinProjectReply {
    pub project: Value,
}

impl JoinProjectReply {
    pub fn from_reply(reply: &Reply) -> Result<Self, ProtocolError> {
        Ok(Self {
            project: reply.arg(1)?,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.project.get("name").and_then(Value::as_str)
    }

    pub fn root_doc_id(&self) -> Option<&str> {
        self.project.get("rootDoc_id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CursorData {
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub row: Option<usize>,
    #[serde(default)]
    pub column: Option<usize>,
}

/// Entry of the `clientTracking.getConnectedUsers` reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectedUser {
    pub client_id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, rename = "cursorData")]
    pub cursor_data: Option<CursorData>,
}

impl ConnectedUser {
    pub fn into_cursor_update(self) -> CursorUpdate {
        let name = match (self.first_name, self.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (first, last) => first.or(last),
        };
        let cursor = self.cursor_data.unwrap_or_default();
        CursorUpdate {
            id: self.client_id,
            name,
            doc_id: cursor.doc_id,
            row: cursor.row,
            column: cursor.column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_heartbeat() {
        let frame = Frame::parse("2::").unwrap();
        assert_eq!(frame, Frame::heartbeat());
        assert_eq!(frame.to_string(), "2::");
    }

    #[test]
    fn test_parse_event() {
        let frame = Frame::parse(r#"5:::{"name":"x","args":[]}"#).unwrap();
        assert_eq!(frame.code, FrameCode::Event);
        assert_eq!(frame.await_id, None);
        assert_eq!(frame.answer_id, None);
        assert_eq!(frame.payload, r#"{"name":"x","args":[]}"#);
    }

    #[test]
    fn test_parse_request() {
        let frame = Frame::parse(r#"5:12+::{"name":"joinDoc"}"#).unwrap();
        assert_eq!(frame.await_id, Some(12));
        assert!(frame.await_mult);
        assert_eq!(frame.payload, r#"{"name":"joinDoc"}"#);
    }

    #[test]
    fn test_parse_reply() {
        let frame = Frame::parse(r#"6:::3+[null,["a:b"],4]"#).unwrap();
        assert_eq!(frame.code, FrameCode::Reply);
        assert_eq!(frame.answer_id, Some(3));
        assert!(frame.answer_mult);
        assert_eq!(frame.payload, r#"[null,["a:b"],4]"#);
    }

    #[test]
    fn test_parse_handshake_and_close() {
        assert_eq!(Frame::parse("1::").unwrap().code, FrameCode::Handshake);
        assert_eq!(Frame::parse("0::").unwrap().code, FrameCode::Close);
        assert_eq!(Frame::parse("7:::").unwrap().code, FrameCode::Unauthorized);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(Frame::parse(""), Err(ProtocolError::MalformedFrame(_))));
        assert!(matches!(Frame::parse("5"), Err(ProtocolError::MalformedFrame(_))));
        assert!(matches!(Frame::parse("x::"), Err(ProtocolError::MalformedFrame(_))));
        assert!(matches!(Frame::parse("5:a+::"), Err(ProtocolError::MalformedFrame(_))));
        assert!(matches!(Frame::parse("4::"), Err(ProtocolError::UnknownCode(4))));
    }

    #[test]
    fn test_encode_shapes() {
        assert_eq!(Frame::request(7, "{}").to_string(), "5:7+::{}");
        assert_eq!(Frame::event("{}").to_string(), "5:::{}");
        assert_eq!(Frame::reply(7, "[null]").to_string(), "6:::7+[null]");
        assert_eq!(Frame::new(FrameCode::Handshake).to_string(), "1::");
    }

    #[test]
    fn test_decode_connection_accepted() {
        let event = ServerEvent::parse(r#"{"name":"connectionAccepted","args":[null,"pub-1"]}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::ConnectionAccepted {
                public_id: Some("pub-1".into())
            }
        );
    }

    #[test]
    fn test_decode_ot_update_applied() {
        let event = ServerEvent::parse(
            r#"{"name":"otUpdateApplied","args":[{"doc":"d1","op":[{"p":0,"i":"x"}],"v":7}]}"#,
        )
        .unwrap();
        match event {
            ServerEvent::OtUpdateApplied(updates) => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].doc, "d1");
                assert_eq!(updates[0].v, Some(7));
                assert_eq!(updates[0].op, Some(vec![Op::insert(0, "x")]));
            }
            other => panic!("Expected OtUpdateApplied, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_own_update_echo_has_no_ops() {
        let event =
            ServerEvent::parse(r#"{"name":"otUpdateApplied","args":[{"doc":"d1","v":4}]}"#).unwrap();
        assert!(matches!(event, ServerEvent::OtUpdateApplied(ref u) if u[0].op.is_none()));
    }

    #[test]
    fn test_decode_cursor_events() {
        let event = ServerEvent::parse(
            r#"{"name":"clientTracking.clientUpdated","args":[{"id":"c1","name":"Ada","doc_id":"d","row":2,"column":5,"email":"a@b"}]}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::ClientUpdated(vec![CursorUpdate {
                id: "c1".into(),
                name: Some("Ada".into()),
                doc_id: Some("d".into()),
                row: Some(2),
                column: Some(5),
            }])
        );

        let event =
            ServerEvent::parse(r#"{"name":"clientTracking.clientDisconnected","args":["c1"]}"#).unwrap();
        assert_eq!(event, ServerEvent::ClientDisconnected(vec!["c1".into()]));
    }

    #[test]
    fn test_decode_thread_events() {
        let event = ServerEvent::parse(r#"{"name":"resolve-thread","args":["t1",{"id":"u"}]}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::ThreadChanged {
                kind: ThreadEventKind::Resolved,
                thread_id: "t1".into()
            }
        );
        assert!(ServerEvent::parse(r#"{"name":"delete-thread","args":[]}"#).is_err());
    }

    #[test]
    fn test_decode_errors() {
        let event = ServerEvent::parse(r#"{"name":"otUpdateError","args":["Delete component does not match"]}"#)
            .unwrap();
        assert_eq!(
            event,
            ServerEvent::OtUpdateError {
                message: "Delete component does not match".into()
            }
        );
        assert!(matches!(
            ServerEvent::parse(r#"{"name":"mystery","args":[]}"#),
            Err(ProtocolError::UnknownEvent(name)) if name == "mystery"
        ));
        assert!(matches!(ServerEvent::parse("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_command_json() {
        let join = Command::JoinDoc { doc_id: "d1".into() }.to_json();
        assert_eq!(join, json!({"name": "joinDoc", "args": ["d1", {"encodeRanges": true}]}));

        let project = Command::JoinProject { project_id: "p1".into() }.to_json();
        assert_eq!(project, json!({"name": "joinProject", "args": [{"project_id": "p1"}]}));
    }

    #[test]
    fn test_apply_ot_update_payload() {
        let update = OutboundUpdate::new(
            "d1",
            vec![Op::delete(6, "r"), Op::insert(6, "z")],
            4,
            "000c335453c94dd705d346ed94210987ae68d327",
        );
        let command = Command::ApplyOtUpdate {
            doc_id: "d1".into(),
            update,
        };
        assert_eq!(
            command.to_json(),
            json!({
                "name": "applyOtUpdate",
                "args": ["d1", {
                    "doc": "d1",
                    "op": [{"p": 6, "d": "r"}, {"p": 6, "i": "z"}],
                    "v": 4,
                    "lastV": 3,
                    "hash": "000c335453c94dd705d346ed94210987ae68d327"
                }]
            })
        );
    }

    #[test]
    fn test_track_change_meta() {
        let update = OutboundUpdate::new("d", vec![], 1, "h").with_track_change("abc");
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["meta"], json!({"tc": "abc"}));
    }

    #[test]
    fn test_update_position_event() {
        let event = ClientEvent::UpdatePosition {
            doc_id: "d".into(),
            row: 3,
            column: 1,
        };
        assert_eq!(
            event.to_json(),
            json!({"name": "clientTracking.updatePosition", "args": [{"doc_id": "d", "row": 3, "column": 1}]})
        );
    }

    #[test]
    fn test_join_doc_reply() {
        let frame = Frame::parse(
            r#"6:::2+[null,["foo","bar"],4,[],{"comments":[{"id":"c1","op":{"p":0,"c":"foo","t":"t1"}}]}]"#,
        )
        .unwrap();
        let reply = Reply::from_frame(&frame).unwrap();
        assert_eq!(reply.error(), None);

        let joined = JoinDocReply::from_reply(&reply).unwrap();
        assert_eq!(joined.lines, vec!["foo", "bar"]);
        assert_eq!(joined.version, 4);
        assert!(joined.updates.is_empty());
        assert_eq!(joined.ranges.comments[0].thread_id(), "t1");
    }

    #[test]
    fn test_join_doc_reply_without_ranges() {
        let frame = Frame::parse(r#"6:::2+[null,[],1]"#).unwrap();
        let joined = JoinDocReply::from_reply(&Reply::from_frame(&frame).unwrap()).unwrap();
        assert_eq!(joined.ranges, Ranges::default());
    }

    #[test]
    fn test_reply_error_slot() {
        let frame = Frame::parse(r#"6:::9+[{"message":"not allowed"}]"#).unwrap();
        let reply = Reply::from_frame(&frame).unwrap();
        assert_eq!(reply.error().as_deref(), Some("not allowed"));
    }

    #[test]
    fn test_connected_user_into_cursor() {
        let user: ConnectedUser = serde_json::from_value(json!({
            "client_id": "c9",
            "first_name": "Grace",
            "last_name": "Hopper",
            "cursorData": {"doc_id": "d", "row": 1, "column": 0}
        }))
        .unwrap();
        let cursor = user.into_cursor_update();
        assert_eq!(cursor.id, "c9");
        assert_eq!(cursor.name.as_deref(), Some("Grace Hopper"));
        assert_eq!(cursor.row, Some(1));
    }
}
