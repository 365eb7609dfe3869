//! Error and disconnect taxonomy for the collaboration layer.

use std::fmt;
use std::time::Duration;

use texsync_core::SyncError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced by sessions and collaborators.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server rejected the request: {0}")]
    ServerRejection(String),

    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),

    #[error("Document out of sync: {0}")]
    Sync(#[from] SyncError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    #[error("Session went down: {0}")]
    Disconnected(DisconnectReason),
}

impl From<reqwest::Error> for CollabError {
    fn from(err: reqwest::Error) -> Self {
        CollabError::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::Transport(err.to_string())
    }
}

/// Why a session went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local request (`disconnect()` / `reconnect()`)
    Requested,
    /// Frame code `0`
    ServerClosed,
    /// Frame code `7`
    Unauthorized,
    /// `connectionRejected`
    Rejected(String),
    /// `forceDisconnect`
    ForceDisconnect(String),
    /// `otUpdateError`, or an error reply to `applyOtUpdate`
    UpdateError(String),
    /// An update was not acknowledged in time
    AckTimeout(Duration),
    /// Socket failed or closed underneath us
    TransportLost(String),
}

impl DisconnectReason {
    /// Short status line for the editor surface.
    pub fn status_text(&self) -> String {
        match self {
            DisconnectReason::Requested => "Disconnected.".to_string(),
            DisconnectReason::ServerClosed => "Error: The server closed the connection.".to_string(),
            DisconnectReason::Unauthorized => "Error: Unauthorized. The session cookies are \
                 probably outdated or not loaded; reload the project page in the browser \
                 used for login to refresh them."
                .to_string(),
            DisconnectReason::Rejected(why) => format!("Error: Connection rejected: {why}"),
            DisconnectReason::ForceDisconnect(why) => format!("Error: Disconnected by server: {why}"),
            DisconnectReason::UpdateError(why) => {
                format!("Error occurred on operation update: {why}")
            }
            DisconnectReason::AckTimeout(after) => format!(
                "Error: The server did not answer for {} seconds.",
                after.as_secs()
            ),
            DisconnectReason::TransportLost(why) => format!("Connection Error: {why}"),
        }
    }

    /// Whether `reconnect()` is expected to help.
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Requested
                | DisconnectReason::TransportLost(_)
                | DisconnectReason::AckTimeout(_)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_text())
    }
}
