//! HTTP collaborator: socket discovery, comment threads, compile, git sync.
//!
//! ```text
//! GET  {base}/socket.io/1/?t={ts}                  → "{channel}:..."
//! GET  {base}/project/{id}/threads                 → { thread_id: ThreadRecord }
//! POST {base}/project/{id}/thread/{tid}/{action}   ← {_csrf, content?}
//! POST {base}/project/{id}/compile?enable_pdf_caching=true
//! POST {base}/project/{id}/github-sync/merge       ← {message}
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Credentials;
use crate::error::CollabError;
use crate::ids;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageAuthor {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub user: Option<MessageAuthor>,
    /// Locally added, not yet confirmed by the server
    #[serde(skip)]
    pub pending: bool,
}

impl ThreadMessage {
    pub fn pending(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            pending: true,
            ..Self::default()
        }
    }
}

/// One comment thread as listed by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    #[serde(default)]
    pub messages: Vec<ThreadMessage>,
    #[serde(default)]
    pub resolved: bool,
}

pub type ThreadListing = HashMap<String, ThreadRecord>;

/// Thread mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadAction {
    Resolve,
    Reopen,
    /// Post a message; the first message creates the thread
    Message(String),
}

impl ThreadAction {
    pub fn path_segment(&self) -> &'static str {
        match self {
            ThreadAction::Resolve => "resolve",
            ThreadAction::Reopen => "reopen",
            ThreadAction::Message(_) => "messages",
        }
    }
}

/// Result of a compile request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompileOutcome {
    pub status: String,
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Everything the session needs from the HTTP side of the server.
#[async_trait]
pub trait ProjectApi: Send + Sync {
    /// WebSocket URL for a fresh socket.
    async fn socket_url(&self) -> Result<String, CollabError>;

    async fn list_threads(&self) -> Result<ThreadListing, CollabError>;

    async fn thread_action(&self, thread_id: &str, action: ThreadAction) -> Result<(), CollabError>;

    async fn compile(&self, root_doc_id: &str) -> Result<CompileOutcome, CollabError>;

    async fn sync_git(&self, message: &str) -> Result<(), CollabError>;
}

/// Build the socket URL from the handshake body `"{channel}:{hb}:{close}:{transports}"`.
pub fn websocket_url(base_url: &str, handshake: &str) -> Result<String, CollabError> {
    let channel = handshake
        .split(':')
        .next()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CollabError::Http(format!("bad socket handshake: {handshake:?}")))?;

    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(CollabError::Http(format!("unsupported base url: {base_url}")));
    };
    Ok(format!("{ws_base}/socket.io/1/websocket/{channel}"))
}

/// `reqwest` implementation of [`ProjectApi`].
#[derive(Debug, Clone)]
pub struct HttpProjectApi {
    client: reqwest::Client,
    credentials: Credentials,
    project_id: String,
}

impl HttpProjectApi {
    pub fn new(credentials: Credentials, project_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            project_id: project_id.into(),
        }
    }

    fn project_url(&self) -> String {
        self.credentials.project_url(&self.project_id)
    }

    fn expect_success(response: &reqwest::Response, what: &str) -> Result<(), CollabError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CollabError::Http(format!("{what} failed: {status}")))
        }
    }
}

#[async_trait]
impl ProjectApi for HttpProjectApi {
    async fn socket_url(&self) -> Result<String, CollabError> {
        let url = format!(
            "{}/socket.io/1/?t={}",
            self.credentials.base_url,
            ids::handshake_timestamp()
        );
        let response = self
            .client
            .get(&url)
            .header(COOKIE, &self.credentials.cookie)
            .send()
            .await?;
        Self::expect_success(&response, "socket handshake")?;
        let body = response.text().await?;
        log::debug!("Socket handshake: {body}");
        websocket_url(&self.credentials.base_url, &body)
    }

    async fn list_threads(&self) -> Result<ThreadListing, CollabError> {
        let response = self
            .client
            .get(format!("{}/threads", self.project_url()))
            .header(COOKIE, &self.credentials.cookie)
            .send()
            .await?;
        Self::expect_success(&response, "thread listing")?;
        let listing: ThreadListing = response.json().await?;
        log::debug!("Listed {} threads", listing.len());
        Ok(listing)
    }

    async fn thread_action(&self, thread_id: &str, action: ThreadAction) -> Result<(), CollabError> {
        let url = format!(
            "{}/thread/{thread_id}/{}",
            self.project_url(),
            action.path_segment()
        );
        let body = match &action {
            ThreadAction::Message(content) => json!({ "_csrf": self.credentials.csrf, "content": content }),
            _ => json!({ "_csrf": self.credentials.csrf }),
        };
        let response = self
            .client
            .post(url)
            .header(COOKIE, &self.credentials.cookie)
            .json(&body)
            .send()
            .await?;
        Self::expect_success(&response, action.path_segment())
    }

    async fn compile(&self, root_doc_id: &str) -> Result<CompileOutcome, CollabError> {
        let response = self
            .client
            .post(format!("{}/compile?enable_pdf_caching=true", self.project_url()))
            .header(COOKIE, &self.credentials.cookie)
            .header("x-csrf-token", &self.credentials.csrf)
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({
                "rootDoc_id": root_doc_id,
                "draft": false,
                "check": "silent",
                "incrementalCompilesEnabled": true,
                "stopOnFirstError": false,
            }))
            .send()
            .await?;
        Self::expect_success(&response, "compile")?;
        let outcome: CompileOutcome = response.json().await?;
        log::info!("Compile finished: {}", outcome.status);
        Ok(outcome)
    }

    async fn sync_git(&self, message: &str) -> Result<(), CollabError> {
        let response = self
            .client
            .post(format!("{}/github-sync/merge", self.project_url()))
            .header(COOKIE, &self.credentials.cookie)
            .header("x-csrf-token", &self.credentials.csrf)
            .json(&json!({ "message": message }))
            .send()
            .await?;
        Self::expect_success(&response, "git sync")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("https://www.overleaf.com", "abc123:60:60:websocket,xhr-polling").unwrap(),
            "wss://www.overleaf.com/socket.io/1/websocket/abc123"
        );
        assert_eq!(
            websocket_url("http://localhost:8080/", "ch:1:1:websocket").unwrap(),
            "ws://localhost:8080/socket.io/1/websocket/ch"
        );
        assert!(websocket_url("https://x", "").is_err());
        assert!(websocket_url("ftp://x", "ch:1").is_err());
    }

    #[test]
    fn test_thread_listing_decodes() {
        let listing: ThreadListing = serde_json::from_str(
            r#"{
                "t1": {"messages": [{"id": "m1", "content": "typo?", "timestamp": 1700000000000,
                                     "user": {"first_name": "Ada", "email": "a@b"}}]},
                "t2": {"messages": [], "resolved": true, "resolved_at": "2024-01-01"}
            }"#,
        )
        .unwrap();

        assert_eq!(listing.len(), 2);
        let t1 = &listing["t1"];
        assert!(!t1.resolved);
        assert_eq!(t1.messages[0].content, "typo?");
        assert!(!t1.messages[0].pending);
        assert_eq!(
            t1.messages[0].user.as_ref().and_then(|u| u.first_name.as_deref()),
            Some("Ada")
        );
        assert!(listing["t2"].resolved);
    }

    #[test]
    fn test_thread_action_segments() {
        assert_eq!(ThreadAction::Resolve.path_segment(), "resolve");
        assert_eq!(ThreadAction::Reopen.path_segment(), "reopen");
        assert_eq!(ThreadAction::Message("hi".into()).path_segment(), "messages");
    }

    #[test]
    fn test_compile_outcome() {
        let ok: CompileOutcome = serde_json::from_str(r#"{"status":"success","outputFiles":[]}"#).unwrap();
        assert!(ok.is_success());
        let failed: CompileOutcome = serde_json::from_str(r#"{"status":"failure"}"#).unwrap();
        assert!(!failed.is_success());
    }
}
