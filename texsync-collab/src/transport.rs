//! Socket abstraction under [`ProtocolSession`](crate::session::ProtocolSession).
//!
//! A [`Socket`] is just a pair of text channels; whoever implements
//! [`Transport`] pumps them. The WebSocket implementation runs one writer
//! task and one reader task per connection:
//!
//! ```text
//!  outgoing ──► writer task ──► ws sink
//!  incoming ◄── reader task ◄── ws stream     (channel ends ⇒ socket closed)
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::error::CollabError;

/// Connected text socket.
#[derive(Debug)]
pub struct Socket {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl Socket {
    /// Two sockets wired back to back. Used for in-process peers and tests.
    pub fn pair(capacity: usize) -> (Socket, Socket) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Socket {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Socket {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens sockets to the collaboration server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `url`, presenting `cookie` as the `Cookie` header.
    async fn connect(&self, url: &str, cookie: &str) -> Result<Socket, CollabError>;
}

/// `tokio-tungstenite` backed transport.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    capacity: usize,
}

impl WebSocketTransport {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str, cookie: &str) -> Result<Socket, CollabError> {
        let mut request = url.into_client_request()?;
        if !cookie.is_empty() {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| CollabError::Transport(format!("invalid cookie header: {e}")))?;
            request.headers_mut().insert("Cookie", value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<String>(self.capacity);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: forward text frames until close
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        log::debug!("Socket closed by peer: {frame:?}");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Socket read failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        });

        log::info!("Connected to {url}");
        Ok(Socket {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
