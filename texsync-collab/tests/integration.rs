//! End-to-end tests over a real WebSocket.
//!
//! Each test starts a scripted server on a free port and plays the server
//! side of the protocol by hand, frame by frame.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use texsync_collab::{
    CollabError, CompileOutcome, ConnectionState, Credentials, DisconnectReason, Frame, ProjectApi, ProjectSession,
    SessionConfig, SurfaceEvent, ThreadAction, ThreadListing, WebSocketTransport,
};
use texsync_core::content_hash;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(3);

/// Server end of one accepted socket.
struct Peer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    fn send(&self, raw: impl Into<String>) {
        self.to_client.send(raw.into()).unwrap();
    }

    fn event(&self, name: &str, args: Value) {
        self.send(format!("5:::{}", json!({ "name": name, "args": args })));
    }

    fn reply(&self, id: u64, args: Value) {
        self.send(format!("6:::{id}+{args}"));
    }

    /// Next client request, skipping heartbeats: `(id, name, args)`.
    async fn request(&mut self) -> (u64, String, Value) {
        loop {
            let raw = timeout(WAIT, self.from_client.recv())
                .await
                .expect("client went quiet")
                .expect("client hung up");
            let frame = Frame::parse(&raw).unwrap();
            if frame.payload.is_empty() {
                continue;
            }
            let body: Value = serde_json::from_str(&frame.payload).unwrap();
            let name = body["name"].as_str().unwrap_or_default().to_string();
            if let Some(id) = frame.await_id {
                return (id, name, body["args"].clone());
            }
        }
    }

    /// Whether the client stays silent (heartbeats aside) for `period`.
    async fn is_quiet_for(&mut self, period: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + period;
        loop {
            match tokio::time::timeout_at(deadline, self.from_client.recv()).await {
                Err(_) => return true,
                Ok(Some(raw)) if raw == "2::" => continue,
                Ok(_) => return false,
            }
        }
    }

    /// Resolves once the client closed the socket.
    async fn closed(&mut self) {
        while self.from_client.recv().await.is_some() {}
    }
}

/// Listen on a free port and accept exactly one WebSocket client.
async fn scripted_server() -> (String, JoinHandle<Peer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();

        let (to_client, mut outgoing) = mpsc::unbounded_channel::<String>();
        let (incoming, from_client) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outgoing.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        tokio::spawn(async move {
            while let Some(Ok(msg)) = source.next().await {
                match msg {
                    Message::Text(text) => {
                        if incoming.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        Peer { to_client, from_client }
    });

    (format!("ws://127.0.0.1:{port}/socket.io/1/websocket/chan"), accept)
}

struct StaticApi {
    socket_url: String,
}

#[async_trait]
impl ProjectApi for StaticApi {
    async fn socket_url(&self) -> Result<String, CollabError> {
        Ok(self.socket_url.clone())
    }

    async fn list_threads(&self) -> Result<ThreadListing, CollabError> {
        Ok(ThreadListing::new())
    }

    async fn thread_action(&self, _thread_id: &str, _action: ThreadAction) -> Result<(), CollabError> {
        Ok(())
    }

    async fn compile(&self, _root_doc_id: &str) -> Result<CompileOutcome, CollabError> {
        Ok(CompileOutcome {
            status: "success".into(),
        })
    }

    async fn sync_git(&self, _message: &str) -> Result<(), CollabError> {
        Ok(())
    }
}

async fn start_session(config: SessionConfig) -> (ProjectSession, mpsc::UnboundedReceiver<SurfaceEvent>, Peer) {
    let (url, accept) = scripted_server().await;
    let (session, events) = ProjectSession::new(
        "proj",
        Credentials::new("http://127.0.0.1", "sid=abc", "csrf"),
        config,
        Arc::new(StaticApi { socket_url: url }),
        Arc::new(WebSocketTransport::default()),
    );
    session.connect().await.unwrap();
    let peer = timeout(WAIT, accept).await.unwrap().unwrap();
    (session, events, peer)
}

/// Connect and walk through `connectionAccepted` → `joinProject` →
/// `getConnectedUsers`.
async fn joined_session(config: SessionConfig) -> (ProjectSession, mpsc::UnboundedReceiver<SurfaceEvent>, Peer) {
    let (session, events, mut peer) = start_session(config).await;
    peer.send("1::");
    peer.event("connectionAccepted", json!([null, "me"]));

    let (id, name, args) = peer.request().await;
    assert_eq!(name, "joinProject");
    assert_eq!(args[0]["project_id"], "proj");
    peer.reply(id, json!([null, {"name": "Paper", "rootDoc_id": "root"}, "owner", 2]));
    session.wait_until_joined().await.unwrap();

    let (id, name, _) = peer.request().await;
    assert_eq!(name, "clientTracking.getConnectedUsers");
    peer.reply(id, json!([null, []]));
    (session, events, peer)
}

async fn join_doc(session: &ProjectSession, peer: &mut Peer, doc_id: &str, lines: Value, version: u64) {
    let join = {
        let session = session.clone();
        let doc_id = doc_id.to_string();
        tokio::spawn(async move { session.join_document(&doc_id).await })
    };
    let (id, name, args) = peer.request().await;
    assert_eq!(name, "joinDoc");
    assert_eq!(args[0], doc_id);
    peer.reply(id, json!([null, lines, version, [], {"comments": []}]));
    timeout(WAIT, join).await.unwrap().unwrap().unwrap();
}

fn lines(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

async fn wait_for_version(session: &ProjectSession, doc_id: &str, version: u64) {
    timeout(WAIT, async {
        while session.document_version(doc_id).await != Some(version) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("version never reached");
}

#[tokio::test]
async fn test_join_project_and_document() {
    let (session, mut events, mut peer) = joined_session(SessionConfig::default()).await;
    assert_eq!(session.state().await, ConnectionState::Connected);
    assert_eq!(session.project_name().await.as_deref(), Some("Paper"));

    // Latin-1 wire encoding is decoded
    join_doc(&session, &mut peer, "d1", json!(["caf\u{00c3}\u{00a9}", "x"]), 9).await;
    assert_eq!(session.document_lines("d1").await, Some(lines(&["café", "x"])));
    assert_eq!(session.document_version("d1").await, Some(9));

    let mut wrote = false;
    while let Ok(event) = events.try_recv() {
        if let SurfaceEvent::Write { doc_id, .. } = event {
            assert_eq!(doc_id, "d1");
            wrote = true;
        }
    }
    assert!(wrote);
}

#[tokio::test]
async fn test_edit_is_sent_and_acknowledged() {
    let (session, _events, mut peer) = joined_session(SessionConfig::default()).await;
    join_doc(&session, &mut peer, "d1", json!(["foo", "bar"]), 4).await;

    let sent = session.send_local_edit("d1", &lines(&["foo", "baz"])).await.unwrap();
    assert_eq!(sent, 2);

    let (id, name, args) = peer.request().await;
    assert_eq!(name, "applyOtUpdate");
    assert_eq!(args[0], "d1");
    assert_eq!(
        args[1],
        json!({
            "doc": "d1",
            "op": [{"p": 6, "d": "r"}, {"p": 6, "i": "z"}],
            "v": 4,
            "lastV": 3,
            "hash": content_hash(&["foo", "baz"]),
        })
    );

    peer.reply(id, json!([null]));
    wait_for_version(&session, "d1", 5).await;

    // Nothing left to send
    assert!(peer.is_quiet_for(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn test_edits_batch_behind_unacknowledged_update() {
    let (session, _events, mut peer) = joined_session(SessionConfig::default()).await;
    join_doc(&session, &mut peer, "d1", json!(["a"]), 1).await;

    session.send_local_edit("d1", &lines(&["ab"])).await.unwrap();
    let (first, _, args) = peer.request().await;
    assert_eq!(args[1]["op"], json!([{"p": 1, "i": "b"}]));

    session.send_local_edit("d1", &lines(&["abc"])).await.unwrap();
    session.send_local_edit("d1", &lines(&["abcd"])).await.unwrap();

    // Single flight: nothing else goes out before the ack
    assert!(peer.is_quiet_for(Duration::from_millis(200)).await);

    peer.reply(first, json!([null]));
    let (second, name, args) = peer.request().await;
    assert_eq!(name, "applyOtUpdate");
    assert_eq!(args[1]["op"], json!([{"p": 2, "i": "c"}, {"p": 3, "i": "d"}]));
    assert_eq!(args[1]["v"], 2);
    assert_eq!(args[1]["hash"], content_hash(&["abcd"]));

    peer.reply(second, json!([null]));
    wait_for_version(&session, "d1", 3).await;
}

#[tokio::test]
async fn test_track_changes_marks_updates() {
    let config = SessionConfig {
        track_changes: true,
        ..SessionConfig::default()
    };
    let (session, _events, mut peer) = joined_session(config).await;
    join_doc(&session, &mut peer, "d1", json!(["a"]), 1).await;

    session.send_local_edit("d1", &lines(&["ab"])).await.unwrap();
    let (_, _, args) = peer.request().await;
    let tc = args[1]["meta"]["tc"].as_str().unwrap();
    assert_eq!(tc.len(), 18);
    assert!(tc.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_ack_timeout_disconnects_and_detaches_once() {
    let config = SessionConfig {
        ack_timeout: Duration::from_secs(1),
        ..SessionConfig::default()
    };
    let (session, mut events, mut peer) = joined_session(config).await;
    join_doc(&session, &mut peer, "d1", json!(["one"]), 1).await;
    join_doc(&session, &mut peer, "d2", json!(["two"]), 1).await;

    session.send_local_edit("d1", &lines(&["one!"])).await.unwrap();
    let (_, name, _) = peer.request().await;
    assert_eq!(name, "applyOtUpdate");

    // Never acknowledge
    let mut detached = Vec::new();
    let status = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            match event {
                SurfaceEvent::Detached { doc_id } => detached.push(doc_id),
                SurfaceEvent::Status(text) if text.starts_with("Error: The server did not answer") => {
                    return text;
                }
                _ => {}
            }
        }
        panic!("surface channel closed");
    })
    .await
    .unwrap();

    assert_eq!(status, "Error: The server did not answer for 1 seconds.");
    detached.sort();
    assert_eq!(detached, vec!["d1".to_string(), "d2".to_string()]);
    assert_eq!(session.state().await, ConnectionState::Disconnected);
    assert!(session.open_documents().await.is_empty());

    // No second teardown
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        assert!(!matches!(event, SurfaceEvent::Detached { .. }), "{event:?}");
    }

    timeout(WAIT, peer.closed()).await.unwrap();
    assert!(matches!(
        session.send_local_edit("d1", &lines(&["x"])).await,
        Err(CollabError::NotConnected)
    ));
}

#[tokio::test]
async fn test_remote_ops_are_applied() {
    let (session, mut events, mut peer) = joined_session(SessionConfig::default()).await;
    join_doc(&session, &mut peer, "d1", json!(["hello", "world"]), 4).await;
    while events.try_recv().is_ok() {}

    peer.event(
        "otUpdateApplied",
        json!([{"doc": "d1", "op": [{"p": 5, "i": ","}, {"p": 7, "d": "wo"}], "v": 4}]),
    );

    for expected in [
        texsync_core::Op::insert(5, ","),
        texsync_core::Op::delete(7, "wo"),
    ] {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            SurfaceEvent::ApplyOp { doc_id, op } => {
                assert_eq!(doc_id, "d1");
                assert_eq!(op, expected);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    wait_for_version(&session, "d1", 5).await;
    assert_eq!(session.document_lines("d1").await, Some(lines(&["hello,", "rld"])));

    // Echo of our own update: version only
    peer.event("otUpdateApplied", json!([{"doc": "d1", "v": 7}]));
    wait_for_version(&session, "d1", 8).await;
}

#[tokio::test]
async fn test_unauthorized_before_join() {
    let (session, mut events, mut peer) = start_session(SessionConfig::default()).await;
    peer.send("7:::");

    let err = session.wait_until_joined().await.unwrap_err();
    assert!(matches!(err, CollabError::Disconnected(DisconnectReason::Unauthorized)));
    assert_eq!(session.state().await, ConnectionState::Disconnected);

    let mut saw_status = false;
    while let Ok(event) = events.try_recv() {
        if let SurfaceEvent::Status(text) = event {
            saw_status |= text.starts_with("Error: Unauthorized.");
        }
    }
    assert!(saw_status);
    timeout(WAIT, peer.closed()).await.unwrap();
}

#[tokio::test]
async fn test_server_hangup_takes_session_down() {
    let (session, _events, peer) = joined_session(SessionConfig::default()).await;
    drop(peer);

    // Server hung up: the session notices and goes down
    timeout(WAIT, async {
        while session.state().await != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        session.wait_until_joined().await,
        Err(CollabError::Disconnected(DisconnectReason::TransportLost(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ack_then_echo_counts_once() {
    let (session, _events, mut peer) = joined_session(SessionConfig::default()).await;
    join_doc(&session, &mut peer, "d1", json!(["a"]), 4).await;

    let mut text = String::from("a");
    for version in 4..44u64 {
        text.push('b');
        session.send_local_edit("d1", &[text.clone()]).await.unwrap();
        let (id, _, args) = peer.request().await;
        assert_eq!(args[1]["v"], version);

        // Both frames leave back to back
        peer.reply(id, json!([null]));
        peer.event("otUpdateApplied", json!([{"doc": "d1", "v": version}]));
        wait_for_version(&session, "d1", version + 1).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.document_version("d1").await, Some(44));
    assert_eq!(session.document_lines("d1").await, Some(vec![text]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_op_during_flight_moves_next_batch() {
    let (session, _events, mut peer) = joined_session(SessionConfig::default()).await;
    join_doc(&session, &mut peer, "d1", json!(["foo"]), 4).await;

    session.send_local_edit("d1", &lines(&["foo!"])).await.unwrap();
    let (first, _, args) = peer.request().await;
    assert_eq!(args[1]["v"], 4);

    peer.event("otUpdateApplied", json!([{"doc": "d1", "op": [{"p": 0, "i": "x"}], "v": 4}]));
    wait_for_version(&session, "d1", 5).await;
    assert_eq!(session.document_lines("d1").await, Some(lines(&["xfoo!"])));

    session.send_local_edit("d1", &lines(&["xfoo!?"])).await.unwrap();
    peer.reply(first, json!([null]));

    let (second, name, args) = peer.request().await;
    assert_eq!(name, "applyOtUpdate");
    assert_eq!(args[1]["v"], 6);
    assert_eq!(args[1]["op"], json!([{"p": 5, "i": "?"}]));
    assert_eq!(args[1]["hash"], content_hash(&["xfoo!?"]));

    peer.reply(second, json!([null]));
    wait_for_version(&session, "d1", 7).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_right_after_join_reply() {
    let (session, _events, mut peer) = joined_session(SessionConfig::default()).await;

    let join = {
        let session = session.clone();
        tokio::spawn(async move { session.join_document("d1").await })
    };
    let (id, name, _) = peer.request().await;
    assert_eq!(name, "joinDoc");
    peer.reply(id, json!([null, ["foo"], 4, [], {"comments": []}]));
    peer.event("otUpdateApplied", json!([{"doc": "d1", "op": [{"p": 0, "i": "x"}], "v": 4}]));
    timeout(WAIT, join).await.unwrap().unwrap().unwrap();

    wait_for_version(&session, "d1", 5).await;
    assert_eq!(session.document_lines("d1").await, Some(lines(&["xfoo"])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resync_during_flight_keeps_session_up() {
    let config = SessionConfig {
        ack_timeout: Duration::from_millis(500),
        ..SessionConfig::default()
    };
    let (session, mut events, mut peer) = joined_session(config).await;
    join_doc(&session, &mut peer, "d1", json!(["foo"]), 4).await;

    session.send_local_edit("d1", &lines(&["foo!"])).await.unwrap();
    let (stale, _, _) = peer.request().await;

    // The delete does not match the local text: the document is reloaded
    peer.event("otUpdateApplied", json!([{"doc": "d1", "op": [{"p": 0, "d": "zz"}], "v": 4}]));
    let (id, name, _) = peer.request().await;
    assert_eq!(name, "leaveDoc");
    peer.reply(id, json!([null]));
    let (id, name, _) = peer.request().await;
    assert_eq!(name, "joinDoc");
    peer.reply(id, json!([null, ["bar"], 9, [], {"comments": []}]));
    wait_for_version(&session, "d1", 9).await;

    // The old request's deadline passes without teardown
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(session.state().await, ConnectionState::Connected);

    // A late acknowledgement of it changes nothing
    peer.reply(stale, json!([null]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.document_version("d1").await, Some(9));
    assert_eq!(session.document_lines("d1").await, Some(lines(&["bar"])));

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SurfaceEvent::Detached { .. }), "{event:?}");
    }

    // The reloaded document syncs normally
    session.send_local_edit("d1", &lines(&["bar!"])).await.unwrap();
    let (id, name, args) = peer.request().await;
    assert_eq!(name, "applyOtUpdate");
    assert_eq!(args[1]["v"], 9);
    peer.reply(id, json!([null]));
    wait_for_version(&session, "d1", 10).await;
}
