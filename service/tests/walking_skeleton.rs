#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Walking-skeleton end-to-end test.
//!
//! Starts the service on a temp socket backed by a temp database file and
//! drives one agent session through every method over a real connection:
//! handshake, create, append, handoff, context, anchors, fork, rename,
//! search, reset, list, status and doctor.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tape_service::PROTOCOL_VERSION;
use tape_service::engine::TapeEngine;
use tape_service::protocol::{ERR_ANCHOR_NOT_FOUND, ERR_NAME_IN_USE, ERR_TAPE_ARCHIVED};
use tape_store::{TapeConfig, TapeStore};

/// Stateful client that keeps a single connection + buffered reader.
struct TestClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: i64,
}

impl TestClient {
    fn connect(socket_path: &Path) -> Self {
        let stream = UnixStream::connect(socket_path).expect("Failed to connect to tape service");
        let writer = stream.try_clone().expect("clone stream");
        let reader = BufReader::new(stream);
        Self {
            writer,
            reader,
            next_id: 1,
        }
    }

    fn send(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let mut bytes = serde_json::to_vec(&json!({"id": id, "method": method, "params": params}))
            .expect("serialize");
        bytes.push(b'\n');
        self.writer.write_all(&bytes).expect("write");
        self.writer.flush().expect("flush");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        let resp: Value =
            serde_json::from_str(&line).unwrap_or_else(|e| panic!("parse response: {e}\nraw: {line}"));
        assert_eq!(resp["id"], json!(id), "response id mismatch: {resp}");
        resp
    }

    /// Call `method` and return its `result`, panicking on an error response.
    fn rpc(&mut self, method: &str, params: Value) -> Value {
        let resp = self.send(method, params);
        assert!(resp.get("result").is_some(), "{method} should succeed: {resp}");
        resp["result"].clone()
    }

    /// Call `method` and return its `error` code.
    fn rpc_err(&mut self, method: &str, params: Value) -> i64 {
        let resp = self.send(method, params);
        resp["error"]["code"]
            .as_i64()
            .unwrap_or_else(|| panic!("{method} should fail: {resp}"))
    }

    fn handshake(&mut self) {
        let result = self.rpc(
            "hello",
            json!({"protocol_version": PROTOCOL_VERSION, "client_version": "test-0.1.0"}),
        );
        assert_eq!(result["protocol_version"], json!(PROTOCOL_VERSION));
    }

    fn say(&mut self, tape: &str, text: &str) -> u64 {
        let result = self.rpc(
            "tape.append",
            json!({"tape": tape, "kind": "message", "payload": {"role": "user", "content": text}}),
        );
        result["seq_no"].as_u64().expect("seq_no")
    }
}

fn seqs(result: &Value) -> Vec<u64> {
    result["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .map(|e| e["seq_no"].as_u64().expect("seq_no"))
        .collect()
}

/// Start the service in the background; returns the shutdown sender and task.
async fn start_service(
    db_path: &Path,
    socket_path: &Path,
) -> (
    tokio::sync::watch::Sender<bool>,
    tokio::task::JoinHandle<()>,
) {
    let store = TapeStore::open(TapeConfig::with_db_path(db_path)).expect("open store");
    let engine = Arc::new(TapeEngine::new(store));
    let listener = tape_service::ipc::bind(socket_path).expect("bind");
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move {
        tokio_test::assert_ok!(tape_service::ipc::serve(engine, listener, shutdown_rx).await);
    });

    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    (shutdown_tx, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn walking_skeleton_e2e() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("test-tape.sock");
    let (shutdown_tx, server_handle) =
        start_service(&temp_dir.path().join("tape.db"), &socket_path).await;

    let client_socket = socket_path.clone();
    tokio::task::spawn_blocking(move || session(&client_socket))
        .await
        .expect("client session");

    shutdown_tx.send(true).expect("signal shutdown");
    tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .expect("service stops after shutdown")
        .expect("service task");
}

fn session(socket_path: &Path) {
    let mut client = TestClient::connect(socket_path);
    client.handshake();

    // Create, resolve, and name collisions
    let s1 = client.rpc("tape.create", json!({"name": "s1"}))["tape_id"].clone();
    assert_eq!(client.rpc("tape.resolve", json!({"name": "s1"}))["tape_id"], s1);
    assert_eq!(
        client.rpc_err("tape.create", json!({"name": "s1"})),
        ERR_NAME_IN_USE
    );

    // Three messages, a handoff, two more messages
    for text in ["one", "two", "three"] {
        client.say("s1", text);
    }
    let handoff = client.rpc(
        "tape.handoff",
        json!({"tape": "s1", "name": "phase1", "state": {"summary": "greetings"}}),
    );
    assert_eq!(handoff, json!({"tape_id": s1, "seq_no": 5}));
    client.say("s1", "four");
    assert_eq!(client.say("s1", "the zanzibar plan"), 7);

    // Context windows and raw reads
    let window = client.rpc(
        "tape.context",
        json!({"tape": "s1", "policy": {"type": "last_anchor"}}),
    );
    assert_eq!(seqs(&window), vec![6, 7]);
    let full = client.rpc("tape.context", json!({"tape": "s1", "policy": {"type": "full"}}));
    assert_eq!(seqs(&full), (1..=7).collect::<Vec<_>>());
    let slice = client.rpc("tape.read", json!({"tape": s1, "from_seq": 2, "to_seq": 3}));
    assert_eq!(seqs(&slice), vec![2, 3]);

    // Anchors
    let anchor = client.rpc("tape.anchor", json!({"tape": "s1", "name": "phase1"}));
    assert_eq!(anchor["seq_no"], json!(5));
    assert_eq!(anchor["state"], json!({"summary": "greetings"}));
    let anchors = client.rpc("tape.anchors", json!({"tape": "s1"}));
    assert_eq!(anchors["anchors"].as_array().map(Vec::len), Some(1));
    assert_eq!(
        client.rpc_err("tape.anchor", json!({"tape": "s1", "name": "nope"})),
        ERR_ANCHOR_NOT_FOUND
    );

    // Fork at the anchor
    let fork = client.rpc(
        "tape.fork",
        json!({"tape": "s1", "name": "s1-branch", "cutoff": "phase1"}),
    );
    assert_eq!(fork["parent_tape_id"], s1);
    let branch = fork["tape_id"].clone();
    assert_eq!(
        seqs(&client.rpc("tape.read", json!({"tape": "s1-branch"}))),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(client.say("s1-branch", "diverge"), 6);

    // Rename keeps the old name resolvable
    let info = client.rpc("tape.rename", json!({"tape": "s1-branch", "name": "experiment"}));
    assert_eq!(info["primary_name"], json!("experiment"));
    assert_eq!(client.rpc("tape.resolve", json!({"name": "s1-branch"}))["tape_id"], branch);
    let aliases = client.rpc("tape.aliases", json!({"tape": "experiment"}));
    assert_eq!(aliases["aliases"].as_array().map(Vec::len), Some(2));
    let info = client.rpc("tape.info", json!({"tape": branch}));
    assert_eq!(info["parent_tape_id"], s1);
    assert_eq!(info["entry_count"], json!(6));

    // Search, then reset hides the archived hit
    let hits = client.rpc("tape.search", json!({"query": "zanzibar"}));
    let matches = hits["matches"].as_array().expect("matches");
    assert_eq!(matches.len(), 1);
    assert_eq!((&matches[0]["tape_id"], &matches[0]["seq_no"]), (&s1, &json!(7)));
    assert!(!matches[0]["snippet"].as_str().unwrap_or_default().is_empty());

    let reset = client.rpc("tape.reset", json!({"tape": "s1"}));
    assert_eq!(reset["archived_tape_id"], s1);
    assert_ne!(reset["tape_id"], s1);
    assert_eq!(client.rpc("tape.resolve", json!({"name": "s1"}))["tape_id"], reset["tape_id"]);
    assert_eq!(
        client.rpc_err(
            "tape.append",
            json!({"tape": s1, "kind": "message", "payload": {"content": "late"}})
        ),
        ERR_TAPE_ARCHIVED
    );
    assert_eq!(
        client.rpc("tape.search", json!({"query": "zanzibar"}))["matches"]
            .as_array()
            .map(Vec::len),
        Some(0)
    );
    assert_eq!(
        client.rpc(
            "tape.search",
            json!({"query": "zanzibar", "include_archived": true})
        )["matches"]
            .as_array()
            .map(Vec::len),
        Some(1)
    );

    // Listing: fresh s1 and the branch are active; the old s1 is archived
    let active = client.rpc("tape.list", json!({}));
    assert_eq!(active["tapes"].as_array().map(Vec::len), Some(2));
    let all = client.rpc("tape.list", json!({"include_archived": true}));
    assert_eq!(all["tapes"].as_array().map(Vec::len), Some(3));

    // Service status and doctor
    let status = client.rpc("service.status", json!({}));
    assert_eq!(status["protocol_version"], json!(PROTOCOL_VERSION));
    assert!(status["connections"].as_u64().unwrap_or_default() >= 1);
    let doctor = client.rpc("service.doctor", json!({}));
    assert_eq!(doctor["healthy"], json!(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clients_share_one_tape() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("shared.sock");
    let (shutdown_tx, _server) =
        start_service(&temp_dir.path().join("tape.db"), &socket_path).await;

    let mut first = TestClient::connect(&socket_path);
    first.handshake();
    first.rpc("tape.create", json!({"name": "shared"}));

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let socket_path = socket_path.clone();
            tokio::task::spawn_blocking(move || {
                let mut client = TestClient::connect(&socket_path);
                for i in 0..10 {
                    client.say("shared", &format!("writer {w} line {i}"));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.expect("writer");
    }

    let seqs_read = tokio::task::spawn_blocking(move || {
        seqs(&first.rpc("tape.read", json!({"tape": "shared"})))
    })
    .await
    .expect("read");
    assert_eq!(seqs_read, (1..=40).collect::<Vec<_>>());

    let _ = shutdown_tx.send(true);
}
