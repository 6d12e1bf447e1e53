// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end tests against a daemon listening on a real Unix socket.

use coedit::daemon::DaemonHandle;
use coedit::transport;
use std::path::{Path, PathBuf};
use temp_dir::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, Duration};

async fn start_daemon(initial_text: &[u8]) -> (TempDir, PathBuf, DaemonHandle) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let socket_path = dir.path().join("coedit.sock");
    let handle = DaemonHandle::new(initial_text);

    let listener_handle = handle.clone();
    let listener_path = socket_path.clone();
    tokio::spawn(async move {
        transport::listen_unix(&listener_path, listener_handle)
            .await
            .expect("Failed to listen on UNIX socket");
    });

    for _ in 0..100 {
        if socket_path.exists() {
            return (dir, socket_path, handle);
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("socket did not appear within a second");
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect and negotiate, returning the client and the raw welcome line.
    async fn connect(socket_path: &Path, name: &str) -> (Self, String) {
        let stream = UnixStream::connect(socket_path)
            .await
            .expect("Failed to connect to socket");
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        client.send(&format!("new:{name}\n")).await;
        let welcome = client.recv().await.expect("expected a negotiation reply");
        (client, welcome)
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("Failed to write to socket");
    }

    /// The next line, without its newline; `None` once the server hung up.
    async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a server line")
            .expect("Failed to read from socket");
        if read == 0 {
            None
        } else {
            Some(line.trim_end_matches('\n').to_string())
        }
    }
}

#[tokio::test]
async fn negotiation_reply_carries_the_escaped_document() {
    let (_dir, socket_path, _handle) = start_daemon(b"hello world\n").await;
    let (_client, welcome) = TestClient::connect(&socket_path, "alice").await;

    let fields: Vec<&str> = welcome.splitn(4, ':').collect();
    assert_eq!(fields.len(), 4);
    let editor: usize = fields[0].parse().expect("editor id is a number");
    assert!(editor >= 1);
    assert!(!fields[1].is_empty());
    assert_eq!(fields[2], "1");
    assert_eq!(fields[3], "hello world\\n");
}

#[tokio::test]
async fn sequential_inserts_build_the_document() {
    let (_dir, socket_path, handle) = start_daemon(b"").await;
    let (mut client, welcome) = TestClient::connect(&socket_path, "alice").await;
    assert!(welcome.ends_with(":0:"));

    client.send("s:0:0:0:i:0:hello world\n").await;
    assert_eq!(client.recv().await.as_deref(), Some("a:0"));
    assert_eq!(handle.text().await, b"hello world");

    client.send("s:1:1:0:i:6:cruel \n").await;
    assert_eq!(client.recv().await.as_deref(), Some("a:1"));
    assert_eq!(handle.text().await, b"hello cruel world");
}

#[tokio::test]
async fn tied_inserts_broadcast_in_both_directions() {
    let (_dir, socket_path, handle) = start_daemon(b"hello world").await;
    let (mut alice, _) = TestClient::connect(&socket_path, "alice").await;
    let (mut bob, _) = TestClient::connect(&socket_path, "bob").await;

    // Both base their insert on server edit 1; alice lands first.
    alice.send("s:0:1:0:i:11:!\n").await;
    assert_eq!(alice.recv().await.as_deref(), Some("a:0"));
    assert_eq!(bob.recv().await.as_deref(), Some("x:2:i:11:!"));

    bob.send("s:0:1:0:i:11:?\n").await;
    assert_eq!(bob.recv().await.as_deref(), Some("a:0"));
    // The tie shifted bob's insert to the right of alice's.
    assert_eq!(alice.recv().await.as_deref(), Some("x:3:i:12:?"));

    assert_eq!(handle.text().await, b"hello world!?");
}

#[tokio::test]
async fn escaped_text_round_trips_through_a_broadcast() {
    let (_dir, socket_path, handle) = start_daemon(b"").await;
    let (mut alice, _) = TestClient::connect(&socket_path, "alice").await;
    let (mut bob, _) = TestClient::connect(&socket_path, "bob").await;

    alice.send("s:0:0:0:i:0:one\\ntwo\\t\\\\three\n").await;
    assert_eq!(alice.recv().await.as_deref(), Some("a:0"));
    assert_eq!(
        bob.recv().await.as_deref(),
        Some("x:1:i:0:one\\ntwo\\t\\\\three")
    );
    assert_eq!(handle.text().await, b"one\ntwo\t\\three");
}

#[tokio::test]
async fn malformed_line_closes_the_connection() {
    let (_dir, socket_path, handle) = start_daemon(b"").await;
    let (mut alice, _) = TestClient::connect(&socket_path, "alice").await;
    let (mut bob, _) = TestClient::connect(&socket_path, "bob").await;

    alice.send("what even is this\n").await;
    assert_eq!(alice.recv().await, None);

    // The other connection is unaffected.
    bob.send("s:0:0:0:i:0:still here\n").await;
    assert_eq!(bob.recv().await.as_deref(), Some("a:0"));
    assert_eq!(handle.text().await, b"still here");
}
