// SPDX-License-Identifier: AGPL-3.0-or-later

//! The daemon actor. One task owns the [`EditServer`] and the outbound
//! channel of every connection; messages from all connections funnel into it
//! and are processed one at a time. That makes the submission critical
//! section (validate, pull, rebase, append, apply) atomic without a lock:
//! the actor never awaits while the history, document, or a shadow is in an
//! intermediate state, only while enqueueing outbound messages afterwards.

use crate::server::{EditServer, SubmissionOutcome};
use crate::types::EditorId;
use crate::wire::ServerMessage;
use rand::{distributions::Alphanumeric, Rng};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Outbound messages per connection are bounded. A slow reader fills its
/// channel and then stalls the daemon rather than buffering without limit;
/// a vanished reader fails the send and tears the connection down.
pub const OUTBOUND_CAPACITY: usize = 10;

/// Messages sent to the task that owns the edit server.
pub enum DocMessage {
    NewConnection {
        editor: EditorId,
        name: Vec<u8>,
        outbound: mpsc::Sender<ServerMessage>,
    },
    FromClient(EditorId, Vec<u8>),
    CloseConnection(EditorId),
    GetText {
        response_tx: oneshot::Sender<Vec<u8>>,
    },
}

impl fmt::Debug for DocMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            Self::NewConnection { editor, .. } => format!("new connection #{editor}"),
            Self::FromClient(editor, _) => format!("line from #{editor}"),
            Self::CloseConnection(editor) => format!("close connection #{editor}"),
            Self::GetText { .. } => "get text".to_string(),
        };
        write!(f, "{repr}")
    }
}

struct DaemonActor {
    doc_message_rx: mpsc::Receiver<DocMessage>,
    server: EditServer,
    /// Ordered by editor id, so broadcast fan-out is deterministic.
    connections: BTreeMap<EditorId, mpsc::Sender<ServerMessage>>,
}

impl DaemonActor {
    async fn run(&mut self) {
        while let Some(message) = self.doc_message_rx.recv().await {
            debug!("handling message: {message:?}");
            self.handle_message(message).await;
        }
        debug!("all daemon handles dropped, stopping");
    }

    async fn handle_message(&mut self, message: DocMessage) {
        match message {
            DocMessage::NewConnection {
                editor,
                name,
                outbound,
            } => {
                let (seq, text) = self.server.connect(editor);
                self.connections.insert(editor, outbound);
                info!(
                    "editor #{editor} connected as '{}'",
                    String::from_utf8_lossy(&name)
                );
                self.send_to(
                    editor,
                    ServerMessage::Welcome {
                        editor,
                        secret: generate_secret(),
                        seq,
                        text,
                    },
                )
                .await;
            }
            DocMessage::FromClient(editor, line) => {
                self.handle_line(editor, line).await;
            }
            DocMessage::CloseConnection(editor) => {
                self.drop_connection(editor);
                info!("editor #{editor} disconnected");
            }
            DocMessage::GetText { response_tx } => {
                let _ = response_tx.send(self.server.text().to_vec());
            }
        }
    }

    async fn handle_line(&mut self, editor: EditorId, line: Vec<u8>) {
        match self.server.handle_line(editor, &line) {
            Ok(None) => {}
            Ok(Some(SubmissionOutcome {
                accepted,
                committed,
            })) => {
                // The accept goes out even when nothing was committed, so
                // the client can retire its in-flight record.
                self.send_to(editor, ServerMessage::Accepted { seq: accepted })
                    .await;
                if let Some((seq, op)) = committed {
                    let others: Vec<EditorId> = self
                        .connections
                        .keys()
                        .copied()
                        .filter(|id| *id != editor)
                        .collect();
                    for recipient in others {
                        self.send_to(
                            recipient,
                            ServerMessage::External {
                                seq,
                                op: op.clone(),
                            },
                        )
                        .await;
                    }
                }
            }
            Err(violation) => {
                // Protocol violations close the offending connection. No
                // rollback: nothing was committed on this path.
                warn!("editor #{editor}: {violation}, closing its connection");
                self.drop_connection(editor);
            }
        }
    }

    async fn send_to(&mut self, editor: EditorId, message: ServerMessage) {
        let Some(outbound) = self.connections.get(&editor).cloned() else {
            return;
        };
        if outbound.send(message).await.is_err() {
            debug!("outbound channel of editor #{editor} is gone");
            self.drop_connection(editor);
        }
    }

    fn drop_connection(&mut self, editor: EditorId) {
        self.server.disconnect(editor);
        self.connections.remove(&editor);
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Cheaply cloneable handle that the transport layer talks to.
#[derive(Clone)]
pub struct DaemonHandle {
    doc_message_tx: mpsc::Sender<DocMessage>,
    next_editor_id: Arc<AtomicUsize>,
}

impl DaemonHandle {
    /// Spawn the daemon actor around a fresh edit server.
    #[must_use]
    pub fn new(initial_text: &[u8]) -> Self {
        let (doc_message_tx, doc_message_rx) = mpsc::channel(1);
        let mut actor = DaemonActor {
            doc_message_rx,
            server: EditServer::new(initial_text),
            connections: BTreeMap::new(),
        };
        tokio::spawn(async move { actor.run().await });
        Self {
            doc_message_tx,
            // Editor id 0 is the server itself.
            next_editor_id: Arc::new(AtomicUsize::new(1)),
        }
    }

    #[must_use]
    pub fn next_editor_id(&self) -> EditorId {
        self.next_editor_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn send_message(&self, message: DocMessage) {
        self.doc_message_tx
            .send(message)
            .await
            .expect("daemon actor task has been killed");
    }

    /// Current document bytes, for diagnostics and tests.
    pub async fn text(&self) -> Vec<u8> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_message(DocMessage::GetText { response_tx }).await;
        response_rx.await.expect("daemon actor task has been killed")
    }
}
