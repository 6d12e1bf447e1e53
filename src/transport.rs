// SPDX-License-Identifier: AGPL-3.0-or-later

//! Socket plumbing: accept loops for TCP and Unix sockets, and the
//! per-connection tasks that shuttle framed lines between a stream and the
//! daemon actor. Nothing in here interprets edits; it negotiates, then
//! forwards bytes.

use crate::daemon::{DaemonHandle, DocMessage, OUTBOUND_CAPACITY};
use crate::wire::{parse_hello, WireCodec};
use anyhow::Context;
use futures::{SinkExt, StreamExt};
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn listen_tcp(port: u16, document_handle: DaemonHandle) -> Result<(), io::Error> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("listening on TCP port {port}");

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("connection from {addr}");
        let handle = document_handle.clone();
        tokio::spawn(async move {
            handle_connection(stream, handle).await;
        });
    }
}

pub async fn listen_unix(
    socket_path: &Path,
    document_handle: DaemonHandle,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        // A previous daemon crashed, or is still running; either way this
        // instance takes over the path.
        std::fs::remove_file(socket_path).context("could not remove existing socket")?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!("listening on UNIX socket: {}", socket_path.display());

    loop {
        let (stream, _addr) = listener.accept().await?;
        let handle = document_handle.clone();
        tokio::spawn(async move {
            handle_connection(stream, handle).await;
        });
    }
}

/// Drive one connection: negotiate, register with the daemon, then forward
/// inbound lines until either side goes away.
pub async fn handle_connection<S>(stream: S, document_handle: DaemonHandle)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (stream_read, stream_write) = tokio::io::split(stream);
    let mut reader = FramedRead::new(stream_read, WireCodec);
    let mut writer = FramedWrite::new(stream_write, WireCodec);

    // One negotiation line before streaming begins.
    let hello = match reader.next().await {
        Some(Ok(line)) => line,
        Some(Err(err)) => {
            warn!("connection broke during negotiation: {err}");
            return;
        }
        None => {
            debug!("connection closed before negotiation");
            return;
        }
    };
    let name = match parse_hello(&hello) {
        Ok(name) => name,
        Err(violation) => {
            warn!("refusing connection: {violation}");
            return;
        }
    };

    let editor = document_handle.next_editor_id();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    // The writer task drains the outbound channel into the socket. It ends
    // when the daemon drops the sender (teardown after a violation) or the
    // peer stops reading; either way it cancels the read loop below.
    let shutdown_token = CancellationToken::new();
    let shutdown_token_clone = shutdown_token.clone();
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if writer.send(message).await.is_err() {
                break;
            }
        }
        shutdown_token_clone.cancel();
    });

    document_handle
        .send_message(DocMessage::NewConnection {
            editor,
            name,
            outbound: outbound_tx,
        })
        .await;

    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            line = reader.next() => match line {
                Some(Ok(line)) => {
                    document_handle
                        .send_message(DocMessage::FromClient(editor, line))
                        .await;
                }
                Some(Err(err)) => {
                    warn!("client #{editor}: {err}");
                    break;
                }
                None => break,
            }
        }
    }

    document_handle
        .send_message(DocMessage::CloseConnection(editor))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn reconnect_negotiation_is_refused() {
        let handle = DaemonHandle::new(b"");
        let (client, server) = duplex(1024);
        tokio::spawn(handle_connection(server, handle));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"old:1:secret\n").await.unwrap();
        drop(client_write);

        let mut buf = Vec::new();
        client_read.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn negotiation_round_trip() {
        let handle = DaemonHandle::new(b"hello world\n");
        let (client, server) = duplex(1024);
        tokio::spawn(handle_connection(server, handle));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"new:alice\n").await.unwrap();

        let mut reader = tokio::io::BufReader::new(client_read);
        let mut line = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
            .await
            .unwrap();
        let fields: Vec<&str> = line.trim_end().splitn(4, ':').collect();
        assert_eq!(fields[0], "1");
        assert!(!fields[1].is_empty());
        assert_eq!(fields[2], "1");
        assert_eq!(fields[3], "hello world\\n");
    }
}
