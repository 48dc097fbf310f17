//! Real network transports: WebSocket (via tokio-tungstenite) and raw TCP.
//!
//! Each transport runs as its own tokio task. The task reports events
//! through [`TransportEvents`] and receives outbound data and close requests
//! over a command channel, so the VM-facing side never blocks.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{ConnectTarget, Transport, TransportEvents, TransportFactory};
use crate::error::ConnectionError;

const READ_BUFFER_SIZE: usize = 16 * 1024;

enum Command {
    Send(Vec<u8>),
    Close,
}

/// Handle to a transport task.
struct TaskTransport {
    commands: mpsc::UnboundedSender<Command>,
}

impl Transport for TaskTransport {
    fn send(&mut self, data: Vec<u8>) {
        // The task has exited if the connection is already closed; drop the data.
        let _ = self.commands.send(Command::Send(data));
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Factory for transports backed by real sockets.
#[derive(Debug, Clone)]
pub struct NetworkTransports {
    tcp_enabled: bool,
}

impl NetworkTransports {
    /// `tcp_enabled = false` models hosts without raw socket access, where
    /// only WebSocket connections can be made.
    pub fn new(tcp_enabled: bool) -> Self {
        Self { tcp_enabled }
    }
}

impl Default for NetworkTransports {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TransportFactory for NetworkTransports {
    fn open(
        &self,
        target: &ConnectTarget,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ConnectionError::TransportUnavailable("no async runtime"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match target.clone() {
            ConnectTarget::WebSocket { url } => {
                tokio::spawn(run_websocket(url, events, rx));
            }
            ConnectTarget::Tcp { host, port } => {
                if !self.tcp_enabled {
                    return Err(ConnectionError::TransportUnavailable("tcp"));
                }
                tokio::spawn(run_tcp(host, port, events, rx));
            }
        }
        Ok(Box::new(TaskTransport { commands: tx }))
    }
}

async fn run_websocket(
    url: String,
    events: TransportEvents,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let connect = tokio_tungstenite::connect_async(url.as_str());
    let stream = tokio::select! {
        result = connect => match result {
            Ok((stream, _response)) => stream,
            Err(err) => {
                tracing::debug!(id = events.id(), %url, error = %err, "websocket connect failed");
                events.closed();
                return;
            }
        },
        // Closed by the VM before the handshake finished.
        _ = wait_for_close(&mut commands) => return,
    };

    events.open();
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(data)) => {
                    if let Err(err) = sink.send(Message::Binary(data.into())).await {
                        tracing::debug!(id = events.id(), error = %err, "websocket send failed");
                        events.closed();
                        return;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Binary(data))) => events.message(data.to_vec()),
                Some(Ok(Message::Text(text))) => events.message(text.as_bytes().to_vec()),
                Some(Ok(Message::Close(_))) | None => {
                    events.closed();
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(id = events.id(), error = %err, "websocket error");
                    events.closed();
                    return;
                }
            },
        }
    }
}

async fn run_tcp(
    host: String,
    port: u16,
    events: TransportEvents,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let connect = TcpStream::connect((host.as_str(), port));
    let stream = tokio::select! {
        result = connect => match result {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(id = events.id(), %host, port, error = %err, "tcp connect failed");
                events.closed();
                return;
            }
        },
        _ = wait_for_close(&mut commands) => return,
    };

    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(id = events.id(), error = %err, "failed to set TCP_NODELAY");
    }

    events.open();
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(data)) => {
                    if let Err(err) = writer.write_all(&data).await {
                        tracing::debug!(id = events.id(), error = %err, "tcp write failed");
                        events.closed();
                        return;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = writer.shutdown().await;
                    return;
                }
            },
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    events.closed();
                    return;
                }
                Ok(n) => events.message(buffer[..n].to_vec()),
                Err(err) => {
                    tracing::debug!(id = events.id(), error = %err, "tcp read failed");
                    events.closed();
                    return;
                }
            },
        }
    }
}

/// Resolves once a close was requested, discarding sends issued before the
/// connection opened.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Send(_)) => {}
            Some(Command::Close) | None => return,
        }
    }
}
