// mock_ws_server: a mock upstream ledger node for testing the connection
// supervisor and response processor.
//
// Binds to 127.0.0.1:0, accepts the subscription command a worker sends on
// connect, and hands the test a handle it can use to push canned frames or
// drop the connection on command (to exercise reconnect).

use std::io;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// The subscription command as received off the wire. `SubscribeCommand` in
/// `ledger-protocol` only derives `Serialize` (it is an outbound-only type
/// for real workers); this mirrors its shape for the one test-only purpose
/// of inspecting what a worker subscribed to.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceivedSubscribeCommand {
    pub command: String,
    pub streams: Vec<String>,
    pub ledger_index: String,
}

/// A mock ledger node for integration testing.
///
/// Each accepted connection is handed to the test as a [`ConnectionHandle`]
/// via [`MockLedgerNode::accept`], in arrival order.
pub struct MockLedgerNode {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ConnectionHandle>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockLedgerNode {
    /// Start the node, binding to a random available port.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            Self::accept_loop(listener, conn_tx).await;
        });

        Ok(Self {
            addr,
            connections: conn_rx,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The url a worker would connect to for this node.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait for the next accepted connection (i.e. the next worker that
    /// connects and sends its subscription command).
    pub async fn accept(&mut self) -> ConnectionHandle {
        self.connections
            .recv()
            .await
            .expect("mock ledger node accept loop ended unexpectedly")
    }

    async fn accept_loop(listener: TcpListener, conn_tx: mpsc::UnboundedSender<ConnectionHandle>) {
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let _ = Self::handle_connection(stream, conn_tx).await;
            });
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        conn_tx: mpsc::UnboundedSender<ConnectionHandle>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        // First frame from a worker is always its subscription command.
        let subscribe_command = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str::<ReceivedSubscribeCommand>(&text)?;
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await?;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        if conn_tx
            .send(ConnectionHandle {
                outbound: out_tx,
                subscribe_command,
            })
            .is_err()
        {
            return Ok(());
        }

        // Drain further incoming frames (pings, or a worker that never sends
        // more than its subscribe command) while forwarding outbound pushes.
        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(msg) => write.send(msg).await?,
                        None => {
                            // ConnectionHandle dropped (or `drop_connection` called):
                            // close from our end to simulate an upstream drop.
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Ping(data))) => { write.send(Message::Pong(data)).await?; }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

/// A single accepted connection. Lets the test inspect the subscription
/// command the worker sent, push canned frames, and drop the connection.
pub struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Message>,
    subscribe_command: ReceivedSubscribeCommand,
}

impl ConnectionHandle {
    pub fn subscribe_command(&self) -> &ReceivedSubscribeCommand {
        &self.subscribe_command
    }

    /// Push one JSON frame to the connected worker.
    pub fn push_json(&self, payload: serde_json::Value) {
        let text = serde_json::to_string(&payload).expect("serializable test payload");
        let _ = self.outbound.send(Message::Text(text.into()));
    }

    /// Push a frame that is not valid JSON, to exercise the decode-failure path.
    pub fn push_malformed(&self, raw: &str) {
        let _ = self.outbound.send(Message::Text(raw.to_owned().into()));
    }

    /// Simulate an upstream disconnect: the connection task closes its end,
    /// which the worker observes as a transport error.
    pub fn drop_connection(self) {
        drop(self.outbound);
    }
}
