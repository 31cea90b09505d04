//! Transport seam for the chat connection.
//!
//! A [`Connector`] opens a [`Link`]: a pair of channels carrying typed
//! frames to and from the server. The connection manager never sees the
//! underlying socket, which lets tests swap in [`MemoryConnector`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use gather_shared::{ClientFrame, ServerFrame};

use crate::error::{ClientError, Result};

const LINK_BUFFER: usize = 256;

/// An open, bidirectional frame channel to the chat server.
///
/// Dropping the `outbound` sender closes the link from our side; the
/// `inbound` receiver yields `None` once the remote side is gone.
pub struct Link {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<ServerFrame>,
    tasks: Vec<AbortHandle>,
}

impl Link {
    pub fn new(outbound: mpsc::Sender<ClientFrame>, inbound: mpsc::Receiver<ServerFrame>) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Attach an I/O task that must not outlive the link.
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.tasks.push(task);
        self
    }

    /// Split into the parts the connection manager keeps.
    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::Sender<ClientFrame>,
        mpsc::Receiver<ServerFrame>,
        Vec<AbortHandle>,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// Opens links to the chat server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// JSON-over-WebSocket transport.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Transport(format!("failed to connect {}: {e}", self.url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        debug!(url = %self.url, "WebSocket connected");

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(LINK_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(WsMessage::Text(text.into())).await {
                    warn!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match ServerFrame::from_json(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed server frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(Link::new(out_tx, in_rx)
            .with_task(writer.abort_handle())
            .with_task(reader.abort_handle()))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Server-side ends of a link opened through [`MemoryConnector`].
pub struct MemoryPeer {
    /// Frames the client emitted.
    pub from_client: mpsc::Receiver<ClientFrame>,
    /// Push frames to the client; dropping it looks like a transport drop.
    pub to_client: mpsc::Sender<ServerFrame>,
}

/// In-process transport: every `connect` creates a fresh channel pair and
/// hands the server ends to whoever holds the accept queue.
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (Self { accept_tx }, accept_rx)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link> {
        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);

        self.accept_tx
            .send(MemoryPeer {
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| ClientError::Transport("memory server is gone".into()))?;

        Ok(Link::new(out_tx, in_rx))
    }
}
