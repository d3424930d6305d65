//! WebSocket transport: identity-tagged, multi-segment message channels.
//!
//! The protocol engine only needs two capabilities from the network:
//!
//! - an inbound listener that reports, per message, the sender's routing tag
//!   and the message segments ([`start_server`]);
//! - outbound channels tagged with the local identity ([`Transport`]).
//!
//! On the wire each connection opens with one binary frame holding the
//! dialer's routing tag. Every message segment after that is one binary frame
//! whose first byte is [`FRAME_MORE`] when more segments of the same message
//! follow, or [`FRAME_LAST`] on the final segment.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::identity::{NodeId, ROUTING_TAG_LEN};
use crate::message::Frames;

/// Flag byte: more segments of this message follow.
pub const FRAME_MORE: u8 = 0x01;
/// Flag byte: last segment of this message.
pub const FRAME_LAST: u8 = 0x00;

/// How many times an outbound channel tries to reach its endpoint.
const CONNECT_ATTEMPTS: u32 = 5;
/// Pause between outbound connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Capability to open outbound channels towards peer endpoints.
pub trait Transport: Send + Sync + 'static {
    /// Open a channel to `endpoint`, announcing `origin` as the sender.
    ///
    /// Returns immediately; messages sent before the connection is up are
    /// queued and flushed once it is.
    fn connect(&self, endpoint: &str, origin: &NodeId) -> PeerConnection;
}

/// A handle to an outbound channel. Dropping it closes the channel.
#[derive(Debug)]
pub struct PeerConnection {
    endpoint: String,
    tx: mpsc::UnboundedSender<Frames>,
}

impl PeerConnection {
    pub fn new(endpoint: impl Into<String>, tx: mpsc::UnboundedSender<Frames>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tx,
        }
    }

    /// The endpoint this channel was opened towards.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue a message for delivery. Returns `false` once the channel is gone.
    pub fn send(&self, frames: Frames) -> bool {
        self.tx.send(frames).is_ok()
    }
}

/// A complete message received by the inbound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Routing tag the sending connection announced.
    pub tag: Vec<u8>,
    /// Message segments in order.
    pub frames: Frames,
}

/// Collects flagged segments into complete messages.
#[derive(Debug, Default)]
struct Reassembler {
    parts: Frames,
}

impl Reassembler {
    /// Feed one flagged segment. Returns the message once its last segment
    /// arrives. Segments without a flag byte are dropped.
    fn push(&mut self, segment: &[u8]) -> Option<Frames> {
        let (&flag, body) = segment.split_first()?;
        self.parts.push(body.to_vec());
        if flag & FRAME_MORE == 0 {
            Some(std::mem::take(&mut self.parts))
        } else {
            None
        }
    }
}

/// Strip the `tcp://` scheme from an endpoint.
pub fn endpoint_host(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

/// Format an endpoint for a socket address.
pub fn endpoint_for(addr: SocketAddr) -> String {
    format!("tcp://{addr}")
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Run the inbound listener until `shutdown` fires.
///
/// Each accepted connection must open with a routing tag; connections that
/// do not are dropped. Every complete message is forwarded to `event_tx`.
pub async fn start_server(
    listener: TcpListener,
    event_tx: mpsc::Sender<InboundMessage>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    info!("ZRE listener accepting on {local}");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let event_tx = event_tx.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, peer_addr, event_tx).await;
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("ZRE listener on {local} shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    event_tx: mpsc::Sender<InboundMessage>,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket accept failed for {peer_addr}: {e}");
            return;
        }
    };

    let tag = match ws.next().await {
        Some(Ok(WsMessage::Binary(tag))) if tag.len() == ROUTING_TAG_LEN => tag.to_vec(),
        other => {
            debug!("Connection from {peer_addr} did not open with a routing tag: {other:?}");
            return;
        }
    };

    let mut reassembler = Reassembler::default();
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(WsMessage::Binary(segment)) => {
                if let Some(frames) = reassembler.push(&segment) {
                    let inbound = InboundMessage {
                        tag: tag.clone(),
                        frames,
                    };
                    if event_tx.send(inbound).await.is_err() {
                        // Node stopped.
                        break;
                    }
                }
            }
            Ok(WsMessage::Close(_)) => {
                debug!("Peer {peer_addr} sent close");
                break;
            }
            Ok(_) => {} // Ignore text/ping/pong
            Err(e) => {
                debug!("Read error from {peer_addr}: {e}");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// WebSocket implementation of [`Transport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn connect(&self, endpoint: &str, origin: &NodeId) -> PeerConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = format!("ws://{}", endpoint_host(endpoint));
        let tag = origin.routing_tag();
        tokio::spawn(async move {
            run_outbound(url, tag, rx).await;
        });
        PeerConnection::new(endpoint, tx)
    }
}

async fn run_outbound(url: String, tag: [u8; ROUTING_TAG_LEN], mut rx: mpsc::UnboundedReceiver<Frames>) {
    let mut attempt = 0;
    let ws = loop {
        attempt += 1;
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => break ws,
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!("Connect to {url} failed (attempt {attempt}): {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            Err(e) => {
                warn!("Giving up on {url} after {attempt} attempts: {e}");
                return;
            }
        }
    };

    let (mut sink, mut stream) = ws.split();
    if let Err(e) = sink.send(WsMessage::Binary(tag.to_vec().into())).await {
        warn!("Failed to announce routing tag to {url}: {e}");
        return;
    }
    debug!("Outbound channel to {url} open");

    loop {
        tokio::select! {
            frames = rx.recv() => {
                let Some(frames) = frames else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    debug!("Outbound channel to {url} closed");
                    break;
                };
                let last = frames.len().saturating_sub(1);
                for (i, frame) in frames.into_iter().enumerate() {
                    let mut segment = Vec::with_capacity(frame.len() + 1);
                    segment.push(if i == last { FRAME_LAST } else { FRAME_MORE });
                    segment.extend_from_slice(&frame);
                    if let Err(e) = sink.send(WsMessage::Binary(segment.into())).await {
                        warn!("Send to {url} failed: {e}");
                        return;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(_)) => {} // Listener side never sends data.
                    Some(Err(e)) => {
                        debug!("Outbound channel to {url} failed: {e}");
                        break;
                    }
                    None => {
                        debug!("Remote {url} closed the channel");
                        break;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory transport for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::message::Message;

    /// Records every channel opened and keeps the receiving ends so tests can
    /// inspect what a peer sent.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingTransport {
        links: Arc<Mutex<HashMap<String, mpsc::UnboundedReceiver<Frames>>>>,
        opened: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTransport {
        /// Endpoints connected to, in order.
        pub(crate) fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }

        /// Decode everything queued on the channel to `endpoint` so far.
        pub(crate) fn sent(&self, endpoint: &str) -> Vec<Message> {
            let mut links = self.links.lock().unwrap();
            let Some(rx) = links.get_mut(endpoint) else {
                return Vec::new();
            };
            let mut out = Vec::new();
            while let Ok(frames) = rx.try_recv() {
                out.push(Message::from_frames(&frames).unwrap());
            }
            out
        }

        /// Whether the channel to `endpoint` has been closed by its owner.
        /// Discards anything still queued on it.
        pub(crate) fn is_closed(&self, endpoint: &str) -> bool {
            let mut links = self.links.lock().unwrap();
            let Some(rx) = links.get_mut(endpoint) else {
                return true;
            };
            loop {
                match rx.try_recv() {
                    Ok(_) => continue,
                    Err(e) => return e == mpsc::error::TryRecvError::Disconnected,
                }
            }
        }
    }

    impl Transport for RecordingTransport {
        fn connect(&self, endpoint: &str, _origin: &NodeId) -> PeerConnection {
            let (tx, rx) = mpsc::unbounded_channel();
            self.links.lock().unwrap().insert(endpoint.to_string(), rx);
            self.opened.lock().unwrap().push(endpoint.to_string());
            PeerConnection::new(endpoint, tx)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
