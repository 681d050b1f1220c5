//! In-process transport.
//!
//! [`memory_transport`] returns a connector for the manager and the broker
//! side that accepts its links. Used to embed a broker in the same process
//! and to drive the connection manager deterministically in tests.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use umi_shared::stomp::{Command, Decoded, Frame, FrameDecoder};

use crate::error::NetError;
use crate::transport::{Connector, Link};

const MEMORY_CHANNEL_CAPACITY: usize = 256;

/// Client half: hands out links whose other ends appear on [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<BrokerEnd>,
    refusals: Arc<AtomicU32>,
}

/// Broker half: receives every link opened through the connector.
#[derive(Debug)]
pub struct MemoryBroker {
    accept_rx: mpsc::UnboundedReceiver<BrokerEnd>,
    refusals: Arc<AtomicU32>,
}

/// Broker side of one link.
#[derive(Debug)]
pub struct BrokerEnd {
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<String>,
    decoder: FrameDecoder,
}

pub fn memory_transport() -> (MemoryConnector, MemoryBroker) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let refusals = Arc::new(AtomicU32::new(0));
    (
        MemoryConnector {
            accept_tx,
            refusals: refusals.clone(),
        },
        MemoryBroker {
            accept_rx,
            refusals,
        },
    )
}

impl Connector for MemoryConnector {
    fn open(&self) -> impl Future<Output = Result<Link, NetError>> + Send {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if refused {
            Err(NetError::Transport("connection refused".into()))
        } else {
            let (out_tx, out_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
            let end = BrokerEnd {
                from_client: out_rx,
                to_client: in_tx,
                decoder: FrameDecoder::new(),
            };
            match self.accept_tx.send(end) {
                Ok(()) => Ok(Link {
                    outbound: out_tx,
                    inbound: in_rx,
                }),
                Err(_) => Err(NetError::Transport("memory broker is gone".into())),
            }
        };
        std::future::ready(result)
    }
}

impl MemoryBroker {
    /// Wait for the next link opened by the client.
    pub async fn accept(&mut self) -> Option<BrokerEnd> {
        self.accept_rx.recv().await
    }

    /// Make the next `n` connection attempts fail at the transport level.
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }
}

impl BrokerEnd {
    /// Next frame written by the client, skipping heart-beats.
    /// `None` once the client closed the link.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            while let Some(item) = self.decoder.next_item() {
                match item {
                    Ok(Decoded::Frame(frame)) => return Some(frame),
                    Ok(Decoded::Heartbeat) => continue,
                    Err(e) => debug!(error = %e, "Memory broker dropped malformed frame"),
                }
            }
            let text = self.from_client.recv().await?;
            self.decoder.push(&text);
        }
    }

    /// Raw text written by the client, heart-beats included.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn send_frame(&self, frame: &Frame) -> bool {
        self.send_raw(frame.encode()).await
    }

    pub async fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).await.is_ok()
    }

    /// Accept a CONNECT frame and answer CONNECTED with heart-beats disabled.
    /// Returns the CONNECT frame.
    pub async fn complete_handshake(&mut self) -> Option<Frame> {
        self.complete_handshake_with("0,0").await
    }

    pub async fn complete_handshake_with(&mut self, heartbeat: &str) -> Option<Frame> {
        let connect = self.recv_frame().await?;
        if connect.command != Command::Connect && connect.command != Command::Stomp {
            return None;
        }
        let connected = Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", heartbeat);
        self.send_frame(&connected).await.then_some(connect)
    }

    /// Refuse the session with an ERROR frame.
    pub async fn reject_handshake(&mut self, message: &str) -> Option<Frame> {
        let connect = self.recv_frame().await?;
        let error = Frame::new(Command::Error).header("message", message);
        self.send_frame(&error).await.then_some(connect)
    }

    /// Deliver a MESSAGE frame for a subscription.
    pub async fn deliver(&self, subscription: &str, destination: &str, body: &str) -> bool {
        let frame = Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body);
        self.send_frame(&frame).await
    }
}
