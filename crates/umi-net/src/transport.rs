//! Text transports carrying STOMP frames.
//!
//! A [`Connector`] opens one [`Link`] per connection attempt. The link is a
//! pair of channels; closing of the inbound side signals transport loss.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::NetError;

/// Capacity of the per-link frame channels.
const LINK_CHANNEL_CAPACITY: usize = 256;

/// One open transport connection.
#[derive(Debug)]
pub struct Link {
    /// Text written to the broker. Dropping it closes the transport.
    pub outbound: mpsc::Sender<String>,
    /// Text received from the broker. Yields `None` once the transport closes.
    pub inbound: mpsc::Receiver<String>,
}

/// Opens transport connections to the broker.
pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = Result<Link, NetError>> + Send;
}

/// WebSocket transport (`ws://` / `wss://`) built on tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn open(&self) -> impl Future<Output = Result<Link, NetError>> + Send {
        let url = self.url.clone();
        async move {
            let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| NetError::Transport(format!("{url}: {e}")))?;
            info!(url = %url, "WebSocket opened");

            let (mut sink, mut stream) = ws.split();
            let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);

            // Writer: runs until the manager drops its outbound sender
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        warn!(error = %e, "WebSocket write failed");
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                debug!("WebSocket writer finished");
            });

            // Reader: dropping `in_tx` tells the manager the link is gone
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text.as_str().to_owned(),
                        Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!(len = data.len(), "Dropping non UTF-8 binary message");
                                continue;
                            }
                        },
                        Ok(Message::Close(frame)) => {
                            debug!(frame = ?frame, "WebSocket closed by peer");
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "WebSocket read failed");
                            break;
                        }
                    };
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                debug!("WebSocket reader finished");
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}
