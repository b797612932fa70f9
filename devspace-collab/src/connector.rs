//! Network seam between a session driver and its relay.
//!
//! A [`Connector`] opens one [`Link`] per room: a sender for outbound
//! frames and a receiver of decoded inbound frames. When the relay goes
//! away the inbound receiver closes; when the link is dropped its socket
//! tasks stop.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::protocol::{RoomKey, SyncMessage};

/// Frames buffered per direction.
const LINK_CAPACITY: usize = 256;

/// A frame not written within this long means the relay is unreachable.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One live connection to a room.
pub struct Link {
    outgoing: mpsc::Sender<SyncMessage>,
    incoming: mpsc::Receiver<SyncMessage>,
    /// Socket reader feeding `incoming`, stopped when the link is dropped.
    reader: Option<AbortHandle>,
}

impl Link {
    pub fn new(outgoing: mpsc::Sender<SyncMessage>, incoming: mpsc::Receiver<SyncMessage>) -> Self {
        Self {
            outgoing,
            incoming,
            reader: None,
        }
    }

    fn with_reader(mut self, reader: AbortHandle) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Two links wired back to back.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Link::new(a_tx, b_rx), Link::new(b_tx, a_rx))
    }

    pub async fn send(&self, message: SyncMessage) -> Result<(), TransportError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next inbound frame; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.incoming.recv().await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, room: &RoomKey) -> Result<Link, TransportError>;
}

/// WebSocket connector for a relay at `server_url`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, room: &RoomKey) -> Result<Link, TransportError> {
        let url = room.url(&self.server_url);
        let connect_error = |reason: String| TransportError::Connect {
            url: url.clone(),
            reason,
        };

        let (ws_stream, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(&url))
                .await
                .map_err(|_| connect_error("timed out".to_string()))?
                .map_err(|e| connect_error(e.to_string()))?;
        log::debug!("Connected to {url}");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(LINK_CAPACITY);

        // Writer task: encode and forward until the driver drops the link,
        // then flush what is queued and close.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let encoded = match message.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode {} frame: {e}", message.msg_type.name());
                        continue;
                    }
                };
                let sent = tokio::time::timeout(WRITE_TIMEOUT, ws_writer.send(Message::Binary(encoded.into())));
                match sent.await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        log::warn!("Write stalled for {WRITE_TIMEOUT:?}, dropping connection");
                        break;
                    }
                }
            }
            let _ = tokio::time::timeout(WRITE_TIMEOUT, ws_writer.close()).await;
        });

        // Reader task: decode inbound frames, drop malformed ones.
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(message) => {
                            if in_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::debug!("Connection reader finished");
        });

        Ok(Link::new(out_tx, in_rx).with_reader(reader.abort_handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaId;

    #[tokio::test]
    async fn test_link_pair() {
        let (a, mut b) = Link::pair(4);
        let ping = SyncMessage::ping(ReplicaId::random());
        a.send(ping.clone()).await.unwrap();
        assert_eq!(b.recv().await, Some(ping));

        drop(a);
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped() {
        let (a, b) = Link::pair(4);
        drop(b);
        assert!(matches!(
            a.send(SyncMessage::ping(ReplicaId::random())).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_link_stops_reader() {
        let (link, _peer) = Link::pair(4);
        let marker = std::sync::Arc::new(());
        let held = marker.clone();
        let reader = tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });
        let link = link.with_reader(reader.abort_handle());

        drop(link);
        assert!(reader.await.unwrap_err().is_cancelled());
        assert_eq!(std::sync::Arc::strong_count(&marker), 1);
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WsConnector::new(format!("ws://127.0.0.1:{port}"));
        let room = RoomKey::from_raw("codespace-x");
        assert!(matches!(
            connector.connect(&room).await,
            Err(TransportError::Connect { .. })
        ));
    }
}
