//! Opening streams to nodes.
//!
//! [`Connector`] is the seam between the pool and the network. The production
//! [`TcpConnector`] resolves, dials and upgrades to WebSocket under a single
//! deadline; tests substitute an in-memory implementation.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bcos_core::Endpoint;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

use crate::error::ConnectError;

/// Any duplex byte stream a WebSocket can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// WebSocket over a type-erased transport.
pub type WsStream = WebSocketStream<BoxedTransport>;

/// A freshly opened stream.
pub struct Connection {
    /// Upgraded WebSocket.
    pub stream: WsStream,
    /// Socket address actually reached, when known.
    pub peer: Option<SocketAddr>,
}

/// Opens WebSocket streams to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve, dial and upgrade. Errors name the phase that failed.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, ConnectError>;
}

/// Plain `ws://` connector over TCP.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    timeout: Duration,
    max_message_size: usize,
}

impl TcpConnector {
    /// Connector with an overall deadline and an inbound message cap.
    pub fn new(timeout: Duration, max_message_size: usize) -> Self {
        Self {
            timeout,
            max_message_size,
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Connection, ConnectError> {
        let addrs: Vec<SocketAddr> = lookup_host((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| ConnectError::Resolve {
                endpoint: endpoint.key(),
                reason: e.to_string(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::Resolve {
                endpoint: endpoint.key(),
                reason: "no addresses".into(),
            });
        }

        let mut last_err = None;
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(tcp) => {
                    connected = Some((tcp, addr));
                    break;
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, %addr, error = %e, "tcp connect failed");
                    last_err = Some(e);
                }
            }
        }
        let (tcp, peer) = connected.ok_or_else(|| ConnectError::Connect {
            endpoint: endpoint.key(),
            reason: last_err.map_or_else(|| "unreachable".into(), |e| e.to_string()),
        })?;
        let _ = tcp.set_nodelay(true);

        let url = format!("ws://{endpoint}/");
        let transport: BoxedTransport = Box::new(tcp);
        let (stream, _response) =
            tokio_tungstenite::client_async_with_config(url, transport, Some(self.ws_config()))
                .await
                .map_err(|e| ConnectError::Handshake {
                    endpoint: endpoint.key(),
                    reason: e.to_string(),
                })?;

        Ok(Connection {
            stream,
            peer: Some(peer),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, ConnectError> {
        tokio::time::timeout(self.timeout, self.dial(endpoint))
            .await
            .map_err(|_| ConnectError::Timeout {
                endpoint: endpoint.key(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn connector(ms: u64) -> TcpConnector {
        TcpConnector::new(Duration::from_millis(ms), 1024 * 1024)
    }

    #[tokio::test]
    async fn connects_and_exchanges_binary() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let msg = ws.next().await.unwrap().unwrap();
            ws.send(msg).await.unwrap();
        });

        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let mut conn = connector(2000).connect(&endpoint).await.unwrap();
        assert_eq!(conn.peer, Some(addr));

        conn.stream
            .send(Message::Binary(vec![1u8, 2, 3].into()))
            .await
            .unwrap();
        let echoed = conn.stream.next().await.unwrap().unwrap();
        assert_eq!(&echoed.into_data()[..], &[1u8, 2, 3]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_port_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connector(2000)
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert_matches!(err, ConnectError::Connect { .. });
        assert_eq!(err.phase(), "connect");
    }

    #[tokio::test]
    async fn silent_peer_hits_deadline() {
        // accepts TCP but never answers the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = connector(150)
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert_matches!(err, ConnectError::Timeout { timeout_ms: 150, .. });
    }

    #[tokio::test]
    async fn non_websocket_peer_is_handshake_error() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let _ = tcp
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = connector(2000)
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert_matches!(err, ConnectError::Handshake { .. });
    }
}
