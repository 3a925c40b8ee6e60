//! A concrete realization of `storj_rpc::Transport` over plain TCP.
//!
//! `storj_rpc::Transport` is deliberately a thin seam: the overlay's actual peer
//! connectivity is `libp2p`'s job (SPEC_FULL §2), out of this crate's scope. Something
//! still has to carry bytes for the binary to be runnable end to end, so this module
//! is the minimal concrete stand-in: one length-prefixed JSON envelope per connection.
//! `Envelope` itself carries no sender field (§6's wire shape omits it — the sender is
//! normally implicit in the underlying libp2p stream's `PeerId`), so [`WireRequest`]
//! wraps it with the claimed node id for this transport's connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storj_crypto::NodeId;
use storj_rpc::{Contact, Envelope, Transport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// An envelope plus the sender's claimed node id, as carried over one TCP connection.
#[derive(Serialize, Deserialize)]
pub struct WireRequest {
    pub sender: NodeId,
    pub envelope: Envelope,
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(value).expect("envelopes always serialize");
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> std::io::Result<T> {
    let len = stream.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Client half of the TCP transport. Remembers the address of every contact it has
/// ever [`Transport::dial`]ed so that a later [`Transport::request`] by bare `NodeId`
/// (the shape the rest of the overlay code calls, once a peer is in the routing
/// table) can still find somewhere to connect.
pub struct TcpTransport {
    self_id: NodeId,
    addresses: Mutex<HashMap<NodeId, SocketAddr>>,
}

impl TcpTransport {
    pub fn new(self_id: NodeId) -> Arc<Self> {
        Arc::new(Self { self_id, addresses: Mutex::new(HashMap::new()) })
    }

    pub async fn remember(&self, node_id: NodeId, addr: SocketAddr) {
        self.addresses.lock().await.insert(node_id, addr);
    }

    async fn send(&self, addr: SocketAddr, envelope: Envelope) -> Result<Envelope, TransportError> {
        let mut stream = TcpStream::connect(addr).await.map_err(TransportError::Io)?;
        write_frame(&mut stream, &WireRequest { sender: self.self_id, envelope }).await.map_err(TransportError::Io)?;
        read_frame(&mut stream).await.map_err(TransportError::Io)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn request(&self, peer: NodeId, envelope: Envelope) -> Result<Envelope, TransportError> {
        let addr = *self.addresses.lock().await.get(&peer).ok_or(TransportError::Unreachable(peer))?;
        self.send(addr, envelope).await
    }

    async fn dial(&self, contact: &Contact, envelope: Envelope) -> Result<Envelope, TransportError> {
        let addr: SocketAddr = format!("{}:{}", contact.address, contact.port)
            .parse()
            .map_err(|_| TransportError::Unreachable(contact.node_id))?;
        self.remember(contact.node_id, addr).await;
        self.send(addr, envelope).await
    }
}

/// Accepts connections on `listener` until `shutdown` fires, handing each one's
/// [`WireRequest`] to `dispatcher` and writing back the signed response.
pub async fn run_rpc_server(
    listener: TcpListener,
    dispatcher: Arc<storj_rpc::Dispatcher>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((mut stream, peer_addr)) = accepted else { continue };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    let request: WireRequest = match read_frame(&mut stream).await {
                        Ok(r) => r,
                        Err(err) => {
                            tracing::warn!(%peer_addr, %err, "malformed RPC frame");
                            return;
                        }
                    };
                    match dispatcher.dispatch(request.envelope, request.sender).await {
                        Ok(response) => {
                            if let Err(err) = write_frame(&mut stream, &response).await {
                                tracing::warn!(%peer_addr, %err, "failed to write RPC response");
                            }
                        }
                        Err(err) => {
                            tracing::debug!(%peer_addr, %err, "RPC dispatch failed");
                        }
                    }
                });
            }
            _ = shutdown.notified() => break,
        }
    }
}
