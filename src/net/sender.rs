//! Transmit capability attached to each in-flight message.
//!
//! A `Sender` is how a response (or forwarded packet) travels back out:
//! either a UDP socket with an optional fixed destination, or the reply
//! channel of a waiting HTTP request.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

/// What an HTTP handler receives back from the worker.
pub type HttpReply = Result<String, String>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reply channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub enum Sender {
    Udp {
        socket: Arc<UdpSocket>,
        /// Interfaces to emit multicast on; empty means the OS default.
        interfaces: Vec<Ipv4Addr>,
        /// Unicast destination; `None` means the multicast group.
        dest: Option<SocketAddr>,
        mcast: SocketAddr,
    },
    Http {
        reply: mpsc::Sender<HttpReply>,
        dest: SocketAddr,
    },
}

impl Sender {
    pub fn udp(
        socket: Arc<UdpSocket>,
        interfaces: Vec<Ipv4Addr>,
        dest: Option<SocketAddr>,
        mcast: SocketAddr,
    ) -> Self {
        Sender::Udp {
            socket,
            interfaces,
            dest,
            mcast,
        }
    }

    pub fn http(reply: mpsc::Sender<HttpReply>, dest: SocketAddr) -> Self {
        Sender::Http { reply, dest }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Sender::Http { .. })
    }

    /// The transport address this sender is bound to, if any.
    pub fn dest_addr(&self) -> Option<SocketAddr> {
        match self {
            Sender::Udp { dest, .. } => *dest,
            Sender::Http { dest, .. } => Some(*dest),
        }
    }

    /// Transmit one encoded envelope.
    pub async fn send(&self, data: &str) -> Result<(), TransportError> {
        match self {
            Sender::Udp {
                socket,
                dest: Some(dest),
                ..
            } => {
                socket.send_to(data.as_bytes(), dest).await?;
                debug!(%dest, len = data.len(), "udp send");
            }
            Sender::Udp {
                socket,
                interfaces,
                dest: None,
                mcast,
            } => {
                // Re-emit on each configured interface by switching the
                // outgoing-interface socket option per send.
                if interfaces.is_empty() {
                    socket.send_to(data.as_bytes(), mcast).await?;
                } else {
                    for intf in interfaces {
                        socket2::SockRef::from(socket.as_ref()).set_multicast_if_v4(intf)?;
                        socket.send_to(data.as_bytes(), mcast).await?;
                    }
                }
                debug!(dest = %mcast, len = data.len(), "multicast send");
            }
            Sender::Http { reply, dest } => {
                reply
                    .send(Ok(data.to_string()))
                    .await
                    .map_err(|_| TransportError::ChannelClosed)?;
                debug!(%dest, len = data.len(), "http reply");
            }
        }
        Ok(())
    }

    /// Report a processing failure to an HTTP caller. No-op over UDP:
    /// gossip peers recover through the periodic anti-entropy rounds.
    pub async fn send_error(&self, text: &str) {
        if let Sender::Http { reply, .. } = self {
            let _ = reply.send(Err(text.to_string())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn udp_unicast_reaches_destination() {
        let rx = loopback_socket().await;
        let dest = rx.local_addr().unwrap();
        let tx = loopback_socket().await;

        let sender = Sender::udp(tx, vec![], Some(dest), "239.192.1.100:50000".parse().unwrap());
        sender.send("{\"m\":\"gen_pull\"}").await.unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = rx.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"m\":\"gen_pull\"}");
    }

    #[tokio::test]
    async fn http_reply_lands_on_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = Sender::http(tx, "127.0.0.1:9999".parse().unwrap());
        assert!(sender.is_http());
        sender.send("[]").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Ok("[]".to_string()));
    }

    #[tokio::test]
    async fn http_error_reply() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = Sender::http(tx, "127.0.0.1:9999".parse().unwrap());
        sender.send_error("boom").await;
        assert_eq!(rx.recv().await.unwrap(), Err("boom".to_string()));
    }
}
