//! Multicast socket construction and the datagram listener task.

use crate::net::sender::Sender;
use crate::node::IngressMsg;
use crate::types::MCAST_TTL;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Largest accepted datagram. Envelopes are a few hundred bytes; a gap
/// request over many friends is the worst case.
const MAX_DATAGRAM: usize = 4096;

/// Open the shared gossip socket: bound to the multicast port on all
/// addresses, joined to `group` on each configured interface (or the
/// default interface when none are given), loop enabled so single-host
/// setups can talk to themselves.
pub fn open_socket(
    group: Ipv4Addr,
    port: u16,
    interfaces: &[Ipv4Addr],
) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(MCAST_TTL)?;
    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;

    if interfaces.is_empty() {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    } else {
        for intf in interfaces {
            socket.join_multicast_v4(&group, intf)?;
        }
    }

    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket.into())?;
    info!(%group, port, "joined multicast group");
    Ok(socket)
}

/// Receive datagrams and feed them into the ingress queue until shutdown.
///
/// Each message is paired with a UDP sender bound to its source address,
/// so the worker can learn routes and reply directly.
pub async fn listen(
    socket: Arc<UdpSocket>,
    interfaces: Vec<Ipv4Addr>,
    mcast: SocketAddr,
    ingress: mpsc::Sender<IngressMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok((0, _)) => continue,
                Ok((n, addr)) => {
                    let Ok(payload) = std::str::from_utf8(&buf[..n]) else {
                        warn!(%addr, "dropping non-utf8 datagram");
                        continue;
                    };
                    debug!(%addr, len = n, "datagram");
                    let sender =
                        Sender::udp(socket.clone(), interfaces.clone(), Some(addr), mcast);
                    if ingress
                        .send((Some(payload.to_string()), Some(sender)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!("recv error: {e}"),
            },
        }
    }
    info!("multicast listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_binds_and_joins_default_group() {
        // port 0: the OS picks, so tests never collide
        match open_socket(crate::types::MCAST_GROUP, 0, &[]) {
            Ok(socket) => assert!(socket.local_addr().is_ok()),
            // hosts without a multicast-capable interface
            Err(e) => eprintln!("skipping, no multicast here: {e}"),
        }
    }
}
