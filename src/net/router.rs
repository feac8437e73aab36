//! Overlay router: per-packet forward/process decisions, next-hop
//! selection, loop suppression, and learned routing tables.
//!
//! The tables are process-local and intentionally ephemeral:
//!
//! - `addrs`: every peer transport address ever observed (deduplicated);
//!   the candidate pool for `hto = "any"` requests.
//! - `uid_to_addr`: last known address per remote identity.
//! - `mid_to_addr`: upstream address per forwarded request id; steers
//!   replies back and suppresses request loops.

use crate::net::message::{Envelope, HeaderKind, Headers, HTO_ALL, HTO_ANY};
use crate::net::sender::Sender;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Bound on remembered request ids; the oldest are forgotten first.
const MAX_SEEN_REQUESTS: usize = 10_000;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("empty routing table")]
    EmptyTable,
    #[error("no route for destination")]
    UnknownDestination,
}

/// Outcome of [`Router::should_process`].
pub struct RouteDecision {
    /// Hand the envelope to the protocol engine.
    pub process: bool,
    /// One-hop forward copy (TTL already decremented) and its next hop.
    pub forward: Option<(Envelope, Sender)>,
}

pub struct Router {
    self_uid: String,
    socket: Arc<UdpSocket>,
    interfaces: Vec<Ipv4Addr>,
    mcast: SocketAddr,
    addrs: Vec<SocketAddr>,
    uid_to_addr: HashMap<String, SocketAddr>,
    mid_to_addr: HashMap<String, SocketAddr>,
    mid_order: VecDeque<String>,
}

impl Router {
    pub fn new(
        self_uid: &str,
        socket: Arc<UdpSocket>,
        interfaces: Vec<Ipv4Addr>,
        mcast: SocketAddr,
    ) -> Self {
        Self {
            self_uid: self_uid.to_string(),
            socket,
            interfaces,
            mcast,
            addrs: Vec::new(),
            uid_to_addr: HashMap::new(),
            mid_to_addr: HashMap::new(),
            mid_order: VecDeque::new(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.addrs.len()
    }

    /// A sender addressed at the multicast group on every interface.
    fn bcast_sender(&self) -> Sender {
        Sender::udp(
            self.socket.clone(),
            self.interfaces.clone(),
            None,
            self.mcast,
        )
    }

    fn unicast_sender(&self, dest: SocketAddr) -> Sender {
        Sender::udp(self.socket.clone(), Vec::new(), Some(dest), self.mcast)
    }

    /// Uniformly random known peer, for `hto = "any"`.
    fn rand_sender(&self) -> Result<Sender, RouterError> {
        if self.addrs.is_empty() {
            return Err(RouterError::EmptyTable);
        }
        let idx = rand::thread_rng().gen_range(0..self.addrs.len());
        Ok(self.unicast_sender(self.addrs[idx]))
    }

    /// Directed lookup: the request id's upstream wins over the
    /// destination uid's last known address.
    fn lookup_sender(&self, hto: &str, hid: &str) -> Result<Sender, RouterError> {
        if let Some(addr) = self.mid_to_addr.get(hid) {
            return Ok(self.unicast_sender(*addr));
        }
        if let Some(addr) = self.uid_to_addr.get(hto) {
            return Ok(self.unicast_sender(*addr));
        }
        Err(RouterError::UnknownDestination)
    }

    fn should_send(&self, h: &Headers) -> bool {
        let mut ok = h.httl >= 0 && h.hto != self.self_uid;
        if h.htype == HeaderKind::Req {
            ok = ok && !self.mid_to_addr.contains_key(&h.hid);
        }
        ok
    }

    /// Learn routes from the address that handed us this envelope.
    /// Loopback addresses are never learned.
    fn add_route(&mut self, h: &Headers, addr: Option<SocketAddr>) {
        let Some(addr) = addr else { return };
        if addr.ip().is_loopback() {
            return;
        }
        debug!(hfrom = %h.hfrom, %addr, "add route");
        self.uid_to_addr.insert(h.hfrom.clone(), addr);
        if h.htype == HeaderKind::Req && self.mid_to_addr.insert(h.hid.clone(), addr).is_none() {
            self.mid_order.push_back(h.hid.clone());
            if self.mid_order.len() > MAX_SEEN_REQUESTS
                && let Some(old) = self.mid_order.pop_front()
            {
                self.mid_to_addr.remove(&old);
            }
        }
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }

    /// Resolve a next hop for `env` and learn a route from `source`.
    ///
    /// On success returns the transmit-ready copy (TTL decremented) and
    /// its sender; `None` when the envelope has no headers, fails the
    /// send gate, or its TTL is exhausted. Routes are learned from
    /// `source` regardless of the forwarding outcome.
    pub fn send(
        &mut self,
        env: &Envelope,
        source: Option<&Sender>,
    ) -> Result<Option<(Envelope, Sender)>, RouterError> {
        let result = self.resolve(env);
        if let (Some(src), Some(h)) = (source, env.headers.as_ref()) {
            self.add_route(h, src.dest_addr());
        }
        result
    }

    fn resolve(&self, env: &Envelope) -> Result<Option<(Envelope, Sender)>, RouterError> {
        let Some(h) = env.headers.as_ref() else {
            return Ok(None);
        };
        if !self.should_send(h) {
            return Ok(None);
        }

        let next = if h.hto == HTO_ANY && h.htype == HeaderKind::Req {
            self.rand_sender()?
        } else if h.hto == HTO_ALL && h.htype == HeaderKind::Req {
            self.bcast_sender()
        } else {
            self.lookup_sender(&h.hto, &h.hid)?
        };

        let mut out = env.clone();
        let httl = match out.headers.as_mut() {
            Some(oh) => {
                oh.httl -= 1;
                oh.httl
            }
            None => return Ok(None),
        };
        if httl >= 0 {
            Ok(Some((out, next)))
        } else {
            Ok(None)
        }
    }

    /// Decide what to do with an incoming envelope: drop our own
    /// multicast echo, drop already-seen requests, otherwise forward one
    /// hop (when routable) and process locally. The caller's view of the
    /// envelope keeps its original TTL.
    pub fn should_process(&mut self, env: &Envelope, source: Option<&Sender>) -> RouteDecision {
        if let Some(addr) = source.and_then(|s| s.dest_addr())
            && let IpAddr::V4(ip) = addr.ip()
            && self.interfaces.contains(&ip)
        {
            debug!(%addr, "dropping own echo");
            return RouteDecision {
                process: false,
                forward: None,
            };
        }

        if let Some(h) = env.headers.as_ref()
            && h.htype == HeaderKind::Req
            && self.mid_to_addr.contains_key(&h.hid)
        {
            debug!(hid = %h.hid, "dropping duplicate request");
            return RouteDecision {
                process: false,
                forward: None,
            };
        }

        let mut forward = None;
        if env.headers.is_some() {
            match self.send(env, source) {
                Ok(f) => forward = f,
                // Routing failures never block local processing.
                Err(e) => debug!("forward failed: {e}"),
            }
        }

        RouteDecision {
            process: true,
            forward,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
