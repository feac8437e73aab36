//! Gossip networking: wire format, overlay routing, transports.

pub mod http;
pub mod message;
pub mod multicast;
pub mod router;
pub mod sender;

// Re-exports
pub use http::{HttpState, CONTENT_TYPE_JSON};
pub use message::{
    to_tuples, DecodeError, Envelope, Friends, HeaderKind, Headers, Method, PostTuple, Query,
    HTO_ALL, HTO_ANY,
};
pub use multicast::open_socket;
pub use router::{RouteDecision, Router, RouterError};
pub use sender::{HttpReply, Sender, TransportError};
