pub mod engine;
pub mod net;
pub mod node;
pub mod store;
pub mod types;

pub use engine::{Protocol, ProtocolError};
pub use net::{
    DecodeError, Envelope, Friends, HeaderKind, Headers, Method, PostTuple, Query, RouteDecision,
    Router, RouterError, Sender, TransportError, HTO_ALL, HTO_ANY,
};
pub use node::{Config, IngressMsg, Node, NodeError, ResponseMsg};
pub use store::{Store, StoreError, DEFAULT_GET_LIMIT, MAX_RESPONSE_POSTS};
pub use types::*;
