//! Core data model: posts, post identity, shared protocol constants.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::net::Ipv4Addr;

// =============================================================================
// PROTOCOL CONSTANTS
// =============================================================================

/// Maximum post length in Unicode code points.
pub const MAX_MSG_CHARS: usize = 140;

/// Default multicast group for LAN gossip.
pub const MCAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 1, 100);

/// Default multicast port.
pub const MCAST_PORT: u16 = 50000;

/// Multicast TTL. 255 keeps datagrams routable across the whole link.
pub const MCAST_TTL: u32 = 255;

/// TTL attached to freshly generated requests.
/// Two hops covers a LAN segment plus one relay.
pub const REQUEST_TTL: i32 = 2;

/// TTL attached to replies. Replies may have to travel back through
/// more relays than the request took to arrive.
pub const REPLY_TTL: i32 = 4;

/// Anti-entropy period in seconds between `gen_pull`/`gen_gap` rounds.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Default HTTP port for the local UI.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Current wall-clock time in whole seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

// =============================================================================
// POST
// =============================================================================

/// A single microblog post.
///
/// `hashid` is the primary key of the post set: hex SHA-1 over the UTF-8
/// concatenation `uid || msg || txtime || postid`, with the integers in
/// decimal. Posts are never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Author identity.
    pub uid: String,
    /// Author-assigned dense sequence number, starting at 1.
    pub postid: u64,
    /// Message text, at most [`MAX_MSG_CHARS`] code points.
    pub msg: String,
    /// Author wall-clock seconds at creation.
    pub txtime: i64,
    /// Local wall-clock seconds at first insertion.
    pub rxtime: i64,
    /// Hex SHA-1 identity of the post.
    pub hashid: String,
}

impl Post {
    /// Compute the canonical hash identity for the given post fields.
    pub fn compute_hashid(uid: &str, msg: &str, txtime: i64, postid: u64) -> String {
        let mut hasher = Sha1::new();
        hasher.update(uid.as_bytes());
        hasher.update(msg.as_bytes());
        hasher.update(txtime.to_string().as_bytes());
        hasher.update(postid.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// True when `hashid` matches the other fields.
    pub fn hash_matches(&self) -> bool {
        Self::compute_hashid(&self.uid, &self.msg, self.txtime, self.postid) == self.hashid
    }
}
