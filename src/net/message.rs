//! Wire envelopes: one UTF-8 JSON object per datagram or HTTP `json` field.
//!
//! ```text
//! {
//!   "m":       <method>                                        | absent,
//!   "headers": {"hto", "hfrom", "hid", "htype", "httl"}        | absent,
//!   "query":   {"m", "uid", "friends"}                         | absent,
//!   "posts":   [[uid, postid, txtime, rxtime, msg, hashid], …] | absent
//! }
//! ```

use crate::store::{FriendMarks, GapWindows};
use crate::types::Post;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Routing wildcard: broadcast to the multicast group.
pub const HTO_ALL: &str = "all";
/// Routing wildcard: unicast to one randomly chosen known peer.
pub const HTO_ANY: &str = "any";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

// =============================================================================
// ROUTING HEADERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderKind {
    Req,
    Rep,
}

/// Routing metadata attached to envelopes that take part in gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Destination uid, or [`HTO_ALL`] / [`HTO_ANY`].
    pub hto: String,
    /// Originating uid.
    pub hfrom: String,
    /// Opaque request id; replies echo the request's.
    pub hid: String,
    pub htype: HeaderKind,
    /// Remaining hops. Never transmitted once negative.
    pub httl: i32,
}

// =============================================================================
// METHODS AND QUERY BODY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    GenPull,
    Pull,
    GenGap,
    Gap,
    GenPush,
    Push,
    Get,
    Post,
}

/// Friend carrier: high-water marks for `pull`, missing windows for `gap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Friends {
    Marks(FriendMarks),
    Windows(GapWindows),
}

impl Default for Friends {
    fn default() -> Self {
        Friends::Marks(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub m: Method,
    pub uid: String,
    #[serde(default)]
    pub friends: Friends,
}

// =============================================================================
// POST TUPLE
// =============================================================================

/// Wire form of a post: `[uid, postid, txtime, rxtime, msg, hashid]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTuple(
    pub String,
    pub u64,
    pub i64,
    pub i64,
    pub String,
    pub String,
);

impl From<&Post> for PostTuple {
    fn from(p: &Post) -> Self {
        PostTuple(
            p.uid.clone(),
            p.postid,
            p.txtime,
            p.rxtime,
            p.msg.clone(),
            p.hashid.clone(),
        )
    }
}

pub fn to_tuples(posts: &[Post]) -> Vec<PostTuple> {
    posts.iter().map(PostTuple::from).collect()
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// One gossip or API message.
///
/// The top-level `uid`/`begin`/`until`/`limit`/`msg` fields only appear on
/// the local-only `get` and `post` methods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posts: Option<Vec<PostTuple>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Envelope {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Bare `{m: ..}` trigger envelope, as emitted by the scheduler.
    pub fn trigger(m: Method) -> Self {
        Envelope {
            m: Some(m),
            ..Default::default()
        }
    }

    /// Effective method: a `query` method overrides the top-level `m`.
    pub fn method(&self) -> Option<Method> {
        self.query.as_ref().map(|q| q.m).or(self.m)
    }

    /// True when transmitting this envelope would carry no information.
    pub fn is_vacant(&self) -> bool {
        self.m.is_none()
            && self.query.is_none()
            && self.posts.as_ref().is_none_or(|p| p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_trigger() {
        let env = Envelope::decode(r#"{"m":"gen_pull"}"#).unwrap();
        assert_eq!(env.method(), Some(Method::GenPull));
        assert!(env.headers.is_none());
    }

    #[test]
    fn query_method_overrides_top_level() {
        let env = Envelope::decode(
            r#"{"m":"push","query":{"m":"pull","uid":"bob","friends":[["alice",100]]}}"#,
        )
        .unwrap();
        assert_eq!(env.method(), Some(Method::Pull));
        let q = env.query.unwrap();
        assert_eq!(q.friends, Friends::Marks(vec![("alice".into(), 100)]));
    }

    #[test]
    fn friends_carrier_shapes() {
        // pull carries an array of [fid, txtime]
        let q: Query =
            serde_json::from_str(r#"{"m":"pull","uid":"b","friends":[["a",5]]}"#).unwrap();
        assert!(matches!(q.friends, Friends::Marks(ref v) if v.len() == 1));

        // gap carries a map fid -> [[start, end], ..]
        let q: Query =
            serde_json::from_str(r#"{"m":"gap","uid":"b","friends":{"a":[[0,7]]}}"#).unwrap();
        match q.friends {
            Friends::Windows(w) => assert_eq!(w.get("a").unwrap(), &vec![(0, 7)]),
            other => panic!("expected windows, got {other:?}"),
        }

        // absent friends defaults to no marks
        let q: Query = serde_json::from_str(r#"{"m":"pull","uid":"b"}"#).unwrap();
        assert_eq!(q.friends, Friends::Marks(vec![]));
    }

    #[test]
    fn post_tuple_round_trip() {
        let raw = r#"[["alice",1,100,100,"hi","abcd"]]"#;
        let posts: Vec<PostTuple> = serde_json::from_str(raw).unwrap();
        assert_eq!(posts[0].0, "alice");
        assert_eq!(posts[0].1, 1);
        assert_eq!(serde_json::to_string(&posts).unwrap(), raw);
    }

    #[test]
    fn headers_round_trip() {
        let raw = r#"{"hto":"all","hfrom":"alice","hid":"1f","htype":"req","httl":2}"#;
        let h: Headers = serde_json::from_str(raw).unwrap();
        assert_eq!(h.htype, HeaderKind::Req);
        assert_eq!(serde_json::to_string(&h).unwrap(), raw);
    }

    #[test]
    fn absent_fields_not_serialized() {
        let env = Envelope::trigger(Method::GenGap);
        assert_eq!(env.encode().unwrap(), r#"{"m":"gen_gap"}"#);
    }

    #[test]
    fn vacancy() {
        assert!(Envelope::default().is_vacant());
        assert!(!Envelope::trigger(Method::GenPull).is_vacant());
        let mut env = Envelope::default();
        env.posts = Some(vec![]);
        assert!(env.is_vacant());
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(DecodeError::Json(_))
        ));
    }
}
