//! Protocol engine: the request/response taxonomy and the header rules
//! that drive anti-entropy.
//!
//! Every locally-accepted envelope passes through [`Protocol::process`]
//! in this order: ingest carried posts, resolve the effective method,
//! build the response body, attach response headers.

use crate::net::message::{
    to_tuples, DecodeError, Envelope, Friends, HeaderKind, Headers, Method, Query, HTO_ALL,
    HTO_ANY,
};
use crate::store::{Store, StoreError, DEFAULT_GET_LIMIT};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub struct Protocol {
    uid: String,
    request_ttl: i32,
    reply_ttl: i32,
}

impl Protocol {
    pub fn new(uid: &str, request_ttl: i32, reply_ttl: i32) -> Self {
        Self {
            uid: uid.to_string(),
            request_ttl,
            reply_ttl,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    fn fresh_hid() -> String {
        hex::encode(rand::random::<[u8; 8]>())
    }

    /// Headers for a self-triggered request: broadcast by default.
    fn request_headers(&self, hto: Option<String>) -> Headers {
        Headers {
            hto: hto.unwrap_or_else(|| HTO_ALL.to_string()),
            hfrom: self.uid.clone(),
            hid: Self::fresh_hid(),
            htype: HeaderKind::Req,
            httl: self.request_ttl,
        }
    }

    /// Headers for a reply: steered back at the requester under the
    /// request's own id.
    fn reply_headers(&self, incoming: Option<&Headers>) -> Headers {
        Headers {
            hto: incoming
                .map(|h| h.hfrom.clone())
                .unwrap_or_else(|| HTO_ANY.to_string()),
            hfrom: self.uid.clone(),
            hid: incoming
                .map(|h| h.hid.clone())
                .unwrap_or_else(Self::fresh_hid),
            htype: HeaderKind::Rep,
            httl: self.reply_ttl,
        }
    }

    /// Process one envelope and build the response, if the method has one.
    pub fn process(
        &self,
        store: &mut Store,
        env: &Envelope,
    ) -> Result<Option<Envelope>, ProtocolError> {
        if let Some(posts) = &env.posts {
            let mut fresh = 0;
            for t in posts {
                match store.post_remote(&t.0, t.1, t.2, &t.4, &t.5) {
                    Ok(_) => fresh += 1,
                    // the steady-state outcome of convergence
                    Err(StoreError::Duplicate(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if fresh > 0 {
                debug!(fresh, total = posts.len(), "ingested posts");
            }
        }

        let Some(method) = env.method() else {
            return Ok(None);
        };

        match method {
            Method::GenPull => {
                let marks = store.gen_pull()?;
                Ok(Some(Envelope {
                    headers: Some(self.request_headers(None)),
                    query: Some(Query {
                        m: Method::Pull,
                        uid: self.uid.clone(),
                        friends: Friends::Marks(marks),
                    }),
                    ..Default::default()
                }))
            }

            Method::Pull => {
                let q = query_of(env)?;
                let Friends::Marks(marks) = &q.friends else {
                    return Err(DecodeError::MissingField("friends").into());
                };
                let posts = store.pull(&q.uid, marks)?;
                Ok(Some(Envelope {
                    headers: Some(self.reply_headers(env.headers.as_ref())),
                    posts: Some(to_tuples(&posts)),
                    ..Default::default()
                }))
            }

            Method::GenGap => {
                let windows = store.gen_gap()?;
                if windows.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Envelope {
                    headers: Some(self.request_headers(None)),
                    query: Some(Query {
                        m: Method::Gap,
                        uid: self.uid.clone(),
                        friends: Friends::Windows(windows),
                    }),
                    ..Default::default()
                }))
            }

            Method::Gap => {
                let q = query_of(env)?;
                let Friends::Windows(windows) = &q.friends else {
                    return Err(DecodeError::MissingField("friends").into());
                };
                let posts = store.gap(&q.uid, windows)?;
                Ok(Some(Envelope {
                    headers: Some(self.reply_headers(env.headers.as_ref())),
                    posts: Some(to_tuples(&posts)),
                    ..Default::default()
                }))
            }

            Method::GenPush => {
                let latest = store.get(Some(&self.uid), 0, i64::MAX, 1)?;
                if latest.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Envelope {
                    m: Some(Method::Push),
                    headers: Some(self.request_headers(None)),
                    posts: Some(to_tuples(&latest)),
                    ..Default::default()
                }))
            }

            // the carried posts were ingested above; nothing to answer
            Method::Push => Ok(None),

            Method::Get => {
                let posts = store.get(
                    env.uid.as_deref(),
                    env.begin.unwrap_or(0),
                    env.until.unwrap_or(i64::MAX),
                    env.limit.unwrap_or(DEFAULT_GET_LIMIT),
                )?;
                Ok(Some(Envelope {
                    posts: Some(to_tuples(&posts)),
                    ..Default::default()
                }))
            }

            Method::Post => {
                let msg = env
                    .msg
                    .as_deref()
                    .ok_or(DecodeError::MissingField("msg"))?;
                let post = store.post_local(msg)?;
                Ok(Some(Envelope {
                    posts: Some(to_tuples(&[post])),
                    ..Default::default()
                }))
            }
        }
    }
}

fn query_of(env: &Envelope) -> Result<&Query, DecodeError> {
    env.query.as_ref().ok_or(DecodeError::MissingField("query"))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::PostTuple;
    use crate::types::Post;

    fn node(uid: &str) -> (Protocol, Store) {
        (
            Protocol::new(uid, 2, 4),
            Store::open_temporary(uid).unwrap(),
        )
    }

    fn tuple(uid: &str, postid: u64, txtime: i64, msg: &str) -> PostTuple {
        PostTuple(
            uid.into(),
            postid,
            txtime,
            0,
            msg.into(),
            Post::compute_hashid(uid, msg, txtime, postid),
        )
    }

    /// A peer's pull request as it would arrive off the wire.
    fn pull_request(from: &str, hid: &str, marks: Vec<(String, i64)>) -> Envelope {
        Envelope {
            headers: Some(Headers {
                hto: HTO_ALL.into(),
                hfrom: from.into(),
                hid: hid.into(),
                htype: HeaderKind::Req,
                httl: 2,
            }),
            query: Some(Query {
                m: Method::Pull,
                uid: from.into(),
                friends: Friends::Marks(marks),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pull_reply_carries_post_and_reply_headers() {
        let (proto, mut store) = node("usera");
        store.post_local("hello").unwrap();

        let req = pull_request("userb", "r1", vec![]);
        let resp = proto.process(&mut store, &req).unwrap().unwrap();

        let posts = resp.posts.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "usera");
        assert_eq!(posts[0].1, 1);
        assert_eq!(posts[0].4, "hello");

        let h = resp.headers.unwrap();
        assert_eq!(h.hto, "userb");
        assert_eq!(h.hfrom, "usera");
        assert_eq!(h.hid, "r1");
        assert_eq!(h.htype, HeaderKind::Rep);
        assert_eq!(h.httl, 4);
    }

    #[test]
    fn empty_marks_bootstrap_serves_all_local_posts() {
        let (proto, mut store) = node("usera");
        store.post_local("p1").unwrap();
        store.post_local("p2").unwrap();

        let req = pull_request("userb", "r1", vec![]);
        let resp = proto.process(&mut store, &req).unwrap().unwrap();
        assert_eq!(resp.posts.unwrap().len(), 2);
    }

    #[test]
    fn gen_pull_advertises_marks_with_request_headers() {
        let (proto, mut store) = node("usera");
        let p = store.post_local("hello").unwrap();

        let resp = proto
            .process(&mut store, &Envelope::trigger(Method::GenPull))
            .unwrap()
            .unwrap();

        let h = resp.headers.unwrap();
        assert_eq!(h.hto, HTO_ALL);
        assert_eq!(h.hfrom, "usera");
        assert_eq!(h.htype, HeaderKind::Req);
        assert_eq!(h.httl, 2);

        let q = resp.query.unwrap();
        assert_eq!(q.m, Method::Pull);
        assert_eq!(q.uid, "usera");
        assert_eq!(
            q.friends,
            Friends::Marks(vec![("usera".into(), p.txtime)])
        );
    }

    #[test]
    fn gen_gap_silent_when_nothing_missing() {
        let (proto, mut store) = node("usera");
        store.post_local("hello").unwrap();
        assert!(proto
            .process(&mut store, &Envelope::trigger(Method::GenGap))
            .unwrap()
            .is_none());
    }

    #[test]
    fn gen_gap_requests_missing_windows() {
        let (proto, mut store) = node("usera");
        let mut env = Envelope::default();
        env.posts = Some(vec![tuple("bob", 3, 300, "b3")]);
        proto.process(&mut store, &env).unwrap();

        let resp = proto
            .process(&mut store, &Envelope::trigger(Method::GenGap))
            .unwrap()
            .unwrap();
        let h = resp.headers.unwrap();
        assert_eq!(h.htype, HeaderKind::Req);
        assert_eq!(h.httl, 2);

        let q = resp.query.unwrap();
        assert_eq!(q.m, Method::Gap);
        match q.friends {
            Friends::Windows(w) => assert_eq!(w.get("bob").unwrap(), &vec![(0, 300)]),
            other => panic!("expected windows, got {other:?}"),
        }
    }

    #[test]
    fn gap_reply_serves_window() {
        let (proto, mut store) = node("usera");
        let mut env = Envelope::default();
        env.posts = Some(vec![
            tuple("bob", 1, 100, "b1"),
            tuple("bob", 2, 200, "b2"),
            tuple("bob", 3, 300, "b3"),
        ]);
        proto.process(&mut store, &env).unwrap();

        let mut windows = crate::store::GapWindows::new();
        windows.insert("bob".into(), vec![(100, 300)]);
        let req = Envelope {
            headers: Some(Headers {
                hto: HTO_ALL.into(),
                hfrom: "userb".into(),
                hid: "g1".into(),
                htype: HeaderKind::Req,
                httl: 2,
            }),
            query: Some(Query {
                m: Method::Gap,
                uid: "userb".into(),
                friends: Friends::Windows(windows),
            }),
            ..Default::default()
        };

        let resp = proto.process(&mut store, &req).unwrap().unwrap();
        let posts = resp.posts.unwrap();
        // half-open (100, 300]: the missing post plus the window's edge
        let ids: Vec<u64> = posts.iter().map(|p| p.1).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(resp.headers.unwrap().htype, HeaderKind::Rep);
    }

    #[test]
    fn duplicate_posts_swallowed() {
        let (proto, mut store) = node("usera");
        let mut env = Envelope::default();
        env.posts = Some(vec![tuple("bob", 1, 100, "hi")]);

        proto.process(&mut store, &env).unwrap();
        // the identical envelope again: no error, no growth
        proto.process(&mut store, &env).unwrap();
        assert_eq!(store.post_count(), 1);
    }

    #[test]
    fn bad_hash_surfaces_store_error() {
        let (proto, mut store) = node("usera");
        let mut env = Envelope::default();
        let mut t = tuple("bob", 1, 100, "hi");
        t.5 = "0000000000000000000000000000000000000000".into();
        env.posts = Some(vec![t]);

        assert!(matches!(
            proto.process(&mut store, &env),
            Err(ProtocolError::Store(StoreError::HashMismatch))
        ));
    }

    #[test]
    fn gen_push_wraps_latest_local_post() {
        let (proto, mut store) = node("usera");
        assert!(proto
            .process(&mut store, &Envelope::trigger(Method::GenPush))
            .unwrap()
            .is_none());

        store.post_local("first").unwrap();
        store.post_local("second").unwrap();

        let resp = proto
            .process(&mut store, &Envelope::trigger(Method::GenPush))
            .unwrap()
            .unwrap();
        assert_eq!(resp.m, Some(Method::Push));
        let posts = resp.posts.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].4, "second");
        assert_eq!(resp.headers.unwrap().htype, HeaderKind::Req);
    }

    #[test]
    fn push_ingests_and_answers_nothing() {
        let (proto, mut store) = node("usera");
        let mut env = Envelope::trigger(Method::Push);
        env.posts = Some(vec![tuple("bob", 1, 100, "hi")]);
        assert!(proto.process(&mut store, &env).unwrap().is_none());
        assert_eq!(store.post_count(), 1);
    }

    #[test]
    fn get_is_headerless_and_limited() {
        let (proto, mut store) = node("usera");
        for i in 0..15 {
            store.post_local(&format!("post {i}")).unwrap();
        }

        let resp = proto
            .process(&mut store, &Envelope::trigger(Method::Get))
            .unwrap()
            .unwrap();
        assert!(resp.headers.is_none());
        assert_eq!(resp.posts.unwrap().len(), DEFAULT_GET_LIMIT);

        let mut env = Envelope::trigger(Method::Get);
        env.limit = Some(3);
        let resp = proto.process(&mut store, &env).unwrap().unwrap();
        assert_eq!(resp.posts.unwrap().len(), 3);
    }

    #[test]
    fn local_post_via_envelope() {
        let (proto, mut store) = node("usera");
        let mut env = Envelope::trigger(Method::Post);
        env.msg = Some("from the ui".into());

        let resp = proto.process(&mut store, &env).unwrap().unwrap();
        assert!(resp.headers.is_none());
        let posts = resp.posts.unwrap();
        assert_eq!(posts[0].0, "usera");
        assert_eq!(posts[0].1, 1);

        // missing msg is a decode error
        let env = Envelope::trigger(Method::Post);
        assert!(matches!(
            proto.process(&mut store, &env),
            Err(ProtocolError::Decode(DecodeError::MissingField("msg")))
        ));
    }
}
