//! Durable per-author post log with gap detection and friend high-water marks.
//!
//! One sled database per local identity, four trees:
//!
//! | tree         | key                                      | value          |
//! |--------------|------------------------------------------|----------------|
//! | `posts`      | hashid                                   | bincode `Post` |
//! | `author_idx` | uid ∥ 0x00 ∥ txtime(BE) ∥ postid(BE)     | hashid         |
//! | `time_idx`   | txtime(BE) ∥ hashid                      | hashid         |
//! | `friends`    | observer ∥ 0x00 ∥ fid                    | txtime(BE)     |
//!
//! The big-endian key layout keeps sled's lexicographic order equal to
//! time order, so range queries are prefix scans.

use crate::types::{now, Post, MAX_MSG_CHARS};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Default number of posts returned by a `get` query.
pub const DEFAULT_GET_LIMIT: usize = 10;

/// Cap on posts served by a single `pull` or `gap` response.
pub const MAX_RESPONSE_POSTS: usize = 100;

/// Per-friend advertisement: `(fid, latest observed txtime)`.
pub type FriendMarks = Vec<(String, i64)>;

/// Missing time windows per friend: `fid -> [(start, end), ..]`.
pub type GapWindows = BTreeMap<String, Vec<(i64, i64)>>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The post is already stored. Callers on the gossip path swallow this.
    #[error("duplicate post {0}")]
    Duplicate(String),
    #[error("message exceeds {MAX_MSG_CHARS} code points")]
    Oversize,
    #[error("invalid postid {0}")]
    BadPostId(u64),
    #[error("hashid does not match post contents")]
    HashMismatch,
    #[error("storage error: {0}")]
    Integrity(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Integrity(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StoreError::Integrity(e.to_string())
    }
}

// =============================================================================
// KEY ENCODING
// =============================================================================

fn author_prefix(uid: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(uid.len() + 1);
    k.extend_from_slice(uid.as_bytes());
    k.push(0);
    k
}

fn author_key(uid: &str, txtime: i64, postid: u64) -> Vec<u8> {
    let mut k = author_prefix(uid);
    k.extend_from_slice(&(txtime as u64).to_be_bytes());
    k.extend_from_slice(&postid.to_be_bytes());
    k
}

/// `(txtime, postid)` from an `author_idx` key, or `None` on a short key.
fn parse_author_key(key: &[u8], prefix_len: usize) -> Option<(i64, u64)> {
    let rest = key.get(prefix_len..)?;
    if rest.len() != 16 {
        return None;
    }
    let txtime = u64::from_be_bytes(rest[..8].try_into().ok()?) as i64;
    let postid = u64::from_be_bytes(rest[8..].try_into().ok()?);
    Some((txtime, postid))
}

fn time_key(txtime: i64, hashid: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(8 + hashid.len());
    k.extend_from_slice(&(txtime as u64).to_be_bytes());
    k.extend_from_slice(hashid.as_bytes());
    k
}

fn friend_key(observer: &str, fid: &str) -> Vec<u8> {
    let mut k = author_prefix(observer);
    k.extend_from_slice(fid.as_bytes());
    k
}

// =============================================================================
// STORE
// =============================================================================

/// Append-only post store for one local identity.
///
/// Not shared across tasks: the worker owns it and all calls happen there,
/// so mutations observe a total order per process.
pub struct Store {
    uid: String,
    db: sled::Db,
    posts: sled::Tree,
    author_idx: sled::Tree,
    time_idx: sled::Tree,
    friends: sled::Tree,
    next_postid: u64,
}

impl Store {
    /// Open (or create) the database at `path` for local identity `uid`.
    pub fn open(path: impl AsRef<Path>, uid: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db, uid)
    }

    /// In-memory store for tests.
    pub fn open_temporary(uid: &str) -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, uid)
    }

    fn from_db(db: sled::Db, uid: &str) -> Result<Self, StoreError> {
        let posts = db.open_tree("posts")?;
        let author_idx = db.open_tree("author_idx")?;
        let time_idx = db.open_tree("time_idx")?;
        let friends = db.open_tree("friends")?;

        // Recover the local sequence counter from the author index.
        let prefix = author_prefix(uid);
        let mut next_postid = 1;
        for item in author_idx.scan_prefix(&prefix) {
            let (key, _) = item?;
            if let Some((_, postid)) = parse_author_key(&key, prefix.len()) {
                next_postid = next_postid.max(postid + 1);
            }
        }

        Ok(Self {
            uid: uid.to_string(),
            db,
            posts,
            author_idx,
            time_idx,
            friends,
            next_postid,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The postid the next locally-authored post will receive.
    pub fn next_postid(&self) -> u64 {
        self.next_postid
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // =========================================================================
    // INSERTION
    // =========================================================================

    /// Create a locally-authored post from `msg` alone.
    ///
    /// Stamps the next local postid, the current wall clock, and the
    /// computed hashid. The sequence counter only advances on success.
    pub fn post_local(&mut self, msg: &str) -> Result<Post, StoreError> {
        if msg.chars().count() > MAX_MSG_CHARS {
            return Err(StoreError::Oversize);
        }
        let txtime = now();
        let postid = self.next_postid;
        let post = Post {
            uid: self.uid.clone(),
            postid,
            msg: msg.to_string(),
            txtime,
            rxtime: txtime,
            hashid: Post::compute_hashid(&self.uid, msg, txtime, postid),
        };
        self.insert(&post)?;
        self.next_postid += 1;
        Ok(post)
    }

    /// Ingest a fully-specified post received from a peer.
    ///
    /// The supplied hashid must match the recomputed one; `rxtime` is
    /// stamped locally at first insertion.
    pub fn post_remote(
        &mut self,
        uid: &str,
        postid: u64,
        txtime: i64,
        msg: &str,
        hashid: &str,
    ) -> Result<Post, StoreError> {
        if msg.chars().count() > MAX_MSG_CHARS {
            return Err(StoreError::Oversize);
        }
        if postid == 0 {
            return Err(StoreError::BadPostId(postid));
        }
        if Post::compute_hashid(uid, msg, txtime, postid) != hashid {
            return Err(StoreError::HashMismatch);
        }
        let post = Post {
            uid: uid.to_string(),
            postid,
            msg: msg.to_string(),
            txtime,
            rxtime: now(),
            hashid: hashid.to_string(),
        };
        self.insert(&post)?;
        if uid == self.uid {
            self.next_postid = self.next_postid.max(postid + 1);
        }
        Ok(post)
    }

    fn insert(&self, post: &Post) -> Result<(), StoreError> {
        let key = post.hashid.as_bytes();
        if self.posts.contains_key(key)? {
            return Err(StoreError::Duplicate(post.hashid.clone()));
        }
        self.posts.insert(key, bincode::serialize(post)?)?;
        self.author_idx
            .insert(author_key(&post.uid, post.txtime, post.postid), key)?;
        self.time_idx
            .insert(time_key(post.txtime, &post.hashid), key)?;
        self.observe(&self.uid, &post.uid, post.txtime)?;
        debug!(uid = %post.uid, postid = post.postid, "stored post");
        Ok(())
    }

    /// Raise `FriendTime[observer, fid]` to `txtime` if larger.
    fn observe(&self, observer: &str, fid: &str, txtime: i64) -> Result<(), StoreError> {
        let key = friend_key(observer, fid);
        let current = match self.friends.get(&key)? {
            Some(v) if v.len() == 8 => {
                u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])) as i64
            }
            _ => i64::MIN,
        };
        if txtime > current {
            self.friends
                .insert(key, &(txtime as u64).to_be_bytes()[..])?;
        }
        Ok(())
    }

    /// `FriendTime[observer, fid]`, if any.
    pub fn friend_time(&self, observer: &str, fid: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .friends
            .get(friend_key(observer, fid))?
            .filter(|v| v.len() == 8)
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0; 8])) as i64))
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Posts ordered by `txtime` descending, optionally by author, with
    /// `txtime` in the open interval `(begin, until)`, capped at `limit`.
    pub fn get(
        &self,
        uid: Option<&str>,
        begin: i64,
        until: i64,
        limit: usize,
    ) -> Result<Vec<Post>, StoreError> {
        let mut out = Vec::new();
        match uid {
            Some(u) => {
                let prefix = author_prefix(u);
                for item in self.author_idx.scan_prefix(&prefix).rev() {
                    let (key, hash) = item?;
                    let Some((txtime, _)) = parse_author_key(&key, prefix.len()) else {
                        continue;
                    };
                    if txtime <= begin {
                        break;
                    }
                    if txtime >= until {
                        continue;
                    }
                    out.push(self.load(&hash)?);
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            None => {
                for item in self.time_idx.iter().rev() {
                    let (key, hash) = item?;
                    if key.len() < 8 {
                        continue;
                    }
                    let txtime =
                        u64::from_be_bytes(key[..8].try_into().unwrap_or([0; 8])) as i64;
                    if txtime <= begin {
                        break;
                    }
                    if txtime >= until {
                        continue;
                    }
                    out.push(self.load(&hash)?);
                    if out.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    fn load(&self, hashid: &[u8]) -> Result<Post, StoreError> {
        let raw = self
            .posts
            .get(hashid)?
            .ok_or_else(|| StoreError::Integrity("dangling index entry".into()))?;
        Ok(bincode::deserialize(&raw)?)
    }

    // =========================================================================
    // ANTI-ENTROPY
    // =========================================================================

    /// Serve a peer's pull request.
    ///
    /// An empty `marks` list is a new peer bootstrapping: it gets our own
    /// posts. Otherwise each advertised `(fid, txtime)` raises the peer's
    /// high-water mark and is answered with everything newer by that author.
    pub fn pull(&self, peer_uid: &str, marks: &FriendMarks) -> Result<Vec<Post>, StoreError> {
        if marks.is_empty() {
            return self.get(Some(&self.uid), 0, i64::MAX, MAX_RESPONSE_POSTS);
        }
        let mut out = Vec::new();
        for (fid, mark) in marks {
            self.observe(peer_uid, fid, *mark)?;
            let room = MAX_RESPONSE_POSTS.saturating_sub(out.len());
            if room == 0 {
                break;
            }
            out.extend(self.get(Some(fid), *mark, i64::MAX, room)?);
        }
        Ok(out)
    }

    /// Serve a peer's gap request: posts inside each requested window.
    ///
    /// Windows are half-open `(start, end]`: the post that defined the
    /// window's upper edge may share its txtime with the missing ones,
    /// so the edge itself must be served (the requester drops it as a
    /// duplicate).
    pub fn gap(&self, peer_uid: &str, windows: &GapWindows) -> Result<Vec<Post>, StoreError> {
        let mut out = Vec::new();
        for (fid, wins) in windows {
            for (start, end) in wins {
                let room = MAX_RESPONSE_POSTS.saturating_sub(out.len());
                if room > 0 {
                    out.extend(self.get(Some(fid), *start, end.saturating_add(1), room)?);
                }
                self.observe(peer_uid, fid, *end)?;
            }
        }
        Ok(out)
    }

    /// Our own per-friend high-water marks, for a `pull` advertisement.
    pub fn gen_pull(&self) -> Result<FriendMarks, StoreError> {
        let prefix = author_prefix(&self.uid);
        let mut marks = Vec::new();
        for item in self.friends.scan_prefix(&prefix) {
            let (key, val) = item?;
            let Ok(fid) = std::str::from_utf8(&key[prefix.len()..]) else {
                continue;
            };
            if val.len() != 8 {
                continue;
            }
            let txtime = u64::from_be_bytes(val.as_ref().try_into().unwrap_or([0; 8])) as i64;
            marks.push((fid.to_string(), txtime));
        }
        Ok(marks)
    }

    /// Missing time windows for every friend we track. Empty when every
    /// tracked author's postid sequence is a dense prefix from 1.
    pub fn gen_gap(&self) -> Result<GapWindows, StoreError> {
        let mut out = BTreeMap::new();
        for (fid, _) in self.gen_pull()? {
            let gaps = self.gaps_for(&fid)?;
            if !gaps.is_empty() {
                out.insert(fid, gaps);
            }
        }
        Ok(out)
    }

    /// Time windows in which `fid` authored posts we do not hold.
    ///
    /// Walks the author's posts newest-first as `(postid, txtime)` pairs.
    /// A break in the dense postid sequence yields the window between the
    /// surrounding txtimes; a missing prefix yields `(0, oldest txtime)`.
    pub fn gaps_for(&self, fid: &str) -> Result<Vec<(i64, i64)>, StoreError> {
        let prefix = author_prefix(fid);
        let mut gaps = Vec::new();
        let mut last: Option<(u64, i64)> = None;
        for item in self.author_idx.scan_prefix(&prefix).rev() {
            let (key, _) = item?;
            let Some((txtime, postid)) = parse_author_key(&key, prefix.len()) else {
                continue;
            };
            if let Some((last_id, last_tx)) = last
                && last_id > postid + 1
            {
                gaps.push((txtime, last_tx));
            }
            last = Some((postid, txtime));
        }
        if let Some((oldest_id, oldest_tx)) = last
            && oldest_id != 1
        {
            gaps.push((0, oldest_tx));
        }
        Ok(gaps)
    }
}

// =============================================================================
// TESTS
// =============================================================================
