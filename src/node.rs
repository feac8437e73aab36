//! Node assembly: configuration, the bounded queue topology, the worker
//! loop that owns all mutable state, the paced response emitter, and the
//! periodic anti-entropy scheduler.
//!
//! Ownership is arranged so no mutable state is shared: the transport
//! tasks hold the socket behind an `Arc`, while the store and the
//! routing tables live on the worker task and are reached only through
//! the ingress queue.

use crate::engine::Protocol;
use crate::net::http::{self, HttpState};
use crate::net::message::{Envelope, Method};
use crate::net::multicast;
use crate::net::router::Router;
use crate::net::sender::Sender;
use crate::store::{Store, StoreError};
use crate::types::{
    DEFAULT_HTTP_PORT, DEFAULT_INTERVAL_SECS, MCAST_GROUP, MCAST_PORT, REPLY_TTL, REQUEST_TTL,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One inbound message: raw payload plus the way back to its origin.
/// A `None` payload is the worker's stop sentinel.
pub type IngressMsg = (Option<String>, Option<Sender>);

/// One outbound response and its resolved sender. `(None, None)` stops
/// the emitter.
pub type ResponseMsg = (Option<Envelope>, Option<Sender>);

const INGRESS_QUEUE_DEPTH: usize = 1024;
const RESPONSE_QUEUE_DEPTH: usize = 1024;

/// Delay between consecutive datagrams of one multi-post response,
/// to avoid burst loss on multicast.
const INTER_PACKET_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Local identity; authors every local post.
    pub uid: String,
    /// IPv4 addresses of the interfaces to join/emit on. Empty means
    /// the OS default interface.
    pub interfaces: Vec<Ipv4Addr>,
    pub http_port: u16,
    pub data_dir: PathBuf,
    pub web_root: PathBuf,
    pub mcast_group: Ipv4Addr,
    pub mcast_port: u16,
    /// Seconds between anti-entropy rounds.
    pub interval_secs: u64,
    pub request_ttl: i32,
    pub reply_ttl: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uid: "litter".to_string(),
            interfaces: Vec::new(),
            http_port: DEFAULT_HTTP_PORT,
            data_dir: PathBuf::from("./data"),
            web_root: PathBuf::from("./web"),
            mcast_group: MCAST_GROUP,
            mcast_port: MCAST_PORT,
            interval_secs: DEFAULT_INTERVAL_SECS,
            request_ttl: REQUEST_TTL,
            reply_ttl: REPLY_TTL,
        }
    }
}

impl Config {
    pub fn mcast_dest(&self) -> SocketAddr {
        SocketAddr::from((self.mcast_group, self.mcast_port))
    }
}

/// A running node: five long-lived tasks wired by bounded queues.
pub struct Node {
    shutdown_tx: watch::Sender<bool>,
    ingress_tx: mpsc::Sender<IngressMsg>,
    responses_tx: mpsc::Sender<ResponseMsg>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub async fn start(config: Config) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Store::open(config.data_dir.join(&config.uid), &config.uid)?;
        info!(
            uid = %config.uid,
            posts = store.post_count(),
            next_postid = store.next_postid(),
            "store opened"
        );

        let socket = Arc::new(multicast::open_socket(
            config.mcast_group,
            config.mcast_port,
            &config.interfaces,
        )?);
        let mcast = config.mcast_dest();
        let router = Router::new(
            &config.uid,
            socket.clone(),
            config.interfaces.clone(),
            mcast,
        );
        let protocol = Protocol::new(&config.uid, config.request_ttl, config.reply_ttl);

        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_QUEUE_DEPTH);
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(multicast::listen(
            socket,
            config.interfaces.clone(),
            mcast,
            ingress_tx.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(worker(
            store,
            router,
            protocol,
            ingress_rx,
            ingress_tx.clone(),
            responses_tx.clone(),
        )));
        tasks.push(tokio::spawn(emit_responses(responses_rx)));
        tasks.push(tokio::spawn(scheduler(
            ingress_tx.clone(),
            config.interval_secs,
            shutdown_rx.clone(),
        )));

        let http_state = HttpState {
            ingress: ingress_tx.clone(),
            web_root: config.web_root.clone(),
        };
        let http_port = config.http_port;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::serve(http_port, http_state, shutdown_rx).await {
                error!("http server failed: {e}");
            }
        }));

        Ok(Self {
            shutdown_tx,
            ingress_tx,
            responses_tx,
            tasks,
        })
    }

    /// Stop every task and wait for them to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.ingress_tx.send((None, None)).await;
        let _ = self.responses_tx.send((None, None)).await;
        for task in self.tasks {
            let _ = task.await;
        }
        info!("node stopped");
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Single consumer of the ingress queue. Owns the store and the routing
/// tables, so every mutation observes one total order.
async fn worker(
    mut store: Store,
    mut router: Router,
    protocol: Protocol,
    mut ingress: mpsc::Receiver<IngressMsg>,
    ingress_tx: mpsc::Sender<IngressMsg>,
    responses: mpsc::Sender<ResponseMsg>,
) {
    while let Some((payload, source)) = ingress.recv().await {
        let Some(payload) = payload else { break };
        if payload.len() < 2 {
            continue;
        }

        let env = match Envelope::decode(&payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(
                    source = ?source.as_ref().and_then(|s| s.dest_addr()),
                    "undecodable envelope: {e}"
                );
                if let Some(s) = &source {
                    s.send_error(&e.to_string()).await;
                }
                continue;
            }
        };

        // get and post never come off the network
        if matches!(env.method(), Some(Method::Get | Method::Post))
            && matches!(&source, Some(s) if !s.is_http())
        {
            debug!("ignoring local-only method from the network");
            continue;
        }

        let decision = router.should_process(&env, source.as_ref());
        if let Some((fwd, hop)) = decision.forward
            && responses.send((Some(fwd), Some(hop))).await.is_err()
        {
            break;
        }
        if !decision.process {
            continue;
        }

        let was_local_post = env.method() == Some(Method::Post);
        match protocol.process(&mut store, &env) {
            Ok(resp) => {
                match &source {
                    // HTTP callers always get an answer, even an empty one
                    Some(s) if s.is_http() => {
                        let resp = resp.unwrap_or_default();
                        let _ = responses.send((Some(resp), source.clone())).await;
                    }
                    // everything else is addressed by its headers
                    _ => {
                        if let Some(resp) = resp {
                            match router.send(&resp, None) {
                                Ok(Some((out, hop))) => {
                                    let _ = responses.send((Some(out), Some(hop))).await;
                                }
                                Ok(None) => {}
                                Err(e) => warn!("response not routable: {e}"),
                            }
                        }
                    }
                }
                if was_local_post {
                    // multicast the fresh post ahead of the next round
                    if let Ok(data) = Envelope::trigger(Method::GenPush).encode()
                        && ingress_tx.try_send((Some(data), None)).is_err()
                    {
                        warn!("ingress full, push deferred to next round");
                    }
                }
            }
            Err(e) => {
                warn!("process failed: {e}");
                if let Some(s) = &source {
                    s.send_error(&e.to_string()).await;
                }
            }
        }
    }

    if let Err(e) = store.flush() {
        warn!("flush on shutdown failed: {e}");
    }
    info!("worker stopped");
}

// =============================================================================
// RESPONSE EMITTER
// =============================================================================

/// Writes responses out. HTTP replies go in one piece; multi-post UDP
/// responses are split into single-post datagrams with a small gap
/// between them. Transport errors are logged only: the periodic rounds
/// recover anything a lost packet would have delivered.
async fn emit_responses(mut responses: mpsc::Receiver<ResponseMsg>) {
    while let Some(msg) = responses.recv().await {
        let (Some(env), Some(sender)) = msg else { break };

        if sender.is_http() {
            match env.encode() {
                Ok(data) => {
                    if let Err(e) = sender.send(&data).await {
                        warn!("http reply failed: {e}");
                    }
                }
                Err(e) => warn!("encode failed: {e}"),
            }
            continue;
        }

        if env.is_vacant() {
            continue;
        }

        let posts = env.posts.clone().unwrap_or_default();
        if posts.len() > 1 {
            for (i, tuple) in posts.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(INTER_PACKET_DELAY).await;
                }
                let mut one = env.clone();
                one.posts = Some(vec![tuple.clone()]);
                send_udp(&sender, &one).await;
            }
        } else {
            send_udp(&sender, &env).await;
        }
    }
    info!("response emitter stopped");
}

async fn send_udp(sender: &Sender, env: &Envelope) {
    match env.encode() {
        Ok(data) => {
            if let Err(e) = sender.send(&data).await {
                warn!("udp send failed: {e}");
            }
        }
        Err(e) => warn!("encode failed: {e}"),
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Feeds `gen_pull` and `gen_gap` triggers into the ingress queue every
/// period, through the exact same path inbound requests take.
async fn scheduler(
    ingress: mpsc::Sender<IngressMsg>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                for m in [Method::GenPull, Method::GenGap] {
                    let Ok(data) = Envelope::trigger(m).encode() else { continue };
                    if ingress.send((Some(data), None)).await.is_err() {
                        return;
                    }
                }
                debug!("anti-entropy round triggered");
            }
        }
    }
    info!("scheduler stopped");
}

// =============================================================================
// TESTS
// =============================================================================
