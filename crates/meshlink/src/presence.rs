//! Presence tracking over swarm connections
//!
//! Each peer periodically sends a heartbeat to its direct neighbors. A
//! heartbeat carries a per-sender sequence number and the sender's own
//! neighbor list; the receiver records when it last heard from the sender
//! and feeds the neighbor list back to the swarm as discovered peers.
//! Heartbeats are only accepted from the neighbor they name.
//!
//! A peer is online while heartbeats keep arriving. It is evicted after
//! `heartbeat_interval * missed_beats_threshold` without one, or at once
//! when its connection closes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::keys::PeerId;
use crate::plugin::{ExtensionContext, ProtocolPlugin, SwarmContext};
use crate::protocol::{decode_body, encode_body, CHANNEL_PRESENCE};

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    /// Heartbeats a peer may miss before it is considered offline
    pub missed_beats_threshold: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            missed_beats_threshold: 3,
        }
    }
}

impl PresenceConfig {
    pub fn peer_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_beats_threshold.max(1)
    }
}

/// Heartbeat body on the presence channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub peer_id: PeerId,
    pub seq: u64,
    /// First heartbeat on a new connection; resets the receiver's sequence
    #[serde(default)]
    pub hello: bool,
    #[serde(default)]
    pub neighbors: Vec<PeerId>,
}

#[derive(Debug, Clone, Copy)]
struct PeerRecord {
    last_seen: Instant,
    seq: u64,
}

#[derive(Default)]
struct PresenceState {
    records: HashMap<PeerId, PeerRecord>,
    neighbors: HashMap<PeerId, ExtensionContext>,
}

struct PresenceInner {
    local: PeerId,
    config: PresenceConfig,
    state: Mutex<PresenceState>,
    peers: watch::Sender<BTreeSet<PeerId>>,
    seq: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Presence plugin; clones share state
#[derive(Clone)]
pub struct PresencePlugin {
    inner: Arc<PresenceInner>,
}

impl PresencePlugin {
    pub fn new(local: PeerId, config: PresenceConfig) -> Self {
        let (peers, _) = watch::channel(BTreeSet::new());
        Self {
            inner: Arc::new(PresenceInner {
                local,
                config,
                state: Mutex::new(PresenceState::default()),
                peers,
                seq: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    /// Peers currently considered online, excluding ourselves
    pub fn peers(&self) -> BTreeSet<PeerId> {
        self.inner.peers.borrow().clone()
    }

    pub fn has(&self, peer_id: &PeerId) -> bool {
        self.inner.peers.borrow().contains(peer_id)
    }

    /// Watch the online set; a new value is published on every change
    pub fn watch(&self) -> watch::Receiver<BTreeSet<PeerId>> {
        self.inner.peers.subscribe()
    }

    /// Wait until `predicate` holds for the online set
    pub async fn wait_for(&self, predicate: impl Fn(&BTreeSet<PeerId>) -> bool) -> BTreeSet<PeerId> {
        let mut rx = self.watch();
        let peers = match rx.wait_for(|peers| predicate(peers)).await {
            Ok(peers) => peers.clone(),
            Err(_) => self.peers(),
        };
        peers
    }
}

impl PresenceInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &PresenceState) {
        let online: BTreeSet<PeerId> = state.records.keys().copied().collect();
        self.peers.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    fn heartbeat(&self, hello: bool) -> Heartbeat {
        let state = self.lock();
        Heartbeat {
            peer_id: self.local,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            hello,
            neighbors: state.neighbors.keys().copied().collect(),
        }
    }

    fn record(&self, heartbeat: &Heartbeat) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let accepted = match state.records.get_mut(&heartbeat.peer_id) {
            Some(record) if heartbeat.hello || heartbeat.seq > record.seq => {
                record.seq = heartbeat.seq;
                record.last_seen = record.last_seen.max(now);
                true
            }
            Some(_) => false,
            None => {
                state.records.insert(
                    heartbeat.peer_id,
                    PeerRecord {
                        last_seen: now,
                        seq: heartbeat.seq,
                    },
                );
                true
            }
        };
        self.publish(&state);
        accepted
    }

    fn forget(&self, peer_id: &PeerId) {
        let mut state = self.lock();
        state.neighbors.remove(peer_id);
        state.records.remove(peer_id);
        self.publish(&state);
    }

    fn sweep(&self) {
        let timeout = self.config.peer_timeout();
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.records.len();
        state
            .records
            .retain(|_, record| now.saturating_duration_since(record.last_seen) <= timeout);
        if state.records.len() != before {
            debug!("{} evicted {} silent peers", self.local.short(), before - state.records.len());
        }
        self.publish(&state);
    }

    async fn beat(&self) {
        let heartbeat = self.heartbeat(false);
        let Ok(body) = encode_body(&heartbeat) else {
            return;
        };
        let neighbors: Vec<ExtensionContext> = self.lock().neighbors.values().cloned().collect();
        for ctx in neighbors {
            if let Err(e) = ctx.send(body.clone()).await {
                trace!("heartbeat to {} failed: {}", ctx.remote().short(), e);
            }
        }
    }
}

async fn run_heartbeats(inner: Weak<PresenceInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.sweep();
        inner.beat().await;
    }
}

impl ProtocolPlugin for PresencePlugin {
    fn channel(&self) -> u8 {
        CHANNEL_PRESENCE
    }

    fn start(&self, swarm: &SwarmContext) {
        debug!("presence started for {} on {}", swarm.local.short(), swarm.topic.short());
        let task = tokio::spawn(run_heartbeats(
            Arc::downgrade(&self.inner),
            self.inner.config.heartbeat_interval,
        ));
        let mut slot = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(task) = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        let mut state = self.inner.lock();
        state.neighbors.clear();
        state.records.clear();
        self.inner.publish(&state);
    }

    fn on_connect(&self, ctx: ExtensionContext) {
        self.inner.lock().neighbors.insert(*ctx.remote(), ctx.clone());
        let hello = self.inner.heartbeat(true);
        tokio::spawn(async move {
            if let Ok(body) = encode_body(&hello) {
                let _ = ctx.send(body).await;
            }
        });
    }

    fn on_message(&self, ctx: &ExtensionContext, body: &[u8]) {
        let heartbeat: Heartbeat = match decode_body(body) {
            Ok(h) => h,
            Err(e) => {
                debug!("bad heartbeat from {}: {}", ctx.remote().short(), e);
                return;
            }
        };
        if heartbeat.peer_id == self.inner.local {
            return;
        }
        // Neighbors only speak for themselves
        if heartbeat.peer_id != *ctx.remote() {
            debug!(
                "dropping heartbeat for {} sent by {}",
                heartbeat.peer_id.short(),
                ctx.remote().short()
            );
            return;
        }
        if !self.inner.record(&heartbeat) {
            trace!("stale heartbeat {} from {}", heartbeat.seq, heartbeat.peer_id.short());
            return;
        }
        let discovered: Vec<PeerId> = heartbeat
            .neighbors
            .into_iter()
            .filter(|p| *p != self.inner.local)
            .collect();
        ctx.discover(discovered);
    }

    fn on_disconnect(&self, ctx: &ExtensionContext) {
        self.inner.forget(ctx.remote());
    }
}
