use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::close_code;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use scopecast_proto::{Envelope, PeerId, ProtoError, Route, RoutingHeader};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{IdScheme, RelayConfig, SlowPeerPolicy};

/// One frame waiting for a peer's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A relayed envelope, forwarded exactly as it was received.
    Frame(Arc<str>),
    Ping,
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
    Disconnected,
    Closed,
}

/// Bounded per-peer queue. Producers never wait: a full queue either sheds
/// its oldest frame or closes itself, depending on the slow-peer policy.
pub struct OutboundQueue {
    frames: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
    policy: SlowPeerPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: SlowPeerPolicy) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn push(&self, frame: Outbound) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut frames = self.frames.lock();
            if frames.len() < self.capacity {
                frames.push_back(frame);
                PushOutcome::Queued
            } else {
                match self.policy {
                    SlowPeerPolicy::DropOldest => {
                        frames.pop_front();
                        frames.push_back(frame);
                        PushOutcome::DroppedOldest
                    }
                    SlowPeerPolicy::Disconnect => {
                        frames.clear();
                        frames.push_back(Outbound::Close {
                            code: close_code::POLICY,
                            reason: "outbound queue full".into(),
                        });
                        self.closed.store(true, Ordering::SeqCst);
                        PushOutcome::Disconnected
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Queue a final close frame; nothing is accepted afterwards.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.frames.lock().push_back(Outbound::Close {
            code,
            reason: reason.into(),
        });
        self.notify.notify_one();
    }

    /// Stop accepting frames and let the writer finish what is queued.
    pub fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Next frame for the writer, or `None` once closed and drained.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            {
                let mut frames = self.frames.lock();
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
                if self.is_closed() {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct PeerEntry {
    id: PeerId,
    queue: OutboundQueue,
    registered_at: Instant,
    /// Milliseconds since `registered_at` of the last inbound frame.
    last_seen_ms: AtomicU64,
}

impl PeerEntry {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn touch(&self) {
        let elapsed = self.registered_at.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let seen = self.registered_at + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(seen)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    pub dropped_oldest: usize,
    pub disconnected: usize,
    pub unknown_target: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub queue_depth: usize,
    pub idle_ms: u64,
}

#[derive(Debug, Clone)]
struct RegistryConfig {
    outbound_buffer: usize,
    slow_peer_policy: SlowPeerPolicy,
    ping_interval: Duration,
    idle_timeout: Duration,
    id_scheme: IdScheme,
}

impl From<&RelayConfig> for RegistryConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer,
            slow_peer_policy: config.slow_peer_policy,
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
            id_scheme: config.id_scheme,
        }
    }
}

/// The live connection table. Identifiers are never reused within a process.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    peers: DashMap<PeerId, Arc<PeerEntry>>,
    next_id: AtomicU64,
    config: RegistryConfig,
}

impl PeerRegistry {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                peers: DashMap::new(),
                next_id: AtomicU64::new(1),
                config: RegistryConfig::from(config),
            }),
        }
    }

    /// Allocate an identifier and register a new connection under it. The
    /// `id` envelope is queued before the peer becomes visible to routing, so
    /// it is always the first frame the connection receives.
    pub fn register(&self) -> Result<Arc<PeerEntry>, ProtoError> {
        loop {
            let id = self.allocate_id();
            match self.inner.peers.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let greeting = Envelope::Id { id: id.clone() }.to_text()?;
                    let entry = Arc::new(PeerEntry {
                        id,
                        queue: OutboundQueue::new(
                            self.inner.config.outbound_buffer,
                            self.inner.config.slow_peer_policy,
                        ),
                        registered_at: Instant::now(),
                        last_seen_ms: AtomicU64::new(0),
                    });
                    entry.queue.push(Outbound::Frame(Arc::from(greeting)));
                    slot.insert(Arc::clone(&entry));
                    gauge!("scopecast_relay_peers_live", self.len() as f64);
                    return Ok(entry);
                }
            }
        }
    }

    /// Remove a connection. Later envelopes targeting it are dropped.
    pub fn unregister(&self, id: &PeerId) -> bool {
        let removed = self.inner.peers.remove(id);
        if let Some((_, entry)) = &removed {
            entry.queue.shut();
        }
        gauge!("scopecast_relay_peers_live", self.len() as f64);
        removed.is_some()
    }

    /// Fan a raw frame out according to its routing header. Never blocks on a
    /// recipient; a full queue is handled by the slow-peer policy.
    pub fn route(&self, from: &PeerId, header: &RoutingHeader, frame: Arc<str>) -> RouteOutcome {
        let recipients: Vec<Arc<PeerEntry>> = match &header.target {
            Route::Unicast(target) => match self.inner.peers.get(target) {
                Some(entry) => vec![Arc::clone(entry.value())],
                None => {
                    counter!(
                        "scopecast_relay_envelopes_dropped_total",
                        1,
                        "reason" => "unknown_target"
                    );
                    debug!(from = %from, target = %target, kind = %header.kind, "target not connected; dropping");
                    return RouteOutcome {
                        unknown_target: true,
                        ..RouteOutcome::default()
                    };
                }
            },
            Route::Broadcast => self
                .inner
                .peers
                .iter()
                .filter(|entry| entry.key() != from)
                .map(|entry| Arc::clone(entry.value()))
                .collect(),
        };

        let mut outcome = RouteOutcome::default();
        for recipient in recipients {
            match recipient.queue.push(Outbound::Frame(Arc::clone(&frame))) {
                PushOutcome::Queued => outcome.delivered += 1,
                PushOutcome::DroppedOldest => {
                    outcome.delivered += 1;
                    outcome.dropped_oldest += 1;
                    counter!(
                        "scopecast_relay_envelopes_dropped_total",
                        1,
                        "reason" => "queue_full"
                    );
                }
                PushOutcome::Disconnected => {
                    outcome.disconnected += 1;
                    counter!(
                        "scopecast_relay_envelopes_dropped_total",
                        1,
                        "reason" => "queue_full"
                    );
                    info!(peer = %recipient.id, "disconnecting slow peer");
                    self.unregister(&recipient.id);
                }
                PushOutcome::Closed => {}
            }
        }
        if outcome.delivered > 0 {
            counter!(
                "scopecast_relay_envelopes_relayed_total",
                outcome.delivered as u64,
                "type" => header.kind.as_str()
            );
        }
        outcome
    }

    pub fn ping_all(&self) {
        for entry in self.inner.peers.iter() {
            // A full queue already has traffic pending; skip the ping.
            if entry.queue.depth() < self.inner.config.outbound_buffer {
                entry.queue.push(Outbound::Ping);
            }
        }
    }

    /// Close and deregister every connection silent for longer than the idle
    /// timeout. Other peers are not notified.
    pub fn close_idle(&self, now: Instant) -> usize {
        let idle: Vec<Arc<PeerEntry>> = self
            .inner
            .peers
            .iter()
            .filter(|entry| entry.idle_for(now) > self.inner.config.idle_timeout)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for entry in &idle {
            entry.queue.close(close_code::POLICY, "idle timeout");
            self.inner.peers.remove(&entry.id);
            counter!("scopecast_relay_idle_closed_total", 1);
            info!(peer = %entry.id, "closing idle peer");
        }
        if !idle.is_empty() {
            gauge!("scopecast_relay_peers_live", self.len() as f64);
        }
        idle.len()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        let mut peers: Vec<PeerSnapshot> = self
            .inner
            .peers
            .iter()
            .map(|entry| PeerSnapshot {
                id: entry.id.clone(),
                queue_depth: entry.queue.depth(),
                idle_ms: entry.idle_for(now).as_millis() as u64,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.inner.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    /// Ping every peer each interval and reap the idle ones.
    pub fn spawn_keepalive(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.ping_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                registry.ping_all();
                let closed = registry.close_idle(Instant::now());
                if closed > 0 {
                    debug!(closed, "reaped idle peers");
                }
            }
        })
    }

    fn allocate_id(&self) -> PeerId {
        match self.inner.config.id_scheme {
            IdScheme::Sequential => {
                let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                PeerId::new(format!("p{n}"))
            }
            IdScheme::Uuid => PeerId::new(Uuid::new_v4().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopecast_proto::RelayedType;
    use std::collections::HashSet;

    fn registry(buffer: usize, policy: SlowPeerPolicy) -> PeerRegistry {
        PeerRegistry::new(&RelayConfig {
            outbound_buffer: buffer,
            slow_peer_policy: policy,
            ..RelayConfig::default()
        })
    }

    fn header(target: Route) -> RoutingHeader {
        RoutingHeader {
            kind: RelayedType::Offer,
            target,
        }
    }

    fn drain(entry: &PeerEntry) -> Vec<Outbound> {
        let mut frames = entry.queue.frames.lock();
        frames.drain(..).collect()
    }

    #[test_timeout::timeout]
    fn first_frame_is_the_id_envelope() {
        let registry = registry(8, SlowPeerPolicy::DropOldest);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        assert_eq!(a.id().as_str(), "p1");
        assert_eq!(b.id().as_str(), "p2");

        let frames = drain(&a);
        assert_eq!(frames.len(), 1);
        let Outbound::Frame(text) = &frames[0] else {
            panic!("expected a frame, got {:?}", frames[0]);
        };
        assert_eq!(
            Envelope::from_text(text).unwrap(),
            Envelope::Id {
                id: PeerId::from("p1")
            }
        );
    }

    #[test_timeout::timeout]
    fn uuid_scheme_yields_distinct_ids() {
        let registry = PeerRegistry::new(&RelayConfig {
            id_scheme: IdScheme::Uuid,
            ..RelayConfig::default()
        });
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(Uuid::parse_str(a.id().as_str()).is_ok());
    }

    #[test_timeout::timeout]
    fn concurrent_registrations_get_distinct_ids() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;

        for scheme in [IdScheme::Sequential, IdScheme::Uuid] {
            let registry = PeerRegistry::new(&RelayConfig {
                id_scheme: scheme,
                ..RelayConfig::default()
            });
            let ids: Vec<PeerId> = std::thread::scope(|scope| {
                let workers: Vec<_> = (0..THREADS)
                    .map(|_| {
                        let registry = registry.clone();
                        scope.spawn(move || {
                            (0..PER_THREAD)
                                .map(|_| registry.register().unwrap().id().clone())
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                workers
                    .into_iter()
                    .flat_map(|worker| worker.join().unwrap())
                    .collect()
            });

            let distinct: HashSet<&PeerId> = ids.iter().collect();
            assert_eq!(ids.len(), THREADS * PER_THREAD);
            assert_eq!(distinct.len(), ids.len(), "{scheme:?} handed out a duplicate id");
            assert_eq!(registry.len(), ids.len());
        }
    }

    #[test_timeout::timeout]
    fn broadcast_skips_sender_and_unicast_hits_one() {
        let registry = registry(8, SlowPeerPolicy::DropOldest);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        let c = registry.register().unwrap();
        for entry in [&a, &b, &c] {
            drain(entry);
        }

        let outcome = registry.route(a.id(), &header(Route::Broadcast), Arc::from("x"));
        assert_eq!(outcome.delivered, 2);
        assert!(drain(&a).is_empty());
        assert_eq!(drain(&b), vec![Outbound::Frame(Arc::from("x"))]);
        assert_eq!(drain(&c).len(), 1);

        let outcome = registry.route(a.id(), &header(Route::Unicast(c.id().clone())), Arc::from("y"));
        assert_eq!(outcome.delivered, 1);
        assert!(drain(&b).is_empty());
        assert_eq!(drain(&c), vec![Outbound::Frame(Arc::from("y"))]);
    }

    #[test_timeout::timeout]
    fn unregistered_target_is_dropped_not_queued() {
        let registry = registry(8, SlowPeerPolicy::DropOldest);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        assert!(registry.unregister(b.id()));
        assert!(!registry.unregister(b.id()));
        drain(&b);

        let outcome = registry.route(a.id(), &header(Route::Unicast(b.id().clone())), Arc::from("z"));
        assert!(outcome.unknown_target);
        assert!(drain(&b).is_empty());
        assert!(b.queue().is_closed());
    }

    #[test_timeout::timeout]
    fn drop_oldest_keeps_newest_frames() {
        let queue = OutboundQueue::new(2, SlowPeerPolicy::DropOldest);
        assert_eq!(queue.push(Outbound::Frame(Arc::from("1"))), PushOutcome::Queued);
        assert_eq!(queue.push(Outbound::Frame(Arc::from("2"))), PushOutcome::Queued);
        assert_eq!(queue.push(Outbound::Frame(Arc::from("3"))), PushOutcome::DroppedOldest);
        let frames: Vec<_> = queue.frames.lock().iter().cloned().collect();
        assert_eq!(
            frames,
            vec![Outbound::Frame(Arc::from("2")), Outbound::Frame(Arc::from("3"))]
        );
    }

    #[test_timeout::timeout]
    fn disconnect_policy_evicts_slow_peer() {
        let registry = registry(1, SlowPeerPolicy::Disconnect);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        // b still holds its id frame, so the next frame overflows.
        let outcome = registry.route(a.id(), &header(Route::Unicast(b.id().clone())), Arc::from("x"));
        assert_eq!(outcome.disconnected, 1);
        assert!(!registry.contains(b.id()));
        assert!(matches!(
            drain(&b).as_slice(),
            [Outbound::Close { code, .. }] if *code == close_code::POLICY
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn pop_waits_for_push_and_ends_after_close() {
        let queue = Arc::new(OutboundQueue::new(4, SlowPeerPolicy::DropOldest));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(frame) = queue.pop().await {
                    seen.push(frame);
                }
                seen
            })
        };
        tokio::task::yield_now().await;
        queue.push(Outbound::Ping);
        queue.close(close_code::NORMAL, "bye");
        assert_eq!(queue.push(Outbound::Ping), PushOutcome::Closed);

        let seen = consumer.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Outbound::Ping);
        assert!(matches!(&seen[1], Outbound::Close { reason, .. } if reason == "bye"));
    }

    #[test_timeout::timeout]
    fn idle_peers_are_closed_and_removed() {
        let registry = PeerRegistry::new(&RelayConfig {
            idle_timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        });
        let quiet = registry.register().unwrap();
        let chatty = registry.register().unwrap();
        drain(&quiet);
        drain(&chatty);

        let later = Instant::now() + Duration::from_secs(10);
        // Simulate recent traffic on `chatty` as seen from `later`.
        chatty
            .last_seen_ms
            .store(Duration::from_secs(9).as_millis() as u64, Ordering::Relaxed);

        assert_eq!(registry.close_idle(later), 1);
        assert!(!registry.contains(quiet.id()));
        assert!(registry.contains(chatty.id()));
        assert!(matches!(
            drain(&quiet).as_slice(),
            [Outbound::Close { reason, .. }] if reason == "idle timeout"
        ));
    }

    #[test_timeout::timeout]
    fn snapshot_reports_queue_depth() {
        let registry = registry(8, SlowPeerPolicy::DropOldest);
        let _a = registry.register().unwrap();
        let _b = registry.register().unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id.as_str(), "p1");
        assert_eq!(snapshot[0].queue_depth, 1);
    }
}
