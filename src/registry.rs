use crate::bus::{now_millis, topics, BusError, BusMessage, DeliveryQuality, SwarmBus};
use crate::compressor::StateCompressor;
use crate::config::SwarmFlags;
use crate::governor::{BandwidthGovernor, MessagePriority};
use crate::model::{AgentId, AgentRole, HealthSummary, SwarmConfig};
use crate::simulator::PeerView;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// How many random peers each HELLO is forwarded to.
pub const GOSSIP_FANOUT: usize = 3;
/// How many times one agent will relay HELLOs for the same sender.
pub const GOSSIP_REPLICATION: u32 = 2;

const HELLO_EVERY_N_HEARTBEATS: u64 = 3;
const PEER_RETENTION: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("registry already started")]
    AlreadyStarted,
}

/// Per-peer mutable record. Entries are created on first discovery and age
/// out via `is_alive`; they are only removed after the 24h retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub last_heartbeat: u64,
    pub health_summary: Option<HealthSummary>,
    pub heartbeat_failures: u32,
    pub backoff_multiplier: u32,
    pub first_seen: u64,
}

impl PeerState {
    fn new(agent_id: AgentId, role: AgentRole, now: u64) -> Self {
        Self {
            agent_id,
            role,
            last_heartbeat: now,
            health_summary: None,
            heartbeat_failures: 0,
            backoff_multiplier: 1,
            first_seen: now,
        }
    }

    /// Liveness is recomputed from the timeout on every call, never cached.
    pub fn is_alive(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.last_heartbeat) <= timeout.as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
struct RegistryCounters {
    heartbeats_sent: u64,
    heartbeat_failures: u64,
    hellos_sent: u64,
    gossip_relayed: u64,
    gossip_suppressed: u64,
    decode_failures: u64,
    peers_discovered: u64,
    peers_pruned: u64,
}

/// Observability snapshot for dashboards and consensus collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_peers: usize,
    pub alive_peers: usize,
    pub dead_peers: usize,
    pub quorum_size: usize,
    pub heartbeat_interval_s: u64,
    pub heartbeat_timeout_s: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub hellos_sent: u64,
    pub gossip_relayed: u64,
    pub gossip_suppressed: u64,
    pub decode_failures: u64,
    pub peers_discovered: u64,
    pub peers_pruned: u64,
}

struct RegistryInner {
    peers: HashMap<AgentId, PeerState>,
    gossip_relays: HashMap<AgentId, u32>,
    encoder: StateCompressor,
    decoders: HashMap<AgentId, StateCompressor>,
    local_health: HealthSummary,
    consecutive_failures: u32,
    heartbeat_count: u64,
    counters: RegistryCounters,
}

struct RegistryTasks {
    shutdown: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

/// Best-effort membership view of the constellation: discovery via gossip
/// HELLOs and health receipts, liveness via heartbeat timeouts. The peer map
/// is exclusively owned here; readers get copies.
pub struct PeerRegistry {
    config: SwarmConfig,
    flags: SwarmFlags,
    governor: Arc<BandwidthGovernor>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    inner: Mutex<RegistryInner>,
    tasks: Mutex<Option<RegistryTasks>>,
}

impl PeerRegistry {
    pub fn new(config: SwarmConfig, flags: SwarmFlags, governor: Arc<BandwidthGovernor>) -> Self {
        let now = now_millis();
        let mut peers = HashMap::new();
        // register_self: our own entry anchors quorum math from tick zero.
        peers.insert(
            config.agent_id().clone(),
            PeerState::new(config.agent_id().clone(), config.role(), now),
        );
        let entropy = flags.entropy_compression;
        let max_payload = flags.max_payload_bytes;
        Self {
            config,
            flags,
            governor,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            inner: Mutex::new(RegistryInner {
                peers,
                gossip_relays: HashMap::new(),
                encoder: StateCompressor::new(entropy).with_max_payload(max_payload),
                decoders: HashMap::new(),
                local_health: HealthSummary::baseline(now),
                consecutive_failures: 0,
                heartbeat_count: 0,
                counters: RegistryCounters::default(),
            }),
            tasks: Mutex::new(None),
        }
    }

    /// Shortened intervals for simulation and test runs.
    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn agent_id(&self) -> &AgentId {
        self.config.agent_id()
    }

    /// Subscribe to health and discovery topics and begin the background
    /// heartbeat. Call once; a second start is an error.
    pub async fn start(
        self: &Arc<Self>,
        bus: Arc<dyn SwarmBus>,
    ) -> Result<(), RegistryError> {
        if self.lock_tasks().is_some() {
            return Err(RegistryError::AlreadyStarted);
        }

        let own_id = self.config.agent_id().clone();
        let mut health_rx = bus.subscribe(topics::HEALTH, &own_id).await?;
        let mut hello_rx = bus.subscribe(topics::HELLO, &own_id).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::clone(self);
        let heartbeat_bus = Arc::clone(&bus);
        let mut heartbeat_shutdown = shutdown_rx.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                let interval = registry.current_heartbeat_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        registry.heartbeat_tick(heartbeat_bus.as_ref()).await;
                    }
                    _ = heartbeat_shutdown.changed() => break,
                }
            }
            debug!("heartbeat loop stopped");
        });

        let registry = Arc::clone(self);
        let mut dispatch_shutdown = shutdown_rx;
        let dispatch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = health_rx.recv() => match msg {
                        Some(m) => registry.on_health_message(&m.sender, &m.payload),
                        None => break,
                    },
                    msg = hello_rx.recv() => match msg {
                        Some(m) => registry.on_hello_message(bus.as_ref(), &m).await,
                        None => break,
                    },
                    _ = dispatch_shutdown.changed() => break,
                }
            }
            debug!("dispatch loop stopped");
        });

        *self.lock_tasks() = Some(RegistryTasks {
            shutdown: shutdown_tx,
            heartbeat,
            dispatch,
        });
        info!(agent = %self.config.agent_id(), "peer registry started");
        Ok(())
    }

    /// Cooperatively cancel both background tasks and await them. Idempotent:
    /// stopping twice or before start is a no-op.
    pub async fn stop(&self) {
        let tasks = self.lock_tasks().take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            let _ = tasks.heartbeat.await;
            let _ = tasks.dispatch.await;
            info!(agent = %self.config.agent_id(), "peer registry stopped");
        }
    }

    /// Host-supplied local health, read by the heartbeat loop.
    pub fn set_local_health(&self, health: HealthSummary) {
        self.lock_inner().local_health = health;
    }

    pub fn local_health_snapshot(&self) -> HealthSummary {
        self.lock_inner().local_health.clone()
    }

    fn current_heartbeat_interval(&self) -> Duration {
        let failures = self.lock_inner().consecutive_failures;
        // Retry schedule: nominal, doubled after one failure, quadrupled
        // after two or more.
        let multiplier = match failures {
            0 => 1,
            1 => 2,
            _ => 4,
        };
        self.heartbeat_interval * multiplier
    }

    async fn heartbeat_tick(&self, bus: &dyn SwarmBus) {
        let own_id = self.config.agent_id().clone();
        let (payload, emit_hello) = {
            let mut inner = self.lock_inner();
            inner.heartbeat_count += 1;
            let emit_hello = inner.heartbeat_count % HELLO_EVERY_N_HEARTBEATS == 0;

            let now = now_millis();
            let mut health = inner.local_health.clone();
            health.timestamp = now;
            let payload = match inner.encoder.encode(&health) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "heartbeat encode failed");
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.counters.heartbeat_failures += 1;
                    return;
                }
            };
            let _ = health.set_compressed_size(payload.len() as u16);

            if let Some(own) = inner.peers.get_mut(&own_id) {
                own.last_heartbeat = now;
                own.health_summary = Some(health.clone());
            }
            inner.local_health = health;
            (payload, emit_hello)
        };

        let admitted = self
            .governor
            .admit(&own_id, payload.len(), MessagePriority::Critical)
            .is_admitted();

        let published = if admitted {
            let message = BusMessage::new(own_id.clone(), topics::HEALTH, payload);
            match bus
                .publish(topics::HEALTH, message, DeliveryQuality::AtLeastOnce, None)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "heartbeat publish failed");
                    false
                }
            }
        } else {
            debug!("heartbeat gated by bandwidth governor");
            false
        };

        {
            let mut inner = self.lock_inner();
            if published {
                inner.consecutive_failures = 0;
                inner.counters.heartbeats_sent += 1;
            } else {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.counters.heartbeat_failures += 1;
            }
            let failures = inner.consecutive_failures;
            if let Some(own) = inner.peers.get_mut(&own_id) {
                own.heartbeat_failures = failures;
                own.backoff_multiplier = match failures {
                    0 => 1,
                    1 => 2,
                    _ => 4,
                };
            }
        }

        if emit_hello {
            self.emit_hello(bus).await;
        }

        self.prune_stale_peers();
    }

    async fn emit_hello(&self, bus: &dyn SwarmBus) {
        let own_id = self.config.agent_id().clone();
        let payload = match serde_json::to_vec(&own_id) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "hello serialization failed");
                return;
            }
        };
        if !self
            .governor
            .admit(&own_id, payload.len(), MessagePriority::Normal)
            .is_admitted()
        {
            debug!("hello beacon gated by bandwidth governor");
            return;
        }
        let message = BusMessage::new(own_id, topics::HELLO, payload);
        match bus
            .publish(topics::HELLO, message, DeliveryQuality::FireAndForget, None)
            .await
        {
            Ok(()) => self.lock_inner().counters.hellos_sent += 1,
            Err(e) => debug!(error = %e, "hello publish failed"),
        }
    }

    /// Health receipt: decode through the per-peer stream decoder; unknown
    /// senders are discovered as a side effect. Duplicate and out-of-order
    /// deliveries are tolerated (last write wins).
    pub fn on_health_message(&self, sender: &AgentId, payload: &[u8]) {
        if sender == self.config.agent_id() {
            return;
        }
        if self.flags.schema_validation && sender.constellation() != self.config.constellation_id()
        {
            warn!(sender = %sender, "health message from foreign constellation rejected");
            return;
        }

        let mut inner = self.lock_inner();
        let entropy = self.flags.entropy_compression;
        let decoded = inner
            .decoders
            .entry(sender.clone())
            .or_insert_with(|| StateCompressor::new(entropy))
            .decode(payload);

        match decoded {
            Ok(summary) => {
                let now = now_millis();
                if let Some(peer) = inner.peers.get_mut(sender) {
                    peer.last_heartbeat = now;
                    peer.health_summary = Some(summary);
                    peer.heartbeat_failures = 0;
                } else {
                    info!(peer = %sender, "peer discovered via health message");
                    let mut state = PeerState::new(sender.clone(), AgentRole::Standby, now);
                    state.health_summary = Some(summary);
                    inner.peers.insert(sender.clone(), state);
                    inner.counters.peers_discovered += 1;
                }
            }
            Err(e) => {
                warn!(sender = %sender, error = %e, "health payload decode failed");
                inner.counters.decode_failures += 1;
            }
        }
    }

    /// Gossip propagation: relay each sender's HELLO at most
    /// `GOSSIP_REPLICATION` times, forwarding unmodified to `GOSSIP_FANOUT`
    /// random other peers. Forward failures are best-effort and ignored.
    pub async fn on_hello_message(&self, bus: &dyn SwarmBus, message: &BusMessage) {
        let targets: Vec<AgentId> = {
            let mut inner = self.lock_inner();
            let origin: AgentId = match serde_json::from_slice(&message.payload) {
                Ok(id) => id,
                Err(e) => {
                    debug!(error = %e, "malformed hello payload dropped");
                    inner.counters.decode_failures += 1;
                    return;
                }
            };
            if &origin == self.config.agent_id() {
                return;
            }
            if self.flags.schema_validation
                && origin.constellation() != self.config.constellation_id()
            {
                warn!(origin = %origin, "hello from foreign constellation rejected");
                return;
            }

            let relays = *inner.gossip_relays.get(&origin).unwrap_or(&0);
            if relays >= GOSSIP_REPLICATION {
                inner.counters.gossip_suppressed += 1;
                return;
            }

            let now = now_millis();
            if let Some(peer) = inner.peers.get_mut(&origin) {
                peer.last_heartbeat = now;
            } else {
                info!(peer = %origin, "peer discovered via hello");
                inner
                    .peers
                    .insert(origin.clone(), PeerState::new(origin.clone(), AgentRole::Standby, now));
                inner.counters.peers_discovered += 1;
            }

            let own_id = self.config.agent_id();
            let candidates: Vec<AgentId> = inner
                .peers
                .keys()
                .filter(|id| *id != own_id && **id != origin && **id != message.sender)
                .cloned()
                .collect();
            let mut rng = rand::thread_rng();
            let targets: Vec<AgentId> = candidates
                .choose_multiple(&mut rng, GOSSIP_FANOUT)
                .cloned()
                .collect();

            if !targets.is_empty() {
                *inner.gossip_relays.entry(origin).or_insert(0) += 1;
                inner.counters.gossip_relayed += 1;
            }
            targets
        };

        for target in targets {
            if !self
                .governor
                .admit(&target, message.payload.len(), MessagePriority::Normal)
                .is_admitted()
            {
                debug!(target = %target, "gossip forward gated by bandwidth governor");
                continue;
            }
            if let Err(e) = bus
                .publish(
                    topics::HELLO,
                    message.clone(),
                    DeliveryQuality::FireAndForget,
                    Some(&target),
                )
                .await
            {
                debug!(target = %target, error = %e, "gossip forward failed");
            }
        }
    }

    /// All peers whose last heartbeat is within the timeout, computed fresh.
    pub fn get_alive_peers(&self) -> Vec<PeerState> {
        let now = now_millis();
        self.lock_inner()
            .peers
            .values()
            .filter(|p| p.is_alive(now, self.heartbeat_timeout))
            .cloned()
            .collect()
    }

    pub fn get_peer(&self, id: &AgentId) -> Option<PeerState> {
        self.lock_inner().peers.get(id).cloned()
    }

    /// Majority quorum over the alive view: `⌊N/2⌋ + 1`.
    pub fn get_quorum_size(&self) -> usize {
        self.get_alive_peers().len() / 2 + 1
    }

    pub fn get_registry_stats(&self) -> RegistryStats {
        let now = now_millis();
        let inner = self.lock_inner();
        let total = inner.peers.len();
        let alive = inner
            .peers
            .values()
            .filter(|p| p.is_alive(now, self.heartbeat_timeout))
            .count();
        RegistryStats {
            total_peers: total,
            alive_peers: alive,
            dead_peers: total - alive,
            quorum_size: alive / 2 + 1,
            heartbeat_interval_s: self.heartbeat_interval.as_secs(),
            heartbeat_timeout_s: self.heartbeat_timeout.as_secs(),
            heartbeats_sent: inner.counters.heartbeats_sent,
            heartbeat_failures: inner.counters.heartbeat_failures,
            hellos_sent: inner.counters.hellos_sent,
            gossip_relayed: inner.counters.gossip_relayed,
            gossip_suppressed: inner.counters.gossip_suppressed,
            decode_failures: inner.counters.decode_failures,
            peers_discovered: inner.counters.peers_discovered,
            peers_pruned: inner.counters.peers_pruned,
        }
    }

    fn prune_stale_peers(&self) {
        let now = now_millis();
        let retention_ms = PEER_RETENTION.as_millis() as u64;
        let own_id = self.config.agent_id().clone();
        let mut inner = self.lock_inner();
        let stale: Vec<AgentId> = inner
            .peers
            .iter()
            .filter(|(id, p)| {
                **id != own_id && now.saturating_sub(p.last_heartbeat) > retention_ms
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            inner.peers.remove(&id);
            inner.decoders.remove(&id);
            inner.counters.peers_pruned += 1;
            info!(peer = %id, "stale peer pruned after retention window");
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Option<RegistryTasks>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PeerView for PeerRegistry {
    fn alive_peer_ids(&self) -> Vec<AgentId> {
        self.get_alive_peers().into_iter().map(|p| p.agent_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CONSTELLATION_TAG;

    fn registry_for(serial: &str) -> PeerRegistry {
        let id = AgentId::new(serial).unwrap();
        let config = SwarmConfig::new(id.clone(), AgentRole::Primary, CONSTELLATION_TAG, vec![], 10)
            .unwrap();
        PeerRegistry::new(config, SwarmFlags::default(), Arc::new(BandwidthGovernor::new()))
    }

    fn insert_alive_peers(registry: &PeerRegistry, count: usize) {
        let now = now_millis();
        let mut inner = registry.lock_inner();
        for i in 0..count {
            let id = AgentId::new(&format!("SAT-P{:03}", i)).unwrap();
            inner
                .peers
                .insert(id.clone(), PeerState::new(id, AgentRole::Standby, now));
        }
    }

    #[test]
    fn test_registers_self_at_construction() {
        let registry = registry_for("SAT-SELF");
        let alive = registry.get_alive_peers();
        assert_eq!(alive.len(), 1);
        assert_eq!(&alive[0].agent_id, registry.agent_id());
    }

    #[test]
    fn test_quorum_size_table() {
        // ⌊N/2⌋+1 over the alive count (self included).
        let cases = [(1usize, 1usize), (2, 2), (3, 2), (4, 3), (5, 3), (10, 6), (50, 26)];
        for (alive, quorum) in cases {
            let registry = registry_for("SAT-Q");
            insert_alive_peers(&registry, alive - 1);
            assert_eq!(registry.get_alive_peers().len(), alive);
            assert_eq!(registry.get_quorum_size(), quorum, "N={}", alive);
        }
    }

    #[test]
    fn test_liveness_expires_without_heartbeat() {
        let registry = registry_for("SAT-L");
        let peer = AgentId::new("SAT-OLD").unwrap();
        {
            let mut inner = registry.lock_inner();
            let mut state = PeerState::new(peer.clone(), AgentRole::Standby, now_millis());
            state.last_heartbeat = now_millis() - HEARTBEAT_TIMEOUT.as_millis() as u64 - 1000;
            inner.peers.insert(peer.clone(), state);
        }
        let alive = registry.get_alive_peers();
        assert!(alive.iter().all(|p| p.agent_id != peer));
        assert_eq!(registry.get_registry_stats().dead_peers, 1);
    }

    #[test]
    fn test_backoff_schedule_widens_interval() {
        let registry = registry_for("SAT-B");
        assert_eq!(registry.current_heartbeat_interval(), HEARTBEAT_INTERVAL);
        registry.lock_inner().consecutive_failures = 1;
        assert_eq!(registry.current_heartbeat_interval(), HEARTBEAT_INTERVAL * 2);
        registry.lock_inner().consecutive_failures = 2;
        assert_eq!(registry.current_heartbeat_interval(), HEARTBEAT_INTERVAL * 4);
        registry.lock_inner().consecutive_failures = 7;
        assert_eq!(registry.current_heartbeat_interval(), HEARTBEAT_INTERVAL * 4);
    }

    #[test]
    fn test_health_discovery_and_update() {
        let registry = registry_for("SAT-R");
        let sender = AgentId::new("SAT-NEW").unwrap();

        let mut encoder = StateCompressor::new(true);
        let health = HealthSummary::new([0.5; 32], 0.3, 2.0, 1).unwrap();
        let wire = encoder.encode(&health).unwrap();

        registry.on_health_message(&sender, &wire);
        let peer = registry.get_peer(&sender).expect("peer discovered");
        assert!(peer.health_summary.is_some());
        assert_eq!(registry.get_registry_stats().peers_discovered, 1);

        // A second receipt updates rather than re-discovers.
        let wire2 = encoder.encode(&health).unwrap();
        registry.on_health_message(&sender, &wire2);
        assert_eq!(registry.get_registry_stats().peers_discovered, 1);
    }

    #[test]
    fn test_garbage_health_counts_decode_failure() {
        let registry = registry_for("SAT-G");
        let sender = AgentId::new("SAT-X").unwrap();
        registry.on_health_message(&sender, &[9, 9, 9, 9, 9, 9, 9]);
        assert_eq!(registry.get_registry_stats().decode_failures, 1);
        assert!(registry.get_peer(&sender).is_none());
    }
}
