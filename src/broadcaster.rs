use crate::bus::{topics, BusMessage, DeliveryQuality, SwarmBus};
use crate::compressor::StateCompressor;
use crate::config::SwarmFlags;
use crate::governor::{BandwidthGovernor, MessagePriority};
use crate::model::{AgentId, HealthSummary};
use crate::registry::PeerRegistry;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const BROADCAST_BASE_PERIOD: Duration = Duration::from_secs(30);

/// Congestion breakpoints for cadence widening.
const CONGESTION_WIDEN: f64 = 0.70;
const CONGESTION_SEVERE: f64 = 0.85;

/// The change-detection hash covers the scalars plus only this many leading
/// signature components. A change confined to later components never triggers
/// a broadcast; this bounds the documented bandwidth budget.
const CHANGE_HASH_COMPONENTS: usize = 8;

/// Signed broadcast envelope. The signature covers the other four fields
/// joined by `:` in declaration order; verifiers reconstruct the identical
/// string before checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedHealthEnvelope {
    pub sender: String,
    pub constellation: String,
    pub payload_hex: String,
    pub timestamp: String,
    pub signature: String,
}

impl SignedHealthEnvelope {
    fn signing_input(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.sender, self.constellation, self.payload_hex, self.timestamp
        )
    }
}

/// Deterministic broadcast key from the agent's own identity, used unless an
/// explicit key is supplied.
pub fn derive_broadcast_key(agent_id: &AgentId) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.constellation().as_bytes());
    hasher.update(b":");
    hasher.update(agent_id.serial().as_bytes());
    hasher.finalize().to_vec()
}

/// Authenticate a broadcast independent of any broadcaster state.
pub fn verify_signature(envelope: &SignedHealthEnvelope, key: &[u8]) -> bool {
    let sig = match hex::decode(&envelope.signature) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(envelope.signing_input().as_bytes());
    mac.verify_slice(&sig).is_ok()
}

fn sign_input(key: &[u8], input: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(input.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn change_hash(health: &HealthSummary) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(health.risk_score.to_le_bytes());
    hasher.update(health.recurrence_score.to_le_bytes());
    for v in &health.anomaly_signature[..CHANGE_HASH_COMPONENTS] {
        hasher.update(v.to_le_bytes());
    }
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BroadcastStats {
    pub broadcasts_sent: u64,
    pub broadcasts_failed: u64,
    pub broadcasts_skipped: u64,
    pub avg_publish_latency_ms: f64,
    pub current_period_s: u64,
}

struct BroadcasterInner {
    encoder: StateCompressor,
    last_change_hash: Option<[u8; 32]>,
    stats: BroadcastStats,
}

/// Periodic signed health publisher. Skips unchanged health, widens its
/// period under congestion, and records publish outcomes and latency.
pub struct HealthBroadcaster {
    agent_id: AgentId,
    key: Vec<u8>,
    registry: Arc<PeerRegistry>,
    governor: Option<Arc<BandwidthGovernor>>,
    bus: Arc<dyn SwarmBus>,
    base_period: Duration,
    inner: Mutex<BroadcasterInner>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl HealthBroadcaster {
    pub fn new(
        registry: Arc<PeerRegistry>,
        governor: Option<Arc<BandwidthGovernor>>,
        bus: Arc<dyn SwarmBus>,
        flags: &SwarmFlags,
    ) -> Self {
        let agent_id = registry.agent_id().clone();
        let key = derive_broadcast_key(&agent_id);
        Self {
            agent_id,
            key,
            registry,
            governor,
            bus,
            base_period: BROADCAST_BASE_PERIOD,
            inner: Mutex::new(BroadcasterInner {
                encoder: StateCompressor::new(flags.entropy_compression)
                    .with_max_payload(flags.max_payload_bytes),
                last_change_hash: None,
                stats: BroadcastStats::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    pub fn with_base_period(mut self, period: Duration) -> Self {
        self.base_period = period;
        self
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Spawn the single background broadcast task. A second start is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let broadcaster = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let period = broadcaster.current_period();
                broadcaster.lock_inner().stats.current_period_s = period.as_secs();
                tokio::select! {
                    _ = tokio::time::sleep(period) => broadcaster.broadcast_tick().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("broadcast loop stopped");
        });
        *task = Some((shutdown_tx, handle));
        info!(agent = %self.agent_id, "health broadcaster started");
    }

    /// Cancel the background task and await its completion. Idempotent.
    pub async fn stop(&self) {
        let task = self.lock_task().take();
        if let Some((shutdown, handle)) = task {
            let _ = shutdown.send(true);
            let _ = handle.await;
            info!(agent = %self.agent_id, "health broadcaster stopped");
        }
    }

    /// Cadence adapts to congestion: 2x period past 70%, 4x past 85%.
    fn current_period(&self) -> Duration {
        let congestion = match &self.governor {
            Some(governor) => governor.utilization(),
            None => self.bus.congestion_hint(),
        };
        if congestion > CONGESTION_SEVERE {
            self.base_period * 4
        } else if congestion > CONGESTION_WIDEN {
            self.base_period * 2
        } else {
            self.base_period
        }
    }

    async fn broadcast_tick(&self) {
        let health = self.registry.local_health_snapshot();
        let change = change_hash(&health);

        let payload = {
            let mut inner = self.lock_inner();
            if inner.last_change_hash == Some(change) {
                inner.stats.broadcasts_skipped += 1;
                debug!("health unchanged, broadcast skipped");
                return;
            }
            match inner.encoder.encode(&health) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "broadcast encode failed");
                    inner.stats.broadcasts_failed += 1;
                    return;
                }
            }
        };

        let envelope = match self.build_envelope(&payload) {
            Some(envelope) => envelope,
            None => {
                self.lock_inner().stats.broadcasts_failed += 1;
                return;
            }
        };
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "envelope serialization failed");
                self.lock_inner().stats.broadcasts_failed += 1;
                return;
            }
        };

        if let Some(governor) = &self.governor {
            if !governor
                .admit(&self.agent_id, body.len(), MessagePriority::Critical)
                .is_admitted()
            {
                warn!("broadcast gated by bandwidth governor");
                self.lock_inner().stats.broadcasts_failed += 1;
                return;
            }
        }

        let message = BusMessage::new(self.agent_id.clone(), topics::BROADCAST, body);
        let started = Instant::now();
        let result = self
            .bus
            .publish(topics::BROADCAST, message, DeliveryQuality::AtLeastOnce, None)
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut inner = self.lock_inner();
        match result {
            Ok(()) => {
                inner.stats.broadcasts_sent += 1;
                let n = inner.stats.broadcasts_sent as f64;
                inner.stats.avg_publish_latency_ms +=
                    (latency_ms - inner.stats.avg_publish_latency_ms) / n;
                inner.last_change_hash = Some(change);
            }
            Err(e) => {
                warn!(error = %e, "broadcast publish failed");
                inner.stats.broadcasts_failed += 1;
            }
        }
    }

    fn build_envelope(&self, payload: &[u8]) -> Option<SignedHealthEnvelope> {
        let mut envelope = SignedHealthEnvelope {
            sender: self.agent_id.uuid_hex(),
            constellation: self.agent_id.constellation().to_string(),
            payload_hex: hex::encode(payload),
            timestamp: Utc::now().to_rfc3339(),
            signature: String::new(),
        };
        match sign_input(&self.key, &envelope.signing_input()) {
            Some(signature) => {
                envelope.signature = signature;
                Some(envelope)
            }
            None => {
                warn!("broadcast signing failed");
                None
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        self.lock_inner().stats
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BroadcasterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_task(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<(watch::Sender<bool>, JoinHandle<()>)>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}
