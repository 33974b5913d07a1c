use crate::model::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

/// Aggregate inter-satellite link budget: 10 KiB/s shared across all peers.
pub const DEFAULT_GLOBAL_RATE_BPS: f64 = 10.0 * 1024.0;
pub const DEFAULT_GLOBAL_BURST: f64 = 5.0 * 1024.0;

/// Per-peer slice of the link: 1 KiB/s with a 500-byte burst allowance.
pub const DEFAULT_PEER_RATE_BPS: f64 = 1024.0;
pub const DEFAULT_PEER_BURST: f64 = 500.0;

/// Nominal bandwidth shares per priority class (documented link budget).
pub const CRITICAL_SHARE: f64 = 0.80;
pub const HIGH_SHARE: f64 = 0.15;
pub const NORMAL_SHARE: f64 = 0.05;

const UTILIZATION_MODERATE: f64 = 0.70;
const UTILIZATION_THROTTLED: f64 = 0.90;
const UTILIZATION_CRITICAL: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessagePriority {
    /// Health state and emergency traffic.
    Critical,
    /// Intent announcements.
    High,
    /// Routine coordination (gossip, discovery).
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CongestionLevel {
    Normal,
    Moderate,
    Throttled,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    Admitted,
    /// Rejected for now; the sender may retry on its next tick.
    Throttled,
    /// Rejected and counted as a congestion casualty.
    Dropped,
}

impl SendOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, SendOutcome::Admitted)
    }
}

/// Classic token bucket: capacity accumulates at `rate_bps` up to `burst`,
/// debited per send. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    rate_bps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bps: f64, burst: f64) -> Self {
        Self {
            rate_bps,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_bps).min(self.burst);
        self.last_refill = Instant::now();
    }

    /// Debit `n` tokens, or leave the bucket untouched and report rejection.
    pub fn acquire(&mut self, n: usize) -> bool {
        self.refill();
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Refund a debit whose counterpart bucket rejected the send.
    pub fn credit(&mut self, n: usize) {
        self.tokens = (self.tokens + n as f64).min(self.burst);
    }

    pub fn tokens_available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn utilization(&mut self) -> f64 {
        self.refill();
        1.0 - self.tokens / self.burst
    }

}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct GovernorStats {
    pub admitted: u64,
    pub throttled: u64,
    pub dropped: u64,
    pub congestion_events: u64,
    pub bytes_admitted: u64,
}

struct GovernorInner {
    global: TokenBucket,
    peer_buckets: HashMap<AgentId, TokenBucket>,
    peer_rate_bps: f64,
    peer_burst: f64,
    stats: GovernorStats,
}

/// Priority-aware admission control over the shared link. Every outbound
/// send asks here first; a rejection means the message never reaches the bus.
///
/// Internally one mutex guards all buckets so each debit/refund sequence is
/// a single critical section.
pub struct BandwidthGovernor {
    inner: Mutex<GovernorInner>,
}

impl BandwidthGovernor {
    pub fn new() -> Self {
        Self::with_global_limit(DEFAULT_GLOBAL_RATE_BPS, DEFAULT_GLOBAL_BURST)
    }

    pub fn with_global_limit(rate_bps: f64, burst: f64) -> Self {
        Self {
            inner: Mutex::new(GovernorInner {
                global: TokenBucket::new(rate_bps, burst),
                peer_buckets: HashMap::new(),
                peer_rate_bps: DEFAULT_PEER_RATE_BPS,
                peer_burst: DEFAULT_PEER_BURST,
                stats: GovernorStats::default(),
            }),
        }
    }

    /// Decide whether a `size`-byte send to `peer` may proceed.
    pub fn admit(&self, peer: &AgentId, size: usize, priority: MessagePriority) -> SendOutcome {
        let mut inner = self.lock_inner();
        let utilization = inner.global.utilization();

        if utilization >= UTILIZATION_CRITICAL {
            if priority != MessagePriority::Critical {
                inner.stats.dropped += 1;
                inner.stats.congestion_events += 1;
                warn!(%peer, size, ?priority, "link saturated, message dropped");
                return SendOutcome::Dropped;
            }
            // Emergency traffic is gated only by the peer slice once the
            // shared bucket is exhausted.
            let (rate, burst) = (inner.peer_rate_bps, inner.peer_burst);
            let bucket = inner
                .peer_buckets
                .entry(peer.clone())
                .or_insert_with(|| TokenBucket::new(rate, burst));
            return if bucket.acquire(size) {
                inner.stats.admitted += 1;
                inner.stats.bytes_admitted += size as u64;
                SendOutcome::Admitted
            } else {
                inner.stats.throttled += 1;
                SendOutcome::Throttled
            };
        }

        if utilization >= UTILIZATION_MODERATE && priority == MessagePriority::Normal {
            inner.stats.throttled += 1;
            debug!(%peer, size, utilization, "normal traffic throttled");
            return SendOutcome::Throttled;
        }

        let global_ok = inner.global.acquire(size);
        let (rate, burst) = (inner.peer_rate_bps, inner.peer_burst);
        let peer_ok = inner
            .peer_buckets
            .entry(peer.clone())
            .or_insert_with(|| TokenBucket::new(rate, burst))
            .acquire(size);

        match (global_ok, peer_ok) {
            (true, true) => {
                inner.stats.admitted += 1;
                inner.stats.bytes_admitted += size as u64;
                SendOutcome::Admitted
            }
            (true, false) => {
                inner.global.credit(size);
                inner.stats.throttled += 1;
                SendOutcome::Throttled
            }
            (false, true) => {
                if let Some(bucket) = inner.peer_buckets.get_mut(peer) {
                    bucket.credit(size);
                }
                inner.stats.throttled += 1;
                SendOutcome::Throttled
            }
            (false, false) => {
                inner.stats.throttled += 1;
                SendOutcome::Throttled
            }
        }
    }

    pub fn get_congestion_level(&self) -> CongestionLevel {
        let utilization = self.utilization();
        if utilization >= UTILIZATION_CRITICAL {
            CongestionLevel::Critical
        } else if utilization >= UTILIZATION_THROTTLED {
            CongestionLevel::Throttled
        } else if utilization >= UTILIZATION_MODERATE {
            CongestionLevel::Moderate
        } else {
            CongestionLevel::Normal
        }
    }

    pub fn utilization(&self) -> f64 {
        self.lock_inner().global.utilization()
    }

    pub fn global_tokens_available(&self) -> f64 {
        self.lock_inner().global.tokens_available()
    }

    /// Replace one peer's slice; burst stays proportional to the rate and
    /// the new bucket starts full.
    pub fn set_peer_limit(&self, peer: &AgentId, rate_bps: f64) {
        let mut inner = self.lock_inner();
        inner
            .peer_buckets
            .insert(peer.clone(), TokenBucket::new(rate_bps, rate_bps / 2.0));
    }

    /// Replace the aggregate link budget; burst stays proportional.
    pub fn set_global_limit(&self, rate_bps: f64) {
        let mut inner = self.lock_inner();
        inner.global = TokenBucket::new(rate_bps, rate_bps / 2.0);
    }

    /// New per-peer buckets created after this call use the given rate.
    pub fn set_default_peer_limit(&self, rate_bps: f64) {
        let mut inner = self.lock_inner();
        inner.peer_rate_bps = rate_bps;
        inner.peer_burst = rate_bps / 2.0;
    }

    pub fn stats(&self) -> GovernorStats {
        self.lock_inner().stats
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, GovernorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for BandwidthGovernor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> AgentId {
        AgentId::new("SAT-PEER").unwrap()
    }

    #[test]
    fn test_bucket_starts_full_and_never_overfills() {
        let mut bucket = TokenBucket::new(1000.0, 500.0);
        assert_eq!(bucket.tokens_available(), 500.0);
        bucket.credit(10_000);
        assert!(bucket.tokens_available() <= 500.0);
        assert!(bucket.acquire(500));
        assert!(bucket.tokens_available() >= 0.0);
    }

    #[test]
    fn test_bucket_rejects_without_deducting() {
        let mut bucket = TokenBucket::new(1.0, 100.0);
        assert!(bucket.acquire(80));
        let before = bucket.tokens_available();
        assert!(!bucket.acquire(80));
        let after = bucket.tokens_available();
        assert!(after >= before);
    }

    #[test]
    fn test_admission_under_light_load() {
        let governor = BandwidthGovernor::new();
        let outcome = governor.admit(&peer(), 100, MessagePriority::Normal);
        assert_eq!(outcome, SendOutcome::Admitted);
        assert_eq!(governor.stats().admitted, 1);
    }

    #[test]
    fn test_normal_throttled_above_moderate_utilization() {
        let governor = BandwidthGovernor::with_global_limit(10.0, 1000.0);
        // Drain to 75% utilization.
        assert!(governor
            .admit(&peer(), 250, MessagePriority::Critical)
            .is_admitted());
        let drain = AgentId::new("SAT-DRAIN").unwrap();
        assert!(governor
            .admit(&drain, 250, MessagePriority::Critical)
            .is_admitted());
        assert!(governor
            .admit(&AgentId::new("SAT-D2").unwrap(), 250, MessagePriority::Critical)
            .is_admitted());
        assert!(governor.utilization() >= 0.70);

        assert_eq!(
            governor.admit(&peer(), 10, MessagePriority::Normal),
            SendOutcome::Throttled
        );
        // High priority still passes below saturation.
        assert_eq!(
            governor.admit(&peer(), 10, MessagePriority::High),
            SendOutcome::Admitted
        );
    }

    #[test]
    fn test_saturation_admits_only_critical() {
        // Zero refill keeps the bucket pinned at exactly 100% utilization.
        let governor = BandwidthGovernor::with_global_limit(0.0, 400.0);
        // Exhaust the global bucket entirely.
        assert!(governor
            .admit(&peer(), 400, MessagePriority::Critical)
            .is_admitted());
        assert!(governor.utilization() >= 1.0 - 1e-6);

        assert_eq!(
            governor.admit(&peer(), 10, MessagePriority::Normal),
            SendOutcome::Dropped
        );
        assert_eq!(
            governor.admit(&peer(), 10, MessagePriority::High),
            SendOutcome::Dropped
        );
        // Critical rides on the remaining peer-slice allowance.
        assert_eq!(
            governor.admit(&peer(), 10, MessagePriority::Critical),
            SendOutcome::Admitted
        );
        assert!(governor.stats().congestion_events >= 2);
    }

    #[test]
    fn test_peer_bucket_refund_on_split_failure() {
        let governor = BandwidthGovernor::new();
        let p = peer();
        // Peer slice bursts at 500 bytes; a 600-byte send fails the peer
        // bucket and must refund the global debit.
        let before = governor.global_tokens_available();
        assert_eq!(
            governor.admit(&p, 600, MessagePriority::Critical),
            SendOutcome::Throttled
        );
        let after = governor.global_tokens_available();
        assert!((before - after).abs() < 1.0);
    }

    #[test]
    fn test_congestion_level_breakpoints() {
        let governor = BandwidthGovernor::with_global_limit(0.0, 1000.0);
        assert_eq!(governor.get_congestion_level(), CongestionLevel::Normal);

        // Each drain uses a fresh peer so the per-peer slice never interferes.
        let drains = ["SAT-D1", "SAT-D2", "SAT-D3", "SAT-D4"];
        let sizes = [400usize, 350, 200, 50];
        let levels = [
            CongestionLevel::Normal,
            CongestionLevel::Moderate,
            CongestionLevel::Throttled,
            CongestionLevel::Critical,
        ];
        for ((serial, size), expected) in drains.iter().zip(sizes).zip(levels) {
            let p = AgentId::new(serial).unwrap();
            assert!(governor.admit(&p, size, MessagePriority::Critical).is_admitted());
            assert_eq!(governor.get_congestion_level(), expected);
        }
    }
}
