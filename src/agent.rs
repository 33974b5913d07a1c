use crate::broadcaster::{BroadcastStats, HealthBroadcaster};
use crate::bus::SwarmBus;
use crate::config::SwarmFlags;
use crate::governor::{BandwidthGovernor, CongestionLevel, GovernorStats};
use crate::model::{HealthSummary, SwarmConfig};
use crate::registry::{PeerRegistry, PeerState, RegistryError, RegistryStats};
use crate::simulator::{LatencyStats, PeerView, SafetySimulator, SimulatorStats};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Aggregated component statistics for observability collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmStats {
    pub registry: RegistryStats,
    pub governor: GovernorStats,
    pub broadcast: BroadcastStats,
    pub simulator: SimulatorStats,
    pub validation_latency: LatencyStats,
    pub congestion: CongestionLevel,
}

/// Top-level composition root: owns the governor, registry, broadcaster and
/// safety gate explicitly, so multiple simulated agents can share one test
/// process without hidden global state.
pub struct SwarmAgent {
    config: SwarmConfig,
    flags: SwarmFlags,
    bus: Arc<dyn SwarmBus>,
    governor: Arc<BandwidthGovernor>,
    registry: Arc<PeerRegistry>,
    broadcaster: Arc<HealthBroadcaster>,
    simulator: SafetySimulator,
    running: AtomicBool,
}

impl SwarmAgent {
    pub fn new(config: SwarmConfig, flags: SwarmFlags, bus: Arc<dyn SwarmBus>) -> Self {
        Self::with_timing(
            config,
            flags,
            bus,
            crate::registry::HEARTBEAT_INTERVAL,
            crate::registry::HEARTBEAT_TIMEOUT,
            crate::broadcaster::BROADCAST_BASE_PERIOD,
        )
    }

    /// Constructor with explicit loop timing, for simulation and test runs.
    pub fn with_timing(
        config: SwarmConfig,
        flags: SwarmFlags,
        bus: Arc<dyn SwarmBus>,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        broadcast_period: Duration,
    ) -> Self {
        // The configured link budget feeds the global bucket directly.
        let rate_bps = config.bandwidth_limit_kbps() as f64 * 1024.0;
        let governor = Arc::new(BandwidthGovernor::with_global_limit(rate_bps, rate_bps / 2.0));

        let registry = Arc::new(
            PeerRegistry::new(config.clone(), flags.clone(), Arc::clone(&governor))
                .with_timing(heartbeat_interval, heartbeat_timeout),
        );
        let broadcaster = Arc::new(
            HealthBroadcaster::new(
                Arc::clone(&registry),
                Some(Arc::clone(&governor)),
                Arc::clone(&bus),
                &flags,
            )
            .with_base_period(broadcast_period),
        );
        let simulator = SafetySimulator::new(Arc::clone(&registry) as Arc<dyn PeerView>);

        Self {
            config,
            flags,
            bus,
            governor,
            registry,
            broadcaster,
            simulator,
            running: AtomicBool::new(false),
        }
    }

    /// Bring up discovery, heartbeat and broadcast loops. A no-op when swarm
    /// mode is disabled by configuration.
    pub async fn start(&self) -> Result<(), RegistryError> {
        if !self.flags.swarm_mode {
            info!(agent = %self.config.agent_id(), "swarm mode disabled, agent idle");
            return Ok(());
        }
        self.registry.start(Arc::clone(&self.bus)).await?;
        self.broadcaster.start();
        self.running.store(true, Ordering::SeqCst);
        info!(agent = %self.config.agent_id(), "swarm agent started");
        Ok(())
    }

    /// Shut both background loops down cleanly. Idempotent.
    pub async fn stop(&self) {
        self.broadcaster.stop().await;
        self.registry.stop().await;
        if self.running.swap(false, Ordering::SeqCst) {
            info!(agent = %self.config.agent_id(), "swarm agent stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pre-execution safety gate; see [`SafetySimulator::validate_action`].
    pub fn validate_action(
        &self,
        action: &str,
        params: &HashMap<String, f64>,
        decision_id: &str,
        scope: &str,
    ) -> bool {
        self.simulator.validate_action(action, params, decision_id, scope)
    }

    pub fn set_safety_enabled(&mut self, enabled: bool) {
        self.simulator.set_enabled(enabled);
    }

    /// Feed the latest local health reading into the heartbeat/broadcast path.
    pub fn update_local_health(&self, health: HealthSummary) {
        self.registry.set_local_health(health);
    }

    pub fn get_alive_peers(&self) -> Vec<PeerState> {
        self.registry.get_alive_peers()
    }

    pub fn swarm_stats(&self) -> SwarmStats {
        SwarmStats {
            registry: self.registry.get_registry_stats(),
            governor: self.governor.stats(),
            broadcast: self.broadcaster.stats(),
            simulator: self.simulator.stats(),
            validation_latency: self.simulator.latency_stats(),
            congestion: self.governor.get_congestion_level(),
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn governor(&self) -> &Arc<BandwidthGovernor> {
        &self.governor
    }

    pub fn broadcaster(&self) -> &Arc<HealthBroadcaster> {
        &self.broadcaster
    }
}
