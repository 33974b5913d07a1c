use crate::model::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Scope string that subjects an action to risk validation.
pub const CONSTELLATION_SCOPE: &str = "constellation";

/// Default blast-radius ceiling: block anything risking more than 10% of the
/// constellation.
pub const DEFAULT_RISK_THRESHOLD: f64 = 0.10;

/// One-hop neighbors inherit this fraction of the base risk.
const CASCADE_FACTOR: f64 = 0.15;

const ATTITUDE_NEIGHBOR_CAP: usize = 10;
const THERMAL_NEIGHBOR_CAP: usize = 5;

/// Samples required before percentile latency figures are reported.
const LATENCY_MIN_SAMPLES: usize = 20;
const LATENCY_WINDOW: usize = 128;

/// The one registry capability the simulator needs. Satisfied by the real
/// `PeerRegistry` and by trivial test doubles.
pub trait PeerView: Send + Sync {
    fn alive_peer_ids(&self) -> Vec<AgentId>;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimulatorError {
    #[error("parameter {name} is not a finite number: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionClass {
    AttitudeAdjust,
    LoadShed,
    ThermalManeuver,
    SafeMode,
    RoleReassignment,
}

impl ActionClass {
    /// Substring classification over the action name. Unrecognized names fall
    /// back to the lowest-risk class.
    fn classify(action: &str) -> (Self, bool) {
        let name = action.to_ascii_lowercase();
        if name.contains("attitude") {
            (Self::AttitudeAdjust, true)
        } else if name.contains("shed") || name.contains("load") {
            (Self::LoadShed, true)
        } else if name.contains("thermal") {
            (Self::ThermalManeuver, true)
        } else if name.contains("role") {
            (Self::RoleReassignment, true)
        } else if name.contains("safe") {
            (Self::SafeMode, true)
        } else {
            (Self::SafeMode, false)
        }
    }
}

/// Outcome of one risk evaluation, kept for observability consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub action_class: ActionClass,
    pub base_risk: f64,
    pub cascade_risk: f64,
    pub total_risk: f64,
    pub affected_agents: usize,
    pub is_safe: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SimulatorStats {
    pub validations: u64,
    pub blocked: u64,
    pub passed_through: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub mean_us: f64,
    pub p95_us: Option<u32>,
    pub max_us: Option<u32>,
}

struct SimulatorInner {
    stats: SimulatorStats,
    latency_window: heapless::Vec<u32, LATENCY_WINDOW>,
    latency_cursor: usize,
    latency_sum_us: u64,
    latency_samples: u64,
}

/// Pre-execution risk gate for constellation-scope actions. Stateless across
/// calls except for accumulated metrics; performs no suspending operations,
/// so it is safe on a hot path.
pub struct SafetySimulator {
    view: Arc<dyn PeerView>,
    threshold: f64,
    enabled: bool,
    inner: Mutex<SimulatorInner>,
}

impl SafetySimulator {
    pub fn new(view: Arc<dyn PeerView>) -> Self {
        Self {
            view,
            threshold: DEFAULT_RISK_THRESHOLD,
            enabled: true,
            inner: Mutex::new(SimulatorInner {
                stats: SimulatorStats::default(),
                latency_window: heapless::Vec::new(),
                latency_cursor: 0,
                latency_sum_us: 0,
                latency_samples: 0,
            }),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Feature flag: disabled means every action passes through unvalidated.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Gate a proposed action. Non-constellation scope passes through; any
    /// internal failure blocks the action (fail-closed). Always resolves to a
    /// boolean, never raises into the caller.
    pub fn validate_action(
        &self,
        action: &str,
        params: &HashMap<String, f64>,
        decision_id: &str,
        scope: &str,
    ) -> bool {
        let started = Instant::now();

        let verdict = if !self.enabled || scope != CONSTELLATION_SCOPE {
            let mut inner = self.lock_inner();
            inner.stats.passed_through += 1;
            true
        } else {
            match self.evaluate(action, params) {
                Ok(assessment) => {
                    let mut inner = self.lock_inner();
                    inner.stats.validations += 1;
                    if !assessment.is_safe {
                        inner.stats.blocked += 1;
                        warn!(
                            decision_id,
                            action,
                            total_risk = assessment.total_risk,
                            threshold = self.threshold,
                            "action blocked by safety gate"
                        );
                    } else {
                        debug!(decision_id, action, total_risk = assessment.total_risk, "action cleared");
                    }
                    assessment.is_safe
                }
                Err(e) => {
                    // Fail closed: an evaluation we cannot trust blocks the action.
                    warn!(decision_id, action, error = %e, "risk evaluation failed, blocking");
                    let mut inner = self.lock_inner();
                    inner.stats.validations += 1;
                    inner.stats.failures += 1;
                    inner.stats.blocked += 1;
                    false
                }
            }
        };

        self.record_latency(started.elapsed().as_micros() as u32);
        verdict
    }

    /// Full risk computation, exposed for observability consumers that want
    /// the assessment rather than the boolean.
    pub fn evaluate(
        &self,
        action: &str,
        params: &HashMap<String, f64>,
    ) -> Result<RiskAssessment, SimulatorError> {
        let (class, recognized) = ActionClass::classify(action);
        if !recognized {
            warn!(action, "unrecognized action, defaulting to lowest-risk class");
        }

        let base_risk = match class {
            ActionClass::AttitudeAdjust => {
                // A 10-degree slew costs roughly 30% aggregate coverage.
                let angle = param(params, "angle_degrees")?;
                (angle / 10.0 * 0.30).min(1.0).max(0.0)
            }
            ActionClass::LoadShed => {
                let shed = param(params, "shed_percent")?;
                if shed <= 15.0 {
                    0.0
                } else {
                    ((shed - 15.0) / 100.0).min(1.0)
                }
            }
            ActionClass::ThermalManeuver => {
                let delta = param(params, "delta_temperature_c")?;
                if delta <= 5.0 {
                    0.0
                } else {
                    (delta / 50.0).min(1.0)
                }
            }
            ActionClass::SafeMode => 0.0,
            ActionClass::RoleReassignment => 0.05,
        };

        let alive = self.view.alive_peer_ids();
        let affected = affected_agents(class, &alive);

        // One hop only: each directly-affected agent taxes its neighbors,
        // averaged back over the directly-affected count.
        let cascade_risk = if affected.is_empty() {
            0.0
        } else {
            let mut sum = 0.0;
            for agent in &affected {
                let neighbors = alive.iter().filter(|id| *id != agent).count();
                sum += neighbors as f64 * base_risk * CASCADE_FACTOR;
            }
            sum / affected.len() as f64
        };

        let total_risk = (base_risk + cascade_risk).min(1.0);
        Ok(RiskAssessment {
            action_class: class,
            base_risk,
            cascade_risk,
            total_risk,
            affected_agents: affected.len(),
            is_safe: total_risk <= self.threshold,
        })
    }

    pub fn stats(&self) -> SimulatorStats {
        self.lock_inner().stats
    }

    pub fn latency_stats(&self) -> LatencyStats {
        let inner = self.lock_inner();
        let mean_us = if inner.latency_samples == 0 {
            0.0
        } else {
            inner.latency_sum_us as f64 / inner.latency_samples as f64
        };
        let (p95_us, max_us) = if inner.latency_window.len() >= LATENCY_MIN_SAMPLES {
            let mut sorted: Vec<u32> = inner.latency_window.to_vec();
            sorted.sort_unstable();
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            let p95 = sorted[rank.saturating_sub(1).min(sorted.len() - 1)];
            (Some(p95), sorted.last().copied())
        } else {
            (None, None)
        };
        LatencyStats {
            samples: inner.latency_samples,
            mean_us,
            p95_us,
            max_us,
        }
    }

    fn record_latency(&self, micros: u32) {
        let mut inner = self.lock_inner();
        inner.latency_samples += 1;
        inner.latency_sum_us += micros as u64;
        if inner.latency_window.len() < LATENCY_WINDOW {
            let _ = inner.latency_window.push(micros);
        } else {
            let cursor = inner.latency_cursor;
            inner.latency_window[cursor] = micros;
            inner.latency_cursor = (cursor + 1) % LATENCY_WINDOW;
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SimulatorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn param(params: &HashMap<String, f64>, name: &'static str) -> Result<f64, SimulatorError> {
    let value = params.get(name).copied().unwrap_or(0.0);
    if !value.is_finite() {
        return Err(SimulatorError::InvalidParameter { name, value });
    }
    Ok(value)
}

/// Affected-agent selection per action class. Without an orbital position
/// model, "nearest" is resolved by deterministic serial order.
fn affected_agents(class: ActionClass, alive: &[AgentId]) -> Vec<AgentId> {
    match class {
        ActionClass::AttitudeAdjust => sorted_by_serial(alive, ATTITUDE_NEIGHBOR_CAP),
        ActionClass::ThermalManeuver => sorted_by_serial(alive, THERMAL_NEIGHBOR_CAP),
        ActionClass::LoadShed => alive.to_vec(),
        ActionClass::SafeMode | ActionClass::RoleReassignment => Vec::new(),
    }
}

fn sorted_by_serial(alive: &[AgentId], cap: usize) -> Vec<AgentId> {
    let mut sorted = alive.to_vec();
    sorted.sort_by(|a, b| a.serial().cmp(b.serial()));
    sorted.truncate(cap);
    sorted
}
