//! # Swarmlink
//!
//! Coordination core for a constellation of autonomous satellite agents
//! sharing a severely bandwidth-constrained inter-satellite link.
//!
//! ## Features
//!
//! - **Gossip membership**: HELLO beacons with bounded fanout and replication
//!   give sub-linear discovery convergence
//! - **Admission control**: global and per-peer token buckets with priority
//!   classes over a 10 KiB/s aggregate link budget
//! - **Health compression**: delta + quantization + LZ4 pipeline shrinking
//!   health summaries to tens of bytes on the wire
//! - **Signed broadcasts**: HMAC-authenticated health envelopes with
//!   congestion-adaptive cadence
//! - **Safety gating**: every constellation-scope action is simulated for
//!   cascading-failure risk before it may execute
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use swarmlink::bus::InMemoryBus;
//! use swarmlink::config::SwarmFlags;
//! use swarmlink::model::{AgentId, AgentRole, SwarmConfig, CONSTELLATION_TAG};
//! use swarmlink::SwarmAgent;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let id = AgentId::new("SAT-001")?;
//! let config = SwarmConfig::new(id, AgentRole::Primary, CONSTELLATION_TAG, vec![], 10)?;
//! let mut flags = SwarmFlags::from_env();
//! flags.swarm_mode = true;
//!
//! let bus = Arc::new(InMemoryBus::new());
//! let agent = SwarmAgent::new(config, flags, bus);
//! agent.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`model`] - agent identity, health summaries, swarm configuration
//! - [`bus`] - abstract publish-subscribe transport
//! - [`compressor`] - health state codec with versioned wire format
//! - [`governor`] - priority-aware bandwidth admission control
//! - [`registry`] - peer discovery, liveness, heartbeat and gossip
//! - [`broadcaster`] - signed, congestion-adaptive health broadcasting
//! - [`simulator`] - pre-execution cascading-risk validation
//! - [`agent`] - composition root wiring the components together

pub mod agent;
pub mod broadcaster;
pub mod bus;
pub mod compressor;
pub mod config;
pub mod governor;
pub mod model;
pub mod registry;
pub mod simulator;

// Re-export main public types for convenience
pub use agent::SwarmAgent;
pub use compressor::StateCompressor;
pub use governor::BandwidthGovernor;
pub use model::{AgentId, HealthSummary, SwarmConfig};
pub use registry::PeerRegistry;
pub use simulator::SafetySimulator;
