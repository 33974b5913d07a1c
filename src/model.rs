use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Protocol family tag. Agents refusing this tag are running a different
/// (incompatible) coordination protocol and must not be registered.
pub const CONSTELLATION_TAG: &str = "swarmlink-v1";

pub const MAX_TAG_LEN: usize = 16;
pub const MAX_SERIAL_LEN: usize = 32;

/// Length of the anomaly signature vector carried in every health summary.
pub const SIGNATURE_LEN: usize = 32;

/// Upper bound on a compressed health payload.
pub const MAX_COMPRESSED_SIZE: u16 = 1024;

pub type ConstellationTag = ArrayString<MAX_TAG_LEN>;
pub type SatelliteSerial = ArrayString<MAX_SERIAL_LEN>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("unsupported constellation tag: {0}")]
    UnsupportedConstellation(String),
    #[error("satellite serial must be non-empty")]
    EmptySerial,
    #[error("satellite serial exceeds {MAX_SERIAL_LEN} bytes")]
    SerialTooLong,
    #[error("{field} {value} outside valid range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
    #[error("compressed size {0} exceeds {MAX_COMPRESSED_SIZE} byte limit")]
    CompressedSizeTooLarge(u16),
    #[error("constellation id {config} does not match agent id {agent}")]
    ConstellationMismatch { config: String, agent: String },
    #[error("bandwidth limit must be positive")]
    ZeroBandwidth,
}

/// Immutable satellite identity. Two processes derive the same `uuid` for the
/// same serial without coordination (name-based UUIDv5 over
/// `constellation:serial`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId {
    constellation: ConstellationTag,
    satellite_serial: SatelliteSerial,
    uuid: Uuid,
}

impl AgentId {
    pub fn new(serial: &str) -> Result<Self, ModelError> {
        Self::with_constellation(CONSTELLATION_TAG, serial)
    }

    pub fn with_constellation(tag: &str, serial: &str) -> Result<Self, ModelError> {
        if tag != CONSTELLATION_TAG {
            return Err(ModelError::UnsupportedConstellation(tag.into()));
        }
        if serial.is_empty() {
            return Err(ModelError::EmptySerial);
        }
        let constellation =
            ConstellationTag::from(tag).map_err(|_| ModelError::UnsupportedConstellation(tag.into()))?;
        let satellite_serial =
            SatelliteSerial::from(serial).map_err(|_| ModelError::SerialTooLong)?;

        let name = format!("{}:{}", tag, serial);
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());

        Ok(Self {
            constellation,
            satellite_serial,
            uuid,
        })
    }

    pub fn constellation(&self) -> &str {
        &self.constellation
    }

    pub fn serial(&self) -> &str {
        &self.satellite_serial
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Fixed-form identifier used in signed envelopes (32 hex chars).
    pub fn uuid_hex(&self) -> String {
        self.uuid.simple().to_string()
    }
}

impl core::fmt::Display for AgentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.constellation, self.satellite_serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentRole {
    Primary,
    Backup,
    Standby,
    SafeMode,
}

/// Bounded health snapshot exchanged over the inter-satellite link.
///
/// Violating any bound is a construction error, never a silent clamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub anomaly_signature: [f32; SIGNATURE_LEN],
    pub risk_score: f32,
    pub recurrence_score: f32,
    pub timestamp: u64,
    pub compressed_size: u16,
}

impl HealthSummary {
    pub fn new(
        anomaly_signature: [f32; SIGNATURE_LEN],
        risk_score: f32,
        recurrence_score: f32,
        timestamp: u64,
    ) -> Result<Self, ModelError> {
        if !(0.0..=1.0).contains(&risk_score) || risk_score.is_nan() {
            return Err(ModelError::OutOfRange {
                field: "risk_score",
                value: risk_score,
                min: 0.0,
                max: 1.0,
            });
        }
        if !(0.0..=10.0).contains(&recurrence_score) || recurrence_score.is_nan() {
            return Err(ModelError::OutOfRange {
                field: "recurrence_score",
                value: recurrence_score,
                min: 0.0,
                max: 10.0,
            });
        }
        Ok(Self {
            anomaly_signature,
            risk_score,
            recurrence_score,
            timestamp,
            compressed_size: 0,
        })
    }

    /// Neutral baseline used before the host supplies a real reading.
    pub fn baseline(timestamp: u64) -> Self {
        Self {
            anomaly_signature: [0.0; SIGNATURE_LEN],
            risk_score: 0.0,
            recurrence_score: 0.0,
            timestamp,
            compressed_size: 0,
        }
    }

    pub fn set_compressed_size(&mut self, size: u16) -> Result<(), ModelError> {
        if size > MAX_COMPRESSED_SIZE {
            return Err(ModelError::CompressedSizeTooLarge(size));
        }
        self.compressed_size = size;
        Ok(())
    }
}

/// Per-agent static configuration, created once at startup. Only the role
/// changes afterwards, driven by the external role-reassignment process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    agent_id: AgentId,
    role: AgentRole,
    constellation_id: String,
    peers: Vec<AgentId>,
    bandwidth_limit_kbps: u32,
}

impl SwarmConfig {
    pub fn new(
        agent_id: AgentId,
        role: AgentRole,
        constellation_id: &str,
        peers: Vec<AgentId>,
        bandwidth_limit_kbps: u32,
    ) -> Result<Self, ModelError> {
        if constellation_id != agent_id.constellation() {
            return Err(ModelError::ConstellationMismatch {
                config: constellation_id.into(),
                agent: agent_id.constellation().into(),
            });
        }
        if bandwidth_limit_kbps == 0 {
            return Err(ModelError::ZeroBandwidth);
        }
        Ok(Self {
            agent_id,
            role,
            constellation_id: constellation_id.into(),
            peers,
            bandwidth_limit_kbps,
        })
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// Role transitions come from the external reassignment process.
    pub fn set_role(&mut self, role: AgentRole) {
        self.role = role;
    }

    pub fn constellation_id(&self) -> &str {
        &self.constellation_id
    }

    pub fn peers(&self) -> &[AgentId] {
        &self.peers
    }

    pub fn bandwidth_limit_kbps(&self) -> u32 {
        self.bandwidth_limit_kbps
    }
}
