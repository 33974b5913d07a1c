use serde::{Deserialize, Serialize};
use tracing::warn;

const ENV_SWARM_MODE: &str = "SWARMLINK_SWARM_MODE";
const ENV_SCHEMA_VALIDATION: &str = "SWARMLINK_SCHEMA_VALIDATION";
const ENV_ENTROPY_COMPRESSION: &str = "SWARMLINK_ENTROPY_COMPRESSION";
const ENV_MAX_PAYLOAD_BYTES: &str = "SWARMLINK_MAX_PAYLOAD_BYTES";

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024;

/// Process-level feature flags, read once at agent startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmFlags {
    /// Master switch for swarm coordination. Off by default: an agent with
    /// swarm mode disabled starts no background loops.
    pub swarm_mode: bool,
    /// Validate envelope structure and constellation tags on receive.
    pub schema_validation: bool,
    /// Apply the LZ4 entropy stage in the state compressor.
    pub entropy_compression: bool,
    /// Hard cap on a single compressed payload.
    pub max_payload_bytes: usize,
}

impl Default for SwarmFlags {
    fn default() -> Self {
        Self {
            swarm_mode: false,
            schema_validation: true,
            entropy_compression: true,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl SwarmFlags {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            swarm_mode: read_bool(ENV_SWARM_MODE, defaults.swarm_mode),
            schema_validation: read_bool(ENV_SCHEMA_VALIDATION, defaults.schema_validation),
            entropy_compression: read_bool(ENV_ENTROPY_COMPRESSION, defaults.entropy_compression),
            max_payload_bytes: read_usize(ENV_MAX_PAYLOAD_BYTES, defaults.max_payload_bytes),
        }
    }
}

fn read_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!(key, value = other, "unparsable boolean flag, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn read_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(key, value = %raw, "unparsable size flag, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let flags = SwarmFlags::default();
        assert!(!flags.swarm_mode);
        assert!(flags.schema_validation);
        assert!(flags.entropy_compression);
        assert_eq!(flags.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
    }
}
