use crate::bus::now_millis;
use crate::config::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::model::{HealthSummary, SIGNATURE_LEN};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Wire format version. Decoders reject anything else outright.
pub const COMPRESSION_VERSION: u8 = 1;

/// Bit 0 of the flags byte: LZ4 entropy stage applied to the payload.
const FLAG_ENTROPY: u8 = 0b0000_0001;

/// `[version:u8][flags:u8][original_size:u16-LE]`
pub const WIRE_HEADER_LEN: usize = 4;

/// Two raw f32 scalars followed by one quantized byte per signature component.
const QUANTIZED_LEN: usize = 8 + SIGNATURE_LEN;

/// Anything shorter cannot carry a complete header plus payload start.
const MIN_WIRE_LEN: usize = 6;

/// Raw in-memory size of a summary: 32 signature floats, two scalar floats,
/// timestamp, compressed-size field. Baseline for compression ratio stats.
const RAW_SUMMARY_LEN: usize = SIGNATURE_LEN * 4 + 4 + 4 + 8 + 2;

const_assert_eq!(QUANTIZED_LEN, 40);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressError {
    #[error("truncated payload: {0} bytes, need at least {MIN_WIRE_LEN}")]
    Truncated(usize),
    #[error("unsupported compression version {0}")]
    UnsupportedVersion(u8),
    #[error("entropy stage failed: {0}")]
    Entropy(String),
    #[error("decoded payload is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("encoded payload {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CompressionStats {
    pub messages_encoded: u64,
    pub messages_decoded: u64,
    pub bytes_raw: u64,
    pub bytes_wire: u64,
    pub entropy_skipped: u64,
}

impl CompressionStats {
    /// Fraction of raw bytes eliminated on the wire.
    pub fn reduction(&self) -> f64 {
        if self.bytes_raw == 0 {
            return 0.0;
        }
        1.0 - self.bytes_wire as f64 / self.bytes_raw as f64
    }
}

/// Delta + quantization + LZ4 codec for health summaries.
///
/// Each instance owns exactly one previous-signature slot and therefore
/// serves exactly one logical peer stream: one encoder for outbound traffic,
/// one decoder per inbound peer. Sharing an instance across streams corrupts
/// the delta chain.
#[derive(Debug)]
pub struct StateCompressor {
    previous_signature: Option<[f32; SIGNATURE_LEN]>,
    entropy_enabled: bool,
    max_payload_bytes: usize,
    stats: CompressionStats,
}

impl StateCompressor {
    pub fn new(entropy_enabled: bool) -> Self {
        Self {
            previous_signature: None,
            entropy_enabled,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            stats: CompressionStats::default(),
        }
    }

    pub fn with_max_payload(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Drop the previous-signature slot; the next message is sent absolute.
    pub fn reset_stream(&mut self) {
        self.previous_signature = None;
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    pub fn encode(&mut self, summary: &HealthSummary) -> Result<Vec<u8>, CompressError> {
        let mut quantized = Vec::with_capacity(QUANTIZED_LEN);
        quantized.extend_from_slice(&summary.risk_score.to_le_bytes());
        quantized.extend_from_slice(&summary.recurrence_score.to_le_bytes());

        match &self.previous_signature {
            None => {
                for v in &summary.anomaly_signature {
                    quantized.push(quantize(*v));
                }
            }
            Some(prev) => {
                for (i, v) in summary.anomaly_signature.iter().enumerate() {
                    quantized.push(quantize(v - prev[i]));
                }
            }
        }

        let mut flags = 0u8;
        let payload = if self.entropy_enabled {
            let compressed = lz4_flex::compress(&quantized);
            if compressed.len() < quantized.len() {
                flags |= FLAG_ENTROPY;
                compressed
            } else {
                self.stats.entropy_skipped += 1;
                quantized
            }
        } else {
            quantized
        };

        let mut wire = Vec::with_capacity(WIRE_HEADER_LEN + payload.len());
        wire.push(COMPRESSION_VERSION);
        wire.push(flags);
        wire.extend_from_slice(&(QUANTIZED_LEN as u16).to_le_bytes());
        wire.extend_from_slice(&payload);

        if wire.len() > self.max_payload_bytes {
            return Err(CompressError::PayloadTooLarge {
                size: wire.len(),
                limit: self.max_payload_bytes,
            });
        }

        // Stream state advances only once the message is actually produced.
        self.previous_signature = Some(summary.anomaly_signature);
        self.stats.messages_encoded += 1;
        self.stats.bytes_raw += RAW_SUMMARY_LEN as u64;
        self.stats.bytes_wire += wire.len() as u64;

        Ok(wire)
    }

    /// Decode a wire payload. The timestamp is stamped with the receiver's
    /// own receipt time; it is never carried across the link.
    pub fn decode(&mut self, buf: &[u8]) -> Result<HealthSummary, CompressError> {
        if buf.len() < MIN_WIRE_LEN {
            return Err(CompressError::Truncated(buf.len()));
        }
        let version = buf[0];
        if version != COMPRESSION_VERSION {
            return Err(CompressError::UnsupportedVersion(version));
        }
        let flags = buf[1];
        let original_size = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let body = &buf[WIRE_HEADER_LEN..];

        let quantized = if flags & FLAG_ENTROPY != 0 {
            lz4_flex::decompress(body, original_size)
                .map_err(|e| CompressError::Entropy(e.to_string()))?
        } else {
            body.to_vec()
        };
        if quantized.len() != QUANTIZED_LEN {
            return Err(CompressError::LengthMismatch {
                expected: QUANTIZED_LEN,
                actual: quantized.len(),
            });
        }

        let risk_score = read_f32(&quantized[0..4]);
        let recurrence_score = read_f32(&quantized[4..8]);

        let mut signature = [0.0f32; SIGNATURE_LEN];
        match &self.previous_signature {
            None => {
                for (i, slot) in signature.iter_mut().enumerate() {
                    *slot = dequantize(quantized[8 + i]);
                }
            }
            Some(prev) => {
                for (i, slot) in signature.iter_mut().enumerate() {
                    *slot = prev[i] + dequantize(quantized[8 + i]);
                }
            }
        }

        self.previous_signature = Some(signature);
        self.stats.messages_decoded += 1;

        Ok(HealthSummary {
            anomaly_signature: signature,
            risk_score,
            recurrence_score,
            timestamp: now_millis(),
            compressed_size: buf.len().min(u16::MAX as usize) as u16,
        })
    }
}

/// Affine map from the clamped range [-1, 1] onto a full unsigned byte.
fn quantize(x: f32) -> u8 {
    ((x.clamp(-1.0, 1.0) + 1.0) / 2.0 * 255.0).round() as u8
}

fn dequantize(b: u8) -> f32 {
    (b as f32 / 255.0) * 2.0 - 1.0
}

fn read_f32(bytes: &[u8]) -> f32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    f32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HealthSummary;

    fn summary(signature: [f32; SIGNATURE_LEN], risk: f32, recurrence: f32) -> HealthSummary {
        HealthSummary::new(signature, risk, recurrence, 42).unwrap()
    }

    #[test]
    fn test_quantize_bounds() {
        assert_eq!(quantize(-1.0), 0);
        assert_eq!(quantize(1.0), 255);
        assert_eq!(quantize(-5.0), 0);
        assert_eq!(quantize(5.0), 255);
        assert!((dequantize(quantize(0.25)) - 0.25).abs() <= 2.0 / 255.0);
    }

    #[test]
    fn test_first_message_roundtrip() {
        let mut enc = StateCompressor::new(true);
        let mut dec = StateCompressor::new(true);

        let mut sig = [0.0f32; SIGNATURE_LEN];
        for (i, v) in sig.iter_mut().enumerate() {
            *v = (i as f32 / SIGNATURE_LEN as f32) * 2.0 - 1.0;
        }
        let original = summary(sig, 0.73, 4.25);
        let wire = enc.encode(&original).unwrap();
        let decoded = dec.decode(&wire).unwrap();

        // Scalars travel as raw floats and survive exactly.
        assert_eq!(decoded.risk_score, 0.73);
        assert_eq!(decoded.recurrence_score, 4.25);
        for i in 0..SIGNATURE_LEN {
            assert!(
                (decoded.anomaly_signature[i] - sig[i]).abs() <= 2.0 / 255.0,
                "component {} drifted: {} vs {}",
                i,
                decoded.anomaly_signature[i],
                sig[i]
            );
        }
    }

    #[test]
    fn test_delta_stream_roundtrip() {
        let mut enc = StateCompressor::new(true);
        let mut dec = StateCompressor::new(true);

        let mut sig = [0.1f32; SIGNATURE_LEN];
        for step in 0..5 {
            for v in sig.iter_mut() {
                *v += 0.01;
            }
            let original = summary(sig, 0.2, 1.0);
            let wire = enc.encode(&original).unwrap();
            let decoded = dec.decode(&wire).unwrap();
            for i in 0..SIGNATURE_LEN {
                assert!(
                    (decoded.anomaly_signature[i] - sig[i]).abs() <= 0.05,
                    "step {} component {} drifted",
                    step,
                    i
                );
            }
        }
    }

    #[test]
    fn test_receiver_stamps_own_time() {
        let mut enc = StateCompressor::new(true);
        let mut dec = StateCompressor::new(true);
        let original = summary([0.0; SIGNATURE_LEN], 0.0, 0.0);
        assert_eq!(original.timestamp, 42);

        let before = now_millis();
        let decoded = dec.decode(&enc.encode(&original).unwrap()).unwrap();
        assert!(decoded.timestamp >= before);
        assert_ne!(decoded.timestamp, 42);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let mut dec = StateCompressor::new(true);
        assert!(matches!(
            dec.decode(&[1, 0, 40]),
            Err(CompressError::Truncated(3))
        ));

        let mut enc = StateCompressor::new(true);
        let mut wire = enc.encode(&summary([0.0; SIGNATURE_LEN], 0.0, 0.0)).unwrap();
        wire[0] = 2;
        assert!(matches!(
            dec.decode(&wire),
            Err(CompressError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_entropy_disabled_never_sets_flag() {
        let mut enc = StateCompressor::new(false);
        let wire = enc.encode(&summary([0.0; SIGNATURE_LEN], 0.5, 0.5)).unwrap();
        assert_eq!(wire[1] & FLAG_ENTROPY, 0);
        assert_eq!(wire.len(), WIRE_HEADER_LEN + QUANTIZED_LEN);
    }

    #[test]
    fn test_payload_size_limit() {
        let mut enc = StateCompressor::new(false).with_max_payload(10);
        let err = enc.encode(&summary([0.0; SIGNATURE_LEN], 0.0, 0.0));
        assert!(matches!(err, Err(CompressError::PayloadTooLarge { .. })));
        // State must not advance on a failed encode.
        assert_eq!(enc.stats().messages_encoded, 0);
    }
}
