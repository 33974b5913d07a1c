use swarmlink::bus::now_millis;
use swarmlink::compressor::{CompressError, StateCompressor, COMPRESSION_VERSION, WIRE_HEADER_LEN};
use swarmlink::model::{HealthSummary, SIGNATURE_LEN};

/// Raw per-message footprint the codec is measured against: 32 signature
/// floats, two scalars, timestamp, size field.
const RAW_MESSAGE_BYTES: usize = SIGNATURE_LEN * 4 + 4 + 4 + 8 + 2;

fn summary(signature: [f32; SIGNATURE_LEN], risk: f32, recurrence: f32) -> HealthSummary {
    HealthSummary::new(signature, risk, recurrence, now_millis()).unwrap()
}

fn ramp_signature() -> [f32; SIGNATURE_LEN] {
    let mut signature = [0.0f32; SIGNATURE_LEN];
    for (i, v) in signature.iter_mut().enumerate() {
        *v = (i as f32 / SIGNATURE_LEN as f32) * 2.0 - 1.0;
    }
    signature
}

#[test]
fn test_roundtrip_within_quantization_bound() {
    let mut encoder = StateCompressor::new(true);
    let mut decoder = StateCompressor::new(true);

    let original = summary(ramp_signature(), 0.42, 7.5);
    let decoded = decoder.decode(&encoder.encode(&original).unwrap()).unwrap();

    // Scalars are carried raw and must survive exactly, not quantized.
    assert_eq!(decoded.risk_score, 0.42);
    assert_eq!(decoded.recurrence_score, 7.5);
    for i in 0..SIGNATURE_LEN {
        let err = (decoded.anomaly_signature[i] - original.anomaly_signature[i]).abs();
        assert!(err <= 2.0 / 255.0, "component {} error {}", i, err);
    }
}

#[test]
fn test_thirty_message_stream_stays_under_budget() {
    let mut encoder = StateCompressor::new(true);
    let mut decoder = StateCompressor::new(true);

    let mut signature = ramp_signature();
    // Scale into a gentle band so deltas stay well inside the quantizer range.
    for v in signature.iter_mut() {
        *v *= 0.4;
    }

    let mut aggregate = 0usize;
    for _ in 0..30 {
        for v in signature.iter_mut() {
            *v += 0.001;
        }
        let wire = encoder.encode(&summary(signature, 0.2, 1.0)).unwrap();
        aggregate += wire.len();
        decoder.decode(&wire).unwrap();
    }

    let raw_baseline = 30 * RAW_MESSAGE_BYTES;
    assert!(raw_baseline >= 4200, "baseline sanity: {}", raw_baseline);
    assert!(
        aggregate < 800,
        "aggregate {} bytes for 30 messages exceeds 800-byte budget",
        aggregate
    );
    let reduction = 1.0 - aggregate as f64 / raw_baseline as f64;
    assert!(reduction >= 0.80, "reduction {:.3} below expectation", reduction);
    assert!(encoder.stats().reduction() >= 0.80);
}

#[test]
fn test_unknown_version_is_a_protocol_error() {
    let mut encoder = StateCompressor::new(true);
    let mut decoder = StateCompressor::new(true);
    let mut wire = encoder.encode(&summary([0.0; SIGNATURE_LEN], 0.0, 0.0)).unwrap();

    assert_eq!(wire[0], COMPRESSION_VERSION);
    wire[0] = 99;
    match decoder.decode(&wire) {
        Err(CompressError::UnsupportedVersion(99)) => {}
        other => panic!("expected version error, got {:?}", other),
    }
}

#[test]
fn test_truncated_payload_is_a_protocol_error() {
    let mut decoder = StateCompressor::new(true);
    for len in 0..6 {
        let buf = vec![COMPRESSION_VERSION; len];
        assert!(
            matches!(decoder.decode(&buf), Err(CompressError::Truncated(_))),
            "len {} should be truncated",
            len
        );
    }
}

#[test]
fn test_corrupt_entropy_frame_fails_explicitly() {
    let mut decoder = StateCompressor::new(true);
    // Claims the entropy stage but carries garbage.
    let mut wire = vec![COMPRESSION_VERSION, 0b0000_0001, 40, 0];
    wire.extend_from_slice(&[0xFF; 8]);
    assert!(decoder.decode(&wire).is_err());
}

#[test]
fn test_interop_without_entropy_stage() {
    // A sender with the entropy stage disabled must still be readable by any
    // receiver; the flags byte alone drives the reverse pipeline.
    let mut encoder = StateCompressor::new(false);
    let mut decoder = StateCompressor::new(true);

    let original = summary(ramp_signature(), 0.9, 3.0);
    let wire = encoder.encode(&original).unwrap();
    assert_eq!(wire.len(), WIRE_HEADER_LEN + 40);

    let decoded = decoder.decode(&wire).unwrap();
    assert_eq!(decoded.risk_score, 0.9);
}

#[test]
fn test_decoder_stamps_receipt_time_and_size() {
    let mut encoder = StateCompressor::new(true);
    let mut decoder = StateCompressor::new(true);

    let mut original = summary([0.25; SIGNATURE_LEN], 0.1, 0.5);
    original.timestamp = 7;

    let before = now_millis();
    let wire = encoder.encode(&original).unwrap();
    let decoded = decoder.decode(&wire).unwrap();

    assert!(decoded.timestamp >= before, "timestamp must be receiver-local");
    assert_eq!(decoded.compressed_size as usize, wire.len());
}

#[test]
fn test_reset_stream_returns_to_absolute_mode() {
    let mut encoder = StateCompressor::new(true);
    let mut decoder = StateCompressor::new(true);

    let first = summary([0.5; SIGNATURE_LEN], 0.1, 0.1);
    decoder.decode(&encoder.encode(&first).unwrap()).unwrap();

    encoder.reset_stream();
    decoder.reset_stream();

    let second = summary([-0.5; SIGNATURE_LEN], 0.2, 0.2);
    let decoded = decoder.decode(&encoder.encode(&second).unwrap()).unwrap();
    for v in decoded.anomaly_signature {
        assert!((v + 0.5).abs() <= 2.0 / 255.0);
    }
}
