// tests/codec.rs

use std::collections::{BTreeMap, HashMap};

use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use mom_pipe::{
    // ---
    decode,
    decode_payload,
    enable,
    encode,
    is_enabled,
    tag_of,
    PipeError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Waypoint {
    label: String,
    position: (f64, f64),
    next: Option<Box<Waypoint>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    route: Vec<Waypoint>,
    weights: HashMap<String, u32>,
    note: Option<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Measurement {
    value: f64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Gauge {
    reading: Option<f64>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Ledger {
    total: u128,
    delta: i128,
}

#[derive(Debug, Serialize, Deserialize)]
struct Unregistered {
    seq: u32,
}

fn manifest() -> Manifest {
    // ---
    let tail = Waypoint {
        label: "harbour".into(),
        position: (54.32, 10.14),
        next: None,
    };
    let head = Waypoint {
        label: "depot".into(),
        position: (53.55, 9.99),
        next: Some(Box::new(tail.clone())),
    };

    Manifest {
        route: vec![head, tail],
        weights: HashMap::from([("crate".to_string(), 12), ("pallet".to_string(), 480)]),
        note: None,
    }
}

#[test]
fn nested_shape_survives_the_envelope() {
    // ---
    enable::<Manifest>("codec.it.manifest").unwrap();

    let original = manifest();
    let bytes = encode(&original).unwrap();
    let back: Manifest = decode(&bytes).unwrap();

    assert_eq!(back, original);
    assert!(back.route[0].next.is_some());
    assert!(back.route[1].next.is_none());
}

#[test]
fn envelope_carries_tag_and_body() {
    // ---
    enable::<Ping>("codec.it.ping").unwrap();

    let bytes = encode(&Ping { seq: 3 }).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(json["tag"], "codec.it.ping");
    assert_eq!(json["body"]["seq"], 3);
}

#[test]
fn payload_is_rebuilt_from_tag_alone() {
    // ---
    enable::<Pong>("codec.it.pong").unwrap();

    let bytes = encode(&Pong { seq: 9 }).unwrap();
    let payload = decode_payload(&bytes).unwrap();

    assert_eq!(payload.tag(), "codec.it.pong");
    assert!(payload.is::<Pong>());
    assert!(!payload.is::<Ping>());
    assert_eq!(payload.downcast_ref::<Pong>(), Some(&Pong { seq: 9 }));

    let pong: Pong = payload.into_inner().unwrap();
    assert_eq!(pong.seq, 9);
}

#[test]
fn enable_is_idempotent_and_rejects_conflicts() {
    // ---
    enable::<Vec<u16>>("codec.it.u16s").unwrap();
    enable::<Vec<u16>>("codec.it.u16s").unwrap();

    assert!(is_enabled::<Vec<u16>>());
    assert_eq!(tag_of::<Vec<u16>>().as_deref(), Some("codec.it.u16s"));

    let same_tag_other_type = enable::<Vec<i64>>("codec.it.u16s");
    assert!(matches!(same_tag_other_type, Err(PipeError::Encoding(_))));

    let same_type_other_tag = enable::<Vec<u16>>("codec.it.u16s.again");
    assert!(matches!(same_type_other_tag, Err(PipeError::Encoding(_))));
}

#[test]
fn unregistered_shape_cannot_be_encoded() {
    // ---
    assert!(!is_enabled::<Unregistered>());

    let result = encode(&Unregistered { seq: 1 });
    assert!(matches!(result, Err(PipeError::Encoding(_))));
}

#[test]
fn non_string_map_keys_fail_to_encode() {
    // ---
    enable::<BTreeMap<(u8, u8), u8>>("codec.it.grid").unwrap();

    let grid = BTreeMap::from([((0, 1), 7)]);
    assert!(matches!(encode(&grid), Err(PipeError::Encoding(_))));
}

#[test]
fn mismatched_and_malformed_input_fail_to_decode() {
    // ---
    enable::<Ping>("codec.it.ping").unwrap();
    enable::<Pong>("codec.it.pong").unwrap();

    let ping = encode(&Ping { seq: 1 }).unwrap();
    assert!(matches!(decode::<Pong>(&ping), Err(PipeError::Decoding(_))));

    assert!(matches!(
        decode_payload(b"not json"),
        Err(PipeError::Decoding(_))
    ));
    assert!(matches!(
        decode_payload(br#"{"tag":"codec.it.nobody","body":{}}"#),
        Err(PipeError::Decoding(_))
    ));
    assert!(matches!(
        decode::<Ping>(br#"{"tag":"codec.it.ping","body":{"seq":"one"}}"#),
        Err(PipeError::Decoding(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4096))]

    #[test]
    fn every_finite_f64_keeps_its_bits(bits in any::<u64>()) {
        // ---
        let value = f64::from_bits(bits);
        prop_assume!(value.is_finite());
        enable::<Measurement>("codec.it.measurement").unwrap();

        let bytes = encode(&Measurement { value }).unwrap();
        let back: Measurement = decode(&bytes).unwrap();

        prop_assert_eq!(back.value.to_bits(), value.to_bits());
    }
}

#[test]
fn extreme_floats_keep_their_bits() {
    // ---
    enable::<Measurement>("codec.it.measurement").unwrap();

    let values = [
        1.0715660391465826e-75,
        f64::MIN_POSITIVE,
        f64::from_bits(1),
        f64::MAX,
        f64::MIN,
        -0.0,
        0.1 + 0.2,
    ];

    for value in values {
        let bytes = encode(&Measurement { value }).unwrap();
        let back: Measurement = decode(&bytes).unwrap();
        assert_eq!(back.value.to_bits(), value.to_bits(), "{value:e}");
    }
}

#[test]
fn wide_integers_are_not_narrowed() {
    // ---
    enable::<Ledger>("codec.it.ledger").unwrap();

    let ledger = Ledger {
        total: u128::MAX,
        delta: i128::MIN,
    };
    let bytes = encode(&ledger).unwrap();

    assert_eq!(decode::<Ledger>(&bytes).unwrap(), ledger);
    let payload = decode_payload(&bytes).unwrap();
    assert_eq!(payload.downcast_ref::<Ledger>(), Some(&ledger));
}

#[test]
fn non_finite_floats_are_refused_at_encode() {
    // ---
    enable::<Gauge>("codec.it.gauge").unwrap();

    for reading in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
        let result = encode(&Gauge {
            reading: Some(reading),
        });
        assert!(matches!(result, Err(PipeError::Encoding(_))), "{reading}");
    }

    for gauge in [Gauge { reading: None }, Gauge { reading: Some(-3.25) }] {
        let bytes = encode(&gauge).unwrap();
        assert_eq!(decode::<Gauge>(&bytes).unwrap(), gauge);
    }
}
