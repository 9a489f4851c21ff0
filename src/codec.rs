//! Envelope codec.
//!
//! Payloads travel as a JSON envelope `{"tag": <shape tag>, "body": <value>}`.
//! A shape must be enabled under a stable tag before it can be encoded or
//! decoded; the tag is what lets a delivery loop rebuild a value whose Rust
//! type it has never seen, through the decoder recorded at [`enable`] time.
//!
//! The type registry is process-wide and grow-only: an entry, once added, is
//! never changed or removed.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Reading {
//!     sensor: String,
//!     celsius: f64,
//! }
//!
//! mom_pipe::enable::<Reading>("doc.reading").unwrap();
//!
//! let reading = Reading { sensor: "t1".into(), celsius: 21.5 };
//! let bytes = mom_pipe::encode(&reading).unwrap();
//! let back: Reading = mom_pipe::decode(&bytes).unwrap();
//! assert_eq!(back, reading);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{PipeError, Result};

mod finite;

type DecodeFn = fn(&RawValue) -> Result<Box<dyn Any + Send + Sync>>;

/// How to rebuild one enabled shape.
struct Shape {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

#[derive(Default)]
struct TypeRegistry {
    by_tag: HashMap<Arc<str>, Shape>,
    by_type: HashMap<TypeId, Arc<str>>,
}

static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();

fn registry() -> &'static RwLock<TypeRegistry> {
    REGISTRY.get_or_init(|| RwLock::new(TypeRegistry::default()))
}

// A panic while holding the guard cannot leave a half-written entry behind:
// both maps are only touched by single inserts.
fn read_registry() -> RwLockReadGuard<'static, TypeRegistry> {
    match registry().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_registry() -> RwLockWriteGuard<'static, TypeRegistry> {
    match registry().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    tag: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeOwned {
    tag: String,
    // Kept as raw text so numbers reach the target type unparsed.
    body: Box<RawValue>,
}

fn decode_shape<T>(body: &RawValue) -> Result<Box<dyn Any + Send + Sync>>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    // ---
    let value: T = serde_json::from_str(body.get()).map_err(|err| {
        PipeError::Decoding(format!(
            "body does not match {}: {err}",
            std::any::type_name::<T>()
        ))
    })?;
    Ok(Box::new(value))
}

/// Register shape `T` under `tag`.
///
/// Enabling the same `(T, tag)` pair again is a no-op.
///
/// # Errors
///
/// [`PipeError::Encoding`] if `tag` already names another type, or `T` is
/// already enabled under another tag.
pub fn enable<T>(tag: &str) -> Result<()>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    // ---
    let type_id = TypeId::of::<T>();
    let type_name = std::any::type_name::<T>();
    let mut registry = write_registry();

    if let Some(shape) = registry.by_tag.get(tag) {
        if shape.type_id == type_id {
            return Ok(());
        }
        return Err(PipeError::Encoding(format!(
            "tag {tag} is already enabled for {}",
            shape.type_name
        )));
    }

    if let Some(existing) = registry.by_type.get(&type_id) {
        return Err(PipeError::Encoding(format!(
            "{type_name} is already enabled under tag {existing}"
        )));
    }

    let tag: Arc<str> = Arc::from(tag);
    registry.by_type.insert(type_id, tag.clone());
    registry.by_tag.insert(
        tag,
        Shape {
            type_id,
            type_name,
            decode: decode_shape::<T>,
        },
    );

    Ok(())
}

/// True when `T` has been enabled.
pub fn is_enabled<T: 'static>() -> bool {
    read_registry().by_type.contains_key(&TypeId::of::<T>())
}

/// Tag `T` was enabled under.
pub fn tag_of<T: 'static>() -> Option<Arc<str>> {
    read_registry().by_type.get(&TypeId::of::<T>()).cloned()
}

/// Encode `value` into an envelope.
///
/// # Errors
///
/// [`PipeError::Encoding`] if `T` is not enabled, holds a NaN or infinite
/// float (JSON has no spelling for them), or cannot be serialized (for
/// instance a map with non-string keys).
pub fn encode<T>(value: &T) -> Result<Bytes>
where
    T: Serialize + 'static,
{
    // ---
    let tag = tag_of::<T>().ok_or_else(|| {
        PipeError::Encoding(format!("{} is not enabled", std::any::type_name::<T>()))
    })?;

    finite::check(value).map_err(|err| PipeError::Encoding(format!("{tag}: {err}")))?;

    let envelope = EnvelopeRef {
        tag: &tag,
        body: value,
    };

    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|err| PipeError::Encoding(format!("{tag}: {err}")))
}

fn open_envelope(bytes: &[u8]) -> Result<EnvelopeOwned> {
    serde_json::from_slice(bytes).map_err(|err| PipeError::Decoding(format!("bad envelope: {err}")))
}

/// Decode an envelope into `T`.
///
/// The envelope tag must be the tag `T` was enabled under; a body that
/// merely looks like `T` under another tag is rejected.
///
/// # Errors
///
/// [`PipeError::Decoding`] if `T` is not enabled, the tag differs, or the
/// bytes are not a valid envelope.
pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: DeserializeOwned + 'static,
{
    // ---
    let expected = tag_of::<T>().ok_or_else(|| {
        PipeError::Decoding(format!("{} is not enabled", std::any::type_name::<T>()))
    })?;

    let envelope = open_envelope(bytes)?;
    if envelope.tag != *expected {
        return Err(PipeError::Decoding(format!(
            "expected tag {expected}, found {}",
            envelope.tag
        )));
    }

    serde_json::from_str(envelope.body.get())
        .map_err(|err| PipeError::Decoding(format!("{expected}: {err}")))
}

/// Decode an envelope into whatever enabled shape its tag names.
///
/// # Errors
///
/// [`PipeError::Decoding`] for unknown tags and malformed bytes.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    // ---
    let envelope = open_envelope(bytes)?;

    let (tag, decode) = {
        let registry = read_registry();
        match registry.by_tag.get_key_value(envelope.tag.as_str()) {
            Some((tag, shape)) => (tag.clone(), shape.decode),
            None => {
                return Err(PipeError::Decoding(format!(
                    "unknown tag {}",
                    envelope.tag
                )))
            }
        }
    };

    let value = decode(&envelope.body)?;
    Ok(Payload { tag, value })
}

/// A decoded inbound value of some enabled shape.
pub struct Payload {
    tag: Arc<str>,
    value: Box<dyn Any + Send + Sync>,
}

impl Payload {
    // ---
    /// Tag of the shape the value was decoded as.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the value out as `T`, or get the payload back unchanged.
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Payload> {
        // ---
        let Payload { tag, value } = self;
        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Payload { tag, value }),
        }
    }

    /// Like [`downcast`](Self::downcast), reporting a mismatch as
    /// [`PipeError::Decoding`].
    pub fn into_inner<T: Any>(self) -> Result<T> {
        self.downcast::<T>().map_err(|payload| {
            PipeError::Decoding(format!(
                "payload tagged {} is not a {}",
                payload.tag,
                std::any::type_name::<T>()
            ))
        })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("tag", &self.tag).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Node {
        name: String,
        weights: Vec<u32>,
        next: Option<Box<Node>>,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Never {
        seq: u64,
    }

    #[test]
    fn test_composite_shape_round_trips() {
        // ---
        enable::<Node>("codec.unit.node").unwrap();

        let tail = Node {
            name: "tail".into(),
            weights: vec![],
            next: None,
        };
        let head = Node {
            name: "head".into(),
            weights: vec![1, 2, 3],
            next: Some(Box::new(tail.clone())),
        };

        for node in [tail, head] {
            let bytes = encode(&node).unwrap();
            assert_eq!(decode::<Node>(&bytes).unwrap(), node);
        }
    }

    #[test]
    fn test_envelope_carries_tag_and_body() {
        // ---
        enable::<Ping>("codec.unit.ping").unwrap();

        let bytes = encode(&Ping { seq: 9 }).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["tag"], "codec.unit.ping");
        assert_eq!(json["body"]["seq"], 9);
    }

    #[test]
    fn test_unregistered_shape_fails_both_ways() {
        // ---
        assert!(!is_enabled::<Never>());
        assert!(matches!(
            encode(&Never { seq: 1 }),
            Err(PipeError::Encoding(_))
        ));

        let bytes = br#"{"tag":"codec.unit.never","body":{"seq":1}}"#;
        assert!(matches!(
            decode::<Never>(bytes),
            Err(PipeError::Decoding(_))
        ));
    }

    #[test]
    fn test_mismatched_tag_is_not_coerced() {
        // ---
        enable::<Ping>("codec.unit.ping").unwrap();
        enable::<Pong>("codec.unit.pong").unwrap();

        // Same JSON structure, different shape.
        let bytes = encode(&Ping { seq: 4 }).unwrap();
        assert!(matches!(
            decode::<Pong>(&bytes),
            Err(PipeError::Decoding(_))
        ));
    }

    #[test]
    fn test_truncated_bytes_fail() {
        // ---
        enable::<Ping>("codec.unit.ping").unwrap();

        let bytes = encode(&Ping { seq: 77 }).unwrap();
        let truncated = &bytes[..bytes.len() / 2];

        assert!(matches!(
            decode::<Ping>(truncated),
            Err(PipeError::Decoding(_))
        ));
        assert!(matches!(
            decode_payload(truncated),
            Err(PipeError::Decoding(_))
        ));
    }

    #[test]
    fn test_enable_is_idempotent_and_rejects_conflicts() {
        // ---
        #[derive(Serialize, Deserialize)]
        struct First;
        #[derive(Serialize, Deserialize)]
        struct Second;

        enable::<First>("codec.unit.first").unwrap();
        enable::<First>("codec.unit.first").unwrap();

        assert!(matches!(
            enable::<Second>("codec.unit.first"),
            Err(PipeError::Encoding(_))
        ));
        assert!(matches!(
            enable::<First>("codec.unit.first-again"),
            Err(PipeError::Encoding(_))
        ));
        assert_eq!(tag_of::<First>().as_deref(), Some("codec.unit.first"));
    }

    #[test]
    fn test_decode_payload_rebuilds_registered_shape() {
        // ---
        enable::<Pong>("codec.unit.pong").unwrap();

        let bytes = encode(&Pong { seq: 12 }).unwrap();
        let payload = decode_payload(&bytes).unwrap();

        assert_eq!(payload.tag(), "codec.unit.pong");
        assert!(payload.is::<Pong>());
        assert!(!payload.is::<Ping>());
        assert_eq!(payload.downcast_ref::<Pong>(), Some(&Pong { seq: 12 }));

        let payload = payload.downcast::<Ping>().unwrap_err();
        assert_eq!(payload.into_inner::<Pong>().unwrap(), Pong { seq: 12 });
    }

    #[test]
    fn test_into_inner_reports_mismatch() {
        // ---
        enable::<Pong>("codec.unit.pong").unwrap();

        let payload = decode_payload(&encode(&Pong { seq: 1 }).unwrap()).unwrap();
        assert!(matches!(
            payload.into_inner::<String>(),
            Err(PipeError::Decoding(_))
        ));
    }

    #[test]
    fn test_unknown_tag_fails() {
        // ---
        let bytes = br#"{"tag":"codec.unit.nobody","body":null}"#;
        assert!(matches!(
            decode_payload(bytes),
            Err(PipeError::Decoding(_))
        ));
    }

    #[test]
    fn test_non_string_map_keys_fail_to_encode() {
        // ---
        enable::<BTreeMap<Vec<u8>, u8>>("codec.unit.byte-map").unwrap();

        let mut map = BTreeMap::new();
        map.insert(vec![1u8, 2], 3u8);

        assert!(matches!(encode(&map), Err(PipeError::Encoding(_))));
    }
}
