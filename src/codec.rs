//! Message envelope and codec.
//!
//! Envelopes are serialized to MessagePack with field names, which keeps
//! binary blobs, integer/float distinctions, and extension values intact
//! where plain JSON would flatten them. Every instance of a bus must use
//! this codec; a record another codec wrote decodes as an error and is
//! acked to avoid a poison-pill stall.

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Delivery discipline for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    /// Every live instance delivers once.
    Broadcast,
    /// Exactly one named target instance delivers.
    Unicast,
    /// Exactly one arbitrary live subscribed instance delivers.
    Anycast,
}

/// The record stored in a stream: one `message` field holding this, encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Delivery discipline the publisher chose.
    pub mode: DeliveryMode,
    /// Target instance id; present iff `mode` is unicast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Topic string chosen by the caller.
    pub event: String,
    /// User payload.
    pub data: Value,
    /// Milliseconds since epoch at publish.
    pub timestamp: i64,
    /// Publishing instance's id; never rewritten.
    pub source: String,
}

impl Envelope {
    /// Deserialize the payload into a concrete type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmpv::ext::from_value(self.data.clone())?)
    }
}

/// Encode an envelope into the bytes stored in the stream's `message` field.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(envelope)?)
}

/// Decode the `message` field back into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Wall-clock milliseconds since epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(mode: DeliveryMode, target: Option<&str>, data: Value) -> Envelope {
        Envelope {
            mode,
            target: target.map(str::to_string),
            event: "orders.created".to_string(),
            data,
            timestamp: 1_700_000_000_000,
            source: "a1b2c3".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let original = envelope(
            DeliveryMode::Broadcast,
            None,
            Value::Map(vec![(Value::from("v"), Value::from(1))]),
        );

        let bytes = encode(&original).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_preserves_binary() {
        let blob = vec![0u8, 159, 146, 150, 255];
        let original = envelope(
            DeliveryMode::Anycast,
            None,
            Value::Binary(blob.clone()),
        );

        let decoded = decode(&encode(&original).unwrap()).unwrap();

        assert_eq!(decoded.data, Value::Binary(blob));
    }

    #[test]
    fn test_round_trip_preserves_scalar_types() {
        let data = Value::Map(vec![
            (Value::from("int"), Value::from(-42i64)),
            (Value::from("float"), Value::from(2.5f64)),
            (Value::from("big"), Value::from(u64::MAX)),
        ]);
        let original = envelope(DeliveryMode::Unicast, Some("deadbeef"), data.clone());

        let decoded = decode(&encode(&original).unwrap()).unwrap();

        assert_eq!(decoded.data, data);
        assert_eq!(decoded.target.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_mode_tags_are_screaming_case() {
        let bytes = encode(&envelope(DeliveryMode::Anycast, None, Value::Nil)).unwrap();
        let as_value: Value = rmp_serde::from_slice(&bytes).unwrap();
        let fields: Vec<(String, Value)> = as_value
            .as_map()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.as_str().unwrap().to_string(), v.clone()))
            .collect();

        let mode = fields.iter().find(|(k, _)| k == "mode").unwrap();
        assert_eq!(mode.1.as_str(), Some("ANYCAST"));
    }

    #[test]
    fn test_target_omitted_unless_unicast() {
        let bytes = encode(&envelope(DeliveryMode::Broadcast, None, Value::Nil)).unwrap();
        let as_value: Value = rmp_serde::from_slice(&bytes).unwrap();
        let has_target = as_value
            .as_map()
            .unwrap()
            .iter()
            .any(|(k, _)| k.as_str() == Some("target"));

        assert!(!has_target);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"not msgpack at all").is_err());
    }

    #[test]
    fn test_byte_buffers_convert_to_binary() {
        let value = rmpv::ext::to_value(serde_bytes::ByteBuf::from(vec![1u8, 2, 3])).unwrap();
        assert_eq!(value, Value::Binary(vec![1, 2, 3]));

        let env = envelope(DeliveryMode::Broadcast, None, value);
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        let bytes: serde_bytes::ByteBuf = decoded.payload().unwrap();
        assert_eq!(bytes.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_typed_payload_accessor() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Order {
            sku: String,
            qty: u32,
        }

        let order = Order {
            sku: "X-99".to_string(),
            qty: 3,
        };
        let env = envelope(
            DeliveryMode::Broadcast,
            None,
            rmpv::ext::to_value(&order).unwrap(),
        );

        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.payload::<Order>().unwrap(), order);
    }
}
