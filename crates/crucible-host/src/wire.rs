//! The wire `Any` algebra and its mapping onto script values.
//!
//! `AnyValue` is a tagged envelope: `{"type": "int32", "value": 5}`,
//! `{"type": "struct", "value": {...}}`, `{"type": "null"}`. Unknown tags
//! fail deserialization and surface as invalid parameters. Byte payloads
//! travel base64-encoded.

use base64::prelude::*;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crucible_lang::HostValue;

mod base64_bytes {
    use super::*;
    use serde::Deserializer;

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnyValue {
    String(String),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Struct(IndexMap<String, AnyValue>),
    Null,
}

/// Wire to script: scalars pass through, structs become string-keyed maps.
pub fn any_to_host(any: &AnyValue) -> Result<HostValue, HostError> {
    Ok(match any {
        AnyValue::String(s) => HostValue::Str(s.clone()),
        AnyValue::Bool(b) => HostValue::Bool(*b),
        AnyValue::Int32(i) => HostValue::Int(*i as i64),
        AnyValue::Int64(i) => HostValue::Int(*i),
        AnyValue::Uint32(u) => HostValue::Int(*u as i64),
        AnyValue::Uint64(u) => {
            let i = i64::try_from(*u).map_err(|_| {
                HostError::InvalidParam(format!("uint64 argument {u} exceeds the script range"))
            })?;
            HostValue::Int(i)
        }
        AnyValue::Float32(f) => HostValue::Float(*f as f64),
        AnyValue::Float64(f) => HostValue::Float(*f),
        AnyValue::Bytes(b) => HostValue::Bytes(b.clone()),
        AnyValue::Struct(entries) => {
            let mut map = IndexMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), any_to_host(value)?);
            }
            HostValue::Map(map)
        }
        AnyValue::Null => HostValue::Nil,
    })
}

/// Script to wire: integers shrink to int32 when they fit, floats widen to
/// float64, nil becomes null.
pub fn host_to_any(value: &HostValue) -> AnyValue {
    match value {
        HostValue::Nil => AnyValue::Null,
        HostValue::Bool(b) => AnyValue::Bool(*b),
        HostValue::Int(i) => match i32::try_from(*i) {
            Ok(small) => AnyValue::Int32(small),
            Err(_) => AnyValue::Int64(*i),
        },
        HostValue::Float(f) => AnyValue::Float64(*f),
        HostValue::Str(s) => AnyValue::String(s.clone()),
        HostValue::Bytes(b) => AnyValue::Bytes(b.clone()),
        HostValue::Map(entries) => AnyValue::Struct(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), host_to_any(v)))
                .collect(),
        ),
    }
}

pub fn args_to_host(args: &[AnyValue]) -> Result<Vec<HostValue>, HostError> {
    args.iter().map(any_to_host).collect()
}

pub fn host_to_args(values: &[HostValue]) -> Vec<AnyValue> {
    values.iter().map(host_to_any).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_json_shape() {
        let json = serde_json::to_value(AnyValue::Int32(5)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "int32", "value": 5}));
        let json = serde_json::to_value(AnyValue::Null).unwrap();
        assert_eq!(json, serde_json::json!({"type": "null"}));
    }

    #[test]
    fn unknown_tags_fail_deserialization() {
        let result: Result<AnyValue, _> =
            serde_json::from_value(serde_json::json!({"type": "complex", "value": 1}));
        assert!(result.is_err());
    }

    #[test]
    fn bytes_travel_as_base64() {
        let json = serde_json::to_value(AnyValue::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(json["value"], "AQID");
        let back: AnyValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, AnyValue::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn integers_shrink_when_they_fit() {
        assert_eq!(host_to_any(&HostValue::Int(7)), AnyValue::Int32(7));
        assert_eq!(
            host_to_any(&HostValue::Int(i64::MAX)),
            AnyValue::Int64(i64::MAX)
        );
        assert_eq!(
            host_to_any(&HostValue::Float(1.5)),
            AnyValue::Float64(1.5)
        );
    }

    #[test]
    fn uint64_overflow_is_invalid_param() {
        let err = any_to_host(&AnyValue::Uint64(u64::MAX)).unwrap_err();
        assert_eq!(err.code(), "invalid_param");
        assert_eq!(
            any_to_host(&AnyValue::Uint64(42)).unwrap(),
            HostValue::Int(42)
        );
    }

    #[test]
    fn structs_map_both_ways() {
        let mut entries = IndexMap::new();
        entries.insert("n".to_string(), AnyValue::Int32(1));
        entries.insert(
            "inner".to_string(),
            AnyValue::Struct(IndexMap::from_iter([(
                "flag".to_string(),
                AnyValue::Bool(true),
            )])),
        );
        let host = any_to_host(&AnyValue::Struct(entries.clone())).unwrap();
        let HostValue::Map(map) = &host else {
            panic!("expected map");
        };
        assert_eq!(map.get("n"), Some(&HostValue::Int(1)));
        assert_eq!(host_to_any(&host), AnyValue::Struct(entries));
    }

    #[test]
    fn nil_round_trips_to_null() {
        assert_eq!(host_to_any(&HostValue::Nil), AnyValue::Null);
        assert_eq!(any_to_host(&AnyValue::Null).unwrap(), HostValue::Nil);
    }
}
