//! Codecs converting a [`StateMap`] to and from durable bytes.
//!
//! Every record stores the tag of the codec that wrote it, so a reader
//! always decodes with [`codec_for_tag`] regardless of its own configured
//! codec. Writers use the codec configured for their binding.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StateError};
use crate::value::{Key, StateMap, Value};

/// Upper bound on an encoded payload.
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

/// Encode/decode pair identified by a stable tag.
pub trait Codec: Send + Sync {
    /// Tag persisted alongside every record this codec writes.
    fn tag(&self) -> &'static str;

    /// Encode a state map. Fails with `UnsupportedValue` if the map holds a
    /// shape this codec cannot represent.
    fn encode(&self, state: &StateMap) -> Result<Vec<u8>>;

    /// Decode bytes written by this codec. Fails with `CorruptPayload`.
    fn decode(&self, bytes: &[u8]) -> Result<StateMap>;
}

/// Compact binary codec. Represents every [`Value`] shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub const TAG: &'static str = "bincode";

    fn options() -> impl Options {
        bincode::DefaultOptions::new().with_limit(MAX_PAYLOAD_LEN)
    }
}

impl Codec for BincodeCodec {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn encode(&self, state: &StateMap) -> Result<Vec<u8>> {
        Self::options()
            .serialize(state)
            .map_err(|e| StateError::UnsupportedValue(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<StateMap> {
        Self::options()
            .deserialize(bytes)
            .map_err(|e| StateError::CorruptPayload(format!("bincode: {e}")))
    }
}

/// Human-readable JSON codec.
///
/// Only string keys, finite floats and non-byte scalars are accepted;
/// anything else is rejected rather than coerced.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const TAG: &'static str = "json";
}

impl Codec for JsonCodec {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn encode(&self, state: &StateMap) -> Result<Vec<u8>> {
        let object = map_to_json(state, "$")?;
        serde_json::to_vec(&object).map_err(|e| StateError::UnsupportedValue(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<StateMap> {
        let json: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| StateError::CorruptPayload(format!("json: {e}")))?;
        match json {
            serde_json::Value::Object(object) => Ok(object
                .into_iter()
                .map(|(k, v)| (Key::Str(k), json_to_value(v)))
                .collect()),
            other => Err(StateError::CorruptPayload(format!(
                "json: expected an object at top level, found {}",
                json_kind(&other)
            ))),
        }
    }
}

fn map_to_json(map: &StateMap, path: &str) -> Result<serde_json::Value> {
    let mut object = serde_json::Map::with_capacity(map.len());
    for (key, value) in map {
        let Key::Str(name) = key else {
            return Err(StateError::UnsupportedValue(format!(
                "json codec requires string keys, found {key} at {path}"
            )));
        };
        let child = format!("{path}.{name}");
        object.insert(name.clone(), value_to_json(value, &child)?);
    }
    Ok(serde_json::Value::Object(object))
}

fn value_to_json(value: &Value, path: &str) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                StateError::UnsupportedValue(format!("non-finite float {f} at {path}"))
            })?,
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(_) => {
            return Err(StateError::UnsupportedValue(format!(
                "json codec cannot represent bytes at {path}"
            )))
        }
        Value::List(items) => serde_json::Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| value_to_json(v, &format!("{path}[{i}]")))
                .collect::<Result<_>>()?,
        ),
        Value::Map(m) => map_to_json(m, path)?,
    })
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => {
            Value::List(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(object) => Value::Map(
            object
                .into_iter()
                .map(|(k, v)| (Key::Str(k), json_to_value(v)))
                .collect(),
        ),
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Codec selector used in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

impl CodecKind {
    pub fn tag(self) -> &'static str {
        self.codec().tag()
    }

    pub fn codec(self) -> &'static dyn Codec {
        match self {
            CodecKind::Bincode => &BincodeCodec,
            CodecKind::Json => &JsonCodec,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CodecKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bincode" | "binary" => Ok(CodecKind::Bincode),
            "json" => Ok(CodecKind::Json),
            other => Err(StateError::UnknownCodec(other.to_string())),
        }
    }
}

/// Resolve the codec that wrote a record.
pub fn codec_for_tag(tag: &str) -> Result<&'static dyn Codec> {
    match tag {
        BincodeCodec::TAG => Ok(&BincodeCodec),
        JsonCodec::TAG => Ok(&JsonCodec),
        other => Err(StateError::UnknownCodec(other.to_string())),
    }
}
