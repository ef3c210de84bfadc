//! Payload envelopes and typed-value reconstruction.
//!
//! Successful payloads arrive as `{"json": <value>, "meta": [[tag, ...path]]}`.
//! Each meta entry names a location inside the JSON value and the richer type
//! that lived there before serialization (big integers, dates, sets, ...).

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use tracing::debug;
use url::Url;

use crate::error::{RpcError, RpcResult};

/// Type tag carried by a meta entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeTag {
    BigInt,
    Date,
    NaN,
    Undefined,
    Url,
    RegExp,
    Set,
    Map,
}

impl TypeTag {
    /// Decode the numeric wire tag.
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::BigInt,
            1 => Self::Date,
            2 => Self::NaN,
            3 => Self::Undefined,
            4 => Self::Url,
            5 => Self::RegExp,
            6 => Self::Set,
            7 => Self::Map,
            _ => return None,
        })
    }
}

/// One step of a meta path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(key) => Some(Self::Key(key.clone())),
            Value::Number(n) => n.as_u64().and_then(|i| usize::try_from(i).ok()).map(Self::Index),
            _ => None,
        }
    }
}

/// A meta entry: which type to restore, and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaEntry {
    pub tag: TypeTag,
    pub path: Vec<PathSegment>,
}

/// A decoded payload value.
///
/// A superset of JSON that can represent the types restored by meta tags.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<RpcValue>),
    Object(BTreeMap<String, RpcValue>),
    /// Integers that fit in `i128`. Larger tagged values stay
    /// [`RpcValue::String`].
    BigInt(i128),
    Date(DateTime<Utc>),
    NaN,
    Undefined,
    Url(Url),
    RegExp { source: String, flags: String },
    Set(Vec<RpcValue>),
    Map(Vec<(RpcValue, RpcValue)>),
}

impl From<Value> for RpcValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl RpcValue {
    /// Look up an object member.
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            Self::BigInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Lossy conversion back to plain JSON.
    ///
    /// Big integers, dates, URLs and regular expressions become strings,
    /// `NaN` becomes `null`, sets become arrays and maps become arrays of
    /// `[key, value]` pairs. Undefined object members are dropped.
    pub fn into_json(self) -> Value {
        match self {
            Self::Null | Self::NaN | Self::Undefined => Value::Null,
            Self::Bool(b) => Value::Bool(b),
            Self::Number(n) => Value::Number(n),
            Self::String(s) => Value::String(s),
            Self::Array(items) | Self::Set(items) => {
                Value::Array(items.into_iter().map(Self::into_json).collect())
            }
            Self::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(_, v)| !matches!(v, Self::Undefined))
                    .map(|(k, v)| (k, v.into_json()))
                    .collect(),
            ),
            Self::BigInt(n) => Value::String(n.to_string()),
            Self::Date(date) => Value::String(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Url(url) => Value::String(url.into()),
            Self::RegExp { source, flags } => Value::String(format!("/{source}/{flags}")),
            Self::Map(entries) => Value::Array(
                entries
                    .into_iter()
                    .map(|(k, v)| Value::Array(vec![k.into_json(), v.into_json()]))
                    .collect(),
            ),
        }
    }

    /// Deserialize into a concrete type through the JSON projection.
    pub fn deserialize<T: DeserializeOwned>(self) -> RpcResult<T> {
        serde_json::from_value(self.into_json()).map_err(RpcError::from)
    }

    fn child_mut(&mut self, segment: &PathSegment) -> Option<&mut RpcValue> {
        match (self, segment) {
            (Self::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (Self::Object(map), PathSegment::Index(index)) => map.get_mut(&index.to_string()),
            (Self::Array(items) | Self::Set(items), PathSegment::Index(index)) => {
                items.get_mut(*index)
            }
            (Self::Array(items) | Self::Set(items), PathSegment::Key(key)) => {
                key.parse::<usize>().ok().and_then(|index| items.get_mut(index))
            }
            _ => None,
        }
    }
}

/// Parse the `meta` member of an envelope, skipping malformed entries.
pub fn parse_meta(meta: &Value) -> Vec<MetaEntry> {
    let Some(entries) = meta.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let parts = entry.as_array()?;
            let (tag, path) = parts.split_first()?;
            let tag = TypeTag::from_code(tag.as_u64()?)?;
            let path = path
                .iter()
                .map(PathSegment::from_json)
                .collect::<Option<Vec<_>>>()?;
            Some(MetaEntry { tag, path })
        })
        .collect()
}

/// Restore the type named by `entry` in place.
///
/// Paths through missing or non-container intermediates are ignored.
pub fn apply_meta(root: &mut RpcValue, entry: &MetaEntry) {
    let Some((last, parents)) = entry.path.split_last() else {
        let current = std::mem::replace(root, RpcValue::Undefined);
        *root = decode_tagged(current, entry.tag);
        return;
    };

    let mut current = root;
    for segment in parents {
        match current.child_mut(segment) {
            Some(child) => current = child,
            None => return,
        }
    }

    if let (RpcValue::Object(map), PathSegment::Key(key)) = (&mut *current, last) {
        let slot = map.entry(key.clone()).or_insert(RpcValue::Undefined);
        let value = std::mem::replace(slot, RpcValue::Undefined);
        *slot = decode_tagged(value, entry.tag);
        return;
    }

    if let Some(slot) = current.child_mut(last) {
        let value = std::mem::replace(slot, RpcValue::Undefined);
        *slot = decode_tagged(value, entry.tag);
    }
}

fn decode_tagged(value: RpcValue, tag: TypeTag) -> RpcValue {
    match (tag, value) {
        (TypeTag::BigInt, RpcValue::String(s)) => match s.parse::<i128>() {
            Ok(n) => RpcValue::BigInt(n),
            Err(err) => {
                debug!(value = %s, error = %err, "BigInt outside i128 range, keeping string");
                RpcValue::String(s)
            }
        },
        (TypeTag::Date, RpcValue::String(s)) => match DateTime::parse_from_rfc3339(&s) {
            Ok(date) => RpcValue::Date(date.with_timezone(&Utc)),
            Err(_) => RpcValue::String(s),
        },
        (TypeTag::NaN, _) => RpcValue::NaN,
        (TypeTag::Undefined, _) => RpcValue::Undefined,
        (TypeTag::Url, RpcValue::String(s)) => match Url::parse(&s) {
            Ok(url) => RpcValue::Url(url),
            Err(_) => RpcValue::String(s),
        },
        (TypeTag::RegExp, RpcValue::String(s)) => parse_regexp(s),
        (TypeTag::Set, RpcValue::Array(items)) => RpcValue::Set(items),
        (TypeTag::Map, RpcValue::Array(items)) => {
            if !items.iter().all(|item| matches!(item, RpcValue::Array(_))) {
                return RpcValue::Array(items);
            }
            let entries = items
                .into_iter()
                .filter_map(|item| match item {
                    RpcValue::Array(pair) => {
                        let mut pair = pair.into_iter();
                        let key = pair.next().unwrap_or(RpcValue::Undefined);
                        let value = pair.next().unwrap_or(RpcValue::Undefined);
                        Some((key, value))
                    }
                    _ => None,
                })
                .collect();
            RpcValue::Map(entries)
        }
        (_, other) => other,
    }
}

/// Split `/source/flags` into its parts; anything else is a bare source.
fn parse_regexp(literal: String) -> RpcValue {
    if let Some(rest) = literal.strip_prefix('/')
        && let Some(close) = rest.rfind('/')
    {
        let flags = &rest[close + 1..];
        if flags.chars().all(|c| "gimsuvy".contains(c)) {
            return RpcValue::RegExp {
                source: rest[..close].to_string(),
                flags: flags.to_string(),
            };
        }
    }
    RpcValue::RegExp {
        source: literal,
        flags: String::new(),
    }
}

/// Unwrap a payload envelope and restore every meta-tagged value.
///
/// Objects carrying a `json` member are treated as envelopes; any other value
/// is returned as-is.
pub fn deserialize_payload(payload: Value) -> RpcValue {
    let Value::Object(mut envelope) = payload else {
        return RpcValue::from(payload);
    };
    if !envelope.contains_key("json") {
        return RpcValue::from(Value::Object(envelope));
    }

    let meta = envelope.remove("meta").unwrap_or(Value::Null);
    let mut value = RpcValue::from(envelope.remove("json").unwrap_or(Value::Null));
    for entry in parse_meta(&meta) {
        apply_meta(&mut value, &entry);
    }
    value
}

/// Returns the `json` member of an envelope, or the value itself.
pub(crate) fn envelope_body(payload: &Value) -> &Value {
    payload
        .as_object()
        .and_then(|object| object.get("json"))
        .unwrap_or(payload)
}
