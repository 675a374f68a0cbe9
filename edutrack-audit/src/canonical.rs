//! Canonical byte form of record snapshots.
//!
//! A snapshot is encoded as a version header followed by one line per field,
//! sorted by field name:
//!
//! ```text
//! edutrack.snapshot.v1
//! 9:completed=b:5:false
//! 8:progress=f:4:42.0
//! ```
//!
//! Every key and value is length-prefixed and every value carries a type
//! tag, so `"1"`, `1`, `1.0` and `true` all encode differently and no value
//! can smuggle in a separator. Null fields are encoded with the `n` tag and
//! are never dropped.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hasher::{self, Digest};

/// Header line identifying the encoding version.
pub const CANONICAL_HEADER: &str = "edutrack.snapshot.v1";

/// Separator between encoded fields.
const FIELD_SEPARATOR: char = '\n';

/// JSON object key used to pass a timestamp through [`Snapshot::from_json`].
pub const TIMESTAMP_JSON_KEY: &str = "$timestamp";

/// Scalar field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Scalar {
    fn tag(&self) -> char {
        match self {
            Scalar::Null => 'n',
            Scalar::Bool(_) => 'b',
            Scalar::Int(_) => 'i',
            Scalar::Float(_) => 'f',
            Scalar::Text(_) => 's',
            Scalar::Timestamp(_) => 't',
        }
    }

    fn encoded_value(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => {
                // -0.0 and 0.0 compare equal; encode them identically
                let f = if *f == 0.0 { 0.0 } else { *f };
                format!("{:?}", f)
            }
            Scalar::Text(s) => s.clone(),
            Scalar::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value.into())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<DateTime<Utc>> for Scalar {
    fn from(value: DateTime<Utc>) -> Self {
        Scalar::Timestamp(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

/// Errors building a snapshot from untyped input.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot must be a JSON object")]
    NotAnObject,

    #[error("Field {field} is not a scalar")]
    NotScalar { field: String },

    #[error("Field {field} has an invalid timestamp: {reason}")]
    InvalidTimestamp { field: String, reason: String },

    #[error("Field {field} has a number outside the i64/f64 range")]
    UnrepresentableNumber { field: String },
}

/// Immutable field name → scalar mapping describing a subject at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    fields: BTreeMap<String, Scalar>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in canonical (sorted) order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build a snapshot from a flat JSON object.
    ///
    /// Strings stay text; `{"$timestamp": "<rfc3339>"}` becomes a timestamp.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, SnapshotError> {
        let object = value.as_object().ok_or(SnapshotError::NotAnObject)?;
        let mut fields = BTreeMap::new();

        for (name, raw) in object {
            let scalar = match raw {
                serde_json::Value::Null => Scalar::Null,
                serde_json::Value::Bool(b) => Scalar::Bool(*b),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Scalar::Int(i)
                    } else if let Some(f) = n.as_f64() {
                        Scalar::Float(f)
                    } else {
                        return Err(SnapshotError::UnrepresentableNumber { field: name.clone() });
                    }
                }
                serde_json::Value::String(s) => Scalar::Text(s.clone()),
                serde_json::Value::Object(inner) => {
                    let ts = inner
                        .get(TIMESTAMP_JSON_KEY)
                        .and_then(|v| v.as_str())
                        .filter(|_| inner.len() == 1)
                        .ok_or_else(|| SnapshotError::NotScalar { field: name.clone() })?;
                    let parsed = DateTime::parse_from_rfc3339(ts).map_err(|e| {
                        SnapshotError::InvalidTimestamp {
                            field: name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    Scalar::Timestamp(parsed.with_timezone(&Utc))
                }
                serde_json::Value::Array(_) => {
                    return Err(SnapshotError::NotScalar { field: name.clone() })
                }
            };
            fields.insert(name.clone(), scalar);
        }

        Ok(Self { fields })
    }

    /// Canonical bytes of this snapshot.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonicalize(self)
    }

    /// Digest of the canonical bytes.
    pub fn digest(&self) -> Digest {
        hasher::hash(&self.canonical_bytes())
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Deterministically encode a snapshot. Total: never fails.
pub fn canonicalize(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = String::from(CANONICAL_HEADER);

    for (name, value) in snapshot.fields() {
        let encoded = value.encoded_value();
        out.push(FIELD_SEPARATOR);
        out.push_str(&format!(
            "{}:{}={}:{}:{}",
            name.len(),
            name,
            value.tag(),
            encoded.len(),
            encoded
        ));
    }

    out.into_bytes()
}
