//! Event properties: an ordered map of tagged scalar values with an explicit,
//! versioned blob encoding.
//!
//! Blob layout (version 1):
//!
//! ```text
//! {"v":1,"p":{"region":{"s":"us"},"gb":{"n":"5.25"},"beta":{"b":true}}}
//! ```
//!
//! The grouping and filtering text of a value is the string itself, the
//! decimal's normalized text (`5.250` is `5.25`), or `true`/`false`. The SQL function
//! `usage_property_text(properties, key)` yields the same text.

use crate::error::UsageError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

pub const PROPERTIES_ENCODING_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    #[serde(rename = "s")]
    String(String),
    #[serde(rename = "n", serialize_with = "serialize_normalized")]
    Number(Decimal),
    #[serde(rename = "b")]
    Bool(bool),
}

impl PropertyValue {
    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            PropertyValue::Number(n) => n.normalize().to_string(),
            PropertyValue::Bool(b) => b.to_string(),
        }
    }
}

fn serialize_normalized<S: Serializer>(n: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
    Serialize::serialize(&n.normalize(), serializer)
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<Decimal> for PropertyValue {
    fn from(value: Decimal) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(Decimal::from(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap(BTreeMap<String, PropertyValue>);

#[derive(Serialize)]
struct EncodedRef<'a> {
    v: u64,
    p: &'a BTreeMap<String, PropertyValue>,
}

#[derive(Deserialize)]
struct Encoded {
    v: u64,
    #[serde(default)]
    p: BTreeMap<String, PropertyValue>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Grouping text of a property, `None` when the event does not carry it.
    pub fn text(&self, key: &str) -> Option<String> {
        self.0.get(key).map(PropertyValue::as_text)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    /// Encode into the versioned blob stored alongside the event.
    pub fn encode(&self, event_id: &str) -> Result<serde_json::Value, UsageError> {
        serde_json::to_value(EncodedRef {
            v: PROPERTIES_ENCODING_VERSION,
            p: &self.0,
        })
        .map_err(|e| UsageError::serialization(event_id, e))
    }

    /// Decode a stored blob. Unknown versions are rejected rather than guessed.
    pub fn decode(event_id: &str, blob: serde_json::Value) -> Result<Self, UsageError> {
        if blob.is_null() {
            return Ok(Self::default());
        }
        let encoded: Encoded =
            serde_json::from_value(blob).map_err(|e| UsageError::serialization(event_id, e))?;
        if encoded.v != PROPERTIES_ENCODING_VERSION {
            return Err(UsageError::serialization(
                event_id,
                anyhow::anyhow!("unsupported properties encoding version {}", encoded.v),
            ));
        }
        Ok(Self(encoded.p))
    }
}

impl FromIterator<(String, PropertyValue)> for PropertyMap {
    fn from_iter<T: IntoIterator<Item = (String, PropertyValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
