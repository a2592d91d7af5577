use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arguments passed to an action's handler.
///
/// Keys keep their insertion order (handlers may read them positionally), but
/// equality ignores order: `{a:1, b:2} == {b:2, a:1}`. Use [`ActionArgs::canonical`]
/// wherever two argument bags must be compared as stored text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionArgs(IndexMap<String, Value>);

impl ActionArgs {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Positional arguments, keyed `"0"`, `"1"`, ... in order.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self(
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.into()))
                .collect(),
        )
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Values in insertion order, for handlers taking positional arguments.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }

    /// JSON object text in insertion order.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    /// Parse a JSON object. A JSON array is accepted as positional arguments.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Array(items) => Ok(Self::positional(items)),
            other => serde_json::from_value(other),
        }
    }

    /// Stable text form with keys sorted at every depth.
    ///
    /// Two bags that compare equal produce identical canonical text.
    pub fn canonical(&self) -> String {
        let sorted: BTreeMap<&String, Value> =
            self.0.iter().map(|(k, v)| (k, canonical_value(v))).collect();
        // Serializing a map of strings to JSON values cannot fail.
        serde_json::to_string(&sorted).unwrap_or_default()
    }
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonical_value(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

impl From<IndexMap<String, Value>> for ActionArgs {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ActionArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
