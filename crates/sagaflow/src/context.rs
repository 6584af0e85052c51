//! Versioned key/value context shared by the steps of a saga.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Schema version written with every serialized context.
pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

/// Partial context returned by a step action and merged into the saga context.
pub type StepOutput = Map<String, Value>;

/// Accumulated saga context.
///
/// Starts from the caller's initial context and grows with the output of
/// every successful step. Keys are only ever added or overwritten, never
/// removed.
///
/// Serialized as `{"schema_version": 1, "values": {...}}`. A bare JSON object
/// (written before the schema tag existed) still deserializes, with schema
/// version 0.
///
/// # Example
///
/// ```
/// use sagaflow::SagaContext;
/// use serde_json::json;
///
/// let mut ctx = SagaContext::new();
/// ctx.insert("symbol", "AAPL").unwrap();
///
/// let mut output = serde_json::Map::new();
/// output.insert("backtest_id".into(), json!(17));
/// ctx.merge(output);
///
/// assert_eq!(ctx.get("backtest_id"), Some(&json!(17)));
/// assert_eq!(ctx.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ContextRepr")]
pub struct SagaContext {
    schema_version: u32,
    values: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContextRepr {
    Versioned {
        schema_version: u32,
        values: Map<String, Value>,
    },
    Legacy(Map<String, Value>),
}

impl From<ContextRepr> for SagaContext {
    fn from(repr: ContextRepr) -> Self {
        match repr {
            ContextRepr::Versioned {
                schema_version,
                values,
            } => Self {
                schema_version,
                values,
            },
            ContextRepr::Legacy(values) => Self {
                schema_version: 0,
                values,
            },
        }
    }
}

impl SagaContext {
    /// Create an empty context at the current schema version.
    pub fn new() -> Self {
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION,
            values: Map::new(),
        }
    }

    /// Schema version this context was written with.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Look up a raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Look up and decode a value.
    ///
    /// Returns `Ok(None)` when the key is absent and an error when the stored
    /// value does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Into::into)
    }

    /// Serialize and store a value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Merge a step's output, overwriting existing keys.
    pub fn merge(&mut self, output: StepOutput) {
        self.values.extend(output);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// The context as a JSON object (without the schema tag).
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

impl Default for SagaContext {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map<String, Value>> for SagaContext {
    fn from(values: Map<String, Value>) -> Self {
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION,
            values,
        }
    }
}

impl FromIterator<(String, Value)> for SagaContext {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Map<_, _>>())
    }
}
