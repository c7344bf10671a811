//! Positional extension arguments.
//!
//! Extensions receive their arguments as one flat list; slot `N` belongs to
//! whichever extension owns that position in the host's script runner. The
//! queue carries the list through storage without understanding it. Values
//! that could not be stored are kept as [`ScriptArg::UseDefault`] and
//! replaced by the host's live default for that slot at execution time.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One stored extension argument.
///
/// Stored as `{"value": x}` or the string `"use_default"`. Lists written
/// before the tagged form existed hold bare values; those decode as
/// `Value(x)`, with a bare `null` meaning `UseDefault`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptArg {
    Value(Value),
    UseDefault,
}

impl ScriptArg {
    fn from_stored(raw: Value) -> Self {
        match raw {
            Value::Null => ScriptArg::UseDefault,
            Value::String(s) if s == "use_default" => ScriptArg::UseDefault,
            Value::Object(mut map) if map.len() == 1 && map.contains_key("value") => {
                ScriptArg::Value(map.remove("value").unwrap_or(Value::Null))
            }
            other => ScriptArg::Value(other),
        }
    }
}

impl<'de> Deserialize<'de> for ScriptArg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(ScriptArg::from_stored)
    }
}

impl From<Value> for ScriptArg {
    fn from(v: Value) -> Self {
        ScriptArg::Value(v)
    }
}

/// An extension argument as it exists on a live request.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveArg {
    /// Anything that already is plain data.
    Json(Value),
    /// A host object with no JSON form, e.g. an extension's unit struct.
    Opaque {
        type_name: String,
        /// Textual form, if the host offers one.
        repr: Option<String>,
    },
}

impl LiveArg {
    /// Storable form: JSON as-is, opaque objects as their text or a default marker.
    pub fn to_stored(&self) -> ScriptArg {
        match self {
            LiveArg::Json(v) => ScriptArg::Value(v.clone()),
            LiveArg::Opaque { repr: Some(text), .. } => ScriptArg::Value(Value::String(text.clone())),
            LiveArg::Opaque { .. } => ScriptArg::UseDefault,
        }
    }
}

/// The slice of the flat argument list owned by one extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub title: String,
    /// First slot, inclusive.
    pub args_from: usize,
    /// End slot, exclusive.
    pub args_to: usize,
}

impl ScriptInfo {
    pub fn owns(&self, slot: usize) -> bool {
        (self.args_from..self.args_to).contains(&slot)
    }
}

/// Resolve stored arguments against the host's live defaults.
///
/// An empty stored list means "all defaults". Otherwise the list is padded
/// to the defaults' length and every `UseDefault` takes the default in the
/// same position, or `null` past the end of the defaults.
pub fn merge_script_args(stored: &[ScriptArg], defaults: &[Value]) -> Vec<Value> {
    if stored.is_empty() {
        return defaults.to_vec();
    }
    let len = stored.len().max(defaults.len());
    (0..len)
        .map(|i| match stored.get(i) {
            Some(ScriptArg::Value(v)) => v.clone(),
            Some(ScriptArg::UseDefault) | None => defaults.get(i).cloned().unwrap_or(Value::Null),
        })
        .collect()
}
