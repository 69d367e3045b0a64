//! Result sets decoded from successful query responses.
//!
//! The server describes a result set as a map with a `type` discriminator:
//!
//! ```text
//! { "type": "single", "result": { ... } }
//! { "type": "list",   "results": [ ... ], "first": 0, "max": 10, "total": 42 }
//! { "type": "table",  "columns": ["a", "b"], "rows": [[1, 2], ...] }
//! ```
//!
//! A response without payload decodes to an empty result set.

use serde_json::{Map, Value};

use crate::error::{ClientError, Result};

/// Paging metadata attached to list and table results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Paging {
    pub first: Option<u64>,
    pub max: Option<u64>,
    pub total: Option<u64>,
}

/// A decoded query result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSet {
    Empty,
    Single(Map<String, Value>),
    List {
        results: Vec<Value>,
        paging: Paging,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        paging: Paging,
    },
}

impl ResultSet {
    /// Decode a structured response payload.
    pub fn from_payload(payload: Option<&Value>) -> Result<Self> {
        let map = match payload {
            None | Some(Value::Null) => return Ok(ResultSet::Empty),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(ClientError::Codec(format!(
                    "result payload is not a map: {other}"
                )))
            }
        };

        let kind = map.get("type").and_then(Value::as_str).unwrap_or("single");
        match kind {
            "single" => match map.get("result") {
                Some(Value::Object(result)) => Ok(ResultSet::Single(result.clone())),
                None | Some(Value::Null) => Ok(ResultSet::Single(Map::new())),
                Some(other) => Err(ClientError::Codec(format!(
                    "single result is not a map: {other}"
                ))),
            },
            "list" => {
                let results = match map.get("results") {
                    Some(Value::Array(items)) => items.clone(),
                    None | Some(Value::Null) => Vec::new(),
                    Some(other) => {
                        return Err(ClientError::Codec(format!(
                            "list results are not an array: {other}"
                        )))
                    }
                };
                Ok(ResultSet::List {
                    results,
                    paging: paging(map),
                })
            }
            "table" => {
                let columns = map
                    .get("columns")
                    .and_then(Value::as_array)
                    .map(|cols| {
                        cols.iter()
                            .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let rows = map
                    .get("rows")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .map(|row| row.as_array().cloned().unwrap_or_default())
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ResultSet::Table {
                    columns,
                    rows,
                    paging: paging(map),
                })
            }
            other => Err(ClientError::Codec(format!("unknown result type: {other}"))),
        }
    }

    /// Number of entries (rows for tables, 1 for single results).
    pub fn len(&self) -> usize {
        match self {
            ResultSet::Empty => 0,
            ResultSet::Single(_) => 1,
            ResultSet::List { results, .. } => results.len(),
            ResultSet::Table { rows, .. } => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn paging(&self) -> Option<&Paging> {
        match self {
            ResultSet::List { paging, .. } | ResultSet::Table { paging, .. } => Some(paging),
            _ => None,
        }
    }
}

fn paging(map: &Map<String, Value>) -> Paging {
    Paging {
        first: map.get("first").and_then(Value::as_u64),
        max: map.get("max").and_then(Value::as_u64),
        total: map.get("total").and_then(Value::as_u64),
    }
}
