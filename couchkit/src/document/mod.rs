// Typed documents and view rows

use crate::error::{CouchError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A loaded document with its server metadata split out from typed data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document<T> {
    pub id: String,
    pub rev: Option<String>,
    pub data: T,
}

impl<T: DeserializeOwned> Document<T> {
    /// Split a raw document into `_id`, `_rev` and the remaining fields.
    pub fn from_value(raw: Value) -> Result<Self> {
        let Value::Object(mut map) = raw else {
            return Err(CouchError::InvalidResponse(
                "document must be a JSON object".into(),
            ));
        };

        let id = match map.remove("_id") {
            Some(Value::String(id)) => id,
            _ => {
                return Err(CouchError::InvalidResponse(
                    "document has no string '_id'".into(),
                ))
            }
        };
        let rev = match map.remove("_rev") {
            Some(Value::String(rev)) => Some(rev),
            _ => None,
        };
        let data: T = serde_json::from_value(Value::Object(map))?;

        Ok(Document { id, rev, data })
    }
}

impl<T: Serialize> Document<T> {
    /// Serialize back into the server's wire shape.
    pub fn to_json(&self) -> Result<Value> {
        let mut map = match serde_json::to_value(&self.data)? {
            Value::Object(map) => map,
            other => {
                return Err(CouchError::InvalidResponse(format!(
                    "document data must serialize to an object, got {other}"
                )))
            }
        };
        map.insert("_id".into(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            map.insert("_rev".into(), Value::String(rev.clone()));
        }
        Ok(Value::Object(map))
    }
}

/// A single row of a view response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl Row {
    pub fn from_value(raw: Value) -> Result<Self> {
        Ok(serde_json::from_value(raw)?)
    }

    /// The row value as an object, if it is one.
    pub fn value_object(&self) -> Option<&Map<String, Value>> {
        self.value.as_object()
    }
}
