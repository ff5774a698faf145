//! Row conversion for persisted runtime records

use crate::{RuntimeError, RuntimeResult};
use arbor_data::Row;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_]").expect("valid regex"));

/// Database name for `raw`: lowercased, with every character outside
/// `[a-z0-9_]` replaced by `_`
pub fn database_name(prefix: &str, raw: &str) -> String {
    let lowered = raw.to_lowercase();
    format!("{prefix}_{}", UNSAFE_NAME_CHARS.replace_all(&lowered, "_"))
}

pub(crate) fn to_row<T: Serialize>(record: &T) -> RuntimeResult<Row> {
    match serde_json::to_value(record)? {
        Value::Object(fields) => Ok(fields.into_iter().collect()),
        other => Err(RuntimeError::Serialization(serde::ser::Error::custom(
            format!("expected an object, got {other}"),
        ))),
    }
}

pub(crate) fn from_row<T: DeserializeOwned>(row: Row) -> RuntimeResult<T> {
    Ok(serde_json::from_value(Value::Object(row.into_iter().collect()))?)
}
