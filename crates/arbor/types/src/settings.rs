//! Typed setting values
//!
//! Settings are persisted as a `(value, type)` pair of strings so that a
//! value read back has the same type it was written with: an integer stays
//! an integer, a boolean stays a boolean.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A setting value; the variant is inferred from the Rust value stored
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SettingValue {
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    #[serde(rename = "string")]
    Text(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingDecodeError {
    #[error("Unknown setting type: {0}")]
    UnknownType(String),

    #[error("Cannot decode {raw:?} as {type_name}")]
    Malformed { type_name: String, raw: String },
}

impl SettingValue {
    /// The persisted type tag
    pub fn type_name(&self) -> &'static str {
        match self {
            SettingValue::Integer(_) => "integer",
            SettingValue::Decimal(_) => "decimal",
            SettingValue::Boolean(_) => "boolean",
            SettingValue::Text(_) => "string",
        }
    }

    /// The persisted string form of the value
    pub fn encode(&self) -> String {
        match self {
            SettingValue::Integer(v) => v.to_string(),
            SettingValue::Decimal(v) => v.to_string(),
            SettingValue::Boolean(v) => v.to_string(),
            SettingValue::Text(v) => v.clone(),
        }
    }

    /// Rebuild a value from its persisted type tag and string form
    pub fn decode(type_name: &str, raw: &str) -> Result<Self, SettingDecodeError> {
        let malformed = || SettingDecodeError::Malformed {
            type_name: type_name.to_string(),
            raw: raw.to_string(),
        };
        match type_name {
            "integer" => raw.parse().map(SettingValue::Integer).map_err(|_| malformed()),
            "decimal" => raw.parse().map(SettingValue::Decimal).map_err(|_| malformed()),
            "boolean" => raw.parse().map(SettingValue::Boolean).map_err(|_| malformed()),
            "string" => Ok(SettingValue::Text(raw.to_string())),
            other => Err(SettingDecodeError::UnknownType(other.to_string())),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Decimal(v) => Some(*v),
            SettingValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Integer(value)
    }
}

impl From<i32> for SettingValue {
    fn from(value: i32) -> Self {
        SettingValue::Integer(value.into())
    }
}

impl From<u32> for SettingValue {
    fn from(value: u32) -> Self {
        SettingValue::Integer(value.into())
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Decimal(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Boolean(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn type_is_inferred_from_value() {
        assert_eq!(SettingValue::from(42).type_name(), "integer");
        assert_eq!(SettingValue::from(4.5).type_name(), "decimal");
        assert_eq!(SettingValue::from(true).type_name(), "boolean");
        assert_eq!(SettingValue::from("EUR").type_name(), "string");
    }

    #[test]
    fn numeric_looking_text_stays_text() {
        let value = SettingValue::from("42");
        let decoded = SettingValue::decode(value.type_name(), &value.encode()).unwrap();
        assert_eq!(decoded, SettingValue::Text("42".into()));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            SettingValue::decode("integer", "forty"),
            Err(SettingDecodeError::Malformed { .. })
        ));
        assert!(matches!(
            SettingValue::decode("blob", "x"),
            Err(SettingDecodeError::UnknownType(_))
        ));
    }

    proptest! {
        #[test]
        fn integers_round_trip(v in any::<i64>()) {
            let value = SettingValue::from(v);
            prop_assert_eq!(SettingValue::decode(value.type_name(), &value.encode()).unwrap(), value);
        }

        #[test]
        fn finite_decimals_round_trip(v in -1.0e12f64..1.0e12f64) {
            let value = SettingValue::from(v);
            prop_assert_eq!(SettingValue::decode(value.type_name(), &value.encode()).unwrap(), value);
        }
    }
}
