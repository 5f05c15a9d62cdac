//! Self-describing values that cross the process boundary.
//!
//! Arguments and return values of proxied functions travel as a [`Value`]:
//! an explicit type tag plus its payload. Only the variants listed here are
//! representable. Conversions from anything else fail with an
//! [`EnvelopeError`] rather than dropping data.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Tagged envelope for dynamic values.
///
/// Serialized as `{"type": "<tag>", "value": <payload>}`. Unknown tags are
/// rejected on decode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Finite 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Timestamp, carried as RFC 3339.
    Time(DateTime<Utc>),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Ordered list.
    List(Vec<Value>),
}

impl Value {
    /// Tag name of this variant.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Time(_) => "time",
            Self::Map(_) => "map",
            Self::List(_) => "list",
        }
    }

    /// Whether this is [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check that every float, nested ones included, is finite.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NonFinite`] for NaN or an infinity anywhere
    /// in the value.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        match self {
            Self::Float(f) if !f.is_finite() => Err(EnvelopeError::NonFinite),
            Self::Map(fields) => fields.values().try_for_each(Self::validate),
            Self::List(items) => items.iter().try_for_each(Self::validate),
            _ => Ok(()),
        }
    }

    /// Borrow the string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert plain JSON into the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::UnsupportedNumber`] for integers that do not
    /// fit in `i64` and are not exactly representable as a float.
    pub fn from_json(json: serde_json::Value) -> Result<Self, EnvelopeError> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if n.is_f64()
                    && let Some(f) = n.as_f64()
                {
                    Self::Float(f)
                } else {
                    return Err(EnvelopeError::UnsupportedNumber(n.to_string()));
                }
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(fields) => Self::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                    .collect::<Result<_, EnvelopeError>>()?,
            ),
        })
    }

    /// Render as plain JSON. Timestamps become RFC 3339 strings.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Time(t) => serde_json::Value::String(t.to_rfc3339()),
            Self::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

/// Conversion into the envelope.
pub trait IntoValue {
    /// Wrap `self` in a [`Value`].
    ///
    /// # Errors
    ///
    /// Returns an error if the value has no envelope representation.
    fn into_value(self) -> Result<Value, EnvelopeError>;
}

/// Conversion out of the envelope.
pub trait FromValue: Sized {
    /// Extract `Self` from a [`Value`].
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::TypeMismatch`] when the tag does not fit.
    fn from_value(value: Value) -> Result<Self, EnvelopeError>;
}

fn mismatch<T>(expected: &'static str, found: &Value) -> Result<T, EnvelopeError> {
    Err(EnvelopeError::TypeMismatch {
        expected,
        found: found.type_name(),
    })
}

impl IntoValue for Value {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        self.validate()?;
        Ok(self)
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        Ok(value)
    }
}

impl IntoValue for () {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::Null)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::Bool(self))
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => mismatch("bool", &other),
        }
    }
}

impl IntoValue for String {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::String(self))
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::String(self.to_string()))
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::String(s) => Ok(s),
            other => mismatch("string", &other),
        }
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::Int(self))
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::Int(i64::from(self)))
    }
}

impl IntoValue for u32 {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::Int(i64::from(self)))
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Int(i) => Ok(i),
            other => mismatch("int", &other),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Int(i) => {
                i32::try_from(i).map_err(|_| EnvelopeError::UnsupportedNumber(i.to_string()))
            },
            other => mismatch("int", &other),
        }
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        if self.is_finite() {
            Ok(Value::Float(self))
        } else {
            Err(EnvelopeError::NonFinite)
        }
    }
}

impl FromValue for f64 {
    #[allow(clippy::cast_precision_loss)]
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f64),
            other => mismatch("float", &other),
        }
    }
}

impl IntoValue for DateTime<Utc> {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::Time(self))
    }
}

impl FromValue for DateTime<Utc> {
    /// Strings are accepted when they parse as RFC 3339.
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Time(t) => Ok(t),
            Value::String(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| EnvelopeError::InvalidTime(s)),
            other => mismatch("time", &other),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        self.map_or(Ok(Value::Null), IntoValue::into_value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::List(
            self.into_iter()
                .map(IntoValue::into_value)
                .collect::<Result<_, _>>()?,
        ))
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("list", &other),
        }
    }
}

impl<T: IntoValue> IntoValue for BTreeMap<String, T> {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        Ok(Value::Map(
            self.into_iter()
                .map(|(k, v)| Ok((k, v.into_value()?)))
                .collect::<Result<_, EnvelopeError>>()?,
        ))
    }
}

impl<T: IntoValue> IntoValue for HashMap<String, T> {
    fn into_value(self) -> Result<Value, EnvelopeError> {
        self.into_iter().collect::<BTreeMap<_, _>>().into_value()
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Map(fields) => fields
                .into_iter()
                .map(|(k, v)| Ok((k, T::from_value(v)?)))
                .collect(),
            other => mismatch("map", &other),
        }
    }
}

impl<T: FromValue> FromValue for HashMap<String, T> {
    fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        BTreeMap::<String, T>::from_value(value).map(|m| m.into_iter().collect())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Time(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_tagged() {
        let json = serde_json::to_value(Value::String("hi".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "string", "value": "hi"}));

        let null = serde_json::to_value(Value::Null).unwrap();
        assert_eq!(null, serde_json::json!({"type": "null"}));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let result: Result<Value, _> =
            serde_json::from_value(serde_json::json!({"type": "bytes", "value": [1, 2]}));
        assert!(result.is_err());
    }

    #[test]
    fn test_time_accepts_rfc3339_string() {
        let t = DateTime::<Utc>::from_value(Value::String("2024-01-15T10:30:00Z".into())).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-01-15T10:30:00+00:00");

        let err = DateTime::<Utc>::from_value(Value::String("yesterday".into())).unwrap_err();
        assert_eq!(err, EnvelopeError::InvalidTime("yesterday".into()));
    }

    #[test]
    fn test_type_mismatch_names_both_sides() {
        let err = bool::from_value(Value::String("true".into())).unwrap_err();
        assert_eq!(err.to_string(), "expected bool, got string");
    }

    #[test]
    fn test_non_finite_float_fails_closed() {
        assert_eq!(f64::NAN.into_value(), Err(EnvelopeError::NonFinite));
        assert_eq!(f64::INFINITY.into_value(), Err(EnvelopeError::NonFinite));
    }

    #[test]
    fn test_hand_built_non_finite_float_fails_closed() {
        assert_eq!(Value::Float(f64::NAN).into_value(), Err(EnvelopeError::NonFinite));

        let nested = Value::Map(BTreeMap::from([(
            "ratios".to_string(),
            Value::List(vec![Value::Float(0.5), Value::Float(f64::NEG_INFINITY)]),
        )]));
        assert_eq!(nested.validate(), Err(EnvelopeError::NonFinite));
        assert_eq!(vec![nested].into_value(), Err(EnvelopeError::NonFinite));

        assert!(Value::Float(0.5).into_value().is_ok());
    }

    #[test]
    fn test_from_json_rejects_oversized_integer() {
        let json: serde_json::Value = serde_json::from_str("18446744073709551615").unwrap();
        assert!(matches!(
            Value::from_json(json),
            Err(EnvelopeError::UnsupportedNumber(_))
        ));
    }

    #[test]
    fn test_nested_map_from_json() {
        let value = Value::from_json(serde_json::json!({
            "name": "hello",
            "tags": ["a", "b"],
            "meta": {"count": 2, "ratio": 0.5}
        }))
        .unwrap();

        let Value::Map(fields) = &value else {
            panic!("expected map, got {value:?}");
        };
        assert_eq!(fields["name"], Value::String("hello".into()));
        assert_eq!(
            fields["tags"],
            Value::List(vec![Value::String("a".into()), Value::String("b".into())])
        );
        assert_eq!(value.to_json()["meta"]["count"], 2);
    }

    #[test]
    fn test_option_maps_to_null() {
        assert_eq!(None::<String>.into_value().unwrap(), Value::Null);
        assert_eq!(Option::<i64>::from_value(Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::from_value(Value::Int(3)).unwrap(), Some(3));
    }
}
