use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload values as a tagged tree. Timestamps are carried as epoch milliseconds in
/// [`Value::Int`] once cast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// The declared type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Any,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::Timestamp => "timestamp",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

/// A value could not be cast to the requested type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastError {
    pub expected: ValueType,
    pub found: &'static str,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of ints and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Casts into the requested type. Numbers convert between int and float when no precision is
    /// lost, numeric strings parse, and timestamps accept RFC3339 strings or epoch millis.
    pub fn cast(self, to: ValueType) -> Result<Value, CastError> {
        let found = self.type_name();
        let mismatch = CastError {
            expected: to,
            found,
        };
        match (to, self) {
            (ValueType::Any, v) => Ok(v),
            (ValueType::String, v @ Value::String(_)) => Ok(v),
            (ValueType::String, Value::Int(i)) => Ok(Value::String(i.to_string())),
            (ValueType::String, Value::Float(f)) => Ok(Value::String(f.to_string())),
            (ValueType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (ValueType::Int, v @ Value::Int(_)) => Ok(v),
            (ValueType::Int, Value::Float(f))
                if f.fract() == 0.0 && (I64_LOWER..I64_UPPER).contains(&f) =>
            {
                Ok(Value::Int(f as i64))
            }
            (ValueType::Int, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::Int).map_err(|_| mismatch)
            }
            (ValueType::Float, v @ Value::Float(_)) => Ok(v),
            (ValueType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (ValueType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float)
                .ok_or(mismatch),
            (ValueType::Bool, v @ Value::Bool(_)) => Ok(v),
            (ValueType::Bool, Value::String(s)) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch),
            },
            (ValueType::Timestamp, v @ Value::Int(_)) => Ok(v),
            (ValueType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Value::Int(t.with_timezone(&Utc).timestamp_millis()))
                .map_err(|_| mismatch),
            _ => Err(mismatch),
        }
    }

    /// Stable textual form, used for grouping keys and distinct counting.
    pub fn canonical(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// Floats in `I64_LOWER..I64_UPPER` convert to i64 exactly; both bounds are powers of two.
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                // integers beyond i64 keep their digits instead of rounding through f64
                None if n.is_u64() => Value::String(n.to_string()),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Flattens nested objects into dotted keys (`a.b.c`). Arrays are kept as they are.
pub fn flatten(object: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();
    flatten_into(&mut flat, None, object);
    flat
}

fn flatten_into(flat: &mut BTreeMap<String, Value>, prefix: Option<&str>, object: BTreeMap<String, Value>) {
    for (field, value) in object {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{field}"),
            None => field,
        };
        match value {
            Value::Object(nested) if !nested.is_empty() => flatten_into(flat, Some(&path), nested),
            other => {
                flat.insert(path, other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_between_numbers_and_strings() {
        assert_eq!(Value::Int(3).cast(ValueType::Float), Ok(Value::Float(3.0)));
        assert_eq!(Value::Float(4.0).cast(ValueType::Int), Ok(Value::Int(4)));
        assert_eq!(
            Value::String(" 12 ".into()).cast(ValueType::Int),
            Ok(Value::Int(12))
        );
        assert_eq!(
            Value::Float(4.5).cast(ValueType::Int),
            Err(CastError {
                expected: ValueType::Int,
                found: "float"
            })
        );
        assert_eq!(
            Value::Bool(true).cast(ValueType::Float),
            Err(CastError {
                expected: ValueType::Float,
                found: "bool"
            })
        );
    }

    #[test]
    fn out_of_range_floats_do_not_saturate() {
        let mismatch = Err(CastError {
            expected: ValueType::Int,
            found: "float",
        });
        assert_eq!(Value::Float(1e19).cast(ValueType::Int), mismatch);
        assert_eq!(Value::Float(-1e19).cast(ValueType::Int), mismatch);
        assert_eq!(Value::Float(9_223_372_036_854_775_808.0).cast(ValueType::Int), mismatch);
        assert_eq!(Value::Float(f64::NAN).cast(ValueType::Int), mismatch);
        assert_eq!(
            Value::Float(-9_223_372_036_854_775_808.0).cast(ValueType::Int),
            Ok(Value::Int(i64::MIN))
        );
    }

    #[test]
    fn json_integers_beyond_i64_keep_their_digits() {
        let big: Value = serde_json::json!(18_446_744_073_709_551_615_u64).into();
        assert_eq!(big, Value::String("18446744073709551615".into()));
        assert!(big.clone().cast(ValueType::Int).is_err());
        assert_eq!(big.cast(ValueType::Float), Ok(Value::Float(18_446_744_073_709_551_615.0)));

        let small: Value = serde_json::json!(-5).into();
        assert_eq!(small, Value::Int(-5));
        let float: Value = serde_json::json!(2.5).into();
        assert_eq!(float, Value::Float(2.5));
    }

    #[test]
    fn casts_timestamps() {
        let parsed = Value::String("2024-01-01T10:00:00Z".into())
            .cast(ValueType::Timestamp)
            .unwrap();
        assert_eq!(parsed, Value::Int(1_704_103_200_000));
        assert_eq!(
            Value::Int(5).cast(ValueType::Timestamp),
            Ok(Value::Int(5))
        );
        assert!(Value::String("yesterday".into()).cast(ValueType::Timestamp).is_err());
    }

    #[test]
    fn flattens_nested_objects() {
        let json: serde_json::Value = serde_json::json!({
            "user": {"id": 7, "geo": {"country": "NL"}},
            "tags": ["a", "b"],
            "empty": {},
        });
        let Value::Object(object) = Value::from(json) else {
            panic!("expected an object");
        };
        let flat = flatten(object);
        assert_eq!(flat.get("user.id"), Some(&Value::Int(7)));
        assert_eq!(flat.get("user.geo.country"), Some(&Value::String("NL".into())));
        assert_eq!(
            flat.get("tags"),
            Some(&Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into())
            ]))
        );
        assert_eq!(flat.get("empty"), Some(&Value::Object(BTreeMap::new())));
    }

    #[test]
    fn untagged_serde_keeps_ints_and_floats_apart() {
        let v: Value = serde_json::from_str("[1, 1.5, null, \"x\"]").unwrap();
        assert_eq!(
            v,
            Value::Array(vec![
                Value::Int(1),
                Value::Float(1.5),
                Value::Null,
                Value::String("x".into())
            ])
        );
    }
}
