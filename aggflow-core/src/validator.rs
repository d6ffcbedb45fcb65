use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{FieldSpec, PipelineConfig};
use crate::message::{Offset, PartitionId, RawRecord, Record};
use crate::value::{self, Value, ValueType};

/// Why a raw record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    MissingField(String),
    TypeMismatch {
        field: String,
        expected: ValueType,
        found: &'static str,
    },
    MalformedEncoding(String),
}

impl ValidationReason {
    /// Short name used as metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationReason::MissingField(_) => "missing_field",
            ValidationReason::TypeMismatch { .. } => "type_mismatch",
            ValidationReason::MalformedEncoding(_) => "malformed_encoding",
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationReason::MissingField(field) => write!(f, "missing field {field}"),
            ValidationReason::TypeMismatch {
                field,
                expected,
                found,
            } => write!(f, "field {field} expected {expected}, found {found}"),
            ValidationReason::MalformedEncoding(detail) => write!(f, "malformed encoding: {detail}"),
        }
    }
}

/// A rejected record, tagged with the reason and carrying the original bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub partition: PartitionId,
    pub offset: Offset,
    pub reason: ValidationReason,
    pub raw: Bytes,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}-{}: {}", self.partition, self.offset, self.reason)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for crate::Error {
    fn from(value: ValidationError) -> Self {
        crate::Error::Validation(value.to_string())
    }
}

/// What the quarantine sink receives for a rejected record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub reason: String,
    /// Base64 of the raw bytes, they need not be valid UTF-8.
    pub raw: String,
}

impl QuarantinedRecord {
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.partition, self.offset)
    }
}

impl From<&ValidationError> for QuarantinedRecord {
    fn from(value: &ValidationError) -> Self {
        Self {
            partition: value.partition,
            offset: value.offset,
            reason: value.reason.to_string(),
            raw: BASE64_STANDARD.encode(&value.raw),
        }
    }
}

/// Turns raw JSON bytes into typed [`Record`]s following the configured schema.
#[derive(Debug, Clone)]
pub struct Validator {
    key_field: String,
    fields: Vec<FieldSpec>,
}

impl Validator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            key_field: config.schema.key_field.clone(),
            fields: config.schema.fields.clone(),
        }
    }

    /// Parses, flattens and type checks a raw record. Never fails for anything but that record.
    pub fn validate(&self, raw: &RawRecord) -> Result<Record, ValidationError> {
        let reject = |reason| ValidationError {
            partition: raw.partition,
            offset: raw.offset,
            reason,
            raw: raw.bytes.clone(),
        };

        let text = std::str::from_utf8(&raw.bytes)
            .map_err(|e| reject(ValidationReason::MalformedEncoding(e.to_string())))?;
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| reject(ValidationReason::MalformedEncoding(e.to_string())))?;
        let Value::Object(object) = Value::from(json) else {
            return Err(reject(ValidationReason::MalformedEncoding(
                "payload is not a JSON object".into(),
            )));
        };
        let mut payload = value::flatten(object);

        for spec in &self.fields {
            match payload.remove(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(reject(ValidationReason::MissingField(spec.name.clone())));
                }
                None => {}
                Some(Value::Null) => {
                    payload.insert(spec.name.clone(), Value::Null);
                }
                Some(found) => {
                    let cast = found.cast(spec.value_type).map_err(|e| {
                        reject(ValidationReason::TypeMismatch {
                            field: spec.name.clone(),
                            expected: e.expected,
                            found: e.found,
                        })
                    })?;
                    payload.insert(spec.name.clone(), cast);
                }
            }
        }

        let key = grouping_key(&payload, &self.key_field)
            .ok_or_else(|| reject(ValidationReason::MissingField(self.key_field.clone())))?;

        Ok(Record {
            partition: raw.partition,
            offset: raw.offset,
            event_time: raw.event_time,
            ingest_time: Utc::now(),
            key,
            payload,
        })
    }
}

fn grouping_key(payload: &BTreeMap<String, Value>, key_field: &str) -> Option<String> {
    match payload.get(key_field)? {
        Value::Null | Value::Array(_) | Value::Object(_) => None,
        scalar => Some(scalar.canonical()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::SchemaConfig;

    fn validator() -> Validator {
        Validator::new(&PipelineConfig {
            schema: SchemaConfig {
                key_field: "user.id".into(),
                fields: vec![
                    FieldSpec::required("user.id", ValueType::String),
                    FieldSpec::required("amount", ValueType::Float),
                    FieldSpec::optional("ts", ValueType::Timestamp),
                ],
            },
            ..Default::default()
        })
    }

    fn raw(bytes: &'static [u8]) -> RawRecord {
        RawRecord {
            partition: 1,
            offset: 9,
            event_time: Utc.timestamp_millis_opt(1_000).unwrap(),
            bytes: Bytes::from_static(bytes),
        }
    }

    #[test]
    fn validates_and_casts() {
        let record = validator()
            .validate(&raw(br#"{"user": {"id": 42}, "amount": 3, "ts": "1970-01-01T00:00:01Z", "extra": true}"#))
            .unwrap();
        assert_eq!(record.key, "42");
        assert_eq!(record.field("user.id"), Some(&Value::String("42".into())));
        assert_eq!(record.field("amount"), Some(&Value::Float(3.0)));
        assert_eq!(record.field("ts"), Some(&Value::Int(1000)));
        assert_eq!(record.field("extra"), Some(&Value::Bool(true)));
        assert_eq!(record.offset, 9);
        assert_eq!(record.event_time.timestamp_millis(), 1_000);
    }

    #[test]
    fn missing_required_field() {
        let err = validator()
            .validate(&raw(br#"{"user": {"id": "a"}}"#))
            .unwrap_err();
        assert_eq!(err.reason, ValidationReason::MissingField("amount".into()));
        assert_eq!(err.raw, Bytes::from_static(br#"{"user": {"id": "a"}}"#));
    }

    #[test]
    fn type_mismatch() {
        let err = validator()
            .validate(&raw(br#"{"user": {"id": "a"}, "amount": "lots"}"#))
            .unwrap_err();
        assert_eq!(
            err.reason,
            ValidationReason::TypeMismatch {
                field: "amount".into(),
                expected: ValueType::Float,
                found: "string",
            }
        );
    }

    #[test]
    fn malformed_encoding() {
        for bytes in [&b"\xff\xfe"[..], b"{not json", b"[1, 2]"] {
            let err = validator()
                .validate(&RawRecord {
                    bytes: Bytes::copy_from_slice(bytes),
                    ..raw(b"")
                })
                .unwrap_err();
            assert!(matches!(err.reason, ValidationReason::MalformedEncoding(_)));
        }
    }

    #[test]
    fn quarantined_record_keeps_raw_bytes() {
        let err = validator().validate(&raw(b"\xff")).unwrap_err();
        let quarantined = QuarantinedRecord::from(&err);
        assert_eq!(quarantined.raw, BASE64_STANDARD.encode(b"\xff"));
        assert_eq!(quarantined.idempotency_key(), "1-9");
        assert!(quarantined.reason.starts_with("malformed encoding"));
    }
}
