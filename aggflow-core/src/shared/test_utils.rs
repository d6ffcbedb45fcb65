use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::message::{Offset, PartitionId, RawRecord, Record};
use crate::value::Value;

pub(crate) fn utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

/// A validated record with an `amount` field equal to its offset.
pub(crate) fn record(partition: PartitionId, offset: Offset, key: &str, event_ms: i64) -> Record {
    Record {
        partition,
        offset,
        event_time: utc(event_ms),
        ingest_time: Utc::now(),
        key: key.to_string(),
        payload: BTreeMap::from([
            ("key".to_string(), Value::String(key.to_string())),
            ("amount".to_string(), Value::Int(offset as i64)),
        ]),
    }
}

/// JSON event the way a source would deliver it.
pub(crate) fn event(key: &str, amount: i64) -> Bytes {
    Bytes::from(serde_json::json!({ "key": key, "amount": amount }).to_string())
}

pub(crate) fn raw(partition: PartitionId, offset: Offset, event_ms: i64, bytes: Bytes) -> RawRecord {
    RawRecord {
        partition,
        offset,
        event_time: utc(event_ms),
        bytes,
    }
}
