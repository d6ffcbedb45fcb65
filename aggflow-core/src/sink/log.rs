use tracing::info;

use crate::sink::{Sink, SinkItem, SinkPayload, SinkResponse, SinkRole};

pub struct LogSink {
    role: SinkRole,
}

impl LogSink {
    pub fn new(role: SinkRole) -> Self {
        Self { role }
    }
}

impl Sink for LogSink {
    async fn write(&mut self, items: Vec<SinkItem>) -> crate::Result<Vec<SinkResponse>> {
        let mut result = Vec::with_capacity(items.len());
        for item in items {
            match &item.payload {
                SinkPayload::Aggregate(agg) => info!(
                    sink = %self.role,
                    id = %item.id,
                    window = %agg.window,
                    count = agg.record_count,
                    values = %serde_json::to_string(&agg.values).unwrap_or_default(),
                    "Window result"
                ),
                SinkPayload::Record(record) | SinkPayload::Late(record) => info!(
                    sink = %self.role,
                    id = %item.id,
                    key = %record.key,
                    event_time = record.event_time.timestamp_millis(),
                    "Record"
                ),
                SinkPayload::Quarantined(quarantined) => info!(
                    sink = %self.role,
                    id = %item.id,
                    reason = %quarantined.reason,
                    "Quarantined record"
                ),
            }
            result.push(SinkResponse::success(item.id));
        }
        Ok(result)
    }
}
