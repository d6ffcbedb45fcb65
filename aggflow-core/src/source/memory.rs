use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::Error;
use crate::Result;
use crate::message::{Offset, PartitionId, RawRecord};
use crate::source::Source;

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of a record is its index.
    records: Vec<(DateTime<Utc>, Bytes)>,
    position: Offset,
    /// Offsets at or beyond the limit are not visible yet.
    limit: Option<Offset>,
}

#[derive(Debug, Default)]
struct State {
    partitions: BTreeMap<PartitionId, PartitionLog>,
    fail_polls: usize,
}

/// Partitioned log held in memory. Clones share the log, so records can be appended while a
/// pipeline is consuming it.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<State>>,
}

impl MemorySource {
    pub fn new(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        let source = Self::default();
        {
            let mut state = source.state.lock();
            for partition in partitions {
                state.partitions.entry(partition).or_default();
            }
        }
        source
    }

    /// Appends a record and returns its offset.
    pub fn push(&self, partition: PartitionId, event_time: DateTime<Utc>, bytes: Bytes) -> Offset {
        let mut state = self.state.lock();
        let log = state.partitions.entry(partition).or_default();
        log.records.push((event_time, bytes));
        (log.records.len() - 1) as Offset
    }

    /// Hides every offset at or beyond `limit` until [`MemorySource::unlimit`] is called.
    pub fn limit(&self, partition: PartitionId, limit: Offset) {
        if let Some(log) = self.state.lock().partitions.get_mut(&partition) {
            log.limit = Some(limit);
        }
    }

    pub fn unlimit(&self, partition: PartitionId) {
        if let Some(log) = self.state.lock().partitions.get_mut(&partition) {
            log.limit = None;
        }
    }

    /// The next `polls` polls fail with [`Error::SourceUnavailable`].
    pub fn fail_next_polls(&self, polls: usize) {
        self.state.lock().fail_polls = polls;
    }

    /// Position of the next poll of the partition.
    pub fn position(&self, partition: PartitionId) -> Option<Offset> {
        self.state.lock().partitions.get(&partition).map(|log| log.position)
    }
}

impl Source for MemorySource {
    fn partitions(&self) -> Vec<PartitionId> {
        self.state.lock().partitions.keys().copied().collect()
    }

    async fn poll(&self, partition: PartitionId, max_records: usize) -> Result<Vec<RawRecord>> {
        let mut state = self.state.lock();
        if state.fail_polls > 0 {
            state.fail_polls -= 1;
            return Err(Error::SourceUnavailable(format!(
                "partition {partition} is unavailable"
            )));
        }
        let log = state
            .partitions
            .get_mut(&partition)
            .ok_or_else(|| Error::Source(format!("no partition {partition}")))?;

        let visible = log
            .limit
            .map_or(log.records.len() as Offset, |limit| limit.min(log.records.len() as Offset));
        let end = visible.min(log.position.saturating_add(max_records as Offset));
        let records = (log.position..end)
            .filter_map(|offset| {
                let (event_time, bytes) = log.records.get(usize::try_from(offset).ok()?)?;
                Some(RawRecord {
                    partition,
                    offset,
                    event_time: *event_time,
                    bytes: bytes.clone(),
                })
            })
            .collect();
        log.position = log.position.max(end);
        Ok(records)
    }

    async fn seek(&self, partition: PartitionId, offset: Offset) -> Result<()> {
        let mut state = self.state.lock();
        let log = state
            .partitions
            .get_mut(&partition)
            .ok_or_else(|| Error::Source(format!("no partition {partition}")))?;
        log.position = offset;
        Ok(())
    }

    fn is_exhausted(&self, partition: PartitionId) -> bool {
        self.state
            .lock()
            .partitions
            .get(&partition)
            .is_none_or(|log| log.limit.is_none() && log.position >= log.records.len() as Offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::test_utils::{event, utc};

    #[tokio::test]
    async fn polls_in_offset_order_up_to_the_limit() {
        let source = MemorySource::new([0]);
        for i in 0..5 {
            assert_eq!(source.push(0, utc(i * 1_000), event("A", i)), i as u64);
        }
        source.limit(0, 3);

        let polled = source.poll(0, 2).await.unwrap();
        assert_eq!(polled.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
        let polled = source.poll(0, 10).await.unwrap();
        assert_eq!(polled.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2]);
        assert!(source.poll(0, 10).await.unwrap().is_empty());
        assert!(!source.is_exhausted(0));

        source.unlimit(0);
        assert_eq!(source.poll(0, 10).await.unwrap().len(), 2);
        assert!(source.is_exhausted(0));

        source.seek(0, 1).await.unwrap();
        assert_eq!(source.poll(0, 1).await.unwrap()[0].offset, 1);
    }

    #[tokio::test]
    async fn injected_unavailability() {
        let source = MemorySource::new([0]);
        source.push(0, utc(0), event("A", 1));
        source.fail_next_polls(1);
        assert!(matches!(
            source.poll(0, 1).await,
            Err(Error::SourceUnavailable(_))
        ));
        assert_eq!(source.poll(0, 1).await.unwrap().len(), 1);
    }
}
