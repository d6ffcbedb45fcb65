//! Produces `rpu` JSON events per partition every `duration_ms`. The payload of an offset is
//! derived from a seed of `(partition, offset)`, so a partition replayed from a checkpoint yields
//! the same keys and amounts again. Event times trail the wall clock by a random amount of up to
//! `max_out_of_order_ms`.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::Error;
use crate::Result;
use crate::config::GeneratorConfig;
use crate::message::{Offset, PartitionId, RawRecord};
use crate::source::Source;

#[derive(Debug)]
struct PartitionState {
    next_offset: Offset,
    /// Records that may still be produced in the current time unit.
    budget: usize,
    next_tick: Instant,
}

pub struct GeneratorSource {
    config: GeneratorConfig,
    unit: Duration,
    partitions: Mutex<BTreeMap<PartitionId, PartitionState>>,
}

impl GeneratorSource {
    pub fn new(config: GeneratorConfig) -> Self {
        let now = Instant::now();
        let partitions = (0..config.partitions)
            .map(|partition| {
                (
                    partition,
                    PartitionState {
                        next_offset: 0,
                        budget: config.rpu,
                        next_tick: now,
                    },
                )
            })
            .collect();
        Self {
            unit: Duration::from_millis(config.duration_ms.max(1)),
            config,
            partitions: Mutex::new(partitions),
        }
    }

    fn payload(&self, partition: PartitionId, offset: Offset) -> (Bytes, i64) {
        let seed = (u64::from(partition) << 48) ^ offset;
        let mut rng = StdRng::seed_from_u64(seed);
        let key = rng.random_range(0..self.config.key_count);
        let amount: f64 = rng.random_range(0.0..100.0);
        let lag_ms = if self.config.max_out_of_order_ms == 0 {
            0
        } else {
            rng.random_range(0..=self.config.max_out_of_order_ms) as i64
        };
        let body = serde_json::json!({
            "key": format!("key-{key}"),
            "value": offset,
            "amount": (amount * 100.0).round() / 100.0,
        });
        (Bytes::from(body.to_string()), lag_ms)
    }
}

impl Source for GeneratorSource {
    fn partitions(&self) -> Vec<PartitionId> {
        (0..self.config.partitions).collect()
    }

    async fn poll(&self, partition: PartitionId, max_records: usize) -> Result<Vec<RawRecord>> {
        let (first, count) = {
            let mut partitions = self.partitions.lock();
            let state = partitions
                .get_mut(&partition)
                .ok_or_else(|| Error::Source(format!("generator has no partition {partition}")))?;

            let now = Instant::now();
            if now >= state.next_tick {
                state.budget = self.config.rpu;
                state.next_tick = now + self.unit;
            }

            let mut count = state.budget.min(max_records);
            if let Some(limit) = self.config.records_per_partition {
                let left = limit.saturating_sub(state.next_offset);
                count = count.min(usize::try_from(left).unwrap_or(usize::MAX));
            }
            let first = state.next_offset;
            state.next_offset += count as u64;
            state.budget -= count;
            (first, count)
        };

        let now = Utc::now();
        Ok((first..first + count as u64)
            .map(|offset| {
                let (bytes, lag_ms) = self.payload(partition, offset);
                RawRecord {
                    partition,
                    offset,
                    event_time: now - TimeDelta::milliseconds(lag_ms),
                    bytes,
                }
            })
            .collect())
    }

    async fn seek(&self, partition: PartitionId, offset: Offset) -> Result<()> {
        let mut partitions = self.partitions.lock();
        let state = partitions
            .get_mut(&partition)
            .ok_or_else(|| Error::Source(format!("generator has no partition {partition}")))?;
        state.next_offset = offset;
        Ok(())
    }

    fn is_exhausted(&self, partition: PartitionId) -> bool {
        let Some(limit) = self.config.records_per_partition else {
            return false;
        };
        self.partitions
            .lock()
            .get(&partition)
            .is_none_or(|state| state.next_offset >= limit)
    }
}
