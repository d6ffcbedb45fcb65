//! Event-time progress.
//!
//! Every partition tracks the highest event time it has seen. Its watermark is that maximum minus
//! the allowed lateness, so it can only move forward. The global watermark, which drives window
//! finalization, is the minimum over the partitions that are not idle: a partition that has not
//! produced a record for `idle_timeout` stops holding everybody else back, and a partition that has
//! never produced anything holds the global watermark at "unknown" unless it is idle.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::message::PartitionId;

#[derive(Debug, Clone)]
struct PartitionWatermark {
    max_seen: Option<DateTime<Utc>>,
    last_active: Instant,
}

#[derive(Debug)]
struct TrackerState {
    partitions: BTreeMap<PartitionId, PartitionWatermark>,
    /// Last global watermark handed out, the global watermark never goes below it.
    last_global: Option<DateTime<Utc>>,
}

/// Shared by all partition readers. Reads and writes are short critical sections.
#[derive(Debug)]
pub struct WatermarkTracker {
    allowed_lateness: TimeDelta,
    idle_timeout: Option<Duration>,
    state: RwLock<TrackerState>,
}

/// Per-partition max-seen event times plus the global watermark, as stored in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkSnapshot {
    pub max_seen: BTreeMap<PartitionId, DateTime<Utc>>,
    pub global: Option<DateTime<Utc>>,
}

impl WatermarkTracker {
    pub fn new(
        partitions: &[PartitionId],
        allowed_lateness: TimeDelta,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        let partitions = partitions
            .iter()
            .map(|p| {
                (
                    *p,
                    PartitionWatermark {
                        max_seen: None,
                        last_active: now,
                    },
                )
            })
            .collect();
        Self {
            allowed_lateness,
            idle_timeout,
            state: RwLock::new(TrackerState {
                partitions,
                last_global: None,
            }),
        }
    }

    /// Records that the partition has seen `event_time`.
    pub fn observe(&self, partition: PartitionId, event_time: DateTime<Utc>) {
        let mut state = self.state.write();
        let entry = state
            .partitions
            .entry(partition)
            .or_insert_with(|| PartitionWatermark {
                max_seen: None,
                last_active: Instant::now(),
            });
        entry.last_active = Instant::now();
        if entry.max_seen.is_none_or(|max| event_time > max) {
            entry.max_seen = Some(event_time);
        }
    }

    /// `max_seen - allowed_lateness` of the partition, `None` until it has seen a record.
    pub fn watermark(&self, partition: PartitionId) -> Option<DateTime<Utc>> {
        let state = self.state.read();
        let max_seen = state.partitions.get(&partition)?.max_seen?;
        Some(self.lower_by_lateness(max_seen))
    }

    /// Current global watermark, never lower than one handed out before.
    pub fn global(&self) -> Option<DateTime<Utc>> {
        let state = self.state.read();
        let candidate = self.candidate(&state);
        max_option(state.last_global, candidate)
    }

    /// Recomputes the global watermark and returns it when it moved forward since the last call.
    /// Exactly one caller observes each advance, which lets that caller broadcast it.
    pub fn advance_global(&self) -> Option<DateTime<Utc>> {
        let mut state = self.state.write();
        let candidate = self.candidate(&state)?;
        if state.last_global.is_some_and(|last| candidate <= last) {
            return None;
        }
        debug!(watermark = %candidate, "Global watermark advanced");
        state.last_global = Some(candidate);
        Some(candidate)
    }

    pub fn snapshot(&self) -> WatermarkSnapshot {
        let state = self.state.read();
        WatermarkSnapshot {
            max_seen: state
                .partitions
                .iter()
                .filter_map(|(p, w)| w.max_seen.map(|t| (*p, t)))
                .collect(),
            global: state.last_global,
        }
    }

    /// Restores the state captured by [`WatermarkTracker::snapshot`].
    pub fn restore(&self, snapshot: &WatermarkSnapshot) {
        let mut state = self.state.write();
        let now = Instant::now();
        for (partition, max_seen) in &snapshot.max_seen {
            let entry = state
                .partitions
                .entry(*partition)
                .or_insert_with(|| PartitionWatermark {
                    max_seen: None,
                    last_active: now,
                });
            entry.max_seen = max_option(entry.max_seen, Some(*max_seen));
        }
        state.last_global = max_option(state.last_global, snapshot.global);
    }

    fn candidate(&self, state: &TrackerState) -> Option<DateTime<Utc>> {
        let now = Instant::now();
        let mut min: Option<DateTime<Utc>> = None;
        let mut active = 0;
        for partition in state.partitions.values() {
            let idle = self
                .idle_timeout
                .is_some_and(|timeout| now.duration_since(partition.last_active) >= timeout);
            if idle {
                continue;
            }
            active += 1;
            // an active partition that never produced anything holds the watermark back
            let wm = self.lower_by_lateness(partition.max_seen?);
            min = Some(min.map_or(wm, |m| m.min(wm)));
        }
        if active == 0 {
            // everyone idles, progress is bounded by the most advanced partition
            return state
                .partitions
                .values()
                .filter_map(|p| p.max_seen)
                .max()
                .map(|t| self.lower_by_lateness(t));
        }
        min
    }

    fn lower_by_lateness(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t.checked_sub_signed(self.allowed_lateness)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn max_option(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn watermark_is_max_seen_minus_lateness() {
        let tracker = WatermarkTracker::new(&[0], TimeDelta::seconds(30), None);
        assert_eq!(tracker.watermark(0), None);
        tracker.observe(0, t(100_000));
        assert_eq!(tracker.watermark(0), Some(t(70_000)));
        assert_eq!(tracker.watermark(7), None);
    }

    #[test]
    fn watermark_never_decreases() {
        let tracker = WatermarkTracker::new(&[0], TimeDelta::seconds(1), None);
        let event_times = [5_000, 3_000, 9_000, 1_000, 9_000, 12_000, 2_000, 11_999];
        let mut previous = None;
        for event_time in event_times {
            tracker.observe(0, t(event_time));
            let current = tracker.watermark(0);
            assert!(current >= previous, "{current:?} < {previous:?}");
            previous = current;
        }
        assert_eq!(previous, Some(t(11_000)));
    }

    #[test]
    fn global_is_min_over_partitions() {
        let tracker = WatermarkTracker::new(&[0, 1], TimeDelta::zero(), None);
        tracker.observe(0, t(10_000));
        // partition 1 has produced nothing yet
        assert_eq!(tracker.global(), None);
        assert_eq!(tracker.advance_global(), None);

        tracker.observe(1, t(4_000));
        assert_eq!(tracker.advance_global(), Some(t(4_000)));
        // no change, nothing to broadcast
        assert_eq!(tracker.advance_global(), None);

        tracker.observe(1, t(20_000));
        assert_eq!(tracker.advance_global(), Some(t(10_000)));
        assert_eq!(tracker.global(), Some(t(10_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_partitions_do_not_hold_back_the_global_watermark() {
        let tracker = WatermarkTracker::new(&[0, 1], TimeDelta::zero(), Some(Duration::from_secs(5)));
        tracker.observe(0, t(1_000));
        tracker.observe(1, t(2_000));
        assert_eq!(tracker.advance_global(), Some(t(1_000)));

        tokio::time::advance(Duration::from_secs(3)).await;
        tracker.observe(1, t(8_000));
        tokio::time::advance(Duration::from_secs(3)).await;
        // partition 0 has been quiet for 6s
        assert_eq!(tracker.advance_global(), Some(t(8_000)));

        // it comes back with an old event time, the global watermark does not regress
        tracker.observe(0, t(1_500));
        assert_eq!(tracker.advance_global(), None);
        assert_eq!(tracker.global(), Some(t(8_000)));
    }

    #[test]
    fn snapshot_and_restore() {
        let tracker = WatermarkTracker::new(&[0, 1], TimeDelta::seconds(1), None);
        tracker.observe(0, t(5_000));
        tracker.observe(1, t(7_000));
        tracker.advance_global();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.global, Some(t(4_000)));

        let restored = WatermarkTracker::new(&[0, 1], TimeDelta::seconds(1), None);
        restored.restore(&snapshot);
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.watermark(1), Some(t(6_000)));
    }
}
