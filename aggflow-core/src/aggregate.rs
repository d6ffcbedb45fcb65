use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AggregationSpec;
use crate::message::{AggregateResult, Record, WindowKey, WindowState};
use crate::window::WindowOperation;

/// Partial states and their merge.
pub mod accumulator;
/// HyperLogLog sketch behind `approx_distinct`.
pub mod hll;

pub use accumulator::Accumulator;

/// A window together with its accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub state: WindowState,
    pub accumulator: Accumulator,
    /// Bumped every time the window key is finalized, part of the result's idempotency key.
    pub finalize_epoch: u64,
}

/// In-flight state of one window as carried by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub window: WindowKey,
    pub state: WindowState,
    pub accumulator: Accumulator,
    pub finalize_epoch: u64,
}

/// Window accumulators owned by one shard. Only that shard touches it, so it needs no locking.
#[derive(Debug)]
pub struct AggregateStore {
    aggregations: Arc<[AggregationSpec]>,
    windows: BTreeMap<WindowKey, WindowEntry>,
}

impl AggregateStore {
    pub fn new(aggregations: Arc<[AggregationSpec]>) -> Self {
        Self {
            aggregations,
            windows: BTreeMap::new(),
        }
    }

    fn fresh_entry(&self) -> WindowEntry {
        WindowEntry {
            state: WindowState::Open,
            accumulator: Accumulator::new(&self.aggregations),
            finalize_epoch: 0,
        }
    }

    /// Folds the record into the window, creating it on first use.
    pub fn update(&mut self, window: &WindowKey, record: &Record) {
        if !self.windows.contains_key(window) {
            let entry = self.fresh_entry();
            self.windows.insert(window.clone(), entry);
        }
        if let Some(entry) = self.windows.get_mut(window) {
            if entry.state != WindowState::Open {
                warn!(%window, state = ?entry.state, "Refusing to fold a record into a closed window");
                return;
            }
            entry.accumulator.update(&self.aggregations, record);
        }
    }

    /// Applies what the window manager decided for the record.
    pub fn apply(&mut self, operation: &WindowOperation, record: &Record) {
        match operation {
            WindowOperation::Open(window) | WindowOperation::Append(window) => {
                self.update(window, record)
            }
            WindowOperation::Expand { from, to } => {
                let entry = self.windows.remove(from).unwrap_or_else(|| self.fresh_entry());
                self.windows.insert(to.clone(), entry);
                self.update(to, record);
            }
            WindowOperation::Merge { from, into } => {
                let mut merged = self.fresh_entry();
                for window in from {
                    if let Some(entry) = self.windows.remove(window) {
                        merged.accumulator.merge(&entry.accumulator);
                        merged.finalize_epoch = merged.finalize_epoch.max(entry.finalize_epoch);
                    }
                }
                self.windows.insert(into.clone(), merged);
                self.update(into, record);
            }
        }
    }

    /// Associative, commutative merge of two partial aggregates.
    pub fn merge(a: &Accumulator, b: &Accumulator) -> Accumulator {
        a.clone().merged(b)
    }

    pub fn mark_closing(&mut self, window: &WindowKey) {
        if let Some(entry) = self.windows.get_mut(window)
            && entry.state == WindowState::Open
        {
            entry.state = WindowState::Closing;
        }
    }

    /// Extracts the immutable result and marks the window FINALIZED, making it eligible for
    /// eviction once a checkpoint commits.
    pub fn finalize(&mut self, window: &WindowKey) -> Option<AggregateResult> {
        let entry = self.windows.get_mut(window)?;
        if entry.state == WindowState::Finalized {
            return None;
        }
        entry.state = WindowState::Finalized;
        let result = AggregateResult {
            window: window.clone(),
            values: entry.accumulator.results(),
            record_count: entry.accumulator.record_count,
            finalize_epoch: entry.finalize_epoch,
        };
        entry.finalize_epoch += 1;
        Some(result)
    }

    pub fn state(&self, window: &WindowKey) -> Option<WindowState> {
        self.windows.get(window).map(|e| e.state)
    }

    pub fn accumulator(&self, window: &WindowKey) -> Option<&Accumulator> {
        self.windows.get(window).map(|e| &e.accumulator)
    }

    /// Copies the OPEN and CLOSING windows. FINALIZED ones are already with the sinks.
    pub fn snapshot(&self) -> Vec<WindowSnapshot> {
        self.windows
            .iter()
            .filter(|(_, e)| e.state != WindowState::Finalized)
            .map(|(window, e)| WindowSnapshot {
                window: window.clone(),
                state: e.state,
                accumulator: e.accumulator.clone(),
                finalize_epoch: e.finalize_epoch,
            })
            .collect()
    }

    pub fn finalized(&self) -> Vec<WindowKey> {
        self.windows
            .iter()
            .filter(|(_, e)| e.state == WindowState::Finalized)
            .map(|(w, _)| w.clone())
            .collect()
    }

    /// Drops the given windows if they are FINALIZED. Returns how many went away.
    pub fn evict(&mut self, windows: &[WindowKey]) -> usize {
        let mut evicted = 0;
        for window in windows {
            if self
                .windows
                .get(window)
                .is_some_and(|e| e.state == WindowState::Finalized)
            {
                self.windows.remove(window);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn restore(&mut self, snapshot: WindowSnapshot) {
        self.windows.insert(
            snapshot.window,
            WindowEntry {
                // a window caught mid-finalization is finalized again after the restart
                state: WindowState::Open,
                accumulator: snapshot.accumulator,
                finalize_epoch: snapshot.finalize_epoch,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::config::AggFunction;
    use crate::value::Value;

    fn store() -> AggregateStore {
        AggregateStore::new(Arc::from(vec![
            AggregationSpec::count(),
            AggregationSpec::new("total", AggFunction::Sum, Some("v")),
        ]))
    }

    fn window(key: &str, start: i64, end: i64) -> WindowKey {
        WindowKey::new(
            key,
            Utc.timestamp_millis_opt(start).unwrap(),
            Utc.timestamp_millis_opt(end).unwrap(),
        )
    }

    fn record(offset: u64, v: i64) -> Record {
        Record {
            partition: 0,
            offset,
            event_time: Utc.timestamp_millis_opt(0).unwrap(),
            ingest_time: Utc::now(),
            key: "A".into(),
            payload: [("v".to_string(), Value::Int(v))].into_iter().collect(),
        }
    }

    #[test]
    fn update_then_finalize() {
        let mut store = store();
        let w = window("A", 0, 10);
        store.update(&w, &record(0, 2));
        store.update(&w, &record(1, 5));
        assert_eq!(store.state(&w), Some(WindowState::Open));

        store.mark_closing(&w);
        assert_eq!(store.state(&w), Some(WindowState::Closing));
        let result = store.finalize(&w).unwrap();
        assert_eq!(result.record_count, 2);
        assert_eq!(result.values["count"], Value::Int(2));
        assert_eq!(result.values["total"], Value::Int(7));
        assert_eq!(result.finalize_epoch, 0);
        assert_eq!(result.idempotency_key(), "A:0-10:0");

        // a finalized window is neither finalized twice nor updated
        assert!(store.finalize(&w).is_none());
        store.update(&w, &record(2, 100));
        assert_eq!(store.accumulator(&w).unwrap().record_count, 2);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn session_merge_and_expand_keep_accumulators() {
        let mut store = store();
        let a = window("A", 0, 10);
        let b = window("A", 20, 30);
        store.apply(&WindowOperation::Open(a.clone()), &record(0, 1));
        store.apply(&WindowOperation::Open(b.clone()), &record(1, 2));

        let expanded = window("A", 20, 35);
        store.apply(
            &WindowOperation::Expand {
                from: b.clone(),
                to: expanded.clone(),
            },
            &record(2, 3),
        );
        assert_eq!(store.state(&b), None);
        assert_eq!(store.accumulator(&expanded).unwrap().record_count, 2);

        let merged = window("A", 0, 35);
        store.apply(
            &WindowOperation::Merge {
                from: vec![a.clone(), expanded.clone()],
                into: merged.clone(),
            },
            &record(3, 4),
        );
        assert_eq!(store.len(), 1);
        let result = store.finalize(&merged).unwrap();
        assert_eq!(result.values["total"], Value::Int(10));
        assert_eq!(result.record_count, 4);
    }

    #[test]
    fn snapshot_restore_and_evict() {
        let mut store = store();
        let open = window("A", 0, 10);
        let done = window("B", 0, 10);
        store.update(&open, &record(0, 1));
        store.update(&done, &record(1, 1));
        store.finalize(&done);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].window, open);

        assert_eq!(store.finalized(), vec![done.clone()]);
        assert_eq!(store.evict(&[done.clone(), open.clone()]), 1);
        assert_eq!(store.len(), 1);

        let mut restored = AggregateStore::new(Arc::from(vec![AggregationSpec::count()]));
        for s in snapshot {
            restored.restore(s);
        }
        assert_eq!(restored.accumulator(&open), store.accumulator(&open));
    }
}
