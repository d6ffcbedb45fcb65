use std::collections::BTreeSet;

use chrono::TimeDelta;

use crate::message::{Record, WindowKey};
use crate::window::{WindowOperation, truncate_to_duration, utc_from_millis};

#[derive(Debug)]
pub struct TumblingWindowManager {
    /// Duration of each window
    size: TimeDelta,
    /// Open windows, sorted by start
    active_windows: BTreeSet<WindowKey>,
}

impl TumblingWindowManager {
    pub(crate) fn new(size: TimeDelta) -> Self {
        Self {
            size,
            active_windows: BTreeSet::new(),
        }
    }

    pub(crate) fn assign(&self, record: &Record) -> Vec<WindowKey> {
        let size_millis = self.size.num_milliseconds();
        let start_millis = truncate_to_duration(record.event_time.timestamp_millis(), size_millis);
        vec![WindowKey::new(
            record.key.clone(),
            utc_from_millis(start_millis),
            utc_from_millis(start_millis.saturating_add(size_millis)),
        )]
    }

    pub(crate) fn place(&mut self, windows: Vec<WindowKey>) -> Vec<WindowOperation> {
        windows
            .into_iter()
            .map(|window| {
                if self.active_windows.contains(&window) {
                    WindowOperation::Append(window)
                } else {
                    self.active_windows.insert(window.clone());
                    WindowOperation::Open(window)
                }
            })
            .collect()
    }

    pub(crate) fn is_open(&self, window: &WindowKey) -> bool {
        self.active_windows.contains(window)
    }

    /// Closes the windows the predicate selects. The set is ordered by start, so is the result.
    pub(crate) fn advance(&mut self, closes: impl Fn(&WindowKey) -> bool) -> Vec<WindowKey> {
        let closed: Vec<_> = self.active_windows.iter().filter(|w| closes(w)).cloned().collect();
        for window in &closed {
            self.active_windows.remove(window);
        }
        closed
    }

    pub(crate) fn restore(&mut self, window: WindowKey) {
        self.active_windows.insert(window);
    }

    pub(crate) fn len(&self) -> usize {
        self.active_windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::tests::{record_at, t};
    use crate::window::{WindowManager, expired};
    use crate::config::WindowConfig;

    #[test]
    fn assigns_exactly_one_window() {
        let manager = TumblingWindowManager::new(TimeDelta::seconds(60));
        let windows = manager.assign(&record_at("A", 61_000));
        assert_eq!(windows, vec![WindowKey::new("A", t(60_000), t(120_000))]);

        // the end is exclusive
        let windows = manager.assign(&record_at("A", 120_000));
        assert_eq!(windows, vec![WindowKey::new("A", t(120_000), t(180_000))]);
    }

    #[test]
    fn opens_then_appends() {
        let mut manager = TumblingWindowManager::new(TimeDelta::seconds(60));
        let first = manager.assign(&record_at("A", 1_000));
        let ops = manager.place(first.clone());
        assert_eq!(ops, vec![WindowOperation::Open(first[0].clone())]);
        let ops = manager.place(manager.assign(&record_at("A", 59_999)));
        assert_eq!(ops, vec![WindowOperation::Append(first[0].clone())]);
        // another key gets its own window
        let ops = manager.place(manager.assign(&record_at("B", 1_000)));
        assert!(matches!(ops.as_slice(), [WindowOperation::Open(w)] if w.key == "B"));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn closes_in_ascending_start_order() {
        let mut manager = WindowManager::new(&WindowConfig::Tumbling { size_ms: 10_000 });
        for (key, ms) in [("A", 25_000), ("A", 5_000), ("B", 15_000), ("A", 15_000), ("A", 45_000)] {
            let record = record_at(key, ms);
            let windows = manager.assign(&record);
            manager.place(&record, windows);
        }
        let closed = manager.advance(t(30_000), TimeDelta::zero());
        let starts: Vec<_> = closed.iter().map(|w| (w.start.timestamp_millis(), w.key.as_str())).collect();
        assert_eq!(
            starts,
            vec![(0, "A"), (10_000, "A"), (10_000, "B"), (20_000, "A")]
        );
        assert!(closed.iter().all(|w| expired(w, t(30_000), TimeDelta::zero())));
        assert_eq!(manager.open_windows(), 1);
    }
}
