//! A record with event time `t` belongs to every window `[s, s + size)` with `s` a multiple of the
//! stride and `s <= t < s + size`. With a size of 30s and a stride of 10s, `t = 100s` lands in
//! `[100, 130)`, `[90, 120)` and `[80, 110)`.

use std::collections::BTreeSet;

use chrono::TimeDelta;

use crate::message::{Record, WindowKey};
use crate::window::{WindowOperation, truncate_to_duration, utc_from_millis};

#[derive(Debug)]
pub struct SlidingWindowManager {
    size: TimeDelta,
    stride: TimeDelta,
    active_windows: BTreeSet<WindowKey>,
}

impl SlidingWindowManager {
    pub(crate) fn new(size: TimeDelta, stride: TimeDelta) -> Self {
        Self {
            size,
            stride,
            active_windows: BTreeSet::new(),
        }
    }

    /// Windows containing the record, latest start first.
    pub(crate) fn assign(&self, record: &Record) -> Vec<WindowKey> {
        let size_millis = self.size.num_milliseconds();
        let stride_millis = self.stride.num_milliseconds();
        let event_millis = record.event_time.timestamp_millis();

        // the latest window containing the event starts at the last stride boundary before it,
        // the others are found by stepping back one stride at a time
        let mut start = truncate_to_duration(event_millis, stride_millis);
        let mut windows = Vec::new();
        while start <= event_millis && event_millis < start.saturating_add(size_millis) {
            windows.push(WindowKey::new(
                record.key.clone(),
                utc_from_millis(start),
                utc_from_millis(start.saturating_add(size_millis)),
            ));
            start = start.saturating_sub(stride_millis);
        }
        windows
    }

    pub(crate) fn place(&mut self, windows: Vec<WindowKey>) -> Vec<WindowOperation> {
        windows
            .into_iter()
            .map(|window| {
                if self.active_windows.insert(window.clone()) {
                    WindowOperation::Open(window)
                } else {
                    WindowOperation::Append(window)
                }
            })
            .collect()
    }

    pub(crate) fn is_open(&self, window: &WindowKey) -> bool {
        self.active_windows.contains(window)
    }

    pub(crate) fn advance(&mut self, closes: impl Fn(&WindowKey) -> bool) -> Vec<WindowKey> {
        let mut closed = Vec::new();
        self.active_windows.retain(|w| {
            if closes(w) {
                closed.push(w.clone());
                false
            } else {
                true
            }
        });
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

    fn manager() -> SlidingWindowManager {
        SlidingWindowManager::new(TimeDelta::seconds(30), TimeDelta::seconds(10))
    }

    #[test]
    fn assigns_all_overlapping_windows() {
        let windows = manager().assign(&record_at("A", 100_000));
        assert_eq!(
            windows,
            vec![
                WindowKey::new("A", t(100_000), t(130_000)),
                WindowKey::new("A", t(90_000), t(120_000)),
                WindowKey::new("A", t(80_000), t(110_000)),
            ]
        );

        let windows = manager().assign(&record_at("A", 105_000));
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(|w| w.contains(t(105_000))));
    }

    #[test]
    fn assignment_is_deterministic() {
        let manager = manager();
        let record = record_at("A", 123_456);
        assert_eq!(manager.assign(&record), manager.assign(&record));
    }

    #[test]
    fn closes_only_expired_windows_in_start_order() {
        let mut manager = manager();
        for ms in [100_000, 95_000] {
            let windows = manager.assign(&record_at("A", ms));
            manager.place(windows);
        }
        // [70,100) [80,110) [90,120) [100,130)
        assert_eq!(manager.len(), 4);
        let closed = manager.advance(|w| w.end <= t(110_000));
        assert_eq!(
            closed,
            vec![
                WindowKey::new("A", t(70_000), t(100_000)),
                WindowKey::new("A", t(80_000), t(110_000)),
            ]
        );
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn reopening_is_an_append() {
        let mut manager = manager();
        let windows = manager.assign(&record_at("A", 100_000));
        assert!(manager.place(windows.clone()).iter().all(|op| matches!(op, WindowOperation::Open(_))));
        assert!(manager.place(windows).iter().all(|op| matches!(op, WindowOperation::Append(_))));
    }
}
