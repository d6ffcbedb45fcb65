//! Session windows per grouping key. A record at `t` covers `[t, t + gap)`; it joins every open
//! session of its key that overlaps that range. Joining one session may expand it, joining several
//! merges them (and their accumulators) into a single session spanning all of them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;

use crate::message::{Record, WindowKey};
use crate::window::{WindowOperation, utc_from_millis};

#[derive(Debug)]
pub struct SessionWindowManager {
    gap: TimeDelta,
    /// Open sessions per key, sorted by start. Sessions of one key never overlap.
    sessions: BTreeMap<String, BTreeSet<WindowKey>>,
}

fn overlaps(a: &WindowKey, b: &WindowKey) -> bool {
    a.start < b.end && b.start < a.end
}

impl SessionWindowManager {
    pub(crate) fn new(gap: TimeDelta) -> Self {
        Self {
            gap,
            sessions: BTreeMap::new(),
        }
    }

    pub(crate) fn assign(&self, record: &Record) -> Vec<WindowKey> {
        let start = record.event_time.timestamp_millis();
        vec![WindowKey::new(
            record.key.clone(),
            utc_from_millis(start),
            utc_from_millis(start.saturating_add(self.gap.num_milliseconds())),
        )]
    }

    fn overlapping(&self, window: &WindowKey) -> Vec<WindowKey> {
        self.sessions
            .get(&window.key)
            .map(|sessions| sessions.iter().filter(|s| overlaps(s, window)).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn place(&mut self, record: &Record, windows: Vec<WindowKey>) -> Vec<WindowOperation> {
        let mut operations = Vec::with_capacity(windows.len());
        for window in windows {
            debug_assert_eq!(window.key, record.key);
            let joined = self.overlapping(&window);
            let sessions = self.sessions.entry(window.key.clone()).or_default();

            let operation = match joined.as_slice() {
                [] => {
                    sessions.insert(window.clone());
                    WindowOperation::Open(window)
                }
                [session] if session.start <= window.start && window.end <= session.end => {
                    WindowOperation::Append(session.clone())
                }
                [session] => {
                    let to = WindowKey::new(
                        window.key.clone(),
                        session.start.min(window.start),
                        session.end.max(window.end),
                    );
                    sessions.remove(session);
                    sessions.insert(to.clone());
                    WindowOperation::Expand {
                        from: session.clone(),
                        to,
                    }
                }
                several => {
                    let start = several.iter().map(|s| s.start).chain([window.start]).min();
                    let end = several.iter().map(|s| s.end).chain([window.end]).max();
                    let into = WindowKey::new(
                        window.key.clone(),
                        start.unwrap_or(window.start),
                        end.unwrap_or(window.end),
                    );
                    for session in several {
                        sessions.remove(session);
                    }
                    sessions.insert(into.clone());
                    WindowOperation::Merge {
                        from: several.to_vec(),
                        into,
                    }
                }
            };
            operations.push(operation);
        }
        operations
    }

    /// A late record still joins an open session it overlaps.
    pub(crate) fn is_open(&self, window: &WindowKey) -> bool {
        !self.overlapping(window).is_empty()
    }

    pub(crate) fn advance(&mut self, closes: impl Fn(&WindowKey) -> bool) -> Vec<WindowKey> {
        let mut closed = Vec::new();
        for sessions in self.sessions.values_mut() {
            sessions.retain(|s| {
                if closes(s) {
                    closed.push(s.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.sessions.retain(|_, sessions| !sessions.is_empty());
        closed.sort();
        closed
    }

    pub(crate) fn restore(&mut self, window: WindowKey) {
        self.sessions.entry(window.key.clone()).or_default().insert(window);
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::tests::{record_at, t};

    fn place(manager: &mut SessionWindowManager, key: &str, ms: i64) -> WindowOperation {
        let record = record_at(key, ms);
        let windows = manager.assign(&record);
        let mut ops = manager.place(&record, windows);
        assert_eq!(ops.len(), 1);
        ops.remove(0)
    }

    #[test]
    fn opens_appends_and_expands() {
        let mut manager = SessionWindowManager::new(TimeDelta::seconds(10));
        assert_eq!(
            place(&mut manager, "A", 0),
            WindowOperation::Open(WindowKey::new("A", t(0), t(10_000)))
        );
        // within the gap, the session grows to 5s + gap
        assert_eq!(
            place(&mut manager, "A", 5_000),
            WindowOperation::Expand {
                from: WindowKey::new("A", t(0), t(10_000)),
                to: WindowKey::new("A", t(0), t(15_000)),
            }
        );
        // a record exactly at the session end starts a new session
        assert_eq!(
            place(&mut manager, "A", 15_000),
            WindowOperation::Open(WindowKey::new("A", t(15_000), t(25_000)))
        );
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn bridging_record_merges_sessions() {
        let mut manager = SessionWindowManager::new(TimeDelta::seconds(10));
        place(&mut manager, "A", 0);
        place(&mut manager, "A", 30_000);
        place(&mut manager, "B", 12_000);

        // [8, 18) only touches [0, 10)
        assert!(matches!(place(&mut manager, "A", 8_000), WindowOperation::Expand { .. }));
        // [25, 35) only touches [30, 40)
        assert!(matches!(place(&mut manager, "A", 25_000), WindowOperation::Expand { .. }));
        // [17, 27) bridges [0, 18) and [25, 40)
        let op = place(&mut manager, "A", 17_000);
        assert_eq!(
            op,
            WindowOperation::Merge {
                from: vec![
                    WindowKey::new("A", t(0), t(18_000)),
                    WindowKey::new("A", t(25_000), t(40_000)),
                ],
                into: WindowKey::new("A", t(0), t(40_000)),
            }
        );
        // key B is untouched
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn out_of_order_record_before_session_expands_its_start() {
        let mut manager = SessionWindowManager::new(TimeDelta::seconds(10));
        place(&mut manager, "A", 20_000);
        assert_eq!(
            place(&mut manager, "A", 12_000),
            WindowOperation::Expand {
                from: WindowKey::new("A", t(20_000), t(30_000)),
                to: WindowKey::new("A", t(12_000), t(30_000)),
            }
        );
        assert_eq!(
            place(&mut manager, "A", 13_000),
            WindowOperation::Append(WindowKey::new("A", t(12_000), t(30_000)))
        );
    }

    #[test]
    fn advance_closes_sessions_across_keys_in_start_order() {
        let mut manager = SessionWindowManager::new(TimeDelta::seconds(10));
        place(&mut manager, "B", 1_000);
        place(&mut manager, "A", 2_000);
        place(&mut manager, "A", 50_000);
        let closed = manager.advance(|w| w.end <= t(20_000));
        assert_eq!(
            closed,
            vec![
                WindowKey::new("B", t(1_000), t(11_000)),
                WindowKey::new("A", t(2_000), t(12_000)),
            ]
        );
        assert_eq!(manager.len(), 1);
        assert!(manager.is_open(&WindowKey::new("A", t(55_000), t(65_000))));
        assert!(!manager.is_open(&WindowKey::new("B", t(5_000), t(15_000))));
    }
}
