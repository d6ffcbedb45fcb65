use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::config::{LateDataPolicy, PipelineConfig, WindowConfig};
use crate::config::window::millis;
use crate::message::{Record, WindowKey};

/// Sliding windows, a record lands in `size / stride` windows.
pub(crate) mod sliding;
/// Session windows, merged when a record bridges the inactivity gap.
pub(crate) mod session;
/// Tumbling windows, exactly one window per record.
pub(crate) mod tumbling;

use session::SessionWindowManager;
use sliding::SlidingWindowManager;
use tumbling::TumblingWindowManager;

/// What placing a record did to the set of windows. The aggregate store mirrors it on the
/// accumulators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOperation {
    /// A new window was created for the record.
    Open(WindowKey),
    /// The record joins an existing window.
    Append(WindowKey),
    /// A session grew to cover the record.
    Expand { from: WindowKey, to: WindowKey },
    /// The record bridged sessions which are merged into one.
    Merge { from: Vec<WindowKey>, into: WindowKey },
}

/// Tracks OPEN windows per strategy and decides which of them close on a watermark.
#[derive(Debug)]
pub enum WindowManager {
    Tumbling(TumblingWindowManager),
    Sliding(SlidingWindowManager),
    Session(SessionWindowManager),
}

impl WindowManager {
    pub fn new(config: &WindowConfig) -> Self {
        match *config {
            WindowConfig::Tumbling { size_ms } => {
                WindowManager::Tumbling(TumblingWindowManager::new(millis(size_ms)))
            }
            WindowConfig::Sliding { size_ms, stride_ms } => WindowManager::Sliding(
                SlidingWindowManager::new(millis(size_ms), millis(stride_ms)),
            ),
            WindowConfig::Session { gap_ms } => {
                WindowManager::Session(SessionWindowManager::new(millis(gap_ms)))
            }
        }
    }

    /// All windows the record belongs to, computed from its event time and key alone. For
    /// sessions this is the record's own `[t, t + gap)` window before any merging.
    pub fn assign(&self, record: &Record) -> Vec<WindowKey> {
        match self {
            WindowManager::Tumbling(manager) => manager.assign(record),
            WindowManager::Sliding(manager) => manager.assign(record),
            WindowManager::Session(manager) => manager.assign(record),
        }
    }

    /// Places the record into the given windows (a subset of [`WindowManager::assign`]).
    pub fn place(&mut self, record: &Record, windows: Vec<WindowKey>) -> Vec<WindowOperation> {
        match self {
            WindowManager::Tumbling(manager) => manager.place(windows),
            WindowManager::Sliding(manager) => manager.place(windows),
            WindowManager::Session(manager) => manager.place(record, windows),
        }
    }

    /// Whether the window, or for sessions a session it would join, is currently OPEN.
    pub fn is_open(&self, window: &WindowKey) -> bool {
        match self {
            WindowManager::Tumbling(manager) => manager.is_open(window),
            WindowManager::Sliding(manager) => manager.is_open(window),
            WindowManager::Session(manager) => manager.is_open(window),
        }
    }

    /// Removes and returns the OPEN windows with `end + allowed_lateness <= watermark`, in
    /// ascending window start order.
    pub fn advance(&mut self, watermark: DateTime<Utc>, allowed_lateness: TimeDelta) -> Vec<WindowKey> {
        let closes = |w: &WindowKey| expired(w, watermark, allowed_lateness);
        match self {
            WindowManager::Tumbling(manager) => manager.advance(closes),
            WindowManager::Sliding(manager) => manager.advance(closes),
            WindowManager::Session(manager) => manager.advance(closes),
        }
    }

    /// Re-opens windows restored from a checkpoint.
    pub fn restore(&mut self, window: WindowKey) {
        match self {
            WindowManager::Tumbling(manager) => manager.restore(window),
            WindowManager::Sliding(manager) => manager.restore(window),
            WindowManager::Session(manager) => manager.restore(window),
        }
    }

    pub fn open_windows(&self) -> usize {
        match self {
            WindowManager::Tumbling(manager) => manager.len(),
            WindowManager::Sliding(manager) => manager.len(),
            WindowManager::Session(manager) => manager.len(),
        }
    }
}

/// `end + allowed_lateness <= watermark`. Saturates instead of overflowing near the end of time.
pub(crate) fn expired(window: &WindowKey, watermark: DateTime<Utc>, allowed_lateness: TimeDelta) -> bool {
    match window.end.checked_add_signed(allowed_lateness) {
        Some(deadline) => deadline <= watermark,
        None => watermark == DateTime::<Utc>::MAX_UTC,
    }
}

/// Lower edge of the stride-aligned bucket containing `millis`, also for negative timestamps.
pub(crate) fn truncate_to_duration(millis: i64, duration_millis: i64) -> i64 {
    millis - millis.rem_euclid(duration_millis)
}

pub(crate) fn utc_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(if millis < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// Outcome of checking a record against the late data policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Fold the record into these windows.
    Accept(Vec<WindowKey>),
    /// Every window of the record is past `watermark - allowed_lateness`.
    Late,
}

/// Applies the late data policy to a record's windows.
#[derive(Debug, Clone, Copy)]
pub struct LatenessGate {
    pub allowed_lateness: TimeDelta,
    pub policy: LateDataPolicy,
}

impl LatenessGate {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            allowed_lateness: config.allowed_lateness(),
            policy: config.late_data_policy,
        }
    }

    /// Windows still within lateness are accepted (and created lazily). Expired windows are only
    /// accepted under [`LateDataPolicy::Admit`], and only while they are still OPEN, so nothing is
    /// ever merged into a finalized result.
    pub fn admit(
        &self,
        manager: &WindowManager,
        candidates: Vec<WindowKey>,
        watermark: Option<DateTime<Utc>>,
    ) -> Admission {
        let Some(watermark) = watermark else {
            return Admission::Accept(candidates);
        };
        let accepted: Vec<_> = candidates
            .into_iter()
            .filter(|w| {
                !expired(w, watermark, self.allowed_lateness)
                    || (self.policy == LateDataPolicy::Admit && manager.is_open(w))
            })
            .collect();
        if accepted.is_empty() {
            Admission::Late
        } else {
            Admission::Accept(accepted)
        }
    }
}
