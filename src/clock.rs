use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

/// Length of one rotation window, in seconds.
pub const WINDOW_SECONDS: u64 = 30;

/// Seconds left in the current window. Always within `1..=WINDOW_SECONDS`.
pub fn remaining_seconds(now: u64) -> u64 {
    WINDOW_SECONDS - now % WINDOW_SECONDS
}

/// `true` when `window` belongs to a different epoch than the last one seen.
///
/// A missing previous epoch counts as crossed, and so does a clock that moved
/// backwards into an older epoch.
pub fn boundary_crossed(last_epoch: Option<u64>, window: RotationWindow) -> bool {
    last_epoch != Some(window.epoch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationWindow {
    pub epoch: u64,
    pub seconds_remaining: u64,
}

impl RotationWindow {
    pub fn at(now: u64) -> Self {
        Self {
            epoch: now / WINDOW_SECONDS,
            seconds_remaining: remaining_seconds(now),
        }
    }
}

/// Source of wall-clock time, in seconds since the UNIX epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;

    fn window(&self) -> RotationWindow {
        RotationWindow::at(self.now())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        // A clock set before 1970 is treated as the epoch itself.
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. Handy for driving the engine
/// deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: AtomicU64,
}

impl ManualClock {
    pub fn new(seconds_since_epoch: u64) -> Self {
        Self {
            seconds: AtomicU64::new(seconds_since_epoch),
        }
    }

    pub fn set(&self, seconds_since_epoch: u64) {
        self.seconds.store(seconds_since_epoch, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }
}
