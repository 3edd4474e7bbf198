//! Clocks for run timestamps and loop timeouts.

use std::sync::Arc;

use time::OffsetDateTime;

/// Clock interface used by the automation engine.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock based on `time::OffsetDateTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        i64::try_from(nanos).unwrap_or(i64::MAX)
    }
}

/// Monotonic clock anchored to the wall time at creation.
///
/// Built on `tokio::time::Instant`, so it follows paused/advanced time in
/// tests and never jumps backwards when the system clock is adjusted.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor_ms: i64,
    start: tokio::time::Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(SystemClock.now_ms())
    }

    /// Anchor the clock at a fixed epoch value (deterministic tests).
    #[must_use]
    pub fn anchored_at(anchor_ms: i64) -> Self {
        Self {
            anchor_ms,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.start.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_ms.saturating_add(elapsed)
    }
}
