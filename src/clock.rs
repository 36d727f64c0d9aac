use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Time source for window calculations.
///
/// The manual variant backs deterministic window-rollover tests; production
/// code always uses [`TimeSource::system`].
#[derive(Clone)]
pub struct TimeSource {
    inner: Arc<Inner>,
}

enum Inner {
    System,
    Manual(AtomicI64),
}

impl TimeSource {
    pub fn system() -> Self {
        Self {
            inner: Arc::new(Inner::System),
        }
    }

    /// A clock frozen at `start_ms` milliseconds since the Unix epoch,
    /// advanced explicitly with [`TimeSource::advance_ms`].
    pub fn manual(start_ms: i64) -> Self {
        Self {
            inner: Arc::new(Inner::Manual(AtomicI64::new(start_ms))),
        }
    }

    /// Current Unix timestamp in milliseconds
    pub fn now_ms(&self) -> i64 {
        match &*self.inner {
            Inner::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("Time went backwards")
                .as_millis() as i64,
            Inner::Manual(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Current Unix timestamp in whole seconds
    pub fn now_secs(&self) -> i64 {
        self.now_ms() / 1000
    }

    /// Current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        match &*self.inner {
            Inner::System => Utc::now(),
            Inner::Manual(ms) => Utc
                .timestamp_millis_opt(ms.load(Ordering::SeqCst))
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    /// Advance a manual clock. No-op on the system clock.
    pub fn advance_ms(&self, delta_ms: i64) {
        if let Inner::Manual(ms) = &*self.inner {
            ms.fetch_add(delta_ms, Ordering::SeqCst);
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::system()
    }
}

/// Start of the boundary-aligned window containing `now_ms`.
pub fn aligned_window_start(now_ms: i64, window_ms: i64) -> i64 {
    now_ms - now_ms.rem_euclid(window_ms)
}

/// Seconds until `end_ms`, rounded up, never negative.
pub fn secs_until(now_ms: i64, end_ms: i64) -> u64 {
    if end_ms <= now_ms {
        0
    } else {
        ((end_ms - now_ms) as u64).div_ceil(1000)
    }
}
