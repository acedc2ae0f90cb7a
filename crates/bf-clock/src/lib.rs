#![forbid(unsafe_code)]
//! Injectable time and randomness.
//!
//! The daemon's clock and RNG are singletons but must be injectable at
//! construction so tests are deterministic: [`SystemClock`] and entropy
//! seeding in production, [`ManualClock`] and a fixed seed under test.
//!
//! Sleeps are the only in-process suspension point, so they go through the
//! clock and honor a [`CancelToken`]; a cancelled sleep surfaces as EINTR
//! upstream.

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Cancellation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Completed,
    Cancelled,
}

struct CancelInner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// Cooperative cancellation signal checked at suspension points.
///
/// Cloning shares the signal; cancelling wakes every sleeper.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.condvar.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ── Clock ───────────────────────────────────────────────────────────────────

/// Source of monotonic time and interruptible sleep.
pub trait Clock: Send + Sync {
    /// Milliseconds since daemon start.
    fn now_ms(&self) -> u64;

    /// Sleep for `ms`, waking early if `cancel` fires.
    fn sleep(&self, ms: u64, cancel: &CancelToken) -> SleepOutcome;
}

/// Wall-clock time; sleeps block the calling worker.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, ms: u64, cancel: &CancelToken) -> SleepOutcome {
        let deadline = Instant::now() + Duration::from_millis(ms);
        let mut cancelled = cancel.inner.cancelled.lock();
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return SleepOutcome::Completed;
            }
            cancel
                .inner
                .condvar
                .wait_for(&mut cancelled, deadline - now);
        }
        SleepOutcome::Cancelled
    }
}

/// Virtual time for tests: `sleep` advances the clock instantly and records
/// the total slept, so delay behavior is assertable without real waiting.
pub struct ManualClock {
    now_ms: Mutex<u64>,
    slept_ms: Mutex<u64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now_ms: Mutex::new(0),
            slept_ms: Mutex::new(0),
        }
    }

    /// Move the clock forward without sleeping.
    pub fn advance(&self, ms: u64) {
        *self.now_ms.lock() += ms;
    }

    /// Total milliseconds slept through this clock so far.
    #[must_use]
    pub fn total_slept_ms(&self) -> u64 {
        *self.slept_ms.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.lock()
    }

    fn sleep(&self, ms: u64, cancel: &CancelToken) -> SleepOutcome {
        if cancel.is_cancelled() {
            return SleepOutcome::Cancelled;
        }
        *self.now_ms.lock() += ms;
        *self.slept_ms.lock() += ms;
        SleepOutcome::Completed
    }
}

// ── Randomness ──────────────────────────────────────────────────────────────

/// Shared uniform-[0,1) source backing probabilistic effects.
///
/// Seeded from `BF_SEED` when present so fault sequences replay exactly.
pub struct FaultRng {
    inner: Mutex<StdRng>,
}

impl FaultRng {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Seed from `BF_SEED` if set and parseable, else OS entropy.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var(bf_types::SEED_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(seed) => Self::seeded(seed),
            None => Self {
                inner: Mutex::new(StdRng::from_os_rng()),
            },
        }
    }

    /// Draw a uniform sample from `[0, 1)`.
    #[must_use]
    pub fn next_unit(&self) -> f64 {
        self.inner.lock().random::<f64>()
    }
}

impl std::fmt::Debug for FaultRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FaultRng")
    }
}
