//! Global sampling clock
//!
//! A single background thread wakes on a fixed period and advances one
//! process-global tick. Recorders compare the tick they last sampled at
//! against the global one and claim a new tick with a single CAS, which
//! rate-limits expensive stack captures to at most one per recorder per
//! period, best effort.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Sentinel for "never started".
const PERIOD_UNSET: i64 = -1;

/// The shared periodic tick source.
///
/// `start` is one-shot: the first call decides the period for the process
/// lifetime, later calls are no-ops. A non-positive period consumes the
/// one-shot and leaves sampling disabled for good.
pub struct Metronome {
    period_ms: AtomicI64,
    /// Nanoseconds since this metronome was created, advanced by the ticker
    /// thread. Plain monotonic timestamps; readers only ever compare.
    tick: AtomicU64,
    epoch: Instant,
}

impl Metronome {
    pub fn new() -> Self {
        Metronome {
            period_ms: AtomicI64::new(PERIOD_UNSET),
            tick: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Start the ticker thread. Idempotent; only the first caller's period
    /// takes effect.
    ///
    /// The thread is detached and never joined: it must not keep the process
    /// alive, matching the daemon semantics of the rest of the engine's
    /// background work.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let millis = i64::try_from(period.as_millis()).unwrap_or(i64::MAX);
        if self
            .period_ms
            .compare_exchange(PERIOD_UNSET, millis, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if millis <= 0 {
            debug!("metronome started with non-positive period; sampling disabled");
            return;
        }
        debug!(period_ms = millis, "metronome started");
        let metronome = Arc::clone(self);
        let builder = thread::Builder::new().name("vaiven-metronome".into());
        let spawned = builder.spawn(move || {
            let period = Duration::from_millis(millis as u64);
            loop {
                thread::sleep(period);
                let now = metronome.epoch.elapsed().as_nanos() as u64;
                metronome.tick.store(now, Ordering::Relaxed);
            }
        });
        if spawned.is_err() {
            debug!("metronome thread failed to spawn; sampling disabled");
            self.period_ms.store(0, Ordering::Release);
        }
    }

    /// Whether the ticker is running and captures may be attempted.
    pub fn sampling_enabled(&self) -> bool {
        self.period_ms.load(Ordering::Relaxed) > 0
    }

    /// Current global tick. Meaningful only for ordering comparisons.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }
}

impl Default for Metronome {
    fn default() -> Self {
        Self::new()
    }
}
