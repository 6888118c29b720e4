//! One-shot activation gate
//!
//! Recording stays inert until the gate flips, so warm-up noise (class/type
//! loading, JIT-equivalent startup churn in the host application) never
//! pollutes the counters. The flip happens at most once, immediately or
//! after a configured delay, and is irreversible for the process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

pub struct ActivationGate {
    active: AtomicBool,
    /// Set by the first `start` call; later calls are no-ops even if the
    /// first activation has not fired yet.
    armed: AtomicBool,
}

impl ActivationGate {
    pub fn new() -> Self {
        ActivationGate {
            active: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        }
    }

    /// Hot-path check. A plain relaxed load: the exact moment other threads
    /// observe the flip does not matter, only that they eventually do.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Arm the gate. Zero delay activates in the calling thread; otherwise a
    /// detached timer thread flips the gate after `delay`, discounting its
    /// own spawn latency. Idempotent one-shot.
    pub fn start(self: &Arc<Self>, delay: Duration) {
        if self
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if delay.is_zero() {
            self.active.store(true, Ordering::Release);
            debug!("recording activated");
            return;
        }
        let scheduled_at = Instant::now();
        let gate = Arc::clone(self);
        let builder = thread::Builder::new().name("vaiven-activation".into());
        let spawned = builder.spawn(move || {
            let remaining = delay.saturating_sub(scheduled_at.elapsed());
            if !remaining.is_zero() {
                thread::sleep(remaining);
            }
            gate.active.store(true, Ordering::Release);
            debug!(delay_s = delay.as_secs(), "recording activated after delay");
        });
        if spawned.is_err() {
            // No timer thread: activate now rather than never.
            self.active.store(true, Ordering::Release);
        }
    }
}

impl Default for ActivationGate {
    fn default() -> Self {
        Self::new()
    }
}
