//! Per-type flip recording
//!
//! One [`TraceRecorder`] exists per concrete type ever observed at an
//! instrumented check site. It watches the sequence of abstract target
//! types the key is checked against and counts *flips*: observations where
//! the target differs from the last one seen. A steady (monomorphic) site
//! never counts.
//!
//! # Hot path
//!
//! `record_hit` is called once per successful check. The common case is a
//! single relaxed pointer load and one comparison, with no writes of any
//! kind:
//!
//! 1. Load `last_seen_target`. Equal to the incoming target: return.
//! 2. Otherwise overwrite it, best effort. Losing this race to another
//!    thread drops one sample, never corrupts one.
//! 3. A previously unset slot means this is the first sighting: seed only.
//!    Pollution needs at least two distinct targets.
//! 4. A genuine flip bumps the `(target, site)` trace record, found through
//!    a check-then-insert-if-absent lookup that allocates nothing when the
//!    record already exists.
//! 5. If the metronome has ticked since this recorder last sampled, one CAS
//!    claims the new tick and the winner captures a bounded call stack.
//!
//! Every counter here is *lossy*: increments are a read, an add, and a plain
//! publish. Contended updates may be dropped, so counts are a lower bound on
//! true activity. What is never lost is identity: keys, targets, and sites
//! are immutable once published.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use fnv::FnvBuildHasher;

use crate::metronome::Metronome;
use crate::stack_capture::StackSample;
use crate::token::{CallSite, TypeToken};

/// Bounds on what one trace record may retain from stack sampling.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CaptureLimits {
    /// Frames per sample; 0 keeps whole stacks.
    pub(crate) max_frames: usize,
    /// Distinct deduplicated samples per trace record.
    pub(crate) max_stacks: usize,
}

/// Sampling knobs shared by every recorder of an engine.
#[derive(Clone)]
pub(crate) struct SamplingPolicy {
    pub(crate) metronome: Arc<Metronome>,
    /// `None` disables stack capture outright.
    pub(crate) capture: Option<CaptureLimits>,
}

impl SamplingPolicy {
    pub(crate) fn disabled(metronome: Arc<Metronome>) -> Self {
        SamplingPolicy {
            metronome,
            capture: None,
        }
    }
}

/// Identity of one observed `(target type, call site)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TraceKey {
    pub(crate) target: &'static TypeToken,
    pub(crate) site: CallSite,
}

/// Lossy counter plus retained stack samples for one trace key.
#[derive(Debug, Default)]
pub struct TraceRecord {
    count: AtomicU64,
    sampled_stacks: Mutex<Vec<StackSample>>,
}

impl TraceRecord {
    fn new() -> Self {
        Self::default()
    }

    /// Observations attributed to this trace. Lower bound under contention.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn weak_increment(&self) {
        // Read, add, plain publish. A concurrent increment between the load
        // and the store is dropped; undercount is the accepted trade for a
        // hot path with no contended RMW.
        let current = self.count.load(Ordering::Relaxed);
        self.count.store(current.wrapping_add(1), Ordering::Relaxed);
    }

    /// Capture and retain one stack sample, deduplicated by content and
    /// capped by `limits`. Best effort: any failure here leaves the counts
    /// untouched and is not reported.
    fn add_stack_sample(&self, limits: &CaptureLimits) {
        let sample = StackSample::capture(limits.max_frames);
        if sample.is_empty() {
            return;
        }
        let mut stacks = match self.sampled_stacks.lock() {
            Ok(guard) => guard,
            // A panic while holding the lock only ever leaves a valid Vec.
            Err(poisoned) => poisoned.into_inner(),
        };
        if stacks.len() >= limits.max_stacks || stacks.contains(&sample) {
            return;
        }
        stacks.push(sample);
    }

    /// Snapshot of the retained samples.
    pub fn sampled_stacks(&self) -> Vec<StackSample> {
        match self.sampled_stacks.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Flip tracking for a single concrete type.
pub struct TraceRecorder {
    key: &'static TypeToken,
    /// Last abstract target observed at any site for this key. Null until
    /// the first observation. Relaxed loads and stores throughout: a stale
    /// read costs at most one extra or one missed flip.
    last_seen_target: AtomicPtr<TypeToken>,
    /// Total flips (or misses, in a miss space) recorded for this key.
    update_count: AtomicU64,
    /// Metronome tick this recorder last captured a stack at.
    last_sample_tick: AtomicU64,
    traces: DashMap<TraceKey, Arc<TraceRecord>, FnvBuildHasher>,
}

impl TraceRecorder {
    pub(crate) fn new(key: &'static TypeToken, initial_tick: u64) -> Self {
        TraceRecorder {
            key,
            last_seen_target: AtomicPtr::new(std::ptr::null_mut()),
            update_count: AtomicU64::new(0),
            last_sample_tick: AtomicU64::new(initial_tick),
            traces: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    pub fn key(&self) -> &'static TypeToken {
        self.key
    }

    /// Total update count for this key. Lossy, lower bound.
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    pub fn has_traces(&self) -> bool {
        !self.traces.is_empty()
    }

    /// Record a successful check of this key against `target` at `site`.
    #[inline]
    pub(crate) fn record_hit(
        &self,
        target: &'static TypeToken,
        site: CallSite,
        sampling: &SamplingPolicy,
    ) {
        let last = self.last_seen_target.load(Ordering::Relaxed);
        if std::ptr::eq(last.cast_const(), target) {
            // Monomorphic case: one load, one compare, done.
            return;
        }
        // Lossy publish; losing the race to a concurrent flip is fine.
        self.last_seen_target
            .store((target as *const TypeToken).cast_mut(), Ordering::Relaxed);
        if last.is_null() {
            // First sighting seeds the slot. A flip needs two distinct
            // targets, so nothing is counted yet.
            return;
        }
        self.bump(target, site, sampling);
    }

    /// Record a failed check. Miss spaces count every observation; there is
    /// no flip discipline because a miss carries no "last seen" signal.
    pub(crate) fn record_miss(
        &self,
        target: &'static TypeToken,
        site: CallSite,
        sampling: &SamplingPolicy,
    ) {
        self.bump(target, site, sampling);
    }

    fn bump(&self, target: &'static TypeToken, site: CallSite, sampling: &SamplingPolicy) {
        let trace_key = TraceKey { target, site };
        let record = match self.traces.get(&trace_key) {
            // Common path: the record exists, nothing allocates.
            Some(existing) => Arc::clone(&existing),
            // Insert-if-absent under the shard lock; a racing creator wins
            // and we use whichever record ended up in the map.
            None => Arc::clone(&*self
                .traces
                .entry(trace_key)
                .or_insert_with(|| Arc::new(TraceRecord::new()))),
        };
        record.weak_increment();
        let current = self.update_count.load(Ordering::Relaxed);
        self.update_count
            .store(current.wrapping_add(1), Ordering::Relaxed);

        if let Some(limits) = sampling.capture.as_ref() {
            if !sampling.metronome.sampling_enabled() {
                return;
            }
            let global = sampling.metronome.current_tick();
            let last_tick = self.last_sample_tick.load(Ordering::Relaxed);
            // Wrap-safe "has the clock moved past us" comparison; the CAS
            // lets exactly one thread per recorder claim each new tick.
            if (last_tick.wrapping_sub(global) as i64) < 0
                && self
                    .last_sample_tick
                    .compare_exchange(last_tick, global, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                record.add_stack_sample(limits);
            }
        }
    }

    /// Visit every trace record of this key.
    pub(crate) fn for_each_trace(&self, mut visit: impl FnMut(&TraceKey, &TraceRecord)) {
        for entry in self.traces.iter() {
            visit(entry.key(), entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::CheckKind;
    use std::time::Duration;

    static DOG: TypeToken = TypeToken::new("Dog");
    static ANIMAL: TypeToken = TypeToken::new("Animal");
    static PET: TypeToken = TypeToken::new("Pet");

    const L1: CallSite = CallSite::new("L1", CheckKind::InstanceCheck);
    const L2: CallSite = CallSite::new("L2", CheckKind::Cast);

    fn no_sampling() -> SamplingPolicy {
        SamplingPolicy::disabled(Arc::new(Metronome::new()))
    }

    #[test]
    fn test_monomorphic_site_never_counts() {
        let recorder = TraceRecorder::new(&DOG, 0);
        let sampling = no_sampling();
        for _ in 0..1_000 {
            recorder.record_hit(&ANIMAL, L1, &sampling);
        }
        assert_eq!(recorder.update_count(), 0);
        assert!(!recorder.has_traces());
    }

    #[test]
    fn test_first_observation_only_seeds() {
        let recorder = TraceRecorder::new(&DOG, 0);
        recorder.record_hit(&ANIMAL, L1, &no_sampling());
        assert_eq!(recorder.update_count(), 0);
        assert!(!recorder.has_traces());
    }

    #[test]
    fn test_alternation_counts_n_minus_one() {
        let recorder = TraceRecorder::new(&DOG, 0);
        let sampling = no_sampling();
        let n = 10;
        for i in 0..n {
            let target: &'static TypeToken = if i % 2 == 0 { &ANIMAL } else { &PET };
            recorder.record_hit(target, L1, &sampling);
        }
        assert_eq!(recorder.update_count(), n - 1);
    }

    #[test]
    fn test_flip_scenario_attributes_per_target() {
        // Dog at L1 vs Animal, then Pet, then Animal again.
        let recorder = TraceRecorder::new(&DOG, 0);
        let sampling = no_sampling();
        recorder.record_hit(&ANIMAL, L1, &sampling);
        recorder.record_hit(&PET, L1, &sampling);
        recorder.record_hit(&ANIMAL, L1, &sampling);
        assert_eq!(recorder.update_count(), 2);

        let mut counts = Vec::new();
        recorder.for_each_trace(|key, record| {
            counts.push((key.target.name(), record.count()));
        });
        counts.sort_unstable();
        assert_eq!(counts, vec![("Animal", 1), ("Pet", 1)]);
    }

    #[test]
    fn test_sites_are_distinct_trace_keys() {
        let recorder = TraceRecorder::new(&DOG, 0);
        let sampling = no_sampling();
        recorder.record_hit(&ANIMAL, L1, &sampling);
        recorder.record_hit(&PET, L2, &sampling);
        recorder.record_hit(&ANIMAL, L1, &sampling);
        let mut sites = Vec::new();
        recorder.for_each_trace(|key, _| sites.push(key.site.location));
        sites.sort_unstable();
        assert_eq!(sites, vec!["L1", "L2"]);
    }

    #[test]
    fn test_misses_count_every_observation() {
        let recorder = TraceRecorder::new(&DOG, 0);
        let sampling = no_sampling();
        for _ in 0..5 {
            recorder.record_miss(&ANIMAL, L1, &sampling);
        }
        assert_eq!(recorder.update_count(), 5);
        recorder.for_each_trace(|_, record| assert_eq!(record.count(), 5));
    }

    #[test]
    fn test_sample_cap_and_dedup() {
        let record = TraceRecord::new();
        let limits = CaptureLimits {
            max_frames: 8,
            max_stacks: 1,
        };
        record.add_stack_sample(&limits);
        record.add_stack_sample(&limits);
        assert!(record.sampled_stacks().len() <= 1);
    }

    #[test]
    fn test_tick_claim_captures_at_most_once_per_tick() {
        let metronome = Arc::new(Metronome::new());
        let sampling = SamplingPolicy {
            metronome: Arc::clone(&metronome),
            capture: Some(CaptureLimits {
                max_frames: 8,
                max_stacks: 16,
            }),
        };
        metronome.start(Duration::from_millis(1));
        let recorder = TraceRecorder::new(&DOG, metronome.current_tick());

        // Flip until the metronome has ticked and a sample lands.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut sampled = 0;
        while sampled == 0 && std::time::Instant::now() < deadline {
            recorder.record_hit(&ANIMAL, L1, &sampling);
            recorder.record_hit(&PET, L1, &sampling);
            sampled = {
                let mut total = 0;
                recorder.for_each_trace(|_, record| total += record.sampled_stacks().len());
                total
            };
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(sampled > 0, "no stack sample captured within deadline");
    }
}
