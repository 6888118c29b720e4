//! Engine context: the single home of all recording state
//!
//! Everything the original design kept in process-wide statics (recorder
//! registries, the lookup caches, the activation gate, the metronome) lives
//! in one explicitly constructed [`Engine`]. Embedders either build their
//! own instance or use [`Engine::global`], which configures itself from the
//! environment exactly once.
//!
//! The engine never throws into the instrumented call site: every public
//! recording method is infallible, returns nothing, and degrades to a no-op
//! when the gate is closed or the key is filtered out.
//!
//! Hit and miss observations go to two independent counter spaces sharing
//! one gate and one metronome: hits carry the flip discipline that defines
//! pollution, misses are plain per-observation counts.

use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use fnv::FnvBuildHasher;

use crate::activation::ActivationGate;
use crate::config::EngineConfig;
use crate::metronome::Metronome;
use crate::recorder::{CaptureLimits, SamplingPolicy, TraceRecorder};
use crate::registry::AppendOnlyRegistry;
use crate::report;
use crate::snapshot::{self, ReportEntry};
use crate::token::{CallSite, TypeToken};

/// One population of recorders: the append-only registry that snapshots
/// traverse, plus the identity-keyed lookup the hot path goes through.
struct CounterSpace {
    registry: AppendOnlyRegistry<TraceRecorder>,
    by_key: DashMap<&'static TypeToken, Arc<TraceRecorder>, FnvBuildHasher>,
}

impl CounterSpace {
    fn new() -> Self {
        CounterSpace {
            registry: AppendOnlyRegistry::new(),
            by_key: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    gate: Arc<ActivationGate>,
    metronome: Arc<Metronome>,
    sampling: SamplingPolicy,
    hits: CounterSpace,
    misses: CounterSpace,
    bootstrapped: Once,
}

impl Engine {
    /// Build an engine with explicit configuration. Nothing starts running
    /// until [`start_activation`](Self::start_activation) (and optionally
    /// [`start_sampling`](Self::start_sampling)) is called.
    pub fn new(config: EngineConfig) -> Self {
        let metronome = Arc::new(Metronome::new());
        let capture = config.sample_stacks.then_some(CaptureLimits {
            max_frames: config.max_stack_frames,
            max_stacks: config.max_sampled_stacks,
        });
        Engine {
            sampling: SamplingPolicy {
                metronome: Arc::clone(&metronome),
                capture,
            },
            config,
            gate: Arc::new(ActivationGate::new()),
            metronome,
            hits: CounterSpace::new(),
            misses: CounterSpace::new(),
            bootstrapped: Once::new(),
        }
    }

    /// The process-wide engine, configured from `VAIVEN_*` environment
    /// variables on first use. Bootstraps activation, sampling, and the
    /// periodic reporter according to that configuration.
    pub fn global() -> &'static Engine {
        static GLOBAL: OnceLock<Engine> = OnceLock::new();
        let engine = GLOBAL.get_or_init(|| Engine::new(EngineConfig::from_env()));
        engine.bootstrap();
        engine
    }

    fn bootstrap(&'static self) {
        self.bootstrapped.call_once(|| {
            self.start_activation(self.config.activation_delay);
            if self.config.sample_stacks {
                self.start_sampling(self.config.sampling_period);
            }
            if self.config.report_interval.is_some() {
                report::start_periodic(self);
            }
        });
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fast-path check instrumentation may inline before calling into the
    /// engine at all.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    /// Arm the activation gate, optionally delayed. Idempotent one-shot;
    /// activation is irreversible for the process lifetime.
    pub fn start_activation(&self, delay: Duration) {
        self.gate.start(delay);
    }

    /// Start the sampling metronome. Idempotent one-shot; a non-positive
    /// period leaves stack sampling disabled for good.
    pub fn start_sampling(&self, period: Duration) {
        self.metronome.start(period);
    }

    /// Record a successful type check of `concrete` against the abstract
    /// `target` at `site`.
    ///
    /// Callers must pre-filter targets: concrete (non-abstract) targets
    /// carry no pollution signal and belong upstream of this call. The
    /// guarded check's own result is never affected by anything here.
    #[inline]
    pub fn record_hit(
        &self,
        concrete: &'static TypeToken,
        target: &'static TypeToken,
        site: CallSite,
    ) {
        if !self.gate.is_active() {
            return;
        }
        if let Some(recorder) = self.recorder_for(&self.hits, concrete) {
            recorder.record_hit(target, site, &self.sampling);
        }
    }

    /// Record a failed type check. No-op unless miss tracking is enabled in
    /// the configuration.
    #[inline]
    pub fn record_miss(
        &self,
        concrete: &'static TypeToken,
        target: &'static TypeToken,
        site: CallSite,
    ) {
        if !self.config.track_misses || !self.gate.is_active() {
            return;
        }
        if let Some(recorder) = self.recorder_for(&self.misses, concrete) {
            recorder.record_miss(target, site, &self.sampling);
        }
    }

    /// Unified entry point for instrumentation that funnels every check
    /// flavor through one function.
    #[inline]
    pub fn record_type_check(
        &self,
        concrete: &'static TypeToken,
        target: &'static TypeToken,
        site: CallSite,
        hit: bool,
    ) {
        if hit {
            self.record_hit(concrete, target, site);
        } else {
            self.record_miss(concrete, target, site);
        }
    }

    /// Ranked pollution entries whose update count strictly exceeds
    /// `max(1, min_update_count)`, optionally pruned by the cleanup
    /// heuristic. Safe to call at any time, including during shutdown,
    /// concurrently with recording.
    pub fn snapshot(&self, min_update_count: u64, cleanup: bool) -> Vec<ReportEntry> {
        let entries = snapshot::collect(&self.hits.registry, min_update_count);
        if cleanup {
            snapshot::prune_single_keyed(entries)
        } else {
            entries
        }
    }

    /// Ranked miss entries, same thresholding as [`snapshot`](Self::snapshot).
    pub fn miss_snapshot(&self, min_miss_count: u64) -> Vec<ReportEntry> {
        snapshot::collect(&self.misses.registry, min_miss_count)
    }

    fn recorder_for(
        &self,
        space: &CounterSpace,
        key: &'static TypeToken,
    ) -> Option<Arc<TraceRecorder>> {
        if let Some(existing) = space.by_key.get(&key) {
            return Some(Arc::clone(&existing));
        }
        if !self.accepts(key) {
            return None;
        }
        let initial_tick = self.metronome.current_tick();
        // Insert-if-absent under the shard lock; exactly one creator also
        // publishes the recorder into the traversal registry.
        Some(Arc::clone(&*space.by_key.entry(key).or_insert_with(|| {
            let recorder = Arc::new(TraceRecorder::new(key, initial_tick));
            space.registry.append(Arc::clone(&recorder));
            recorder
        })))
    }

    fn accepts(&self, key: &'static TypeToken) -> bool {
        let name = key.name();
        // The engine never records itself.
        if name.starts_with("vaiven::") {
            return false;
        }
        self.config.filter.matches(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TypeNameFilter;
    use crate::token::CheckKind;

    static DOG: TypeToken = TypeToken::new("app::Dog");
    static CAT: TypeToken = TypeToken::new("other::Cat");
    static ANIMAL: TypeToken = TypeToken::new("app::Animal");
    static PET: TypeToken = TypeToken::new("app::Pet");
    static INTERNAL: TypeToken = TypeToken::new("vaiven::recorder::TraceRecord");

    const SITE: CallSite = CallSite::new("src/zoo.rs:7", CheckKind::InstanceCheck);

    fn active_engine(config: EngineConfig) -> Engine {
        let engine = Engine::new(config);
        engine.start_activation(Duration::ZERO);
        engine
    }

    fn flip(engine: &Engine, key: &'static TypeToken, times: u64) {
        for i in 0..=times {
            let target: &'static TypeToken = if i % 2 == 0 { &ANIMAL } else { &PET };
            engine.record_hit(key, target, SITE);
        }
    }

    #[test]
    fn test_inactive_engine_records_nothing() {
        let engine = Engine::new(EngineConfig::default());
        assert!(!engine.is_active());
        flip(&engine, &DOG, 50);
        assert!(engine.snapshot(0, false).is_empty());
    }

    #[test]
    fn test_active_engine_records_flips() {
        let engine = active_engine(EngineConfig::default());
        flip(&engine, &DOG, 50);
        let entries = engine.snapshot(0, false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].type_name, "app::Dog");
        assert_eq!(entries[0].update_count, 50);
    }

    #[test]
    fn test_filter_excludes_unmatched_keys() {
        let mut config = EngineConfig::default();
        config.filter = TypeNameFilter::from_spec("app::").unwrap();
        let engine = active_engine(config);
        flip(&engine, &DOG, 20);
        flip(&engine, &CAT, 20);
        let entries = engine.snapshot(0, false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].type_name, "app::Dog");
    }

    #[test]
    fn test_engine_never_records_itself() {
        let engine = active_engine(EngineConfig::default());
        flip(&engine, &INTERNAL, 20);
        assert!(engine.snapshot(0, false).is_empty());
    }

    #[test]
    fn test_misses_require_opt_in() {
        let engine = active_engine(EngineConfig::default());
        engine.record_miss(&DOG, &ANIMAL, SITE);
        assert!(engine.miss_snapshot(0).is_empty());

        let mut config = EngineConfig::default();
        config.track_misses = true;
        let engine = active_engine(config);
        for _ in 0..10 {
            engine.record_miss(&DOG, &ANIMAL, SITE);
        }
        let entries = engine.miss_snapshot(0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].update_count, 10);
    }

    #[test]
    fn test_misses_do_not_leak_into_hit_snapshot() {
        let mut config = EngineConfig::default();
        config.track_misses = true;
        let engine = active_engine(config);
        for _ in 0..10 {
            engine.record_miss(&DOG, &ANIMAL, SITE);
        }
        assert!(engine.snapshot(0, false).is_empty());
    }

    #[test]
    fn test_record_type_check_dispatches_on_outcome() {
        let mut config = EngineConfig::default();
        config.track_misses = true;
        let engine = active_engine(config);
        engine.record_type_check(&DOG, &ANIMAL, SITE, true);
        engine.record_type_check(&DOG, &PET, SITE, true);
        engine.record_type_check(&DOG, &ANIMAL, SITE, true);
        for _ in 0..3 {
            engine.record_type_check(&DOG, &PET, SITE, false);
        }
        assert_eq!(engine.snapshot(0, false)[0].update_count, 2);
        assert_eq!(engine.miss_snapshot(0)[0].update_count, 3);
    }

    #[test]
    fn test_start_calls_are_idempotent() {
        let engine = Engine::new(EngineConfig::default());
        engine.start_activation(Duration::ZERO);
        engine.start_activation(Duration::from_secs(3600));
        assert!(engine.is_active());
        engine.start_sampling(Duration::from_millis(5));
        engine.start_sampling(Duration::from_millis(5000));
        flip(&engine, &DOG, 4);
        assert_eq!(engine.snapshot(0, false)[0].update_count, 4);
    }

    #[test]
    fn test_global_engine_is_a_singleton() {
        let first = Engine::global() as *const Engine;
        let second = Engine::global() as *const Engine;
        assert_eq!(first, second);
    }
}
