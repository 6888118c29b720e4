//! Engine configuration from the environment
//!
//! The engine rides inside someone else's process, so configuration comes
//! from `VAIVEN_*` environment variables rather than argv. Parsing is a pure
//! function over an injected lookup: tests never mutate process state.
//!
//! | Variable | Meaning | Default |
//! |-------------------------------|--------------------------------------|---------|
//! | `VAIVEN_SAMPLE_STACKS` | capture sampled call stacks | off |
//! | `VAIVEN_SAMPLING_PERIOD_MS` | metronome period | 10 |
//! | `VAIVEN_MAX_STACK_FRAMES` | frames kept per sample (0=unlimited) | 20 |
//! | `VAIVEN_MAX_SAMPLED_STACKS` | distinct stacks kept per trace | 8 |
//! | `VAIVEN_MIN_UPDATE_COUNT` | report threshold for flip counts | 10 |
//! | `VAIVEN_MIN_MISS_COUNT` | report threshold for miss counts | 100 |
//! | `VAIVEN_TRACK_MISSES` | count failed checks too | off |
//! | `VAIVEN_ACTIVATION_DELAY_S` | delay before recording activates | 0 |
//! | `VAIVEN_REPORT_INTERVAL_S` | periodic report period (0=disabled) | 0 |
//! | `VAIVEN_REPORT_FILE` | persisted report path | console |
//! | `VAIVEN_CLEANUP` | prune single-keyed call sites | off |
//! | `VAIVEN_FILTER` | type-name allowlist (see `filter`) | allow all |
//!
//! Malformed values never break the host application: they log a warning
//! and fall back to the default.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::filter::TypeNameFilter;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capture sampled call stacks on flips (requires `start_sampling`).
    pub sample_stacks: bool,
    /// Metronome period handed to `start_sampling` during bootstrap.
    pub sampling_period: Duration,
    /// Frames retained per sampled stack; 0 keeps the whole stack.
    pub max_stack_frames: usize,
    /// Distinct deduplicated stacks retained per trace record.
    pub max_sampled_stacks: usize,
    /// Flip-count threshold below which an entry is not reported.
    pub min_update_count: u64,
    /// Miss-count threshold for the miss report.
    pub min_miss_count: u64,
    /// Also count failed checks in a separate space.
    pub track_misses: bool,
    /// Delay before the activation gate flips.
    pub activation_delay: Duration,
    /// Periodic report interval; `None` disables the reporter thread.
    pub report_interval: Option<Duration>,
    /// Persisted report destination; `None` means console only.
    pub report_file: Option<PathBuf>,
    /// Apply the single-keyed-site pruning heuristic to reports.
    pub cleanup: bool,
    /// Allowlist over concrete type names.
    pub filter: TypeNameFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sample_stacks: false,
            sampling_period: Duration::from_millis(10),
            max_stack_frames: 20,
            max_sampled_stacks: 8,
            min_update_count: 10,
            min_miss_count: 100,
            track_misses: false,
            activation_delay: Duration::ZERO,
            report_interval: None,
            report_file: None,
            cleanup: false,
            filter: TypeNameFilter::allow_all(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup function.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EngineConfig::default();
        let sampling_period_ms = parse_u64(
            &get,
            "VAIVEN_SAMPLING_PERIOD_MS",
            defaults.sampling_period.as_millis() as u64,
        );
        let report_interval_s = parse_u64(&get, "VAIVEN_REPORT_INTERVAL_S", 0);
        let filter = match get("VAIVEN_FILTER") {
            None => TypeNameFilter::allow_all(),
            Some(spec) => TypeNameFilter::from_spec(&spec).unwrap_or_else(|e| {
                warn!(error = %e, "ignoring invalid VAIVEN_FILTER");
                TypeNameFilter::allow_all()
            }),
        };
        EngineConfig {
            sample_stacks: parse_bool(&get, "VAIVEN_SAMPLE_STACKS", defaults.sample_stacks),
            sampling_period: Duration::from_millis(sampling_period_ms),
            max_stack_frames: parse_u64(
                &get,
                "VAIVEN_MAX_STACK_FRAMES",
                defaults.max_stack_frames as u64,
            ) as usize,
            max_sampled_stacks: parse_u64(
                &get,
                "VAIVEN_MAX_SAMPLED_STACKS",
                defaults.max_sampled_stacks as u64,
            ) as usize,
            min_update_count: parse_u64(&get, "VAIVEN_MIN_UPDATE_COUNT", defaults.min_update_count),
            min_miss_count: parse_u64(&get, "VAIVEN_MIN_MISS_COUNT", defaults.min_miss_count),
            track_misses: parse_bool(&get, "VAIVEN_TRACK_MISSES", defaults.track_misses),
            activation_delay: Duration::from_secs(parse_u64(&get, "VAIVEN_ACTIVATION_DELAY_S", 0)),
            report_interval: match report_interval_s {
                0 => None,
                s => Some(Duration::from_secs(s)),
            },
            report_file: get("VAIVEN_REPORT_FILE").map(PathBuf::from),
            cleanup: parse_bool(&get, "VAIVEN_CLEANUP", defaults.cleanup),
            filter,
        }
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key) {
        None => default,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                warn!(key, value = other, "ignoring unparseable boolean");
                default
            }
        },
    }
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable integer");
            default
        }),
    }
}
