//! Vaiven - Low-overhead runtime detector of polymorphic call-site pollution
//!
//! This library is the recording, aggregation, and sampling engine behind an
//! instrumentation layer that observes type checks at run time. It turns a
//! firehose of per-call-site observations into ranked, human-readable
//! statistics with bounded memory and near-zero synchronization on the hot
//! path: steady (monomorphic) sites cost one relaxed load and one pointer
//! comparison.

pub mod activation;
pub mod config;
pub mod engine;
pub mod filter;
pub mod metronome;
pub mod recorder;
pub mod registry;
pub mod report;
pub mod snapshot;
pub mod stack_capture;
pub mod token;

pub use config::EngineConfig;
pub use engine::Engine;
pub use snapshot::{ReportEntry, SiteSnapshot, TargetCount};
pub use token::{CallSite, CheckKind, TypeToken};

/// Initialize a stderr tracing subscriber for engine debug output.
///
/// Convenience for embedders and tests; honors `RUST_LOG`. Safe to call
/// more than once, later calls are no-ops.
pub fn init_debug_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
