//! Report rendering and delivery
//!
//! Renders ranked snapshot entries as a text table or JSON and delivers
//! them to a sink: the console, or a file configured through
//! `VAIVEN_REPORT_FILE` (JSON when the path ends in `.json`).
//!
//! Sink failures follow the containment rules of the rest of the engine: a
//! file that cannot be opened or written flips a sticky flag, the failure
//! is logged once, and every later cycle goes to the console instead. No
//! error ever reaches an application thread.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::snapshot::ReportEntry;

#[derive(Debug, Error)]
enum SinkError {
    #[error("failed to open report file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write report file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Where rendered reports go.
///
/// A file sink degrades to console permanently after its first failure;
/// the console sink cannot fail.
pub struct ReportSink {
    destination: Option<PathBuf>,
    failed: AtomicBool,
}

impl ReportSink {
    pub fn console() -> Self {
        ReportSink {
            destination: None,
            failed: AtomicBool::new(false),
        }
    }

    pub fn file(path: PathBuf) -> Self {
        ReportSink {
            destination: Some(path),
            failed: AtomicBool::new(false),
        }
    }

    /// Sink for the configured destination, console when none is set.
    pub fn from_config(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::file(path.to_path_buf()),
            None => Self::console(),
        }
    }

    /// Whether this sink expects JSON rather than the text table.
    pub fn wants_json(&self) -> bool {
        self.destination
            .as_deref()
            .and_then(Path::extension)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    }

    /// True once a file write has failed and the sink fell back to console.
    pub fn is_degraded(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Deliver one rendered report. Never fails; never retries a failed
    /// file.
    pub fn write(&self, body: &str) {
        if let Some(path) = &self.destination {
            if !self.failed.load(Ordering::Relaxed) {
                match write_file(path, body) {
                    Ok(()) => return,
                    Err(error) => {
                        // Log the failure once and stop trying the file.
                        self.failed.store(true, Ordering::Relaxed);
                        warn!(error = %error, "report sink failed; falling back to console");
                    }
                }
            }
        }
        println!("{body}");
    }
}

fn write_file(path: &Path, body: &str) -> Result<(), SinkError> {
    let mut file = File::create(path).map_err(|source| SinkError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(body.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|source| SinkError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Render entries as the human-readable ranked table.
pub fn format_text(title: &str, entries: &[ReportEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "=".repeat(68));
    let _ = writeln!(out, "{title} ({} entries)", entries.len());
    let _ = writeln!(out, "{}", "=".repeat(68));
    if entries.is_empty() {
        let _ = writeln!(out, "nothing above the configured thresholds");
        return out;
    }
    for (rank, entry) in entries.iter().enumerate() {
        let _ = writeln!(
            out,
            "#{} {} - {} updates",
            rank + 1,
            entry.type_name,
            entry.update_count
        );
        let seen: Vec<String> = entry
            .seen_targets
            .iter()
            .map(|t| format!("{} ({})", t.target, t.count))
            .collect();
        let _ = writeln!(out, "   seen: {}", seen.join(", "));
        for site in &entry.sites {
            let _ = writeln!(
                out,
                "   at {} [{}] - {}",
                site.location,
                site.kind.label(),
                site.count
            );
            let targets: Vec<String> = site
                .targets
                .iter()
                .map(|t| format!("{} ({})", t.target, t.count))
                .collect();
            let _ = writeln!(out, "      {}", targets.join(", "));
            for stack in &site.sampled_stacks {
                let _ = writeln!(out, "      sampled stack:");
                for frame in stack {
                    let _ = writeln!(out, "        {frame}");
                }
            }
        }
    }
    out
}

#[derive(Serialize)]
struct JsonReport<'a> {
    pollution: &'a [ReportEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    misses: Option<&'a [ReportEntry]>,
}

/// Render entries as JSON for machine consumption.
pub fn format_json(
    pollution: &[ReportEntry],
    misses: Option<&[ReportEntry]>,
) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&JsonReport {
        pollution,
        misses,
    })?)
}

/// Build one full report for `engine` using its configured thresholds and
/// deliver it to `sink`.
pub fn emit(engine: &Engine, sink: &ReportSink) {
    let config = engine.config();
    let pollution = engine.snapshot(config.min_update_count, config.cleanup);
    let misses = config
        .track_misses
        .then(|| engine.miss_snapshot(config.min_miss_count));

    let body = if sink.wants_json() {
        match format_json(&pollution, misses.as_deref()) {
            Ok(json) => json,
            Err(error) => {
                warn!(error = %error, "report serialization failed; emitting text");
                render_text_report(&pollution, misses.as_deref())
            }
        }
    } else {
        render_text_report(&pollution, misses.as_deref())
    };
    sink.write(&body);
}

fn render_text_report(pollution: &[ReportEntry], misses: Option<&[ReportEntry]>) -> String {
    let mut body = format_text("Type pollution report", pollution);
    if let Some(misses) = misses {
        body.push_str(&format_text("Failed type checks", misses));
    }
    body
}

/// Spawn the detached periodic reporter thread for the global engine.
/// Called once from engine bootstrap when a report interval is configured.
pub(crate) fn start_periodic(engine: &'static Engine) {
    let Some(interval) = engine.config().report_interval else {
        return;
    };
    let builder = thread::Builder::new().name("vaiven-reporter".into());
    let spawned = builder.spawn(move || {
        let sink = ReportSink::from_config(engine.config().report_file.as_deref());
        debug!(interval_s = interval.as_secs(), "periodic reporter started");
        loop {
            thread::sleep(interval);
            emit(engine, &sink);
        }
    });
    if spawned.is_err() {
        warn!("periodic reporter thread failed to spawn; reports are on demand only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SiteSnapshot, TargetCount};
    use crate::token::CheckKind;

    fn sample_entries() -> Vec<ReportEntry> {
        vec![ReportEntry {
            type_name: "app::Dog",
            update_count: 42,
            seen_targets: vec![
                TargetCount {
                    target: "app::Animal",
                    count: 30,
                },
                TargetCount {
                    target: "app::Pet",
                    count: 12,
                },
            ],
            sites: vec![SiteSnapshot {
                location: "src/zoo.rs:7",
                kind: CheckKind::InstanceCheck,
                count: 42,
                targets: vec![TargetCount {
                    target: "app::Animal",
                    count: 30,
                }],
                sampled_stacks: vec![vec!["zoo::feed".into(), "main".into()]],
            }],
        }]
    }

    #[test]
    fn test_text_format_lists_entries_in_rank_order() {
        let text = format_text("Type pollution report", &sample_entries());
        assert!(text.contains("#1 app::Dog - 42 updates"));
        assert!(text.contains("seen: app::Animal (30), app::Pet (12)"));
        assert!(text.contains("at src/zoo.rs:7 [instancecheck] - 42"));
        assert!(text.contains("zoo::feed"));
    }

    #[test]
    fn test_text_format_empty() {
        let text = format_text("Type pollution report", &[]);
        assert!(text.contains("(0 entries)"));
        assert!(text.contains("nothing above the configured thresholds"));
    }

    #[test]
    fn test_json_format_is_parseable() {
        let entries = sample_entries();
        let json = format_json(&entries, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["pollution"][0]["type_name"], "app::Dog");
        assert_eq!(value["pollution"][0]["update_count"], 42);
        assert!(value.get("misses").is_none());
    }

    #[test]
    fn test_json_format_includes_misses_when_present() {
        let entries = sample_entries();
        let json = format_json(&entries, Some(&entries)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["misses"][0]["type_name"], "app::Dog");
    }

    #[test]
    fn test_file_sink_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let sink = ReportSink::file(path.clone());
        sink.write("report body");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "report body");
        assert!(!sink.is_degraded());
    }

    #[test]
    fn test_json_detection_by_extension() {
        assert!(ReportSink::file(PathBuf::from("/tmp/out.json")).wants_json());
        assert!(ReportSink::file(PathBuf::from("/tmp/out.JSON")).wants_json());
        assert!(!ReportSink::file(PathBuf::from("/tmp/out.txt")).wants_json());
        assert!(!ReportSink::console().wants_json());
    }

    #[test]
    fn test_failed_file_sink_is_sticky() {
        let sink = ReportSink::file(PathBuf::from("/nonexistent-dir/deep/report.txt"));
        sink.write("first");
        assert!(sink.is_degraded());
        // Later cycles go straight to console without retrying the file.
        sink.write("second");
        assert!(sink.is_degraded());
    }
}
