//! Point-in-time snapshot extraction and ranking
//!
//! A snapshot is one best-effort pass over the recorder registry while
//! recording continues. Counters read here are lossy lower bounds and two
//! reads of the same counter may disagree; the ranking is therefore
//! approximate by construction and ties are broken arbitrarily.
//!
//! The optional cleanup pruning drops entries whose every call site is
//! touched by exactly one concrete key across the whole snapshot. Such
//! sites are usually a single concrete type checked against two different
//! abstract targets, which flips the detector without being the
//! multi-implementation pollution a reader cares about. This is a
//! heuristic, not a proof: it can drop true positives and keep false ones.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::recorder::TraceRecorder;
use crate::registry::AppendOnlyRegistry;
use crate::stack_capture::StackSample;
use crate::token::{CheckKind, TypeToken};

/// One abstract target with the observations attributed to it.
#[derive(Debug, Clone, Serialize)]
pub struct TargetCount {
    pub target: &'static str,
    pub count: u64,
}

/// Per-call-site slice of a report entry.
#[derive(Debug, Clone, Serialize)]
pub struct SiteSnapshot {
    pub location: &'static str,
    pub kind: CheckKind,
    /// Total observations at this site, all targets combined.
    pub count: u64,
    /// Targets seen at this site, ranked by count descending.
    pub targets: Vec<TargetCount>,
    /// Resolved sampled stacks; empty when sampling is disabled.
    pub sampled_stacks: Vec<Vec<String>>,
}

/// Ranked report entry for one concrete key type.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub type_name: &'static str,
    /// Total flips (or misses) recorded for the key. Approximate.
    pub update_count: u64,
    /// Distinct targets across all sites, ranked by total count descending.
    pub seen_targets: Vec<TargetCount>,
    /// Call sites, ranked by count descending.
    pub sites: Vec<SiteSnapshot>,
}

/// Walk the registry once and build ranked entries for every recorder whose
/// update count strictly exceeds `max(1, min_update_count)` and which has at
/// least one recorded trace.
pub(crate) fn collect(
    registry: &AppendOnlyRegistry<TraceRecorder>,
    min_update_count: u64,
) -> Vec<ReportEntry> {
    let floor = min_update_count.max(1);
    let mut entries = Vec::new();
    registry.for_each(|recorder| {
        if recorder.update_count() <= floor || !recorder.has_traces() {
            return;
        }
        entries.push(build_entry(recorder));
    });
    entries.sort_by(|a, b| b.update_count.cmp(&a.update_count));
    entries
}

fn build_entry(recorder: &TraceRecorder) -> ReportEntry {
    // Keyed by token identity, not name: two distinct tokens may share a
    // display name and must not merge.
    let mut per_target: HashMap<&'static TypeToken, u64> = HashMap::new();
    let mut per_site: HashMap<(&'static str, CheckKind), SiteAccumulator> = HashMap::new();

    recorder.for_each_trace(|key, record| {
        let count = record.count();
        *per_target.entry(key.target).or_default() += count;
        let site = per_site
            .entry((key.site.location, key.site.kind))
            .or_default();
        site.count += count;
        site.targets.push(TargetCount {
            target: key.target.name(),
            count,
        });
        for sample in record.sampled_stacks() {
            if !site.stacks.contains(&sample) {
                site.stacks.push(sample);
            }
        }
    });

    let mut seen_targets: Vec<TargetCount> = per_target
        .into_iter()
        .map(|(token, count)| TargetCount {
            target: token.name(),
            count,
        })
        .collect();
    seen_targets.sort_by(|a, b| b.count.cmp(&a.count));

    let mut sites: Vec<SiteSnapshot> = per_site
        .into_iter()
        .map(|((location, kind), mut accumulated)| {
            accumulated.targets.sort_by(|a, b| b.count.cmp(&a.count));
            SiteSnapshot {
                location,
                kind,
                count: accumulated.count,
                targets: accumulated.targets,
                sampled_stacks: accumulated
                    .stacks
                    .iter()
                    .map(StackSample::resolve)
                    .collect(),
            }
        })
        .collect();
    sites.sort_by(|a, b| b.count.cmp(&a.count));

    ReportEntry {
        type_name: recorder.key().name(),
        update_count: recorder.update_count(),
        seen_targets,
        sites,
    }
}

#[derive(Default)]
struct SiteAccumulator {
    count: u64,
    targets: Vec<TargetCount>,
    stacks: Vec<StackSample>,
}

/// Cleanup heuristic: drop entries whose every call site is "safe".
///
/// A site is safe when exactly one concrete key references it anywhere in
/// this snapshot; a site shared by two or more keys is evidence of real
/// pollution and shields every entry that touches it. Best effort only.
pub(crate) fn prune_single_keyed(entries: Vec<ReportEntry>) -> Vec<ReportEntry> {
    let mut keys_per_site: HashMap<(&'static str, CheckKind), HashSet<usize>> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        for site in &entry.sites {
            keys_per_site
                .entry((site.location, site.kind))
                .or_default()
                .insert(index);
        }
    }
    entries
        .into_iter()
        .filter(|entry| {
            entry.sites.iter().any(|site| {
                keys_per_site
                    .get(&(site.location, site.kind))
                    .is_some_and(|keys| keys.len() > 1)
            })
        })
        .collect()
}
