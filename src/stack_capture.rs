//! Bounded call-stack capture for sampled flip sites
//!
//! Captures store raw instruction pointers only; symbol resolution is
//! deferred to report time so the sampling path stays cheap. Samples are
//! content-comparable, which is what lets a trace record deduplicate the
//! stacks it retains.

use std::ffi::c_void;

/// `max_frames == 0` means "no truncation, keep the whole stack".
pub const UNLIMITED_FRAMES: usize = 0;

/// Frames between the instrumented call site and the capture loop below.
/// Hard-coded to the current recording path (engine entry -> recorder ->
/// trace record -> capture); brittle if that path changes depth.
const ENGINE_FRAMES: usize = 4;

/// One sampled call stack: return addresses ordered innermost-first,
/// engine-internal frames skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackSample {
    frames: Vec<usize>,
}

impl StackSample {
    /// Capture the current thread's stack, keeping at most `max_frames`
    /// application frames (all of them for [`UNLIMITED_FRAMES`]).
    ///
    /// Best-effort: a platform where unwinding fails simply yields an empty
    /// sample, which callers discard.
    pub(crate) fn capture(max_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(if max_frames == UNLIMITED_FRAMES {
            32
        } else {
            max_frames
        });
        let mut skipped = 0usize;
        backtrace::trace(|frame| {
            if skipped < ENGINE_FRAMES {
                skipped += 1;
                return true;
            }
            frames.push(frame.ip() as usize);
            max_frames == UNLIMITED_FRAMES || frames.len() < max_frames
        });
        StackSample { frames }
    }

    /// Build a sample from raw addresses. Test seam.
    #[cfg(test)]
    pub(crate) fn from_raw(frames: Vec<usize>) -> Self {
        StackSample { frames }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Resolve the sample to human-readable frame lines.
    ///
    /// Symbolization happens here, on the report path, never at capture
    /// time. Frames that cannot be resolved fall back to their raw address.
    pub fn resolve(&self) -> Vec<String> {
        self.frames
            .iter()
            .map(|&ip| {
                let mut line = None;
                backtrace::resolve(ip as *mut c_void, |symbol| {
                    if line.is_some() {
                        return;
                    }
                    let name = symbol
                        .name()
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| format!("{:#x}", ip));
                    line = Some(match (symbol.filename(), symbol.lineno()) {
                        (Some(file), Some(lineno)) => {
                            format!("{} ({}:{})", name, file.display(), lineno)
                        }
                        _ => name,
                    });
                });
                line.unwrap_or_else(|| format!("{:#x}", ip))
            })
            .collect()
    }
}
