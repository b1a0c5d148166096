//! Kernel-panic marker detection.
//!
//! Lazily compiles a `Regex` once into a `OnceLock` rather than per-call.
//! Applied uniformly to every runner's captured stdout/stderr by the
//! dispatcher right after an attempt finishes, so no individual `Runner`
//! impl needs to duplicate the pattern set.

use std::sync::OnceLock;

use regex::Regex;

static PANIC_PATTERN: OnceLock<Regex> = OnceLock::new();

fn pattern() -> &'static Regex {
    PANIC_PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(kernel panic|oops: |general protection fault|unable to handle kernel|BUG: (soft|hard)lockup|Call Trace:\s*\n\s*\[)")
            .expect("panic pattern is a valid static regex")
    })
}

/// Scans captured output for a kernel-panic or oops marker.
pub fn detect(stdout: &str, stderr: &str) -> bool {
    pattern().is_match(stdout) || pattern().is_match(stderr)
}
