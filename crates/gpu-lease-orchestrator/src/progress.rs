//! Structured progress events emitted by the Deployer and Stopper (design
//! §4.5, §7 "User-visible behavior"). The core pipelines only ever produce
//! these events; rendering them as `[k/N]` text lines with the
//! `⋯`/`✓`/`✗`/`⚠` glyphs is the CLI's job, kept here only as the shared
//! glyph vocabulary so the CLI and any other caller render identically.

use std::sync::Arc;

/// One stage transition: `step` is 1-based against `total`. `completed`
/// distinguishes the "stage started" event (`completed = false`) from its
/// "stage finished" event (`completed = true`); failures are reported
/// through the pipeline's `Result`, not through this type.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub step: u8,
    pub total: u8,
    pub message: String,
    pub detail: Option<String>,
    pub completed: bool,
}

impl ProgressEvent {
    pub fn start(step: u8, total: u8, message: impl Into<String>) -> Self {
        Self {
            step,
            total,
            message: message.into(),
            detail: None,
            completed: false,
        }
    }

    pub fn done(step: u8, total: u8, message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            step,
            total,
            message: message.into(),
            detail,
            completed: true,
        }
    }
}

/// Glyphs for the `[k/N]` prefixed progress line (design §7): in-progress,
/// success, failure, warning.
pub mod glyph {
    pub const IN_PROGRESS: &str = "⋯";
    pub const SUCCESS: &str = "✓";
    pub const FAILURE: &str = "✗";
    pub const WARNING: &str = "⚠";
}

/// Callback a caller supplies to observe pipeline progress. Boxed so the
/// Deployer/Stopper don't need a generic parameter threaded through every
/// stage signature.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A no-op callback for callers (tests, `--output json`) that don't render
/// progress lines.
pub fn noop() -> ProgressCallback {
    Arc::new(|_| {})
}
