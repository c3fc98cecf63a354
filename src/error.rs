use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::overlay::{OverlayId, OverlayState};

/// Errors surfaced by the selection-to-overlay pipeline.
///
/// Selection errors abort only the current gesture. `NoTextDetected` aborts
/// overlay creation before the page is touched. Translation failures are
/// normally folded into a sentinel overlay by the chain and only reach this
/// type when a caller asks for a strict result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("selection too small ({w:.2}x{h:.2} document units, minimum {min})")]
    SelectionTooSmall { w: f64, h: f64, min: f64 },

    #[error("selection lies outside the page bounds ({page_w}x{page_h})")]
    SelectionOutOfBounds { page_w: u32, page_h: u32 },

    #[error("failed to open document '{path}': {detail}")]
    DocumentOpen { path: PathBuf, detail: String },

    #[error("page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    #[error("no text detected in the selection")]
    NoTextDetected,

    #[error("recognition engine unavailable: {0}")]
    RecognitionEngineUnavailable(String),

    #[error("all translation providers failed: {}", .failures.join("; "))]
    AllTranslationProvidersFailed { failures: Vec<String> },

    #[error("provider '{provider}' timed out after {}s", .after.as_secs_f32())]
    ProviderTimeout { provider: String, after: Duration },

    #[error("overlay {0} does not exist")]
    UnknownOverlay(OverlayId),

    #[error("overlay {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: OverlayId,
        from: OverlayState,
        to: OverlayState,
    },

    #[error("overlay {id} is {state:?} and cannot be changed")]
    OverlayNotEditable { id: OverlayId, state: OverlayState },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("no document is open")]
    NoDocument,
}

/// Failure of a single translation provider call. The chain folds every
/// variant into a fall-through to the next provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited (status {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("process exited with {code:?}: {stderr}")]
    Process { code: Option<i32>, stderr: String },

    /// Provider cannot work in this session at all (missing binary or key).
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn disables_provider(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

/// Failure reported by a recognition engine. Returning an empty string is the
/// normal way to say "no text"; these are engine-level problems.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not available: {0}")]
    Unavailable(String),

    #[error("engine failed: {0}")]
    Failed(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
