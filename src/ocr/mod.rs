mod normalize;
mod tesseract;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::error::{EngineError, PipelineError, Result};

pub(crate) use normalize::is_cjk;
pub use normalize::{NormalizeMode, normalize};
pub use tesseract::TesseractEngine;

/// Page segmentation mode understood by the recognition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentationMode(pub u8);

impl SegmentationMode {
    pub const AUTO_WITH_OSD: Self = Self(1);
    pub const AUTO: Self = Self(3);
    pub const SINGLE_COLUMN: Self = Self(4);
    pub const SINGLE_BLOCK: Self = Self(6);
    pub const SINGLE_LINE: Self = Self(7);
    pub const SINGLE_WORD: Self = Self(8);
    pub const SPARSE_TEXT: Self = Self(11);
    pub const SPARSE_TEXT_OSD: Self = Self(12);

    pub const DEFAULT_FALLBACKS: [Self; 8] = [
        Self::AUTO_WITH_OSD,
        Self::AUTO,
        Self::SINGLE_COLUMN,
        Self::SINGLE_BLOCK,
        Self::SINGLE_LINE,
        Self::SINGLE_WORD,
        Self::SPARSE_TEXT,
        Self::SPARSE_TEXT_OSD,
    ];
}

impl fmt::Display for SegmentationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "psm {}", self.0)
    }
}

/// Text recognition backend. Returns an empty string when it finds no text.
pub trait RecognitionEngine: Send + Sync {
    fn recognize(
        &self,
        raster: &DynamicImage,
        language: &str,
        mode: SegmentationMode,
    ) -> Result<String, EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecognitionResult {
    /// Normalized text handed to translation.
    pub text: String,
    /// Engine output as returned.
    pub raw: String,
    pub mode: SegmentationMode,
    /// Modes tried for this crop, ending with `mode`.
    pub attempted: Vec<SegmentationMode>,
}

/// Runs the engine over a prioritized list of segmentation modes and keeps
/// the first non-empty answer.
///
/// An engine that reports itself unavailable disables the cascade for the
/// rest of the session; later calls fail immediately.
pub struct RecognitionCascade {
    engine: Arc<dyn RecognitionEngine>,
    language: String,
    normalize: NormalizeMode,
    plan: Vec<SegmentationMode>,
    disabled: OnceLock<String>,
}

impl fmt::Debug for RecognitionCascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionCascade")
            .field("language", &self.language)
            .field("normalize", &self.normalize)
            .field("plan", &self.plan)
            .field("disabled", &self.disabled.get())
            .finish()
    }
}

impl RecognitionCascade {
    pub fn new(engine: Arc<dyn RecognitionEngine>, language: impl Into<String>) -> Self {
        Self {
            engine,
            language: language.into(),
            normalize: NormalizeMode::Auto,
            plan: build_plan(
                SegmentationMode::SINGLE_BLOCK,
                &SegmentationMode::DEFAULT_FALLBACKS,
            ),
            disabled: OnceLock::new(),
        }
    }

    pub fn with_modes(mut self, primary: SegmentationMode, fallbacks: &[SegmentationMode]) -> Self {
        self.plan = build_plan(primary, fallbacks);
        self
    }

    pub fn with_normalize(mut self, mode: NormalizeMode) -> Self {
        self.normalize = mode;
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn plan(&self) -> &[SegmentationMode] {
        &self.plan
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.get().is_some()
    }

    pub fn recognize(&self, raster: &DynamicImage) -> Result<RecognitionResult> {
        if let Some(reason) = self.disabled.get() {
            return Err(PipelineError::RecognitionEngineUnavailable(reason.clone()));
        }

        let mut attempted = Vec::with_capacity(self.plan.len());
        for mode in &self.plan {
            attempted.push(*mode);
            let raw = match self.engine.recognize(raster, &self.language, *mode) {
                Ok(raw) => raw,
                Err(EngineError::Unavailable(reason)) => {
                    warn!("recognition engine disabled for this session: {}", reason);
                    let reason = self.disabled.get_or_init(|| reason).clone();
                    return Err(PipelineError::RecognitionEngineUnavailable(reason));
                }
                Err(EngineError::Failed(reason)) => {
                    warn!("recognition with {} failed: {}", mode, reason);
                    continue;
                }
            };
            let text = normalize(&raw, self.normalize, &self.language);
            if text.trim().is_empty() {
                debug!("{} produced no text", mode);
                continue;
            }
            info!("recognized {} chars with {}", text.chars().count(), mode);
            return Ok(RecognitionResult {
                text,
                raw,
                mode: *mode,
                attempted,
            });
        }
        debug!("no text after {} modes", attempted.len());
        Err(PipelineError::NoTextDetected)
    }
}

fn build_plan(primary: SegmentationMode, fallbacks: &[SegmentationMode]) -> Vec<SegmentationMode> {
    let mut plan = vec![primary];
    for mode in fallbacks {
        if !plan.contains(mode) {
            plan.push(*mode);
        }
    }
    plan
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedEngine;
    use super::*;

    fn raster() -> DynamicImage {
        DynamicImage::new_luma8(4, 4)
    }

    #[test]
    fn plan_starts_with_primary_and_skips_duplicates() {
        let cascade = RecognitionCascade::new(Arc::new(ScriptedEngine::default()), "jpn");
        let modes = cascade.plan().iter().map(|mode| mode.0).collect::<Vec<_>>();
        assert_eq!(modes, vec![6, 1, 3, 4, 7, 8, 11, 12]);
    }

    #[test]
    fn primary_success_stops_immediately() {
        let engine = Arc::new(ScriptedEngine::answering(6, "こんにちは\n"));
        let cascade = RecognitionCascade::new(engine.clone(), "jpn");
        let result = cascade.recognize(&raster()).expect("text");
        assert_eq!(result.text, "こんにちは");
        assert_eq!(result.mode, SegmentationMode::SINGLE_BLOCK);
        assert_eq!(result.attempted, vec![SegmentationMode::SINGLE_BLOCK]);
        assert_eq!(engine.calls(), 1);
    }

    #[test]
    fn stops_at_first_fallback_that_finds_text() {
        let mut engine = ScriptedEngine::answering(4, "found");
        engine.answers.insert(3, Ok("   \n ".to_string()));
        engine.answers.insert(7, Ok("later".to_string()));
        let engine = Arc::new(engine);
        let cascade = RecognitionCascade::new(engine.clone(), "eng");
        let result = cascade.recognize(&raster()).expect("text");
        assert_eq!(result.text, "found");
        assert_eq!(result.mode, SegmentationMode::SINGLE_COLUMN);
        assert_eq!(
            result.attempted,
            vec![
                SegmentationMode(6),
                SegmentationMode(1),
                SegmentationMode(3),
                SegmentationMode(4)
            ]
        );
        assert_eq!(engine.calls(), 4);
    }

    /// Wide crops read in auto mode, narrow ones only as a single line.
    struct WidthEngine;

    impl RecognitionEngine for WidthEngine {
        fn recognize(
            &self,
            raster: &DynamicImage,
            _language: &str,
            mode: SegmentationMode,
        ) -> Result<String, EngineError> {
            let wide = raster.width() > 8;
            let hit = (wide && mode == SegmentationMode::AUTO)
                || (!wide && mode == SegmentationMode::SINGLE_LINE);
            Ok(if hit { "text".to_string() } else { String::new() })
        }
    }

    #[test]
    fn concurrent_calls_report_their_own_modes() {
        let cascade = RecognitionCascade::new(Arc::new(WidthEngine), "eng");
        let wide = DynamicImage::new_luma8(32, 4);
        let narrow = DynamicImage::new_luma8(4, 4);
        let (wide_result, narrow_result) = std::thread::scope(|scope| {
            let a = scope.spawn(|| cascade.recognize(&wide));
            let b = scope.spawn(|| cascade.recognize(&narrow));
            (a.join().unwrap(), b.join().unwrap())
        });
        assert_eq!(
            wide_result.expect("wide").attempted,
            vec![SegmentationMode(6), SegmentationMode(1), SegmentationMode(3)]
        );
        assert_eq!(
            narrow_result.expect("narrow").attempted,
            vec![
                SegmentationMode(6),
                SegmentationMode(1),
                SegmentationMode(3),
                SegmentationMode(4),
                SegmentationMode(7)
            ]
        );
    }

    #[test]
    fn all_empty_is_no_text_detected() {
        let engine = Arc::new(ScriptedEngine::default());
        let cascade = RecognitionCascade::new(engine.clone(), "jpn");
        let err = cascade.recognize(&raster()).unwrap_err();
        assert!(matches!(err, PipelineError::NoTextDetected));
        assert_eq!(engine.calls(), 8);
        assert!(!cascade.is_disabled());
    }

    #[test]
    fn failing_mode_falls_through() {
        let mut engine = ScriptedEngine::answering(1, "ok");
        engine.answers.insert(6, Err("segfault".to_string()));
        let cascade = RecognitionCascade::new(Arc::new(engine), "eng");
        assert_eq!(cascade.recognize(&raster()).expect("text").text, "ok");
    }

    #[test]
    fn unavailable_engine_disables_cascade() {
        let engine = Arc::new(ScriptedEngine {
            unavailable: true,
            ..ScriptedEngine::default()
        });
        let cascade = RecognitionCascade::new(engine.clone(), "jpn");
        assert!(matches!(
            cascade.recognize(&raster()),
            Err(PipelineError::RecognitionEngineUnavailable(_))
        ));
        assert!(cascade.is_disabled());
        assert!(matches!(
            cascade.recognize(&raster()),
            Err(PipelineError::RecognitionEngineUnavailable(_))
        ));
        assert_eq!(engine.calls(), 1);
    }
}
