use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub mod document;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod ocr;
pub mod overlay;
pub mod pipeline;
pub mod preprocess;
mod process;
pub mod providers;
pub mod session;
pub mod settings;
pub mod translate;

pub use document::{Document, DocumentPage, FileRasterizer, Rasterizer};
pub use error::{EngineError, PipelineError, ProviderError};
pub use geometry::{CoordinateSpace, DocRect, ViewRect};
pub use ocr::{RecognitionCascade, RecognitionEngine, SegmentationMode, TesseractEngine};
pub use overlay::{Overlay, OverlayId, OverlayRegistry, OverlayState};
pub use pipeline::{Completion, SelectionPipeline};
pub use preprocess::{PreprocessConfig, Stage};
pub use providers::{ProviderKind, TranslationProvider, TranslationRequest};
pub use session::{Applied, DocumentSession};
pub use settings::Settings;
pub use translate::{ProviderPolicy, TranslationChain, TranslationOutcome};

/// One selection, end to end.
#[derive(Debug, Clone)]
pub struct Config {
    pub document: PathBuf,
    pub page: usize,
    pub zoom: f64,
    /// Selection in view coordinates at `zoom`.
    pub rect: ViewRect,
    pub output: Option<PathBuf>,
    pub settings_path: Option<String>,
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    pub ocr_lang: Option<String>,
    /// Stages to enable on top of the configured ones.
    pub preprocess: Vec<Stage>,
    pub fit: bool,
}

pub async fn run(config: Config) -> Result<String> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    apply_overrides(&mut settings, &config);
    resolve_ocr_language(&mut settings);

    let pipeline = build_pipeline(&settings, openai_key());
    let mut session = DocumentSession::new()
        .with_font_size(settings.font_size)
        .with_preprocess(settings.preprocess);
    let rasterizer = FileRasterizer::default().with_dpi(settings.dpi);
    session
        .open_path(&config.document, &rasterizer)
        .with_context(|| "failed to open document")?;
    session.show_page(config.page)?;
    session.set_zoom(config.zoom);

    let id = pipeline.translate_selection(&mut session, config.rect).await?;
    if config.fit {
        session.overlays_mut().resize_to_fit(id)?;
    }
    if let Some(output) = config.output.as_deref() {
        session.current_page()?.save_current(output)?;
        info!("wrote {}", output.display());
    }
    format_overlays(&session)
}

fn apply_overrides(settings: &mut Settings, config: &Config) {
    if let Some(lang) = non_empty(config.source_lang.as_deref()) {
        settings.translation.source_lang = lang;
    }
    if let Some(lang) = non_empty(config.target_lang.as_deref()) {
        settings.translation.target_lang = lang;
    }
    if let Some(lang) = non_empty(config.ocr_lang.as_deref()) {
        settings.ocr.language = lang;
    }
    for stage in &config.preprocess {
        settings.preprocess = settings.preprocess.with(*stage, true);
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Narrows the configured recognition languages to the installed ones.
/// Leaves the setting alone when none of them is installed.
pub fn resolve_ocr_language(settings: &mut Settings) {
    let engine = TesseractEngine::new(settings.ocr.binary.clone());
    match engine.normalize_languages(&settings.ocr.language) {
        Ok(language) => settings.ocr.language = language,
        Err(err) => warn!("{:#}", err),
    }
}

pub fn openai_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty())
}

pub fn build_cascade(settings: &Settings) -> RecognitionCascade {
    let engine = TesseractEngine::new(settings.ocr.binary.clone());
    RecognitionCascade::new(Arc::new(engine), settings.ocr.language.clone())
        .with_modes(settings.ocr.primary_mode, &settings.ocr.fallback_modes)
        .with_normalize(settings.ocr.normalize)
}

/// Providers in configured order. OpenAI is left out without a key.
pub fn build_chain(settings: &Settings, openai_key: Option<String>) -> TranslationChain {
    let mut chain = TranslationChain::new().with_failure_text(settings.translation.failure_text.clone());
    for kind in &settings.translation.providers {
        let provider_settings = settings.provider(*kind);
        let mut policy = ProviderPolicy::new(provider_settings.timeout);
        if provider_settings.courtesy_delay {
            policy = policy.with_courtesy_delay(settings.translation.courtesy_delay);
        }
        let provider: Box<dyn TranslationProvider> = match kind {
            ProviderKind::OpenAI => {
                let Some(key) = openai_key.clone() else {
                    info!("OPENAI_API_KEY is not set; skipping openai");
                    continue;
                };
                let mut openai = providers::OpenAI::new(key);
                if let Some(model) = provider_settings.model.as_deref() {
                    openai = openai.with_model(model);
                }
                if let Some(base_url) = provider_settings.base_url.as_deref() {
                    openai = openai.with_base_url(base_url);
                }
                Box::new(openai)
            }
            ProviderKind::Google => {
                let mut google = providers::Google::new();
                if let Some(base_url) = provider_settings.base_url.as_deref() {
                    google = google.with_base_url(base_url);
                }
                Box::new(google)
            }
            ProviderKind::Ollama => {
                let mut ollama =
                    providers::Ollama::new(provider_settings.model.clone().unwrap_or_default());
                if let Some(binary) = provider_settings.binary.as_deref() {
                    ollama = ollama.with_binary(binary);
                }
                if let Some(prompt) = provider_settings.prompt.as_deref() {
                    ollama = ollama.with_prompt(prompt);
                }
                Box::new(ollama)
            }
        };
        chain.push_boxed(provider, policy);
    }
    chain
}

pub fn build_pipeline(settings: &Settings, openai_key: Option<String>) -> SelectionPipeline {
    SelectionPipeline::new(
        build_cascade(settings),
        build_chain(settings, openai_key),
        settings.translation.source_lang.clone(),
        settings.translation.target_lang.clone(),
    )
}

#[derive(Debug, Serialize)]
struct OverlayReport<'a> {
    page: usize,
    zoom: f64,
    overlays: Vec<OverlayView<'a>>,
}

#[derive(Debug, Serialize)]
struct OverlayView<'a> {
    #[serde(flatten)]
    overlay: &'a Overlay,
    view: ViewRect,
}

/// JSON listing of the current page's overlays with their view geometry.
pub fn format_overlays(session: &DocumentSession) -> Result<String> {
    let space = session.space();
    let report = OverlayReport {
        page: session.page_index(),
        zoom: space.zoom(),
        overlays: session
            .overlays()
            .on_page(session.page_index())
            .map(|overlay| OverlayView {
                overlay,
                view: overlay.view_rect(space),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&report).with_context(|| "failed to serialize overlays")
}

/// Parses `x,y,w,h` (commas or spaces).
pub fn parse_rect(value: &str) -> Result<ViewRect> {
    let parts = value
        .split([',', ' '])
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| anyhow!("invalid number '{}' in rectangle", part.trim()))
        })
        .collect::<Result<Vec<_>>>()?;
    let [x, y, w, h] = parts.as_slice() else {
        return Err(anyhow!("rectangle must be x,y,w,h (got '{}')", value));
    };
    Ok(ViewRect::new(*x, *y, *w, *h))
}
