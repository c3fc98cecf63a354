use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ocr::{NormalizeMode, SegmentationMode};
use crate::overlay::{DEFAULT_FONT_SIZE, clamp_font_size};
use crate::preprocess::PreprocessConfig;
use crate::providers::ProviderKind;
use crate::translate::{DEFAULT_COURTESY_DELAY, DEFAULT_FAILURE_TEXT};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub dpi: u32,
    pub ocr: OcrSettings,
    pub preprocess: PreprocessConfig,
    pub translation: TranslationSettings,
    pub openai: ProviderSettings,
    pub google: ProviderSettings,
    pub ollama: ProviderSettings,
    pub font_size: f32,
}

#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub binary: String,
    pub language: String,
    pub normalize: NormalizeMode,
    pub primary_mode: SegmentationMode,
    pub fallback_modes: Vec<SegmentationMode>,
}

#[derive(Debug, Clone)]
pub struct TranslationSettings {
    pub source_lang: String,
    pub target_lang: String,
    pub providers: Vec<ProviderKind>,
    pub courtesy_delay: Duration,
    pub failure_text: String,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub binary: Option<String>,
    pub prompt: Option<String>,
    pub timeout: Duration,
    pub courtesy_delay: bool,
}

impl ProviderSettings {
    fn for_kind(kind: ProviderKind) -> Self {
        Self {
            model: None,
            base_url: None,
            binary: None,
            prompt: None,
            timeout: kind.default_timeout(),
            courtesy_delay: kind == ProviderKind::Google,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dpi: 200,
            ocr: OcrSettings {
                binary: "tesseract".to_string(),
                language: "jpn".to_string(),
                normalize: NormalizeMode::Auto,
                primary_mode: SegmentationMode::SINGLE_BLOCK,
                fallback_modes: SegmentationMode::DEFAULT_FALLBACKS.to_vec(),
            },
            preprocess: PreprocessConfig::default(),
            translation: TranslationSettings {
                source_lang: "ja".to_string(),
                target_lang: "es".to_string(),
                providers: vec![ProviderKind::OpenAI, ProviderKind::Google, ProviderKind::Ollama],
                courtesy_delay: DEFAULT_COURTESY_DELAY,
                failure_text: DEFAULT_FAILURE_TEXT.to_string(),
            },
            openai: ProviderSettings::for_kind(ProviderKind::OpenAI),
            google: ProviderSettings::for_kind(ProviderKind::Google),
            ollama: ProviderSettings::for_kind(ProviderKind::Ollama),
            font_size: DEFAULT_FONT_SIZE,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    document: Option<DocumentSection>,
    ocr: Option<OcrSection>,
    preprocess: Option<PreprocessSection>,
    translation: Option<TranslationSection>,
    providers: Option<ProvidersSection>,
    overlay: Option<OverlaySection>,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentSection {
    dpi: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct OcrSection {
    binary: Option<String>,
    language: Option<String>,
    normalize: Option<String>,
    primary_mode: Option<u8>,
    fallback_modes: Option<Vec<u8>>,
}

#[derive(Debug, Default, Deserialize)]
struct PreprocessSection {
    deskew: Option<bool>,
    denoise: Option<bool>,
    contrast: Option<bool>,
    threshold: Option<bool>,
    sharpen: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslationSection {
    source_lang: Option<String>,
    target_lang: Option<String>,
    providers: Option<Vec<String>>,
    courtesy_delay_ms: Option<u64>,
    failure_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersSection {
    openai: Option<ProviderSection>,
    google: Option<ProviderSection>,
    ollama: Option<ProviderSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderSection {
    model: Option<String>,
    base_url: Option<String>,
    binary: Option<String>,
    prompt: Option<String>,
    timeout_secs: Option<u64>,
    courtesy_delay: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct OverlaySection {
    font_size: Option<f32>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    Settings::from_paths(&ordered_paths)
}

impl Settings {
    /// Defaults overlaid with every existing file in `paths`, in order.
    pub fn from_paths(paths: &[PathBuf]) -> Result<Settings> {
        let mut settings = Settings::default();
        for path in paths {
            if path.exists() {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings: {}", path.display()))?;
                settings
                    .merge_str(&content)
                    .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            }
        }
        Ok(settings)
    }

    pub fn merge_str(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed)
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(document) = incoming.document
            && let Some(dpi) = document.dpi
            && dpi > 0
        {
            self.dpi = dpi;
        }
        if let Some(ocr) = incoming.ocr {
            self.merge_ocr(ocr)?;
        }
        if let Some(preprocess) = incoming.preprocess {
            let config = &mut self.preprocess;
            config.deskew = preprocess.deskew.unwrap_or(config.deskew);
            config.denoise = preprocess.denoise.unwrap_or(config.denoise);
            config.contrast = preprocess.contrast.unwrap_or(config.contrast);
            config.threshold = preprocess.threshold.unwrap_or(config.threshold);
            config.sharpen = preprocess.sharpen.unwrap_or(config.sharpen);
        }
        if let Some(translation) = incoming.translation {
            self.merge_translation(translation)?;
        }
        if let Some(providers) = incoming.providers {
            if let Some(section) = providers.openai {
                merge_provider(&mut self.openai, section);
            }
            if let Some(section) = providers.google {
                merge_provider(&mut self.google, section);
            }
            if let Some(section) = providers.ollama {
                merge_provider(&mut self.ollama, section);
            }
        }
        if let Some(overlay) = incoming.overlay
            && let Some(size) = overlay.font_size
            && size > 0.0
        {
            self.font_size = clamp_font_size(size);
        }
        Ok(())
    }

    fn merge_ocr(&mut self, ocr: OcrSection) -> Result<()> {
        if let Some(binary) = ocr.binary
            && !binary.trim().is_empty()
        {
            self.ocr.binary = binary;
        }
        if let Some(language) = ocr.language
            && !language.trim().is_empty()
        {
            self.ocr.language = language.trim().to_string();
        }
        if let Some(normalize) = ocr.normalize {
            self.ocr.normalize = normalize.parse().map_err(|err: String| anyhow!(err))?;
        }
        if let Some(mode) = ocr.primary_mode {
            self.ocr.primary_mode = SegmentationMode(mode);
        }
        if let Some(modes) = ocr.fallback_modes {
            self.ocr.fallback_modes = modes.into_iter().map(SegmentationMode).collect();
        }
        Ok(())
    }

    fn merge_translation(&mut self, translation: TranslationSection) -> Result<()> {
        if let Some(lang) = translation.source_lang
            && !lang.trim().is_empty()
        {
            self.translation.source_lang = lang.trim().to_string();
        }
        if let Some(lang) = translation.target_lang
            && !lang.trim().is_empty()
        {
            self.translation.target_lang = lang.trim().to_string();
        }
        if let Some(names) = translation.providers {
            let mut providers = Vec::new();
            for name in names {
                let kind: ProviderKind = name.parse().map_err(|err: String| anyhow!(err))?;
                if !providers.contains(&kind) {
                    providers.push(kind);
                }
            }
            self.translation.providers = providers;
        }
        if let Some(ms) = translation.courtesy_delay_ms {
            self.translation.courtesy_delay = Duration::from_millis(ms);
        }
        if let Some(text) = translation.failure_text
            && !text.trim().is_empty()
        {
            self.translation.failure_text = text;
        }
        Ok(())
    }

    pub fn provider(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::OpenAI => &self.openai,
            ProviderKind::Google => &self.google,
            ProviderKind::Ollama => &self.ollama,
        }
    }
}

fn merge_provider(target: &mut ProviderSettings, section: ProviderSection) {
    let non_empty = |value: Option<String>| value.filter(|value| !value.trim().is_empty());
    if let Some(model) = non_empty(section.model) {
        target.model = Some(model);
    }
    if let Some(base_url) = non_empty(section.base_url) {
        target.base_url = Some(base_url);
    }
    if let Some(binary) = non_empty(section.binary) {
        target.binary = Some(binary);
    }
    if let Some(prompt) = non_empty(section.prompt) {
        target.prompt = Some(prompt);
    }
    if let Some(secs) = section.timeout_secs
        && secs > 0
    {
        target.timeout = Duration::from_secs(secs);
    }
    if let Some(courtesy) = section.courtesy_delay {
        target.courtesy_delay = courtesy;
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".overlay-translator"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_file_matches_defaults() {
        let mut settings = Settings::default();
        settings.merge_str(DEFAULT_SETTINGS_TOML).expect("bundled settings");
        let defaults = Settings::default();
        assert_eq!(settings.dpi, defaults.dpi);
        assert_eq!(settings.ocr.language, defaults.ocr.language);
        assert_eq!(settings.ocr.primary_mode, defaults.ocr.primary_mode);
        assert_eq!(settings.ocr.fallback_modes, defaults.ocr.fallback_modes);
        assert_eq!(settings.translation.providers, defaults.translation.providers);
        assert_eq!(settings.translation.courtesy_delay, defaults.translation.courtesy_delay);
        assert_eq!(settings.translation.failure_text, defaults.translation.failure_text);
        assert_eq!(settings.ollama.timeout, Duration::from_secs(40));
        assert!(settings.google.courtesy_delay);
        assert!(!settings.openai.courtesy_delay);
        assert!(settings.preprocess.is_identity());
        assert_eq!(settings.font_size, DEFAULT_FONT_SIZE);
    }

    #[test]
    fn later_files_win() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("settings.toml");
        let local = dir.path().join("settings.local.toml");
        fs::write(
            &base,
            "[translation]\ntarget_lang = \"fr\"\nproviders = [\"google\"]\n[preprocess]\ncontrast = true\n",
        )
        .expect("write base");
        fs::write(
            &local,
            "[translation]\ntarget_lang = \"en\"\n[providers.google]\ntimeout_secs = 3\n[overlay]\nfont_size = 200\n",
        )
        .expect("write local");

        let settings = Settings::from_paths(&[
            base,
            dir.path().join("missing.toml"),
            local,
        ])
        .expect("settings");
        assert_eq!(settings.translation.target_lang, "en");
        assert_eq!(settings.translation.providers, vec![ProviderKind::Google]);
        assert_eq!(settings.google.timeout, Duration::from_secs(3));
        assert!(settings.preprocess.contrast);
        assert!(!settings.preprocess.sharpen);
        assert_eq!(settings.font_size, 72.0);
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let mut settings = Settings::default();
        let err = settings
            .merge_str("[translation]\nproviders = [\"deepl\"]\n")
            .unwrap_err();
        assert!(err.to_string().contains("deepl"));
    }

    #[test]
    fn normalize_mode_is_parsed() {
        let mut settings = Settings::default();
        settings
            .merge_str("[ocr]\nnormalize = \"paragraph\"\nlanguage = \"eng\"\n")
            .expect("merge");
        assert_eq!(settings.ocr.normalize, NormalizeMode::Paragraph);
        assert!(settings.merge_str("[ocr]\nnormalize = \"fancy\"\n").is_err());
    }
}
