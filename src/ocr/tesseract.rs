use anyhow::{Context, anyhow};
use image::{DynamicImage, GenericImageView};
use std::io::{ErrorKind, Write};
use std::process::Command;
use tracing::{debug, warn};

use super::{RecognitionEngine, SegmentationMode};
use crate::error::EngineError;
use crate::process::command_exists;

const DEFAULT_BINARY: &str = "tesseract";
const MAX_SCALED_WIDTH: u32 = 6000;
const MAX_SCALE: u32 = 3;

/// Tesseract driven as a subprocess, one invocation per segmentation mode.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: String,
    oem: u32,
    dpi: u32,
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            oem: 1,
            dpi: 300,
        }
    }
}

impl TesseractEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        let binary = binary.into();
        Self {
            binary: if binary.trim().is_empty() {
                DEFAULT_BINARY.to_string()
            } else {
                binary
            },
            ..Self::default()
        }
    }

    pub fn list_languages(&self) -> anyhow::Result<Vec<String>> {
        let output = Command::new(&self.binary)
            .arg("--list-langs")
            .output()
            .with_context(|| format!("failed to run {} --list-langs", self.binary))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("tesseract --list-langs failed: {}", stderr.trim()));
        }
        Ok(parse_language_list(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Keeps the requested languages the installed engine knows about. When
    /// the engine cannot be queried the request is passed through untouched.
    pub fn normalize_languages(&self, requested: &str) -> anyhow::Result<String> {
        let available = match self.list_languages() {
            Ok(list) => list,
            Err(_) => {
                let trimmed = requested.trim();
                if trimmed.is_empty() {
                    return Err(anyhow!("ocr language is empty"));
                }
                return Ok(trimmed.to_string());
            }
        };
        select_languages(requested, &available)
    }

    fn run(&self, path: &std::path::Path, language: &str, mode: SegmentationMode) -> Result<String, EngineError> {
        let output = Command::new(&self.binary)
            .arg(path)
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .arg("--oem")
            .arg(self.oem.to_string())
            .arg("--psm")
            .arg(mode.0.to_string())
            .arg("--dpi")
            .arg(self.dpi.to_string())
            .output()
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    EngineError::Unavailable(format!("{} is not installed", self.binary))
                } else {
                    EngineError::Failed(format!("failed to run {}: {}", self.binary, err))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.contains("Failed loading language") || stderr.contains("Error opening data file") {
                return Err(EngineError::Unavailable(format!(
                    "language data '{}' is missing: {}",
                    language, stderr
                )));
            }
            return Err(EngineError::Failed(format!("tesseract failed: {}", stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl RecognitionEngine for TesseractEngine {
    fn recognize(
        &self,
        raster: &DynamicImage,
        language: &str,
        mode: SegmentationMode,
    ) -> Result<String, EngineError> {
        if !command_exists(&self.binary) {
            return Err(EngineError::Unavailable(format!(
                "{} was not found on PATH",
                self.binary
            )));
        }
        let (width, height) = raster.dimensions();
        if width == 0 || height == 0 {
            return Ok(String::new());
        }

        let scale = ocr_scale(width);
        let scaled;
        let input = if scale > 1 {
            scaled = raster.resize_exact(
                width * scale,
                height * scale,
                image::imageops::FilterType::Lanczos3,
            );
            &scaled
        } else {
            raster
        };

        let mut tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .map_err(|err| EngineError::Failed(format!("failed to create temp file: {}", err)))?;
        input
            .write_to(&mut tmp, image::ImageFormat::Png)
            .map_err(|err| EngineError::Failed(format!("failed to write temp image: {}", err)))?;
        tmp.flush().ok();

        debug!("running {} on {}x{} (x{}) with {}", self.binary, width, height, scale, mode);
        self.run(tmp.path(), language, mode)
    }
}

fn ocr_scale(width: u32) -> u32 {
    let mut scale = MAX_SCALE;
    while width.saturating_mul(scale) > MAX_SCALED_WIDTH && scale > 1 {
        scale -= 1;
    }
    scale.max(1)
}

fn parse_language_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn select_languages(requested: &str, available: &[String]) -> anyhow::Result<String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("ocr language is empty"));
    }

    let mut chosen = Vec::new();
    let mut missing = Vec::new();
    for raw in trimmed.split(['+', ',', ' ']) {
        let lang = raw.trim();
        if lang.is_empty() {
            continue;
        }
        if available.iter().any(|value| value == lang) {
            chosen.push(lang.to_string());
        } else {
            missing.push(lang.to_string());
        }
    }

    if chosen.is_empty() {
        return Err(anyhow!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        ));
    }
    if !missing.is_empty() {
        warn!(
            "ocr language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        );
    }
    Ok(chosen.join("+"))
}
