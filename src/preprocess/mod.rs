mod deskew;
mod filters;

use image::{DynamicImage, GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Why a single stage declined to run. Never escapes the pipeline.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("image too small ({width}x{height})")]
    TooSmall { width: u32, height: u32 },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Deskew,
    Denoise,
    Contrast,
    Threshold,
    Sharpen,
}

impl Stage {
    /// Execution order of the pipeline.
    pub const ORDER: [Stage; 5] = [
        Stage::Deskew,
        Stage::Denoise,
        Stage::Contrast,
        Stage::Threshold,
        Stage::Sharpen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Deskew => "deskew",
            Stage::Denoise => "denoise",
            Stage::Contrast => "contrast",
            Stage::Threshold => "threshold",
            Stage::Sharpen => "sharpen",
        }
    }

    fn apply(&self, image: &GrayImage) -> Result<GrayImage, StageError> {
        match self {
            Stage::Deskew => deskew::deskew(image),
            Stage::Denoise => filters::denoise(image),
            Stage::Contrast => filters::enhance_contrast(image),
            Stage::Threshold => filters::threshold(image),
            Stage::Sharpen => filters::sharpen(image),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "deskew" => Ok(Stage::Deskew),
            "denoise" => Ok(Stage::Denoise),
            "contrast" => Ok(Stage::Contrast),
            "threshold" | "binarize" => Ok(Stage::Threshold),
            "sharpen" => Ok(Stage::Sharpen),
            other => Err(format!(
                "unknown preprocess stage '{}' (expected deskew, denoise, contrast, threshold, sharpen)",
                other
            )),
        }
    }
}

/// Independent toggles for each conditioning stage. All-off is the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub deskew: bool,
    pub denoise: bool,
    pub contrast: bool,
    pub threshold: bool,
    pub sharpen: bool,
}

impl PreprocessConfig {
    pub fn all() -> Self {
        Self {
            deskew: true,
            denoise: true,
            contrast: true,
            threshold: true,
            sharpen: true,
        }
    }

    pub fn is_identity(&self) -> bool {
        Stage::ORDER.iter().all(|stage| !self.enabled(*stage))
    }

    pub fn enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Deskew => self.deskew,
            Stage::Denoise => self.denoise,
            Stage::Contrast => self.contrast,
            Stage::Threshold => self.threshold,
            Stage::Sharpen => self.sharpen,
        }
    }

    pub fn with(mut self, stage: Stage, enabled: bool) -> Self {
        match stage {
            Stage::Deskew => self.deskew = enabled,
            Stage::Denoise => self.denoise = enabled,
            Stage::Contrast => self.contrast = enabled,
            Stage::Threshold => self.threshold = enabled,
            Stage::Sharpen => self.sharpen = enabled,
        }
        self
    }

    pub fn enabled_stages(&self) -> Vec<Stage> {
        Stage::ORDER
            .into_iter()
            .filter(|stage| self.enabled(*stage))
            .collect()
    }
}

/// Conditions a crop for recognition.
///
/// With every stage disabled the crop is returned untouched. Otherwise the
/// crop is flattened onto white, converted to luma, and each enabled stage
/// runs in [`Stage::ORDER`]; a stage that fails is skipped and the previous
/// raster flows on.
pub fn condition(crop: &RgbaImage, config: &PreprocessConfig) -> DynamicImage {
    if config.is_identity() {
        return DynamicImage::ImageRgba8(crop.clone());
    }
    let mut gray = to_luma_on_white(crop);
    for stage in Stage::ORDER {
        if !config.enabled(stage) {
            continue;
        }
        match stage.apply(&gray) {
            Ok(next) => gray = next,
            Err(err) => debug!("preprocess stage {} skipped: {}", stage, err),
        }
    }
    DynamicImage::ImageLuma8(gray)
}

fn to_luma_on_white(rgba: &RgbaImage) -> GrayImage {
    let (width, height) = rgba.dimensions();
    let mut luma = GrayImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as f32 / 255.0;
        let r = r as f32 * alpha + 255.0 * (1.0 - alpha);
        let g = g as f32 * alpha + 255.0 * (1.0 - alpha);
        let b = b as f32 * alpha + 255.0 * (1.0 - alpha);
        let value = (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8;
        luma.put_pixel(x, y, image::Luma([value]));
    }
    luma
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn sample_crop() -> RgbaImage {
        let mut crop = RgbaImage::from_pixel(64, 48, Rgba([235, 230, 220, 255]));
        for y in [12u32, 13, 30, 31] {
            for x in 6..58 {
                crop.put_pixel(x, y, Rgba([20, 20, 30, 255]));
            }
        }
        crop.put_pixel(3, 3, Rgba([10, 200, 10, 128]));
        crop
    }

    #[test]
    fn identity_config_returns_identical_bytes() {
        let crop = sample_crop();
        let output = condition(&crop, &PreprocessConfig::default());
        let DynamicImage::ImageRgba8(output) = output else {
            panic!("identity must keep the colour type");
        };
        assert_eq!(output.as_raw(), crop.as_raw());
        assert_eq!(output.dimensions(), crop.dimensions());
    }

    #[test]
    fn pipeline_is_deterministic() {
        let crop = sample_crop();
        let config = PreprocessConfig::all();
        let first = condition(&crop, &config);
        let second = condition(&crop, &config);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn every_single_stage_preserves_dimensions() {
        let crop = sample_crop();
        for stage in Stage::ORDER {
            let config = PreprocessConfig::default().with(stage, true);
            let output = condition(&crop, &config);
            assert_eq!(
                (output.width(), output.height()),
                crop.dimensions(),
                "stage {}",
                stage
            );
        }
    }

    #[test]
    fn degenerate_input_does_not_abort_pipeline() {
        let crop = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 255]));
        let output = condition(&crop, &PreprocessConfig::all());
        assert_eq!((output.width(), output.height()), (1, 1));

        let empty = RgbaImage::new(0, 0);
        let output = condition(&empty, &PreprocessConfig::all());
        assert_eq!((output.width(), output.height()), (0, 0));
    }

    #[test]
    fn threshold_output_is_binary() {
        let crop = sample_crop();
        let config = PreprocessConfig::default().with(Stage::Threshold, true);
        let output = condition(&crop, &config).to_luma8();
        assert!(output.pixels().all(|pixel| pixel[0] == 0 || pixel[0] == 255));
    }

    #[test]
    fn stage_names_parse() {
        assert_eq!("Binarize".parse::<Stage>(), Ok(Stage::Threshold));
        assert_eq!("deskew".parse::<Stage>(), Ok(Stage::Deskew));
        assert!("blur".parse::<Stage>().is_err());
        assert_eq!(
            PreprocessConfig::default()
                .with(Stage::Sharpen, true)
                .with(Stage::Deskew, true)
                .enabled_stages(),
            vec![Stage::Deskew, Stage::Sharpen]
        );
    }
}
