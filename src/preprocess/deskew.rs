use image::{GrayImage, Luma};
use imageproc::edges::canny;
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use imageproc::hough::{LineDetectionOptions, detect_lines};

use super::StageError;

const MIN_SIDE: u32 = 20;
/// Lines further than this from horizontal are not text baselines.
const MAX_SKEW_DEGREES: f32 = 45.0;
/// Below this the text is treated as straight.
const MIN_ROTATION_DEGREES: f32 = 0.5;

pub(super) fn deskew(image: &GrayImage) -> Result<GrayImage, StageError> {
    let angle = detect_skew(image)?;
    if angle.abs() <= MIN_ROTATION_DEGREES {
        return Ok(image.clone());
    }
    Ok(rotate_about_center(
        image,
        -angle.to_radians(),
        Interpolation::Bilinear,
        Luma([255]),
    ))
}

/// Dominant text-line angle in degrees; positive means the lines descend to
/// the right (clockwise skew).
pub(super) fn detect_skew(image: &GrayImage) -> Result<f32, StageError> {
    let (width, height) = image.dimensions();
    if width < MIN_SIDE || height < MIN_SIDE {
        return Err(StageError::TooSmall { width, height });
    }

    let edges = canny(image, 50.0, 100.0);
    let options = LineDetectionOptions {
        vote_threshold: (width / 3).max(10),
        suppression_radius: 8,
    };
    let mut angles = detect_lines(&edges, options)
        .into_iter()
        .map(|line| line.angle_in_degrees as f32 - 90.0)
        .filter(|angle| angle.abs() <= MAX_SKEW_DEGREES)
        .collect::<Vec<_>>();
    if angles.is_empty() {
        return Ok(0.0);
    }
    angles.sort_by(|a, b| a.total_cmp(b));
    Ok(median(&angles))
}

fn median(sorted: &[f32]) -> f32 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
