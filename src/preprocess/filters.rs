use image::{GrayImage, Luma};
use imageproc::contrast::{adaptive_threshold, equalize_histogram};
use imageproc::filter::{filter3x3, gaussian_blur_f32, median_filter};

use super::StageError;

const DENOISE_SIGMA: f32 = 1.0;
const CLAHE_CLIP_LIMIT: f32 = 2.0;
const CLAHE_TILE: u32 = 8;
const CONTRAST_BOOST: f32 = 1.2;
const THRESHOLD_RADIUS: u32 = 15;
const SHARPEN_KERNEL: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];

pub(super) fn denoise(image: &GrayImage) -> Result<GrayImage, StageError> {
    require_min_side(image, 3)?;
    let blurred = gaussian_blur_f32(image, DENOISE_SIGMA);
    Ok(median_filter(&blurred, 1, 1))
}

/// CLAHE, then global equalization, then a linear boost around mid-grey.
pub(super) fn enhance_contrast(image: &GrayImage) -> Result<GrayImage, StageError> {
    let local = clahe(image, CLAHE_CLIP_LIMIT, CLAHE_TILE)?;
    let mut output = equalize_histogram(&local);
    for pixel in output.pixels_mut() {
        let boosted = (pixel[0] as f32 - 128.0) * CONTRAST_BOOST + 128.0;
        pixel[0] = boosted.round().clamp(0.0, 255.0) as u8;
    }
    Ok(output)
}

pub(super) fn threshold(image: &GrayImage) -> Result<GrayImage, StageError> {
    require_min_side(image, 1)?;
    Ok(adaptive_threshold(image, THRESHOLD_RADIUS))
}

pub(super) fn sharpen(image: &GrayImage) -> Result<GrayImage, StageError> {
    require_min_side(image, 3)?;
    Ok(filter3x3::<_, f32, u8>(image, &SHARPEN_KERNEL))
}

fn require_min_side(image: &GrayImage, min: u32) -> Result<(), StageError> {
    let (width, height) = image.dimensions();
    if width < min || height < min {
        return Err(StageError::TooSmall { width, height });
    }
    Ok(())
}

/// Contrast limited adaptive histogram equalization with bilinear blending
/// between the mappings of neighbouring tiles.
pub(super) fn clahe(image: &GrayImage, clip_limit: f32, tile: u32) -> Result<GrayImage, StageError> {
    if tile == 0 || clip_limit <= 0.0 {
        return Err(StageError::InvalidParameters(format!(
            "clahe clip_limit={} tile={}",
            clip_limit, tile
        )));
    }
    require_min_side(image, 1)?;
    let (width, height) = image.dimensions();
    let tiles_x = width.div_ceil(tile);
    let tiles_y = height.div_ceil(tile);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile;
            let y0 = ty * tile;
            luts.push(tile_lut(
                image,
                x0,
                y0,
                (x0 + tile).min(width),
                (y0 + tile).min(height),
                clip_limit,
            ));
        }
    }

    let locate = |pos: u32, tiles: u32| -> (usize, usize, f32) {
        let center = (pos as f32 + 0.5) / tile as f32 - 0.5;
        let first = center.floor().clamp(0.0, (tiles - 1) as f32);
        let second = (first + 1.0).min((tiles - 1) as f32);
        let weight = (center - first).clamp(0.0, 1.0);
        (first as usize, second as usize, weight)
    };

    let stride = tiles_x as usize;
    let mut output = GrayImage::new(width, height);
    for y in 0..height {
        let (ty0, ty1, wy) = locate(y, tiles_y);
        for x in 0..width {
            let (tx0, tx1, wx) = locate(x, tiles_x);
            let value = image.get_pixel(x, y)[0] as usize;
            let top = luts[ty0 * stride + tx0][value] as f32 * (1.0 - wx)
                + luts[ty0 * stride + tx1][value] as f32 * wx;
            let bottom = luts[ty1 * stride + tx0][value] as f32 * (1.0 - wx)
                + luts[ty1 * stride + tx1][value] as f32 * wx;
            let blended = top * (1.0 - wy) + bottom * wy;
            output.put_pixel(x, y, Luma([blended.round().clamp(0.0, 255.0) as u8]));
        }
    }
    Ok(output)
}

fn tile_lut(
    image: &GrayImage,
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    clip_limit: f32,
) -> [u8; 256] {
    let mut histogram = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            histogram[image.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let count: u32 = histogram.iter().sum();
    let mut lut = [0u8; 256];
    if count == 0 {
        return lut;
    }

    let limit = ((clip_limit * count as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in histogram.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (idx, bin) in histogram.iter_mut().enumerate() {
        *bin += share + u32::from(idx < remainder);
    }

    let mut cumulative = 0u32;
    for (idx, bin) in histogram.iter().enumerate() {
        cumulative += bin;
        lut[idx] = ((cumulative as f32 * 255.0) / count as f32).round().min(255.0) as u8;
    }
    lut
}
