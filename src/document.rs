use anyhow::{Context, anyhow};
use image::{ImageFormat, Rgba, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::geometry::PixelRect;
use crate::process::command_exists;

const DEFAULT_PDF_DPI: u32 = 200;

/// Turns a document on disk into an ordered list of page rasters.
pub trait Rasterizer: Send + Sync {
    fn render(&self, path: &Path) -> Result<Vec<RgbaImage>>;
}

/// Renders PDFs through `mutool` or `pdftoppm` and decodes everything else
/// as a raster image.
#[derive(Debug, Clone)]
pub struct FileRasterizer {
    dpi: u32,
}

impl Default for FileRasterizer {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_PDF_DPI,
        }
    }
}

impl FileRasterizer {
    pub fn with_dpi(mut self, dpi: u32) -> Self {
        if dpi > 0 {
            self.dpi = dpi;
        }
        self
    }
}

impl Rasterizer for FileRasterizer {
    fn render(&self, path: &Path) -> Result<Vec<RgbaImage>> {
        let rendered = if is_pdf(path) {
            render_pdf_pages(path, self.dpi)
        } else {
            image::open(path)
                .map(|image| vec![image.to_rgba8()])
                .with_context(|| "failed to decode image")
        };
        let pages = rendered.map_err(|err| PipelineError::DocumentOpen {
            path: path.to_path_buf(),
            detail: format!("{:#}", err),
        })?;
        if pages.is_empty() {
            return Err(PipelineError::DocumentOpen {
                path: path.to_path_buf(),
                detail: "no pages found".to_string(),
            });
        }
        info!("rendered {} page(s) from {}", pages.len(), path.display());
        Ok(pages)
    }
}

fn is_pdf(path: &Path) -> bool {
    if path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
    {
        return true;
    }
    fs::read(path)
        .map(|bytes| bytes.starts_with(b"%PDF"))
        .unwrap_or(false)
}

fn render_pdf_pages(path: &Path, dpi: u32) -> anyhow::Result<Vec<RgbaImage>> {
    if !path.exists() {
        return Err(anyhow!("file not found"));
    }
    let dir = tempdir().with_context(|| "failed to create temp dir for pdf")?;

    if command_exists("mutool") {
        let output = Command::new("mutool")
            .arg("draw")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-o")
            .arg(dir.path().join("page-%03d.png"))
            .arg(path)
            .output()
            .with_context(|| "failed to run mutool")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("mutool failed: {}", stderr.trim()));
        }
    } else if command_exists("pdftoppm") {
        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg(path)
            .arg(dir.path().join("page"))
            .output()
            .with_context(|| "failed to run pdftoppm")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("pdftoppm failed: {}", stderr.trim()));
        }
    } else {
        return Err(anyhow!(
            "pdf rendering requires mutool or pdftoppm (install mupdf or poppler)"
        ));
    }

    let mut entries: Vec<_> = fs::read_dir(dir.path())
        .with_context(|| "failed to read temp pdf directory")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
        })
        .collect();
    entries.sort();

    let mut pages = Vec::with_capacity(entries.len());
    for entry in entries {
        let image = image::open(&entry)
            .with_context(|| format!("failed to decode rendered page {}", entry.display()))?;
        pages.push(image.to_rgba8());
    }
    Ok(pages)
}

/// A page of the open document. `current` starts as a copy of `original` and
/// receives background fills; both always share the same dimensions.
#[derive(Debug, Clone)]
pub struct DocumentPage {
    original: RgbaImage,
    current: RgbaImage,
}

impl DocumentPage {
    pub fn new(raster: RgbaImage) -> Self {
        Self {
            current: raster.clone(),
            original: raster,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.original.dimensions()
    }

    pub fn original(&self) -> &RgbaImage {
        &self.original
    }

    pub fn current(&self) -> &RgbaImage {
        &self.current
    }

    /// Copies a window of the current raster.
    pub fn crop(&self, rect: PixelRect) -> RgbaImage {
        let rect = self.clip(rect);
        image::imageops::crop_imm(&self.current, rect.x, rect.y, rect.w, rect.h).to_image()
    }

    pub fn fill(&mut self, rect: PixelRect, color: Rgba<u8>) {
        let rect = self.clip(rect);
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                self.current.put_pixel(x, y, color);
            }
        }
    }

    /// Puts the original pixels of a window back into the current raster.
    pub fn restore(&mut self, rect: PixelRect) {
        let rect = self.clip(rect);
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                let pixel = *self.original.get_pixel(x, y);
                self.current.put_pixel(x, y, pixel);
            }
        }
    }

    pub fn save_current(&self, path: &Path) -> anyhow::Result<()> {
        let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
        self.current
            .save_with_format(path, format)
            .with_context(|| format!("failed to write page raster: {}", path.display()))
    }

    fn clip(&self, rect: PixelRect) -> PixelRect {
        let (width, height) = self.dimensions();
        let x = rect.x.min(width);
        let y = rect.y.min(height);
        PixelRect {
            x,
            y,
            w: rect.w.min(width - x),
            h: rect.h.min(height - y),
        }
    }
}

/// Background colour estimate: the crop downsampled to a single pixel.
pub fn sample_background(crop: &RgbaImage) -> Rgba<u8> {
    if crop.width() == 0 || crop.height() == 0 {
        return Rgba([255, 255, 255, 255]);
    }
    let pixel = image::imageops::thumbnail(crop, 1, 1);
    *pixel.get_pixel(0, 0)
}

#[derive(Debug, Clone)]
pub struct Document {
    path: Option<PathBuf>,
    pages: Vec<DocumentPage>,
}

impl Document {
    pub fn open(path: &Path, rasterizer: &dyn Rasterizer) -> Result<Self> {
        let pages = rasterizer.render(path)?;
        debug!("document {} opened", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            pages: pages.into_iter().map(DocumentPage::new).collect(),
        })
    }

    pub fn from_rasters(rasters: Vec<RgbaImage>) -> Self {
        Self {
            path: None,
            pages: rasters.into_iter().map(DocumentPage::new).collect(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, index: usize) -> Result<&DocumentPage> {
        let total = self.pages.len();
        self.pages
            .get(index)
            .ok_or(PipelineError::PageOutOfRange { page: index, total })
    }

    pub fn page_mut(&mut self, index: usize) -> Result<&mut DocumentPage> {
        let total = self.pages.len();
        self.pages
            .get_mut(index)
            .ok_or(PipelineError::PageOutOfRange { page: index, total })
    }
}
