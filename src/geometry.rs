use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

use crate::error::{PipelineError, Result};

pub const MIN_ZOOM: f64 = 0.2;
pub const MAX_ZOOM: f64 = 3.0;
pub const ZOOM_STEP: f64 = 0.1;
/// Smallest accepted selection edge, in document units.
pub const MIN_SELECTION: f64 = 1.0;

pub trait Space: fmt::Debug + Clone + Copy + PartialEq + 'static {
    const NAME: &'static str;
}

/// Page coordinates at zoom 1.0, origin at the page top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Document;

/// Coordinates as currently displayed: scaled by zoom, shifted by scroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View;

impl Space for Document {
    const NAME: &'static str = "document";
}

impl Space for View {
    const NAME: &'static str = "view";
}

#[derive(Clone, Copy, PartialEq, Serialize)]
#[serde(bound = "")]
pub struct Rect<S: Space> {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(skip)]
    space: PhantomData<S>,
}

pub type DocRect = Rect<Document>;
pub type ViewRect = Rect<View>;

impl<S: Space> fmt::Debug for Rect<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({:.2}, {:.2}, {:.2}x{:.2})",
            S::NAME,
            self.x,
            self.y,
            self.w,
            self.h
        )
    }
}

impl<S: Space> Rect<S> {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self {
            x,
            y,
            w,
            h,
            space: PhantomData,
        }
    }

    /// Builds a rectangle from two drag corners given in any order.
    pub fn from_corners(a: (f64, f64), b: (f64, f64)) -> Self {
        let x1 = a.0.min(b.0);
        let y1 = a.1.min(b.1);
        let x2 = a.0.max(b.0);
        let y2 = a.1.max(b.1);
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn right(&self) -> f64 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.h
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.w, self.h)
    }

    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0);
        close(self.x, other.x) && close(self.y, other.y) && close(self.w, other.w) && close(self.h, other.h)
    }
}

/// Integer pixel window of a page, used for cropping and inpainting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelRect {
    /// Overlapping window, or `None` when the two do not share a pixel.
    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        if right <= x || bottom <= y {
            return None;
        }
        Some(PixelRect {
            x,
            y,
            w: right - x,
            h: bottom - y,
        })
    }
}

impl DocRect {
    /// Smallest pixel window covering the rectangle, clipped to the page.
    pub fn pixel_bounds(&self, page_w: u32, page_h: u32) -> PixelRect {
        let x1 = self.x.floor().clamp(0.0, page_w as f64) as u32;
        let y1 = self.y.floor().clamp(0.0, page_h as f64) as u32;
        let x2 = self.right().ceil().clamp(0.0, page_w as f64) as u32;
        let y2 = self.bottom().ceil().clamp(0.0, page_h as f64) as u32;
        PixelRect {
            x: x1,
            y: y1,
            w: x2.saturating_sub(x1),
            h: y2.saturating_sub(y1),
        }
    }
}

pub fn to_document(view: ViewRect, zoom: f64) -> DocRect {
    DocRect::new(view.x / zoom, view.y / zoom, view.w / zoom, view.h / zoom)
}

pub fn to_view(doc: DocRect, zoom: f64) -> ViewRect {
    ViewRect::new(doc.x * zoom, doc.y * zoom, doc.w * zoom, doc.h * zoom)
}

pub fn clamp_zoom(zoom: f64) -> f64 {
    zoom.clamp(MIN_ZOOM, MAX_ZOOM)
}

/// Clips a document rectangle to `[0, page_w] x [0, page_h]` and applies the
/// minimum-size guard.
pub fn clamp_to_page(doc: DocRect, page_w: u32, page_h: u32) -> Result<DocRect> {
    if ![doc.x, doc.y, doc.w, doc.h].iter().all(|value| value.is_finite()) {
        return Err(PipelineError::SelectionOutOfBounds { page_w, page_h });
    }
    let (pw, ph) = (page_w as f64, page_h as f64);
    let x1 = doc.x.max(0.0);
    let y1 = doc.y.max(0.0);
    let x2 = doc.right().min(pw);
    let y2 = doc.bottom().min(ph);
    if x1 >= pw || y1 >= ph || x2 <= 0.0 || y2 <= 0.0 {
        return Err(PipelineError::SelectionOutOfBounds { page_w, page_h });
    }
    let (w, h) = (x2 - x1, y2 - y1);
    if !(w >= MIN_SELECTION && h >= MIN_SELECTION) {
        return Err(PipelineError::SelectionTooSmall {
            w: w.max(0.0),
            h: h.max(0.0),
            min: MIN_SELECTION,
        });
    }
    Ok(DocRect::new(x1, y1, w, h))
}

/// Zoom and scroll state of the displayed page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateSpace {
    zoom: f64,
    scroll_x: f64,
    scroll_y: f64,
}

impl Default for CoordinateSpace {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
        }
    }
}

impl CoordinateSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn scroll(&self) -> (f64, f64) {
        (self.scroll_x, self.scroll_y)
    }

    /// Sets the zoom, silently clamped. Returns true when it changed.
    pub fn set_zoom(&mut self, zoom: f64) -> bool {
        if !zoom.is_finite() {
            return false;
        }
        let next = clamp_zoom(zoom);
        let changed = (next - self.zoom).abs() > f64::EPSILON;
        self.zoom = next;
        changed
    }

    pub fn zoom_by(&mut self, delta: f64) -> bool {
        self.set_zoom(self.zoom + delta)
    }

    pub fn set_scroll(&mut self, x: f64, y: f64) {
        self.scroll_x = x.max(0.0);
        self.scroll_y = y.max(0.0);
    }

    pub fn to_document(&self, view: ViewRect) -> DocRect {
        to_document(view.translated(self.scroll_x, self.scroll_y), self.zoom)
    }

    pub fn to_view(&self, doc: DocRect) -> ViewRect {
        to_view(doc, self.zoom).translated(-self.scroll_x, -self.scroll_y)
    }

    /// Converts a view-space drag delta into a document-space delta.
    pub fn delta_to_document(&self, dx: f64, dy: f64) -> (f64, f64) {
        (dx / self.zoom, dy / self.zoom)
    }

    /// Maps a user gesture to a validated document rectangle on a page.
    pub fn selection(&self, view: ViewRect, page_w: u32, page_h: u32) -> Result<DocRect> {
        clamp_to_page(self.to_document(view), page_w, page_h)
    }
}
