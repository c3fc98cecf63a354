use image::Rgba;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::document::DocumentPage;
use crate::error::{PipelineError, Result};
use crate::geometry::{CoordinateSpace, DocRect, MIN_SELECTION, ViewRect};
use crate::ocr::is_cjk;

pub const DEFAULT_FONT_SIZE: f32 = 18.0;
pub const MIN_FONT_SIZE: f32 = 6.0;
pub const MAX_FONT_SIZE: f32 = 72.0;

/// Advance of one glyph, in ems.
const CJK_ADVANCE: f64 = 1.0;
const LATIN_ADVANCE: f64 = 0.55;
const LINE_HEIGHT: f64 = 1.2;
/// Vertical padding around the text block, in ems.
const PADDING: f64 = 0.4;

pub fn clamp_font_size(size: f32) -> f32 {
    if size.is_finite() {
        size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
    } else {
        DEFAULT_FONT_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OverlayId(u64);

impl OverlayId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for OverlayId {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = value.trim();
        trimmed
            .strip_prefix('#')
            .unwrap_or(trimmed)
            .parse::<u64>()
            .map(OverlayId)
            .map_err(|_| format!("invalid overlay id '{}'", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayState {
    Pending,
    Extracting,
    Translating,
    Placed,
    Editable,
    Destroyed,
}

impl OverlayState {
    pub fn can_transition(self, to: OverlayState) -> bool {
        use OverlayState::*;
        matches!(
            (self, to),
            (Pending, Extracting)
                | (Extracting, Translating)
                | (Translating, Placed)
                | (Placed, Editable)
                | (Editable, Placed)
                | (Pending | Extracting | Translating | Placed | Editable, Destroyed)
        )
    }

    /// True once the overlay's text sits on the page.
    pub fn is_visible(self) -> bool {
        matches!(self, OverlayState::Placed | OverlayState::Editable)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            OverlayState::Pending | OverlayState::Extracting | OverlayState::Translating
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlay {
    id: OverlayId,
    page: usize,
    anchor: DocRect,
    text: String,
    state: OverlayState,
    font_size: f32,
    #[serde(serialize_with = "serialize_color")]
    background: Option<Rgba<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    /// Area filled at placement. Stays put when the overlay is dragged.
    #[serde(skip)]
    inpainted: Option<DocRect>,
}

impl Overlay {
    pub fn id(&self) -> OverlayId {
        self.id
    }

    pub fn page(&self) -> usize {
        self.page
    }

    /// Document-space rectangle. Never changed by zooming.
    pub fn anchor(&self) -> DocRect {
        self.anchor
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn state(&self) -> OverlayState {
        self.state
    }

    pub fn font_size(&self) -> f32 {
        self.font_size
    }

    pub fn background(&self) -> Option<Rgba<u8>> {
        self.background
    }

    pub fn source_text(&self) -> Option<&str> {
        self.source_text.as_deref()
    }

    /// Provider that produced the text, if any.
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn inpainted(&self) -> Option<DocRect> {
        self.inpainted
    }

    pub fn view_rect(&self, space: &CoordinateSpace) -> ViewRect {
        space.to_view(self.anchor)
    }
}

fn serialize_color<S: Serializer>(color: &Option<Rgba<u8>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match color {
        Some(Rgba([r, g, b, a])) if *a == 255 => {
            serializer.serialize_str(&format!("#{:02x}{:02x}{:02x}", r, g, b))
        }
        Some(Rgba([r, g, b, a])) => {
            serializer.serialize_str(&format!("#{:02x}{:02x}{:02x}{:02x}", r, g, b, a))
        }
        None => serializer.serialize_none(),
    }
}

/// Content needed to place a translated overlay.
#[derive(Debug, Clone)]
pub struct Placement {
    pub text: String,
    pub source_text: Option<String>,
    pub provider: Option<String>,
    pub background: Rgba<u8>,
}

/// Live overlays of a document, keyed by id and tagged with their page.
#[derive(Debug)]
pub struct OverlayRegistry {
    next_id: u64,
    overlays: BTreeMap<OverlayId, Overlay>,
    font_size: f32,
}

impl Default for OverlayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            overlays: BTreeMap::new(),
            font_size: DEFAULT_FONT_SIZE,
        }
    }

    pub fn with_font_size(mut self, size: f32) -> Self {
        self.font_size = clamp_font_size(size);
        self
    }

    /// Font size given to new overlays.
    pub fn font_size(&self) -> f32 {
        self.font_size
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn get(&self, id: OverlayId) -> Result<&Overlay> {
        self.overlays.get(&id).ok_or(PipelineError::UnknownOverlay(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Overlay> {
        self.overlays.values()
    }

    pub fn on_page(&self, page: usize) -> impl Iterator<Item = &Overlay> {
        self.overlays.values().filter(move |overlay| overlay.page == page)
    }

    /// Registers a new overlay in `Pending` for a validated selection.
    pub fn create(&mut self, page: usize, anchor: DocRect) -> OverlayId {
        let id = OverlayId(self.next_id);
        self.next_id += 1;
        self.overlays.insert(
            id,
            Overlay {
                id,
                page,
                anchor,
                text: String::new(),
                state: OverlayState::Pending,
                font_size: self.font_size,
                background: None,
                source_text: None,
                provider: None,
                inpainted: None,
            },
        );
        debug!("overlay {} created on page {} at {:?}", id, page, anchor);
        id
    }

    pub fn begin_extraction(&mut self, id: OverlayId) -> Result<()> {
        self.transition(id, OverlayState::Extracting)
    }

    pub fn begin_translation(&mut self, id: OverlayId) -> Result<()> {
        self.transition(id, OverlayState::Translating)
    }

    pub fn focus(&mut self, id: OverlayId) -> Result<()> {
        self.transition(id, OverlayState::Editable)
    }

    pub fn blur(&mut self, id: OverlayId) -> Result<()> {
        self.transition(id, OverlayState::Placed)
    }

    /// Inpaints the anchor area of `page` with the sampled background and then
    /// shows the text. The only way into `Placed` from `Translating`.
    pub fn place(&mut self, id: OverlayId, placement: Placement, page: &mut DocumentPage) -> Result<()> {
        let overlay = self.get_mut(id)?;
        if overlay.state != OverlayState::Translating {
            return Err(PipelineError::InvalidTransition {
                id,
                from: overlay.state,
                to: OverlayState::Placed,
            });
        }
        let (page_w, page_h) = page.dimensions();
        page.fill(overlay.anchor.pixel_bounds(page_w, page_h), placement.background);
        overlay.background = Some(placement.background);
        overlay.inpainted = Some(overlay.anchor);
        overlay.text = placement.text;
        overlay.source_text = placement.source_text;
        overlay.provider = placement.provider;
        overlay.state = OverlayState::Placed;
        debug!("overlay {} placed", id);
        Ok(())
    }

    /// Replaces the display text. Needs focus.
    pub fn set_text(&mut self, id: OverlayId, text: impl Into<String>) -> Result<()> {
        let overlay = self.get_mut(id)?;
        if overlay.state != OverlayState::Editable {
            return Err(PipelineError::OverlayNotEditable {
                id,
                state: overlay.state,
            });
        }
        overlay.text = text.into();
        Ok(())
    }

    /// Drags a placed overlay by a view-space delta.
    pub fn move_by(&mut self, id: OverlayId, dx: f64, dy: f64, space: &CoordinateSpace) -> Result<DocRect> {
        let overlay = self.visible_mut(id)?;
        let (dx, dy) = space.delta_to_document(dx, dy);
        overlay.anchor = overlay.anchor.translated(dx, dy);
        Ok(overlay.anchor)
    }

    /// Sets the view-space size of a placed overlay, keeping its origin.
    pub fn resize(&mut self, id: OverlayId, w: f64, h: f64, space: &CoordinateSpace) -> Result<DocRect> {
        let (w, h) = space.delta_to_document(w, h);
        if !(w >= MIN_SELECTION && h >= MIN_SELECTION) {
            return Err(PipelineError::SelectionTooSmall {
                w,
                h,
                min: MIN_SELECTION,
            });
        }
        let overlay = self.visible_mut(id)?;
        overlay.anchor = DocRect::new(overlay.anchor.x, overlay.anchor.y, w, h);
        Ok(overlay.anchor)
    }

    /// Grows or shrinks the anchor height so the wrapped text fits its width.
    pub fn resize_to_fit(&mut self, id: OverlayId) -> Result<DocRect> {
        let overlay = self.visible_mut(id)?;
        let height = fit_height(&overlay.text, overlay.anchor.w, overlay.font_size as f64).max(MIN_SELECTION);
        overlay.anchor = DocRect::new(overlay.anchor.x, overlay.anchor.y, overlay.anchor.w, height);
        Ok(overlay.anchor)
    }

    pub fn set_font_size(&mut self, id: OverlayId, size: f32) -> Result<f32> {
        let overlay = self.get_mut(id)?;
        overlay.font_size = clamp_font_size(size);
        Ok(overlay.font_size)
    }

    /// Applies one size to every overlay and to those created later.
    pub fn set_font_size_all(&mut self, size: f32) -> f32 {
        let size = clamp_font_size(size);
        self.font_size = size;
        for overlay in self.overlays.values_mut() {
            overlay.font_size = size;
        }
        size
    }

    /// View rectangles of a page's visible overlays at the current zoom.
    pub fn view_rects(&self, page: usize, space: &CoordinateSpace) -> Vec<(OverlayId, ViewRect)> {
        self.on_page(page)
            .filter(|overlay| overlay.state.is_visible())
            .map(|overlay| (overlay.id, overlay.view_rect(space)))
            .collect()
    }

    /// Removes an overlay, returning it in the `Destroyed` state.
    pub fn destroy(&mut self, id: OverlayId) -> Result<Overlay> {
        let mut overlay = self
            .overlays
            .remove(&id)
            .ok_or(PipelineError::UnknownOverlay(id))?;
        overlay.state = OverlayState::Destroyed;
        debug!("overlay {} destroyed", id);
        Ok(overlay)
    }

    /// Drops every overlay still waiting on recognition or translation.
    pub fn destroy_in_flight(&mut self) -> Vec<OverlayId> {
        let ids = self
            .overlays
            .values()
            .filter(|overlay| overlay.state.is_in_flight())
            .map(|overlay| overlay.id)
            .collect::<Vec<_>>();
        for id in &ids {
            self.overlays.remove(id);
        }
        ids
    }

    pub fn clear(&mut self) -> usize {
        let count = self.overlays.len();
        self.overlays.clear();
        count
    }

    fn get_mut(&mut self, id: OverlayId) -> Result<&mut Overlay> {
        self.overlays
            .get_mut(&id)
            .ok_or(PipelineError::UnknownOverlay(id))
    }

    fn visible_mut(&mut self, id: OverlayId) -> Result<&mut Overlay> {
        let overlay = self.get_mut(id)?;
        if !overlay.state.is_visible() {
            return Err(PipelineError::OverlayNotEditable {
                id,
                state: overlay.state,
            });
        }
        Ok(overlay)
    }

    fn transition(&mut self, id: OverlayId, to: OverlayState) -> Result<()> {
        let overlay = self.get_mut(id)?;
        // Placement and destruction have their own entry points.
        let reserved = to == OverlayState::Destroyed
            || (to == OverlayState::Placed && overlay.state != OverlayState::Editable);
        if reserved || !overlay.state.can_transition(to) {
            return Err(PipelineError::InvalidTransition {
                id,
                from: overlay.state,
                to,
            });
        }
        overlay.state = to;
        Ok(())
    }
}

/// Height needed to show `text` wrapped to `width` at `font_size`.
pub fn fit_height(text: &str, width: f64, font_size: f64) -> f64 {
    let capacity = (width / font_size).max(LATIN_ADVANCE);
    let lines = text
        .split('\n')
        .map(|paragraph| line_count(paragraph, capacity))
        .sum::<usize>()
        .max(1);
    (lines as f64 * LINE_HEIGHT + PADDING) * font_size
}

/// Splits a paragraph into unbreakable pieces: whole words, or single CJK
/// glyphs. Each piece carries its advance and whether a space precedes it.
fn pieces(paragraph: &str) -> Vec<(f64, bool)> {
    let mut out = Vec::new();
    let mut word = 0.0;
    let mut word_spaced = false;
    let mut pending_space = false;
    for ch in paragraph.chars() {
        if ch.is_whitespace() {
            if word > 0.0 {
                out.push((word, word_spaced));
                word = 0.0;
            }
            pending_space = true;
        } else if is_cjk(ch) {
            if word > 0.0 {
                out.push((word, word_spaced));
                word = 0.0;
            }
            out.push((CJK_ADVANCE, pending_space));
            pending_space = false;
        } else {
            if word == 0.0 {
                word_spaced = pending_space;
                pending_space = false;
            }
            word += LATIN_ADVANCE;
        }
    }
    if word > 0.0 {
        out.push((word, word_spaced));
    }
    out
}

fn line_count(paragraph: &str, capacity: f64) -> usize {
    let mut lines = 1usize;
    let mut used = 0.0f64;
    for (advance, spaced) in pieces(paragraph) {
        let mut gap = if spaced && used > 0.0 { LATIN_ADVANCE } else { 0.0 };
        if used > 0.0 && used + gap + advance > capacity + f64::EPSILON {
            lines += 1;
            used = 0.0;
            gap = 0.0;
        }
        if advance > capacity {
            let extra = (advance / capacity).ceil() as usize - 1;
            lines += extra;
            used = advance - extra as f64 * capacity;
        } else {
            used += gap + advance;
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use insta::assert_json_snapshot;

    fn placement(text: &str) -> Placement {
        Placement {
            text: text.to_string(),
            source_text: Some("こんにちは".to_string()),
            provider: Some("google".to_string()),
            background: Rgba([250, 248, 240, 255]),
        }
    }

    fn placed(registry: &mut OverlayRegistry, page: &mut DocumentPage, anchor: DocRect) -> OverlayId {
        let id = registry.create(0, anchor);
        registry.begin_extraction(id).expect("extracting");
        registry.begin_translation(id).expect("translating");
        registry.place(id, placement("Hola"), page).expect("placed");
        id
    }

    fn page() -> DocumentPage {
        DocumentPage::new(RgbaImage::from_pixel(300, 200, Rgba([0, 0, 0, 255])))
    }

    #[test]
    fn zoom_changes_view_but_not_anchor() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let anchor = DocRect::new(10.0, 10.0, 100.0, 40.0);
        let id = placed(&mut registry, &mut page, anchor);

        let mut space = CoordinateSpace::new();
        space.set_zoom(2.0);
        let rects = registry.view_rects(0, &space);
        assert_eq!(rects.len(), 1);
        assert!(rects[0].1.approx_eq(&ViewRect::new(20.0, 20.0, 200.0, 80.0), 1e-12));
        assert_eq!(registry.get(id).unwrap().anchor(), anchor);
    }

    #[test]
    fn placement_inpaints_before_showing_text() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let id = placed(&mut registry, &mut page, DocRect::new(10.0, 20.0, 30.0, 15.0));

        let overlay = registry.get(id).unwrap();
        assert_eq!(overlay.state(), OverlayState::Placed);
        assert_eq!(overlay.text(), "Hola");
        assert_eq!(*page.current().get_pixel(10, 20), Rgba([250, 248, 240, 255]));
        assert_eq!(*page.current().get_pixel(39, 34), Rgba([250, 248, 240, 255]));
        assert_eq!(*page.current().get_pixel(40, 35), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let id = registry.create(0, DocRect::new(0.0, 0.0, 10.0, 10.0));

        assert!(matches!(
            registry.begin_translation(id),
            Err(PipelineError::InvalidTransition {
                from: OverlayState::Pending,
                to: OverlayState::Translating,
                ..
            })
        ));
        assert!(registry.place(id, placement("x"), &mut page).is_err());
        assert!(registry.focus(id).is_err());

        registry.begin_extraction(id).expect("extracting");
        registry.begin_translation(id).expect("translating");
        assert!(registry.blur(id).is_err());
        assert_eq!(registry.get(id).unwrap().state(), OverlayState::Translating);
        assert_eq!(*page.current().get_pixel(0, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn focus_and_blur_toggle_editing() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let id = placed(&mut registry, &mut page, DocRect::new(0.0, 0.0, 50.0, 20.0));

        assert!(registry.set_text(id, "Adiós").is_err());
        registry.focus(id).expect("focus");
        registry.set_text(id, "Adiós").expect("edit");
        registry.blur(id).expect("blur");
        assert!(registry.blur(id).is_err());
        assert_eq!(registry.get(id).unwrap().text(), "Adiós");
    }

    #[test]
    fn drag_uses_document_deltas() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let id = placed(&mut registry, &mut page, DocRect::new(10.0, 10.0, 100.0, 40.0));
        let mut space = CoordinateSpace::new();
        space.set_zoom(2.0);

        let anchor = registry.move_by(id, 20.0, -10.0, &space).expect("move");
        assert!(anchor.approx_eq(&DocRect::new(20.0, 5.0, 100.0, 40.0), 1e-12));
        let anchor = registry.resize(id, 50.0, 30.0, &space).expect("resize");
        assert!(anchor.approx_eq(&DocRect::new(20.0, 5.0, 25.0, 15.0), 1e-12));
        assert!(matches!(
            registry.resize(id, 1.0, 30.0, &space),
            Err(PipelineError::SelectionTooSmall { .. })
        ));
    }

    #[test]
    fn pending_overlays_cannot_be_dragged() {
        let mut registry = OverlayRegistry::new();
        let id = registry.create(0, DocRect::new(0.0, 0.0, 10.0, 10.0));
        assert!(matches!(
            registry.move_by(id, 1.0, 1.0, &CoordinateSpace::new()),
            Err(PipelineError::OverlayNotEditable { .. })
        ));
    }

    #[test]
    fn font_sizes_are_clamped() {
        let mut registry = OverlayRegistry::new();
        let a = registry.create(0, DocRect::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(registry.get(a).unwrap().font_size(), DEFAULT_FONT_SIZE);
        assert_eq!(registry.set_font_size(a, 2.0).unwrap(), MIN_FONT_SIZE);
        assert_eq!(registry.set_font_size_all(100.0), MAX_FONT_SIZE);
        let b = registry.create(1, DocRect::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(registry.get(a).unwrap().font_size(), MAX_FONT_SIZE);
        assert_eq!(registry.get(b).unwrap().font_size(), MAX_FONT_SIZE);
        assert_eq!(clamp_font_size(f32::NAN), DEFAULT_FONT_SIZE);
    }

    #[test]
    fn fit_height_counts_wrapped_lines() {
        let one_line = fit_height("Hola", 200.0, 18.0);
        assert!((one_line - 28.8).abs() < 1e-9, "{}", one_line);
        // 7 glyphs at 4 per line.
        let cjk = fit_height("こんにちは世界", 72.0, 18.0);
        assert!((cjk - 50.4).abs() < 1e-9, "{}", cjk);
        let paragraphs = fit_height("a\nb\n\nc", 200.0, 10.0);
        assert!((paragraphs - 52.0).abs() < 1e-9, "{}", paragraphs);
        assert_eq!(line_count("aaaa bbbb", 5.0), 1);
        assert_eq!(line_count("aaaa bbbb", 4.0), 2);
        assert_eq!(line_count(&"a".repeat(21), 5.5), 3);
    }

    #[test]
    fn resize_to_fit_keeps_width() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let id = placed(&mut registry, &mut page, DocRect::new(5.0, 5.0, 200.0, 100.0));
        let anchor = registry.resize_to_fit(id).expect("fit");
        assert_eq!(anchor.w, 200.0);
        assert!((anchor.h - 28.8).abs() < 1e-9);
    }

    #[test]
    fn destroy_and_in_flight_cleanup() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let done = placed(&mut registry, &mut page, DocRect::new(0.0, 0.0, 10.0, 10.0));
        let waiting = registry.create(0, DocRect::new(20.0, 0.0, 10.0, 10.0));
        registry.begin_extraction(waiting).expect("extracting");

        assert_eq!(registry.destroy_in_flight(), vec![waiting]);
        assert_eq!(registry.len(), 1);
        let removed = registry.destroy(done).expect("destroy");
        assert_eq!(removed.state(), OverlayState::Destroyed);
        assert!(matches!(
            registry.destroy(done),
            Err(PipelineError::UnknownOverlay(_))
        ));
    }

    #[test]
    fn ids_parse_with_or_without_hash() {
        assert_eq!("#4".parse::<OverlayId>(), Ok(OverlayId::new(4)));
        assert_eq!(" 12 ".parse::<OverlayId>(), Ok(OverlayId::new(12)));
        assert!("x".parse::<OverlayId>().is_err());
    }

    #[test]
    fn overlay_json_snapshot() {
        let mut registry = OverlayRegistry::new();
        let mut page = page();
        let id = placed(&mut registry, &mut page, DocRect::new(10.0, 10.0, 100.0, 40.0));
        assert_json_snapshot!(registry.get(id).unwrap(), @r###"
        {
          "id": 1,
          "page": 0,
          "anchor": {
            "x": 10.0,
            "y": 10.0,
            "w": 100.0,
            "h": 40.0
          },
          "text": "Hola",
          "state": "placed",
          "font_size": 18.0,
          "background": "#faf8f0",
          "source_text": "こんにちは",
          "provider": "google"
        }
        "###);
    }
}
