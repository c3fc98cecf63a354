use std::collections::HashMap;
use std::path::Path;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::document::{Document, DocumentPage, Rasterizer};
use crate::error::{PipelineError, Result};
use crate::geometry::{CoordinateSpace, DocRect, ViewRect};
use crate::overlay::{Overlay, OverlayId, OverlayRegistry, OverlayState, Placement};
use crate::pipeline::{Completion, SelectionJob, Ticket};
use crate::preprocess::PreprocessConfig;

/// What applying a completion did to the session.
#[derive(Debug)]
pub enum Applied {
    Progress(OverlayId, OverlayState),
    Placed(OverlayId),
    /// The task failed; its overlay was removed and the page left alone.
    Aborted {
        overlay: OverlayId,
        error: PipelineError,
    },
    /// Stale result from before a navigation or close.
    Discarded(OverlayId),
}

/// State of one open document: its pages, the view transform, the overlays
/// and the preprocessing toggles. Owned by the interaction loop; background
/// tasks only talk to it through [`Completion`] messages.
#[derive(Debug, Default)]
pub struct DocumentSession {
    document: Option<Document>,
    page: usize,
    space: CoordinateSpace,
    overlays: OverlayRegistry,
    preprocess: PreprocessConfig,
    generation: u64,
    tasks: HashMap<OverlayId, AbortHandle>,
}

impl DocumentSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font_size(mut self, size: f32) -> Self {
        self.overlays = OverlayRegistry::new().with_font_size(size);
        self
    }

    pub fn with_preprocess(mut self, config: PreprocessConfig) -> Self {
        self.preprocess = config;
        self
    }

    pub fn open(&mut self, document: Document) {
        self.close();
        info!(
            "opened {} ({} pages)",
            document
                .path()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<memory>".to_string()),
            document.len()
        );
        self.document = Some(document);
        self.page = 0;
        self.space.set_scroll(0.0, 0.0);
    }

    pub fn open_path(&mut self, path: &Path, rasterizer: &dyn Rasterizer) -> Result<()> {
        let document = Document::open(path, rasterizer)?;
        self.open(document);
        Ok(())
    }

    /// Drops the document and every overlay. In-flight tasks are aborted and
    /// anything they still send is discarded.
    pub fn close(&mut self) -> Option<Document> {
        self.abandon_tasks();
        let cleared = self.overlays.clear();
        if cleared > 0 {
            debug!("discarded {} overlays", cleared);
        }
        self.page = 0;
        self.document.take()
    }

    pub fn document(&self) -> Result<&Document> {
        self.document.as_ref().ok_or(PipelineError::NoDocument)
    }

    pub fn page_index(&self) -> usize {
        self.page
    }

    pub fn page_count(&self) -> usize {
        self.document.as_ref().map(Document::len).unwrap_or(0)
    }

    pub fn current_page(&self) -> Result<&DocumentPage> {
        self.document()?.page(self.page)
    }

    /// Switches pages. Overlays of other pages are kept; pending selections
    /// are abandoned.
    pub fn show_page(&mut self, index: usize) -> Result<()> {
        self.document()?.page(index)?;
        if index != self.page {
            self.abandon_tasks();
            self.page = index;
            self.space.set_scroll(0.0, 0.0);
        }
        Ok(())
    }

    pub fn space(&self) -> &CoordinateSpace {
        &self.space
    }

    /// Sets the zoom, clamped to the supported range, and returns the value in
    /// effect. Anchors are not touched.
    pub fn set_zoom(&mut self, zoom: f64) -> f64 {
        self.space.set_zoom(zoom);
        self.space.zoom()
    }

    pub fn zoom_by(&mut self, delta: f64) -> f64 {
        self.space.zoom_by(delta);
        self.space.zoom()
    }

    pub fn set_scroll(&mut self, x: f64, y: f64) {
        self.space.set_scroll(x, y);
    }

    pub fn preprocess(&self) -> PreprocessConfig {
        self.preprocess
    }

    /// Affects selections started afterwards.
    pub fn set_preprocess(&mut self, config: PreprocessConfig) {
        self.preprocess = config;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn overlays(&self) -> &OverlayRegistry {
        &self.overlays
    }

    pub fn overlays_mut(&mut self) -> &mut OverlayRegistry {
        &mut self.overlays
    }

    /// Visible overlays of the current page in view coordinates.
    pub fn visible_overlays(&self) -> Vec<(OverlayId, ViewRect)> {
        self.overlays.view_rects(self.page, &self.space)
    }

    pub fn move_overlay(&mut self, id: OverlayId, dx: f64, dy: f64) -> Result<DocRect> {
        self.overlays.move_by(id, dx, dy, &self.space)
    }

    pub fn resize_overlay(&mut self, id: OverlayId, w: f64, h: f64) -> Result<DocRect> {
        self.overlays.resize(id, w, h, &self.space)
    }

    /// Removes an overlay. A placed one gets its original pixels back, except
    /// where another overlay on the page still hides the scan; an unfinished
    /// one has its task aborted.
    pub fn delete_overlay(&mut self, id: OverlayId) -> Result<Overlay> {
        let overlay = self.overlays.destroy(id)?;
        if let Some(handle) = self.tasks.remove(&id) {
            handle.abort();
        }
        if let Some(area) = overlay.inpainted()
            && let Some(document) = self.document.as_mut()
            && let Ok(page) = document.page_mut(overlay.page())
        {
            let (page_w, page_h) = page.dimensions();
            let restored = area.pixel_bounds(page_w, page_h);
            page.restore(restored);
            for other in self.overlays.on_page(overlay.page()) {
                if let (Some(area), Some(color)) = (other.inpainted(), other.background())
                    && let Some(shared) = restored.intersect(&area.pixel_bounds(page_w, page_h))
                {
                    page.fill(shared, color);
                }
            }
        }
        Ok(overlay)
    }

    /// Validates a view-space selection on the current page and registers a
    /// pending overlay for it.
    pub fn begin_selection(&mut self, view: ViewRect) -> Result<SelectionJob> {
        let page = self.current_page()?;
        let (page_w, page_h) = page.dimensions();
        let anchor = self.space.selection(view, page_w, page_h)?;
        let crop = page.crop(anchor.pixel_bounds(page_w, page_h));
        let overlay = self.overlays.create(self.page, anchor);
        Ok(SelectionJob {
            ticket: Ticket {
                overlay,
                page: self.page,
                generation: self.generation,
            },
            crop,
            preprocess: self.preprocess,
        })
    }

    /// Remembers a running task so navigation can abort it.
    pub fn track(&mut self, overlay: OverlayId, handle: AbortHandle) {
        if let Some(previous) = self.tasks.insert(overlay, handle) {
            warn!("overlay {} already had a task; aborting the older one", overlay);
            previous.abort();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn apply_completion(&mut self, completion: Completion) -> Applied {
        let ticket = completion.ticket();
        let id = ticket.overlay;
        if ticket.generation != self.generation || self.overlays.get(id).is_err() {
            debug!("discarding stale completion for {}", id);
            return Applied::Discarded(id);
        }

        match completion {
            Completion::Stage { state, .. } => {
                let result = match state {
                    OverlayState::Extracting => self.overlays.begin_extraction(id),
                    OverlayState::Translating => self.overlays.begin_translation(id),
                    other => Err(PipelineError::InvalidTransition {
                        id,
                        from: self
                            .overlays
                            .get(id)
                            .map(Overlay::state)
                            .unwrap_or(OverlayState::Pending),
                        to: other,
                    }),
                };
                if let Err(err) = result {
                    warn!("ignoring progress for {}: {}", id, err);
                }
                Applied::Progress(id, state)
            }
            Completion::Finished { result, .. } => {
                self.tasks.remove(&id);
                match result {
                    Ok(output) => {
                        let placement = Placement {
                            text: output.translation.text().to_string(),
                            provider: output.translation.provider().map(str::to_string),
                            source_text: Some(output.recognition.text),
                            background: output.background,
                        };
                        match self.place(ticket, placement) {
                            Ok(()) => Applied::Placed(id),
                            Err(error) => self.abort_overlay(id, error),
                        }
                    }
                    Err(error) => self.abort_overlay(id, error),
                }
            }
        }
    }

    fn place(&mut self, ticket: Ticket, placement: Placement) -> Result<()> {
        let id = ticket.overlay;
        if self.overlays.get(id)?.state() == OverlayState::Extracting {
            self.overlays.begin_translation(id)?;
        }
        let document = self.document.as_mut().ok_or(PipelineError::NoDocument)?;
        let page = document.page_mut(ticket.page)?;
        self.overlays.place(id, placement, page)
    }

    fn abort_overlay(&mut self, id: OverlayId, error: PipelineError) -> Applied {
        warn!("selection {} abandoned: {}", id, error);
        let _ = self.overlays.destroy(id);
        Applied::Aborted { overlay: id, error }
    }

    fn abandon_tasks(&mut self) {
        self.generation += 1;
        for (id, handle) in self.tasks.drain() {
            debug!("aborting task for {}", id);
            handle.abort();
        }
        let dropped = self.overlays.destroy_in_flight();
        if !dropped.is_empty() {
            debug!("dropped {} unfinished overlays", dropped.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TaskOutput;
    use crate::ocr::{RecognitionResult, SegmentationMode};
    use crate::translate::TranslationOutcome;
    use image::{Rgba, RgbaImage};

    fn session_with_pages(count: usize) -> DocumentSession {
        let pages = (0..count)
            .map(|_| RgbaImage::from_pixel(100, 80, Rgba([0, 0, 0, 255])))
            .collect();
        let mut session = DocumentSession::new();
        session.open(Document::from_rasters(pages));
        session
    }

    fn finished(ticket: Ticket, text: &str) -> Completion {
        Completion::Finished {
            ticket,
            result: Ok(TaskOutput {
                recognition: RecognitionResult {
                    text: "こんにちは".to_string(),
                    raw: "こんにちは\n".to_string(),
                    mode: SegmentationMode::SINGLE_BLOCK,
                    attempted: vec![SegmentationMode::SINGLE_BLOCK],
                },
                translation: TranslationOutcome::Translated {
                    text: text.to_string(),
                    provider: "stub".to_string(),
                },
                background: Rgba([255, 255, 255, 255]),
            }),
        }
    }

    #[test]
    fn selection_requires_a_document() {
        let mut session = DocumentSession::new();
        assert!(matches!(
            session.begin_selection(ViewRect::new(0.0, 0.0, 10.0, 10.0)),
            Err(PipelineError::NoDocument)
        ));
    }

    #[test]
    fn tiny_selection_is_rejected_without_an_overlay() {
        let mut session = session_with_pages(1);
        assert!(matches!(
            session.begin_selection(ViewRect::new(5.0, 5.0, 0.5, 0.5)),
            Err(PipelineError::SelectionTooSmall { .. })
        ));
        assert!(session.overlays().is_empty());
    }

    #[test]
    fn zoomed_selection_crops_document_pixels() {
        let mut session = session_with_pages(1);
        session.set_zoom(2.0);
        let job = session
            .begin_selection(ViewRect::new(20.0, 20.0, 40.0, 20.0))
            .expect("job");
        assert_eq!(job.crop.dimensions(), (20, 10));
        let anchor = session.overlays().get(job.ticket.overlay).unwrap().anchor();
        assert!(anchor.approx_eq(&DocRect::new(10.0, 10.0, 20.0, 10.0), 1e-12));
    }

    #[test]
    fn completion_places_overlay_and_inpaints() {
        let mut session = session_with_pages(1);
        let job = session
            .begin_selection(ViewRect::new(10.0, 10.0, 20.0, 10.0))
            .expect("job");
        let ticket = job.ticket;
        for state in [OverlayState::Extracting, OverlayState::Translating] {
            session.apply_completion(Completion::Stage { ticket, state });
        }
        assert!(matches!(
            session.apply_completion(finished(ticket, "Hola")),
            Applied::Placed(_)
        ));
        let overlay = session.overlays().get(ticket.overlay).unwrap();
        assert_eq!(overlay.text(), "Hola");
        assert_eq!(overlay.provider(), Some("stub"));
        let page = session.current_page().unwrap();
        assert_eq!(*page.current().get_pixel(15, 15), Rgba([255, 255, 255, 255]));
        assert_eq!(*page.current().get_pixel(5, 5), Rgba([0, 0, 0, 255]));
        assert_eq!(session.visible_overlays().len(), 1);
    }

    #[test]
    fn overlays_persist_across_pages_until_close() {
        let mut session = session_with_pages(2);
        let job = session
            .begin_selection(ViewRect::new(10.0, 10.0, 20.0, 10.0))
            .expect("job");
        let ticket = job.ticket;
        session.apply_completion(Completion::Stage {
            ticket,
            state: OverlayState::Extracting,
        });
        session.apply_completion(finished(ticket, "Hola"));

        session.show_page(1).expect("page 1");
        assert!(session.visible_overlays().is_empty());
        session.show_page(0).expect("page 0");
        assert_eq!(session.visible_overlays().len(), 1);

        assert!(matches!(
            session.show_page(5),
            Err(PipelineError::PageOutOfRange { page: 5, total: 2 })
        ));
        session.close();
        assert!(session.overlays().is_empty());
        assert_eq!(session.page_count(), 0);
    }

    #[test]
    fn navigation_discards_pending_work() {
        let mut session = session_with_pages(2);
        let job = session
            .begin_selection(ViewRect::new(10.0, 10.0, 20.0, 10.0))
            .expect("job");
        let generation = session.generation();
        session.show_page(1).expect("navigate");
        assert!(session.generation() > generation);
        assert!(session.overlays().is_empty());
        assert!(matches!(
            session.apply_completion(finished(job.ticket, "Hola")),
            Applied::Discarded(_)
        ));
        let page = session.document().unwrap().page(0).unwrap();
        assert_eq!(page.current(), page.original());
    }

    #[test]
    fn failed_task_removes_overlay() {
        let mut session = session_with_pages(1);
        let job = session
            .begin_selection(ViewRect::new(10.0, 10.0, 20.0, 10.0))
            .expect("job");
        let applied = session.apply_completion(Completion::Finished {
            ticket: job.ticket,
            result: Err(PipelineError::NoTextDetected),
        });
        assert!(matches!(
            applied,
            Applied::Aborted {
                error: PipelineError::NoTextDetected,
                ..
            }
        ));
        assert!(session.overlays().is_empty());
    }

    #[test]
    fn deleting_placed_overlay_restores_pixels() {
        let mut session = session_with_pages(1);
        let job = session
            .begin_selection(ViewRect::new(10.0, 10.0, 20.0, 10.0))
            .expect("job");
        let ticket = job.ticket;
        session.apply_completion(Completion::Stage {
            ticket,
            state: OverlayState::Extracting,
        });
        session.apply_completion(finished(ticket, "Hola"));

        let removed = session.delete_overlay(ticket.overlay).expect("delete");
        assert_eq!(removed.state(), OverlayState::Destroyed);
        let page = session.current_page().unwrap();
        assert_eq!(page.current(), page.original());
    }

    #[test]
    fn deleting_after_a_drag_restores_the_filled_area() {
        let mut session = session_with_pages(1);
        let job = session
            .begin_selection(ViewRect::new(10.0, 10.0, 20.0, 10.0))
            .expect("job");
        let ticket = job.ticket;
        session.apply_completion(Completion::Stage {
            ticket,
            state: OverlayState::Extracting,
        });
        session.apply_completion(finished(ticket, "Hola"));
        session.move_overlay(ticket.overlay, 40.0, 30.0).expect("move");

        session.delete_overlay(ticket.overlay).expect("delete");
        let page = session.current_page().unwrap();
        assert_eq!(page.current(), page.original());
    }

    fn place_at(session: &mut DocumentSession, view: ViewRect, text: &str) -> OverlayId {
        let job = session.begin_selection(view).expect("job");
        let ticket = job.ticket;
        session.apply_completion(Completion::Stage {
            ticket,
            state: OverlayState::Extracting,
        });
        assert!(matches!(
            session.apply_completion(finished(ticket, text)),
            Applied::Placed(_)
        ));
        ticket.overlay
    }

    #[test]
    fn deleting_keeps_neighbouring_overlay_erased() {
        let mut session = session_with_pages(1);
        let first = place_at(&mut session, ViewRect::new(10.0, 10.0, 20.0, 10.0), "Hola");
        let second = place_at(&mut session, ViewRect::new(20.0, 10.0, 20.0, 10.0), "Adiós");

        session.delete_overlay(first).expect("delete");
        assert_eq!(
            session.overlays().get(second).unwrap().state(),
            OverlayState::Placed
        );
        let page = session.current_page().unwrap();
        assert_eq!(*page.current().get_pixel(25, 15), Rgba([255, 255, 255, 255]));
        assert_eq!(*page.current().get_pixel(35, 15), Rgba([255, 255, 255, 255]));
        assert_eq!(*page.current().get_pixel(12, 15), Rgba([0, 0, 0, 255]));

        session.delete_overlay(second).expect("delete");
        let page = session.current_page().unwrap();
        assert_eq!(page.current(), page.original());
    }

    #[test]
    fn zoom_is_clamped() {
        let mut session = session_with_pages(1);
        assert_eq!(session.set_zoom(10.0), 3.0);
        assert_eq!(session.set_zoom(0.01), 0.2);
        let zoom = session.zoom_by(0.1);
        assert!((zoom - 0.3).abs() < 1e-12);
    }
}
