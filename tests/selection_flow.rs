use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{DynamicImage, Rgba, RgbaImage};
use tokio::sync::mpsc::unbounded_channel;

use overlay_translator::error::EngineError;
use overlay_translator::providers::ProviderFuture;
use overlay_translator::{
    Applied, Document, DocumentSession, OverlayState, PipelineError, ProviderError, ProviderPolicy,
    RecognitionCascade, RecognitionEngine, SegmentationMode, SelectionPipeline, TranslationChain,
    TranslationProvider, TranslationRequest, ViewRect,
};

/// Answers in single-block mode only.
struct BlockOnlyEngine {
    calls: AtomicUsize,
}

impl RecognitionEngine for BlockOnlyEngine {
    fn recognize(
        &self,
        _raster: &DynamicImage,
        language: &str,
        mode: SegmentationMode,
    ) -> Result<String, EngineError> {
        assert_eq!(language, "jpn");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if mode == SegmentationMode::SINGLE_BLOCK {
            Ok("こんにち は\n".to_string())
        } else {
            Ok(String::new())
        }
    }
}

struct Down;

impl TranslationProvider for Down {
    fn name(&self) -> &str {
        "primary"
    }

    fn translate<'a>(&'a self, _request: &'a TranslationRequest) -> ProviderFuture<'a> {
        Box::pin(async {
            Err(ProviderError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        })
    }
}

struct Fixed(&'static str);

impl TranslationProvider for Fixed {
    fn name(&self) -> &str {
        "secondary"
    }

    fn translate<'a>(&'a self, request: &'a TranslationRequest) -> ProviderFuture<'a> {
        Box::pin(async move {
            assert_eq!(request.target_lang, "es");
            Ok(self.0.to_string())
        })
    }
}

fn scanned_page() -> RgbaImage {
    let mut page = RgbaImage::from_pixel(300, 200, Rgba([250, 250, 245, 255]));
    for y in 40..52 {
        for x in 40..120 {
            page.put_pixel(x, y, Rgba([10, 10, 10, 255]));
        }
    }
    page
}

fn pipeline() -> SelectionPipeline {
    let engine = BlockOnlyEngine {
        calls: AtomicUsize::new(0),
    };
    let chain = TranslationChain::new()
        .push(Down, ProviderPolicy::new(Duration::from_secs(2)))
        .push(Fixed("Hola"), ProviderPolicy::new(Duration::from_secs(2)));
    SelectionPipeline::new(
        RecognitionCascade::new(Arc::new(engine), "jpn"),
        chain,
        "ja",
        "es",
    )
}

#[tokio::test]
async fn zoomed_selection_becomes_translated_overlay() {
    let mut session = DocumentSession::new();
    session.open(Document::from_rasters(vec![scanned_page()]));
    session.set_zoom(2.0);

    let pipeline = pipeline();
    let id = pipeline
        .translate_selection(&mut session, ViewRect::new(60.0, 60.0, 200.0, 60.0))
        .await
        .expect("overlay");

    let overlay = session.overlays().get(id).expect("overlay");
    assert_eq!(overlay.state(), OverlayState::Placed);
    assert_eq!(overlay.text(), "Hola");
    assert_eq!(overlay.provider(), Some("secondary"));
    assert_eq!(overlay.source_text(), Some("こんにちは"));
    assert!(
        overlay
            .anchor()
            .approx_eq(&overlay_translator::DocRect::new(30.0, 30.0, 100.0, 30.0), 1e-9)
    );
    assert!(
        overlay
            .view_rect(session.space())
            .approx_eq(&ViewRect::new(60.0, 60.0, 200.0, 60.0), 1e-9)
    );

    let background = overlay.background().expect("background");
    let page = session.current_page().expect("page");
    for y in 30..60 {
        for x in 30..130 {
            assert_eq!(*page.current().get_pixel(x, y), background);
        }
    }
    assert_eq!(*page.current().get_pixel(10, 10), Rgba([250, 250, 245, 255]));
    assert_eq!(*page.current().get_pixel(150, 45), Rgba([250, 250, 245, 255]));
}

#[tokio::test]
async fn concurrent_selections_resolve_independently() {
    let mut session = DocumentSession::new();
    session.open(Document::from_rasters(vec![scanned_page()]));
    let pipeline = pipeline();
    let (tx, mut rx) = unbounded_channel();

    let mut ids = Vec::new();
    for view in [
        ViewRect::new(35.0, 35.0, 90.0, 20.0),
        ViewRect::new(150.0, 100.0, 60.0, 40.0),
    ] {
        let job = session.begin_selection(view).expect("job");
        let id = job.ticket.overlay;
        let handle = pipeline.spawn(job, tx.clone());
        session.track(id, handle.abort_handle());
        ids.push(id);
    }
    drop(tx);
    assert_eq!(session.in_flight(), 2);

    let mut placed = Vec::new();
    while let Some(completion) = rx.recv().await {
        if let Applied::Placed(id) = session.apply_completion(completion) {
            placed.push(id);
        }
    }
    placed.sort();
    assert_eq!(placed, ids);
    assert_eq!(session.in_flight(), 0);
    assert_eq!(session.overlays().len(), 2);
    assert!(
        session
            .overlays()
            .iter()
            .all(|overlay| overlay.text() == "Hola")
    );
}

#[tokio::test]
async fn deleting_an_overlay_restores_the_scan() {
    let mut session = DocumentSession::new();
    session.open(Document::from_rasters(vec![scanned_page()]));
    let id = pipeline()
        .translate_selection(&mut session, ViewRect::new(35.0, 35.0, 90.0, 20.0))
        .await
        .expect("overlay");
    let page = session.current_page().expect("page");
    assert_ne!(page.current(), page.original());

    session.delete_overlay(id).expect("delete");
    let page = session.current_page().expect("page");
    assert_eq!(page.current(), page.original());
    assert!(matches!(
        session.overlays().get(id),
        Err(PipelineError::UnknownOverlay(_))
    ));
}

#[tokio::test]
async fn tiny_selection_never_reaches_recognition() {
    let mut session = DocumentSession::new();
    session.open(Document::from_rasters(vec![scanned_page()]));
    let err = pipeline()
        .translate_selection(&mut session, ViewRect::new(10.0, 10.0, 0.5, 40.0))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SelectionTooSmall { .. }));
    assert!(session.overlays().is_empty());
}
