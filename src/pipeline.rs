use image::{Rgba, RgbaImage};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::document::sample_background;
use crate::error::{PipelineError, Result};
use crate::geometry::ViewRect;
use crate::ocr::{RecognitionCascade, RecognitionResult};
use crate::overlay::{OverlayId, OverlayState};
use crate::preprocess::{self, PreprocessConfig};
use crate::providers::TranslationRequest;
use crate::session::{Applied, DocumentSession};
use crate::translate::{TranslationChain, TranslationOutcome};

/// Identifies the overlay a task works for and the session state it was
/// started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub overlay: OverlayId,
    pub page: usize,
    pub generation: u64,
}

/// Everything a background task needs; owns its own copy of the crop.
#[derive(Debug, Clone)]
pub struct SelectionJob {
    pub ticket: Ticket,
    pub crop: RgbaImage,
    pub preprocess: PreprocessConfig,
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub recognition: RecognitionResult,
    pub translation: TranslationOutcome,
    pub background: Rgba<u8>,
}

/// Message from a selection task back to the session.
#[derive(Debug)]
pub enum Completion {
    Stage {
        ticket: Ticket,
        state: OverlayState,
    },
    Finished {
        ticket: Ticket,
        result: Result<TaskOutput>,
    },
}

impl Completion {
    pub fn ticket(&self) -> Ticket {
        match self {
            Completion::Stage { ticket, .. } | Completion::Finished { ticket, .. } => *ticket,
        }
    }
}

/// Recognition followed by translation for one selection, run off the
/// interaction thread.
#[derive(Clone)]
pub struct SelectionPipeline {
    cascade: Arc<RecognitionCascade>,
    chain: Arc<TranslationChain>,
    source_lang: String,
    target_lang: String,
}

impl SelectionPipeline {
    pub fn new(
        cascade: RecognitionCascade,
        chain: TranslationChain,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            cascade: Arc::new(cascade),
            chain: Arc::new(chain),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        }
    }

    pub fn cascade(&self) -> &RecognitionCascade {
        &self.cascade
    }

    pub fn chain(&self) -> &TranslationChain {
        &self.chain
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    pub fn set_target_lang(&mut self, lang: impl Into<String>) {
        self.target_lang = lang.into();
    }

    /// Runs the job on the tokio runtime. Completions arrive on `tx`.
    pub fn spawn(&self, job: SelectionJob, tx: UnboundedSender<Completion>) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(job, &tx).await })
    }

    pub async fn run(&self, job: SelectionJob, tx: &UnboundedSender<Completion>) {
        let ticket = job.ticket;
        let result = self.process(job, tx).await;
        if let Err(err) = &result {
            debug!("selection task for {} ended: {}", ticket.overlay, err);
        }
        if tx.send(Completion::Finished { ticket, result }).is_err() {
            debug!("session gone; dropping result for {}", ticket.overlay);
        }
    }

    async fn process(&self, job: SelectionJob, tx: &UnboundedSender<Completion>) -> Result<TaskOutput> {
        let ticket = job.ticket;
        let _ = tx.send(Completion::Stage {
            ticket,
            state: OverlayState::Extracting,
        });

        let background = sample_background(&job.crop);
        let cascade = Arc::clone(&self.cascade);
        let crop = job.crop;
        let config = job.preprocess;
        let recognition = tokio::task::spawn_blocking(move || {
            let conditioned = preprocess::condition(&crop, &config);
            cascade.recognize(&conditioned)
        })
        .await
        .map_err(|err| {
            warn!("recognition task panicked or was cancelled: {}", err);
            PipelineError::Task(err.to_string())
        })??;

        let _ = tx.send(Completion::Stage {
            ticket,
            state: OverlayState::Translating,
        });
        let request = TranslationRequest::new(
            recognition.text.clone(),
            self.source_lang.clone(),
            self.target_lang.clone(),
        );
        let translation = self.chain.translate(&request).await;
        Ok(TaskOutput {
            recognition,
            translation,
            background,
        })
    }

    /// Starts a selection and waits for it, applying every completion to the
    /// session. Used by the one-shot front end.
    pub async fn translate_selection(
        &self,
        session: &mut DocumentSession,
        view: ViewRect,
    ) -> Result<OverlayId> {
        let job = session.begin_selection(view)?;
        let id = job.ticket.overlay;
        let (tx, mut rx) = unbounded_channel();
        self.run(job, &tx).await;
        drop(tx);
        while let Some(completion) = rx.recv().await {
            if let Applied::Aborted { error, .. } = session.apply_completion(completion) {
                return Err(error);
            }
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::ocr::testing::ScriptedEngine;
    use crate::translate::ProviderPolicy;
    use crate::translate::testing::{Reply, StubProvider};
    use std::time::Duration;

    fn session() -> DocumentSession {
        let mut page = RgbaImage::from_pixel(200, 120, Rgba([255, 255, 255, 255]));
        for y in 30..40 {
            for x in 30..90 {
                page.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let mut session = DocumentSession::new();
        session.open(Document::from_rasters(vec![page, RgbaImage::new(50, 50)]));
        session
    }

    fn pipeline(engine: ScriptedEngine, chain: TranslationChain) -> SelectionPipeline {
        SelectionPipeline::new(
            RecognitionCascade::new(Arc::new(engine), "jpn"),
            chain,
            "ja",
            "es",
        )
    }

    #[tokio::test]
    async fn messages_follow_the_overlay_lifecycle() {
        let mut session = session();
        let pipeline = pipeline(
            ScriptedEngine::answering(6, "こんにちは"),
            TranslationChain::new().push(
                StubProvider::new("stub", Reply::Text("Hola")),
                ProviderPolicy::new(Duration::from_secs(1)),
            ),
        );
        let job = session
            .begin_selection(ViewRect::new(20.0, 20.0, 80.0, 30.0))
            .expect("job");
        let (tx, mut rx) = unbounded_channel();
        pipeline.run(job, &tx).await;
        drop(tx);

        let mut states = Vec::new();
        while let Some(completion) = rx.recv().await {
            match completion {
                Completion::Stage { state, .. } => states.push(state),
                Completion::Finished { result, .. } => {
                    let output = result.expect("output");
                    assert_eq!(output.recognition.text, "こんにちは");
                    assert_eq!(output.translation.text(), "Hola");
                }
            }
        }
        assert_eq!(states, vec![OverlayState::Extracting, OverlayState::Translating]);
    }

    #[tokio::test]
    async fn no_text_leaves_the_page_untouched() {
        let mut session = session();
        let before = session.current_page().expect("page").current().clone();
        let pipeline = pipeline(ScriptedEngine::default(), TranslationChain::new());

        let err = pipeline
            .translate_selection(&mut session, ViewRect::new(20.0, 20.0, 80.0, 30.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoTextDetected));
        assert!(session.overlays().is_empty());
        assert_eq!(session.current_page().expect("page").current(), &before);
    }

    #[tokio::test]
    async fn failed_translation_still_places_sentinel() {
        let mut session = session();
        let pipeline = pipeline(
            ScriptedEngine::answering(6, "こんにちは"),
            TranslationChain::new().push(
                StubProvider::new("down", Reply::Status(500)),
                ProviderPolicy::new(Duration::from_secs(1)),
            ),
        );
        let id = pipeline
            .translate_selection(&mut session, ViewRect::new(20.0, 20.0, 80.0, 30.0))
            .await
            .expect("overlay");
        let overlay = session.overlays().get(id).expect("overlay");
        assert_eq!(overlay.text(), "[translation failed]");
        assert_eq!(overlay.state(), OverlayState::Placed);
        assert_eq!(overlay.provider(), None);
    }

    #[tokio::test]
    async fn late_completion_after_navigation_is_discarded() {
        let mut session = session();
        let pipeline = pipeline(
            ScriptedEngine::answering(6, "こんにちは"),
            TranslationChain::new().push(
                StubProvider::new("stub", Reply::Text("Hola")),
                ProviderPolicy::new(Duration::from_secs(1)),
            ),
        );
        let job = session
            .begin_selection(ViewRect::new(20.0, 20.0, 80.0, 30.0))
            .expect("job");
        let (tx, mut rx) = unbounded_channel();
        let handle = pipeline.spawn(job, tx);
        session.show_page(1).expect("navigate");
        let _ = handle.await;

        while let Some(completion) = rx.recv().await {
            assert!(matches!(
                session.apply_completion(completion),
                Applied::Discarded(_)
            ));
        }
        assert!(session.overlays().is_empty());
        session.show_page(0).expect("back");
        let page = session.current_page().expect("page");
        assert_eq!(page.current(), page.original());
    }
}
