//! [`ReplyOnPause`]: a [`StreamHandler`] that answers the user whenever they
//! stop talking.

use crate::{
    audio::{AudioChunk, Layout},
    error::ParleyResult,
    handler::{Emitted, HandlerBase, HandlerSettings, StreamHandler},
    options::{AlgoOptions, ModelOptions},
    pause::{Decision, PauseDetector},
    reply::{ReplyController, ReplyFn, SourceFn},
    turn::TurnTakingEngine,
    vad::SpeechModel,
};
use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Construction options for [`ReplyOnPause`].
#[derive(Clone)]
pub struct ReplyOnPauseOptions {
    pub algo_options: AlgoOptions,
    pub model_options: Option<ModelOptions>,
    /// Whether a new pause may cut off an in-flight reply.
    pub can_interrupt: bool,
    pub settings: HandlerSettings,
    /// Generator run once when the session starts, before any user speech.
    pub startup_fn: Option<SourceFn>,
}

impl Default for ReplyOnPauseOptions {
    fn default() -> Self {
        Self {
            algo_options: AlgoOptions::default(),
            model_options: None,
            can_interrupt: true,
            settings: HandlerSettings::default(),
            startup_fn: None,
        }
    }
}

pub struct ReplyOnPause {
    reply_fn: ReplyFn,
    detector: PauseDetector,
    options: ReplyOnPauseOptions,
    base: Arc<HandlerBase>,
    engine: parking_lot::Mutex<TurnTakingEngine>,
    controller: tokio::sync::Mutex<ReplyController>,
    responding: Arc<AtomicBool>,
    interruptions: watch::Sender<u64>,
}

impl ReplyOnPause {
    /// Validates the options and builds the prototype handler.
    pub fn new(
        reply_fn: ReplyFn,
        model: Arc<dyn SpeechModel>,
        options: ReplyOnPauseOptions,
    ) -> ParleyResult<Self> {
        let detector = PauseDetector::new(model, options.algo_options, options.model_options)?;
        Ok(Self::with_detector(reply_fn, detector, options))
    }

    fn with_detector(
        reply_fn: ReplyFn,
        detector: PauseDetector,
        options: ReplyOnPauseOptions,
    ) -> Self {
        let base = Arc::new(HandlerBase::new());
        let responding = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = TurnTakingEngine::new(
            detector.clone(),
            options.can_interrupt,
            responding.clone(),
            tx,
        );
        let controller = ReplyController::new(
            reply_fn.clone(),
            base.clone(),
            options.can_interrupt,
            responding.clone(),
            rx,
        );
        Self {
            reply_fn,
            detector,
            options,
            base,
            engine: parking_lot::Mutex::new(engine),
            controller: tokio::sync::Mutex::new(controller),
            responding,
            interruptions: watch::Sender::new(0),
        }
    }

    pub fn can_interrupt(&self) -> bool {
        self.options.can_interrupt
    }
}

#[async_trait]
impl StreamHandler for ReplyOnPause {
    fn copy(&self) -> Arc<dyn StreamHandler> {
        Arc::new(Self::with_detector(
            self.reply_fn.clone(),
            self.detector.clone(),
            self.options.clone(),
        ))
    }

    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn settings(&self) -> HandlerSettings {
        self.options.settings
    }

    fn receive(&self, frame: AudioChunk) -> ParleyResult<()> {
        // Pause detection runs on mono audio whatever the negotiated layout.
        let frame = frame.into_layout(Layout::Mono);
        let decision = self.engine.lock().receive(frame)?;
        if decision == Some(Decision::TurnEnded)
            && self.options.can_interrupt
            && self.responding.load(Ordering::Acquire)
        {
            debug!("New turn interrupts the reply in flight");
            self.interruptions.send_modify(|count| *count += 1);
        }
        Ok(())
    }

    fn interruptions(&self) -> Option<watch::Receiver<u64>> {
        Some(self.interruptions.subscribe())
    }

    fn accepts_audio(&self) -> bool {
        self.options.can_interrupt || !self.responding.load(Ordering::Acquire)
    }

    async fn emit(&self) -> ParleyResult<Emitted> {
        let mut controller = self.controller.lock().await;
        let emitted = controller.emit().await;
        if matches!(emitted, Ok(Emitted::TurnComplete) | Err(_)) {
            self.engine.lock().reset();
        }
        emitted
    }

    async fn start_up(&self) -> ParleyResult<()> {
        let Some(startup) = self.options.startup_fn.as_ref() else {
            return Ok(());
        };
        self.controller.lock().await.start_up(startup).await
    }

    async fn shutdown(&self) {
        self.controller.lock().await.shutdown().await;
    }

    async fn reset(&self) {
        self.controller.lock().await.reset();
        self.engine.lock().reset();
    }
}
