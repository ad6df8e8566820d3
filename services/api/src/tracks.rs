//! Track callbacks: the tasks that move frames between a peer and a handler.
//!
//! Every callback is an error boundary. Handler failures are logged, reported
//! to the peer as an `error` control message, and the session keeps running.

use crate::{
    audio_utils::{StreamResampler, split_frames},
    transport::{FrameQueue, InboundTrack, MediaFrame, TrackKind},
};
use parley_core::{
    AdditionalOutputs, DataChannel, Emitted, HandlerBase, OutputUnit, ParleyError,
    SessionOutputQueue, SourceFn, StreamHandler, VideoFrame,
    handler::HandlerSettings,
    protocol::ServerMessage,
    reply::close_generator,
};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};

/// Poll interval for handlers that have no video frame ready.
pub const VIDEO_FRAME_PERIOD: Duration = Duration::from_millis(33);

type VideoFactory = dyn Fn(VideoFrame, Vec<Value>) -> anyhow::Result<OutputUnit> + Send + Sync;

/// A per-frame video transform.
#[derive(Clone)]
pub struct VideoFn {
    func: Arc<VideoFactory>,
    needs_additional_inputs: bool,
}

impl VideoFn {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(VideoFrame, Vec<Value>) -> anyhow::Result<OutputUnit> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            needs_additional_inputs: false,
        }
    }

    pub fn with_additional_inputs(mut self) -> Self {
        self.needs_additional_inputs = true;
        self
    }

    pub fn needs_additional_inputs(&self) -> bool {
        self.needs_additional_inputs
    }

    pub fn call(&self, frame: VideoFrame, args: Vec<Value>) -> anyhow::Result<OutputUnit> {
        (self.func)(frame, args)
    }
}

/// The handler instance bound to one session.
#[derive(Clone)]
pub enum SessionHandler {
    Stream(Arc<dyn StreamHandler>),
    Video { func: VideoFn, base: Arc<HandlerBase> },
    Source { func: SourceFn, base: Arc<HandlerBase> },
}

impl SessionHandler {
    pub fn base(&self) -> &HandlerBase {
        match self {
            SessionHandler::Stream(handler) => handler.base(),
            SessionHandler::Video { base, .. } | SessionHandler::Source { base, .. } => base,
        }
    }

    pub fn set_channel(&self, channel: Arc<dyn DataChannel>) {
        match self {
            SessionHandler::Stream(handler) => handler.set_channel(channel),
            _ => self.base().set_channel(channel),
        }
    }

    pub fn set_args(&self, args: Vec<Value>) {
        match self {
            SessionHandler::Stream(handler) => handler.set_args(args),
            _ => self.base().set_args(args),
        }
    }
}

/// Routes side outputs into the session queue and tells the peer to fetch them.
#[derive(Clone)]
pub struct OutputSink {
    queue: Arc<SessionOutputQueue>,
    handler: SessionHandler,
}

impl OutputSink {
    pub fn new(queue: Arc<SessionOutputQueue>, handler: SessionHandler) -> Self {
        Self { queue, handler }
    }

    pub fn push(&self, outputs: AdditionalOutputs) {
        let notice = ServerMessage::FetchOutput(outputs.args().to_vec());
        if self.queue.push(outputs) {
            self.handler.base().send_message(&notice);
        } else {
            debug!("Output queue closed; dropping additional outputs");
        }
    }
}

fn report_error(base: &HandlerBase, err: &ParleyError) {
    error!(error = ?err, "Handler failed");
    base.send_message(&ServerMessage::Error(err.to_string()));
}

/// Pushes `frame` unless the session stops first. Returns `false` when the
/// caller should stop producing.
async fn push_frame(queue: &FrameQueue, stop: &CancellationToken, frame: MediaFrame) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        pushed = queue.push(frame) => pushed,
    }
}

/// Resolves once the handler reports an interruption not yet seen.
async fn interrupted(interruptions: &mut Option<watch::Receiver<u64>>) {
    if let Some(rx) = interruptions {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

/// How far one reply unit got before [`AudioCallback::deliver`] returned.
enum Delivery {
    Sent,
    Interrupted,
    Stopped,
}

/// Bridges an inbound audio track to a [`StreamHandler`].
pub struct AudioCallback {
    handler: Arc<dyn StreamHandler>,
    sink: OutputSink,
    outbound: Option<Arc<FrameQueue>>,
    stop: CancellationToken,
}

impl AudioCallback {
    /// `outbound` is `None` in send-only sessions: replies still run, but
    /// only their side outputs reach the client.
    pub fn new(
        handler: Arc<dyn StreamHandler>,
        sink: OutputSink,
        outbound: Option<Arc<FrameQueue>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            handler,
            sink,
            outbound,
            stop,
        }
    }

    /// Spawns the receive and emit tasks in the current span.
    pub fn spawn(self, track: InboundTrack) {
        let this = Arc::new(self);
        tokio::spawn(this.clone().receive_loop(track).in_current_span());
        tokio::spawn(this.emit_loop().in_current_span());
    }

    async fn receive_loop(self: Arc<Self>, mut track: InboundTrack) {
        let settings = self.handler.settings();
        let mut resampler = StreamResampler::new(settings.input_sample_rate);
        let mut dropping = false;
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break,
                frame = track.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        debug!(track = %track.id, "Inbound audio track ended");
                        break;
                    }
                },
            };
            let MediaFrame::Audio(chunk) = frame else {
                continue;
            };
            if !self.handler.accepts_audio() {
                // Nothing spoken over a reply may leak into the next turn.
                if !dropping {
                    dropping = true;
                    resampler = StreamResampler::new(settings.input_sample_rate);
                }
                continue;
            }
            dropping = false;
            let chunk = match resampler.process(chunk.into_layout(settings.expected_layout)) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = ?e, "Dropping audio frame that could not be resampled");
                    continue;
                }
            };
            if let Err(e) = self.handler.receive(chunk) {
                report_error(self.handler.base(), &e);
            }
        }
    }

    async fn emit_loop(self: Arc<Self>) {
        let settings = self.handler.settings();
        let idle = Duration::from_secs_f64(
            settings.output_frame_size.max(1) as f64 / settings.output_sample_rate.max(1) as f64,
        );

        tokio::select! {
            _ = self.stop.cancelled() => return,
            started = self.handler.start_up() => {
                if let Err(e) = started {
                    report_error(self.handler.base(), &e);
                }
            }
        }

        let mut resampler = StreamResampler::new(settings.output_sample_rate);
        let mut interruptions = self.handler.interruptions();
        loop {
            // Interruptions raised before this pull reach `emit` as a pause.
            if let Some(rx) = interruptions.as_mut() {
                let _ = rx.borrow_and_update();
            }
            let emitted = tokio::select! {
                _ = self.stop.cancelled() => break,
                emitted = self.handler.emit() => emitted,
            };
            match emitted {
                Ok(Emitted::Idle) => {
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Ok(Emitted::Output(unit)) => {
                    match self
                        .deliver(unit, &mut resampler, &settings, &mut interruptions)
                        .await
                    {
                        Delivery::Sent => {}
                        Delivery::Interrupted => self.drop_queued(&mut resampler, &settings),
                        Delivery::Stopped => break,
                    }
                }
                Ok(Emitted::Interrupted) => self.drop_queued(&mut resampler, &settings),
                Ok(Emitted::TurnComplete) => debug!("Reply complete"),
                Err(e) => report_error(self.handler.base(), &e),
            }
        }
        debug!("Emit loop stopped");
    }

    /// Discards reply audio that has not reached the transport yet.
    fn drop_queued(&self, resampler: &mut StreamResampler, settings: &HandlerSettings) {
        *resampler = StreamResampler::new(settings.output_sample_rate);
        if let Some(queue) = &self.outbound {
            let dropped = queue.clear();
            debug!(dropped, "Cleared queued reply audio");
        }
    }

    /// Splits one unit into frames and queues them, giving up as soon as the
    /// user interrupts.
    async fn deliver(
        &self,
        unit: OutputUnit,
        resampler: &mut StreamResampler,
        settings: &HandlerSettings,
        interruptions: &mut Option<watch::Receiver<u64>>,
    ) -> Delivery {
        let parts = unit.split();
        if let Some(outputs) = parts.outputs {
            self.sink.push(outputs);
        }
        if parts.video.is_some() {
            debug!("Audio track ignores video output");
        }
        let (Some(audio), Some(queue)) = (parts.audio, self.outbound.as_ref()) else {
            return Delivery::Sent;
        };
        let audio = match resampler.process(audio) {
            Ok(Some(audio)) => audio,
            Ok(None) => return Delivery::Sent,
            Err(e) => {
                warn!(error = ?e, "Dropping reply audio that could not be resampled");
                return Delivery::Sent;
            }
        };
        for frame in split_frames(audio, settings.output_frame_size) {
            let pushed = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Delivery::Stopped,
                _ = interrupted(interruptions) => {
                    debug!("Reply interrupted while queueing audio");
                    return Delivery::Interrupted;
                }
                pushed = queue.push(MediaFrame::Audio(frame)) => pushed,
            };
            if !pushed {
                return Delivery::Stopped;
            }
        }
        Delivery::Sent
    }
}

/// Applies a [`VideoFn`] to every inbound frame.
pub struct VideoCallback {
    func: VideoFn,
    base: Arc<HandlerBase>,
    sink: OutputSink,
    outbound: Option<Arc<FrameQueue>>,
    stop: CancellationToken,
}

impl VideoCallback {
    pub fn new(
        func: VideoFn,
        base: Arc<HandlerBase>,
        sink: OutputSink,
        outbound: Option<Arc<FrameQueue>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            func,
            base,
            sink,
            outbound,
            stop,
        }
    }

    pub fn spawn(self, track: InboundTrack) {
        tokio::spawn(self.run(track).in_current_span());
    }

    async fn run(self, mut track: InboundTrack) {
        let mut requested_inputs = false;
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break,
                frame = track.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let MediaFrame::Video(frame) = frame else {
                continue;
            };
            if self.func.needs_additional_inputs() && !self.base.args().is_set() && !requested_inputs
            {
                self.base.send_message(&ServerMessage::SendInput(Vec::new()));
                requested_inputs = true;
            }

            let func = self.func.clone();
            let args = self.base.args().latest();
            let unit = match tokio::task::spawn_blocking(move || func.call(frame, args)).await {
                Ok(Ok(unit)) => unit,
                Ok(Err(e)) => {
                    report_error(&self.base, &ParleyError::Generator(e));
                    continue;
                }
                Err(e) => {
                    report_error(
                        &self.base,
                        &ParleyError::Generator(anyhow::anyhow!("video handler panicked: {e}")),
                    );
                    continue;
                }
            };

            let parts = unit.split();
            if let Some(outputs) = parts.outputs {
                self.sink.push(outputs);
            }
            if let (Some(video), Some(queue)) = (parts.video, self.outbound.as_ref()) {
                if !push_frame(queue, &self.stop, MediaFrame::Video(video)).await {
                    break;
                }
            }
        }
        debug!("Video callback stopped");
    }
}

/// Feeds video frames to a stream handler that also handles audio.
pub struct VideoStreamCallback {
    handler: Arc<dyn StreamHandler>,
    outbound: Option<Arc<FrameQueue>>,
    stop: CancellationToken,
}

impl VideoStreamCallback {
    pub fn new(
        handler: Arc<dyn StreamHandler>,
        outbound: Option<Arc<FrameQueue>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            handler,
            outbound,
            stop,
        }
    }

    pub fn spawn(self, track: InboundTrack) {
        let this = Arc::new(self);
        if this.outbound.is_some() {
            tokio::spawn(this.clone().emit_loop().in_current_span());
        }
        tokio::spawn(this.receive_loop(track).in_current_span());
    }

    async fn receive_loop(self: Arc<Self>, mut track: InboundTrack) {
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => break,
                frame = track.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let MediaFrame::Video(frame) = frame {
                if let Err(e) = self.handler.video_receive(frame).await {
                    report_error(self.handler.base(), &e);
                }
            }
        }
    }

    async fn emit_loop(self: Arc<Self>) {
        let Some(queue) = self.outbound.clone() else {
            return;
        };
        loop {
            let emitted = tokio::select! {
                _ = self.stop.cancelled() => break,
                emitted = self.handler.video_emit() => emitted,
            };
            match emitted {
                Ok(Some(frame)) => {
                    if !push_frame(&queue, &self.stop, MediaFrame::Video(frame)).await {
                        break;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(VIDEO_FRAME_PERIOD) => {}
                    }
                }
                Err(e) => report_error(self.handler.base(), &e),
            }
        }
    }
}

enum Step {
    Stop,
    Item(Option<anyhow::Result<OutputUnit>>),
}

/// Streams a server-generated source to a receive-only client.
pub struct ServerToClient {
    func: SourceFn,
    base: Arc<HandlerBase>,
    sink: OutputSink,
    kind: TrackKind,
    outbound: Arc<FrameQueue>,
    frame_size: usize,
    stop: CancellationToken,
    connected: CancellationToken,
}

impl ServerToClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        func: SourceFn,
        base: Arc<HandlerBase>,
        sink: OutputSink,
        kind: TrackKind,
        outbound: Arc<FrameQueue>,
        frame_size: usize,
        stop: CancellationToken,
        connected: CancellationToken,
    ) -> Self {
        Self {
            func,
            base,
            sink,
            kind,
            outbound,
            frame_size,
            stop,
            connected,
        }
    }

    /// Runs the source once the peer is connected.
    ///
    /// Returns `true` when the source ended on its own, `false` when the
    /// session was stopped first.
    pub async fn run(self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => return false,
            _ = self.connected.cancelled() => {}
        }

        let args = if self.func.needs_additional_inputs() {
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                args = self.base.wait_for_args() => args,
            }
        } else {
            Vec::new()
        };

        let mut generator = match self.func.call(args) {
            Ok(generator) => generator,
            Err(e) => {
                report_error(&self.base, &ParleyError::Generator(e));
                return true;
            }
        };

        loop {
            let step = tokio::select! {
                _ = self.stop.cancelled() => Step::Stop,
                item = generator.next_output() => Step::Item(item),
            };
            let unit = match step {
                Step::Stop => {
                    close_generator(generator).await;
                    return false;
                }
                Step::Item(None) => break,
                Step::Item(Some(Err(e))) => {
                    report_error(&self.base, &ParleyError::Generator(e));
                    break;
                }
                Step::Item(Some(Ok(unit))) => unit,
            };

            let parts = unit.split();
            if let Some(outputs) = parts.outputs {
                self.sink.push(outputs);
            }
            let frames: Vec<MediaFrame> = match (self.kind, parts.audio, parts.video) {
                (TrackKind::Audio, Some(audio), _) => split_frames(audio, self.frame_size)
                    .into_iter()
                    .map(MediaFrame::Audio)
                    .collect(),
                (TrackKind::Video, _, Some(video)) => vec![MediaFrame::Video(video)],
                _ => Vec::new(),
            };
            for frame in frames {
                if !push_frame(&self.outbound, &self.stop, frame).await {
                    return false;
                }
            }
        }

        // Let the transport flush what is already queued.
        while !self.outbound.is_empty() {
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingChannel;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use parley_core::{AudioChunk, ParleyResult, handler::HandlerSettings};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Emits a fixed script, then idles. Fails every `receive`.
    struct ScriptedHandler {
        base: HandlerBase,
        script: Mutex<Vec<ParleyResult<Emitted>>>,
        interruptions: watch::Sender<u64>,
    }

    impl ScriptedHandler {
        fn new(mut script: Vec<ParleyResult<Emitted>>) -> Self {
            script.reverse();
            Self {
                base: HandlerBase::new(),
                script: Mutex::new(script),
                interruptions: watch::Sender::new(0),
            }
        }

        fn interrupt(&self) {
            self.interruptions.send_modify(|count| *count += 1);
        }
    }

    #[async_trait]
    impl StreamHandler for ScriptedHandler {
        fn copy(&self) -> Arc<dyn StreamHandler> {
            Arc::new(ScriptedHandler::new(Vec::new()))
        }

        fn base(&self) -> &HandlerBase {
            &self.base
        }

        fn settings(&self) -> HandlerSettings {
            HandlerSettings {
                input_sample_rate: 16_000,
                ..Default::default()
            }
        }

        fn receive(&self, _frame: AudioChunk) -> ParleyResult<()> {
            Err(ParleyError::Transport("receive failed".into()))
        }

        async fn emit(&self) -> ParleyResult<Emitted> {
            let next = self.script.lock().pop();
            next.unwrap_or(Ok(Emitted::Idle))
        }

        fn interruptions(&self) -> Option<watch::Receiver<u64>> {
            Some(self.interruptions.subscribe())
        }
    }

    /// Records the length of every chunk that reaches `receive`.
    struct GatedRecorder {
        base: HandlerBase,
        accepting: AtomicBool,
        received: Mutex<Vec<usize>>,
    }

    impl GatedRecorder {
        fn new() -> Self {
            Self {
                base: HandlerBase::new(),
                accepting: AtomicBool::new(true),
                received: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StreamHandler for GatedRecorder {
        fn copy(&self) -> Arc<dyn StreamHandler> {
            Arc::new(GatedRecorder::new())
        }

        fn base(&self) -> &HandlerBase {
            &self.base
        }

        fn settings(&self) -> HandlerSettings {
            HandlerSettings {
                input_sample_rate: 16_000,
                ..Default::default()
            }
        }

        fn receive(&self, frame: AudioChunk) -> ParleyResult<()> {
            self.received.lock().push(frame.samples.len());
            Ok(())
        }

        async fn emit(&self) -> ParleyResult<Emitted> {
            Ok(Emitted::Idle)
        }

        fn accepts_audio(&self) -> bool {
            self.accepting.load(Ordering::SeqCst)
        }
    }

    fn track(frames: mpsc::Receiver<MediaFrame>) -> InboundTrack {
        InboundTrack {
            id: "mic".into(),
            kind: TrackKind::Audio,
            frames,
        }
    }

    fn audio(samples: usize) -> OutputUnit {
        OutputUnit::Audio(AudioChunk::mono(24_000, vec![1; samples]))
    }

    fn errors(channel: &RecordingChannel) -> usize {
        channel
            .raw()
            .iter()
            .filter(|m| m.contains(r#""type":"error""#))
            .count()
    }

    #[tokio::test]
    async fn test_audio_callback_frames_output_and_routes_side_outputs() {
        let handler = Arc::new(ScriptedHandler::new(vec![
            Ok(Emitted::Output(audio(1_000))),
            Ok(Emitted::Output(OutputUnit::Outputs(AdditionalOutputs::new(vec![
                json!("transcript"),
            ])))),
        ]));
        let channel = Arc::new(RecordingChannel::default());
        handler.set_channel(channel.clone());

        let outputs = Arc::new(SessionOutputQueue::new());
        let sink = OutputSink::new(outputs.clone(), SessionHandler::Stream(handler.clone()));
        let queue = Arc::new(FrameQueue::new(16));
        let stop = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(4);
        AudioCallback::new(handler, sink, Some(queue.clone()), stop.clone()).spawn(InboundTrack {
            id: "mic".into(),
            kind: TrackKind::Audio,
            frames: rx,
        });

        let mut sizes = Vec::new();
        for _ in 0..3 {
            match tokio::time::timeout(Duration::from_secs(1), queue.pull()).await {
                Ok(Some(MediaFrame::Audio(frame))) => sizes.push(frame.samples.len()),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(sizes, vec![480, 480, 40]);

        let read = outputs.next(Duration::from_secs(1)).await;
        assert_eq!(
            read,
            parley_core::QueueRead::Item(AdditionalOutputs::new(vec![json!("transcript")]))
        );
        assert!(
            channel
                .messages()
                .contains(&ServerMessage::FetchOutput(vec![json!("transcript")]))
        );
        stop.cancel();
    }

    #[tokio::test]
    async fn test_audio_callback_clears_queue_on_interrupt() {
        let handler = Arc::new(ScriptedHandler::new(vec![
            Ok(Emitted::Output(audio(480 * 4))),
            Ok(Emitted::Interrupted),
        ]));
        let sink = OutputSink::new(
            Arc::new(SessionOutputQueue::new()),
            SessionHandler::Stream(handler.clone()),
        );
        let queue = Arc::new(FrameQueue::new(16));
        let stop = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(4);
        AudioCallback::new(handler, sink, Some(queue.clone()), stop.clone()).spawn(InboundTrack {
            id: "mic".into(),
            kind: TrackKind::Audio,
            frames: rx,
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.is_empty());
        stop.cancel();
    }

    #[tokio::test]
    async fn test_interruption_stops_long_reply_mid_unit() {
        // Four seconds of reply audio in a single unit.
        let handler = Arc::new(ScriptedHandler::new(vec![Ok(Emitted::Output(audio(
            24_000 * 4,
        )))]));
        let sink = OutputSink::new(
            Arc::new(SessionOutputQueue::new()),
            SessionHandler::Stream(handler.clone()),
        );
        let queue = Arc::new(FrameQueue::new(4));
        let stop = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(4);
        AudioCallback::new(handler.clone(), sink, Some(queue.clone()), stop.clone())
            .spawn(track(rx));

        for _ in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(1), queue.pull())
                .await
                .unwrap();
            assert!(matches!(frame, Some(MediaFrame::Audio(_))));
        }
        handler.interrupt();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stale = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(100), queue.pull()).await
        {
            stale += 1;
        }
        assert!(stale <= 2, "{stale} frames of the interrupted reply still played");
        stop.cancel();
    }

    #[tokio::test]
    async fn test_dropped_audio_does_not_reach_resampler() {
        let handler = Arc::new(GatedRecorder::new());
        let sink = OutputSink::new(
            Arc::new(SessionOutputQueue::new()),
            SessionHandler::Stream(handler.clone()),
        );
        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        AudioCallback::new(handler.clone(), sink, None, stop.clone()).spawn(track(rx));
        let frame = || AudioChunk::mono(48_000, vec![100; 960]);

        tx.send(MediaFrame::Audio(frame())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.accepting.store(false, Ordering::SeqCst);
        for _ in 0..5 {
            tx.send(MediaFrame::Audio(frame())).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.received.lock().is_empty());

        handler.accepting.store(true, Ordering::SeqCst);
        for _ in 0..4 {
            tx.send(MediaFrame::Audio(frame())).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The next turn starts from a clean resampler.
        let mut fresh = StreamResampler::new(16_000);
        let mut expected = Vec::new();
        for _ in 0..4 {
            if let Some(chunk) = fresh.process(frame()).unwrap() {
                expected.push(chunk.samples.len());
            }
        }
        assert!(!expected.is_empty());
        assert_eq!(*handler.received.lock(), expected);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_handler_errors_are_reported_and_session_continues() {
        let handler = Arc::new(ScriptedHandler::new(vec![
            Err(ParleyError::Generator(anyhow::anyhow!("tts down"))),
            Ok(Emitted::Output(audio(480))),
        ]));
        let channel = Arc::new(RecordingChannel::default());
        handler.set_channel(channel.clone());
        let sink = OutputSink::new(
            Arc::new(SessionOutputQueue::new()),
            SessionHandler::Stream(handler.clone()),
        );
        let queue = Arc::new(FrameQueue::new(16));
        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        AudioCallback::new(handler, sink, Some(queue.clone()), stop.clone()).spawn(InboundTrack {
            id: "mic".into(),
            kind: TrackKind::Audio,
            frames: rx,
        });

        tx.send(MediaFrame::Audio(AudioChunk::mono(16_000, vec![0; 320])))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), queue.pull())
            .await
            .unwrap();
        assert!(matches!(frame, Some(MediaFrame::Audio(_))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(errors(&channel), 2);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_video_callback_applies_function() {
        let base = Arc::new(HandlerBase::new());
        let func = VideoFn::new(|mut frame: VideoFrame, _args: Vec<Value>| {
            frame.data.iter_mut().for_each(|b| *b = 255 - *b);
            Ok(OutputUnit::Video(frame))
        });
        let sink = OutputSink::new(
            Arc::new(SessionOutputQueue::new()),
            SessionHandler::Video {
                func: func.clone(),
                base: base.clone(),
            },
        );
        let queue = Arc::new(FrameQueue::new(4));
        let stop = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        VideoCallback::new(func, base, sink, Some(queue.clone()), stop.clone()).spawn(
            InboundTrack {
                id: "cam".into(),
                kind: TrackKind::Video,
                frames: rx,
            },
        );

        tx.send(MediaFrame::Video(VideoFrame {
            width: 1,
            height: 1,
            data: vec![0, 10, 255],
        }))
        .await
        .unwrap();
        let out = tokio::time::timeout(Duration::from_secs(1), queue.pull())
            .await
            .unwrap();
        assert_eq!(
            out,
            Some(MediaFrame::Video(VideoFrame {
                width: 1,
                height: 1,
                data: vec![255, 245, 0],
            }))
        );
        stop.cancel();
    }

    #[tokio::test]
    async fn test_server_to_client_waits_for_connection_then_drains() {
        let base = Arc::new(HandlerBase::new());
        let func = SourceFn::blocking(|_| vec![Ok(audio(960))]);
        let sink = OutputSink::new(
            Arc::new(SessionOutputQueue::new()),
            SessionHandler::Source {
                func: func.clone(),
                base: base.clone(),
            },
        );
        let queue = Arc::new(FrameQueue::new(8));
        let stop = CancellationToken::new();
        let connected = CancellationToken::new();
        let source = ServerToClient::new(
            func,
            base,
            sink,
            TrackKind::Audio,
            queue.clone(),
            480,
            stop.clone(),
            connected.clone(),
        );
        let task = tokio::spawn(source.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.is_empty());
        connected.cancel();

        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(1), queue.pull())
                .await
                .unwrap();
            assert!(matches!(frame, Some(MediaFrame::Audio(ref f)) if f.samples.len() == 480));
        }
        let ended = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(ended);
    }
}
