//! The receive half of reply-on-pause: buffering audio and firing pause events.

use crate::{
    audio::AudioChunk,
    error::{ParleyError, ParleyResult},
    pause::{Decision, PauseDetector},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Per-turn accumulation state.
///
/// Replaced wholesale when a pause fires and when a reply completes.
#[derive(Debug, Default, Clone)]
pub struct TurnState {
    /// Fixed by the first frame of the turn.
    pub sample_rate: Option<u32>,
    /// Everything the user said since they started talking.
    pub speech_buffer: Option<Vec<i16>>,
    /// Samples not yet scored by the pause detector.
    pub frame_buffer: Option<Vec<i16>>,
    pub started_talking: bool,
    pub pause_detected: bool,
}

impl TurnState {
    pub fn speech_len(&self) -> usize {
        self.speech_buffer.as_ref().map_or(0, Vec::len)
    }
}

/// Accumulates inbound mono audio and emits a speech segment on every pause.
///
/// `receive` never blocks: finished turns are handed to the reply side over
/// an unbounded channel and the state is replaced before returning.
pub struct TurnTakingEngine {
    detector: PauseDetector,
    state: TurnState,
    can_interrupt: bool,
    responding: Arc<AtomicBool>,
    pauses: mpsc::UnboundedSender<AudioChunk>,
}

impl TurnTakingEngine {
    pub fn new(
        detector: PauseDetector,
        can_interrupt: bool,
        responding: Arc<AtomicBool>,
        pauses: mpsc::UnboundedSender<AudioChunk>,
    ) -> Self {
        Self {
            detector,
            state: TurnState::default(),
            can_interrupt,
            responding,
            pauses,
        }
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = TurnState::default();
    }

    /// Buffers one frame and runs the pause detector once a full window is
    /// available.
    ///
    /// Returns the decision made for this frame, or `None` when no decision
    /// was due. While a reply is in flight and interruption is disabled, the
    /// frame is dropped without touching any buffer.
    pub fn receive(&mut self, frame: AudioChunk) -> ParleyResult<Option<Decision>> {
        if !self.can_interrupt && self.responding.load(Ordering::Acquire) {
            return Ok(None);
        }

        let sample_rate = *self.state.sample_rate.get_or_insert(frame.sample_rate);
        let pending = self.state.frame_buffer.get_or_insert_with(Vec::new);
        pending.extend_from_slice(&frame.samples);

        let Some(eval) = self
            .detector
            .evaluate(pending, sample_rate, self.state.started_talking)?
        else {
            return Ok(None);
        };

        let chunk = self.state.frame_buffer.take().unwrap_or_default();
        if eval.decision != Decision::NotYetTalking && !self.state.started_talking {
            debug!(speech_seconds = eval.speech_seconds, "Started talking");
            self.state.started_talking = true;
        }
        if self.state.started_talking {
            self.state
                .speech_buffer
                .get_or_insert_with(Vec::new)
                .extend(chunk);
        }

        if eval.decision == Decision::TurnEnded {
            self.state.pause_detected = true;
            let finished = std::mem::take(&mut self.state);
            let audio = AudioChunk::mono(sample_rate, finished.speech_buffer.unwrap_or_default());
            info!(duration = audio.duration_secs(), "Pause detected");
            self.pauses
                .send(audio)
                .map_err(|_| ParleyError::ChannelClosed("pause events"))?;
        }
        Ok(Some(eval.decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::AlgoOptions, vad::MockSpeechModel};
    use mockall::Sequence;

    const RATE: u32 = 16_000;
    const WINDOW: usize = 9_600;

    fn scripted(values: &[f32]) -> MockSpeechModel {
        let mut model = MockSpeechModel::new();
        let mut seq = Sequence::new();
        for &v in values {
            model
                .expect_speech_duration()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _, _| Ok(v));
        }
        model
    }

    fn engine(
        model: MockSpeechModel,
        can_interrupt: bool,
    ) -> (
        TurnTakingEngine,
        mpsc::UnboundedReceiver<AudioChunk>,
        Arc<AtomicBool>,
    ) {
        let detector = PauseDetector::new(Arc::new(model), AlgoOptions::default(), None).unwrap();
        let responding = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TurnTakingEngine::new(detector, can_interrupt, responding.clone(), tx),
            rx,
            responding,
        )
    }

    fn window(fill: i16) -> AudioChunk {
        AudioChunk::mono(RATE, vec![fill; WINDOW])
    }

    #[test]
    fn test_single_turn_fires_once_with_speech_audio() {
        let (mut engine, mut pauses, _) = engine(scripted(&[0.05, 0.25, 0.25, 0.25, 0.05]), true);

        let decisions: Vec<_> = (0..5)
            .map(|i| engine.receive(window(i as i16)).unwrap())
            .collect();
        assert_eq!(
            decisions,
            vec![
                Some(Decision::NotYetTalking),
                Some(Decision::StillTalking),
                Some(Decision::StillTalking),
                Some(Decision::StillTalking),
                Some(Decision::TurnEnded),
            ]
        );

        let audio = pauses.try_recv().expect("pause event");
        // The first window preceded speech and is not part of the turn.
        assert_eq!(audio.samples.len(), 4 * WINDOW);
        assert_eq!(audio.samples[0], 1);
        assert_eq!(audio.sample_rate, RATE);
        assert!(pauses.try_recv().is_err());

        // Fresh state after the pause.
        assert!(!engine.state().started_talking);
        assert_eq!(engine.state().speech_len(), 0);
        assert!(engine.state().sample_rate.is_none());
    }

    #[test]
    fn test_pause_is_edge_triggered() {
        let (mut engine, mut pauses, _) = engine(scripted(&[0.3, 0.05, 0.05, 0.05]), true);
        for _ in 0..4 {
            engine.receive(window(0)).unwrap();
        }
        assert!(pauses.try_recv().is_ok());
        assert!(pauses.try_recv().is_err());
    }

    #[test]
    fn test_below_start_threshold_never_pauses() {
        let (mut engine, mut pauses, _) = engine(scripted(&[0.15; 6]), true);
        for _ in 0..6 {
            assert_eq!(
                engine.receive(window(0)).unwrap(),
                Some(Decision::NotYetTalking)
            );
        }
        assert!(pauses.try_recv().is_err());
        assert_eq!(engine.state().speech_len(), 0);
    }

    #[test]
    fn test_speech_buffer_only_grows_within_turn() {
        let (mut engine, _pauses, _) = engine(scripted(&[0.3, 0.15, 0.2, 0.12]), true);
        let mut last = 0;
        for _ in 0..4 {
            engine.receive(window(0)).unwrap();
            let len = engine.state().speech_len();
            assert!(len >= last);
            last = len;
        }
        assert_eq!(last, 4 * WINDOW);
    }

    #[test]
    fn test_partial_frames_accumulate_until_window() {
        let (mut engine, _pauses, _) = engine(scripted(&[0.3]), true);
        let half = AudioChunk::mono(RATE, vec![0; WINDOW / 2]);
        assert_eq!(engine.receive(half.clone()).unwrap(), None);
        assert_eq!(
            engine.state().frame_buffer.as_ref().map(Vec::len),
            Some(WINDOW / 2)
        );
        assert_eq!(
            engine.receive(half).unwrap(),
            Some(Decision::StillTalking)
        );
        assert!(engine.state().frame_buffer.is_none());
    }

    #[test]
    fn test_non_interruptible_drops_everything_while_responding() {
        let mut model = MockSpeechModel::new();
        model.expect_speech_duration().never();
        let (mut engine, mut pauses, responding) = engine(model, false);
        responding.store(true, Ordering::Release);

        for _ in 0..3 {
            assert_eq!(engine.receive(window(5)).unwrap(), None);
        }
        assert!(engine.state().frame_buffer.is_none());
        assert!(engine.state().sample_rate.is_none());
        assert!(pauses.try_recv().is_err());
    }

    #[test]
    fn test_closed_reply_side_is_reported() {
        let (mut engine, pauses, _) = engine(scripted(&[0.3, 0.0]), true);
        drop(pauses);
        engine.receive(window(0)).unwrap();
        let err = engine.receive(window(0)).unwrap_err();
        assert!(matches!(err, ParleyError::ChannelClosed(_)));
    }
}
