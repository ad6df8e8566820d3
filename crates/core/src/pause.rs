//! Stateless pause detection.
//!
//! [`PauseDetector`] turns a buffered block of audio into a speech decision.
//! It keeps no turn state of its own: whether the user is already talking is
//! passed in by the caller, so the same inputs always produce the same output.

use crate::{
    error::{ParleyError, ParleyResult},
    options::{AlgoOptions, ModelOptions},
    vad::SpeechModel,
};
use std::sync::Arc;
use tracing::debug;

/// Outcome of one speech decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not enough speech to consider the user as talking.
    NotYetTalking,
    /// The user is talking (or has just started).
    StillTalking,
    /// The user was talking and has now paused.
    TurnEnded,
}

/// Speech measurement plus the decision derived from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PauseEvaluation {
    pub speech_seconds: f32,
    pub decision: Decision,
}

/// Wraps a [`SpeechModel`] with the turn-taking thresholds.
#[derive(Clone)]
pub struct PauseDetector {
    model: Arc<dyn SpeechModel>,
    algo_options: AlgoOptions,
    model_options: Option<ModelOptions>,
}

impl PauseDetector {
    pub fn new(
        model: Arc<dyn SpeechModel>,
        algo_options: AlgoOptions,
        model_options: Option<ModelOptions>,
    ) -> ParleyResult<Self> {
        algo_options.validate()?;
        Ok(Self {
            model,
            algo_options,
            model_options,
        })
    }

    pub fn algo_options(&self) -> &AlgoOptions {
        &self.algo_options
    }

    /// Returns `true` once `buffer` holds at least one decision window of audio.
    pub fn ready(&self, buffer_len: usize, sample_rate: u32) -> bool {
        sample_rate > 0
            && buffer_len as f32 / sample_rate as f32 >= self.algo_options.audio_chunk_duration
    }

    /// Scores `buffer` and classifies it.
    ///
    /// Returns `Ok(None)` without calling the model while the buffer is shorter
    /// than `audio_chunk_duration`.
    pub fn evaluate(
        &self,
        buffer: &[i16],
        sample_rate: u32,
        started_talking: bool,
    ) -> ParleyResult<Option<PauseEvaluation>> {
        if !self.ready(buffer.len(), sample_rate) {
            return Ok(None);
        }
        let speech_seconds = self
            .model
            .speech_duration(sample_rate, buffer, self.model_options)
            .map_err(ParleyError::SpeechModel)?;
        debug!(speech_seconds, "VAD duration");
        Ok(Some(PauseEvaluation {
            speech_seconds,
            decision: self.classify(speech_seconds, started_talking),
        }))
    }

    /// Pure threshold mapping from detected speech to a [`Decision`].
    pub fn classify(&self, speech_seconds: f32, started_talking: bool) -> Decision {
        let talking =
            started_talking || speech_seconds > self.algo_options.started_talking_threshold;
        if !talking {
            Decision::NotYetTalking
        } else if speech_seconds < self.algo_options.speech_threshold {
            Decision::TurnEnded
        } else {
            Decision::StillTalking
        }
    }
}
