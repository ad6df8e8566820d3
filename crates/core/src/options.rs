//! Tunable thresholds for pause detection and the speech model.

use crate::error::{ParleyError, ParleyResult};
use serde::{Deserialize, Serialize};

/// Thresholds driving the turn-taking state machine.
///
/// Invariant: `0 <= speech_threshold <= started_talking_threshold` and
/// `audio_chunk_duration > 0`. Use [`AlgoOptions::validate`] before handing
/// options to an engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlgoOptions {
    /// Seconds of buffered audio required before a speech decision is attempted.
    pub audio_chunk_duration: f32,
    /// Detected speech (seconds) within a chunk above which the user has started talking.
    pub started_talking_threshold: f32,
    /// Detected speech (seconds) within a chunk below which a talking user has paused.
    pub speech_threshold: f32,
}

impl Default for AlgoOptions {
    fn default() -> Self {
        Self {
            audio_chunk_duration: 0.6,
            started_talking_threshold: 0.2,
            speech_threshold: 0.1,
        }
    }
}

impl AlgoOptions {
    pub fn validate(&self) -> ParleyResult<()> {
        if !(self.audio_chunk_duration > 0.0) {
            return Err(ParleyError::InvalidOptions(format!(
                "audio_chunk_duration must be > 0, got {}",
                self.audio_chunk_duration
            )));
        }
        if !(self.speech_threshold >= 0.0) {
            return Err(ParleyError::InvalidOptions(format!(
                "speech_threshold must be >= 0, got {}",
                self.speech_threshold
            )));
        }
        if self.speech_threshold > self.started_talking_threshold {
            return Err(ParleyError::InvalidOptions(format!(
                "speech_threshold ({}) must not exceed started_talking_threshold ({})",
                self.speech_threshold, self.started_talking_threshold
            )));
        }
        Ok(())
    }
}

/// Options forwarded verbatim to the speech model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Per-window speech probability above which a window counts as speech.
    pub threshold: f32,
    /// Speech runs shorter than this are ignored.
    pub min_speech_duration_ms: u32,
    /// Silences shorter than this inside a speech run are bridged.
    pub min_silence_duration_ms: u32,
    /// Analysis window, expressed in samples at 16 kHz.
    pub window_size_samples: usize,
    /// Padding added to each side of a detected speech run.
    pub speech_pad_ms: u32,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_duration_ms: 250,
            min_silence_duration_ms: 100,
            window_size_samples: 1024,
            speech_pad_ms: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(AlgoOptions::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_chunk_duration() {
        let opts = AlgoOptions {
            audio_chunk_duration: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(ParleyError::InvalidOptions(_))
        ));

        let opts = AlgoOptions {
            audio_chunk_duration: f32::NAN,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let opts = AlgoOptions {
            started_talking_threshold: 0.1,
            speech_threshold: 0.2,
            ..Default::default()
        };
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));

        let opts = AlgoOptions {
            speech_threshold: -0.1,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_equal_thresholds_are_allowed() {
        let opts = AlgoOptions {
            started_talking_threshold: 0.15,
            speech_threshold: 0.15,
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
    }
}
