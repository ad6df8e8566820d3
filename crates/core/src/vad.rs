//! Speech model seam used by the pause detector.
//!
//! A model scores a block of audio and reports how many seconds of it contain
//! speech. Model inference is deliberately opaque to the rest of the crate; the
//! only built-in implementation is an energy detector, which is enough to run
//! the service without shipping ONNX weights.

use crate::options::ModelOptions;

/// Reports the amount of speech contained in an audio block.
#[cfg_attr(test, mockall::automock)]
pub trait SpeechModel: Send + Sync {
    /// Returns the number of seconds of speech detected in `samples`.
    fn speech_duration(
        &self,
        sample_rate: u32,
        samples: &[i16],
        options: Option<ModelOptions>,
    ) -> anyhow::Result<f32>;
}

/// Energy based speech detector.
///
/// The block is cut into analysis windows; each window scores
/// `rms / (2 * reference_level)` (capped at 1.0), so a window whose RMS equals
/// `reference_level` scores exactly 0.5. Windows above `options.threshold`
/// form speech runs, which are bridged and filtered like a neural VAD's
/// timestamps before their durations are summed.
#[derive(Debug, Clone, Copy)]
pub struct RmsSpeechModel {
    reference_level: f32,
}

impl Default for RmsSpeechModel {
    fn default() -> Self {
        Self {
            reference_level: 0.02,
        }
    }
}

impl RmsSpeechModel {
    pub fn new(reference_level: f32) -> Self {
        Self {
            reference_level: reference_level.max(f32::EPSILON),
        }
    }

    fn window_score(&self, window: &[i16]) -> f32 {
        if window.is_empty() {
            return 0.0;
        }
        let energy: f32 = window
            .iter()
            .map(|&s| {
                let v = s as f32 / 32768.0;
                v * v
            })
            .sum::<f32>()
            / window.len() as f32;
        (energy.sqrt() / (2.0 * self.reference_level)).min(1.0)
    }
}

impl SpeechModel for RmsSpeechModel {
    fn speech_duration(
        &self,
        sample_rate: u32,
        samples: &[i16],
        options: Option<ModelOptions>,
    ) -> anyhow::Result<f32> {
        if sample_rate == 0 || samples.is_empty() {
            return Ok(0.0);
        }
        let opts = options.unwrap_or_default();
        let window = ((opts.window_size_samples as u64 * sample_rate as u64) / 16_000).max(1) as usize;
        let window_secs = window as f32 / sample_rate as f32;
        let total_secs = samples.len() as f32 / sample_rate as f32;

        let active: Vec<bool> = samples
            .chunks(window)
            .map(|w| self.window_score(w) > opts.threshold)
            .collect();

        let to_windows = |ms: u32| ((ms as f32 / 1000.0) / window_secs).ceil() as usize;
        let min_silence = to_windows(opts.min_silence_duration_ms);
        let min_speech = to_windows(opts.min_speech_duration_ms).max(1);
        let pad = opts.speech_pad_ms as f32 / 1000.0;

        // Collect speech runs as [start, end) window ranges, bridging short gaps.
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for (idx, &is_speech) in active.iter().enumerate() {
            if !is_speech {
                continue;
            }
            match runs.last_mut() {
                Some((_, end)) if idx - *end < min_silence.max(1) => *end = idx + 1,
                _ => runs.push((idx, idx + 1)),
            }
        }

        let speech: f32 = runs
            .iter()
            .filter(|(start, end)| end - start >= min_speech)
            .map(|(start, end)| (end - start) as f32 * window_secs + 2.0 * pad)
            .sum();

        Ok(speech.min(total_secs))
    }
}
