//! Media payloads exchanged between the transport, handlers and reply functions.

use serde::{Deserialize, Serialize};

/// A block of PCM16 audio. Multi-channel audio is interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioChunk {
    /// Creates a mono chunk.
    pub fn mono(sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            channels: 1,
            samples,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Duration in seconds. Zero when the sample rate is unknown.
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f32 / self.sample_rate as f32
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Converts the chunk to the requested channel layout.
    ///
    /// Downmixing averages the interleaved channels; upmixing duplicates the
    /// mono signal into both stereo channels.
    pub fn into_layout(self, layout: Layout) -> Self {
        let target = layout.channels();
        if self.channels == target {
            return self;
        }
        let samples = match layout {
            Layout::Mono => {
                let ch = self.channels.max(1) as usize;
                self.samples
                    .chunks_exact(ch)
                    .map(|frame| {
                        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                        (sum / ch as i32) as i16
                    })
                    .collect()
            }
            Layout::Stereo => self.samples.iter().flat_map(|&s| [s, s]).collect(),
        };
        Self {
            sample_rate: self.sample_rate,
            channels: target,
            samples,
        }
    }
}

/// Channel layout a handler expects its inbound audio in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Mono,
    Stereo,
}

impl Layout {
    pub fn channels(self) -> u16 {
        match self {
            Layout::Mono => 1,
            Layout::Stereo => 2,
        }
    }
}

/// A single RGB24 video frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}
