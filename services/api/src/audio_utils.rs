use parley_core::AudioChunk;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Input frames handed to the resampler per processing step.
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
    channels: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        channels,
    )?;
    Ok(resampler)
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Decodes little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn pcm16_to_le_bytes(pcm16: &[i16]) -> Vec<u8> {
    pcm16.iter().flat_map(|&sample| sample.to_le_bytes()).collect()
}

/// Splits `chunk` into frames of `frame_size` samples per channel.
///
/// The final frame may be shorter.
pub fn split_frames(chunk: AudioChunk, frame_size: usize) -> Vec<AudioChunk> {
    if frame_size == 0 || chunk.is_empty() {
        return vec![chunk];
    }
    let step = frame_size * chunk.channels.max(1) as usize;
    chunk
        .samples
        .chunks(step)
        .map(|samples| AudioChunk {
            sample_rate: chunk.sample_rate,
            channels: chunk.channels,
            samples: samples.to_vec(),
        })
        .collect()
}

/// Resamples a continuous stream of audio chunks to a fixed target rate.
///
/// Input is buffered across calls so the resampler always sees whole chunks;
/// the filter state carries over between frames.
pub struct StreamResampler {
    target_rate: u32,
    source_rate: u32,
    channels: usize,
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            source_rate: 0,
            channels: 0,
            inner: None,
            pending: Vec::new(),
        }
    }

    fn configure(&mut self, source_rate: u32, channels: usize) -> anyhow::Result<()> {
        self.source_rate = source_rate;
        self.channels = channels;
        self.pending = vec![Vec::new(); channels];
        self.inner = if source_rate == self.target_rate {
            None
        } else {
            Some(create_resampler(
                source_rate as f64,
                self.target_rate as f64,
                RESAMPLER_CHUNK_FRAMES,
                channels,
            )?)
        };
        Ok(())
    }

    /// Feeds one chunk and returns whatever output is ready, if any.
    pub fn process(&mut self, chunk: AudioChunk) -> anyhow::Result<Option<AudioChunk>> {
        let channels = chunk.channels.max(1) as usize;
        if chunk.sample_rate == 0 {
            anyhow::bail!("audio chunk has no sample rate");
        }
        if chunk.sample_rate != self.source_rate || channels != self.channels {
            self.configure(chunk.sample_rate, channels)?;
        }
        let Some(resampler) = self.inner.as_mut() else {
            return Ok((!chunk.is_empty()).then_some(chunk));
        };

        for (idx, sample) in convert_i16_to_f32(&chunk.samples).into_iter().enumerate() {
            self.pending[idx % channels].push(sample);
        }

        let mut out: Vec<Vec<f32>> = vec![Vec::new(); channels];
        while self.pending[0].len() >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..needed).collect())
                .collect();
            let processed = resampler.process(&block, None)?;
            for (dst, src) in out.iter_mut().zip(processed) {
                dst.extend(src);
            }
        }

        if out[0].is_empty() {
            return Ok(None);
        }
        let frames = out[0].len();
        let mut interleaved = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            for ch in &out {
                interleaved.push(ch[i]);
            }
        }
        Ok(Some(AudioChunk {
            sample_rate: self.target_rate,
            channels: channels as u16,
            samples: convert_f32_to_i16(&interleaved),
        }))
    }
}
