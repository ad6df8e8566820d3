//! Built-in echo handlers used by the `parley` binary, one per modality.

use crate::{
    config::{Config, Modality, Mode},
    orchestrator::EventHandler,
    tracks::VideoFn,
};
use parley_core::{
    AdditionalOutputs, AudioChunk, OutputUnit, ParleyResult, ReplyFn, ReplyOnPause,
    ReplyOnPauseOptions, RmsSpeechModel, SourceFn,
};
use serde_json::json;
use std::{f32::consts::TAU, sync::Arc};

const TONE_SAMPLE_RATE: u32 = 24_000;
const TONE_CHUNK_SAMPLES: usize = 2_400;

/// Replies with the caller's own speech plus a summary of what was echoed.
pub fn echo_reply() -> ReplyFn {
    ReplyFn::blocking(|audio: AudioChunk, _args| {
        let summary = json!({
            "echoed_secs": audio.duration_secs(),
            "sample_rate": audio.sample_rate,
        });
        let reply: anyhow::Result<OutputUnit> = Ok(OutputUnit::AudioWithOutputs(
            audio,
            AdditionalOutputs::new(vec![summary]),
        ));
        vec![reply]
    })
}

/// Mirrors each frame horizontally.
pub fn mirror_video() -> VideoFn {
    VideoFn::new(|mut frame, _args| {
        let row = frame.width as usize * 3;
        if row > 0 {
            for line in frame.data.chunks_exact_mut(row) {
                let pixels = line.len() / 3;
                for i in 0..pixels / 2 {
                    let j = pixels - 1 - i;
                    for c in 0..3 {
                        line.swap(i * 3 + c, j * 3 + c);
                    }
                }
            }
        }
        Ok(OutputUnit::Video(frame))
    })
}

/// Streams a tone whose pitch can be set with a numeric first input.
pub fn tone_source(seconds: f32) -> SourceFn {
    SourceFn::blocking(move |args| {
        let freq = args.first().and_then(|v| v.as_f64()).unwrap_or(440.0) as f32;
        let total = (seconds.max(0.0) * TONE_SAMPLE_RATE as f32) as usize;
        let samples: Vec<i16> = (0..total)
            .map(|n| {
                let t = n as f32 / TONE_SAMPLE_RATE as f32;
                ((TAU * freq * t).sin() * 0.3 * i16::MAX as f32) as i16
            })
            .collect();
        samples
            .chunks(TONE_CHUNK_SAMPLES)
            .map(|chunk| {
                Ok(OutputUnit::Audio(AudioChunk::mono(
                    TONE_SAMPLE_RATE,
                    chunk.to_vec(),
                )))
            })
            .collect::<Vec<anyhow::Result<OutputUnit>>>()
    })
}

/// Picks the echo handler that fits the configured modality and mode.
pub fn handler_for(config: &Config) -> ParleyResult<EventHandler> {
    let session = &config.session;
    if session.mode == Mode::Receive {
        return Ok(EventHandler::Source(tone_source(3.0)));
    }
    match session.modality {
        Modality::Video => Ok(EventHandler::Video(mirror_video())),
        Modality::Audio | Modality::AudioVideo => {
            let options = ReplyOnPauseOptions {
                algo_options: config.algo_options,
                can_interrupt: config.can_interrupt,
                ..Default::default()
            };
            let model = Arc::new(RmsSpeechModel::new(config.vad_rms_threshold));
            let handler = ReplyOnPause::new(echo_reply(), model, options)?;
            Ok(EventHandler::Stream(Arc::new(handler)))
        }
    }
}
