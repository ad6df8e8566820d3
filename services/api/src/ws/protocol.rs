//! JSON text frames exchanged over the WebSocket transport.
//!
//! Binary frames carry raw PCM16LE audio in both directions and are not
//! described here.

use anyhow::Context;
use base64::Engine;
use parley_core::{VideoFrame, protocol::AdmissionRejection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    /// The session was admitted.
    Answer { sdp: String },
    /// The session was refused; the socket closes right after.
    Rejected(AdmissionRejection),
    /// The offer failed for a reason other than admission.
    Error { message: String },
    /// Format of the binary audio frames that follow.
    AudioFormat { sample_rate: u32, channels: u16 },
    /// A base64-encoded RGB24 frame.
    Video { width: u32, height: u32, data: String },
    /// A data-channel message.
    Data { payload: Value },
}

impl WireMessage {
    pub fn video(frame: &VideoFrame) -> Self {
        WireMessage::Video {
            width: frame.width,
            height: frame.height,
            data: base64::engine::general_purpose::STANDARD.encode(&frame.data),
        }
    }

    /// Wraps a data-channel payload. Text that is not JSON is sent as a string.
    pub fn data(text: String) -> Self {
        let payload = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text),
        };
        WireMessage::Data { payload }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decodes the pixel data of a `video` message.
pub fn decode_video(width: u32, height: u32, data: &str) -> anyhow::Result<VideoFrame> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("video frame is not valid base64")?;
    let expected = width as usize * height as usize * 3;
    anyhow::ensure!(
        data.len() == expected,
        "video frame has {} bytes, expected {expected} for {width}x{height} RGB",
        data.len()
    );
    Ok(VideoFrame {
        width,
        height,
        data,
    })
}
