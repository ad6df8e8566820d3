//! Reply output units and the per-session queue of structured side outputs.

use crate::audio::{AudioChunk, VideoFrame};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Structured values produced alongside (or instead of) media.
///
/// These are delivered out of band, through the session's output queue,
/// rather than over the media transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdditionalOutputs(pub Vec<Value>);

impl AdditionalOutputs {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn args(&self) -> &[Value] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One unit of output pulled from a reply generator.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputUnit {
    Audio(AudioChunk),
    Video(VideoFrame),
    Outputs(AdditionalOutputs),
    AudioWithOutputs(AudioChunk, AdditionalOutputs),
}

/// The media and side-output halves of an [`OutputUnit`].
#[derive(Debug, Default)]
pub struct OutputParts {
    pub audio: Option<AudioChunk>,
    pub video: Option<VideoFrame>,
    pub outputs: Option<AdditionalOutputs>,
}

impl OutputUnit {
    pub fn has_audio(&self) -> bool {
        matches!(self, OutputUnit::Audio(_) | OutputUnit::AudioWithOutputs(..))
    }

    pub fn additional_outputs(&self) -> Option<&AdditionalOutputs> {
        match self {
            OutputUnit::Outputs(o) | OutputUnit::AudioWithOutputs(_, o) => Some(o),
            _ => None,
        }
    }

    pub fn split(self) -> OutputParts {
        match self {
            OutputUnit::Audio(audio) => OutputParts {
                audio: Some(audio),
                ..Default::default()
            },
            OutputUnit::Video(video) => OutputParts {
                video: Some(video),
                ..Default::default()
            },
            OutputUnit::Outputs(outputs) => OutputParts {
                outputs: Some(outputs),
                ..Default::default()
            },
            OutputUnit::AudioWithOutputs(audio, outputs) => OutputParts {
                audio: Some(audio),
                outputs: Some(outputs),
                video: None,
            },
        }
    }
}

/// Result of a bounded read from a [`SessionOutputQueue`].
#[derive(Debug, PartialEq)]
pub enum QueueRead<T> {
    Item(T),
    /// Nothing arrived before the timeout.
    Empty,
    /// The queue was quit and fully drained.
    Closed,
}

/// Unbounded FIFO of side outputs with a one-shot quit signal.
///
/// Any number of producers may [`push`](Self::push); reads are meant for a
/// single consumer. Items queued before [`quit`](Self::quit) are still
/// delivered, after which every read returns [`QueueRead::Closed`].
pub struct SessionOutputQueue {
    tx: mpsc::UnboundedSender<AdditionalOutputs>,
    rx: Mutex<mpsc::UnboundedReceiver<AdditionalOutputs>>,
    quit: CancellationToken,
}

impl Default for SessionOutputQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            quit: CancellationToken::new(),
        }
    }
}

impl SessionOutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an output. Returns `false` if the queue has already been quit.
    pub fn push(&self, outputs: AdditionalOutputs) -> bool {
        if self.quit.is_cancelled() {
            return false;
        }
        self.tx.send(outputs).is_ok()
    }

    pub fn quit(&self) {
        self.quit.cancel();
    }

    pub fn is_quit(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Waits up to `timeout` for the next output.
    pub async fn next(&self, timeout: Duration) -> QueueRead<AdditionalOutputs> {
        let mut rx = self.rx.lock().await;
        if let Ok(item) = rx.try_recv() {
            return QueueRead::Item(item);
        }
        if self.quit.is_cancelled() {
            return QueueRead::Closed;
        }
        tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(item) => QueueRead::Item(item),
                None => QueueRead::Closed,
            },
            _ = self.quit.cancelled() => match rx.try_recv() {
                Ok(item) => QueueRead::Item(item),
                Err(_) => QueueRead::Closed,
            },
            _ = tokio::time::sleep(timeout) => QueueRead::Empty,
        }
    }
}
