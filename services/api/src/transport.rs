//! Abstractions over the bidirectional media transport.
//!
//! The orchestrator only talks to a [`PeerConnection`] plus the stream of
//! [`PeerEvent`]s it produces. The WebSocket adapter in [`crate::ws`] is one
//! implementation; tests use an in-memory one.

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{AudioChunk, DataChannel, ParleyResult, VideoFrame};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt, sync::Arc};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaFrame {
    Audio(AudioChunk),
    Video(VideoFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Media flowing from the peer. The track ends when `frames` closes.
#[derive(Debug)]
pub struct InboundTrack {
    pub id: String,
    pub kind: TrackKind,
    pub frames: mpsc::Receiver<MediaFrame>,
}

/// Media flowing to the peer; the transport drains `queue`.
#[derive(Clone)]
pub struct OutboundTrack {
    pub kind: TrackKind,
    pub queue: Arc<FrameQueue>,
}

pub enum PeerEvent {
    ConnectionStateChanged(ConnectionState),
    IceConnectionStateChanged(IceConnectionState),
    Track(InboundTrack),
    DataChannel(Arc<dyn DataChannel>),
    DataChannelMessage(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::ConnectionStateChanged(s) => write!(f, "ConnectionStateChanged({s:?})"),
            PeerEvent::IceConnectionStateChanged(s) => {
                write!(f, "IceConnectionStateChanged({s:?})")
            }
            PeerEvent::Track(t) => write!(f, "Track({}, {})", t.kind, t.id),
            PeerEvent::DataChannel(c) => write!(f, "DataChannel({})", c.label()),
            PeerEvent::DataChannelMessage(m) => write!(f, "DataChannelMessage({m})"),
        }
    }
}

/// The client's session offer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub webrtc_id: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Offer {
    pub fn new(webrtc_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            webrtc_id: webrtc_id.into(),
            sdp: sdp.into(),
            kind: "offer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "answer".to_string(),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Applies the remote offer and produces the local answer.
    async fn negotiate(&self, offer: &Offer) -> ParleyResult<SessionDescription>;

    /// Registers a track whose frames are sent to the peer.
    fn add_track(&self, track: OutboundTrack) -> ParleyResult<()>;

    /// Closes the connection. Must be safe to call more than once.
    async fn close(&self);
}

/// A freshly created peer together with its event stream.
pub struct PeerHandle {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Bounded FIFO of outbound frames with a single producer and consumer.
///
/// `push` waits while the queue is full, which paces reply generation to the
/// transport. `clear` discards everything not yet sent.
pub struct FrameQueue {
    frames: Mutex<VecDeque<MediaFrame>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    closed: CancellationToken,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Appends a frame, waiting for space. Returns `false` once closed.
    pub async fn push(&self, frame: MediaFrame) -> bool {
        loop {
            let writable = self.writable.notified();
            if self.closed.is_cancelled() {
                return false;
            }
            {
                let mut frames = self.frames.lock();
                if frames.len() < self.capacity {
                    frames.push_back(frame);
                    drop(frames);
                    self.readable.notify_one();
                    return true;
                }
            }
            tokio::select! {
                _ = writable => {}
                _ = self.closed.cancelled() => return false,
            }
        }
    }

    /// Takes the next frame, waiting if empty. Returns `None` once closed.
    pub async fn pull(&self) -> Option<MediaFrame> {
        loop {
            let readable = self.readable.notified();
            if self.closed.is_cancelled() {
                return None;
            }
            let next = self.frames.lock().pop_front();
            if let Some(frame) = next {
                self.writable.notify_one();
                return Some(frame);
            }
            tokio::select! {
                _ = readable => {}
                _ = self.closed.cancelled() => return None,
            }
        }
    }

    /// Drops all queued frames and returns how many were discarded.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut frames = self.frames.lock();
            let n = frames.len();
            frames.clear();
            n
        };
        self.writable.notify_one();
        dropped
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(n: i16) -> MediaFrame {
        MediaFrame::Audio(AudioChunk::mono(24_000, vec![n; 4]))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = FrameQueue::new(8);
        for n in 0..3 {
            assert!(queue.push(frame(n)).await);
        }
        for n in 0..3 {
            assert_eq!(queue.pull().await, Some(frame(n)));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_waits_for_space() {
        let queue = Arc::new(FrameQueue::new(1));
        assert!(queue.push(frame(1)).await);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pull().await, Some(frame(1)));
        assert!(producer.await.unwrap());
        assert_eq!(queue.pull().await, Some(frame(2)));
    }

    #[tokio::test]
    async fn test_clear_discards_pending_and_frees_producer() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.push(frame(1)).await;
        queue.push(frame(2)).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.clear(), 2);
        assert!(producer.await.unwrap());
        assert_eq!(queue.pull().await, Some(frame(3)));
    }

    #[tokio::test]
    async fn test_close_unblocks_consumer() {
        let queue = Arc::new(FrameQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let pulled = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulled, None);
        assert!(!queue.push(frame(1)).await);
    }
}
