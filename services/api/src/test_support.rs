//! In-memory peers, channels and handlers for unit tests.

use crate::transport::{
    ConnectionState, InboundTrack, MediaFrame, Offer, OutboundTrack, PeerConnection, PeerEvent,
    PeerHandle, SessionDescription, TrackKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{
    AudioChunk, DataChannel, Emitted, HandlerBase, HandlerSettings, OutputUnit, ParleyError,
    ParleyResult, StreamHandler, protocol::ChatMessage, protocol::ServerMessage,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn raw(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn messages(&self) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }
}

impl DataChannel for RecordingChannel {
    fn label(&self) -> &str {
        "test"
    }

    fn is_open(&self) -> bool {
        true
    }

    fn send(&self, text: String) -> ParleyResult<()> {
        self.sent.lock().push(text);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPeer {
    pub negotiations: AtomicUsize,
    pub closes: AtomicUsize,
    pub tracks: Mutex<Vec<OutboundTrack>>,
    pub fail_negotiation: bool,
}

impl MockPeer {
    pub fn closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }

    pub fn outbound(&self, kind: TrackKind) -> Option<OutboundTrack> {
        self.tracks.lock().iter().find(|t| t.kind == kind).cloned()
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn negotiate(&self, offer: &Offer) -> ParleyResult<SessionDescription> {
        self.negotiations.fetch_add(1, Ordering::SeqCst);
        if self.fail_negotiation {
            return Err(ParleyError::Transport("bad offer".into()));
        }
        Ok(SessionDescription::answer(format!("answer-for-{}", offer.webrtc_id)))
    }

    fn add_track(&self, track: OutboundTrack) -> ParleyResult<()> {
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestPeer {
    pub peer: Arc<MockPeer>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

impl TestPeer {
    pub fn pair() -> (Self, PeerHandle) {
        Self::pair_with(MockPeer::default())
    }

    pub fn pair_with(peer: MockPeer) -> (Self, PeerHandle) {
        let peer = Arc::new(peer);
        let (events, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle {
            connection: peer.clone(),
            events: rx,
        };
        (Self { peer, events }, handle)
    }

    pub fn send(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn connect(&self) {
        self.send(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
    }

    /// Opens an inbound track and returns the sender feeding it.
    pub fn open_track(&self, kind: TrackKind) -> mpsc::Sender<MediaFrame> {
        let (tx, rx) = mpsc::channel(32);
        self.send(PeerEvent::Track(InboundTrack {
            id: format!("{kind}-in"),
            kind,
            frames: rx,
        }));
        tx
    }
}

/// Echoes every received frame as reply audio and counts lifecycle calls.
#[derive(Default)]
pub struct EchoHandler {
    base: HandlerBase,
    pending: Mutex<VecDeque<OutputUnit>>,
    pub copies: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
    pub chats: Arc<Mutex<Vec<ChatMessage>>>,
}

impl EchoHandler {
    /// Queues an output to be emitted on the next poll.
    pub fn queue(&self, unit: OutputUnit) {
        self.pending.lock().push_back(unit);
    }
}

#[async_trait]
impl StreamHandler for EchoHandler {
    fn copy(&self) -> Arc<dyn StreamHandler> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        Arc::new(EchoHandler {
            copies: self.copies.clone(),
            shutdowns: self.shutdowns.clone(),
            resets: self.resets.clone(),
            chats: self.chats.clone(),
            ..Default::default()
        })
    }

    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn settings(&self) -> HandlerSettings {
        HandlerSettings {
            input_sample_rate: 24_000,
            ..Default::default()
        }
    }

    fn receive(&self, frame: AudioChunk) -> ParleyResult<()> {
        self.queue(OutputUnit::Audio(frame));
        Ok(())
    }

    async fn emit(&self) -> ParleyResult<Emitted> {
        let next = self.pending.lock().pop_front();
        Ok(next.map(Emitted::Output).unwrap_or(Emitted::Idle))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.base.reset();
    }

    async fn on_chat(
        &self,
        message: ChatMessage,
        _channel: Arc<dyn DataChannel>,
    ) -> ParleyResult<()> {
        self.chats.lock().push(message);
        Ok(())
    }
}
