//! A [`PeerConnection`] carried over a single WebSocket.
//!
//! The upgrade request is the offer. Once the orchestrator admits it, the
//! socket's declared inbound tracks, a data channel and a `Connected` state
//! are reported as peer events, in that order.

use super::protocol::{WireMessage, decode_video};
use crate::{
    audio_utils::{pcm16_from_le_bytes, pcm16_to_le_bytes},
    transport::{
        ConnectionState, InboundTrack, MediaFrame, Offer, OutboundTrack, PeerConnection,
        PeerEvent, PeerHandle, SessionDescription, TrackKind,
    },
};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parley_core::{AudioChunk, DataChannel, ParleyError, ParleyResult};
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use utoipa::IntoParams;

/// Inbound frames buffered per track before new ones are dropped.
const INBOUND_TRACK_FRAMES: usize = 64;

/// How far ahead of real time outbound audio may be written to the socket.
pub const PLAYOUT_LEAD: Duration = Duration::from_millis(200);

/// Query parameters of `GET /ws/{webrtc_id}`.
#[derive(Debug, Clone, Deserialize, IntoParams)]
pub struct TransportParams {
    /// Sample rate of the client's binary audio frames.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Comma-separated inbound tracks: `audio`, `video` or both.
    #[serde(default = "default_tracks")]
    pub tracks: String,
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_channels() -> u16 {
    1
}

fn default_tracks() -> String {
    "audio".to_string()
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            tracks: default_tracks(),
        }
    }
}

impl TransportParams {
    pub fn track_kinds(&self) -> Result<Vec<TrackKind>, String> {
        let mut kinds = Vec::new();
        for name in self.tracks.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = match name {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                other => return Err(format!("unknown track kind '{other}'")),
            };
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be positive".to_string());
        }
        if !(1..=2).contains(&self.channels) {
            return Err("channels must be 1 or 2".to_string());
        }
        self.track_kinds().map(|_| ())
    }

    fn describe(&self) -> String {
        format!(
            "ws tracks={} sample_rate={} channels={}",
            self.tracks, self.sample_rate, self.channels
        )
    }
}

/// Tracks how much audio the client has buffered so writes stay close to
/// real time.
#[derive(Debug)]
struct PlayoutClock {
    lead: Duration,
    buffered_until: Option<Instant>,
}

impl PlayoutClock {
    fn new(lead: Duration) -> Self {
        Self {
            lead,
            buffered_until: None,
        }
    }

    /// Accounts for `duration` of audio written at `now` and returns how long
    /// to wait before writing it.
    fn schedule(&mut self, now: Instant, duration: Duration) -> Duration {
        let start = match self.buffered_until {
            Some(until) if until > now => until,
            _ => now,
        };
        self.buffered_until = Some(start + duration);
        (start - now).saturating_sub(self.lead)
    }
}

pub struct WsPeer {
    outgoing: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
}

impl WsPeer {
    fn send(&self, message: &WireMessage) -> ParleyResult<()> {
        let text = message.to_json()?;
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| ParleyError::ChannelClosed("websocket"))
    }
}

#[async_trait]
impl PeerConnection for WsPeer {
    async fn negotiate(&self, offer: &Offer) -> ParleyResult<SessionDescription> {
        let answer = SessionDescription::answer(format!("parley {}", offer.sdp));
        self.send(&WireMessage::Answer {
            sdp: answer.sdp.clone(),
        })?;
        Ok(answer)
    }

    fn add_track(&self, track: OutboundTrack) -> ParleyResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Transport("peer is closed".into()));
        }
        tokio::spawn(
            pump_outbound(track, self.outgoing.clone(), self.shutdown.clone()).in_current_span(),
        );
        Ok(())
    }

    async fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing WebSocket peer");
            self.shutdown.cancel();
        }
    }
}

/// Writes one outbound track to the socket, pacing audio to real time.
async fn pump_outbound(
    track: OutboundTrack,
    outgoing: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
) {
    let mut format = None;
    let mut clock = PlayoutClock::new(PLAYOUT_LEAD);
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = track.queue.pull() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let message = match frame {
            MediaFrame::Audio(chunk) => {
                if format != Some((chunk.sample_rate, chunk.channels)) {
                    format = Some((chunk.sample_rate, chunk.channels));
                    let notice = WireMessage::AudioFormat {
                        sample_rate: chunk.sample_rate,
                        channels: chunk.channels,
                    };
                    match notice.to_json() {
                        Ok(text) => {
                            if outgoing.send(Message::Text(text.into())).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Cannot encode audio format"),
                    }
                }
                let duration =
                    Duration::try_from_secs_f32(chunk.duration_secs()).unwrap_or_default();
                let wait = clock.schedule(Instant::now(), duration);
                if !wait.is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Message::Binary(Bytes::from(pcm16_to_le_bytes(&chunk.samples)))
            }
            MediaFrame::Video(frame) => match WireMessage::video(&frame).to_json() {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    warn!(error = %e, "Cannot encode video frame");
                    continue;
                }
            },
        };
        if outgoing.send(message).is_err() {
            break;
        }
    }
    track.queue.close();
    debug!(kind = %track.kind, "Outbound track stopped");
}

/// The data channel of a WebSocket peer: JSON text frames of kind `data`.
pub struct WsDataChannel {
    outgoing: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
}

impl DataChannel for WsDataChannel {
    fn label(&self) -> &str {
        "text"
    }

    fn is_open(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.outgoing.is_closed()
    }

    fn send(&self, text: String) -> ParleyResult<()> {
        let json = WireMessage::data(text).to_json()?;
        self.outgoing
            .send(Message::Text(json.into()))
            .map_err(|_| ParleyError::ChannelClosed("websocket"))
    }
}

/// The socket side of a [`WsPeer`], run after the offer is answered.
pub struct WsTransport {
    peer: Arc<WsPeer>,
    params: TransportParams,
    events: mpsc::UnboundedSender<PeerEvent>,
    outgoing: mpsc::UnboundedReceiver<Message>,
}

impl WsTransport {
    pub fn new(params: TransportParams) -> (Self, PeerHandle) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(WsPeer {
            outgoing: outgoing_tx,
            shutdown: CancellationToken::new(),
        });
        let handle = PeerHandle {
            connection: peer.clone(),
            events: events_rx,
        };
        (
            Self {
                peer,
                params,
                events: events_tx,
                outgoing: outgoing_rx,
            },
            handle,
        )
    }

    /// The offer this socket represents.
    pub fn offer(&self, webrtc_id: impl Into<String>) -> Offer {
        Offer::new(webrtc_id, self.params.describe())
    }

    /// Sends a single message and closes the socket, for offers that were
    /// not admitted.
    pub async fn refuse(mut socket: WebSocket, message: WireMessage) {
        match message.to_json() {
            Ok(text) => {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            Err(e) => warn!(error = %e, "Cannot encode refusal"),
        }
        let _ = socket.send(Message::Close(None)).await;
    }

    /// Drives the socket until either side closes it.
    pub async fn run(self, socket: WebSocket) {
        let WsTransport {
            peer,
            params,
            events,
            mut outgoing,
        } = self;
        let (mut sink, mut stream) = socket.split();

        let shutdown = peer.shutdown.clone();
        let writer = tokio::spawn(
            async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        message = outgoing.recv() => message,
                        _ = shutdown.cancelled() => None,
                    };
                    let Some(message) = message else {
                        break;
                    };
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
            }
            .in_current_span(),
        );

        let mut audio_tx = None;
        let mut video_tx = None;
        for kind in params.track_kinds().unwrap_or_default() {
            let (tx, rx) = mpsc::channel(INBOUND_TRACK_FRAMES);
            let _ = events.send(PeerEvent::Track(InboundTrack {
                id: format!("{kind}-0"),
                kind,
                frames: rx,
            }));
            match kind {
                TrackKind::Audio => audio_tx = Some(tx),
                TrackKind::Video => video_tx = Some(tx),
            }
        }
        let channel: Arc<dyn DataChannel> = Arc::new(WsDataChannel {
            outgoing: peer.outgoing.clone(),
            shutdown: peer.shutdown.clone(),
        });
        let _ = events.send(PeerEvent::DataChannel(channel));
        let _ = events.send(PeerEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        ));
        info!("WebSocket peer connected");

        loop {
            let message = tokio::select! {
                _ = peer.shutdown.cancelled() => break,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(Message::Binary(bytes))) => {
                    let Some(tx) = &audio_tx else {
                        debug!("Ignoring audio; no inbound audio track declared");
                        continue;
                    };
                    let chunk = AudioChunk {
                        sample_rate: params.sample_rate,
                        channels: params.channels,
                        samples: pcm16_from_le_bytes(&bytes),
                    };
                    if tx.try_send(MediaFrame::Audio(chunk)).is_err() {
                        debug!("Inbound audio backlog; dropping frame");
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<WireMessage>(text.as_str()) {
                    Ok(WireMessage::Video {
                        width,
                        height,
                        data,
                    }) => {
                        let Some(tx) = &video_tx else {
                            debug!("Ignoring video; no inbound video track declared");
                            continue;
                        };
                        match decode_video(width, height, &data) {
                            Ok(frame) => {
                                if tx.try_send(MediaFrame::Video(frame)).is_err() {
                                    debug!("Inbound video backlog; dropping frame");
                                }
                            }
                            Err(e) => warn!(error = %e, "Dropping malformed video frame"),
                        }
                    }
                    Ok(WireMessage::Data { payload }) => {
                        let raw = match payload {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        let _ = events.send(PeerEvent::DataChannelMessage(raw));
                    }
                    _ => {
                        let _ = events.send(PeerEvent::DataChannelMessage(text.as_str().to_owned()));
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the WebSocket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = ?e, "Error receiving from client WebSocket");
                    break;
                }
            }
        }

        drop(audio_tx);
        drop(video_tx);
        let _ = events.send(PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
        peer.shutdown.cancel();
        let _ = writer.await;
    }
}
