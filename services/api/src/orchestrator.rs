//! Session orchestration: admission, per-session wiring and teardown.
//!
//! Every session is keyed by its `webrtc_id`. Its lifetime is driven by a
//! single event-pump task that reacts to peer events in arrival order; every
//! exit path funnels into [`Orchestrator::clean_up`], which is idempotent.

use crate::{
    config::{Modality, Mode, SessionConfig},
    models::SessionInfo,
    tracks::{
        AudioCallback, OutputSink, ServerToClient, SessionHandler, VideoCallback, VideoFn,
        VideoStreamCallback,
    },
    transport::{
        ConnectionState, FrameQueue, IceConnectionState, InboundTrack, Offer, OutboundTrack,
        PeerConnection, PeerEvent, PeerHandle, SessionDescription, TrackKind,
    },
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use parley_core::{
    AdditionalOutputs, HandlerBase, HandlerSettings, ParleyError, ParleyResult, QueueRead,
    SessionOutputQueue, SourceFn, StreamHandler,
    protocol::{AdmissionRejection, ControlMessage, ServerMessage, parse_control_message},
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Upper bound on a single read from a session's output queue.
pub const OUTPUT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames buffered ahead of the transport.
const OUTBOUND_QUEUE_FRAMES: usize = 32;

/// The application's handler, copied once per admitted session.
#[derive(Clone)]
pub enum EventHandler {
    Stream(Arc<dyn StreamHandler>),
    Video(VideoFn),
    Source(SourceFn),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    Answer(SessionDescription),
    Rejected(AdmissionRejection),
}

struct Session {
    webrtc_id: String,
    peer: Arc<dyn PeerConnection>,
    handler: SessionHandler,
    outputs: Arc<SessionOutputQueue>,
    outbound: Mutex<Vec<Arc<FrameQueue>>>,
    /// Cancelled on teardown; every session task observes it.
    stop: CancellationToken,
    /// Cancelled once the peer reports `Connected`.
    connected: CancellationToken,
    created_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
}

impl Session {
    fn sink(&self) -> OutputSink {
        OutputSink::new(self.outputs.clone(), self.handler.clone())
    }

    /// Creates an outbound queue and registers it with the peer.
    fn open_outbound(&self, kind: TrackKind) -> ParleyResult<Arc<FrameQueue>> {
        let queue = Arc::new(FrameQueue::new(OUTBOUND_QUEUE_FRAMES));
        self.peer.add_track(OutboundTrack {
            kind,
            queue: queue.clone(),
        })?;
        self.outbound.lock().push(queue.clone());
        Ok(queue)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            webrtc_id: self.webrtc_id.clone(),
            state: *self.state.lock(),
            created_at: self.created_at,
        }
    }
}

pub struct Orchestrator {
    handler: EventHandler,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Orchestrator {
    /// Validates the handler against the configured modality and mode.
    pub fn new(handler: EventHandler, config: SessionConfig) -> ParleyResult<Self> {
        match (&handler, config.mode, config.modality) {
            (EventHandler::Source(_), Mode::Receive, Modality::Audio | Modality::Video) => {}
            (_, Mode::Receive, _) => {
                return Err(ParleyError::Config(
                    "receive mode needs a source function and an audio or video modality".into(),
                ));
            }
            (EventHandler::Source(_), _, _) => {
                return Err(ParleyError::Config(
                    "source functions are only valid in receive mode".into(),
                ));
            }
            (EventHandler::Video(_), _, Modality::Video) => {}
            (EventHandler::Stream(_), _, Modality::Audio | Modality::AudioVideo) => {}
            (_, _, modality) => {
                return Err(ParleyError::Config(format!(
                    "handler kind does not match {modality:?} modality"
                )));
            }
        }
        Ok(Self {
            handler,
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    fn copy_handler(&self) -> SessionHandler {
        match &self.handler {
            EventHandler::Stream(handler) => SessionHandler::Stream(handler.copy()),
            EventHandler::Video(func) => SessionHandler::Video {
                func: func.clone(),
                base: Arc::new(HandlerBase::new()),
            },
            EventHandler::Source(func) => SessionHandler::Source {
                func: func.clone(),
                base: Arc::new(HandlerBase::new()),
            },
        }
    }

    fn session(&self, webrtc_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(webrtc_id).cloned()
    }

    /// Admits or rejects an offer, then wires the session and answers it.
    ///
    /// A rejected offer never reaches the peer: no handshake happens and no
    /// handler is bound.
    #[instrument(skip_all, fields(webrtc_id = %offer.webrtc_id))]
    pub async fn handle_offer(
        self: &Arc<Self>,
        offer: Offer,
        peer: PeerHandle,
    ) -> ParleyResult<OfferOutcome> {
        let PeerHandle { connection, events } = peer;

        let session = {
            let mut sessions = self.sessions.lock();
            if let Some(limit) = self.config.concurrency_limit {
                if sessions.len() >= limit {
                    warn!(limit, "Rejecting offer; concurrency limit reached");
                    return Ok(OfferOutcome::Rejected(
                        AdmissionRejection::concurrency_limit_reached(limit),
                    ));
                }
            }
            if sessions.contains_key(&offer.webrtc_id) {
                return Err(ParleyError::DuplicateSession(offer.webrtc_id.clone()));
            }
            let session = Arc::new(Session {
                webrtc_id: offer.webrtc_id.clone(),
                peer: connection,
                handler: self.copy_handler(),
                outputs: Arc::new(SessionOutputQueue::new()),
                outbound: Mutex::new(Vec::new()),
                stop: CancellationToken::new(),
                connected: CancellationToken::new(),
                created_at: Utc::now(),
                state: Mutex::new(ConnectionState::New),
            });
            sessions.insert(offer.webrtc_id.clone(), session.clone());
            session
        };

        tokio::spawn(
            self.clone()
                .pump_events(session.clone(), events)
                .in_current_span(),
        );

        if self.config.mode == Mode::Receive {
            if let Err(e) = self.start_source(&session) {
                error!(error = ?e, "Could not start server-to-client track");
                self.close_session(&session).await;
                return Err(e);
            }
        }

        let answer = match session.peer.negotiate(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = ?e, "Negotiation failed");
                self.close_session(&session).await;
                return Err(e);
            }
        };

        self.arm_connection_timeout(&session);
        info!(active = self.active_sessions(), "Session admitted");
        Ok(OfferOutcome::Answer(answer))
    }

    fn start_source(self: &Arc<Self>, session: &Arc<Session>) -> ParleyResult<()> {
        let SessionHandler::Source { func, base } = &session.handler else {
            return Err(ParleyError::Config(
                "receive mode needs a source function".into(),
            ));
        };
        let kind = match self.config.modality {
            Modality::Audio => TrackKind::Audio,
            Modality::Video => TrackKind::Video,
            Modality::AudioVideo => {
                return Err(ParleyError::Config(
                    "receive mode supports a single audio or video track".into(),
                ));
            }
        };
        let queue = session.open_outbound(kind)?;
        let source = ServerToClient::new(
            func.clone(),
            base.clone(),
            session.sink(),
            kind,
            queue,
            HandlerSettings::default().output_frame_size,
            session.stop.clone(),
            session.connected.clone(),
        );

        let orchestrator = self.clone();
        let session = session.clone();
        tokio::spawn(
            async move {
                if source.run().await {
                    info!("Source finished; closing session");
                    orchestrator.close_session(&session).await;
                }
            }
            .in_current_span(),
        );
        Ok(())
    }

    fn arm_connection_timeout(self: &Arc<Self>, session: &Arc<Session>) {
        let timeout = self.config.connection_timeout;
        let orchestrator = self.clone();
        let session = session.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = session.stop.cancelled() => {}
                    _ = session.connected.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout_ms = timeout.as_millis() as u64, "Peer never connected");
                        orchestrator.close_session(&session).await;
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn arm_time_limit(self: &Arc<Self>, session: &Arc<Session>) {
        let Some(limit) = self.config.time_limit else {
            return;
        };
        let orchestrator = self.clone();
        let session = session.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = session.stop.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        info!(limit_secs = limit.as_secs_f64(), "Session time limit reached");
                        orchestrator.close_session(&session).await;
                    }
                }
            }
            .in_current_span(),
        );
    }

    async fn pump_events(
        self: Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = session.stop.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle_event(&session, event).await,
                None => {
                    debug!("Peer event stream ended");
                    self.close_session(&session).await;
                    break;
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, session: &Arc<Session>, event: PeerEvent) {
        match event {
            PeerEvent::ConnectionStateChanged(state) => {
                *session.state.lock() = state;
                info!(?state, "Connection state changed");
                match state {
                    ConnectionState::Connected => {
                        session.connected.cancel();
                        self.arm_time_limit(session);
                    }
                    ConnectionState::Failed | ConnectionState::Closed => {
                        self.close_session(session).await;
                    }
                    _ => {}
                }
            }
            PeerEvent::IceConnectionStateChanged(state) => {
                debug!(?state, "ICE connection state changed");
                if state == IceConnectionState::Failed {
                    self.close_session(session).await;
                }
            }
            PeerEvent::Track(track) => {
                let (kind, id) = (track.kind, track.id.clone());
                if let Err(e) = self.attach_track(session, track) {
                    error!(error = ?e, %kind, track = %id, "Cannot route inbound track");
                    session
                        .handler
                        .base()
                        .send_message(&ServerMessage::Error(e.to_string()));
                    self.close_session(session).await;
                } else {
                    info!(%kind, track = %id, "Track attached");
                }
            }
            PeerEvent::DataChannel(channel) => {
                debug!(label = channel.label(), "Data channel opened");
                session.handler.set_channel(channel);
            }
            PeerEvent::DataChannelMessage(raw) => self.handle_channel_message(session, &raw),
        }
    }

    fn attach_track(&self, session: &Arc<Session>, track: InboundTrack) -> ParleyResult<()> {
        if self.config.mode == Mode::Receive {
            return Err(ParleyError::Config(
                "receive-only sessions do not accept inbound tracks".into(),
            ));
        }
        let send_back = self.config.mode == Mode::SendReceive;
        let stop = session.stop.clone();

        match (&session.handler, self.config.modality, track.kind) {
            (SessionHandler::Video { func, base }, Modality::Video, TrackKind::Video) => {
                let outbound = if send_back {
                    Some(session.open_outbound(TrackKind::Video)?)
                } else {
                    None
                };
                VideoCallback::new(func.clone(), base.clone(), session.sink(), outbound, stop)
                    .spawn(track);
            }
            (SessionHandler::Stream(handler), Modality::AudioVideo, TrackKind::Video) => {
                let outbound = if send_back {
                    Some(session.open_outbound(TrackKind::Video)?)
                } else {
                    None
                };
                VideoStreamCallback::new(handler.clone(), outbound, stop).spawn(track);
            }
            (
                SessionHandler::Stream(handler),
                Modality::Audio | Modality::AudioVideo,
                TrackKind::Audio,
            ) => {
                let outbound = if send_back {
                    Some(session.open_outbound(TrackKind::Audio)?)
                } else {
                    None
                };
                AudioCallback::new(handler.clone(), session.sink(), outbound, stop).spawn(track);
            }
            (_, modality, kind) => {
                return Err(ParleyError::Config(format!(
                    "no handler for a {kind} track in a {modality:?} session"
                )));
            }
        }
        Ok(())
    }

    fn handle_channel_message(&self, session: &Session, raw: &str) {
        let base = session.handler.base();
        match parse_control_message(raw) {
            Ok(ControlMessage::Chat(message)) | Ok(ControlMessage::StopChat(message)) => {
                let (SessionHandler::Stream(handler), Some(channel)) =
                    (&session.handler, base.channel())
                else {
                    debug!(kind = %message.kind, "No chat handler for this session");
                    return;
                };
                let handler = handler.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = handler.on_chat(message, channel).await {
                            error!(error = ?e, "Chat handler failed");
                            handler
                                .base()
                                .send_message(&ServerMessage::Error(e.to_string()));
                        }
                    }
                    .in_current_span(),
                );
            }
            Ok(ControlMessage::Other(_)) => {
                base.send_message(&ServerMessage::log(format!("Server received: {raw}")));
            }
            Err(e) => warn!(error = %e, "Dropping malformed data channel message"),
        }
    }

    async fn close_session(&self, session: &Arc<Session>) {
        session.peer.close().await;
        self.remove_and_release(&session.webrtc_id, Some(session)).await;
    }

    /// Tears down a session. Returns whether this call did the teardown;
    /// repeated or concurrent calls are no-ops.
    ///
    /// The peer connection itself is left to the caller.
    pub async fn clean_up(&self, webrtc_id: &str) -> bool {
        self.remove_and_release(webrtc_id, None).await
    }

    /// Removes the live entry for `webrtc_id` and releases it. With
    /// `expected`, only that exact session is removed, so a task of an
    /// earlier session never tears down a newer one under the same id.
    async fn remove_and_release(&self, webrtc_id: &str, expected: Option<&Arc<Session>>) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let current = match (sessions.get(webrtc_id), expected) {
                (Some(live), Some(expected)) => Arc::ptr_eq(live, expected),
                (live, None) => live.is_some(),
                (None, Some(_)) => false,
            };
            if current {
                sessions.remove(webrtc_id)
            } else {
                None
            }
        };
        let Some(session) = removed else {
            return false;
        };
        Self::release(&session).await;
        true
    }

    async fn release(session: &Session) {
        session.stop.cancel();
        let outbound = std::mem::take(&mut *session.outbound.lock());
        for queue in outbound {
            queue.close();
        }
        match &session.handler {
            SessionHandler::Stream(handler) => {
                handler.shutdown().await;
                handler.reset().await;
            }
            other => other.base().reset(),
        }
        session.outputs.quit();
        session.handler.base().clear_channel();
        info!(webrtc_id = %session.webrtc_id, "Session cleaned up");
    }

    /// Delivers auxiliary inputs to a live session.
    pub fn set_input(&self, webrtc_id: &str, args: Vec<Value>) -> bool {
        match self.session(webrtc_id) {
            Some(session) => {
                session.handler.set_args(args);
                true
            }
            None => false,
        }
    }

    /// Streams additional outputs until the session is cleaned up.
    pub fn output_stream(&self, webrtc_id: &str) -> Option<BoxStream<'static, AdditionalOutputs>> {
        let outputs = self.session(webrtc_id)?.outputs.clone();
        let stream = stream::unfold(outputs, |outputs| async move {
            loop {
                match outputs.next(OUTPUT_READ_TIMEOUT).await {
                    QueueRead::Item(item) => return Some((item, outputs)),
                    QueueRead::Empty => continue,
                    QueueRead::Closed => return None,
                }
            }
        });
        Some(stream.boxed())
    }

    /// A single bounded read from the session's output queue.
    pub async fn fetch_latest_output(
        &self,
        webrtc_id: &str,
        timeout: Duration,
    ) -> Option<QueueRead<AdditionalOutputs>> {
        let outputs = self.session(webrtc_id)?.outputs.clone();
        Some(outputs.next(timeout).await)
    }
}
