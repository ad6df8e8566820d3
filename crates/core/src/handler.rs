//! The per-session event handler contract.
//!
//! A [`StreamHandler`] is registered once as a prototype; the session layer
//! calls [`StreamHandler::copy`] for every new connection so that no mutable
//! state is ever shared between sessions.

use crate::{
    audio::{AudioChunk, Layout, VideoFrame},
    error::ParleyResult,
    output::OutputUnit,
    protocol::{ChatMessage, ServerMessage},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Outgoing side of a peer's data channel.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Queues a text message for delivery. Never blocks.
    fn send(&self, text: String) -> ParleyResult<()>;
}

/// Media settings a handler expects the track layer to honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    pub expected_layout: Layout,
    pub output_sample_rate: u32,
    /// Samples per outbound audio frame.
    pub output_frame_size: usize,
    /// Inbound audio is resampled to this rate before `receive`.
    pub input_sample_rate: u32,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            expected_layout: Layout::Mono,
            output_sample_rate: 24_000,
            output_frame_size: 480,
            input_sample_rate: 48_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ArgsState {
    values: Vec<Value>,
    fresh: bool,
}

/// Auxiliary inputs supplied by the client alongside the media stream.
///
/// Values persist across turns; the `fresh` flag records whether they were
/// supplied since the last reset, which is what reply construction waits on.
pub struct InputArgs {
    tx: watch::Sender<ArgsState>,
}

impl Default for InputArgs {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(ArgsState::default()),
        }
    }
}

impl InputArgs {
    pub fn set(&self, values: Vec<Value>) {
        self.tx.send_replace(ArgsState {
            values,
            fresh: true,
        });
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().fresh
    }

    pub fn latest(&self) -> Vec<Value> {
        self.tx.borrow().values.clone()
    }

    /// Marks the current values as stale without discarding them.
    pub fn clear(&self) {
        self.tx.send_modify(|state| state.fresh = false);
    }

    /// Waits until values are supplied and returns them.
    pub async fn wait(&self) -> Vec<Value> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|state| state.fresh).await {
            Ok(state) => state.values.clone(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => Vec::new(),
        }
    }
}

/// State every stream handler carries: inputs, the data channel and mode flags.
#[derive(Default)]
pub struct HandlerBase {
    args: InputArgs,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    phone_mode: AtomicBool,
}

impl HandlerBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn args(&self) -> &InputArgs {
        &self.args
    }

    pub fn set_args(&self, args: Vec<Value>) {
        self.args.set(args);
    }

    pub fn set_channel(&self, channel: Arc<dyn DataChannel>) {
        *self.channel.lock() = Some(channel);
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.lock().clone()
    }

    pub fn clear_channel(&self) {
        self.channel.lock().take();
    }

    /// Phone mode never waits for client inputs; there is no UI to supply them.
    pub fn set_phone_mode(&self, enabled: bool) {
        self.phone_mode.store(enabled, Ordering::Release);
        if enabled {
            self.args.tx.send_modify(|state| state.fresh = true);
        }
    }

    pub fn phone_mode(&self) -> bool {
        self.phone_mode.load(Ordering::Acquire)
    }

    /// Sends a control message to the peer if a data channel is open.
    pub fn send_message(&self, message: &ServerMessage) {
        let Some(channel) = self.channel() else {
            return;
        };
        if !channel.is_open() {
            return;
        }
        match message.to_json() {
            Ok(text) => {
                if let Err(e) = channel.send(text) {
                    debug!(error = %e, "Failed to send data channel message");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode data channel message"),
        }
    }

    /// Asks the peer for inputs and waits until they arrive.
    pub async fn wait_for_args(&self) -> Vec<Value> {
        self.send_message(&ServerMessage::SendInput(Vec::new()));
        self.args.wait().await
    }

    pub fn reset(&self) {
        if !self.phone_mode() {
            self.args.clear();
        }
    }
}

/// Result of one [`StreamHandler::emit`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    /// No turn is ready; poll again at the next frame.
    Idle,
    Output(OutputUnit),
    /// The in-flight reply was abandoned for a new turn; drop unsent output.
    Interrupted,
    /// The reply for the current turn is exhausted.
    TurnComplete,
}

/// A stateful audio (and optionally video) handler bound to one session.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Creates an independent instance for a new session.
    fn copy(&self) -> Arc<dyn StreamHandler>;

    fn base(&self) -> &HandlerBase;

    fn settings(&self) -> HandlerSettings;

    /// Consumes one inbound audio frame. Must not block.
    fn receive(&self, frame: AudioChunk) -> ParleyResult<()>;

    /// Produces the next outbound unit, if any.
    async fn emit(&self) -> ParleyResult<Emitted>;

    /// Ticks whenever a new turn cuts off the reply in flight.
    ///
    /// The track layer watches this while it pushes reply audio out, so
    /// queued output is dropped as soon as the user interrupts rather than
    /// at the next `emit`.
    fn interruptions(&self) -> Option<watch::Receiver<u64>> {
        None
    }

    /// Whether `receive` currently consumes audio. While `false`, callers
    /// may skip any preprocessing of inbound frames.
    fn accepts_audio(&self) -> bool {
        true
    }

    async fn start_up(&self) -> ParleyResult<()> {
        Ok(())
    }

    async fn shutdown(&self) {}

    async fn reset(&self) {
        self.base().reset();
    }

    fn set_args(&self, args: Vec<Value>) {
        self.base().set_args(args);
    }

    fn set_channel(&self, channel: Arc<dyn DataChannel>) {
        self.base().set_channel(channel);
    }

    /// Hook for `chat` / `stop_chat` data-channel messages.
    async fn on_chat(
        &self,
        message: ChatMessage,
        _channel: Arc<dyn DataChannel>,
    ) -> ParleyResult<()> {
        debug!(kind = %message.kind, "Ignoring chat message; handler has no chat hook");
        Ok(())
    }

    async fn video_receive(&self, _frame: VideoFrame) -> ParleyResult<()> {
        Ok(())
    }

    async fn video_emit(&self) -> ParleyResult<Option<VideoFrame>> {
        Ok(None)
    }
}
