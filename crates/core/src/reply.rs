//! The emit half of reply-on-pause.
//!
//! User reply functions produce a [`ReplyGenerator`]: a pull-based source of
//! [`OutputUnit`]s. Blocking iterators and async streams are both supported
//! behind the same trait, so the [`ReplyController`] that drives a turn is
//! written once.

use crate::{
    audio::AudioChunk,
    error::{ParleyError, ParleyResult},
    handler::{Emitted, HandlerBase},
    output::OutputUnit,
    protocol::{PAUSE_DETECTED, RESPONSE_STARTING, ServerMessage},
};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an interrupted generator is given to release its resources.
pub const GENERATOR_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A pull-based source of reply output.
#[async_trait]
pub trait ReplyGenerator: Send {
    /// Produces the next unit, or `None` once the reply is exhausted.
    ///
    /// Must be cancel-safe: dropping the returned future and calling again
    /// resumes the same pull.
    async fn next_output(&mut self) -> Option<anyhow::Result<OutputUnit>>;

    /// Releases the generator. Callers bound this with a timeout.
    async fn close(self: Box<Self>);
}

type OutputIter = Box<dyn Iterator<Item = anyhow::Result<OutputUnit>> + Send>;
type IterFactory = Box<dyn FnOnce() -> OutputIter + Send>;

enum IterState {
    Pending(IterFactory),
    Running(OutputIter),
}

type Pull = (IterState, Option<anyhow::Result<OutputUnit>>);

/// Drives a blocking iterator on the blocking thread pool.
///
/// The iterator, and the closure that builds it, never run on a runtime worker.
pub struct BlockingReply {
    state: Option<IterState>,
    in_flight: Option<JoinHandle<Pull>>,
}

impl BlockingReply {
    pub fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = anyhow::Result<OutputUnit>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            state: Some(IterState::Running(Box::new(iter.into_iter()))),
            in_flight: None,
        }
    }

    /// Defers building the iterator to the first pull.
    pub fn deferred<F, I>(build: F) -> Self
    where
        F: FnOnce() -> I + Send + 'static,
        I: IntoIterator<Item = anyhow::Result<OutputUnit>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            state: Some(IterState::Pending(Box::new(move || {
                Box::new(build().into_iter()) as OutputIter
            }))),
            in_flight: None,
        }
    }
}

#[async_trait]
impl ReplyGenerator for BlockingReply {
    async fn next_output(&mut self) -> Option<anyhow::Result<OutputUnit>> {
        if self.in_flight.is_none() {
            let state = self.state.take()?;
            self.in_flight = Some(tokio::task::spawn_blocking(move || {
                let mut iter = match state {
                    IterState::Pending(build) => build(),
                    IterState::Running(iter) => iter,
                };
                let item = iter.next();
                (IterState::Running(iter), item)
            }));
        }
        let handle = self.in_flight.as_mut()?;
        let joined = handle.await;
        self.in_flight = None;
        match joined {
            Ok((state, item)) => {
                if item.is_some() {
                    self.state = Some(state);
                }
                item
            }
            Err(e) => Some(Err(anyhow!("reply iterator panicked: {e}"))),
        }
    }

    async fn close(self: Box<Self>) {
        let this = *self;
        if let Some(handle) = this.in_flight {
            let _ = handle.await;
        }
        if let Some(state) = this.state {
            let _ = tokio::task::spawn_blocking(move || drop(state)).await;
        }
    }
}

/// Wraps an async stream of outputs.
pub struct StreamReply {
    stream: BoxStream<'static, anyhow::Result<OutputUnit>>,
}

impl StreamReply {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<OutputUnit>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    /// For push-style producers: the reply ends when every sender is dropped.
    pub fn from_receiver(rx: mpsc::Receiver<anyhow::Result<OutputUnit>>) -> Self {
        Self::new(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl ReplyGenerator for StreamReply {
    async fn next_output(&mut self) -> Option<anyhow::Result<OutputUnit>> {
        self.stream.next().await
    }

    async fn close(self: Box<Self>) {
        drop(self);
    }
}

type ReplyFactory =
    dyn Fn(AudioChunk, Vec<Value>) -> anyhow::Result<Box<dyn ReplyGenerator>> + Send + Sync;

/// The user's reply function: speech audio plus inputs in, a generator out.
#[derive(Clone)]
pub struct ReplyFn {
    func: Arc<ReplyFactory>,
    needs_additional_inputs: bool,
}

impl ReplyFn {
    /// A reply built from a blocking function returning an iterator.
    pub fn blocking<F, I>(func: F) -> Self
    where
        F: Fn(AudioChunk, Vec<Value>) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = anyhow::Result<OutputUnit>> + 'static,
        I::IntoIter: Send + 'static,
    {
        let func = Arc::new(func);
        Self::from_factory(move |audio, args| {
            let func = func.clone();
            Ok(Box::new(BlockingReply::deferred(move || func(audio, args))))
        })
    }

    /// A reply built from a function returning an async stream.
    pub fn streaming<F, S>(func: F) -> Self
    where
        F: Fn(AudioChunk, Vec<Value>) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<OutputUnit>> + Send + 'static,
    {
        Self::from_factory(move |audio, args| Ok(Box::new(StreamReply::new(func(audio, args)))))
    }

    /// A reply that builds its own generator.
    pub fn from_factory<F>(func: F) -> Self
    where
        F: Fn(AudioChunk, Vec<Value>) -> anyhow::Result<Box<dyn ReplyGenerator>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            func: Arc::new(func),
            needs_additional_inputs: false,
        }
    }

    /// Declares that the function takes client-supplied inputs after the audio.
    pub fn with_additional_inputs(mut self) -> Self {
        self.needs_additional_inputs = true;
        self
    }

    pub fn needs_additional_inputs(&self) -> bool {
        self.needs_additional_inputs
    }

    pub fn call(
        &self,
        audio: AudioChunk,
        args: Vec<Value>,
    ) -> anyhow::Result<Box<dyn ReplyGenerator>> {
        (self.func)(audio, args)
    }
}

type SourceFactory = dyn Fn(Vec<Value>) -> anyhow::Result<Box<dyn ReplyGenerator>> + Send + Sync;

/// A generator source that takes no audio: startup greetings and
/// server-to-client streams.
#[derive(Clone)]
pub struct SourceFn {
    func: Arc<SourceFactory>,
    needs_additional_inputs: bool,
}

impl SourceFn {
    pub fn blocking<F, I>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = anyhow::Result<OutputUnit>> + 'static,
        I::IntoIter: Send + 'static,
    {
        let func = Arc::new(func);
        Self::from_factory(move |args| {
            let func = func.clone();
            Ok(Box::new(BlockingReply::deferred(move || func(args))))
        })
    }

    pub fn streaming<F, S>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<OutputUnit>> + Send + 'static,
    {
        Self::from_factory(move |args| Ok(Box::new(StreamReply::new(func(args)))))
    }

    pub fn from_factory<F>(func: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Box<dyn ReplyGenerator>> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            needs_additional_inputs: false,
        }
    }

    pub fn with_additional_inputs(mut self) -> Self {
        self.needs_additional_inputs = true;
        self
    }

    pub fn needs_additional_inputs(&self) -> bool {
        self.needs_additional_inputs
    }

    pub fn call(&self, args: Vec<Value>) -> anyhow::Result<Box<dyn ReplyGenerator>> {
        (self.func)(args)
    }
}

/// Closes `generator`, abandoning it if it overruns [`GENERATOR_CLOSE_TIMEOUT`].
pub async fn close_generator(generator: Box<dyn ReplyGenerator>) {
    if tokio::time::timeout(GENERATOR_CLOSE_TIMEOUT, generator.close())
        .await
        .is_err()
    {
        warn!(
            timeout_ms = GENERATOR_CLOSE_TIMEOUT.as_millis() as u64,
            "Reply generator did not close in time; abandoning it"
        );
    }
}

/// Progress of the reply for the current turn.
#[derive(Debug)]
pub struct TurnProgress {
    pub responded_audio: bool,
    pub stopped: bool,
    /// Cancelled when the turn is interrupted or the handler shuts down.
    pub interrupt: CancellationToken,
}

impl Default for TurnProgress {
    fn default() -> Self {
        Self {
            responded_audio: false,
            stopped: false,
            interrupt: CancellationToken::new(),
        }
    }
}

enum Pulled {
    Interrupted(AudioChunk),
    Item(Option<anyhow::Result<OutputUnit>>),
}

/// Turns pause events into reply output, one turn at a time.
pub struct ReplyController {
    reply_fn: ReplyFn,
    base: Arc<HandlerBase>,
    pauses: mpsc::UnboundedReceiver<AudioChunk>,
    pending: Option<AudioChunk>,
    generator: Option<Box<dyn ReplyGenerator>>,
    progress: TurnProgress,
    responding: Arc<AtomicBool>,
    can_interrupt: bool,
}

impl ReplyController {
    pub fn new(
        reply_fn: ReplyFn,
        base: Arc<HandlerBase>,
        can_interrupt: bool,
        responding: Arc<AtomicBool>,
        pauses: mpsc::UnboundedReceiver<AudioChunk>,
    ) -> Self {
        Self {
            reply_fn,
            base,
            pauses,
            pending: None,
            generator: None,
            progress: TurnProgress::default(),
            responding,
            can_interrupt,
        }
    }

    pub fn progress(&self) -> &TurnProgress {
        &self.progress
    }

    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::Acquire)
    }

    /// Installs the startup generator so the next `emit` starts pulling it.
    pub async fn start_up(&mut self, startup: &SourceFn) -> ParleyResult<()> {
        let args = Self::resolve_args(&self.base, startup.needs_additional_inputs()).await;
        let generator = startup.call(args).map_err(ParleyError::Generator)?;
        self.generator = Some(generator);
        self.progress = TurnProgress::default();
        Ok(())
    }

    /// Pulls the next unit of the current reply, starting one if a pause is
    /// waiting.
    pub async fn emit(&mut self) -> ParleyResult<Emitted> {
        if self.generator.is_some() {
            if self.can_interrupt {
                if let Ok(audio) = self.pauses.try_recv() {
                    self.interrupt(audio).await;
                    return Ok(Emitted::Interrupted);
                }
            }
        } else {
            let audio = match self.pending.take() {
                Some(audio) => audio,
                None => match self.pauses.try_recv() {
                    Ok(audio) => audio,
                    Err(_) => return Ok(Emitted::Idle),
                },
            };
            self.start_turn(audio).await?;
        }

        self.set_responding(true);
        let pulled = match self.generator.as_mut() {
            Some(generator) if self.can_interrupt => {
                tokio::select! {
                    biased;
                    Some(audio) = self.pauses.recv() => Pulled::Interrupted(audio),
                    item = generator.next_output() => Pulled::Item(item),
                }
            }
            Some(generator) => Pulled::Item(generator.next_output().await),
            None => return Ok(Emitted::Idle),
        };

        match pulled {
            Pulled::Interrupted(audio) => {
                self.interrupt(audio).await;
                Ok(Emitted::Interrupted)
            }
            Pulled::Item(Some(Ok(unit))) => {
                if unit.has_audio() && !self.progress.responded_audio {
                    self.progress.responded_audio = true;
                    self.base.send_message(&ServerMessage::log(RESPONSE_STARTING));
                }
                if self.base.phone_mode() {
                    if let Some(outputs) = unit.additional_outputs() {
                        if !outputs.is_empty() {
                            self.base.set_args(outputs.args().to_vec());
                        }
                    }
                }
                Ok(Emitted::Output(unit))
            }
            Pulled::Item(None) => {
                if !self.progress.responded_audio {
                    self.base.send_message(&ServerMessage::log(RESPONSE_STARTING));
                }
                debug!("Reply generator exhausted");
                self.reset();
                Ok(Emitted::TurnComplete)
            }
            Pulled::Item(Some(Err(e))) => {
                error!(error = ?e, "Reply generator failed");
                self.reset();
                Err(ParleyError::Generator(e))
            }
        }
    }

    /// Drops the current reply and any unstarted turn.
    pub fn reset(&mut self) {
        self.generator = None;
        self.pending = None;
        self.progress = TurnProgress::default();
        self.set_responding(false);
        self.base.reset();
    }

    /// Stops the current reply and closes its generator.
    pub async fn shutdown(&mut self) {
        self.progress.stopped = true;
        self.progress.interrupt.cancel();
        if let Some(generator) = self.generator.take() {
            close_generator(generator).await;
        }
        self.set_responding(false);
    }

    async fn start_turn(&mut self, audio: AudioChunk) -> ParleyResult<()> {
        self.base.send_message(&ServerMessage::log(PAUSE_DETECTED));
        let args =
            Self::resolve_args(&self.base, self.reply_fn.needs_additional_inputs()).await;
        debug!(duration = audio.duration_secs(), "Creating reply generator");
        match self.reply_fn.call(audio, args) {
            Ok(generator) => {
                self.generator = Some(generator);
                self.progress = TurnProgress::default();
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, "Reply function failed");
                self.reset();
                Err(ParleyError::Generator(e))
            }
        }
    }

    async fn resolve_args(base: &HandlerBase, needs_inputs: bool) -> Vec<Value> {
        if !needs_inputs {
            return Vec::new();
        }
        if !base.args().is_set() {
            if base.phone_mode() {
                base.set_args(vec![Value::Null]);
            } else {
                return base.wait_for_args().await;
            }
        }
        base.args().latest()
    }

    async fn interrupt(&mut self, audio: AudioChunk) {
        info!("New turn detected while replying; interrupting");
        self.progress.interrupt.cancel();
        if let Some(generator) = self.generator.take() {
            close_generator(generator).await;
        }
        self.progress = TurnProgress::default();
        self.set_responding(false);
        self.pending = Some(audio);
    }

    fn set_responding(&self, value: bool) {
        self.responding.store(value, Ordering::Release);
    }
}
