//! Turn-taking core for real-time voice sessions.
//!
//! The pieces compose bottom-up: a [`SpeechModel`] scores audio, a
//! [`PauseDetector`] turns scores into decisions, the [`TurnTakingEngine`]
//! buffers a turn and fires on pause, and the [`ReplyController`] drives the
//! user's reply generator. [`ReplyOnPause`] bundles them into a
//! [`StreamHandler`] that the session layer can copy per connection.

pub mod audio;
pub mod error;
pub mod handler;
pub mod options;
pub mod output;
pub mod pause;
pub mod protocol;
pub mod reply;
pub mod reply_on_pause;
pub mod turn;
pub mod vad;

pub use audio::{AudioChunk, Layout, VideoFrame};
pub use error::{ParleyError, ParleyResult};
pub use handler::{DataChannel, Emitted, HandlerBase, HandlerSettings, StreamHandler};
pub use options::{AlgoOptions, ModelOptions};
pub use output::{AdditionalOutputs, OutputUnit, QueueRead, SessionOutputQueue};
pub use pause::{Decision, PauseDetector};
pub use reply::{BlockingReply, ReplyController, ReplyFn, ReplyGenerator, SourceFn, StreamReply};
pub use reply_on_pause::{ReplyOnPause, ReplyOnPauseOptions};
pub use turn::{TurnState, TurnTakingEngine};
pub use vad::{RmsSpeechModel, SpeechModel};
