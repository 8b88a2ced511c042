//! Collaborator interfaces implemented outside the core.
//!
//! The orchestrator only ever talks to these traits; the real speech engines,
//! model backend and tool catalog live behind them. Test doubles and the
//! console driver provide their own implementations.

use crate::error::{RecognitionErrorKind, Result};
use crate::events::{ModelReply, Tone, ToolCall};
use async_trait::async_trait;

/// Events emitted by a recognizer implementation on its output channel.
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// Partial hypothesis; may be revised.
    Interim(String),
    /// Committed fragment.
    Final(String),
    /// Recognition failure.
    Error {
        /// Failure class, used to pick the recovery path.
        kind: RecognitionErrorKind,
        /// Human-readable description.
        message: String,
    },
}

/// Speech recognizer control surface.
///
/// Implementations emit [`RecognizerEvent`]s on the channel handed to them at
/// construction. `start`/`stop` scope *active utterance capture*; an
/// implementation may keep its underlying stream open while stopped so the
/// wake word is still heard (the turn-taking guard discards everything else).
/// Both calls must be idempotent.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Begin (or resume) capturing utterances.
    async fn start(&self) -> Result<()>;
    /// Pause utterance capture.
    async fn stop(&self) -> Result<()>;
}

/// Speech synthesis control surface.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text`; resolves when playback finishes or is cancelled.
    async fn speak(&self, text: &str) -> Result<()>;
    /// Cancel in-flight playback. No-op when nothing is playing.
    async fn cancel(&self) -> Result<()>;
}

/// One completed exchange, passed back to the model as history.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// What the user said.
    pub user: String,
    /// What the assistant answered.
    pub assistant: String,
}

/// Language-model client.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Produce a reply (and any tool calls) for the utterance.
    async fn chat(&self, text: &str, history: &[ChatTurn]) -> Result<ModelReply>;
}

/// Domain tool executor.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one tool call, returning its result as speakable text.
    async fn execute(&self, call: &ToolCall) -> Result<String>;
}

/// Shared audio output owned by the host platform.
#[async_trait]
pub trait AudioControl: Send + Sync {
    /// Duck (true) or restore (false) system output volume.
    async fn duck(&self, ducked: bool) -> Result<()>;
    /// Play a short cue tone.
    async fn play_tone(&self, tone: Tone) -> Result<()>;
}

/// Platform hooks for supervised recovery.
#[async_trait]
pub trait PlatformControl: Send + Sync {
    /// Restart the language-model backend process.
    async fn restart_model_backend(&self) -> Result<()>;
}
