//! Event and action types passed between the orchestrator and its collaborators.
//!
//! Every input the core reacts to is a variant of [`ConversationEvent`], and
//! every effect it requests is a variant of [`Action`]. Both are closed sum
//! types matched exhaustively — adding a state or event forces every switch
//! site to be revisited.

use serde::{Deserialize, Serialize};

/// A single tool invocation requested by the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name as registered with the tool executor.
    pub name: String,
    /// JSON arguments, passed through to the executor untouched.
    pub arguments: serde_json::Value,
}

/// A reply from the language model (or the reflex path folded into its shape).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelReply {
    /// Assistant text to speak.
    pub text: String,
    /// Tool calls to execute before speaking, in order.
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    /// A plain spoken reply with no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Events fed into the conversation state machine.
///
/// Recognizer callbacks, timers, model/tool completions and UI injections all
/// arrive through this one type, serialized into a single queue.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// Wake word heard (or wake button pressed) while idle.
    Wake,
    /// A complete user utterance, batched by the turn-taking guard.
    FinalTranscript(String),
    /// User speech that interrupts an in-progress assistant utterance.
    BargeIn(String),
    /// Pure stop request: cancel speech and fall back to listening or idle.
    Interrupt,
    /// The language model (or reflex path) produced a reply.
    ModelResponse(ModelReply),
    /// The language model request failed.
    ModelError(String),
    /// Speech playback finished.
    SpeechEnd,
    /// A tool finished with the given result text.
    ToolResult(String),
    /// A tool failed with the given error text.
    ToolError(String),
    /// The current state's timeout fired. Carries the timeout generation so
    /// timers armed for an already-left state are ignored.
    Timeout(u64),
    /// Explicit recovery request while in the error state.
    Recover,
    /// Explicit request to end the conversation and go idle.
    Sleep,
}

impl ConversationEvent {
    /// Short label for diagnostics and the transition history ring.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Wake => "wake",
            Self::FinalTranscript(_) => "final_transcript",
            Self::BargeIn(_) => "barge_in",
            Self::Interrupt => "interrupt",
            Self::ModelResponse(_) => "model_response",
            Self::ModelError(_) => "model_error",
            Self::SpeechEnd => "speech_end",
            Self::ToolResult(_) => "tool_result",
            Self::ToolError(_) => "tool_error",
            Self::Timeout(_) => "timeout",
            Self::Recover => "recover",
            Self::Sleep => "sleep",
        }
    }
}

/// Audio cues played at conversation boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Conversation opened.
    Wake,
    /// Conversation closed.
    Sleep,
    /// Something went wrong.
    Error,
}

/// Side effects requested by a state transition, executed by the orchestrator
/// in the order given.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Play an audio cue.
    PlayTone(Tone),
    /// Duck (true) or restore (false) shared audio output.
    DuckAudio(bool),
    /// Start the speech recognizer.
    StartRecognizer,
    /// Stop the speech recognizer.
    StopRecognizer,
    /// Route an utterance through the dispatcher (reflex first, then model).
    Dispatch(String),
    /// Speak the given text.
    Speak(String),
    /// Cancel in-flight speech playback.
    CancelSpeech,
    /// Execute a tool call.
    ExecuteTool(ToolCall),
}

/// Notifications broadcast to subscribers (UI layers, logs, tests).
///
/// Intentionally lightweight so the event loop can emit them without
/// blocking.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The conversation state changed.
    StateChanged {
        /// State before the transition.
        from: crate::machine::ConversationState,
        /// State after the transition.
        to: crate::machine::ConversationState,
    },
    /// Interim recognizer text, for UI feedback only.
    Interim(String),
    /// A complete user utterance entered the pipeline.
    Transcript(String),
    /// Assistant response text about to be spoken.
    Response(String),
    /// Overall service health changed.
    Health(crate::health::OverallStatus),
    /// Number of commands waiting in the outage queue changed.
    QueueDepth(usize),
    /// A non-fatal fault the user should know about.
    Fault(String),
}
