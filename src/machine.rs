//! The conversation state machine.
//!
//! # Design
//!
//! The machine is **pure logic** — no async I/O, no timers, no channels. It
//! accepts [`ConversationEvent`] values and produces ordered [`Action`] lists
//! for the orchestrator to execute. Per-state timeouts are declared in the
//! returned [`Outcome`] and scheduled by the caller; a firing timer re-enters
//! as an ordinary `Timeout` event carrying a generation counter, so timers
//! armed for a state we have since left are ignored.
//!
//! Every (state, event) pair is covered by the single `match` below; pairs
//! outside the transition table fall through to an explicit no-op that only
//! touches the last-activity timestamp.

use crate::config::ConversationConfig;
use crate::events::{Action, ConversationEvent, Tone, ToolCall};
use crate::phrases;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of transition records retained for diagnostics.
const HISTORY_CAPACITY: usize = 100;

/// The conversation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Asleep; only the wake word is honored.
    Idle,
    /// Recognizer running, waiting for the user.
    Listening,
    /// An utterance is being dispatched (reflex or model).
    Processing,
    /// The assistant is speaking.
    Speaking,
    /// Tool calls from the last reply are being executed.
    Executing,
    /// A model failure is being surfaced; recovery pending.
    Error,
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Executing => "executing",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Mutable conversation context co-located with the state.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    /// Most recent user utterance.
    pub transcript: String,
    /// Most recent assistant reply text.
    pub last_response: String,
    /// Tool calls waiting to execute, in reply order.
    pub pending_tool_calls: VecDeque<ToolCall>,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
    /// Consecutive model errors this session.
    pub error_count: u32,
    /// When the current state was entered.
    pub state_entered_at: Instant,
    /// When any event was last handled.
    pub last_activity_at: Instant,
    /// Whether a conversation is open (wake word accepted, not yet asleep).
    pub conversation_active: bool,
    /// User turns completed since the last wake.
    pub turn_count: u32,
    /// Generation counter for state timeouts. Bumped on every state entry.
    pub timeout_generation: u64,
}

impl ConversationContext {
    fn new(now: Instant) -> Self {
        Self {
            transcript: String::new(),
            last_response: String::new(),
            pending_tool_calls: VecDeque::new(),
            last_error: None,
            error_count: 0,
            state_entered_at: now,
            last_activity_at: now,
            conversation_active: false,
            turn_count: 0,
            timeout_generation: 0,
        }
    }
}

/// One entry in the bounded transition-history ring.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    /// State before the event.
    pub from: ConversationState,
    /// Event label (see [`ConversationEvent::label`]).
    pub event: &'static str,
    /// State after the event.
    pub to: ConversationState,
    /// When the transition happened.
    pub at: Instant,
}

/// Timeout the orchestrator must arm for the state just entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTimeout {
    /// Generation the resulting `Timeout` event must carry.
    pub generation: u64,
    /// Delay before the timeout fires.
    pub after: Duration,
}

/// Result of handling one event.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// State before the event.
    pub from: ConversationState,
    /// State after the event (same as `from` for no-ops and self-loops).
    pub to: ConversationState,
    /// Side effects to execute, in order.
    pub actions: Vec<Action>,
    /// Timeout for the newly entered state, or `None` if the state has no
    /// timeout or the event was a no-op.
    pub timeout: Option<StateTimeout>,
}

impl Outcome {
    /// Whether the event caused a state entry (including re-entrant ones).
    pub fn entered_state(&self) -> bool {
        self.timeout.is_some() || self.from != self.to || !self.actions.is_empty()
    }
}

/// The conversation state machine. Owns the single current state and its
/// context; both are mutated only through [`ConversationMachine::handle`].
#[derive(Debug)]
pub struct ConversationMachine {
    config: ConversationConfig,
    state: ConversationState,
    context: ConversationContext,
    history: VecDeque<TransitionRecord>,
}

impl ConversationMachine {
    /// Create a machine in `Idle` with a fresh context.
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            config,
            state: ConversationState::Idle,
            context: ConversationContext::new(Instant::now()),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Read-only view of the conversation context.
    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Transition history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Reset state and context to startup defaults.
    pub fn hard_reset(&mut self) {
        self.state = ConversationState::Idle;
        self.context = ConversationContext::new(Instant::now());
        self.history.clear();
    }

    /// Handle one event: compute the next state and the ordered side effects.
    pub fn handle(&mut self, event: &ConversationEvent) -> Outcome {
        use ConversationEvent as E;
        use ConversationState as S;

        let now = Instant::now();
        self.context.last_activity_at = now;
        let from = self.state;
        let r#gen = self.context.timeout_generation;

        let step: Option<(S, Vec<Action>)> = match (from, event) {
            // -- Idle --
            (S::Idle, E::Wake) => {
                self.context.conversation_active = true;
                self.context.turn_count = 0;
                self.context.error_count = 0;
                Some((
                    S::Listening,
                    vec![
                        Action::PlayTone(Tone::Wake),
                        Action::DuckAudio(true),
                        Action::StartRecognizer,
                    ],
                ))
            }

            // -- Listening --
            (S::Listening, E::FinalTranscript(text)) if !text.trim().is_empty() => {
                self.begin_turn(text);
                Some((
                    S::Processing,
                    vec![Action::StopRecognizer, Action::Dispatch(text.clone())],
                ))
            }
            (S::Listening, E::Timeout(g)) if *g == r#gen => Some(self.go_to_sleep(false)),

            // -- Processing --
            (S::Processing, E::ModelResponse(reply)) => {
                self.context.last_response = reply.text.clone();
                let mut calls: VecDeque<ToolCall> = reply.tool_calls.iter().cloned().collect();
                match calls.pop_front() {
                    Some(first) => {
                        self.context.pending_tool_calls = calls;
                        Some((S::Executing, vec![Action::ExecuteTool(first)]))
                    }
                    None => Some((S::Speaking, vec![Action::Speak(reply.text.clone())])),
                }
            }
            (S::Processing, E::ModelError(message)) => {
                Some(self.fail_turn(message.clone(), phrases::MODEL_APOLOGY))
            }
            (S::Processing, E::Timeout(g)) if *g == r#gen => Some(self.fail_turn(
                "model response timed out".to_owned(),
                phrases::TIMEOUT_APOLOGY,
            )),
            // Re-entrant: a barge-in mid-processing replaces the pending turn.
            (S::Processing, E::BargeIn(text)) => {
                self.begin_turn(text);
                Some((S::Processing, vec![Action::Dispatch(text.clone())]))
            }

            // -- Speaking --
            (S::Speaking, E::SpeechEnd) => Some(self.after_speech(Vec::new())),
            (S::Speaking, E::Timeout(g)) if *g == r#gen => {
                Some(self.after_speech(vec![Action::CancelSpeech]))
            }
            (S::Speaking, E::BargeIn(text)) => {
                self.begin_turn(text);
                Some((
                    S::Processing,
                    vec![Action::CancelSpeech, Action::Dispatch(text.clone())],
                ))
            }

            // -- Executing --
            (S::Executing, E::ToolResult(result)) => {
                match self.context.pending_tool_calls.pop_front() {
                    Some(next) => Some((S::Executing, vec![Action::ExecuteTool(next)])),
                    None => {
                        self.context.last_response = result.clone();
                        Some((S::Speaking, vec![Action::Speak(result.clone())]))
                    }
                }
            }
            (S::Executing, E::ToolError(message)) => {
                // Recovered locally: abandon the rest of the queue and apologize.
                self.context.pending_tool_calls.clear();
                self.context.last_error = Some(message.clone());
                Some((
                    S::Speaking,
                    vec![Action::Speak(phrases::TOOL_APOLOGY.to_owned())],
                ))
            }

            // -- Error --
            (S::Error, E::Recover) => Some((S::Listening, vec![Action::StartRecognizer])),
            (S::Error, E::SpeechEnd) => {
                if self.context.error_count < self.config.max_consecutive_errors {
                    Some((S::Listening, vec![Action::StartRecognizer]))
                } else {
                    self.context.error_count = 0;
                    Some(self.go_to_sleep(false))
                }
            }

            // -- Any state --
            (S::Idle, E::Interrupt) => None,
            (_, E::Interrupt) => {
                self.context.pending_tool_calls.clear();
                if self.context.conversation_active
                    && self.context.turn_count < self.config.max_turns
                {
                    Some((
                        S::Listening,
                        vec![Action::CancelSpeech, Action::StartRecognizer],
                    ))
                } else {
                    Some(self.go_to_sleep(true))
                }
            }
            (S::Idle, E::Sleep) => None,
            (_, E::Sleep) => Some(self.go_to_sleep(true)),

            // Everything else is a deliberate no-op.
            _ => None,
        };

        match step {
            Some((to, actions)) => self.enter(from, event.label(), to, actions, now),
            None => Outcome {
                from,
                to: from,
                actions: Vec::new(),
                timeout: None,
            },
        }
    }

    /// Record the start of a user turn.
    fn begin_turn(&mut self, text: &str) {
        self.context.transcript = text.to_owned();
        self.context.turn_count += 1;
    }

    /// Shared model-failure path: enter `Error` with tone and spoken apology.
    fn fail_turn(&mut self, message: String, apology: &str) -> (ConversationState, Vec<Action>) {
        self.context.last_error = Some(message);
        self.context.error_count += 1;
        (
            ConversationState::Error,
            vec![
                Action::PlayTone(Tone::Error),
                Action::Speak(apology.to_owned()),
            ],
        )
    }

    /// Where speech end (or a stuck-speech timeout) lands: back to listening
    /// while the conversation is open and under the turn budget, else asleep.
    fn after_speech(&mut self, mut actions: Vec<Action>) -> (ConversationState, Vec<Action>) {
        if self.context.conversation_active && self.context.turn_count < self.config.max_turns {
            actions.push(Action::StartRecognizer);
            (ConversationState::Listening, actions)
        } else {
            let (state, mut sleep_actions) = self.go_to_sleep(false);
            actions.append(&mut sleep_actions);
            (state, actions)
        }
    }

    /// Close the conversation and return to `Idle`.
    ///
    /// `cancel_speech` is set on the interrupt/sleep paths where playback may
    /// still be running.
    fn go_to_sleep(&mut self, cancel_speech: bool) -> (ConversationState, Vec<Action>) {
        self.context.conversation_active = false;
        let mut actions = Vec::new();
        if cancel_speech {
            actions.push(Action::CancelSpeech);
        }
        actions.push(Action::StopRecognizer);
        actions.push(Action::PlayTone(Tone::Sleep));
        actions.push(Action::DuckAudio(false));
        (ConversationState::Idle, actions)
    }

    /// Enter `to`, record history, bump the timeout generation and declare the
    /// new state's timeout.
    fn enter(
        &mut self,
        from: ConversationState,
        event: &'static str,
        to: ConversationState,
        actions: Vec<Action>,
        now: Instant,
    ) -> Outcome {
        self.state = to;
        self.context.state_entered_at = now;
        self.context.timeout_generation += 1;

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            event,
            to,
            at: now,
        });

        let timeout = self
            .config
            .state_timeout(to)
            .map(|after| StateTimeout {
                generation: self.context.timeout_generation,
                after,
            });

        Outcome {
            from,
            to,
            actions,
            timeout,
        }
    }
}
