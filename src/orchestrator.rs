//! The composition root: bridges the pure state machine to real effects.
//!
//! One logical event loop serializes every input — guard output, timers,
//! health events, model/tool/speech completions — so conversation state is
//! never mutated concurrently. Long-running I/O happens in spawned tasks
//! whose completions re-enter the loop as ordinary messages.

use crate::config::AssistantConfig;
use crate::error::Result;
use crate::events::{Action, ConversationEvent, ModelReply, Notification};
use crate::fallback::FallbackResponder;
use crate::health::{
    HealthCommand, HealthEvent, HealthProbe, HealthSnapshot, HealthSupervisor,
    QueuedCommandSnapshot, run_health_stage,
};
use crate::io::{
    AudioControl, ChatTurn, LanguageModel, PlatformControl, Recognizer, RecognizerEvent,
    SpeechSynthesizer, ToolExecutor,
};
use crate::machine::{ConversationMachine, ConversationState};
use crate::phrases;
use crate::reflex::{DeviceBridge, ReflexDispatcher};
use crate::turn::{GuardInput, GuardMode, GuardOutput, TurnTakingGuard, run_turn_taking_stage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffer size for the notification broadcast channel.
const NOTIFY_CHANNEL_SIZE: usize = 64;

/// Completed exchanges kept as model context.
const MAX_HISTORY_TURNS: usize = 20;

/// Everything the orchestrator talks to. Constructed once by the embedder and
/// passed in by handle — no ambient global state.
pub struct Collaborators {
    /// Speech recognizer control.
    pub recognizer: Arc<dyn Recognizer>,
    /// Speech synthesizer.
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    /// Language-model client.
    pub model: Arc<dyn LanguageModel>,
    /// Domain tool executor.
    pub tools: Arc<dyn ToolExecutor>,
    /// Shared audio output control.
    pub audio: Arc<dyn AudioControl>,
    /// Platform recovery hooks.
    pub platform: Arc<dyn PlatformControl>,
    /// Service reachability probe.
    pub probe: Arc<dyn HealthProbe>,
    /// Local device bridge for reflex handlers.
    pub bridge: Arc<dyn DeviceBridge>,
}

/// Completions of work spawned off the event loop.
enum Internal {
    ModelDone {
        id: Uuid,
        result: Result<ModelReply>,
    },
    ToolDone {
        result: Result<String>,
    },
    SpeechDone {
        seq: u64,
        /// Side utterances (busy notes) never produce a `SpeechEnd` event.
        aside: bool,
        result: Result<()>,
    },
}

/// Handle to a running orchestrator.
pub struct Orchestrator {
    event_tx: mpsc::UnboundedSender<ConversationEvent>,
    notify_tx: broadcast::Sender<Notification>,
    state_rx: watch::Receiver<ConversationState>,
    health_rx: watch::Receiver<HealthSnapshot>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire up all stages and start the event loop.
    ///
    /// `recognizer_rx` carries events from the recognizer implementation; the
    /// recognizer itself is started once here and stays available for
    /// wake-word spotting even while idle.
    pub fn spawn(
        config: AssistantConfig,
        collab: Collaborators,
        recognizer_rx: mpsc::UnboundedReceiver<RecognizerEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ConversationEvent>();
        let (guard_in_tx, guard_in_rx) = mpsc::unbounded_channel::<GuardInput>();
        let (guard_out_tx, guard_out_rx) = mpsc::unbounded_channel::<GuardOutput>();
        let (health_cmd_tx, health_cmd_rx) = mpsc::unbounded_channel::<HealthCommand>();
        let (health_event_tx, health_event_rx) = mpsc::unbounded_channel::<HealthEvent>();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel::<Internal>();
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);

        let supervisor = HealthSupervisor::new(config.health.clone(), Instant::now());
        let (health_snap_tx, health_snap_rx) = watch::channel(supervisor.snapshot());

        // Turn-taking guard stage.
        let guard = TurnTakingGuard::new(
            config.turn_taking.clone(),
            &config.conversation.wake_word,
            &config.conversation.stop_phrases,
        );
        tokio::spawn(run_turn_taking_stage(
            guard,
            guard_in_rx,
            guard_out_tx,
            cancel.clone(),
        ));

        // Health supervision stage.
        tokio::spawn(run_health_stage(
            supervisor,
            Arc::clone(&collab.probe),
            health_cmd_rx,
            health_event_tx,
            health_snap_tx,
            cancel.clone(),
        ));

        // Recognizer events feed the guard.
        tokio::spawn(forward_recognizer_events(
            recognizer_rx,
            guard_in_tx.clone(),
            cancel.clone(),
        ));

        // The recognizer runs from startup so the wake word is heard in idle.
        {
            let recognizer = Arc::clone(&collab.recognizer);
            tokio::spawn(async move {
                if let Err(e) = recognizer.start().await {
                    warn!("failed to start recognizer: {e}");
                }
            });
        }

        let core = LoopCore {
            machine: ConversationMachine::new(config.conversation.clone()),
            reflex: ReflexDispatcher::new(Arc::clone(&collab.bridge)),
            fallback: FallbackResponder::new(),
            recognizer: Arc::clone(&collab.recognizer),
            synthesizer: Arc::clone(&collab.synthesizer),
            model: Arc::clone(&collab.model),
            tools: Arc::clone(&collab.tools),
            audio: Arc::clone(&collab.audio),
            platform: Arc::clone(&collab.platform),
            guard_in_tx,
            health_cmd_tx,
            internal_tx,
            event_tx: event_tx.clone(),
            notify_tx: notify_tx.clone(),
            state_tx,
            fallback_mode: false,
            inflight: None,
            inflight_text: None,
            history: Vec::new(),
            ducked: false,
            speech_seq: 0,
            active_speech: None,
            timeout_deadline: None,
            replay_backlog: VecDeque::new(),
            replay_pending: false,
        };
        tokio::spawn(run_event_loop(
            core,
            event_rx,
            guard_out_rx,
            health_event_rx,
            internal_rx,
            cancel.clone(),
        ));

        Self {
            event_tx,
            notify_tx,
            state_rx,
            health_rx: health_snap_rx,
            cancel,
        }
    }

    /// Inject an event — used by UI layers for text input, barge-in
    /// simulation, and manual interrupts.
    pub fn send(&self, event: ConversationEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Subscribe to state/context change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    /// Current conversation state.
    pub fn state(&self) -> ConversationState {
        *self.state_rx.borrow()
    }

    /// Latest health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        self.health_rx.borrow().clone()
    }

    /// Commands waiting in the outage queue, oldest first.
    pub fn queued_commands(&self) -> Vec<QueuedCommandSnapshot> {
        self.health_rx.borrow().queue.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Cancellation token for external use.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Map recognizer output onto guard input.
async fn forward_recognizer_events(
    mut rx: mpsc::UnboundedReceiver<RecognizerEvent>,
    guard_in_tx: mpsc::UnboundedSender<GuardInput>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                let input = match ev {
                    RecognizerEvent::Interim(text) => GuardInput::Interim(text),
                    RecognizerEvent::Final(text) => GuardInput::Final(text),
                    RecognizerEvent::Error { kind, message } => {
                        GuardInput::RecognizerError(kind, message)
                    }
                };
                if guard_in_tx.send(input).is_err() {
                    break;
                }
            }
        }
    }
}

/// State owned by the event loop.
struct LoopCore {
    machine: ConversationMachine,
    reflex: ReflexDispatcher,
    fallback: FallbackResponder,
    recognizer: Arc<dyn Recognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolExecutor>,
    audio: Arc<dyn AudioControl>,
    platform: Arc<dyn PlatformControl>,
    guard_in_tx: mpsc::UnboundedSender<GuardInput>,
    health_cmd_tx: mpsc::UnboundedSender<HealthCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    event_tx: mpsc::UnboundedSender<ConversationEvent>,
    notify_tx: broadcast::Sender<Notification>,
    state_tx: watch::Sender<ConversationState>,
    /// Mirrors the health stage's fallback flag.
    fallback_mode: bool,
    /// Identity of the slow-path request in flight, for stale-reply detection.
    inflight: Option<Uuid>,
    inflight_text: Option<String>,
    history: Vec<ChatTurn>,
    /// Current duck state; ducking is idempotent.
    ducked: bool,
    speech_seq: u64,
    /// Sequence number of the utterance the FSM is waiting on.
    active_speech: Option<u64>,
    /// Armed state timeout: (deadline, generation).
    timeout_deadline: Option<(tokio::time::Instant, u64)>,
    /// Replayed outage commands waiting for their turn.
    replay_backlog: VecDeque<String>,
    /// A replayed command is queued but not yet dispatched; holds the pump
    /// so replays go one turn at a time.
    replay_pending: bool,
}

async fn run_event_loop(
    mut core: LoopCore,
    mut event_rx: mpsc::UnboundedReceiver<ConversationEvent>,
    mut guard_out_rx: mpsc::UnboundedReceiver<GuardOutput>,
    mut health_event_rx: mpsc::UnboundedReceiver<HealthEvent>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    cancel: CancellationToken,
) {
    info!("orchestrator event loop started");

    loop {
        let deadline = core.timeout_deadline;
        let timeout = async move {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = timeout => {
                if let Some((_, generation)) = core.timeout_deadline.take() {
                    core.on_event(ConversationEvent::Timeout(generation)).await;
                }
            }
            ev = event_rx.recv() => {
                let Some(ev) = ev else { break };
                core.on_event(ev).await;
            }
            out = guard_out_rx.recv() => {
                let Some(out) = out else { break };
                core.on_guard(out).await;
            }
            ev = health_event_rx.recv() => {
                let Some(ev) = ev else { break };
                core.on_health(ev).await;
            }
            msg = internal_rx.recv() => {
                let Some(msg) = msg else { break };
                core.on_internal(msg).await;
            }
        }
    }

    // The duck obligation is honored even on shutdown paths.
    if core.ducked && core.audio.duck(false).await.is_err() {
        warn!("failed to restore audio on shutdown");
    }
    info!("orchestrator event loop stopped");
}

impl LoopCore {
    async fn on_event(&mut self, event: ConversationEvent) {
        // Processing-lock bypass, the one invariant not expressible in the
        // FSM: reflex-matched input jumps the lock as a re-entrant dispatch,
        // while a second slow-path request gets a spoken busy note instead of
        // being silently dropped. (`matches` probes without running handlers,
        // so the reflex executes once, inside the re-dispatched turn.)
        let event = match event {
            ConversationEvent::FinalTranscript(text)
                if self.machine.state() == ConversationState::Processing =>
            {
                if self.reflex.matches(&text) {
                    ConversationEvent::BargeIn(text)
                } else if self.inflight.is_some() {
                    debug!(text = %text, "slow path busy, acknowledging");
                    self.begin_speech(phrases::BUSY.to_owned(), true);
                    return;
                } else {
                    ConversationEvent::FinalTranscript(text)
                }
            }
            other => other,
        };

        let outcome = self.machine.handle(&event);
        if outcome.entered_state() {
            self.timeout_deadline = outcome
                .timeout
                .map(|t| (tokio::time::Instant::now() + t.after, t.generation));
        }
        if outcome.from != outcome.to {
            debug!(from = %outcome.from, to = %outcome.to, event = event.label(), "transition");
            let _ = self.state_tx.send(outcome.to);
            let _ = self
                .guard_in_tx
                .send(GuardInput::Mode(guard_mode_for(outcome.to)));
            self.notify(Notification::StateChanged {
                from: outcome.from,
                to: outcome.to,
            });
        }
        for action in outcome.actions {
            self.execute(action).await;
        }
        self.pump_replay();
    }

    async fn on_guard(&mut self, out: GuardOutput) {
        match out {
            GuardOutput::Event(event) => self.on_event(event).await,
            GuardOutput::Interim(text) => self.notify(Notification::Interim(text)),
            GuardOutput::RestartRecognizer => {
                if let Err(e) = self.recognizer.start().await {
                    warn!("recognizer restart failed: {e}");
                }
            }
            GuardOutput::RecognizerFault(message) => {
                self.notify(Notification::Fault(message));
            }
        }
    }

    async fn on_health(&mut self, event: HealthEvent) {
        match event {
            HealthEvent::OverallChanged(status) => self.notify(Notification::Health(status)),
            HealthEvent::FallbackEngaged => {
                self.fallback_mode = true;
                self.notify(Notification::Fault(
                    "language backend offline; fallback responses active".to_owned(),
                ));
            }
            HealthEvent::FallbackLifted => {
                self.fallback_mode = false;
                info!("language backend recovered");
            }
            HealthEvent::RestartModelBackend => {
                let platform = Arc::clone(&self.platform);
                tokio::spawn(async move {
                    if let Err(e) = platform.restart_model_backend().await {
                        warn!("model backend restart failed: {e}");
                    }
                });
            }
            HealthEvent::Replay(commands) => {
                self.replay_backlog.extend(commands.into_iter().map(|c| c.text));
                self.pump_replay();
            }
            HealthEvent::QueueDepth(depth) => self.notify(Notification::QueueDepth(depth)),
        }
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ModelDone { id, result } => {
                if self.inflight != Some(id) {
                    debug!("stale model reply dropped");
                    return;
                }
                self.inflight = None;
                let user = self.inflight_text.take().unwrap_or_default();
                match result {
                    Ok(reply) => {
                        if !reply.text.is_empty() {
                            self.remember_turn(user, reply.text.clone());
                        }
                        self.on_event(ConversationEvent::ModelResponse(reply)).await;
                    }
                    Err(e) => {
                        self.on_event(ConversationEvent::ModelError(e.to_string()))
                            .await;
                    }
                }
            }
            Internal::ToolDone { result } => match result {
                Ok(text) => self.on_event(ConversationEvent::ToolResult(text)).await,
                Err(e) => self.on_event(ConversationEvent::ToolError(e.to_string())).await,
            },
            Internal::SpeechDone { seq, aside, result } => {
                let _ = self.guard_in_tx.send(GuardInput::SpokeEnd);
                if let Err(e) = result {
                    warn!("speech playback failed: {e}");
                }
                // SpeechEnd fires even after a playback error so the FSM is
                // never stuck waiting on an utterance that will not finish.
                if !aside && self.active_speech == Some(seq) {
                    self.active_speech = None;
                    self.on_event(ConversationEvent::SpeechEnd).await;
                }
            }
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::PlayTone(tone) => {
                if let Err(e) = self.audio.play_tone(tone).await {
                    warn!(?tone, "tone playback failed: {e}");
                }
            }
            Action::DuckAudio(ducked) => self.set_ducked(ducked).await,
            Action::StartRecognizer => {
                if let Err(e) = self.recognizer.start().await {
                    warn!("recognizer start failed: {e}");
                }
            }
            Action::StopRecognizer => {
                if let Err(e) = self.recognizer.stop().await {
                    warn!("recognizer stop failed: {e}");
                }
            }
            Action::Dispatch(text) => self.dispatch(text),
            Action::Speak(text) => self.begin_speech(text, false),
            Action::CancelSpeech => {
                self.active_speech = None;
                if let Err(e) = self.synthesizer.cancel().await {
                    warn!("speech cancel failed: {e}");
                }
            }
            Action::ExecuteTool(call) => {
                let tools = Arc::clone(&self.tools);
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = tools.execute(&call).await;
                    let _ = internal.send(Internal::ToolDone { result });
                });
            }
        }
    }

    /// Route an utterance: reflex first, then fallback or the model.
    ///
    /// Results are fed back through the event queue so that, from the state
    /// machine's perspective, the reflex path and the model path are
    /// indistinguishable consumers of `Processing`.
    fn dispatch(&mut self, text: String) {
        self.replay_pending = false;
        self.notify(Notification::Transcript(text.clone()));

        if let Some(hit) = self.reflex.try_reflex(&text) {
            // A late reply from any in-flight slow request is now stale.
            self.inflight = None;
            self.inflight_text = None;
            let reply = match hit.response {
                Ok(response) => {
                    info!(rule = hit.rule, latency = ?hit.latency, "reflex handled");
                    ModelReply::text(response)
                }
                Err(e) => {
                    warn!(rule = hit.rule, "reflex handler failed: {e}");
                    ModelReply::text(phrases::TOOL_APOLOGY)
                }
            };
            let _ = self.event_tx.send(ConversationEvent::ModelResponse(reply));
            return;
        }

        if self.fallback_mode {
            match self.fallback.respond(&text) {
                Some(answer) => {
                    let _ = self
                        .event_tx
                        .send(ConversationEvent::ModelResponse(ModelReply::text(answer)));
                }
                None => {
                    let _ = self.health_cmd_tx.send(HealthCommand::Enqueue(text));
                    let _ = self.event_tx.send(ConversationEvent::ModelResponse(
                        ModelReply::text(phrases::OFFLINE_ACK),
                    ));
                }
            }
            return;
        }

        let id = Uuid::new_v4();
        self.inflight = Some(id);
        self.inflight_text = Some(text.clone());
        let model = Arc::clone(&self.model);
        let history = self.history.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = model.chat(&text, &history).await;
            let _ = internal.send(Internal::ModelDone { id, result });
        });
    }

    /// Start speaking. `aside` utterances (busy notes) inform the guard for
    /// echo suppression but never drive the FSM.
    fn begin_speech(&mut self, text: String, aside: bool) {
        self.speech_seq += 1;
        let seq = self.speech_seq;
        if !aside {
            self.active_speech = Some(seq);
        }
        let _ = self.guard_in_tx.send(GuardInput::SpokeStart(text.clone()));
        self.notify(Notification::Response(text.clone()));

        let synthesizer = Arc::clone(&self.synthesizer);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = synthesizer.speak(&text).await;
            let _ = internal.send(Internal::SpeechDone { seq, aside, result });
        });
    }

    /// Idempotent audio ducking with a single pending restore obligation.
    async fn set_ducked(&mut self, ducked: bool) {
        if self.ducked == ducked {
            return;
        }
        match self.audio.duck(ducked).await {
            Ok(()) => self.ducked = ducked,
            Err(e) => warn!(ducked, "audio duck failed: {e}"),
        }
    }

    fn remember_turn(&mut self, user: String, assistant: String) {
        self.history.push(ChatTurn { user, assistant });
        if self.history.len() > MAX_HISTORY_TURNS {
            self.history.remove(0);
        }
    }

    /// Feed the next replayed outage command once the conversation settles.
    /// From idle the assistant wakes itself to deliver the deferred answers.
    fn pump_replay(&mut self) {
        if self.replay_backlog.is_empty() || self.replay_pending {
            return;
        }
        match self.machine.state() {
            ConversationState::Idle => {
                let _ = self.event_tx.send(ConversationEvent::Wake);
            }
            ConversationState::Listening => {
                if let Some(text) = self.replay_backlog.pop_front() {
                    self.replay_pending = true;
                    let _ = self.event_tx.send(ConversationEvent::FinalTranscript(text));
                }
            }
            _ => {}
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification);
    }
}

fn guard_mode_for(state: ConversationState) -> GuardMode {
    match state {
        ConversationState::Idle => GuardMode::Asleep,
        ConversationState::Listening => GuardMode::Listening,
        ConversationState::Processing
        | ConversationState::Speaking
        | ConversationState::Executing
        | ConversationState::Error => GuardMode::Engaged,
    }
}
