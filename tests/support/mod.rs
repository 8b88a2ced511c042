//! Test doubles for the orchestrator's collaborator seams.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use wren::events::{ModelReply, Notification, Tone};
use wren::health::{HealthProbe, ProbeOutcome, ServiceId};
use wren::io::{
    AudioControl, ChatTurn, LanguageModel, PlatformControl, Recognizer, SpeechSynthesizer,
    ToolExecutor,
};
use wren::machine::ConversationState;
use wren::{AssistantConfig, Collaborators, Orchestrator, Result, ToolCall};

/// Config with timing shrunk so tests run fast.
pub fn test_config() -> AssistantConfig {
    let mut config = AssistantConfig::default();
    config.turn_taking.cooldown_ms = 40;
    config.turn_taking.echo_overlap_window_ms = 30;
    config.turn_taking.silence_window_ms = 60;
    config.turn_taking.recognizer_restart_delay_ms = 10;
    config
}

/// Recognizer that accepts start/stop and counts them.
#[derive(Default)]
pub struct StubRecognizer {
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

#[async_trait]
impl Recognizer for StubRecognizer {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Synthesizer that records utterances and simulates playback time.
pub struct RecordingSynth {
    pub spoken: Mutex<Vec<String>>,
    pub cancels: AtomicU32,
    cancelled: Notify,
    per_word: Duration,
}

impl RecordingSynth {
    pub fn new(per_word: Duration) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            cancels: AtomicU32::new(0),
            cancelled: Notify::new(),
            per_word,
        }
    }

    pub fn spoken_texts(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynth {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_owned());
        let playback = self.per_word * text.split_whitespace().count().max(1) as u32;
        tokio::select! {
            () = tokio::time::sleep(playback) => {}
            () = self.cancelled.notified() => {}
        }
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::Relaxed);
        self.cancelled.notify_waiters();
        Ok(())
    }
}

/// Model that counts calls and replies after a configurable delay.
pub struct CountingModel {
    pub calls: AtomicU32,
    pub delay: Duration,
    pub reply: Mutex<ModelReply>,
}

impl CountingModel {
    pub fn new(delay: Duration, reply: ModelReply) -> Self {
        Self {
            calls: AtomicU32::new(0),
            delay,
            reply: Mutex::new(reply),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LanguageModel for CountingModel {
    async fn chat(&self, _text: &str, _history: &[ChatTurn]) -> Result<ModelReply> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.delay).await;
        Ok(self.reply.lock().unwrap().clone())
    }
}

/// Tool executor that records calls and echoes a result.
#[derive(Default)]
pub struct RecordingTools {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    async fn execute(&self, call: &ToolCall) -> Result<String> {
        self.calls.lock().unwrap().push(call.name.clone());
        Ok(format!("{} done", call.name))
    }
}

/// Audio control that records tones and duck transitions in order.
#[derive(Default)]
pub struct RecordingAudio {
    pub events: Mutex<Vec<String>>,
}

impl RecordingAudio {
    pub fn recorded(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioControl for RecordingAudio {
    async fn duck(&self, ducked: bool) -> Result<()> {
        self.events.lock().unwrap().push(format!("duck:{ducked}"));
        Ok(())
    }

    async fn play_tone(&self, tone: Tone) -> Result<()> {
        let name = match tone {
            Tone::Wake => "wake",
            Tone::Sleep => "sleep",
            Tone::Error => "error",
        };
        self.events.lock().unwrap().push(format!("tone:{name}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct StubPlatform {
    pub restarts: AtomicU32,
}

#[async_trait]
impl PlatformControl for StubPlatform {
    async fn restart_model_backend(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Probe whose per-service outcome can be flipped mid-test.
pub struct ScriptedProbe {
    outcomes: Mutex<HashMap<ServiceId, ProbeOutcome>>,
}

impl ScriptedProbe {
    pub fn all_healthy() -> Self {
        let outcomes = ServiceId::ALL
            .iter()
            .map(|id| (*id, ProbeOutcome::Healthy))
            .collect();
        Self {
            outcomes: Mutex::new(outcomes),
        }
    }

    pub fn set(&self, id: ServiceId, outcome: ProbeOutcome) {
        self.outcomes.lock().unwrap().insert(id, outcome);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, service: ServiceId) -> ProbeOutcome {
        self.outcomes.lock().unwrap()[&service].clone()
    }
}

/// Bundle of doubles with handles kept for assertions.
pub struct Harness {
    pub recognizer: Arc<StubRecognizer>,
    pub synth: Arc<RecordingSynth>,
    pub model: Arc<CountingModel>,
    pub tools: Arc<RecordingTools>,
    pub audio: Arc<RecordingAudio>,
    pub platform: Arc<StubPlatform>,
    pub probe: Arc<ScriptedProbe>,
}

impl Harness {
    pub fn new(model_delay: Duration, reply: ModelReply) -> Self {
        Self {
            recognizer: Arc::new(StubRecognizer::default()),
            synth: Arc::new(RecordingSynth::new(Duration::from_millis(30))),
            model: Arc::new(CountingModel::new(model_delay, reply)),
            tools: Arc::new(RecordingTools::default()),
            audio: Arc::new(RecordingAudio::default()),
            platform: Arc::new(StubPlatform::default()),
            probe: Arc::new(ScriptedProbe::all_healthy()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            recognizer: Arc::clone(&self.recognizer) as _,
            synthesizer: Arc::clone(&self.synth) as _,
            model: Arc::clone(&self.model) as _,
            tools: Arc::clone(&self.tools) as _,
            audio: Arc::clone(&self.audio) as _,
            platform: Arc::clone(&self.platform) as _,
            probe: Arc::clone(&self.probe) as _,
            bridge: Arc::new(wren::reflex::NullBridge),
        }
    }
}

/// Poll until the orchestrator reaches `state` or the timeout elapses.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    state: ConversationState,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if orchestrator.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {state}; current state is {}",
        orchestrator.state(),
    );
}

/// Wait for a notification matching the predicate.
pub async fn wait_for_notification(
    rx: &mut tokio::sync::broadcast::Receiver<Notification>,
    timeout: Duration,
    mut pred: impl FnMut(&Notification) -> bool,
) -> Notification {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for notification");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(n)) if pred(&n) => return n,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => panic!("notification channel closed: {e}"),
            Err(_) => panic!("timed out waiting for notification"),
        }
    }
}
