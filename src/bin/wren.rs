//! Console driver for the wren orchestration core.
//!
//! Typed lines stand in for recognizer finals, so the full pipeline — wake
//! word, turn-taking, reflex rules, health supervision — can be exercised
//! without audio hardware.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Notify, mpsc};
use tracing_subscriber::EnvFilter;
use wren::events::{ModelReply, Notification, Tone};
use wren::health::{HealthProbe, HttpProbe, ServiceId};
use wren::io::{
    AudioControl, ChatTurn, LanguageModel, PlatformControl, Recognizer, RecognizerEvent,
    SpeechSynthesizer, ToolExecutor,
};
use wren::reflex::NullBridge;
use wren::{AssistantConfig, Collaborators, Orchestrator, Result, ToolCall};

/// Wren: conversation orchestration core for a voice-driven assistant.
#[derive(Parser)]
#[command(name = "wren", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Drive a conversation from the console (typed lines as speech).
    Chat,

    /// Probe every monitored service once and print the results.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wren=info,reqwest=warn,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = if let Some(ref path) = cli.config {
        AssistantConfig::from_file(path)?
    } else {
        AssistantConfig::default()
    };

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config).await,
        Command::Health => run_health(config).await,
    }
}

async fn run_chat(config: AssistantConfig) -> anyhow::Result<()> {
    println!("Wren v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Type lines as if speaking. Say \"{}\" to wake; \"quit\" to exit.\n",
        config.conversation.wake_word,
    );

    let (recognizer_tx, recognizer_rx) = mpsc::unbounded_channel::<RecognizerEvent>();
    let collab = Collaborators {
        recognizer: Arc::new(ConsoleRecognizer),
        synthesizer: Arc::new(ConsoleSynthesizer::new()),
        model: Arc::new(EchoModel),
        tools: Arc::new(NoopTools),
        audio: Arc::new(ConsoleAudio),
        platform: Arc::new(NoopPlatform),
        probe: Arc::new(HttpProbe::new(&config.health)?),
        bridge: Arc::new(NullBridge),
    };
    let orchestrator = Orchestrator::spawn(config, collab, recognizer_rx);

    // Print notifications as they arrive.
    let mut notifications = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(n) = notifications.recv().await {
            match n {
                Notification::StateChanged { from, to } => println!("  ({from} -> {to})"),
                Notification::Transcript(text) => println!("[You] {text}"),
                Notification::Health(status) => println!("  (health: {status:?})"),
                Notification::QueueDepth(depth) => println!("  (queued: {depth})"),
                Notification::Fault(message) => println!("  (fault: {message})"),
                Notification::Interim(_) | Notification::Response(_) => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        let _ = recognizer_tx.send(RecognizerEvent::Final(line));
    }

    orchestrator.shutdown();
    println!("Goodbye.");
    Ok(())
}

async fn run_health(config: AssistantConfig) -> anyhow::Result<()> {
    let probe = HttpProbe::new(&config.health)?;
    for service in ServiceId::ALL {
        let outcome = probe.check(service).await;
        println!("{service:>16}: {outcome:?}");
    }
    Ok(())
}

// ── Console collaborator implementations ─────────────────────────────────────

struct ConsoleRecognizer;

#[async_trait]
impl Recognizer for ConsoleRecognizer {
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Prints utterances and simulates playback time so barge-in is observable.
struct ConsoleSynthesizer {
    cancelled: Notify,
}

impl ConsoleSynthesizer {
    fn new() -> Self {
        Self {
            cancelled: Notify::new(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ConsoleSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        println!("[Wren] {text}");
        // ~60ms per word, roughly conversational pace.
        let playback = std::time::Duration::from_millis(
            60 * text.split_whitespace().count().max(1) as u64,
        );
        tokio::select! {
            () = tokio::time::sleep(playback) => {}
            () = self.cancelled.notified() => {}
        }
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancelled.notify_waiters();
        Ok(())
    }
}

/// Stand-in model for offline console runs.
struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    async fn chat(&self, text: &str, _history: &[ChatTurn]) -> Result<ModelReply> {
        Ok(ModelReply::text(format!("You said: {text}")))
    }
}

struct NoopTools;

#[async_trait]
impl ToolExecutor for NoopTools {
    async fn execute(&self, call: &ToolCall) -> Result<String> {
        Ok(format!("Done with {}.", call.name))
    }
}

struct ConsoleAudio;

#[async_trait]
impl AudioControl for ConsoleAudio {
    async fn duck(&self, ducked: bool) -> Result<()> {
        println!("  (audio {})", if ducked { "ducked" } else { "restored" });
        Ok(())
    }

    async fn play_tone(&self, tone: Tone) -> Result<()> {
        let cue = match tone {
            Tone::Wake => "*ding*",
            Tone::Sleep => "*dong*",
            Tone::Error => "*buzz*",
        };
        println!("  {cue}");
        Ok(())
    }
}

struct NoopPlatform;

#[async_trait]
impl PlatformControl for NoopPlatform {
    async fn restart_model_backend(&self) -> Result<()> {
        Ok(())
    }
}
