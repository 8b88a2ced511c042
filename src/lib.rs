//! Wren: conversation orchestration core for a voice-driven assistant.
//!
//! # Architecture
//!
//! The core is built from independent pieces connected by async channels:
//! - **State machine** (`machine`): pure transition logic over the
//!   conversation lifecycle — idle, listening, processing, speaking,
//!   executing, error
//! - **Turn-taking guard** (`turn`): batches recognizer fragments into
//!   utterances and rejects the assistant's own synthesized speech
//! - **Reflex dispatcher** (`reflex`): ordered instant-command rules that
//!   bypass the language model
//! - **Health supervisor** (`health`): per-service probes, supervised
//!   recovery, and the outage command queue
//! - **Orchestrator** (`orchestrator`): the composition root; one event loop
//!   that executes the machine's actions against the collaborator traits

pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod health;
pub mod io;
pub mod machine;
pub mod orchestrator;
pub mod phrases;
pub mod reflex;
pub mod turn;

pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use events::{Action, ConversationEvent, ModelReply, Notification, ToolCall};
pub use health::{HealthSnapshot, OverallStatus, ServiceId, ServiceStatus};
pub use machine::{ConversationMachine, ConversationState};
pub use orchestrator::{Collaborators, Orchestrator};
pub use turn::TurnTakingGuard;
