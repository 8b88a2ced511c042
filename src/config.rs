//! Configuration types for the conversation orchestration core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Conversation lifecycle settings (wake word, turn limits, timeouts).
    pub conversation: ConversationConfig,
    /// Turn-taking and self-echo suppression settings.
    pub turn_taking: TurnTakingConfig,
    /// Service health supervision settings.
    pub health: HealthConfig,
}

/// Conversation lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Wake phrase that transitions the assistant from idle to listening.
    pub wake_word: String,
    /// Phrases that stop the current utterance and end the conversation.
    pub stop_phrases: Vec<String>,
    /// Maximum user turns before the assistant forces itself back to sleep.
    pub max_turns: u32,
    /// Seconds to wait in listening with no speech before going idle.
    pub listening_timeout_s: u64,
    /// Seconds to wait for a model/tool response before giving up.
    pub processing_timeout_s: u64,
    /// Seconds an utterance may play before it is treated as stuck.
    pub speaking_timeout_s: u64,
    /// Consecutive model errors before the assistant forces sleep.
    pub max_consecutive_errors: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            wake_word: "hey wren".to_owned(),
            stop_phrases: vec![
                "stop".to_owned(),
                "be quiet".to_owned(),
                "that will do".to_owned(),
                "never mind".to_owned(),
            ],
            max_turns: 10,
            listening_timeout_s: 30,
            processing_timeout_s: 45,
            speaking_timeout_s: 120,
            max_consecutive_errors: 3,
        }
    }
}

impl ConversationConfig {
    /// Timeout for a conversation state, if that state has one.
    pub fn state_timeout(&self, state: crate::machine::ConversationState) -> Option<Duration> {
        use crate::machine::ConversationState;
        match state {
            ConversationState::Listening => Some(Duration::from_secs(self.listening_timeout_s)),
            ConversationState::Processing => Some(Duration::from_secs(self.processing_timeout_s)),
            ConversationState::Speaking => Some(Duration::from_secs(self.speaking_timeout_s)),
            ConversationState::Idle | ConversationState::Executing | ConversationState::Error => {
                None
            }
        }
    }
}

/// Turn-taking / echo suppression configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnTakingConfig {
    /// Hard suppression window after the assistant speaks, in ms.
    ///
    /// Every recognizer fragment arriving inside this window is discarded
    /// outright. Typical values:
    ///   - 400:  fast turn-taking, risks hearing the tail of our own speech
    ///   - 800:  default, safe on laptop speakers
    ///   - 1500: very reverberant rooms
    pub cooldown_ms: u64,
    /// Window after speech end in which word-overlap echo matching applies, in ms.
    pub echo_overlap_window_ms: u64,
    /// Word-overlap ratio above which a fragment counts as self-echo.
    pub echo_overlap_threshold: f32,
    /// Leading characters of a fragment probed against the last spoken text.
    pub echo_prefix_chars: usize,
    /// Silence after the last fragment before the utterance buffer flushes, in ms.
    pub silence_window_ms: u64,
    /// Delay before the recognizer is restarted after a transient error, in ms.
    pub recognizer_restart_delay_ms: u64,
}

impl Default for TurnTakingConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 800,
            echo_overlap_window_ms: 500,
            echo_overlap_threshold: 0.5,
            echo_prefix_chars: 30,
            silence_window_ms: 1500,
            recognizer_restart_delay_ms: 300,
        }
    }
}

/// Health supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Poll interval for the language-model backend, in seconds.
    pub model_poll_interval_s: u64,
    /// Poll interval for the application server, in seconds.
    pub app_server_poll_interval_s: u64,
    /// Poll interval for the smart-home bridge, in seconds.
    pub smart_home_poll_interval_s: u64,
    /// Per-probe HTTP timeout, in seconds.
    pub probe_timeout_s: u64,
    /// Consecutive failures before a service is declared offline.
    pub offline_threshold: u32,
    /// Re-probe interval while the model backend restart is in flight, in seconds.
    pub model_recovery_probe_interval_s: u64,
    /// Re-probe attempts before the model recovery gives up into fallback mode.
    pub model_recovery_max_attempts: u32,
    /// Initial reconnect backoff for the application server, in seconds.
    pub app_server_backoff_initial_s: u64,
    /// Reconnect backoff cap for the application server, in seconds.
    pub app_server_backoff_cap_s: u64,
    /// Maximum queued commands held during an outage.
    pub queue_capacity: usize,
    /// Seconds a queued command stays eligible for replay.
    pub queue_ttl_s: u64,
    /// Interval between expired-entry sweeps of the queue, in seconds.
    pub queue_sweep_interval_s: u64,
    /// Base URLs probed for each service, keyed by service name.
    pub endpoints: HealthEndpoints,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            model_poll_interval_s: 10,
            app_server_poll_interval_s: 5,
            smart_home_poll_interval_s: 30,
            probe_timeout_s: 4,
            offline_threshold: 3,
            model_recovery_probe_interval_s: 2,
            model_recovery_max_attempts: 15,
            app_server_backoff_initial_s: 1,
            app_server_backoff_cap_s: 30,
            queue_capacity: 10,
            queue_ttl_s: 60,
            queue_sweep_interval_s: 10,
            endpoints: HealthEndpoints::default(),
        }
    }
}

/// Reachability endpoints for the monitored services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthEndpoints {
    /// Language-model backend health URL.
    pub language_model: String,
    /// Application server health URL.
    pub app_server: String,
    /// Smart-home bridge health URL.
    pub smart_home: String,
    /// Vision capability health URL (checked on demand only).
    pub vision: String,
    /// Speech-synthesis capability health URL (checked on demand only).
    pub speech_synth: String,
}

impl Default for HealthEndpoints {
    fn default() -> Self {
        Self {
            language_model: "http://127.0.0.1:11434/api/version".to_owned(),
            app_server: "http://127.0.0.1:8321/healthz".to_owned(),
            smart_home: "http://127.0.0.1:8123/api/".to_owned(),
            vision: "http://127.0.0.1:8321/vision/healthz".to_owned(),
            speech_synth: "http://127.0.0.1:8321/tts/healthz".to_owned(),
        }
    }
}

impl AssistantConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AssistantError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be
    /// serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AssistantError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/wren/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("wren").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("wren")
                .join("config.toml")
        } else {
            PathBuf::from("wren-config.toml")
        }
    }
}
