//! Service health supervision, recovery, and the outage command queue.
//!
//! # Design
//!
//! [`HealthSupervisor`] is **pure logic**: it accepts probe outcomes and the
//! current instant, and produces [`HealthAction`] values for the caller to
//! execute. Retry and backoff state live in the per-service records and are
//! advanced by one scheduler tick ([`run_health_stage`]), never by chains of
//! one-shot timers.

use crate::config::{HealthConfig, HealthEndpoints};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The services the supervisor watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    /// The language-model backend.
    LanguageModel,
    /// The application server (tool execution, account data).
    AppServer,
    /// The smart-home bridge.
    SmartHome,
    /// The vision capability. Checked on demand only.
    Vision,
    /// The speech-synthesis capability. Checked on demand only.
    SpeechSynth,
}

impl ServiceId {
    /// All monitored services.
    pub const ALL: [ServiceId; 5] = [
        Self::LanguageModel,
        Self::AppServer,
        Self::SmartHome,
        Self::Vision,
        Self::SpeechSynth,
    ];

    /// Core services: the overall status is `Offline` when one of these is.
    pub fn is_core(self) -> bool {
        matches!(self, Self::LanguageModel | Self::AppServer)
    }

    /// Services polled on a timer (the rest are on-demand).
    pub fn is_polled(self) -> bool {
        matches!(self, Self::LanguageModel | Self::AppServer | Self::SmartHome)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LanguageModel => "language-model",
            Self::AppServer => "app-server",
            Self::SmartHome => "smart-home",
            Self::Vision => "vision",
            Self::SpeechSynth => "speech-synth",
        };
        write!(f, "{name}")
    }
}

/// Coarse health of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Responding normally.
    Healthy,
    /// One or two consecutive failures; still usable.
    Degraded,
    /// Reached the failure threshold; recovery exhausted or not applicable.
    Offline,
    /// Reached the failure threshold; a recovery attempt is in flight.
    Recovering,
}

/// Aggregated status across all services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Every service healthy.
    Healthy,
    /// At least one service degraded or a non-core service offline.
    Degraded,
    /// A core service is offline.
    Offline,
    /// A recovery is in flight somewhere.
    Recovering,
}

/// Recovery in progress for a service, advanced by the scheduler tick.
#[derive(Debug, Clone)]
enum Recovery {
    /// Model backend restart was requested; fast re-probes until it answers
    /// or the attempt budget runs out.
    ModelRestart {
        attempts: u32,
        next_probe_at: Instant,
    },
    /// App-server reconnect with exponential backoff.
    Reconnect {
        delay: Duration,
        next_probe_at: Instant,
    },
}

/// Health record for one service. Mutated only by the supervisor.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    /// Current status.
    pub status: ServiceStatus,
    /// Wall-clock time of the most recent check.
    pub last_check: Option<DateTime<Utc>>,
    /// Wall-clock time the service last passed a check.
    pub last_healthy: Option<DateTime<Utc>>,
    /// Consecutive failed checks (resets on success).
    pub consecutive_failures: u32,
    /// Message from the most recent failure, if any.
    pub message: Option<String>,
    recovery: Option<Recovery>,
    next_poll_at: Option<Instant>,
}

impl ServiceHealth {
    fn new(next_poll_at: Option<Instant>) -> Self {
        Self {
            status: ServiceStatus::Healthy,
            last_check: None,
            last_healthy: None,
            consecutive_failures: 0,
            message: None,
            recovery: None,
            next_poll_at,
        }
    }
}

/// Outcome of one reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The service answered.
    Healthy,
    /// The probe failed with the given reason.
    Failed(String),
}

/// A user request deferred during an outage.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    /// Stable identifier.
    pub id: Uuid,
    /// Original utterance text.
    pub text: String,
    /// When the command was queued.
    pub queued_at: Instant,
    /// Replay attempts so far.
    pub retries: u32,
}

/// Actions the supervisor asks its caller to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    /// Ask the platform to restart the language-model backend process.
    RestartModelBackend,
    /// Model recovery gave up; canned fallback responses take over.
    EnterFallbackMode,
    /// The model backend is reachable again; leave fallback mode.
    LeaveFallbackMode,
    /// Replay these queued commands, in original order.
    ReplayCommands(Vec<QueuedCommand>),
}

/// Serializable point-in-time view for subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Aggregated status.
    pub overall: OverallStatus,
    /// Per-service status.
    pub services: HashMap<String, ServiceSnapshot>,
    /// Commands waiting for replay, oldest first.
    pub queue: Vec<QueuedCommandSnapshot>,
    /// Whether canned fallback responses are active.
    pub fallback_mode: bool,
}

impl HealthSnapshot {
    /// Commands waiting for replay.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }
}

/// Read-only view of one queued command.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedCommandSnapshot {
    /// Stable identifier.
    pub id: String,
    /// Original utterance text.
    pub text: String,
    /// Seconds since the command was queued.
    pub age_s: u64,
    /// Replay attempts so far.
    pub retries: u32,
}

/// Per-service slice of [`HealthSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    /// Current status.
    pub status: ServiceStatus,
    /// Wall-clock time of the most recent check.
    pub last_check: Option<DateTime<Utc>>,
    /// Wall-clock time the service last passed a check.
    pub last_healthy: Option<DateTime<Utc>>,
    /// Consecutive failed checks.
    pub consecutive_failures: u32,
    /// Most recent failure message.
    pub message: Option<String>,
}

/// Tracks per-service health, drives recovery, and owns the outage queue.
#[derive(Debug)]
pub struct HealthSupervisor {
    config: HealthConfig,
    services: HashMap<ServiceId, ServiceHealth>,
    queue: VecDeque<QueuedCommand>,
    fallback_mode: bool,
    next_sweep_at: Instant,
}

impl HealthSupervisor {
    /// Create a supervisor with all services assumed healthy.
    pub fn new(config: HealthConfig, now: Instant) -> Self {
        let mut services = HashMap::new();
        for id in ServiceId::ALL {
            // Polled services get an immediate first probe; on-demand ones none.
            let next = id.is_polled().then_some(now);
            services.insert(id, ServiceHealth::new(next));
        }
        let sweep = Duration::from_secs(config.queue_sweep_interval_s);
        Self {
            config,
            services,
            queue: VecDeque::new(),
            fallback_mode: false,
            next_sweep_at: now + sweep,
        }
    }

    /// Record of one service.
    pub fn service(&self, id: ServiceId) -> &ServiceHealth {
        &self.services[&id]
    }

    /// Whether canned fallback responses are active.
    pub fn fallback_mode(&self) -> bool {
        self.fallback_mode
    }

    /// Commands currently queued, oldest first.
    pub fn queued_commands(&self) -> Vec<QueuedCommand> {
        self.queue.iter().cloned().collect()
    }

    /// Services whose scheduled poll or recovery re-probe is due. Advances
    /// the schedule, so each due service is returned once.
    pub fn due_probes(&mut self, now: Instant) -> Vec<ServiceId> {
        let mut due = Vec::new();
        for id in ServiceId::ALL {
            let interval = self.config.poll_interval(id);
            let record = self
                .services
                .entry(id)
                .or_insert_with(|| ServiceHealth::new(None));
            match &record.recovery {
                Some(Recovery::ModelRestart { next_probe_at, .. })
                | Some(Recovery::Reconnect { next_probe_at, .. }) => {
                    if now >= *next_probe_at {
                        due.push(id);
                        // The re-probe schedule advances when the result lands.
                    }
                }
                None => {
                    if let Some(at) = record.next_poll_at
                        && now >= at
                    {
                        record.next_poll_at = Some(now + interval);
                        due.push(id);
                    }
                }
            }
        }
        due
    }

    /// Record a probe result and advance the service's recovery state.
    pub fn record_probe(
        &mut self,
        id: ServiceId,
        outcome: ProbeOutcome,
        now: Instant,
    ) -> Vec<HealthAction> {
        let threshold = self.config.offline_threshold;
        let record = self
            .services
            .entry(id)
            .or_insert_with(|| ServiceHealth::new(None));
        record.last_check = Some(Utc::now());

        let mut actions = Vec::new();
        match outcome {
            ProbeOutcome::Healthy => {
                record.consecutive_failures = 0;
                record.last_healthy = Some(Utc::now());
                record.message = None;
                record.recovery = None;
                let was = record.status;
                record.status = ServiceStatus::Healthy;
                if was != ServiceStatus::Healthy {
                    info!(service = %id, "service recovered");
                }

                if id == ServiceId::LanguageModel && self.fallback_mode {
                    self.fallback_mode = false;
                    actions.push(HealthAction::LeaveFallbackMode);
                }
                if let Some(replay) = self.maybe_drain_queue() {
                    actions.push(HealthAction::ReplayCommands(replay));
                }
            }
            ProbeOutcome::Failed(reason) => {
                record.consecutive_failures += 1;
                record.message = Some(reason.clone());

                match &mut record.recovery {
                    // Already recovering: advance the schedule, never re-fire
                    // the recovery action.
                    Some(Recovery::ModelRestart {
                        attempts,
                        next_probe_at,
                    }) => {
                        *attempts += 1;
                        if *attempts >= self.config.model_recovery_max_attempts {
                            warn!(service = %id, attempts = *attempts, "model restart gave up");
                            record.recovery = None;
                            record.status = ServiceStatus::Offline;
                            if !self.fallback_mode {
                                self.fallback_mode = true;
                                actions.push(HealthAction::EnterFallbackMode);
                            }
                        } else {
                            *next_probe_at = now
                                + Duration::from_secs(
                                    self.config.model_recovery_probe_interval_s,
                                );
                        }
                    }
                    Some(Recovery::Reconnect {
                        delay,
                        next_probe_at,
                    }) => {
                        *delay = (*delay * 2)
                            .min(Duration::from_secs(self.config.app_server_backoff_cap_s));
                        *next_probe_at = now + *delay;
                        debug!(service = %id, ?delay, "reconnect backoff");
                    }
                    None => {
                        if record.consecutive_failures < threshold {
                            record.status = ServiceStatus::Degraded;
                        } else if record.consecutive_failures == threshold {
                            warn!(service = %id, %reason, "service offline");
                            // Recovery fires exactly once per offline episode.
                            match id {
                                ServiceId::LanguageModel => {
                                    record.status = ServiceStatus::Recovering;
                                    record.recovery = Some(Recovery::ModelRestart {
                                        attempts: 0,
                                        next_probe_at: now
                                            + Duration::from_secs(
                                                self.config.model_recovery_probe_interval_s,
                                            ),
                                    });
                                    actions.push(HealthAction::RestartModelBackend);
                                }
                                ServiceId::AppServer => {
                                    let delay = Duration::from_secs(
                                        self.config.app_server_backoff_initial_s,
                                    );
                                    record.status = ServiceStatus::Recovering;
                                    record.recovery = Some(Recovery::Reconnect {
                                        delay,
                                        next_probe_at: now + delay,
                                    });
                                }
                                ServiceId::SmartHome
                                | ServiceId::Vision
                                | ServiceId::SpeechSynth => {
                                    record.status = ServiceStatus::Offline;
                                }
                            }
                        } else {
                            // Past the threshold with no recovery (gave up or
                            // non-recovering service): stay offline.
                            record.status = ServiceStatus::Offline;
                        }
                    }
                }
            }
        }
        actions
    }

    /// Queue a command for replay after the outage. Capacity overflow drops
    /// the oldest entry silently.
    pub fn enqueue_command(&mut self, text: &str, now: Instant) -> usize {
        if self.queue.len() >= self.config.queue_capacity {
            let dropped = self.queue.pop_front();
            debug!(?dropped, "queue full, dropped oldest");
        }
        self.queue.push_back(QueuedCommand {
            id: Uuid::new_v4(),
            text: text.to_owned(),
            queued_at: now,
            retries: 0,
        });
        self.queue.len()
    }

    /// Purge queue entries past the TTL if a sweep is due. Returns how many
    /// were purged.
    pub fn maybe_sweep(&mut self, now: Instant) -> usize {
        if now < self.next_sweep_at {
            return 0;
        }
        self.next_sweep_at = now + Duration::from_secs(self.config.queue_sweep_interval_s);
        let ttl = Duration::from_secs(self.config.queue_ttl_s);
        let before = self.queue.len();
        self.queue
            .retain(|c| now.saturating_duration_since(c.queued_at) <= ttl);
        let purged = before - self.queue.len();
        if purged > 0 {
            info!(purged, "queued commands expired");
        }
        purged
    }

    /// Aggregate status across services.
    pub fn overall(&self) -> OverallStatus {
        let statuses = |f: fn(&ServiceStatus) -> bool| {
            ServiceId::ALL
                .iter()
                .any(|id| f(&self.services[id].status))
        };
        if statuses(|s| *s == ServiceStatus::Recovering) {
            OverallStatus::Recovering
        } else if ServiceId::ALL
            .iter()
            .any(|id| id.is_core() && self.services[id].status == ServiceStatus::Offline)
        {
            OverallStatus::Offline
        } else if statuses(|s| *s != ServiceStatus::Healthy) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        }
    }

    /// Serializable snapshot for subscribers.
    pub fn snapshot(&self) -> HealthSnapshot {
        let services = ServiceId::ALL
            .iter()
            .map(|id| {
                let r = &self.services[id];
                (
                    id.to_string(),
                    ServiceSnapshot {
                        status: r.status,
                        last_check: r.last_check,
                        last_healthy: r.last_healthy,
                        consecutive_failures: r.consecutive_failures,
                        message: r.message.clone(),
                    },
                )
            })
            .collect();
        let now = Instant::now();
        let queue = self
            .queue
            .iter()
            .map(|c| QueuedCommandSnapshot {
                id: c.id.to_string(),
                text: c.text.clone(),
                age_s: now.saturating_duration_since(c.queued_at).as_secs(),
                retries: c.retries,
            })
            .collect();
        HealthSnapshot {
            overall: self.overall(),
            services,
            queue,
            fallback_mode: self.fallback_mode,
        }
    }

    /// Drain the queue when both gating services are healthy again.
    fn maybe_drain_queue(&mut self) -> Option<Vec<QueuedCommand>> {
        if self.queue.is_empty() {
            return None;
        }
        let healthy = |id: ServiceId| self.services[&id].status == ServiceStatus::Healthy;
        if healthy(ServiceId::LanguageModel) && healthy(ServiceId::AppServer) {
            let mut drained: Vec<QueuedCommand> = self.queue.drain(..).collect();
            for c in &mut drained {
                c.retries += 1;
            }
            info!(count = drained.len(), "replaying queued commands");
            Some(drained)
        } else {
            None
        }
    }
}

impl HealthConfig {
    /// Poll interval for a timer-polled service.
    fn poll_interval(&self, id: ServiceId) -> Duration {
        let secs = match id {
            ServiceId::LanguageModel => self.model_poll_interval_s,
            ServiceId::AppServer => self.app_server_poll_interval_s,
            ServiceId::SmartHome => self.smart_home_poll_interval_s,
            // On-demand services are never rescheduled from here.
            ServiceId::Vision | ServiceId::SpeechSynth => self.smart_home_poll_interval_s,
        };
        Duration::from_secs(secs)
    }
}

// ── Probes ───────────────────────────────────────────────────────────────────

/// One HTTP(S) reachability check per monitored service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Check the service once. Must respect its own timeout.
    async fn check(&self, service: ServiceId) -> ProbeOutcome;
}

/// Production probe: a GET against each service's health endpoint.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    endpoints: HealthEndpoints,
}

impl HttpProbe {
    /// Build a probe with the configured per-request timeout.
    pub fn new(config: &HealthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_s))
            .build()
            .map_err(|e| crate::error::AssistantError::Health(e.to_string()))?;
        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
        })
    }

    fn url(&self, service: ServiceId) -> &str {
        match service {
            ServiceId::LanguageModel => &self.endpoints.language_model,
            ServiceId::AppServer => &self.endpoints.app_server,
            ServiceId::SmartHome => &self.endpoints.smart_home,
            ServiceId::Vision => &self.endpoints.vision,
            ServiceId::SpeechSynth => &self.endpoints.speech_synth,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, service: ServiceId) -> ProbeOutcome {
        match self.client.get(self.url(service)).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => ProbeOutcome::Failed(format!("status {}", response.status())),
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }
}

// ── Stage runner ─────────────────────────────────────────────────────────────

/// Commands accepted by the health stage.
#[derive(Debug, Clone)]
pub enum HealthCommand {
    /// Queue an utterance for replay after the outage.
    Enqueue(String),
    /// Probe an on-demand service (vision, speech synthesis) now.
    CheckNow(ServiceId),
}

/// Events the health stage emits toward the orchestrator.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// The aggregate status changed.
    OverallChanged(OverallStatus),
    /// Canned fallback responses took over for the model backend.
    FallbackEngaged,
    /// The model backend is reachable again.
    FallbackLifted,
    /// The platform should restart the model backend process.
    RestartModelBackend,
    /// Replay these commands through the normal dispatch path.
    Replay(Vec<QueuedCommand>),
    /// Queue depth changed.
    QueueDepth(usize),
}

/// Granularity of the recovery/backoff scheduler.
const TICK: Duration = Duration::from_secs(1);

/// Run health supervision until cancelled.
///
/// One tick drives everything: due polls, recovery re-probes, and queue
/// sweeps. Probes run as spawned tasks so a slow endpoint never stalls the
/// tick; their completions come back through an internal channel.
pub async fn run_health_stage(
    mut supervisor: HealthSupervisor,
    probe: Arc<dyn HealthProbe>,
    mut cmd_rx: mpsc::UnboundedReceiver<HealthCommand>,
    event_tx: mpsc::UnboundedSender<HealthEvent>,
    snapshot_tx: watch::Sender<HealthSnapshot>,
    cancel: CancellationToken,
) {
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(ServiceId, ProbeOutcome)>();
    let mut in_flight: HashSet<ServiceId> = HashSet::new();
    let mut tick = tokio::time::interval(TICK);
    let mut last_overall = supervisor.overall();

    info!("health supervisor started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {
                let now = Instant::now();
                supervisor.maybe_sweep(now);
                for id in supervisor.due_probes(now) {
                    if !in_flight.insert(id) {
                        continue;
                    }
                    let probe = Arc::clone(&probe);
                    let result_tx = result_tx.clone();
                    tokio::spawn(async move {
                        let outcome = probe.check(id).await;
                        let _ = result_tx.send((id, outcome));
                    });
                }
            }
            result = result_rx.recv() => {
                let Some((id, outcome)) = result else { break };
                in_flight.remove(&id);
                let actions = supervisor.record_probe(id, outcome, Instant::now());
                if forward_actions(&actions, &event_tx).is_err() {
                    break;
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    HealthCommand::Enqueue(text) => {
                        let depth = supervisor.enqueue_command(&text, Instant::now());
                        if event_tx.send(HealthEvent::QueueDepth(depth)).is_err() {
                            break;
                        }
                    }
                    HealthCommand::CheckNow(id) => {
                        if in_flight.insert(id) {
                            let probe = Arc::clone(&probe);
                            let result_tx = result_tx.clone();
                            tokio::spawn(async move {
                                let outcome = probe.check(id).await;
                                let _ = result_tx.send((id, outcome));
                            });
                        }
                    }
                }
            }
        }

        let overall = supervisor.overall();
        if overall != last_overall {
            last_overall = overall;
            if event_tx.send(HealthEvent::OverallChanged(overall)).is_err() {
                break;
            }
        }
        let _ = snapshot_tx.send(supervisor.snapshot());
    }
}

/// Map supervisor actions to stage events. `Err` when the channel closed.
fn forward_actions(
    actions: &[HealthAction],
    event_tx: &mpsc::UnboundedSender<HealthEvent>,
) -> std::result::Result<(), ()> {
    for action in actions {
        let event = match action {
            HealthAction::RestartModelBackend => HealthEvent::RestartModelBackend,
            HealthAction::EnterFallbackMode => HealthEvent::FallbackEngaged,
            HealthAction::LeaveFallbackMode => HealthEvent::FallbackLifted,
            HealthAction::ReplayCommands(commands) => HealthEvent::Replay(commands.clone()),
        };
        event_tx.send(event).map_err(|_| ())?;
    }
    Ok(())
}
