//! Turn-taking guard: converts raw recognizer fragments into well-formed
//! utterance events while rejecting the assistant's own synthesized speech
//! and background noise.
//!
//! # Design
//!
//! [`TurnTakingGuard`] is **pure logic**: the caller passes the current
//! instant into every method and no timers run inside it.
//! [`run_turn_taking_stage`] is the async stage that owns the silence timer
//! and connects the guard to the orchestrator's channels.

use crate::config::TurnTakingConfig;
use crate::error::RecognitionErrorKind;
use crate::events::ConversationEvent;
use crate::phrases;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the guard currently knows about the orchestrator's side of the
/// conversation. Kept deliberately coarse: the guard only needs to know
/// whether the wake word gates input and whether finals are barge-in
/// candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Idle: only fragments containing the wake word get through.
    Asleep,
    /// Listening: finals batch into utterances flushed on silence.
    Listening,
    /// Assistant busy (processing, executing, speaking an utterance):
    /// finals are stop-phrase / barge-in candidates.
    Engaged,
}

/// Why a fragment was thrown away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Inside the hard cooldown window around assistant speech.
    Cooldown,
    /// Matches one of the assistant's own stock phrases.
    CannedPhrase,
    /// Appears verbatim inside the last spoken response.
    EchoSubstring,
    /// High word overlap with the last response just after speech end.
    EchoOverlap,
    /// The fragment's leading characters appear in the last response.
    EchoPrefix,
    /// Asleep and the fragment does not contain the wake word.
    NotAwake,
}

/// Classification of one incoming fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Fragment discarded; nothing reaches the state machine.
    Discarded(DiscardReason),
    /// Interim text for UI feedback only.
    Interim(String),
    /// Final fragment appended to the utterance buffer; silence timer armed.
    Buffered,
    /// Wake word heard while asleep. `command` carries any trailing text,
    /// which becomes the first turn without waiting out a silence window.
    Wake {
        /// Command text that followed the wake word, if any.
        command: Option<String>,
    },
    /// Pure stop phrase while the assistant was engaged.
    Stop,
    /// Barge-in utterance (wake word stripped) while the assistant was engaged.
    BargeIn(String),
}

/// Turn-taking and self-echo suppression state.
#[derive(Debug)]
pub struct TurnTakingGuard {
    config: TurnTakingConfig,
    wake_word: String,
    stop_phrases: Vec<String>,
    mode: GuardMode,
    last_spoken_text: String,
    last_spoke_at: Option<Instant>,
    last_speech_end: Option<Instant>,
    utterance: String,
    silence_deadline: Option<Instant>,
}

impl TurnTakingGuard {
    /// Create a guard in the asleep mode.
    pub fn new(config: TurnTakingConfig, wake_word: &str, stop_phrases: &[String]) -> Self {
        Self {
            config,
            wake_word: wake_word.to_lowercase(),
            stop_phrases: stop_phrases.iter().map(|p| normalize(p)).collect(),
            mode: GuardMode::Asleep,
            last_spoken_text: String::new(),
            last_spoke_at: None,
            last_speech_end: None,
            utterance: String::new(),
            silence_deadline: None,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Update the mode from the orchestrator's authoritative state.
    pub fn set_mode(&mut self, mode: GuardMode) {
        if mode != self.mode {
            self.mode = mode;
            if mode == GuardMode::Asleep {
                self.utterance.clear();
                self.silence_deadline = None;
            }
        }
    }

    /// Record that the assistant started speaking `text`. Arms the cooldown
    /// window and the self-echo reference text.
    pub fn note_speech_start(&mut self, text: &str, now: Instant) {
        self.last_spoken_text = normalize(text);
        self.last_spoke_at = Some(now);
    }

    /// Record that assistant speech ended. Re-arms the cooldown window so
    /// trailing echo right after playback is still suppressed.
    pub fn note_speech_end(&mut self, now: Instant) {
        self.last_speech_end = Some(now);
    }

    /// Deadline at which the buffered utterance should flush, if one is armed.
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Classify a non-final fragment. Survivors are UI feedback only and
    /// re-arm the silence timer when an utterance is already buffering.
    pub fn on_interim(&mut self, text: &str, now: Instant) -> Verdict {
        if self.mode == GuardMode::Asleep {
            return Verdict::Discarded(DiscardReason::NotAwake);
        }
        if let Some(reason) = self.suppress(text, now) {
            return Verdict::Discarded(reason);
        }
        if self.silence_deadline.is_some() {
            self.arm_silence(now);
        }
        Verdict::Interim(text.to_owned())
    }

    /// Classify a final fragment.
    pub fn on_final(&mut self, text: &str, now: Instant) -> Verdict {
        let text = text.trim();
        if text.is_empty() {
            return Verdict::Discarded(DiscardReason::NotAwake);
        }
        if let Some(reason) = self.suppress(text, now) {
            return Verdict::Discarded(reason);
        }

        match self.mode {
            GuardMode::Asleep => {
                let lower = text.to_lowercase();
                match find_wake_word(&lower, &self.wake_word) {
                    Some((pos, len)) => {
                        // Optimistic: the orchestrator will confirm shortly.
                        self.mode = GuardMode::Listening;
                        let command = extract_command_after_wake(text, pos, len);
                        Verdict::Wake { command }
                    }
                    None => Verdict::Discarded(DiscardReason::NotAwake),
                }
            }
            GuardMode::Engaged => {
                let clean = normalize(text);
                if self.stop_phrases.iter().any(|p| *p == clean) {
                    return Verdict::Stop;
                }
                let lower = text.to_lowercase();
                let stripped = match find_wake_word(&lower, &self.wake_word) {
                    Some((pos, len)) => {
                        extract_command_after_wake(text, pos, len).unwrap_or_default()
                    }
                    None => text.to_owned(),
                };
                if stripped.is_empty() {
                    // Bare name while we're busy: treat as a stop request.
                    return Verdict::Stop;
                }
                Verdict::BargeIn(stripped)
            }
            GuardMode::Listening => {
                if !self.utterance.is_empty() {
                    self.utterance.push(' ');
                }
                self.utterance.push_str(text);
                self.arm_silence(now);
                Verdict::Buffered
            }
        }
    }

    /// Flush the buffered utterance if the silence window has elapsed.
    pub fn on_silence(&mut self, now: Instant) -> Option<String> {
        let deadline = self.silence_deadline?;
        if now < deadline {
            return None;
        }
        self.silence_deadline = None;
        if self.utterance.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.utterance))
    }

    /// How to react to a recognizer error.
    ///
    /// "No speech" and network failures restart the recognizer after a short
    /// fixed delay; everything else is surfaced but does not stop the guard.
    pub fn on_recognizer_error(&self, kind: RecognitionErrorKind) -> Option<Duration> {
        kind.auto_restarts()
            .then(|| Duration::from_millis(self.config.recognizer_restart_delay_ms))
    }

    fn arm_silence(&mut self, now: Instant) {
        self.silence_deadline = Some(now + Duration::from_millis(self.config.silence_window_ms));
    }

    /// Hard cooldown plus the self-hearing heuristics, in order.
    fn suppress(&self, text: &str, now: Instant) -> Option<DiscardReason> {
        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        let in_cooldown = |at: Option<Instant>| {
            at.is_some_and(|t| now.checked_duration_since(t).is_some_and(|d| d < cooldown))
        };
        if in_cooldown(self.last_spoke_at) || in_cooldown(self.last_speech_end) {
            return Some(DiscardReason::Cooldown);
        }

        let clean = normalize(text);
        if clean.is_empty() {
            return None;
        }

        // (a) The fragment is one of our own stock phrases (or a prefix of one).
        if phrases::canned()
            .iter()
            .any(|p| normalize(p).starts_with(clean.as_str()))
        {
            return Some(DiscardReason::CannedPhrase);
        }

        if self.last_spoken_text.is_empty() {
            return None;
        }

        // (b) The fragment appears verbatim inside what we just said.
        if self.last_spoken_text.contains(&clean) {
            return Some(DiscardReason::EchoSubstring);
        }

        // (c) Shortly after speech end, heavy word overlap with what we said.
        let overlap_window = Duration::from_millis(self.config.echo_overlap_window_ms);
        let near_speech_end = self.last_speech_end.is_some_and(|t| {
            now.checked_duration_since(t)
                .is_some_and(|d| d < overlap_window)
        });
        if near_speech_end && word_overlap(&clean, &self.last_spoken_text)
            > self.config.echo_overlap_threshold
        {
            return Some(DiscardReason::EchoOverlap);
        }

        // (d) The fragment's lead-in appears inside what we said. Only applies
        // to fragments long enough that this is not just check (b) again.
        if clean.len() >= self.config.echo_prefix_chars {
            let prefix: String = clean.chars().take(self.config.echo_prefix_chars).collect();
            if self.last_spoken_text.contains(&prefix) {
                return Some(DiscardReason::EchoPrefix);
            }
        }

        None
    }
}

/// Fraction of the fragment's words that also occur in the spoken text.
fn word_overlap(fragment: &str, spoken: &str) -> f32 {
    let spoken_words: std::collections::HashSet<&str> = spoken.split_whitespace().collect();
    let words: Vec<&str> = fragment.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| spoken_words.contains(**w)).count();
    hits as f32 / words.len() as f32
}

/// Lowercase, drop punctuation, collapse whitespace, expand contractions.
pub(crate) fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let expanded = expand_contractions(&lowered);
    expanded
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expand common English contractions so recognizer output like "that'll do"
/// matches the configured stop phrase "that will do".
fn expand_contractions(text: &str) -> String {
    text.replace("that'll", "that will")
        .replace("i'll", "i will")
        .replace("i'm", "i am")
        .replace("it's", "it is")
        .replace("can't", "cannot")
        .replace("won't", "will not")
        .replace("don't", "do not")
        .replace("didn't", "did not")
        .replace("isn't", "is not")
}

/// Find the wake phrase (or a close recognizer confusion of it) in `lower`,
/// returning the byte position and matched length.
///
/// Variants are matched on word boundaries so "wrench" never matches "wren".
pub(crate) fn find_wake_word(lower: &str, wake_word: &str) -> Option<(usize, usize)> {
    if wake_word.is_empty() {
        return None;
    }

    let mut variants: Vec<String> = vec![wake_word.to_owned()];
    if let Some(name) = wake_word.strip_prefix("hey ") {
        // Recognizers regularly mangle the greeting half of the phrase.
        for lead in ["hey", "hey,", "hay", "hi", "a"] {
            for n in name_confusions(name) {
                variants.push(format!("{lead} {n}"));
            }
        }
    } else {
        variants.extend(name_confusions(wake_word).into_iter().map(str::to_owned));
    }
    variants.sort_by_key(|v| std::cmp::Reverse(v.len()));
    variants.dedup();

    let mut best: Option<(usize, usize)> = None;
    for v in &variants {
        let mut search_from = 0;
        while search_from < lower.len() {
            let Some(rel) = lower[search_from..].find(v.as_str()) else {
                break;
            };
            let pos = search_from + rel;
            let end = pos + v.len();

            let start_ok = pos == 0 || !lower.as_bytes()[pos - 1].is_ascii_alphanumeric();
            let end_ok = end >= lower.len() || !lower.as_bytes()[end].is_ascii_alphanumeric();
            if start_ok && end_ok {
                match best {
                    Some((bp, _)) if bp <= pos => {}
                    _ => best = Some((pos, v.len())),
                }
                break;
            }
            search_from = pos + 1;
        }
    }
    best
}

/// Common recognizer confusions for the assistant's name.
fn name_confusions(name: &str) -> Vec<&str> {
    match name {
        "wren" => vec!["wren", "ren", "rennes", "rin", "wrenn"],
        other => vec![other],
    }
}

/// Text after the wake word becomes the first command; punctuation between the
/// wake word and the command is dropped.
fn extract_command_after_wake(text: &str, pos: usize, matched_len: usize) -> Option<String> {
    let after = text[pos + matched_len..]
        .trim_start_matches([',', ':', '.', '!', '?', ' '])
        .trim();
    if after.is_empty() {
        None
    } else {
        Some(after.to_owned())
    }
}

// ── Stage runner ─────────────────────────────────────────────────────────────

/// Inputs fed to the turn-taking stage.
#[derive(Debug, Clone)]
pub enum GuardInput {
    /// Non-final recognizer fragment.
    Interim(String),
    /// Final recognizer fragment.
    Final(String),
    /// Recognizer failure.
    RecognizerError(RecognitionErrorKind, String),
    /// The assistant started speaking the given text.
    SpokeStart(String),
    /// The assistant finished (or aborted) speaking.
    SpokeEnd,
    /// Authoritative mode update from the orchestrator.
    Mode(GuardMode),
}

/// Outputs emitted by the turn-taking stage.
#[derive(Debug, Clone)]
pub enum GuardOutput {
    /// A conversation event for the state machine.
    Event(ConversationEvent),
    /// Interim text for UI feedback.
    Interim(String),
    /// The recognizer should be restarted (the stage already waited out the
    /// restart delay).
    RestartRecognizer,
    /// Recognizer fault the user should hear about.
    RecognizerFault(String),
}

/// Run the turn-taking guard as a pipeline stage until cancelled.
///
/// Owns the silence timer: when the window elapses with no further fragments,
/// the buffered text flushes as one `FinalTranscript` event.
pub async fn run_turn_taking_stage(
    mut guard: TurnTakingGuard,
    mut input_rx: mpsc::UnboundedReceiver<GuardInput>,
    output_tx: mpsc::UnboundedSender<GuardOutput>,
    cancel: CancellationToken,
) {
    info!("turn-taking guard started");

    loop {
        let silence = async {
            match guard.silence_deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = silence => {
                if let Some(utterance) = guard.on_silence(Instant::now()) {
                    info!(text = %utterance, "utterance flushed");
                    let event = ConversationEvent::FinalTranscript(utterance);
                    if output_tx.send(GuardOutput::Event(event)).is_err() {
                        break;
                    }
                }
            }
            input = input_rx.recv() => {
                let Some(input) = input else { break };
                if handle_input(&mut guard, input, &output_tx).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Returns `Err(())` when the output channel closed.
async fn handle_input(
    guard: &mut TurnTakingGuard,
    input: GuardInput,
    output_tx: &mpsc::UnboundedSender<GuardOutput>,
) -> std::result::Result<(), ()> {
    let now = Instant::now();
    let send = |out: GuardOutput| output_tx.send(out).map_err(|_| ());

    match input {
        GuardInput::Mode(mode) => {
            guard.set_mode(mode);
            Ok(())
        }
        GuardInput::SpokeStart(text) => {
            guard.note_speech_start(&text, now);
            Ok(())
        }
        GuardInput::SpokeEnd => {
            guard.note_speech_end(now);
            Ok(())
        }
        GuardInput::Interim(text) => match guard.on_interim(&text, now) {
            Verdict::Interim(text) => send(GuardOutput::Interim(text)),
            _ => Ok(()),
        },
        GuardInput::Final(text) => match guard.on_final(&text, now) {
            Verdict::Discarded(reason) => {
                info!(?reason, text = %text, "fragment discarded");
                Ok(())
            }
            Verdict::Buffered | Verdict::Interim(_) => Ok(()),
            Verdict::Wake { command } => {
                send(GuardOutput::Event(ConversationEvent::Wake))?;
                match command {
                    // Trailing text after the wake word skips the silence wait.
                    Some(command) => {
                        send(GuardOutput::Event(ConversationEvent::FinalTranscript(command)))
                    }
                    None => Ok(()),
                }
            }
            Verdict::Stop => send(GuardOutput::Event(ConversationEvent::Interrupt)),
            Verdict::BargeIn(text) => {
                send(GuardOutput::Event(ConversationEvent::BargeIn(text)))
            }
        },
        GuardInput::RecognizerError(kind, message) => {
            match guard.on_recognizer_error(kind) {
                Some(delay) => {
                    warn!(?kind, %message, "recognizer error, restarting");
                    tokio::time::sleep(delay).await;
                    send(GuardOutput::RestartRecognizer)
                }
                None => {
                    warn!(?kind, %message, "recognizer error surfaced");
                    send(GuardOutput::RecognizerFault(message))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> TurnTakingGuard {
        let conversation = crate::config::ConversationConfig::default();
        TurnTakingGuard::new(
            TurnTakingConfig::default(),
            &conversation.wake_word,
            &conversation.stop_phrases,
        )
    }

    fn awake(mut g: TurnTakingGuard) -> TurnTakingGuard {
        g.set_mode(GuardMode::Listening);
        g
    }

    #[test]
    fn fragments_inside_cooldown_are_discarded() {
        let mut g = awake(guard());
        let now = Instant::now();
        g.note_speech_start("the lights are on", now);
        g.note_speech_end(now + Duration::from_millis(100));

        let verdict = g.on_final("turn them off", now + Duration::from_millis(400));
        assert_eq!(verdict, Verdict::Discarded(DiscardReason::Cooldown));

        // Also within 800ms of speech END even though start was long ago.
        let verdict = g.on_final("turn them off", now + Duration::from_millis(850));
        assert_eq!(verdict, Verdict::Discarded(DiscardReason::Cooldown));
    }

    #[test]
    fn echo_of_spoken_text_is_discarded_after_cooldown() {
        let mut g = awake(guard());
        let now = Instant::now();
        g.note_speech_start("The weather today is sunny and warm.", now);
        g.note_speech_end(now);

        let later = now + Duration::from_secs(2);
        let verdict = g.on_final("sunny and warm", later);
        assert_eq!(verdict, Verdict::Discarded(DiscardReason::EchoSubstring));
    }

    #[test]
    fn canned_phrase_echo_is_discarded() {
        let mut g = awake(guard());
        let verdict = g.on_final("I'm still working on that", Instant::now());
        assert_eq!(verdict, Verdict::Discarded(DiscardReason::CannedPhrase));
    }

    #[test]
    fn word_overlap_near_speech_end_is_discarded() {
        // The default cooldown (800ms) fully covers the 500ms overlap window;
        // shrink it so the overlap heuristic is what gets exercised.
        let config = TurnTakingConfig {
            cooldown_ms: 100,
            ..TurnTakingConfig::default()
        };
        let conversation = crate::config::ConversationConfig::default();
        let mut g =
            TurnTakingGuard::new(config, &conversation.wake_word, &conversation.stop_phrases);
        g.set_mode(GuardMode::Listening);

        let now = Instant::now();
        g.note_speech_start("your meeting with sam is at three today", now);
        g.note_speech_end(now);

        let probe = now + Duration::from_millis(300);
        let verdict = g.on_final("meeting with sam at three", probe);
        assert_eq!(verdict, Verdict::Discarded(DiscardReason::EchoOverlap));
    }

    #[test]
    fn genuine_speech_passes_and_buffers() {
        let mut g = awake(guard());
        let now = Instant::now();
        g.note_speech_start("the forecast is rain", now);
        g.note_speech_end(now);

        let later = now + Duration::from_secs(2);
        let verdict = g.on_final("what about tomorrow", later);
        assert_eq!(verdict, Verdict::Buffered);
        assert!(g.silence_deadline().is_some());

        // Another fragment before the window elapses joins the utterance.
        let verdict = g.on_final("in the evening", later + Duration::from_millis(500));
        assert_eq!(verdict, Verdict::Buffered);

        let flushed = g.on_silence(later + Duration::from_secs(3));
        assert_eq!(flushed.as_deref(), Some("what about tomorrow in the evening"));
        assert!(g.on_silence(later + Duration::from_secs(4)).is_none());
    }

    #[test]
    fn interim_resets_the_silence_timer() {
        let mut g = awake(guard());
        let now = Instant::now();
        assert_eq!(g.on_final("remind me to", now), Verdict::Buffered);
        let first_deadline = g.silence_deadline().expect("armed");

        let verdict = g.on_interim("water the", now + Duration::from_millis(700));
        assert!(matches!(verdict, Verdict::Interim(_)));
        assert!(g.silence_deadline().expect("re-armed") > first_deadline);
    }

    #[test]
    fn asleep_requires_wake_word() {
        let mut g = guard();
        let now = Instant::now();
        assert_eq!(
            g.on_final("what time is it", now),
            Verdict::Discarded(DiscardReason::NotAwake),
        );

        let verdict = g.on_final("Hey Wren, what time is it?", now);
        assert_eq!(
            verdict,
            Verdict::Wake {
                command: Some("what time is it?".to_owned()),
            },
        );
        // Guard flips itself to listening without waiting for confirmation.
        assert_eq!(g.mode(), GuardMode::Listening);
    }

    #[test]
    fn bare_wake_word_wakes_without_command() {
        let mut g = guard();
        assert_eq!(
            g.on_final("hey wren", Instant::now()),
            Verdict::Wake { command: None },
        );
    }

    #[test]
    fn wake_word_variants_respect_word_boundaries() {
        assert!(find_wake_word("hey wren turn it up", "hey wren").is_some());
        assert!(find_wake_word("hay ren what's up", "hey wren").is_some());
        // "wrench" must not match "wren".
        assert!(find_wake_word("pass me the hey wrench", "hey wren").is_none());
    }

    #[test]
    fn stop_phrase_while_engaged_is_stop() {
        let mut g = guard();
        g.set_mode(GuardMode::Engaged);
        assert_eq!(g.on_final("stop", Instant::now()), Verdict::Stop);
        assert_eq!(g.on_final("that'll do", Instant::now()), Verdict::Stop);
    }

    #[test]
    fn engaged_speech_is_barge_in_with_wake_word_stripped() {
        let mut g = guard();
        g.set_mode(GuardMode::Engaged);
        let verdict = g.on_final("hey wren what about tuesday", Instant::now());
        assert_eq!(verdict, Verdict::BargeIn("what about tuesday".to_owned()));

        let verdict = g.on_final("no the other one", Instant::now());
        assert_eq!(verdict, Verdict::BargeIn("no the other one".to_owned()));
    }

    #[test]
    fn recognizer_errors_pick_the_right_recovery() {
        let g = guard();
        assert!(g.on_recognizer_error(RecognitionErrorKind::NoSpeech).is_some());
        assert!(g.on_recognizer_error(RecognitionErrorKind::Network).is_some());
        assert!(g.on_recognizer_error(RecognitionErrorKind::Other).is_none());
    }

    #[test]
    fn going_asleep_drops_any_buffered_utterance() {
        let mut g = awake(guard());
        g.on_final("remind me", Instant::now());
        g.set_mode(GuardMode::Asleep);
        assert!(g.silence_deadline().is_none());
        assert!(g.on_silence(Instant::now() + Duration::from_secs(5)).is_none());
    }
}
