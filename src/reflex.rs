//! Instant pattern-matched commands that never touch the language model.
//!
//! Rules are tried in declared order and the first match wins. Ordering is a
//! correctness property, not a convenience: specific room/brightness patterns
//! sit above the generic on/off patterns, which sit above the catch-alls.
//! A handler may make one bounded synchronous call through [`DeviceBridge`]
//! but must never invoke the slow model path.
//!
//! Matching and handling are separate closures so callers can probe whether
//! a rule would fire without running its side effects.

use crate::error::Result;
use crate::turn::normalize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bounded local device operations available to reflex handlers.
pub trait DeviceBridge: Send + Sync {
    /// Switch lights in `room` (or everywhere when `None`) on or off.
    fn set_lights(&self, room: Option<&str>, on: bool) -> Result<()>;
    /// Set light brightness as a percentage.
    fn set_brightness(&self, room: Option<&str>, percent: u8) -> Result<()>;
    /// Set playback volume as a percentage.
    fn set_volume(&self, percent: u8) -> Result<()>;
}

/// A bridge that acknowledges every command without touching hardware.
/// Used by the console driver and in tests.
#[derive(Debug, Default)]
pub struct NullBridge;

impl DeviceBridge for NullBridge {
    fn set_lights(&self, room: Option<&str>, on: bool) -> Result<()> {
        debug!(?room, on, "null bridge: set_lights");
        Ok(())
    }

    fn set_brightness(&self, room: Option<&str>, percent: u8) -> Result<()> {
        debug!(?room, percent, "null bridge: set_brightness");
        Ok(())
    }

    fn set_volume(&self, percent: u8) -> Result<()> {
        debug!(percent, "null bridge: set_volume");
        Ok(())
    }
}

type MatchFn = Box<dyn Fn(&str) -> bool + Send + Sync>;
type HandleFn = Box<dyn Fn(&str, &dyn DeviceBridge) -> Result<String> + Send + Sync>;

/// One pattern + handler pair. Both closures receive the normalized text.
pub struct ReflexRule {
    name: &'static str,
    matches: MatchFn,
    handle: HandleFn,
}

impl ReflexRule {
    /// Build a rule from a name, a pure matcher, and a handler.
    pub fn new(
        name: &'static str,
        matches: impl Fn(&str) -> bool + Send + Sync + 'static,
        handle: impl Fn(&str, &dyn DeviceBridge) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            matches: Box::new(matches),
            handle: Box::new(handle),
        }
    }
}

impl std::fmt::Debug for ReflexRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflexRule").field("name", &self.name).finish()
    }
}

/// Result of a reflex hit.
#[derive(Debug)]
pub struct ReflexOutcome {
    /// Name of the matching rule.
    pub rule: &'static str,
    /// Handler result: spoken confirmation or a handler error.
    pub response: Result<String>,
    /// Match + handler wall time.
    pub latency: Duration,
}

/// Ordered first-match-wins rule table.
pub struct ReflexDispatcher {
    rules: Vec<ReflexRule>,
    bridge: Arc<dyn DeviceBridge>,
}

impl std::fmt::Debug for ReflexDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflexDispatcher")
            .field("rules", &self.rules)
            .finish()
    }
}

impl ReflexDispatcher {
    /// Build a dispatcher with the built-in rule set.
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            rules: builtin_rules(),
            bridge,
        }
    }

    /// Build a dispatcher with a custom rule table (tried in the given order).
    pub fn with_rules(bridge: Arc<dyn DeviceBridge>, rules: Vec<ReflexRule>) -> Self {
        Self { rules, bridge }
    }

    /// Whether any rule would fire for this utterance. Runs no handlers.
    pub fn matches(&self, text: &str) -> bool {
        let clean = normalize(text);
        self.rules.iter().any(|rule| (rule.matches)(&clean))
    }

    /// Try the utterance against the rule table. First match wins and its
    /// handler runs exactly once.
    pub fn try_reflex(&self, text: &str) -> Option<ReflexOutcome> {
        let started = Instant::now();
        let clean = normalize(text);
        for rule in &self.rules {
            if (rule.matches)(&clean) {
                let response = (rule.handle)(&clean, self.bridge.as_ref());
                let latency = started.elapsed();
                debug!(rule = rule.name, ?latency, "reflex hit");
                return Some(ReflexOutcome {
                    rule: rule.name,
                    response,
                    latency,
                });
            }
        }
        None
    }
}

/// Rooms the light rules recognize.
const ROOMS: &[&str] = &[
    "living room",
    "kitchen",
    "bedroom",
    "bathroom",
    "office",
    "hallway",
];

fn find_room(text: &str) -> Option<&'static str> {
    ROOMS.iter().copied().find(|room| text.contains(room))
}

/// First standalone number in the text, clamped to 0–100.
fn find_percent(text: &str) -> Option<u8> {
    text.split_whitespace()
        .find_map(|w| w.parse::<u16>().ok())
        .map(|n| n.min(100) as u8)
}

fn mentions_lights(text: &str) -> bool {
    text.contains("light") || text.contains("lamp")
}

fn adjusts_brightness(text: &str) -> bool {
    text.contains("dim") || text.contains("bright") || text.contains("percent")
}

fn wants_on(text: &str) -> Option<bool> {
    let has_on = text.contains(" on") || text.starts_with("on ") || text.ends_with(" on");
    let has_off = text.contains(" off") || text.ends_with(" off");
    match (has_on, has_off) {
        (_, true) => Some(false),
        (true, false) => Some(true),
        _ => None,
    }
}

/// The built-in rule table. Declared order is the priority order.
fn builtin_rules() -> Vec<ReflexRule> {
    vec![
        // Most specific first: brightness with an explicit or implied level.
        ReflexRule::new(
            "brightness",
            |text| mentions_lights(text) && adjusts_brightness(text),
            |text, bridge| {
                let room = find_room(text);
                let percent =
                    find_percent(text).unwrap_or(if text.contains("dim") { 20 } else { 80 });
                bridge.set_brightness(room, percent)?;
                Ok(match room {
                    Some(room) => format!("Setting the {room} lights to {percent} percent."),
                    None => format!("Setting the lights to {percent} percent."),
                })
            },
        ),
        // Room-scoped on/off.
        ReflexRule::new(
            "room-lights",
            |text| mentions_lights(text) && find_room(text).is_some() && wants_on(text).is_some(),
            |text, bridge| {
                let room = find_room(text);
                let on = wants_on(text).unwrap_or(true);
                bridge.set_lights(room, on)?;
                let room = room.unwrap_or("requested");
                Ok(format!(
                    "Turning the {room} lights {}.",
                    if on { "on" } else { "off" },
                ))
            },
        ),
        // Generic on/off.
        ReflexRule::new(
            "lights",
            |text| mentions_lights(text) && wants_on(text).is_some(),
            |text, bridge| {
                let on = wants_on(text).unwrap_or(true);
                bridge.set_lights(None, on)?;
                Ok(format!("Turning the lights {}.", if on { "on" } else { "off" }))
            },
        ),
        // Volume.
        ReflexRule::new(
            "volume",
            |text| {
                text.contains("volume")
                    && (find_percent(text).is_some() || text.contains("up") || text.contains("down"))
            },
            |text, bridge| {
                let percent = find_percent(text).unwrap_or(if text.contains("up") {
                    80
                } else {
                    30
                });
                bridge.set_volume(percent)?;
                Ok(format!("Volume at {percent} percent."))
            },
        ),
        // Catch-alls last.
        ReflexRule::new(
            "time",
            |text| text.contains("what time") || text == "time" || text.contains("the time"),
            |_text, _bridge| {
                let now = chrono::Local::now();
                Ok(format!("It's {}.", now.format("%-I:%M %p")))
            },
        ),
        ReflexRule::new(
            "greeting",
            |text| matches!(text, "hello" | "hi" | "hey" | "good morning" | "good evening"),
            |_text, _bridge| Ok("Hello. What can I do for you?".to_owned()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> ReflexDispatcher {
        ReflexDispatcher::new(Arc::new(NullBridge))
    }

    #[test]
    fn room_rule_outranks_generic_lights_rule() {
        let d = dispatcher();
        let hit = d.try_reflex("turn on the kitchen lights").expect("match");
        assert_eq!(hit.rule, "room-lights");
        assert_eq!(hit.response.unwrap(), "Turning the kitchen lights on.");

        let hit = d.try_reflex("turn off the lights").expect("match");
        assert_eq!(hit.rule, "lights");
        assert_eq!(hit.response.unwrap(), "Turning the lights off.");
    }

    #[test]
    fn brightness_outranks_room_on_off() {
        let d = dispatcher();
        let hit = d
            .try_reflex("dim the bedroom lights to 15 percent")
            .expect("match");
        assert_eq!(hit.rule, "brightness");
        assert_eq!(
            hit.response.unwrap(),
            "Setting the bedroom lights to 15 percent.",
        );
    }

    #[test]
    fn volume_and_time_catchalls() {
        let d = dispatcher();
        assert_eq!(d.try_reflex("turn the volume down").expect("match").rule, "volume");
        assert_eq!(d.try_reflex("What time is it?").expect("match").rule, "time");
    }

    #[test]
    fn matches_probe_runs_no_handlers() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingBridge(AtomicU32);
        impl DeviceBridge for CountingBridge {
            fn set_lights(&self, _room: Option<&str>, _on: bool) -> Result<()> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            fn set_brightness(&self, _room: Option<&str>, _percent: u8) -> Result<()> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            fn set_volume(&self, _percent: u8) -> Result<()> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }

        let bridge = Arc::new(CountingBridge(AtomicU32::new(0)));
        let d = ReflexDispatcher::new(Arc::clone(&bridge) as Arc<dyn DeviceBridge>);
        assert!(d.matches("turn off the lights"));
        assert_eq!(bridge.0.load(Ordering::Relaxed), 0, "probe must not actuate");

        d.try_reflex("turn off the lights");
        assert_eq!(bridge.0.load(Ordering::Relaxed), 1, "handler runs exactly once");
    }

    #[test]
    fn unmatched_text_returns_none() {
        let d = dispatcher();
        assert!(d.try_reflex("summarize my unread email").is_none());
        assert!(!d.matches("summarize my unread email"));
        assert!(d.try_reflex("").is_none());
    }

    #[test]
    fn handler_errors_are_returned_not_swallowed() {
        struct FailingBridge;
        impl DeviceBridge for FailingBridge {
            fn set_lights(&self, _room: Option<&str>, _on: bool) -> Result<()> {
                Err(crate::error::AssistantError::Tool("bridge offline".into()))
            }
            fn set_brightness(&self, _room: Option<&str>, _percent: u8) -> Result<()> {
                Ok(())
            }
            fn set_volume(&self, _percent: u8) -> Result<()> {
                Ok(())
            }
        }

        let d = ReflexDispatcher::new(Arc::new(FailingBridge));
        let hit = d.try_reflex("lights off").expect("match");
        assert!(hit.response.is_err());
    }
}
