//! Canned responses for when the language-model backend is offline.
//!
//! The fallback responder is the degraded-mode sibling of the reflex
//! dispatcher: a small fixed set of patterns it can answer without any
//! backend, so the assistant stays conversational during an outage instead
//! of going silent. Utterances it cannot answer are queued for replay by the
//! health supervisor.

use crate::turn::normalize;

/// Pattern-matched responder used while the model backend is offline.
#[derive(Debug, Default)]
pub struct FallbackResponder;

impl FallbackResponder {
    /// Create a responder.
    pub fn new() -> Self {
        Self
    }

    /// Answer the utterance from the canned set, or `None` if it needs the
    /// real model (and should be queued).
    pub fn respond(&self, text: &str) -> Option<String> {
        let clean = normalize(text);

        if matches!(
            clean.as_str(),
            "hello" | "hi" | "hey" | "good morning" | "good evening" | "are you there",
        ) {
            return Some(
                "Hello. I'm running in a limited mode right now, but I'm listening.".to_owned(),
            );
        }

        if clean.contains("what time") || clean.contains("the time") {
            let now = chrono::Local::now();
            return Some(format!("It's {}.", now.format("%-I:%M %p")));
        }

        if clean.contains("what day") || clean.contains("the date") {
            let now = chrono::Local::now();
            return Some(format!("It's {}.", now.format("%A, %B %-d")));
        }

        if clean.contains("are you ok")
            || clean.contains("what is wrong")
            || clean.contains("status")
        {
            return Some(
                "My language backend is offline. I'll keep your requests and catch up \
                 once it's back."
                    .to_owned(),
            );
        }

        if clean.contains("thank") {
            return Some("You're welcome.".to_owned());
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_time_and_greetings() {
        let f = FallbackResponder::new();
        assert!(f.respond("hello").is_some());
        assert!(f.respond("What time is it?").is_some());
        assert!(f.respond("what's the date today").is_some());
    }

    #[test]
    fn declines_what_it_cannot_answer() {
        let f = FallbackResponder::new();
        assert!(f.respond("book me a table for two tomorrow").is_none());
        assert!(f.respond("summarize my inbox").is_none());
    }

    #[test]
    fn explains_the_outage_when_asked() {
        let f = FallbackResponder::new();
        let reply = f.respond("are you ok?").expect("answered");
        assert!(reply.contains("offline"));
    }
}
