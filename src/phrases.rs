//! Canned assistant phrases.
//!
//! Centralized so the turn-taking guard can recognize the assistant's own
//! stock lines when they leak back in through the microphone.

/// Spoken when the language model request fails.
pub const MODEL_APOLOGY: &str = "Sorry, I'm having trouble thinking right now.";

/// Spoken when a model or tool request times out.
pub const TIMEOUT_APOLOGY: &str = "Sorry, that took longer than it should have.";

/// Spoken when a tool call fails.
pub const TOOL_APOLOGY: &str = "Sorry, I couldn't finish that one.";

/// Spoken when a new request arrives while one is already in flight.
pub const BUSY: &str = "I'm still working on that.";

/// Spoken when a request is queued because the model backend is offline.
pub const OFFLINE_ACK: &str =
    "I can't reach my brain right now. I'll follow up as soon as I'm back.";

/// Every stock phrase the assistant may speak verbatim. Kept free of words a
/// user would plausibly open a turn with, since the guard discards fragments
/// matching a prefix of any of these.
pub fn canned() -> &'static [&'static str] {
    &[
        MODEL_APOLOGY,
        TIMEOUT_APOLOGY,
        TOOL_APOLOGY,
        BUSY,
        OFFLINE_ACK,
    ]
}
