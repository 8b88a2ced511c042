//! End-to-end conversation flows through the orchestrator.

mod support;

use std::time::Duration;
use support::{Harness, test_config, wait_for_notification, wait_for_state};
use tokio::sync::mpsc;
use wren::events::{ConversationEvent, ModelReply, Notification, ToolCall};
use wren::io::RecognizerEvent;
use wren::machine::ConversationState;
use wren::{Orchestrator, phrases};

const WAIT: Duration = Duration::from_secs(3);

fn spawn(
    harness: &Harness,
) -> (
    Orchestrator,
    mpsc::UnboundedSender<RecognizerEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::spawn(test_config(), harness.collaborators(), rx);
    (orchestrator, tx)
}

#[tokio::test]
async fn wake_opens_conversation_with_tone_and_duck() {
    let h = Harness::new(Duration::from_millis(10), ModelReply::text("hi"));
    let (orchestrator, _rec) = spawn(&h);

    orchestrator.send(ConversationEvent::Wake);
    wait_for_state(&orchestrator, ConversationState::Listening, WAIT).await;

    let audio = h.audio.recorded();
    assert_eq!(audio[0], "tone:wake");
    assert_eq!(audio[1], "duck:true");
    orchestrator.shutdown();
}

#[tokio::test]
async fn reflex_command_never_reaches_the_model() {
    let h = Harness::new(Duration::from_millis(10), ModelReply::text("unused"));
    let (orchestrator, _rec) = spawn(&h);

    orchestrator.send(ConversationEvent::Wake);
    orchestrator.send(ConversationEvent::FinalTranscript("turn on the lights".into()));
    wait_for_state(&orchestrator, ConversationState::Speaking, WAIT).await;

    assert_eq!(h.model.call_count(), 0, "reflex path must bypass the model");
    assert_eq!(h.synth.spoken_texts(), vec!["Turning the lights on.".to_owned()]);

    // Normal flow resumes after the confirmation.
    wait_for_state(&orchestrator, ConversationState::Listening, WAIT).await;
    orchestrator.shutdown();
}

#[tokio::test]
async fn stop_while_speaking_cancels_without_a_new_model_call() {
    let story = "once upon a time there was a tiny brave bird in the woods";
    let h = Harness::new(Duration::from_millis(10), ModelReply::text(story));
    let (orchestrator, recognizer) = spawn(&h);

    orchestrator.send(ConversationEvent::Wake);
    orchestrator.send(ConversationEvent::FinalTranscript("tell me a story".into()));
    wait_for_state(&orchestrator, ConversationState::Speaking, WAIT).await;

    // Past the echo cooldown, mid-playback: a pure stop phrase.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = recognizer.send(RecognizerEvent::Final("stop".into()));

    wait_for_state(&orchestrator, ConversationState::Listening, WAIT).await;
    assert!(h.synth.cancels.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    assert_eq!(h.model.call_count(), 1, "interrupt must not dispatch");
    orchestrator.shutdown();
}

#[tokio::test]
async fn barge_in_while_speaking_redispatches() {
    let story = "once upon a time there was a tiny brave bird in the woods";
    let h = Harness::new(Duration::from_millis(10), ModelReply::text(story));
    let (orchestrator, recognizer) = spawn(&h);

    orchestrator.send(ConversationEvent::Wake);
    orchestrator.send(ConversationEvent::FinalTranscript("tell me a story".into()));
    wait_for_state(&orchestrator, ConversationState::Speaking, WAIT).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = recognizer.send(RecognizerEvent::Final("actually translate it to french".into()));

    // Barge-in cancels playback and runs a second model turn.
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.model.call_count() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "second dispatch never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.synth.cancels.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    orchestrator.shutdown();
}

#[tokio::test]
async fn second_slow_request_gets_a_busy_note() {
    let h = Harness::new(Duration::from_millis(400), ModelReply::text("planned"));
    let (orchestrator, _rec) = spawn(&h);

    orchestrator.send(ConversationEvent::Wake);
    orchestrator.send(ConversationEvent::FinalTranscript("plan my week".into()));
    wait_for_state(&orchestrator, ConversationState::Processing, WAIT).await;

    orchestrator.send(ConversationEvent::FinalTranscript("also book flights".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        orchestrator.state(),
        ConversationState::Processing,
        "busy note must not disturb the in-flight turn",
    );
    assert!(h.synth.spoken_texts().contains(&phrases::BUSY.to_owned()));
    assert_eq!(h.model.call_count(), 1);

    // The original request still completes.
    wait_for_state(&orchestrator, ConversationState::Speaking, WAIT).await;
    assert!(h.synth.spoken_texts().contains(&"planned".to_owned()));
    orchestrator.shutdown();
}

#[tokio::test]
async fn recognizer_fragments_batch_into_one_utterance() {
    let h = Harness::new(Duration::from_millis(10), ModelReply::text("noted"));
    let (orchestrator, recognizer) = spawn(&h);
    let mut notifications = orchestrator.subscribe();

    let _ = recognizer.send(RecognizerEvent::Final("hey wren".into()));
    wait_for_state(&orchestrator, ConversationState::Listening, WAIT).await;

    let _ = recognizer.send(RecognizerEvent::Final("remind me to water".into()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = recognizer.send(RecognizerEvent::Final("the plants".into()));

    let n = wait_for_notification(&mut notifications, WAIT, |n| {
        matches!(n, Notification::Transcript(_))
    })
    .await;
    match n {
        Notification::Transcript(text) => {
            assert_eq!(text, "remind me to water the plants");
        }
        other => panic!("unexpected notification {other:?}"),
    }
    orchestrator.shutdown();
}

#[tokio::test]
async fn wake_word_with_trailing_command_skips_the_silence_wait() {
    let h = Harness::new(Duration::from_millis(10), ModelReply::text("unused"));
    let (orchestrator, recognizer) = spawn(&h);

    let _ = recognizer.send(RecognizerEvent::Final("hey wren what time is it".into()));
    wait_for_state(&orchestrator, ConversationState::Speaking, WAIT).await;

    // "what time is it" is a reflex catch-all; no model involved.
    assert_eq!(h.model.call_count(), 0);
    assert!(h.synth.spoken_texts()[0].starts_with("It's "));
    orchestrator.shutdown();
}

#[tokio::test]
async fn self_echo_after_speech_end_is_discarded() {
    let h = Harness::new(Duration::from_millis(10), ModelReply::text("unused"));
    let (orchestrator, recognizer) = spawn(&h);
    let mut notifications = orchestrator.subscribe();

    orchestrator.send(ConversationEvent::Wake);
    orchestrator.send(ConversationEvent::FinalTranscript("hello".into()));
    wait_for_state(&orchestrator, ConversationState::Speaking, WAIT).await;
    wait_for_state(&orchestrator, ConversationState::Listening, WAIT).await;

    // The mic hears the tail of "Hello. What can I do for you?".
    tokio::time::sleep(Duration::from_millis(60)).await;
    let _ = recognizer.send(RecognizerEvent::Final("what can i do for you".into()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(orchestrator.state(), ConversationState::Listening);
    // Drain collected notifications: no transcript for the echo.
    while let Ok(n) = notifications.try_recv() {
        if let Notification::Transcript(text) = n {
            assert_ne!(text, "what can i do for you", "echo must not dispatch");
        }
    }
    orchestrator.shutdown();
}

#[tokio::test]
async fn tool_calls_execute_in_order_then_result_is_spoken() {
    let reply = ModelReply {
        text: String::new(),
        tool_calls: vec![
            ToolCall {
                name: "calendar.create".into(),
                arguments: serde_json::json!({"title": "dentist"}),
            },
            ToolCall {
                name: "email.send".into(),
                arguments: serde_json::json!({"to": "sam"}),
            },
        ],
    };
    let h = Harness::new(Duration::from_millis(10), reply);
    let (orchestrator, _rec) = spawn(&h);

    orchestrator.send(ConversationEvent::Wake);
    orchestrator.send(ConversationEvent::FinalTranscript(
        "book the dentist and tell sam".into(),
    ));
    wait_for_state(&orchestrator, ConversationState::Speaking, WAIT).await;

    assert_eq!(
        h.tools.calls.lock().unwrap().clone(),
        vec!["calendar.create".to_owned(), "email.send".to_owned()],
    );
    assert!(h.synth.spoken_texts().contains(&"email.send done".to_owned()));
    orchestrator.shutdown();
}
