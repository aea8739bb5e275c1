//! Integration tests for the engine contract over the offline backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use colossus::inference::chat::{interact, Conversation};
use colossus::inference::fallback::FallbackBackend;
use colossus::inference::{
    ChatMessage, ChatRequest, EngineKind, GenerateOptions, GenerateRequest, InferenceEngine,
    LocalEngine, ModelOptions, Role,
};

const SCRIPT: &str = "The quick brown fox. Jumps over the lazy dog.";

fn model_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.gguf"));
    std::fs::write(&path, b"weights").unwrap();
    path
}

fn engine(backend: FallbackBackend) -> Arc<LocalEngine> {
    Arc::new(LocalEngine::new(EngineKind::Fallback, Box::new(backend)))
}

fn greedy(model: &str, prompt: &str) -> GenerateRequest {
    let mut req = GenerateRequest::new(model, prompt);
    req.options.temperature = Some(0.0);
    req
}

/// First and last fragment times of a streamed generation.
fn timed_stream(engine: &LocalEngine, request: &GenerateRequest) -> (Instant, Instant) {
    let mut first = None;
    let mut last = Instant::now();
    engine
        .generate_stream(request, &mut |_| {
            let now = Instant::now();
            first.get_or_insert(now);
            last = now;
            Ok(())
        })
        .unwrap();
    (first.unwrap(), last)
}

#[test]
fn test_load_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "tiny");
    let engine = engine(FallbackBackend::new());

    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();
    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();

    assert!(engine.is_loaded("tiny"));
    assert_eq!(engine.loaded_models(), vec!["tiny".to_string()]);
}

#[test]
fn test_unload_then_generate_is_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "tiny");
    let engine = engine(FallbackBackend::new());

    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();
    engine.unload_model("tiny").unwrap();

    assert!(!engine.is_loaded("tiny"));
    let err = engine.generate(&greedy("tiny", "hi")).unwrap_err();
    assert!(err.is_not_loaded());

    // The name can be loaded again.
    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();
    assert!(engine.generate(&greedy("tiny", "hi")).unwrap().done);
}

#[test]
fn test_stream_matches_complete() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "tiny");
    let engine = engine(FallbackBackend::new());
    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();

    let mut request = GenerateRequest::new("tiny", "Tell me about rivers");
    request.options.seed = Some(7);
    let complete = engine.generate(&request).unwrap();

    let mut streamed = String::new();
    let mut dones = Vec::new();
    engine
        .generate_stream(&request, &mut |fragment| {
            streamed.push_str(&fragment.text);
            dones.push(fragment.done);
            Ok(())
        })
        .unwrap();

    assert_eq!(streamed, complete.text);
    assert_eq!(dones.last(), Some(&true));
    assert_eq!(dones.iter().filter(|d| **d).count(), 1);
}

#[test]
fn test_stop_string_ends_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "tiny");
    let engine = engine(FallbackBackend::new().with_script(SCRIPT));
    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();

    let mut request = greedy("tiny", "go");
    request.options.stop = vec!["fox.".to_string()];
    let result = engine.generate(&request).unwrap();
    assert_eq!(result.text, "The quick brown fox.");

    request.options.stop.clear();
    request.options.num_predict = Some(3);
    assert_eq!(engine.generate(&request).unwrap().text, "The");
}

#[test]
fn test_chat_uses_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "tiny");
    let engine = engine(FallbackBackend::new().with_script("Hello there."));
    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();

    let mut request = ChatRequest {
        model: "tiny".to_string(),
        messages: vec![
            ChatMessage::new(Role::System, "Be brief."),
            ChatMessage::new(Role::User, "Hi"),
        ],
        stream: false,
        options: Default::default(),
    };
    request.options.temperature = Some(0.0);

    let result = engine.chat(&request).unwrap();
    assert_eq!(result.model, "tiny");
    assert_eq!(result.text, "Hello there.");
    assert!(result.done);
}

#[test]
fn test_interactive_chat_keeps_history_until_bye() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "tiny");
    let engine = engine(FallbackBackend::new().with_script("Hello there."));
    engine.load_model("tiny", &path, &ModelOptions::default()).unwrap();

    let options = GenerateOptions {
        temperature: Some(0.0),
        ..Default::default()
    };
    let mut conversation = Conversation::new(None);
    let mut input: &[u8] = b"Hi\n\nHow are you?\n/bye\nnever sent\n";
    let mut output = Vec::new();
    interact(
        engine.as_ref(),
        "tiny",
        &options,
        &mut conversation,
        &mut input,
        &mut output,
    )
    .unwrap();

    let output = String::from_utf8(output).unwrap();
    assert_eq!(output.matches("Hello there.").count(), 2);
    assert!(output.ends_with("Goodbye!\n"));
    assert_eq!(conversation.exchanges(), 2);
}

#[test]
fn test_interactive_chat_reports_errors_and_continues() {
    let engine = engine(FallbackBackend::new());
    let mut conversation = Conversation::new(None);
    let mut input: &[u8] = b"Hi\n";
    let mut output = Vec::new();
    interact(
        engine.as_ref(),
        "missing",
        &GenerateOptions::default(),
        &mut conversation,
        &mut input,
        &mut output,
    )
    .unwrap();

    let output = String::from_utf8(output).unwrap();
    assert!(output.contains("Error: "));
    assert_eq!(conversation.exchanges(), 0);
}

#[test]
fn test_distinct_models_generate_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let a = model_file(dir.path(), "a");
    let b = model_file(dir.path(), "b");
    let engine = engine(
        FallbackBackend::new()
            .with_script("abcdefghijklmnop")
            .with_step_delay(Duration::from_millis(15)),
    );
    engine.load_model("a", &a, &ModelOptions::default()).unwrap();
    engine.load_model("b", &b, &ModelOptions::default()).unwrap();

    let (span_a, span_b) = thread::scope(|s| {
        let ha = s.spawn(|| timed_stream(&engine, &greedy("a", "x")));
        let hb = s.spawn(|| timed_stream(&engine, &greedy("b", "x")));
        (ha.join().unwrap(), hb.join().unwrap())
    });

    assert!(span_a.0 < span_b.1 && span_b.0 < span_a.1, "generations did not overlap");
}

#[test]
fn test_same_model_generations_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "a");
    let engine = engine(
        FallbackBackend::new()
            .with_script("abcdefgh")
            .with_step_delay(Duration::from_millis(10)),
    );
    engine.load_model("a", &path, &ModelOptions::default()).unwrap();

    let (first, second) = thread::scope(|s| {
        let h1 = s.spawn(|| timed_stream(&engine, &greedy("a", "x")));
        let h2 = s.spawn(|| timed_stream(&engine, &greedy("a", "y")));
        (h1.join().unwrap(), h2.join().unwrap())
    });

    let disjoint = first.1 <= second.0 || second.1 <= first.0;
    assert!(disjoint, "same-model generations interleaved");
}

#[test]
fn test_is_loaded_does_not_wait_for_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_file(dir.path(), "slow");
    let engine = engine(
        FallbackBackend::new()
            .with_script("a fairly long scripted reply")
            .with_step_delay(Duration::from_millis(20)),
    );
    engine.load_model("slow", &path, &ModelOptions::default()).unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = mpsc::channel();

    let worker = {
        let engine = engine.clone();
        let finished = finished.clone();
        thread::spawn(move || {
            let mut signalled = false;
            engine
                .generate_stream(&greedy("slow", "x"), &mut |_| {
                    if !signalled {
                        signalled = true;
                        let _ = started_tx.send(());
                    }
                    Ok(())
                })
                .unwrap();
            finished.store(true, Ordering::SeqCst);
        })
    };

    started_rx.recv().unwrap();
    assert!(engine.is_loaded("slow"));
    assert_eq!(engine.loaded_models(), vec!["slow".to_string()]);
    assert!(!finished.load(Ordering::SeqCst));

    worker.join().unwrap();
}

#[test]
fn test_shutdown_unloads_everything() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(FallbackBackend::new());
    for name in ["a", "b", "c"] {
        let path = model_file(dir.path(), name);
        engine.load_model(name, &path, &ModelOptions::default()).unwrap();
    }

    engine.shutdown().unwrap();
    assert!(engine.loaded_models().is_empty());
    assert!(!engine.is_loaded("b"));
}
