//! End-to-end tests for the generation worker, driven by the mock binding.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use persona_chat::binding::mock::MockFactory;
use persona_chat::binding::BindingRegistry;
use persona_chat::personality::processor::{GenerateFn, PersonaProcessor, ProcessorRegistry};
use persona_chat::worker::{GenerationChunk, ModelRunner};
use persona_chat::{AppConfig, GenerationFailure};

const STARTUP: Duration = Duration::from_secs(5);

fn registry_with(factory: Arc<MockFactory>) -> Arc<BindingRegistry> {
    let mut registry = BindingRegistry::new("bindings");
    registry.register(factory);
    Arc::new(registry)
}

fn runner_with(factory: Arc<MockFactory>, config: AppConfig) -> ModelRunner {
    ModelRunner::new(
        config,
        registry_with(factory),
        Arc::new(ProcessorRegistry::new()),
    )
}

/// Wait for the in-flight generation to finish, then drain all chunks.
fn drain_when_idle(runner: &ModelRunner, chunks: &Receiver<GenerationChunk>) -> Vec<GenerationChunk> {
    let deadline = std::time::Instant::now() + STARTUP;
    while runner.is_generating() {
        assert!(std::time::Instant::now() < deadline, "generation never finished");
        std::thread::sleep(Duration::from_millis(5));
    }
    // One settle tick so the worker can return to the loop top.
    std::thread::sleep(Duration::from_millis(20));
    let mut collected = Vec::new();
    while let Ok(chunk) = chunks.try_recv() {
        collected.push(chunk);
    }
    collected
}

#[test]
fn test_end_to_end_chunk_sequence() {
    let factory = Arc::new(MockFactory::new(&["Hi", " there", "!"]));
    let mut runner = runner_with(factory.clone(), AppConfig::default());
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("hello", 1).expect("worker started");
    assert_eq!(runner.wait_until_started(STARTUP), Some(1));

    let collected = drain_when_idle(&runner, &chunks);
    let expected: Vec<GenerationChunk> = [("Hi", 1), (" there", 1), ("!", 1)]
        .iter()
        .map(|(text, id)| GenerationChunk {
            text: (*text).to_string(),
            id: *id,
        })
        .collect();
    assert_eq!(collected, expected);
    assert!(!runner.is_generating());
    assert_eq!(factory.build_count(), 1);

    runner.stop();
}

#[test]
fn test_requests_are_served_fifo_without_interleaving() {
    let factory = Arc::new(
        MockFactory::new(&["a", "b"]).with_step_delay(Duration::from_millis(5)),
    );
    let mut runner = runner_with(factory, AppConfig::default());
    let chunks = runner.chunk_receiver();

    runner.start();
    for id in 1..=3 {
        runner.generate(format!("prompt {id}"), id).expect("worker started");
    }

    // All three must start, in order.
    for id in 1..=3 {
        assert_eq!(runner.wait_until_started(STARTUP), Some(id));
    }

    let collected = drain_when_idle(&runner, &chunks);
    let ids: Vec<u64> = collected.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 1, 2, 2, 3, 3]);
    let texts: Vec<&str> = collected.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["a", "b", "a", "b", "a", "b"]);

    runner.stop();
}

#[test]
fn test_cancellation_stops_within_one_callback() {
    // A long scripted generation: 500 fragments, 5ms apart.
    let factory = Arc::new(
        MockFactory::new(&["x"])
            .with_repeat(500)
            .with_step_delay(Duration::from_millis(5)),
    );
    let mut config = AppConfig::default();
    // Keep the fragment budget above the script length.
    config.override_personality_model_parameters = true;
    config.n_predict = 10_000;

    let mut runner = runner_with(factory, config);
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("go", 7).expect("worker started");
    assert_eq!(runner.wait_until_started(STARTUP), Some(7));
    assert!(runner.is_generating());

    std::thread::sleep(Duration::from_millis(50));
    runner.cancel_generation();

    // The flag must drop within one callback tick, not after the script ends.
    let deadline = std::time::Instant::now() + Duration::from_millis(500);
    while runner.is_generating() {
        assert!(
            std::time::Instant::now() < deadline,
            "cancellation was not observed in time"
        );
        std::thread::sleep(Duration::from_millis(2));
    }

    // No further chunks may be emitted after cancellation was observed.
    std::thread::sleep(Duration::from_millis(30));
    let drained = {
        let mut v = Vec::new();
        while let Ok(chunk) = chunks.try_recv() {
            v.push(chunk);
        }
        v
    };
    assert!(!drained.is_empty());
    assert!(drained.len() < 500, "generation ran to completion");
    std::thread::sleep(Duration::from_millis(50));
    assert!(chunks.try_recv().is_err(), "chunks emitted after cancellation");

    runner.stop();
}

#[test]
fn test_clear_queue_discards_pending_but_not_later_requests() {
    let factory = Arc::new(
        MockFactory::new(&["t"])
            .with_repeat(40)
            .with_step_delay(Duration::from_millis(5)),
    );
    let mut runner = runner_with(factory, AppConfig::default());
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("a", 1).expect("worker started");
    assert_eq!(runner.wait_until_started(STARTUP), Some(1));

    // Enqueued behind the in-flight request, then cleared.
    runner.generate("b", 2).expect("worker started");
    runner.generate("c", 3).expect("worker started");
    runner.clear_queue();
    // Enqueued after the clear returned: must still be served.
    runner.generate("d", 4).expect("worker started");

    // Request 1 keeps generating (clear never cancels), then request 4.
    assert_eq!(runner.wait_until_started(STARTUP), Some(4));

    let collected = drain_when_idle(&runner, &chunks);
    assert!(collected.iter().any(|c| c.id == 1));
    assert!(collected.iter().any(|c| c.id == 4));
    assert!(!collected.iter().any(|c| c.id == 2 || c.id == 3));

    runner.stop();
}

#[test]
fn test_set_config_with_same_identity_does_not_rebuild() {
    let factory = Arc::new(MockFactory::default());
    let config = AppConfig::default();
    let mut runner = runner_with(factory.clone(), config.clone());
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("warmup", 1).expect("worker started");
    runner.wait_until_started(STARTUP);
    drain_when_idle(&runner, &chunks);
    assert_eq!(factory.build_count(), 1);
    assert_eq!(runner.personality_rebuilds(), 1);

    // Identical binding and model identity: no rebuild.
    runner.set_config(config.clone());
    runner.generate("tick", 2).expect("worker started");
    runner.wait_until_started(STARTUP);
    drain_when_idle(&runner, &chunks);
    assert_eq!(factory.build_count(), 1);
    assert_eq!(runner.binding_rebuilds(), 1);

    // Changed model identity: binding rebuilt, personality untouched.
    let mut changed = config.clone();
    changed.model = Some("other-model".to_string());
    runner.set_config(changed.clone());
    runner.generate("tick", 3).expect("worker started");
    runner.wait_until_started(STARTUP);
    drain_when_idle(&runner, &chunks);
    assert_eq!(factory.build_count(), 2);
    assert_eq!(runner.personality_rebuilds(), 1);

    // Changed personality triple: personality rebuilt, binding untouched.
    let mut repersona = changed;
    repersona.personality = "artist".to_string();
    runner.set_config(repersona);
    runner.generate("tick", 4).expect("worker started");
    runner.wait_until_started(STARTUP);
    drain_when_idle(&runner, &chunks);
    assert_eq!(factory.build_count(), 2);
    assert_eq!(runner.personality_rebuilds(), 2);

    runner.stop();
}

#[test]
fn test_generate_before_start_is_dropped_with_typed_error() {
    let factory = Arc::new(MockFactory::default());
    let mut runner = runner_with(factory.clone(), AppConfig::default());
    let chunks = runner.chunk_receiver();

    assert!(runner.generate("early", 1).is_err());
    assert!(!runner.is_started());

    runner.start();
    // The early request was dropped, not deferred.
    assert!(runner.wait_until_started(Duration::from_millis(200)).is_none());
    assert!(chunks.try_recv().is_err());
    assert_eq!(factory.build_count(), 1);

    runner.stop();
}

#[test]
fn test_pending_cancel_drops_next_request() {
    let factory = Arc::new(MockFactory::default());
    let mut runner = runner_with(factory, AppConfig::default());
    let chunks = runner.chunk_receiver();

    runner.start();
    // Give the worker time to reach its idle dequeue.
    std::thread::sleep(Duration::from_millis(50));

    // A cancel with nothing in flight sits in its slot; the next request
    // is dequeued with the signal pending and dropped.
    runner.cancel_generation();
    runner.cancel_generation(); // second signal: silently dropped, slot full
    runner.generate("doomed", 9).expect("worker started");

    assert!(runner.wait_until_started(Duration::from_millis(300)).is_none());
    assert!(chunks.try_recv().is_err());

    // The slot drained; later requests are served normally.
    runner.generate("alive", 10).expect("worker started");
    assert_eq!(runner.wait_until_started(STARTUP), Some(10));
    let collected = drain_when_idle(&runner, &chunks);
    assert!(collected.iter().all(|c| c.id == 10));

    runner.stop();
}

#[test]
fn test_stop_then_restart_spawns_a_fresh_worker() {
    let factory = Arc::new(MockFactory::new(&["ok"]));
    let mut runner = runner_with(factory.clone(), AppConfig::default());
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("one", 1).expect("worker started");
    runner.wait_until_started(STARTUP);
    drain_when_idle(&runner, &chunks);

    runner.stop();
    assert!(!runner.is_started());
    assert!(runner.generate("while stopped", 2).is_err());

    runner.start();
    runner.generate("two", 3).expect("worker restarted");
    assert_eq!(runner.wait_until_started(STARTUP), Some(3));
    let collected = drain_when_idle(&runner, &chunks);
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].id, 3);
    // The fresh worker rebuilt its binding.
    assert_eq!(factory.build_count(), 2);

    runner.stop();
}

#[test]
fn test_generation_failure_keeps_streamed_output() {
    let factory = Arc::new(
        MockFactory::new(&["good", " partial"])
            .with_repeat(2)
            .failing_after(2),
    );
    let mut runner = runner_with(factory, AppConfig::default());
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("boom", 5).expect("worker started");
    runner.wait_until_started(STARTUP);

    // The failure is logged and swallowed; the streamed chunks stand.
    let collected = drain_when_idle(&runner, &chunks);
    let texts: Vec<&str> = collected.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["good", " partial"]);
    assert!(!runner.is_generating());

    // The worker survives and serves the next request.
    runner.generate("again", 6).expect("worker started");
    assert_eq!(runner.wait_until_started(STARTUP), Some(6));

    runner.stop();
}

#[test]
fn test_antiprompt_truncates_streamed_generation() {
    // The marker is split across fragments; the fragment completing it
    // must be withheld.
    let factory = Arc::new(MockFactory::new(&["The answer. ", "### Hu", "man: blah"]));
    // Default persona anti-prompts include "### Human:".
    let mut runner = runner_with(factory, AppConfig::default());
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("q", 11).expect("worker started");
    runner.wait_until_started(STARTUP);

    let collected = drain_when_idle(&runner, &chunks);
    let texts: Vec<&str> = collected.iter().map(|c| c.text.as_str()).collect();
    // "### Hu" alone matches nothing; "man: blah" completes the marker
    // and is never emitted.
    assert_eq!(texts, vec!["The answer. ", "### Hu"]);

    runner.stop();
}

struct DoublePass;

impl PersonaProcessor for DoublePass {
    fn process_model_input(&mut self, prompt: &str) -> Option<String> {
        Some(format!("[task] {prompt}"))
    }

    fn has_workflow(&self) -> bool {
        true
    }

    fn run_workflow(
        &mut self,
        _prompt: &str,
        full_discussion: &str,
        generate: &mut GenerateFn<'_>,
    ) -> Result<String, GenerationFailure> {
        let draft = generate(full_discussion, 0)?;
        let refined = generate(&format!("refine: {draft}"), 0)?;
        Ok(refined)
    }
}

#[test]
fn test_workflow_personality_drives_multiple_passes() {
    let dir = tempfile::tempdir().expect("temp dir");
    let package = dir.path().join("english").join("generic").join("double");
    fs::create_dir_all(&package).expect("package dir");
    fs::write(package.join("config.yaml"), "name: double\n").expect("config.yaml");

    let mut processors = ProcessorRegistry::new();
    processors.register("double", || Box::new(DoublePass));

    let mut config = AppConfig::default();
    config.personality = "double".to_string();
    config.personalities_path = dir.path().to_path_buf();

    let factory = Arc::new(MockFactory::new(&["step"]));
    let mut runner = ModelRunner::new(config, registry_with(factory), Arc::new(processors));
    let chunks = runner.chunk_receiver();

    runner.start();
    runner.generate("write a poem", 21).expect("worker started");
    runner.wait_until_started(STARTUP);

    // Two generate passes, one scripted fragment each.
    let collected = drain_when_idle(&runner, &chunks);
    let texts: Vec<&str> = collected.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["step", "step"]);

    runner.stop();
}
