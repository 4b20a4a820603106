//! Scripted in-memory binding.
//!
//! Replays a fixed fragment script for any prompt. This is the test
//! surface for the worker (ordering, cancellation, rebuild counting) and
//! a zero-dependency default for running the CLI without a real backend.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::binding::{BindingFactory, LlmBinding, MessageKind, SamplingParams, TokenCallback};
use crate::config::AppConfig;
use crate::error::{BindingLoadError, GenerationFailure};

pub const MOCK_BINDING_NAME: &str = "mock";

/// Builds [`MockBinding`] instances and counts how many it has built.
pub struct MockFactory {
    fragments: Vec<String>,
    repeat: usize,
    step_delay: Duration,
    fail_at: Option<usize>,
    builds: Arc<AtomicUsize>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new(&["Hello", " world"])
    }
}

impl MockFactory {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| (*s).to_string()).collect(),
            repeat: 1,
            step_delay: Duration::ZERO,
            fail_at: None,
            builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replay the fragment script `repeat` times per generation call.
    pub fn with_repeat(mut self, repeat: usize) -> Self {
        self.repeat = repeat.max(1);
        self
    }

    /// Sleep between fragments, making generations take observable time.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fail with [`GenerationFailure`] after emitting `count` fragments.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_at = Some(count);
        self
    }

    /// How many bindings this factory has constructed so far.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl BindingFactory for MockFactory {
    fn name(&self) -> &str {
        MOCK_BINDING_NAME
    }

    fn build(
        &self,
        config: &AppConfig,
        _binding_dir: &Path,
    ) -> Result<Box<dyn LlmBinding>, BindingLoadError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBinding {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "mock-model".to_string()),
            fragments: self.fragments.clone(),
            repeat: self.repeat,
            step_delay: self.step_delay,
            fail_at: self.fail_at,
        }))
    }
}

/// Emits the scripted fragments through the callback, honoring the
/// callback's stop signal, the fragment budget, and the scripted failure.
pub struct MockBinding {
    model: String,
    fragments: Vec<String>,
    repeat: usize,
    step_delay: Duration,
    fail_at: Option<usize>,
}

impl LlmBinding for MockBinding {
    fn name(&self) -> &str {
        MOCK_BINDING_NAME
    }

    fn generate(
        &mut self,
        _prompt: &str,
        n_predict: u32,
        _params: &SamplingParams,
        callback: &mut TokenCallback<'_>,
    ) -> Result<String, GenerationFailure> {
        let mut output = String::new();
        let mut emitted: usize = 0;

        'script: for _ in 0..self.repeat {
            for fragment in &self.fragments {
                if n_predict > 0 && emitted as u32 >= n_predict {
                    break 'script;
                }
                if self.fail_at.is_some_and(|at| emitted >= at) {
                    return Err(GenerationFailure::new(
                        output,
                        format!("scripted failure in model `{}`", self.model),
                    ));
                }
                if !self.step_delay.is_zero() {
                    thread::sleep(self.step_delay);
                }
                output.push_str(fragment);
                emitted += 1;
                if !callback(fragment, MessageKind::Chunk) {
                    break 'script;
                }
            }
        }

        Ok(output)
    }

    fn tokenize(&self, text: &str) -> Option<Vec<i32>> {
        Some(text.bytes().map(i32::from).collect())
    }

    fn detokenize(&self, tokens: &[i32]) -> Option<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .map(|t| u8::try_from(*t))
            .collect::<Result<_, _>>()
            .ok()?;
        String::from_utf8(bytes).ok()
    }
}
