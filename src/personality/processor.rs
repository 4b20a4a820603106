//! Persona processors: optional pre/post hooks and multi-step workflows.
//!
//! Processors are resolved through a registry keyed by personality name,
//! populated in code at startup. A personality with no registered
//! processor simply has no hooks; that is the common case.

use std::collections::HashMap;

use crate::error::GenerationFailure;

/// Borrowed generation primitive handed to workflows.
///
/// Calls the worker's active binding and streams through the worker's
/// callback. A token budget of 0 means "use the resolved default".
pub type GenerateFn<'a> = dyn FnMut(&str, u32) -> Result<String, GenerationFailure> + 'a;

/// Custom logic attached to one personality.
///
/// All methods are optional; the defaults leave input and output
/// untouched and advertise no workflow.
pub trait PersonaProcessor: Send {
    /// Rewrite the user prompt before generation. `None` keeps it as is.
    fn process_model_input(&mut self, prompt: &str) -> Option<String> {
        let _ = prompt;
        None
    }

    /// Rewrite the final output after generation. `None` keeps it as is.
    fn process_model_output(&mut self, output: &str) -> Option<String> {
        let _ = output;
        None
    }

    /// Whether [`PersonaProcessor::run_workflow`] should replace the plain
    /// generation call.
    fn has_workflow(&self) -> bool {
        false
    }

    /// Multi-step generation procedure built on repeated `generate` calls
    /// (search-then-summarize, tree-of-thought sampling, ...).
    ///
    /// `prompt` is the raw request text; `full_discussion` the
    /// preprocessed discussion handed to the model.
    fn run_workflow(
        &mut self,
        prompt: &str,
        full_discussion: &str,
        generate: &mut GenerateFn<'_>,
    ) -> Result<String, GenerationFailure> {
        let _ = prompt;
        generate(full_discussion, 0)
    }
}

type ProcessorBuilder = Box<dyn Fn() -> Box<dyn PersonaProcessor> + Send + Sync>;

/// Maps personality names to processor constructors.
#[derive(Default)]
pub struct ProcessorRegistry {
    builders: HashMap<String, ProcessorBuilder>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a processor constructor to a personality name.
    pub fn register<F>(&mut self, personality: &str, builder: F)
    where
        F: Fn() -> Box<dyn PersonaProcessor> + Send + Sync + 'static,
    {
        self.builders
            .insert(personality.to_string(), Box::new(builder));
    }

    /// Build a fresh processor for the named personality, if one is
    /// registered.
    pub fn build(&self, personality: &str) -> Option<Box<dyn PersonaProcessor>> {
        self.builders.get(personality).map(|builder| builder())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}
