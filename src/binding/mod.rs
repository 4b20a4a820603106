//! Model binding capability surface.
//!
//! A binding is a thin adapter exposing a uniform generate/tokenize
//! interface over one inference backend. Concrete bindings are resolved
//! through a [`registry::BindingRegistry`] keyed by name; a binding's
//! on-disk directory under the bindings root holds its assets
//! (`models.yaml`, install marker), never its code.

pub mod mock;
pub mod openai;
pub mod registry;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::{BindingLoadError, GenerationFailure};

pub use registry::BindingRegistry;

/// What kind of payload a streaming callback invocation carries.
///
/// Plain token streaming only ever produces `Chunk`; workflows may emit
/// the richer kinds (status text, references, code, UI payloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// An incremental fragment of the answer.
    Chunk,
    /// A complete message replacing anything streamed so far.
    FullText,
    /// Status/metadata text not part of the answer.
    Meta,
    /// A source reference produced by a workflow step.
    Reference,
    /// A code payload.
    Code,
    /// An opaque UI payload.
    Ui,
}

/// Streaming callback invoked once per generated unit.
///
/// Returning `false` asks the binding to stop generating; any work the
/// backend has already buffered is not forcibly terminated.
pub type TokenCallback<'a> = dyn FnMut(&str, MessageKind) -> bool + 'a;

/// Sampling parameters passed by value into a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: u32,
    /// -1 requests a random seed.
    pub seed: i64,
    pub n_threads: u32,
}

/// A constructed model binding, owned exclusively by the worker thread.
pub trait LlmBinding {
    /// The registry name this binding was built under.
    fn name(&self) -> &str;

    /// Generate text from a prompt, streaming each unit through `callback`.
    ///
    /// Returns the full generated text. On failure the error carries the
    /// partial output produced before the failure; callers treat this as
    /// recoverable.
    fn generate(
        &mut self,
        prompt: &str,
        n_predict: u32,
        params: &SamplingParams,
        callback: &mut TokenCallback<'_>,
    ) -> Result<String, GenerationFailure>;

    /// Tokenize `text` with the backend's tokenizer, when it has one.
    fn tokenize(&self, text: &str) -> Option<Vec<i32>>;

    /// Inverse of [`LlmBinding::tokenize`], when supported.
    fn detokenize(&self, tokens: &[i32]) -> Option<String>;
}

/// Constructs bindings of one kind; registered by name in the registry.
pub trait BindingFactory: Send + Sync {
    /// Registry key; also the binding's directory name under the
    /// bindings root.
    fn name(&self) -> &str;

    /// Build a binding instance from the active configuration.
    ///
    /// `binding_dir` is the binding's asset directory; it may not exist
    /// for bindings that need nothing on disk.
    fn build(
        &self,
        config: &AppConfig,
        binding_dir: &Path,
    ) -> Result<Box<dyn LlmBinding>, BindingLoadError>;

    /// One-time setup hook. The registry runs it once per binding
    /// directory, guarded by an install marker file.
    fn install(&self, binding_dir: &Path) -> Result<(), BindingLoadError> {
        let _ = binding_dir;
        Ok(())
    }
}

/// One row of a binding's `models.yaml` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub filename: Option<String>,
    /// Download location for the model file.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
