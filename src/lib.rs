//! Persona-driven chat layer over interchangeable LLM bindings.
//!
//! The pieces: a [`binding::BindingRegistry`] resolves named model
//! bindings; a [`personality::Personality`] bundles prompt templates,
//! sampling defaults and optional processing hooks; a
//! [`worker::ModelRunner`] owns a background thread that serves queued
//! generation requests, streaming chunks back while honoring
//! cancellation, queue clearing and configuration reloads.

pub mod antiprompt;
pub mod binding;
pub mod config;
pub mod error;
pub mod personality;
pub mod prompt;
pub mod worker;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{
    BindingLoadError, ConfigError, GenerationFailure, PersonalityLoadError, WorkerNotStartedError,
};
pub use worker::{GenerationChunk, ModelRunner};
