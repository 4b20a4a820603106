//! Error types shared across the crate.
//!
//! Binding and personality resolution have their own failure modes;
//! generation failures are recoverable and carry whatever output was
//! already produced.

use std::path::PathBuf;

use thiserror::Error;

/// Failure while resolving or constructing a model binding.
#[derive(Debug, Error)]
pub enum BindingLoadError {
    /// No factory was registered under the requested name.
    #[error("no binding registered under the name `{name}`")]
    Unknown { name: String },

    /// The binding's one-time install hook failed.
    #[error("install hook for binding `{name}` failed: {reason}")]
    Install { name: String, reason: String },

    /// The binding factory could not construct the binding instance.
    #[error("couldn't construct binding `{name}`: {reason}")]
    Build { name: String, reason: String },

    /// The binding's `models.yaml` listing is missing or invalid.
    #[error("couldn't read model listing {}: {reason}", path.display())]
    ModelListing { path: PathBuf, reason: String },
}

/// Failure while loading a personality package.
///
/// Callers that want the original fail-soft behavior use
/// [`crate::personality::Personality::load_or_default`], which logs this
/// error and falls back to the built-in default persona.
#[derive(Debug, Error)]
pub enum PersonalityLoadError {
    #[error("personality package {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("personality package {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("personality package {} has no config.yaml", .0.display())]
    MissingConfig(PathBuf),

    #[error("couldn't read personality package: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid personality configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A generation attempt that stopped before completing normally.
///
/// Recoverable: `partial` holds everything produced before the failure,
/// and the worker keeps that output instead of propagating the error.
#[derive(Debug, Error)]
#[error("generation failed: {reason}")]
pub struct GenerationFailure {
    pub partial: String,
    pub reason: String,
}

impl GenerationFailure {
    pub fn new(partial: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            partial: partial.into(),
            reason: reason.into(),
        }
    }
}

/// Returned by `generate` when the worker has not been started.
///
/// The request is dropped either way; the error only makes the drop
/// observable to callers that care.
#[derive(Debug, Error)]
#[error("the generation worker has not been started; request dropped")]
pub struct WorkerNotStartedError;

/// Failure while reading the application configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
