//! Typed application configuration.
//!
//! Every recognized key is a named field with a documented default; the
//! YAML loader warns about unknown keys instead of silently absorbing
//! them as attributes. `binding` accepts the legacy `backend` spelling.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::binding::SamplingParams;
use crate::error::ConfigError;
use crate::personality::Personality;

/// Keys the loader recognizes. Anything else in the file is warned about.
const KNOWN_KEYS: &[&str] = &[
    "version",
    "user_name",
    "binding",
    "backend",
    "model",
    "ctx_size",
    "n_threads",
    "seed",
    "temperature",
    "top_k",
    "top_p",
    "repeat_penalty",
    "repeat_last_n",
    "n_predict",
    "personality",
    "personality_category",
    "personality_language",
    "override_personality_model_parameters",
    "debug",
    "bindings_path",
    "personalities_path",
    "models_path",
];

fn default_version() -> u32 {
    5
}
fn default_user_name() -> String {
    "user".to_string()
}
fn default_binding() -> String {
    "mock".to_string()
}
fn default_ctx_size() -> u32 {
    2048
}
fn default_n_threads() -> u32 {
    8
}
fn default_seed() -> i64 {
    -1
}
fn default_temperature() -> f32 {
    0.9
}
fn default_top_k() -> u32 {
    50
}
fn default_top_p() -> f32 {
    0.95
}
fn default_repeat_penalty() -> f32 {
    1.2
}
fn default_repeat_last_n() -> u32 {
    40
}
fn default_n_predict() -> u32 {
    1024
}
fn default_personality() -> String {
    "default".to_string()
}
fn default_personality_category() -> String {
    "generic".to_string()
}
fn default_personality_language() -> String {
    "english".to_string()
}
fn default_bindings_path() -> PathBuf {
    PathBuf::from("bindings")
}
fn default_personalities_path() -> PathBuf {
    PathBuf::from("personalities")
}
fn default_models_path() -> PathBuf {
    PathBuf::from("models")
}

/// Application configuration, replaced wholesale by `set_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    /// Name of the binding to construct. `backend` is the legacy spelling.
    #[serde(default = "default_binding", alias = "backend")]
    pub binding: String,
    /// Model identifier handed to the binding. `None` lets the binding
    /// pick its own default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_ctx_size")]
    pub ctx_size: u32,
    #[serde(default = "default_n_threads")]
    pub n_threads: u32,
    /// -1 requests a random seed.
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: u32,
    #[serde(default = "default_n_predict")]
    pub n_predict: u32,
    #[serde(default = "default_personality")]
    pub personality: String,
    #[serde(default = "default_personality_category")]
    pub personality_category: String,
    #[serde(default = "default_personality_language")]
    pub personality_language: String,
    /// When true, generation uses the global sampling parameters above
    /// instead of the persona's own defaults.
    #[serde(default)]
    pub override_personality_model_parameters: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_bindings_path")]
    pub bindings_path: PathBuf,
    #[serde(default = "default_personalities_path")]
    pub personalities_path: PathBuf,
    #[serde(default = "default_models_path")]
    pub models_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        // An empty mapping deserializes to all defaults.
        serde_yaml::from_str("{}").unwrap_or_else(|_| unreachable!("defaults always deserialize"))
    }
}

impl AppConfig {
    /// Load a configuration file, warning about unrecognized keys.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;

        if let serde_yaml::Value::Mapping(map) = &value {
            for key in map.keys() {
                if let serde_yaml::Value::String(key) = key {
                    if !KNOWN_KEYS.contains(&key.as_str()) {
                        log::warn!(
                            "ignoring unknown configuration key `{key}` in {}",
                            path.display()
                        );
                    }
                }
            }
        }

        serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the configuration back out as YAML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_yaml::to_string(self).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the sampling parameters for a generation call.
    ///
    /// Persona defaults win unless `override_personality_model_parameters`
    /// is set; seed and thread count always come from the global config.
    pub fn sampling(&self, persona: &Personality) -> SamplingParams {
        if self.override_personality_model_parameters {
            SamplingParams {
                temperature: self.temperature,
                top_k: self.top_k,
                top_p: self.top_p,
                repeat_penalty: self.repeat_penalty,
                repeat_last_n: self.repeat_last_n,
                seed: self.seed,
                n_threads: self.n_threads,
            }
        } else {
            SamplingParams {
                temperature: persona.model_temperature,
                top_k: persona.model_top_k,
                top_p: persona.model_top_p,
                repeat_penalty: persona.model_repeat_penalty,
                repeat_last_n: persona.model_repeat_last_n,
                seed: self.seed,
                n_threads: self.n_threads,
            }
        }
    }

    /// Token budget for one generation, honoring the override flag.
    pub fn n_predict(&self, persona: &Personality) -> u32 {
        if self.override_personality_model_parameters {
            self.n_predict
        } else {
            persona.model_n_predicts
        }
    }
}
