//! Personality packages: prompt templates, sampling defaults, assets.
//!
//! A personality lives at `<root>/<language>/<category>/<name>` and must
//! contain a `config.yaml`; its keys are merged over the built-in
//! defaults. Everything else (assets, a registered processor) is
//! optional. Loading never fails upward: callers use `load_or_default`
//! and get the built-in persona when anything goes wrong.

pub mod processor;

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::antiprompt::{check_antiprompt, AntipromptHit};
use crate::error::PersonalityLoadError;
use processor::{PersonaProcessor, ProcessorRegistry};

/// A named bundle of prompt templates, sampling defaults and hooks.
pub struct Personality {
    pub name: String,
    pub author: String,
    pub version: String,
    pub user_name: String,
    pub language: String,
    pub category: String,
    pub description: String,
    /// Conditioning text prepended to every discussion. May use
    /// `{{date}}`, `{{time}}` and `{{date_time}}` template variables.
    pub conditioning: String,
    pub welcome_message: String,
    pub user_message_prefix: String,
    /// Separator inserted between discussion blocks.
    pub link_text: String,
    pub ai_message_prefix: String,
    /// Markers whose appearance in generated text triggers truncation.
    pub anti_prompts: Vec<String>,
    pub dependencies: Vec<String>,
    pub disclaimer: String,
    pub model_temperature: f32,
    pub model_n_predicts: u32,
    pub model_top_k: u32,
    pub model_top_p: f32,
    pub model_repeat_penalty: f32,
    pub model_repeat_last_n: u32,
    /// Directory this personality was loaded from, if any.
    pub package_path: Option<PathBuf>,
    pub logo_path: Option<PathBuf>,
    /// Everything under `assets/`, sorted.
    pub assets: Vec<PathBuf>,
    /// Optional custom pre/post-processing or workflow logic.
    pub processor: Option<Box<dyn PersonaProcessor>>,
}

impl std::fmt::Debug for Personality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Personality")
            .field("name", &self.name)
            .field("language", &self.language)
            .field("category", &self.category)
            .field("package_path", &self.package_path)
            .field("has_processor", &self.processor.is_some())
            .finish()
    }
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            name: "gpt4all".to_string(),
            author: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            user_name: "user".to_string(),
            language: "english".to_string(),
            category: "General".to_string(),
            description: "This personality is a helpful and Kind AI ready to help you solve your problems"
                .to_string(),
            conditioning:
                "GPT4All is a smart and helpful Assistant built by Nomic-AI. It can discuss with humans and assist them.\nDate: {{date}}"
                    .to_string(),
            welcome_message:
                "Welcome! I am GPT4All A free and open assistant. What can I do for you today?"
                    .to_string(),
            user_message_prefix: "### Human:".to_string(),
            link_text: "\n".to_string(),
            ai_message_prefix: "### Assistant:".to_string(),
            anti_prompts: vec![
                "### Human:".to_string(),
                "### Assistant:".to_string(),
                "Human:".to_string(),
                "Assistant:".to_string(),
            ],
            dependencies: Vec::new(),
            disclaimer: String::new(),
            model_temperature: 0.8,
            model_n_predicts: 1024,
            model_top_k: 50,
            model_top_p: 0.95,
            model_repeat_penalty: 1.3,
            model_repeat_last_n: 40,
            package_path: None,
            logo_path: None,
            assets: Vec::new(),
            processor: None,
        }
    }
}

/// `config.yaml` contents; every key optional, merged over the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PersonalityConfig {
    name: Option<String>,
    author: Option<String>,
    version: Option<String>,
    user_name: Option<String>,
    language: Option<String>,
    category: Option<String>,
    personality_description: Option<String>,
    personality_conditioning: Option<String>,
    welcome_message: Option<String>,
    user_message_prefix: Option<String>,
    link_text: Option<String>,
    ai_message_prefix: Option<String>,
    anti_prompts: Option<Vec<String>>,
    dependencies: Option<Vec<String>>,
    disclaimer: Option<String>,
    model_temperature: Option<f32>,
    model_n_predicts: Option<u32>,
    model_top_k: Option<u32>,
    model_top_p: Option<f32>,
    model_repeat_penalty: Option<f32>,
    model_repeat_last_n: Option<u32>,
}

impl Personality {
    /// Load `<root>/<language>/<category>/<name>`.
    pub fn load(
        root: &Path,
        language: &str,
        category: &str,
        name: &str,
        processors: &ProcessorRegistry,
    ) -> Result<Self, PersonalityLoadError> {
        let package = root.join(language).join(category).join(name);
        if !package.exists() {
            return Err(PersonalityLoadError::Missing(package));
        }
        if !package.is_dir() {
            return Err(PersonalityLoadError::NotADirectory(package));
        }
        let config_file = package.join("config.yaml");
        if !config_file.is_file() {
            return Err(PersonalityLoadError::MissingConfig(package));
        }

        let raw = fs::read_to_string(&config_file)?;
        let overrides: PersonalityConfig = serde_yaml::from_str(&raw)?;

        let mut persona = Self::default();
        persona.apply(overrides);
        persona.package_path = Some(package.clone());

        let assets_dir = package.join("assets");
        if assets_dir.is_dir() {
            let mut assets: Vec<PathBuf> = fs::read_dir(&assets_dir)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .collect();
            assets.sort();
            persona.logo_path = assets
                .iter()
                .find(|path| path.file_name() == Some(OsStr::new("logo.png")))
                .cloned();
            persona.assets = assets;
        }

        persona.processor = processors.build(name);
        Ok(persona)
    }

    /// Load a personality, falling back to the built-in default persona
    /// on any failure. The failure is logged, never propagated.
    pub fn load_or_default(
        root: &Path,
        language: &str,
        category: &str,
        name: &str,
        processors: &ProcessorRegistry,
    ) -> Self {
        match Self::load(root, language, category, name, processors) {
            Ok(persona) => persona,
            Err(e) => {
                log::warn!(
                    "couldn't load personality {language}/{category}/{name}: {e}; \
                     falling back to the default persona"
                );
                Self::default()
            }
        }
    }

    fn apply(&mut self, overrides: PersonalityConfig) {
        macro_rules! take {
            ($field:ident, $key:ident) => {
                if let Some(value) = overrides.$key {
                    self.$field = value;
                }
            };
        }
        take!(name, name);
        take!(author, author);
        take!(version, version);
        take!(user_name, user_name);
        take!(language, language);
        take!(category, category);
        take!(description, personality_description);
        take!(conditioning, personality_conditioning);
        take!(welcome_message, welcome_message);
        take!(user_message_prefix, user_message_prefix);
        take!(link_text, link_text);
        take!(ai_message_prefix, ai_message_prefix);
        take!(anti_prompts, anti_prompts);
        take!(dependencies, dependencies);
        take!(disclaimer, disclaimer);
        take!(model_temperature, model_temperature);
        take!(model_n_predicts, model_n_predicts);
        take!(model_top_k, model_top_k);
        take!(model_top_p, model_top_p);
        take!(model_repeat_penalty, model_repeat_penalty);
        take!(model_repeat_last_n, model_repeat_last_n);
    }

    /// The conditioning text with template variables rendered.
    pub fn conditioning_text(&self) -> String {
        let now = chrono::Local::now();
        let env = minijinja::Environment::new();
        match env.render_str(
            &self.conditioning,
            minijinja::context! {
                date => now.format("%Y-%m-%d").to_string(),
                time => now.format("%H:%M:%S").to_string(),
                date_time => now.format("%Y-%m-%d %H:%M:%S").to_string(),
            },
        ) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("conditioning template error in personality `{}`: {e}", self.name);
                self.conditioning.clone()
            }
        }
    }

    /// Check generated text against this persona's anti-prompt list.
    pub fn detect_antiprompt(&self, text: &str) -> Option<AntipromptHit> {
        check_antiprompt(text, &self.anti_prompts)
    }
}
