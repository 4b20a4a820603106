//! OpenAI-compatible completion binding.
//!
//! Talks to any server implementing the `/v1/completions` surface with
//! `stream: true` (the hosted API, llama.cpp's server, vLLM, ...).
//! The API key comes from `OPENAI_API_KEY`; `OPENAI_API_BASE` overrides
//! the endpoint for self-hosted servers.

use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::binding::{BindingFactory, LlmBinding, MessageKind, SamplingParams, TokenCallback};
use crate::config::AppConfig;
use crate::error::{BindingLoadError, GenerationFailure};

pub const OPENAI_BINDING_NAME: &str = "openai";

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo-instruct";

pub struct OpenAiFactory;

impl BindingFactory for OpenAiFactory {
    fn name(&self) -> &str {
        OPENAI_BINDING_NAME
    }

    fn build(
        &self,
        config: &AppConfig,
        _binding_dir: &Path,
    ) -> Result<Box<dyn LlmBinding>, BindingLoadError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| BindingLoadError::Build {
                name: OPENAI_BINDING_NAME.to_string(),
                reason: "OPENAI_API_KEY is not set".to_string(),
            })?;
        let endpoint =
            std::env::var("OPENAI_API_BASE").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        Ok(Box::new(OpenAiBinding {
            api_key,
            endpoint,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }))
    }
}

pub struct OpenAiBinding {
    api_key: String,
    endpoint: String,
    model: String,
}

impl LlmBinding for OpenAiBinding {
    fn name(&self) -> &str {
        OPENAI_BINDING_NAME
    }

    fn generate(
        &mut self,
        prompt: &str,
        n_predict: u32,
        params: &SamplingParams,
        callback: &mut TokenCallback<'_>,
    ) -> Result<String, GenerationFailure> {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "max_tokens": n_predict,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stream": true,
        });
        if params.seed >= 0 {
            body["seed"] = serde_json::json!(params.seed);
        }

        let response = ureq::post(&format!("{}/completions", self.endpoint))
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_string(&body.to_string())
            .map_err(|e| {
                GenerationFailure::new(String::new(), format!("completion request failed: {e}"))
            })?;

        let reader = BufReader::new(response.into_reader());
        let mut output = String::new();

        for line in reader.lines() {
            let line = line.map_err(|e| {
                GenerationFailure::new(output.clone(), format!("stream read failed: {e}"))
            })?;
            match parse_stream_line(&line) {
                StreamEvent::Fragment(text) => {
                    output.push_str(&text);
                    if !callback(&text, MessageKind::Chunk) {
                        // Early stop requested; drop the connection.
                        break;
                    }
                }
                StreamEvent::Done => break,
                StreamEvent::Skip => {}
            }
        }

        Ok(output)
    }

    // The hosted API exposes no tokenizer.
    fn tokenize(&self, _text: &str) -> Option<Vec<i32>> {
        None
    }

    fn detokenize(&self, _tokens: &[i32]) -> Option<String> {
        None
    }
}

/// One parsed server-sent-events line.
#[derive(Debug, PartialEq)]
enum StreamEvent {
    Fragment(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> StreamEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return StreamEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return StreamEvent::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(value) => value["choices"][0]["text"]
            .as_str()
            .map_or(StreamEvent::Skip, |text| {
                StreamEvent::Fragment(text.to_string())
            }),
        Err(_) => StreamEvent::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fragment_line() {
        let line = r#"data: {"choices":[{"text":"Hello"}]}"#;
        assert_eq!(
            parse_stream_line(line),
            StreamEvent::Fragment("Hello".to_string())
        );
    }

    #[test]
    fn test_parse_done_line() {
        assert_eq!(parse_stream_line("data: [DONE]"), StreamEvent::Done);
    }

    #[test]
    fn test_non_data_lines_are_skipped() {
        assert_eq!(parse_stream_line(""), StreamEvent::Skip);
        assert_eq!(parse_stream_line(": keep-alive"), StreamEvent::Skip);
        assert_eq!(parse_stream_line("data: not json"), StreamEvent::Skip);
    }

    #[test]
    fn test_fragment_without_text_is_skipped() {
        let line = r#"data: {"choices":[{"finish_reason":"stop"}]}"#;
        assert_eq!(parse_stream_line(line), StreamEvent::Skip);
    }
}
