//! LLM client factory.
//!
//! Centralizes provider-specific logic for creating LLM clients.

use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{ParleyError, Result};
use crate::llm::gemini::DEFAULT_GEMINI_MODEL;
use crate::llm::ollama::{DEFAULT_OLLAMA_MODEL, DEFAULT_OLLAMA_URL};
use crate::llm::openai::DEFAULT_OPENAI_MODEL;
use crate::llm::{
    GeminiClient, GeminiConfig, LlmClient, LlmProvider, MockLlmClient, OllamaClient, OllamaConfig,
    OpenAiClient, OpenAiConfig,
};

/// Creates an LLM client from configuration, reading fallbacks from the
/// process environment.
///
/// `timeout` bounds each HTTP request; callers pass the query budget so a
/// request never outlives the question it serves.
pub fn create_client(config: &LlmConfig, timeout: Duration) -> Result<Box<dyn LlmClient>> {
    create_client_with_env(config, timeout, |key| std::env::var(key).ok())
}

/// Creates an LLM client using `lookup` for environment fallbacks.
///
/// For providers that require an API key (Gemini, OpenAI), the key is resolved in order:
/// 1. `llm.api_key` from configuration
/// 2. Environment variable (`GEMINI_API_KEY` or `OPENAI_API_KEY`)
///
/// Ollama's address comes from `llm.base_url`, then `OLLAMA_URL`, then the
/// local default.
pub fn create_client_with_env<F>(
    config: &LlmConfig,
    timeout: Duration,
    lookup: F,
) -> Result<Box<dyn LlmClient>>
where
    F: Fn(&str) -> Option<String>,
{
    let provider: LlmProvider = config.provider.parse().map_err(ParleyError::config)?;

    match provider {
        LlmProvider::Gemini => {
            let key = require_key(config, &lookup, "GEMINI_API_KEY")?;
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());
            let mut gemini = GeminiConfig::new(key, model)
                .with_sampling(config.temperature, config.max_tokens)
                .with_timeout(timeout);
            if let Some(url) = &config.base_url {
                gemini = gemini.with_url(url.clone());
            }
            Ok(Box::new(GeminiClient::new(gemini)?))
        }
        LlmProvider::OpenAi => {
            let key = require_key(config, &lookup, "OPENAI_API_KEY")?;
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
            let mut openai = OpenAiConfig::new(key, model)
                .with_sampling(config.temperature, config.max_tokens)
                .with_timeout(timeout);
            if let Some(url) = &config.base_url {
                openai = openai.with_url(url.clone());
            }
            Ok(Box::new(OpenAiClient::new(openai)?))
        }
        LlmProvider::Ollama => {
            let url = config
                .base_url
                .clone()
                .or_else(|| lookup("OLLAMA_URL"))
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string());
            Ok(Box::new(OllamaClient::new(
                OllamaConfig::new(model)
                    .with_url(url)
                    .with_sampling(config.temperature, config.max_tokens)
                    .with_timeout(timeout),
            )?))
        }
        LlmProvider::Mock => Ok(Box::new(MockLlmClient::new())),
    }
}

fn require_key<F>(config: &LlmConfig, lookup: &F, env_var: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    config
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| lookup(env_var).filter(|k| !k.is_empty()))
        .ok_or_else(|| {
            ParleyError::llm(format!(
                "No API key configured. Set llm.api_key or {env_var}."
            ))
        })
}
