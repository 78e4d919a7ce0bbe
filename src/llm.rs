//! Text generation against an external language model.
//!
//! | Provider   | Endpoint                     | Answer field                  |
//! |------------|------------------------------|-------------------------------|
//! | `ollama`   | `POST /api/generate`         | `response`                    |
//! | `openai`   | `POST /v1/chat/completions`  | `choices[0].message.content`  |
//! | `llamacpp` | `POST /completion`           | `content`                     |
//!
//! `openai` also covers OpenAI-compatible gateways (vLLM, LM Studio) via
//! `llm.url`; the API key is only required against api.openai.com.

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::retry;

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const LLAMACPP_DEFAULT_URL: &str = "http://localhost:8080";

/// OpenAI rejects more than four stop sequences.
const OPENAI_MAX_STOP: usize = 4;

/// Model identifier reported alongside answers.
pub fn model_label(config: &LlmConfig) -> Option<String> {
    if !config.is_enabled() {
        return None;
    }
    Some(
        config
            .model
            .clone()
            .unwrap_or_else(|| config.provider.clone()),
    )
}

/// Complete `prompt` with the configured model and return the trimmed answer.
pub async fn generate(config: &LlmConfig, prompt: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let answer = match config.provider.as_str() {
        "ollama" => generate_ollama(&client, config, prompt).await?,
        "openai" => generate_openai(&client, config, prompt).await?,
        "llamacpp" => generate_llamacpp(&client, config, prompt).await?,
        "disabled" => bail!("Language model provider is disabled"),
        other => bail!("Unknown llm provider: {}", other),
    };

    Ok(answer.trim().to_string())
}

fn base_url<'a>(config: &'a LlmConfig, default: &'a str) -> &'a str {
    config.url.as_deref().unwrap_or(default).trim_end_matches('/')
}

fn required_model(config: &LlmConfig) -> Result<&str> {
    config
        .model
        .as_deref()
        .with_context(|| format!("llm.model required for {} provider", config.provider))
}

// ============ Ollama ============

async fn generate_ollama(client: &reqwest::Client, config: &LlmConfig, prompt: &str) -> Result<String> {
    let mut body = serde_json::json!({
        "model": required_model(config)?,
        "prompt": prompt,
        "stream": false,
        "options": {
            "num_predict": config.max_tokens,
            "temperature": config.temperature,
            "stop": config.stop,
        },
    });
    if let Some(system) = &config.system_prompt {
        body["system"] = serde_json::Value::String(system.clone());
    }

    let url = format!("{}/api/generate", base_url(config, OLLAMA_DEFAULT_URL));
    let json = retry::post_json(client, &url, None, &body, config.max_retries, "Ollama").await?;

    json.get("response")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))
}

// ============ OpenAI ============

async fn generate_openai(client: &reqwest::Client, config: &LlmConfig, prompt: &str) -> Result<String> {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if api_key.is_none() && config.url.is_none() {
        bail!("OPENAI_API_KEY environment variable not set");
    }

    let mut messages = Vec::new();
    if let Some(system) = &config.system_prompt {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    messages.push(serde_json::json!({"role": "user", "content": prompt}));

    let mut body = serde_json::json!({
        "model": required_model(config)?,
        "messages": messages,
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
    });
    if !config.stop.is_empty() {
        let stop: Vec<&String> = config.stop.iter().take(OPENAI_MAX_STOP).collect();
        body["stop"] = serde_json::json!(stop);
    }

    let url = format!("{}/v1/chat/completions", base_url(config, OPENAI_DEFAULT_URL));
    let json = retry::post_json(
        client,
        &url,
        api_key.as_deref(),
        &body,
        config.max_retries,
        "OpenAI",
    )
    .await?;

    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

// ============ llama.cpp server ============

async fn generate_llamacpp(
    client: &reqwest::Client,
    config: &LlmConfig,
    prompt: &str,
) -> Result<String> {
    let prompt = match &config.system_prompt {
        Some(system) => format!("{}\n\n{}", system, prompt),
        None => prompt.to_string(),
    };
    let body = serde_json::json!({
        "prompt": prompt,
        "n_predict": config.max_tokens,
        "temperature": config.temperature,
        "stop": config.stop,
    });

    let url = format!("{}/completion", base_url(config, LLAMACPP_DEFAULT_URL));
    let json = retry::post_json(client, &url, None, &body, config.max_retries, "llama.cpp").await?;

    json.get("content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid llama.cpp response: missing content field"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(provider: &str, url: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            model: Some("test-model".to_string()),
            url: Some(url.to_string()),
            max_retries: 0,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn ollama_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "stream": false,
                "options": {"num_predict": 500, "stop": ["Question:"]}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "  Rust is a systems language.\n"
            })))
            .mount(&server)
            .await;

        let answer = generate(&config("ollama", &server.uri()), "prompt").await.unwrap();
        assert_eq!(answer, "Rust is a systems language.");
    }

    #[tokio::test]
    async fn openai_compatible_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "prompt"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Short answer."}}]
            })))
            .mount(&server)
            .await;

        let mut cfg = config("openai", &server.uri());
        cfg.system_prompt = Some("Be brief.".to_string());
        let answer = generate(&cfg, "prompt").await.unwrap();
        assert_eq!(answer, "Short answer.");
    }

    #[tokio::test]
    async fn llamacpp_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completion"))
            .and(body_partial_json(serde_json::json!({"n_predict": 500})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": "From llama."
            })))
            .mount(&server)
            .await;

        let mut cfg = config("llamacpp", &server.uri());
        cfg.model = None;
        assert_eq!(generate(&cfg, "prompt").await.unwrap(), "From llama.");
        assert_eq!(model_label(&cfg).as_deref(), Some("llamacpp"));
    }

    #[tokio::test]
    async fn malformed_response_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"other": 1})))
            .mount(&server)
            .await;

        let err = generate(&config("ollama", &server.uri()), "p").await.unwrap_err();
        assert!(err.to_string().contains("missing response"));
    }

    #[tokio::test]
    async fn disabled_provider_errors() {
        assert!(generate(&LlmConfig::default(), "p").await.is_err());
        assert_eq!(model_label(&LlmConfig::default()), None);
    }
}
