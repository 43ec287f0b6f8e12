//! Language-model client.
//!
//! [`LanguageModel`] is the seam the pipeline generates through. The shipped
//! implementation, [`OllamaLlm`], is a thin client for a local Ollama server:
//! `POST {url}/api/generate` with `stream=false`, returning the `response` field.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};

/// Text generation backend: prompt in, best-effort natural-language text out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt`.
    ///
    /// Fails with [`PipelineError::Generation`] when the backend is
    /// unreachable, times out, answers with a non-2xx status, or returns
    /// nothing usable.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama text-generation client.
pub struct OllamaLlm {
    client: reqwest::Client,
    model: String,
    temperature: Option<f32>,
    url_generate: String,
}

impl OllamaLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let endpoint = config.url.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(PipelineError::Config(format!(
                "invalid Ollama endpoint: '{}'",
                config.url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            model: config.model.clone(),
            temperature: config.temperature,
            url_generate: format!("{}/api/generate", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, prompt_chars = prompt.len()))]
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: self.temperature.map(|temperature| GenerateOptions { temperature }),
        };

        debug!("POST {}", self.url_generate);
        let resp = self
            .client
            .post(&self.url_generate)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Generation(format!("Ollama request timed out: {}", e))
                } else {
                    PipelineError::Generation(format!("Ollama transport error: {}", e))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet = text.chars().take(240).collect::<String>();
            return Err(PipelineError::Generation(format!(
                "unexpected HTTP status {} from {}: {}",
                status, self.url_generate, snippet
            )));
        }

        let out: GenerateResponse = resp.json().await.map_err(|e| {
            PipelineError::Generation(format!(
                "failed to decode response: {e}; ensure `stream=false` is used"
            ))
        })?;

        if out.response.trim().is_empty() {
            return Err(PipelineError::Generation(
                "Ollama returned an empty response".into(),
            ));
        }
        Ok(out.response)
    }
}

/// Create the [`LanguageModel`] selected by `config.provider`.
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaLlm::new(config)?)),
        other => Err(PipelineError::Config(format!(
            "Unknown llm provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<Value>>>;

    /// `/api/generate` stub that records request bodies and replies with `reply`.
    async fn generate_stub(reply: &'static str) -> (LlmConfig, Seen) {
        async fn generate(
            State((seen, reply)): State<(Seen, &'static str)>,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            seen.lock().unwrap().push(body);
            Json(json!({ "model": "mistral", "response": reply, "done": true }))
        }

        let seen = Seen::default();
        let app = Router::new()
            .route("/api/generate", post(generate))
            .with_state((Arc::clone(&seen), reply));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = LlmConfig {
            url: format!("http://{}/", addr),
            ..LlmConfig::default()
        };
        (config, seen)
    }

    #[test]
    fn request_omits_options_without_temperature() {
        let body = GenerateRequest {
            model: "mistral",
            prompt: "hi",
            stream: false,
            options: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert!(json.get("options").is_none());
    }

    #[test]
    fn request_carries_temperature() {
        let body = GenerateRequest {
            model: "mistral",
            prompt: "hi",
            stream: false,
            options: Some(GenerateOptions { temperature: 0.0 }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["options"]["temperature"], 0.0);
    }

    #[test]
    fn rejects_endpoint_without_scheme() {
        let config = LlmConfig {
            url: "localhost:11434".into(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            OllamaLlm::new(&config),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn default_config_builds_mistral_client() {
        let llm = create_llm(&LlmConfig::default()).unwrap();
        assert_eq!(llm.model_name(), "mistral");
    }

    #[tokio::test]
    async fn generate_posts_non_streaming_request() {
        let (config, seen) = generate_stub("Acme Refill. See http://example.com/x").await;
        let config = LlmConfig {
            temperature: Some(0.0),
            ..config
        };
        let llm = OllamaLlm::new(&config).unwrap();

        let text = llm.generate("Question: which brand?").await.unwrap();
        assert_eq!(text, "Acme Refill. See http://example.com/x");

        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["model"], "mistral");
        assert_eq!(requests[0]["prompt"], "Question: which brand?");
        assert_eq!(requests[0]["stream"], false);
        assert_eq!(requests[0]["options"]["temperature"], 0.0);
    }

    #[tokio::test]
    async fn blank_response_is_a_generation_error() {
        let (config, _) = generate_stub("  \n").await;
        let llm = OllamaLlm::new(&config).unwrap();
        assert!(matches!(
            llm.generate("hi").await,
            Err(PipelineError::Generation(_))
        ));
    }

    #[tokio::test]
    async fn error_status_carries_body_snippet() {
        async fn overloaded() -> (axum::http::StatusCode, &'static str) {
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "server busy")
        }
        let app = Router::new().route("/api/generate", post(overloaded));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = LlmConfig {
            url: format!("http://{}", addr),
            ..LlmConfig::default()
        };
        match OllamaLlm::new(&config).unwrap().generate("hi").await {
            Err(PipelineError::Generation(msg)) => {
                assert!(msg.contains("503"), "{}", msg);
                assert!(msg.contains("server busy"), "{}", msg);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_generation_error() {
        let config = LlmConfig {
            url: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
            ..LlmConfig::default()
        };
        let llm = OllamaLlm::new(&config).unwrap();
        assert!(matches!(
            llm.generate("hello").await,
            Err(PipelineError::Generation(_))
        ));
    }
}
