//! Embedding backends.
//!
//! Defines the [`Embedder`] trait the pipeline is built against, and two
//! concrete implementations:
//! - **[`LocalEmbedder`]**: runs a sentence-embedding model in-process via
//!   fastembed (default `bge-small-en-v1.5`, CPU). No network after the first
//!   model download.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Every vector an embedder returns has unit length, so dot product and cosine
//! similarity coincide. Input longer than `embedding.max_input_chars` is either
//! truncated or rejected, per [`OverflowPolicy`]; the choice is explicit in
//! configuration and never silent.
//!
//! Questions go through [`Embedder::embed_query`], which may prefix a model
//! specific instruction; rows go through [`Embedder::embed_many`] unchanged.
//!
//! Backends are never retried here: a failed call fails the request.
//!
//! # Provider Selection
//!
//! | Config Value | Embedder |
//! |-------------|----------|
//! | `"local"` | [`LocalEmbedder`] (feature `local-embeddings-fastembed`) |
//! | `"ollama"` | [`OllamaEmbedder`] |
//! | `"disabled"` | construction error |

#[cfg(feature = "local-embeddings-fastembed")]
mod local;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::{EmbeddingConfig, OverflowPolicy};
use crate::error::{PipelineError, Result};

/// Maps text to fixed-length, unit-norm vectors.
///
/// `embed_many` must preserve input order, and for a fixed backend and model
/// `embed_many(&[a, b])[0] == embed(a)`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"bge-small-en-v1.5"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality, when known before the first call.
    fn dims(&self) -> Option<usize>;

    /// Embed a batch of texts, one vector per text, in input order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(&[text.to_string()]).await?;
        match vectors.len() {
            1 => Ok(vectors.remove(0)),
            n => Err(PipelineError::Embedding(format!(
                "expected 1 embedding, backend returned {}",
                n
            ))),
        }
    }

    /// Embed a search question. Defaults to [`Embedder::embed`].
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(query).await
    }
}

/// Query instruction the BGE English models were trained with.
pub const BGE_QUERY_INSTRUCTION: &str = "Represent this question for searching relevant passages: ";

/// Resolve `embedding.query_instruction`: explicit value, `""` for none, or
/// the model's own instruction when unset.
pub fn query_instruction(config: &EmbeddingConfig) -> Option<String> {
    match config.query_instruction.as_deref() {
        Some("") => None,
        Some(instruction) => Some(instruction.to_string()),
        None if config.model.starts_with("bge-") && config.model.contains("-en") => {
            Some(BGE_QUERY_INSTRUCTION.to_string())
        }
        None => None,
    }
}

/// Length policy applied to every text before it reaches a backend.
#[derive(Debug, Clone, Copy)]
pub struct InputPolicy {
    pub max_chars: usize,
    pub overflow: OverflowPolicy,
}

impl InputPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_chars: config.max_input_chars,
            overflow: config.overflow,
        }
    }

    /// Apply the policy to a batch, truncating or rejecting over-long texts.
    pub fn prepare(&self, texts: &[String]) -> Result<Vec<String>> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| match text.char_indices().nth(self.max_chars) {
                None => Ok(text.clone()),
                Some((cut, _)) => match self.overflow {
                    OverflowPolicy::Truncate => {
                        debug!(index = i, max_chars = self.max_chars, "truncating embedding input");
                        Ok(text[..cut].to_string())
                    }
                    OverflowPolicy::Reject => Err(PipelineError::Embedding(format!(
                        "input {} exceeds {} characters",
                        i, self.max_chars
                    ))),
                },
            })
            .collect()
    }
}

/// Scale `v` to unit length. Fails on zero or non-finite vectors.
pub fn normalize(mut v: Vec<f32>) -> Result<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return Err(PipelineError::Embedding(
            "backend returned a zero or non-finite vector".to_string(),
        ));
    }
    for x in &mut v {
        *x /= norm;
    }
    Ok(v)
}

/// Check a backend batch (count and dimension) and normalize every vector.
pub(crate) fn finish_batch(
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dims: Option<usize>,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(PipelineError::Embedding(format!(
            "expected {} embeddings, backend returned {}",
            expected,
            vectors.len()
        )));
    }
    let want = dims.or_else(|| vectors.first().map(Vec::len));
    vectors
        .into_iter()
        .map(|v| {
            if Some(v.len()) != want {
                return Err(PipelineError::Embedding(format!(
                    "vector size mismatch: got {}, want {}",
                    v.len(),
                    want.unwrap_or_default()
                )));
            }
            normalize(v)
        })
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance.
///
/// Calls `POST {url}/api/embed` with the configured model. Requires Ollama to
/// be running with an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: Option<usize>,
    url: String,
    batch_size: usize,
    policy: InputPolicy,
    query_instruction: Option<String>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(crate::config::default_ollama_url);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            model: config.model.clone(),
            dims: config.dims,
            url: url.trim_end_matches('/').to_string(),
            batch_size: config.batch_size,
            policy: InputPolicy::from_config(config),
            query_instruction: query_instruction(config),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let endpoint = format!("{}/api/embed", self.url);
        debug!("POST {}", endpoint);
        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Embedding(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Embedding(format!(
                "Ollama API error {}: {}",
                status,
                body_text.chars().take(240).collect::<String>()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Embedding(format!("invalid Ollama response: {}", e)))?;
        parse_ollama_response(&json)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.dims
    }

    #[instrument(skip_all, fields(model = %self.model, texts = texts.len()))]
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let prepared = self.policy.prepare(texts)?;
        let mut out = Vec::with_capacity(prepared.len());
        for batch in prepared.chunks(self.batch_size) {
            out.extend(self.embed_batch(batch).await?);
        }
        finish_batch(out, texts.len(), self.dims)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        match &self.query_instruction {
            Some(instruction) => self.embed(&format!("{}{}", instruction, query)).await,
            None => self.embed(query).await,
        }
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            PipelineError::Embedding("Invalid Ollama response: missing embeddings array".into())
        })?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec = embedding
            .as_array()
            .ok_or_else(|| {
                PipelineError::Embedding("Invalid Ollama response: embedding is not an array".into())
            })?
            .iter()
            .map(|v| {
                v.as_f64().map(|f| f as f32).ok_or_else(|| {
                    PipelineError::Embedding("Invalid Ollama response: non-numeric value".into())
                })
            })
            .collect::<Result<Vec<f32>>>()?;
        result.push(vec);
    }

    Ok(result)
}

/// Create the [`Embedder`] selected by `config.provider`.
///
/// # Errors
///
/// [`PipelineError::Config`] for `"disabled"`, unknown providers, a missing
/// cargo feature, or an unsupported `device`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(PipelineError::Config(
            "Local embedding provider requires --features local-embeddings-fastembed".into(),
        )),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "disabled" => Err(PipelineError::Config(
            "embedding provider is disabled; set [embedding] provider".into(),
        )),
        other => Err(PipelineError::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}
