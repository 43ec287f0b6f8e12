//! In-process embeddings via fastembed (ONNX Runtime, bundled).
//!
//! The model is downloaded from Hugging Face on first use and cached; later
//! calls run offline. Inference is CPU-bound, so it runs on the blocking pool.
//!
//! Blocking work cannot be aborted. When the caller stops waiting (stage
//! timeout, dropped request) the task finishes the batch in flight, then
//! skips the remaining batches and releases the model, so the next request
//! waits for at most one batch of abandoned work.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

use super::{finish_batch, query_instruction, Embedder, InputPolicy};
use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};

/// Embedder running a fastembed model locally.
///
/// The loaded model is kept for the lifetime of the embedder, which the
/// caller owns and injects; chunks and vectors are never cached here.
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    policy: InputPolicy,
    query_instruction: Option<String>,
    kind: fastembed::EmbeddingModel,
    model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if !config.device.eq_ignore_ascii_case("cpu") {
            return Err(PipelineError::Config(format!(
                "local embeddings run on cpu only; got device '{}'",
                config.device
            )));
        }
        let kind = config_to_fastembed_model(&config.model)?;
        let dims = config.dims.unwrap_or_else(|| default_dims(&config.model));

        Ok(Self {
            model_name: config.model.clone(),
            dims,
            batch_size: config.batch_size,
            policy: InputPolicy::from_config(config),
            query_instruction: query_instruction(config),
            kind,
            model: Arc::new(Mutex::new(None)),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    #[instrument(skip_all, fields(model = %self.model_name, texts = texts.len()))]
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let prepared = self.policy.prepare(texts)?;
        let slot = Arc::clone(&self.model);
        let kind = self.kind.clone();
        let batch_size = self.batch_size;
        let model_name = self.model_name.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancelled));

        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| PipelineError::Embedding("embedding model lock poisoned".into()))?;
            if guard.is_none() {
                info!(model = %model_name, "loading local embedding model");
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(kind).with_show_download_progress(false),
                )
                .map_err(|e| {
                    PipelineError::Embedding(format!(
                        "Failed to initialize local embedding model: {}",
                        e
                    ))
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| PipelineError::Embedding("embedding model unavailable".into()))?;
            run_batches(&prepared, batch_size, &cancelled, |batch| {
                model
                    .embed(batch.to_vec(), Some(batch_size))
                    .map_err(|e| PipelineError::Embedding(format!("Local embedding failed: {}", e)))
            })
        })
        .await
        .map_err(|e| PipelineError::Embedding(format!("embedding task failed: {}", e)))??;

        finish_batch(vectors, texts.len(), Some(self.dims))
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        match &self.query_instruction {
            Some(instruction) => self.embed(&format!("{}{}", instruction, query)).await,
            None => self.embed(query).await,
        }
    }
}

/// Raises the flag when the awaiting future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Embed `texts` batch by batch, stopping before the next batch once `cancelled` is set.
fn run_batches<F>(
    texts: &[String],
    batch_size: usize,
    cancelled: &AtomicBool,
    mut embed: F,
) -> Result<Vec<Vec<f32>>>
where
    F: FnMut(&[String]) -> Result<Vec<Vec<f32>>>,
{
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        if cancelled.load(Ordering::Relaxed) {
            debug!(done = out.len(), total = texts.len(), "embedding abandoned by caller");
            return Err(PipelineError::Embedding("embedding cancelled".into()));
        }
        out.extend(embed(batch)?);
    }
    Ok(out)
}

fn default_dims(model_name: &str) -> usize {
    match model_name {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(PipelineError::Config(format!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}
