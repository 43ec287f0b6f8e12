//! End-to-end request orchestration.
//!
//! One call to [`Pipeline::answer`] walks a single request through
//!
//! ```text
//! Loading → Embedding → Indexing → Retrieving → Composing → Generating → Done
//! ```
//!
//! Each stage runs only after the previous one succeeded. The first failure
//! ends the request as a [`PipelineFailure`] naming the stage; nothing is
//! retried and no partial answer is returned. A document with no extractable
//! text, or a retrieval that selects nothing, short-circuits to the refusal
//! answer without calling the language model.
//!
//! Chunks and the index belong to the request and are rebuilt on every call.
//! The pipeline itself only holds the injected backends, so one instance can
//! serve concurrent requests.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, instrument, Span};

use crate::config::{AnswerConfig, Config, LoaderConfig, RetrievalConfig};
use crate::embedding::{create_embedder, Embedder};
use crate::error::{PipelineError, PipelineFailure, Result, Stage};
use crate::guardrails::limit_sentences;
use crate::index::VectorIndex;
use crate::llm::{create_llm, LanguageModel};
use crate::loader::{self, DocumentSource};
use crate::models::Answer;
use crate::prompt;

/// Question-answering pipeline over a single spreadsheet per request.
#[derive(Clone)]
pub struct Pipeline {
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    retrieval: RetrievalConfig,
    loader: LoaderConfig,
    answer: AnswerConfig,
    stage_timeout: Duration,
}

impl Pipeline {
    /// Pipeline over already-constructed backends, with default settings.
    pub fn new(embedder: Arc<dyn Embedder>, llm: Arc<dyn LanguageModel>) -> Self {
        let defaults = Config::default();
        Self {
            embedder,
            llm,
            retrieval: defaults.retrieval,
            loader: defaults.loader,
            answer: defaults.answer,
            stage_timeout: Duration::from_secs(defaults.pipeline.stage_timeout_secs),
        }
    }

    /// Build the configured backends and wire them into a pipeline.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let llm = create_llm(&config.llm)?;
        Ok(Self::new(embedder, llm)
            .with_retrieval(config.retrieval)
            .with_loader(config.loader)
            .with_answer(config.answer)
            .with_stage_timeout(Duration::from_secs(config.pipeline.stage_timeout_secs)))
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_answer(mut self, answer: AnswerConfig) -> Self {
        self.answer = answer;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn llm(&self) -> &Arc<dyn LanguageModel> {
        &self.llm
    }

    /// Answer `question` from the spreadsheet in `source`.
    ///
    /// `k` overrides `retrieval.k` for this call. Returns the generated text
    /// (capped at `answer.max_sentences`) and the evidence, in retrieval order.
    #[instrument(
        skip_all,
        fields(source = %source.name(), fingerprint = tracing::field::Empty, k = tracing::field::Empty)
    )]
    pub async fn answer(
        &self,
        source: &DocumentSource,
        question: &str,
        k: Option<usize>,
    ) -> std::result::Result<Answer, PipelineFailure> {
        let started = Instant::now();
        let k = k.unwrap_or(self.retrieval.k);
        Span::current().record("k", k as u64);

        // Loading
        let stage_start = Instant::now();
        let mut chunks = {
            let bytes = source.read().map_err(|e| PipelineFailure::new(Stage::Loading, e))?;
            Span::current().record("fingerprint", fingerprint(&bytes).as_str());
            loader::load_bytes(&source.name(), &bytes, &self.loader)
                .map_err(|e| PipelineFailure::new(Stage::Loading, e))?
        };
        info!(
            stage = %Stage::Loading,
            chunks = chunks.len(),
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "stage complete"
        );

        if chunks.is_empty() {
            info!("no extractable text; returning refusal");
            return Ok(Answer::refusal());
        }

        // Embedding
        let stage_start = Instant::now();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .bounded(Stage::Embedding, self.embedder.embed_many(&texts))
            .await?;
        if vectors.len() != chunks.len() {
            return Err(PipelineFailure::new(
                Stage::Embedding,
                PipelineError::Embedding(format!(
                    "expected {} embeddings, backend returned {}",
                    chunks.len(),
                    vectors.len()
                )),
            ));
        }
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }
        info!(
            stage = %Stage::Embedding,
            model = self.embedder.model_name(),
            vectors = chunks.len(),
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "stage complete"
        );

        // Indexing
        let index =
            VectorIndex::build(chunks).map_err(|e| PipelineFailure::new(Stage::Indexing, e))?;
        info!(stage = %Stage::Indexing, size = index.len(), dims = index.dims(), "stage complete");

        // Retrieving
        let stage_start = Instant::now();
        let evidence = if k == 0 {
            Vec::new()
        } else {
            let query = self
                .bounded(Stage::Retrieving, self.embedder.embed_query(question))
                .await?;
            index
                .query(&query, k, self.retrieval.fetch_k, self.retrieval.lambda_mult)
                .map_err(|e| PipelineFailure::new(Stage::Retrieving, e))?
        };
        drop(index);
        info!(
            stage = %Stage::Retrieving,
            evidence = evidence.len(),
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "stage complete"
        );

        if evidence.is_empty() {
            info!("no evidence retrieved; returning refusal");
            return Ok(Answer::refusal());
        }

        // Composing
        let prompt = prompt::compose(question, &evidence);
        info!(stage = %Stage::Composing, prompt_chars = prompt.len(), "stage complete");

        // Generating
        let stage_start = Instant::now();
        let raw = self
            .bounded(Stage::Generating, self.llm.generate(&prompt))
            .await?;
        let text = limit_sentences(&raw, self.answer.max_sentences);
        info!(
            stage = %Stage::Generating,
            model = self.llm.model_name(),
            answer_chars = text.len(),
            elapsed_ms = stage_start.elapsed().as_millis() as u64,
            "stage complete"
        );

        info!(
            stage = %Stage::Done,
            total_ms = started.elapsed().as_millis() as u64,
            "request answered"
        );
        Ok(Answer { text, evidence })
    }

    /// Run one backend call under the stage timeout.
    async fn bounded<T>(
        &self,
        stage: Stage,
        call: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, PipelineFailure> {
        match tokio::time::timeout(self.stage_timeout, call).await {
            Ok(result) => result.map_err(|e| PipelineFailure::new(stage, e)),
            Err(_) => Err(PipelineFailure::new(
                stage,
                PipelineError::Timeout {
                    stage,
                    after: self.stage_timeout,
                },
            )),
        }
    }
}

/// Short SHA-256 prefix identifying a document in logs.
fn fingerprint(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}
