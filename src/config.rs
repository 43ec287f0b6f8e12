//! TOML configuration.
//!
//! Every section is optional; a missing file or section falls back to the
//! defaults below, which reproduce the stock setup (local `bge-small-en-v1.5`
//! embeddings on CPU, Ollama `mistral` for generation, `k = 16`).
//!
//! ```toml
//! [embedding]
//! provider = "local"
//! model = "bge-small-en-v1.5"
//! device = "cpu"
//!
//! [llm]
//! model = "mistral"
//!
//! [retrieval]
//! k = 16
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Prefix applied to questions (not rows) before embedding. Unset picks
    /// the model's own instruction (BGE English models); `""` disables it.
    #[serde(default)]
    pub query_instruction: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: None,
            device: default_device(),
            batch_size: default_batch_size(),
            max_input_chars: default_max_input_chars(),
            overflow: OverflowPolicy::default(),
            url: None,
            timeout_secs: default_embedding_timeout_secs(),
            query_instruction: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_embedding_model() -> String {
    "bge-small-en-v1.5".to_string()
}
fn default_device() -> String {
    "cpu".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_input_chars() -> usize {
    2048
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

/// What the embedder does with text longer than `max_input_chars`.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Cut the text at the last char boundary within the limit.
    #[default]
    Truncate,
    /// Fail the request with an embedding error.
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: default_ollama_url(),
            temperature: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_model() -> String {
    "mistral".to_string()
}
pub(crate) fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

/// Retrieval settings. `k` is the number of evidence chunks handed to the
/// model and is meant to be tuned per dataset.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    /// Candidates ranked by plain similarity before MMR re-ranking.
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,
    /// 1.0 = pure relevance, 0.0 = pure diversity.
    #[serde(default = "default_lambda_mult")]
    pub lambda_mult: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            fetch_k: default_fetch_k(),
            lambda_mult: default_lambda_mult(),
        }
    }
}

pub const DEFAULT_K: usize = 16;

fn default_k() -> usize {
    DEFAULT_K
}
fn default_fetch_k() -> usize {
    20
}
fn default_lambda_mult() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct LoaderConfig {
    #[serde(default)]
    pub mode: LoaderMode,
    #[serde(default = "default_max_sheets")]
    pub max_sheets: usize,
    #[serde(default = "default_max_cells_per_sheet")]
    pub max_cells_per_sheet: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            mode: LoaderMode::default(),
            max_sheets: default_max_sheets(),
            max_cells_per_sheet: default_max_cells_per_sheet(),
        }
    }
}

fn default_max_sheets() -> usize {
    100
}
fn default_max_cells_per_sheet() -> usize {
    100_000
}

/// Granularity of the chunks produced from a sheet.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoaderMode {
    /// One chunk per data row, keyed by the header row.
    #[default]
    Rows,
    /// One chunk per sheet.
    Sheets,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct AnswerConfig {
    #[serde(default = "default_max_sentences")]
    pub max_sentences: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            max_sentences: default_max_sentences(),
        }
    }
}

fn default_max_sentences() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PipelineConfig {
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

fn default_stage_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}
fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise return the built-in defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    // Retrieval
    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if config.retrieval.fetch_k == 0 {
        anyhow::bail!("retrieval.fetch_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.lambda_mult) {
        anyhow::bail!("retrieval.lambda_mult must be in [0.0, 1.0]");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "local" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, or ollama.",
            other
        ),
    }
    if config.embedding.model.trim().is_empty() {
        anyhow::bail!("embedding.model must not be empty");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_input_chars == 0 {
        anyhow::bail!("embedding.max_input_chars must be > 0");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }

    // LLM
    match config.llm.provider.as_str() {
        "ollama" => {}
        other => anyhow::bail!("Unknown llm provider: '{}'. Must be ollama.", other),
    }
    if config.llm.model.trim().is_empty() {
        anyhow::bail!("llm.model must not be empty");
    }

    // Loader / answer / pipeline
    if config.loader.max_sheets == 0 || config.loader.max_cells_per_sheet == 0 {
        anyhow::bail!("loader.max_sheets and loader.max_cells_per_sheet must be > 0");
    }
    if config.answer.max_sentences == 0 {
        anyhow::bail!("answer.max_sentences must be > 0");
    }
    if config.pipeline.stage_timeout_secs == 0 {
        anyhow::bail!("pipeline.stage_timeout_secs must be > 0");
    }

    Ok(())
}
