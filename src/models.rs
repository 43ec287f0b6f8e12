//! Core data models used throughout the pipeline.
//!
//! These types represent the chunks, evidence, and answers that flow through
//! a single question-answering request. None of them outlive that request.

use std::collections::BTreeMap;

use serde::Serialize;

/// Fixed answer used when the evidence does not determine an answer.
pub const REFUSAL: &str =
    "I can't find the final answer but you may want to check the following links";

/// Provenance metadata attached to a chunk (`source`, `sheet`, `row`, `cells`, `element`).
pub type Provenance = BTreeMap<String, String>;

/// A unit of extracted spreadsheet text plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub text: String,
    pub provenance: Provenance,
    /// Populated by the embedder; `None` straight out of the loader.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn new(text: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            text: text.into(),
            provenance,
            embedding: None,
        }
    }

    /// Short human-readable origin, e.g. `survey.xlsx › Responses › row 7`.
    pub fn origin(&self) -> String {
        let mut parts = Vec::new();
        for key in ["source", "sheet"] {
            if let Some(v) = self.provenance.get(key) {
                parts.push(v.clone());
            }
        }
        if let Some(row) = self.provenance.get("row") {
            parts.push(format!("row {}", row));
        }
        parts.join(" › ")
    }
}

/// The question plus the ordered evidence handed to the answer composer.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub question: &'a str,
    pub evidence: &'a [Chunk],
}

/// Terminal artifact of a request: the generated text and the evidence used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub evidence: Vec<Chunk>,
}

impl Answer {
    /// An answer carrying the fixed refusal text and no evidence.
    pub fn refusal() -> Self {
        Self {
            text: REFUSAL.to_string(),
            evidence: Vec::new(),
        }
    }

    /// True when the text is the refusal string, ignoring quotes and a final period.
    pub fn is_refusal(&self) -> bool {
        self.text.trim().trim_matches('"').trim_end_matches('.') == REFUSAL
    }
}
