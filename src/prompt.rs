//! Answer composer: question + evidence → prompt.
//!
//! The template is a constant; only the `context` and `question` slots vary
//! per request, so [`compose`] is a pure function of its inputs.

use crate::models::{Chunk, PromptContext, REFUSAL};

/// Separator placed between evidence chunks in the context slot.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

const PREAMBLE: &str = "Use the following pieces of context to answer the question at the end. \
Please follow the following rules:";

/// Build the prompt for `question` over `evidence`, in retrieval order.
pub fn compose(question: &str, evidence: &[Chunk]) -> String {
    render(&PromptContext { question, evidence })
}

/// Render a [`PromptContext`] through the fixed template.
pub fn render(ctx: &PromptContext<'_>) -> String {
    let context = ctx
        .evidence
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR);

    format!(
        r#"{PREAMBLE}
1. If you don't know the answer, don't try to make up an answer. Just say "{REFUSAL}".
2. If you find the answer, write the answer in a concise way with five sentences maximum with the product link.
3. This dataset is a spreadsheet containing a survey of consumers in the UK about how important sustainability is to them when buying products in general, and how engaged they are with sustainable brands or products.

{context}

Question: {question}

Helpful Answer:"#,
        question = ctx.question,
    )
}
