//! Field extraction through an LLM completion service

mod openai;
pub mod pricing;
pub mod prompt;

pub use openai::OpenAiExtractor;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ExtractionAnswer, FieldConfig};

/// One question about one email
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// The question, without context
    pub query: String,

    /// Model identifier from the preset
    pub model: String,

    /// Context passages (sender, subject, body text)
    pub context_chunks: Vec<String>,

    /// Inline images shared by every field of the same email
    pub images: Arc<Vec<Vec<u8>>>,

    /// Field being extracted; its guideline parameterises the answer schema
    pub field: FieldConfig,
}

/// A typed answer and what it cost
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub answer: ExtractionAnswer,

    /// USD
    pub cost: f64,

    /// Model that actually answered (may be the fallback)
    pub model: String,
}

/// Remote extraction service
///
/// `Ok(None)` means the service produced no usable answer: no cost is
/// charged and nothing is counted. Errors abort the run.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(&self, request: ExtractionRequest) -> Result<Option<Extraction>>;
}
