//! Pluggable model capabilities
//!
//! The core treats model execution as external: an [`Embedder`] maps text to
//! a fixed-dimension unit vector, a [`Generator`] maps a prompt plus sampling
//! parameters to text with optional token log-probs, a [`CrossEncoder`]
//! scores (query, passage) pairs for the reranker, and a [`LabelModel`] is
//! the ML half of the hybrid classifier. Implementations manage their own
//! thread pools; all interfaces are awaitable.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sampling parameters for a single generator invocation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    /// Position in the sampling schedule; doubles as a deterministic
    /// tie-break seed during candidate selection
    pub seed: u32,
    pub max_tokens: u32,
}

impl SamplingParams {
    pub fn new(temperature: f32, top_p: f32, seed: u32, max_tokens: u32) -> Self {
        Self {
            temperature,
            top_p,
            seed,
            max_tokens,
        }
    }
}

/// Output of a single generator invocation
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    /// Per-token log probabilities, when the backend reports them
    pub token_logprobs: Option<Vec<f32>>,
    pub model: String,
    pub tokens_used: Option<u32>,
}

impl GenerationOutput {
    /// Sequence perplexity from token log-probs: exp(-mean logprob)
    pub fn perplexity(&self) -> Option<f64> {
        let logprobs = self.token_logprobs.as_ref()?;
        if logprobs.is_empty() {
            return None;
        }
        let mean = logprobs.iter().map(|lp| *lp as f64).sum::<f64>() / logprobs.len() as f64;
        Some((-mean).exp())
    }
}

/// Embedding capability: text to fixed-dimension unit vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding dimension
    fn dimension(&self) -> usize;

    /// Model version tag, stored alongside every index for invalidation
    fn version_tag(&self) -> String;
}

/// Generation capability: prompt to text plus a confidence signal
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, params: SamplingParams) -> Result<GenerationOutput>;
}

/// Cross-encoder capability scoring (query, passage) relevance in [0, 1]
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn score(&self, query: &str, passage: &str) -> Result<f32>;
}

/// One prediction from the classifier's ML capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelPrediction {
    pub label: String,
    pub confidence: f32,
    /// Probability mass per label
    pub distribution: Vec<(String, f32)>,
}

/// ML classification capability; batch-oriented
#[async_trait]
pub trait LabelModel: Send + Sync {
    async fn classify_batch(&self, texts: &[String]) -> Result<Vec<LabelPrediction>>;
}

/// Normalize a vector to unit L2 norm in place; zero vectors are left as-is
pub fn normalize_l2(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity between two vectors of equal dimension
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
