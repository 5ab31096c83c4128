//! Ollama-backed embedder and generator
//!
//! One HTTP client implements both model capabilities against an Ollama
//! server: `/api/embeddings` for the embedder and `/api/chat` for the
//! generator. Request timeouts and error mapping follow the taxonomy in
//! [`crate::error`].

use crate::error::{ModelError, Result};
use crate::model::{normalize_l2, Embedder, GenerationOutput, Generator, SamplingParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Configuration for the Ollama model server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelServerConfig {
    /// Ollama server URL
    pub base_url: String,

    /// Model for text generation
    pub text_model: String,

    /// Model for embeddings
    pub embedding_model: String,

    /// Embedding dimension the configured model produces
    pub embedding_dimension: usize,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for ModelServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            text_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dimension: 768,
            timeout: 30,
        }
    }
}

/// Ollama client implementing [`Embedder`] and [`Generator`]
pub struct OllamaModelClient {
    client: reqwest::Client,
    config: ModelServerConfig,
}

#[derive(Debug, Serialize)]
struct OllamaChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    seed: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    model: String,
    message: OllamaResponseMessage,
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    #[allow(dead_code)]
    done_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaModelClient {
    /// Create a new Ollama model client
    pub fn new(config: ModelServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| ModelError::ConnectionFailed(e.to_string()))?;

        info!(url = %config.base_url, "initialized Ollama model client");
        Ok(Self { client, config })
    }

    /// Get the base URL for API calls
    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }
}

#[async_trait]
impl Generator for OllamaModelClient {
    async fn generate(&self, prompt: &str, params: SamplingParams) -> Result<GenerationOutput> {
        debug!(
            temperature = params.temperature,
            top_p = params.top_p,
            "generating text"
        );

        let request = OllamaGenerateRequest {
            model: &self.config.text_model,
            messages: vec![OllamaChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            options: OllamaOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                seed: params.seed,
            },
        };

        let url = self.api_url("chat");
        let response = timeout(
            Duration::from_secs(self.config.timeout),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| ModelError::Timeout)?
        .map_err(|e| ModelError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Ollama API error: {}", error_text);
            return Err(ModelError::GenerationFailed(error_text).into());
        }

        let ollama_response: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        if !ollama_response.done {
            return Err(ModelError::InvalidResponse("incomplete response".to_string()).into());
        }

        debug!(
            tokens = ollama_response.eval_count.unwrap_or(0),
            "generation complete"
        );

        Ok(GenerationOutput {
            text: ollama_response.message.content,
            // Ollama's chat endpoint does not report log-probs; the
            // perplexity score falls back to its neutral default
            token_logprobs: None,
            model: ollama_response.model,
            tokens_used: ollama_response.eval_count,
        })
    }
}

#[async_trait]
impl Embedder for OllamaModelClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!(chars = text.len(), "generating embedding");

        let request = OllamaEmbedRequest {
            model: &self.config.embedding_model,
            prompt: text,
        };

        let url = self.api_url("embeddings");
        let response = timeout(
            Duration::from_secs(self.config.timeout),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| ModelError::Timeout)?
        .map_err(|e| ModelError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Ollama embedding API error: {}", error_text);
            return Err(ModelError::EmbeddingFailed(error_text).into());
        }

        let ollama_response: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let mut embedding = ollama_response.embedding;
        if embedding.len() != self.config.embedding_dimension {
            return Err(ModelError::EmbeddingFailed(format!(
                "expected dimension {}, got {}",
                self.config.embedding_dimension,
                embedding.len()
            ))
            .into());
        }

        normalize_l2(&mut embedding);
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dimension
    }

    fn version_tag(&self) -> String {
        format!("ollama:{}", self.config.embedding_model)
    }
}
