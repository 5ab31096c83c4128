//! Configuration management for the answering core
//!
//! A single structured configuration object drives every threshold in the
//! pipeline. Unknown keys are rejected at deserialization time and value
//! ranges are checked by [`EngineConfig::validate`] at construction.

use serde::{Deserialize, Serialize};

/// Main configuration for the answering core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Retrieval stage settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Reranker stage settings
    #[serde(default)]
    pub rerank: RerankConfig,

    /// Document chunking settings
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Candidate generation and scoring settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Quality gate settings
    #[serde(default)]
    pub gate: GateConfig,

    /// External fallback settings
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Adaptive cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Classifier settings
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Request deadlines
    #[serde(default)]
    pub deadlines: DeadlineConfig,

    /// Concurrency limits and backpressure
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Retrieval stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    /// Number of passages fetched from the vector index
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Results below this similarity are dropped
    #[serde(default = "default_score_floor")]
    pub score_floor: f32,
}

fn default_top_k() -> usize {
    10
}

fn default_score_floor() -> f32 {
    0.2
}

/// Reranker stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerankConfig {
    /// Enable the rerank stage
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum passages fed to the cross-encoder
    #[serde(default = "default_rerank_input_max")]
    pub input_max: usize,

    /// Passages kept after reranking
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,

    /// Cross-encoder scores below this are dropped
    #[serde(default = "default_min_rerank_score")]
    pub min_score: f32,
}

fn default_rerank_input_max() -> usize {
    20
}

fn default_rerank_top_k() -> usize {
    5
}

fn default_min_rerank_score() -> f32 {
    0.2
}

/// Document chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Token overlap between consecutive chunks
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,

    /// Chunks shorter than this are merged into their predecessor
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Soft cap on extracted text length in characters
    #[serde(default = "default_soft_cap")]
    pub soft_cap_chars: usize,

    /// Hard cap on extracted text length in characters
    #[serde(default = "default_hard_cap")]
    pub hard_cap_chars: usize,
}

fn default_chunk_size() -> usize {
    512
}

fn default_chunk_overlap() -> usize {
    128
}

fn default_min_chunk_size() -> usize {
    32
}

fn default_soft_cap() -> usize {
    100_000
}

fn default_hard_cap() -> usize {
    500_000
}

/// Candidate generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    /// Default number of candidates per request
    #[serde(default = "default_n_candidates")]
    pub n_candidates: usize,

    /// Maximum new tokens per candidate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Fixed (temperature, top_p) schedule guaranteeing sampling diversity
    #[serde(default = "default_sampling_schedule")]
    pub sampling_schedule: Vec<(f32, f32)>,

    /// Context token budget for assembled passages
    #[serde(default = "default_context_budget")]
    pub context_token_budget: usize,

    /// Scoring weights; must sum to 1
    #[serde(default)]
    pub weights: ScoreWeights,

    /// Phrases whose presence marks an answer as grounded in the context
    #[serde(default = "default_grounding_phrases")]
    pub grounding_phrases: Vec<String>,
}

fn default_n_candidates() -> usize {
    5
}

fn default_max_tokens() -> u32 {
    512
}

fn default_sampling_schedule() -> Vec<(f32, f32)> {
    vec![
        (0.7, 0.9),
        (0.8, 0.95),
        (0.6, 0.85),
        (0.9, 0.9),
        (0.5, 0.8),
    ]
}

fn default_context_budget() -> usize {
    2000
}

fn default_grounding_phrases() -> Vec<String> {
    [
        "based on",
        "according to",
        "the document states",
        "the context shows",
        "as mentioned",
        "as described",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Weights for candidate scoring; must sum to 1
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub perplexity: f32,
    pub relevance: f32,
    pub quality: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            perplexity: 0.3,
            relevance: 0.4,
            quality: 0.3,
        }
    }
}

/// Quality gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Confidence below this triggers fallback
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,

    /// Gate floor reduction applied to definition-type queries
    #[serde(default = "default_definition_floor_delta")]
    pub definition_floor_delta: f32,

    /// Answers shorter than this trigger fallback
    #[serde(default = "default_min_answer_length")]
    pub min_answer_length: usize,

    /// Phrases stripped from answers during post-processing
    #[serde(default = "default_banned_phrases")]
    pub banned_phrases: Vec<String>,

    /// Regexes matching refusal templates and other poor answers
    #[serde(default = "default_poor_answer_regexes")]
    pub poor_answer_regexes: Vec<String>,
}

fn default_confidence_floor() -> f32 {
    0.6
}

fn default_definition_floor_delta() -> f32 {
    0.1
}

fn default_min_answer_length() -> usize {
    50
}

fn default_banned_phrases() -> Vec<String> {
    [
        "As an AI language model,",
        "Based on the provided context, ",
        "I hope this helps!",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_poor_answer_regexes() -> Vec<String> {
    [
        r"(?i)^i (?:cannot|can't|am unable to) answer",
        r"(?i)^(?:sorry|i'm sorry|i apologize)",
        r"(?i)the (?:context|document) does not (?:contain|provide|mention)",
        r"(?i)^i don't know",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// External fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    /// Enable external fallback globally
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum hits requested from the external source
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Cap on cleaned content length per hit, in characters
    #[serde(default = "default_content_size_cap")]
    pub content_size_cap: usize,

    /// Search request timeout in seconds
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,

    /// Content fetch timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Hit scoring weights
    #[serde(default)]
    pub score_weights: FallbackScoreWeights,

    /// Per-host trust weights used by open-web providers
    #[serde(default)]
    pub domain_trust: Vec<(String, f32)>,
}

fn default_max_results() -> usize {
    3
}

fn default_content_size_cap() -> usize {
    8_000
}

fn default_search_timeout() -> u64 {
    10
}

fn default_fetch_timeout() -> u64 {
    15
}

/// Weights for scoring external hits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackScoreWeights {
    pub title_overlap: f32,
    pub body_overlap: f32,
    pub domain_trust: f32,
    pub rank: f32,
}

impl Default for FallbackScoreWeights {
    fn default() -> Self {
        Self {
            title_overlap: 0.5,
            body_overlap: 0.3,
            domain_trust: 0.1,
            rank: 0.1,
        }
    }
}

/// Adaptive cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum tracked question fingerprints
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Hits required before an entry may serve
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u64,

    /// Flush to disk every this many interactions
    #[serde(default = "default_flush_every")]
    pub flush_every: u64,

    /// Keyword Jaccard similarity required by the near-duplicate path
    #[serde(default = "default_keyword_similarity")]
    pub keyword_similarity: f32,

    /// Embedding cosine similarity required to serve a near-duplicate
    #[serde(default = "default_near_duplicate_cosine")]
    pub near_duplicate_cosine: f32,
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_promotion_threshold() -> u64 {
    5
}

fn default_flush_every() -> u64 {
    10
}

fn default_keyword_similarity() -> f32 {
    0.6
}

fn default_near_duplicate_cosine() -> f32 {
    0.98
}

/// Classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Bounded classification cache capacity
    #[serde(default = "default_classifier_cache")]
    pub cache_capacity: usize,

    /// ML predictions below this confidence fall back to the default label
    #[serde(default = "default_ml_confidence_threshold")]
    pub ml_confidence_threshold: f32,

    /// Confidence assigned to rule matches
    #[serde(default = "default_rule_confidence")]
    pub rule_confidence: f32,
}

fn default_classifier_cache() -> usize {
    10_000
}

fn default_ml_confidence_threshold() -> f32 {
    0.6
}

fn default_rule_confidence() -> f32 {
    0.95
}

/// Request deadline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadlineConfig {
    /// Total request deadline in milliseconds
    #[serde(default = "default_total_ms")]
    pub total_ms: u64,

    /// Per-generator-call deadline in milliseconds
    #[serde(default = "default_generator_ms")]
    pub generator_ms: u64,

    /// Fallback call deadline in milliseconds
    #[serde(default = "default_fallback_ms")]
    pub fallback_ms: u64,
}

fn default_total_ms() -> u64 {
    60_000
}

fn default_generator_ms() -> u64 {
    30_000
}

fn default_fallback_ms() -> u64 {
    20_000
}

/// Concurrency limits and backpressure configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Cap on concurrent external fallback calls
    #[serde(default = "default_max_fallback_calls")]
    pub max_concurrent_fallback: usize,

    /// Cap on concurrent generator batches
    #[serde(default = "default_max_generator_batches")]
    pub max_concurrent_generation: usize,

    /// Requests waiting beyond the caps before Overloaded is returned
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Bound on the ingestion work queue
    #[serde(default = "default_ingest_queue_size")]
    pub ingest_queue_size: usize,
}

fn default_max_fallback_calls() -> usize {
    8
}

fn default_max_generator_batches() -> usize {
    8
}

fn default_queue_size() -> usize {
    64
}

fn default_ingest_queue_size() -> usize {
    32
}

fn default_true() -> bool {
    true
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_floor: default_score_floor(),
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_max: default_rerank_input_max(),
            top_k: default_rerank_top_k(),
            min_score: default_min_rerank_score(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            soft_cap_chars: default_soft_cap(),
            hard_cap_chars: default_hard_cap(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            n_candidates: default_n_candidates(),
            max_tokens: default_max_tokens(),
            sampling_schedule: default_sampling_schedule(),
            context_token_budget: default_context_budget(),
            weights: ScoreWeights::default(),
            grounding_phrases: default_grounding_phrases(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            definition_floor_delta: default_definition_floor_delta(),
            min_answer_length: default_min_answer_length(),
            banned_phrases: default_banned_phrases(),
            poor_answer_regexes: default_poor_answer_regexes(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: default_max_results(),
            content_size_cap: default_content_size_cap(),
            search_timeout_secs: default_search_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            score_weights: FallbackScoreWeights::default(),
            domain_trust: Vec::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            promotion_threshold: default_promotion_threshold(),
            flush_every: default_flush_every(),
            keyword_similarity: default_keyword_similarity(),
            near_duplicate_cosine: default_near_duplicate_cosine(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_classifier_cache(),
            ml_confidence_threshold: default_ml_confidence_threshold(),
            rule_confidence: default_rule_confidence(),
        }
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            total_ms: default_total_ms(),
            generator_ms: default_generator_ms(),
            fallback_ms: default_fallback_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fallback: default_max_fallback_calls(),
            max_concurrent_generation: default_max_generator_batches(),
            queue_size: default_queue_size(),
            ingest_queue_size: default_ingest_queue_size(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            chunking: ChunkingConfig::default(),
            generation: GenerationConfig::default(),
            gate: GateConfig::default(),
            fallback: FallbackConfig::default(),
            cache: CacheConfig::default(),
            classifier: ClassifierConfig::default(),
            deadlines: DeadlineConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config: Self = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(anyhow::anyhow!("retrieval.top_k must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.retrieval.score_floor) {
            return Err(anyhow::anyhow!(
                "retrieval.score_floor must be between 0.0 and 1.0"
            ));
        }

        if self.chunking.overlap >= self.chunking.chunk_size {
            return Err(anyhow::anyhow!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap,
                self.chunking.chunk_size
            ));
        }

        if self.chunking.hard_cap_chars < self.chunking.soft_cap_chars {
            return Err(anyhow::anyhow!(
                "chunking.hard_cap_chars must be at least soft_cap_chars"
            ));
        }

        if self.generation.n_candidates == 0 || self.generation.n_candidates > 10 {
            return Err(anyhow::anyhow!(
                "generation.n_candidates must be between 1 and 10"
            ));
        }

        if self.generation.sampling_schedule.is_empty() {
            return Err(anyhow::anyhow!(
                "generation.sampling_schedule cannot be empty"
            ));
        }

        let w = self.generation.weights;
        let sum = w.perplexity + w.relevance + w.quality;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(anyhow::anyhow!(
                "generation.weights must sum to 1.0 (got {sum})"
            ));
        }

        if !(0.0..=1.0).contains(&self.gate.confidence_floor) {
            return Err(anyhow::anyhow!(
                "gate.confidence_floor must be between 0.0 and 1.0"
            ));
        }

        for pattern in &self.gate.poor_answer_regexes {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid poor-answer regex '{pattern}': {e}"))?;
        }

        if self.cache.promotion_threshold == 0 {
            return Err(anyhow::anyhow!(
                "cache.promotion_threshold must be greater than 0"
            ));
        }

        if self.limits.max_concurrent_fallback == 0 || self.limits.max_concurrent_generation == 0 {
            return Err(anyhow::anyhow!("concurrency limits must be greater than 0"));
        }

        Ok(())
    }
}
