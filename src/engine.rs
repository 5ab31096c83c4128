//! Answer engine: the pipeline orchestrator
//!
//! Drives a request through classify → retrieve → rerank → condense →
//! generate-N → score → select → quality gate → optional external fallback
//! → format, owning the adaptive cache and the classifier. Every terminal
//! transition produces a well-formed response unless the request's deadline
//! expired before any stage past retrieval completed.

use crate::bestofn::{build_prompt, condense_prompt, BestOfN, Candidate};
use crate::cache::AdaptiveCache;
use crate::classifier::Classifier;
use crate::config::EngineConfig;
use crate::document::{DocumentStatus, DocumentStore, IngestReceipt, IngestionService};
use crate::error::{EngineError, Result};
use crate::fallback::{should_trigger_fallback, ExternalAnswer, ExternalSource};
use crate::index::VectorIndex;
use crate::model::{cosine_similarity, CrossEncoder, Embedder, Generator, LabelModel, SamplingParams};
use crate::query::Query;
use crate::reranker::{RerankOutcome, Reranker};
use crate::retriever::Retriever;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Post-processing format for the final answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Brief,
    #[default]
    Detailed,
    Bulleted,
}

/// Per-request options; everything not set falls back to the engine config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnswerOptions {
    pub response_format: ResponseFormat,
    /// Cap on sources returned to the caller
    pub max_sources: usize,
    /// Override for best-of-N candidate count
    pub n_candidates: Option<usize>,
    pub allow_external_fallback: bool,
    /// Override for the quality-gate confidence floor
    pub confidence_floor: Option<f32>,
    /// Skip the condensation stage (ultra-fast mode)
    pub skip_condensation: bool,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            response_format: ResponseFormat::Detailed,
            max_sources: 5,
            n_candidates: None,
            allow_external_fallback: true,
            confidence_floor: None,
            skip_condensation: false,
        }
    }
}

impl AnswerOptions {
    fn validate(&self) -> Result<()> {
        if let Some(n) = self.n_candidates {
            if !(1..=10).contains(&n) {
                return Err(EngineError::InvalidInput(format!(
                    "n_candidates must be between 1 and 10, got {n}"
                )));
            }
        }
        if let Some(floor) = self.confidence_floor {
            if !(0.0..=1.0).contains(&floor) {
                return Err(EngineError::InvalidInput(format!(
                    "confidence_floor must be within [0, 1], got {floor}"
                )));
            }
        }
        Ok(())
    }
}

/// A question against one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    pub document_id: String,
    pub user_id: String,
    #[serde(default)]
    pub options: AnswerOptions,
}

/// Where the final answer's evidence came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    External,
    Hybrid,
    FallbackError,
    InternalError,
}

/// One source reference returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub chunk_ordinal: u32,
    pub snippet: String,
    pub score: f32,
}

/// Response metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub candidates_generated: usize,
    pub rerank_applied: bool,
    pub fallback_used: bool,
    pub classification_label: String,
    pub cache_hit: bool,
    pub deadline_exceeded: bool,
    /// Degradations taken along the way, e.g. "rerank_pass_through"
    pub degraded: Vec<String>,
}

/// The answer returned for every completed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaResponse {
    pub answer: String,
    pub confidence: f32,
    pub sources: Vec<SourceRef>,
    pub origin: Origin,
    pub processing_time_ms: u64,
    pub metadata: ResponseMetadata,
}

impl QaResponse {
    /// Uniform user-safe failure response (§ error taxonomy)
    pub fn failure(kind: Origin, message: &str, elapsed_ms: u64, metadata: ResponseMetadata) -> Self {
        Self {
            answer: message.to_string(),
            confidence: 0.0,
            sources: Vec::new(),
            origin: kind,
            processing_time_ms: elapsed_ms,
            metadata,
        }
    }
}

const NO_EVIDENCE_MESSAGE: &str =
    "The document does not contain passages relevant to this question.";
const FALLBACK_FAILED_MESSAGE: &str =
    "The document does not contain enough evidence to answer this question \
     confidently, and no external source was reachable.";
const INTERNAL_FAILURE_MESSAGE: &str =
    "The question could not be answered due to an internal error. Please try again.";

/// Request lifecycle states, traced per transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Received,
    Classifying,
    Retrieving,
    Reranking,
    Condensing,
    Generating,
    Scoring,
    Gated,
    Fallback,
    Formatted,
    Completed,
}

/// Engine-level counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

/// Bounded-queue admission control: `permits` concurrent holders, at most
/// `queue_size` waiters, excess fails fast with `Overloaded`
struct Limiter {
    semaphore: Semaphore,
    waiting: AtomicUsize,
    queue_size: usize,
}

impl Limiter {
    fn new(permits: usize, queue_size: usize) -> Self {
        Self {
            semaphore: Semaphore::new(permits),
            waiting: AtomicUsize::new(0),
            queue_size,
        }
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_size {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Overloaded);
        }
        let permit = self.semaphore.acquire().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| EngineError::Internal("limiter closed".to_string()))
    }
}

/// The answer engine; construct via [`EngineBuilder`]
pub struct AnswerEngine {
    config: EngineConfig,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    retriever: Retriever,
    reranker: Reranker,
    bestofn: BestOfN,
    classifier: Classifier,
    cache: Arc<AdaptiveCache>,
    external: Option<Arc<dyn ExternalSource>>,
    ingestion: Arc<IngestionService>,
    poor_answer_regexes: Vec<regex::Regex>,
    banned_phrase_regexes: Vec<regex::Regex>,
    generation_limiter: Limiter,
    fallback_limiter: Limiter,
    requests: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

/// Builder wiring the engine's constructor-injected collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    generator: Option<Arc<dyn Generator>>,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    label_model: Option<Arc<dyn LabelModel>>,
    external: Option<Arc<dyn ExternalSource>>,
    index: Option<Arc<dyn VectorIndex>>,
    store: Option<Arc<dyn DocumentStore>>,
    cache_url: String,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            embedder: None,
            generator: None,
            cross_encoder: None,
            label_model: None,
            external: None,
            index: None,
            store: None,
            cache_url: "sqlite::memory:".to_string(),
        }
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn cross_encoder(mut self, cross_encoder: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = Some(cross_encoder);
        self
    }

    pub fn label_model(mut self, label_model: Arc<dyn LabelModel>) -> Self {
        self.label_model = Some(label_model);
        self
    }

    pub fn external_source(mut self, external: Arc<dyn ExternalSource>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache_url(mut self, url: &str) -> Self {
        self.cache_url = url.to_string();
        self
    }

    pub async fn build(self) -> Result<AnswerEngine> {
        self.config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let embedder = self
            .embedder
            .ok_or_else(|| EngineError::Config("embedder is required".to_string()))?;
        let generator = self
            .generator
            .ok_or_else(|| EngineError::Config("generator is required".to_string()))?;
        let index = self
            .index
            .ok_or_else(|| EngineError::Config("vector index is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| EngineError::Config("document store is required".to_string()))?;

        let cache = Arc::new(AdaptiveCache::open(&self.cache_url, self.config.cache.clone()).await?);

        // Stamp the embedding model version; a change invalidates every
        // promoted cache entry
        if index
            .set_version_tag(&embedder.version_tag())
            .await?
            .is_some()
        {
            cache.invalidate_all_promotions().await;
        }

        let ingestion = IngestionService::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&embedder),
            self.config.chunking.clone(),
            &self.config.limits,
        );

        let poor_answer_regexes = self
            .config
            .gate
            .poor_answer_regexes
            .iter()
            .map(|p| {
                regex::Regex::new(p)
                    .map_err(|e| EngineError::Config(format!("invalid poor-answer regex: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let banned_phrase_regexes = self
            .config
            .gate
            .banned_phrases
            .iter()
            .map(|phrase| {
                regex::RegexBuilder::new(&regex::escape(phrase))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| EngineError::Config(format!("invalid banned phrase: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let retriever = Retriever::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            self.config.retrieval.clone(),
        );
        let reranker = Reranker::new(self.cross_encoder, self.config.rerank.clone());
        let bestofn = BestOfN::new(
            Arc::clone(&generator),
            self.config.generation.clone(),
            Duration::from_millis(self.config.deadlines.generator_ms),
        );
        let classifier =
            Classifier::with_default_rules(self.label_model, self.config.classifier.clone())?;

        let generation_limiter = Limiter::new(
            self.config.limits.max_concurrent_generation,
            self.config.limits.queue_size,
        );
        let fallback_limiter = Limiter::new(
            self.config.limits.max_concurrent_fallback,
            self.config.limits.queue_size,
        );

        info!("answer engine ready");
        Ok(AnswerEngine {
            config: self.config,
            embedder,
            generator,
            retriever,
            reranker,
            bestofn,
            classifier,
            cache,
            external: self.external,
            ingestion,
            poor_answer_regexes,
            banned_phrase_regexes,
            generation_limiter,
            fallback_limiter,
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }
}

impl AnswerEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Answer a question against one document
    ///
    /// Caller errors (invalid input, unknown document, not ready,
    /// overloaded, and a deadline that expired before anything was
    /// formatted) surface as `Err`; every other outcome is a well-formed
    /// response whose `origin` records what happened.
    pub async fn answer(&self, request: AnswerRequest) -> Result<QaResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        request.options.validate()?;
        if request.question.trim().is_empty() {
            return Err(EngineError::InvalidInput("question is empty".to_string()));
        }
        if request.document_id.is_empty() || request.user_id.is_empty() {
            return Err(EngineError::InvalidInput(
                "document_id and user_id must be non-empty".to_string(),
            ));
        }

        let deadline = Duration::from_millis(self.config.deadlines.total_ms);
        if deadline.is_zero() {
            return Err(EngineError::DeadlineExceeded);
        }

        // Best formatted answer so far, for deadline expiry
        let partial: Arc<std::sync::Mutex<Option<QaResponse>>> =
            Arc::new(std::sync::Mutex::new(None));

        let outcome = tokio::time::timeout(
            deadline,
            self.pipeline(&request, started, Arc::clone(&partial)),
        )
        .await;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_caller_error() => Err(e),
            Ok(Err(e)) => {
                // Pipeline failures degrade into the uniform failure schema
                self.failures.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, kind = e.kind(), "pipeline failed");
                let metadata = ResponseMetadata {
                    request_id: Uuid::new_v4().to_string(),
                    ..Default::default()
                };
                Ok(QaResponse::failure(
                    Origin::InternalError,
                    INTERNAL_FAILURE_MESSAGE,
                    started.elapsed().as_millis() as u64,
                    metadata,
                ))
            }
            Err(_elapsed) => {
                // Cancelled: generator and fallback tasks were dropped with
                // the pipeline future
                let best_so_far = partial.lock().ok().and_then(|mut slot| slot.take());
                match best_so_far {
                    Some(mut response) => {
                        response.metadata.deadline_exceeded = true;
                        response.processing_time_ms = started.elapsed().as_millis() as u64;
                        warn!("deadline exceeded, returning best answer so far");
                        Ok(response)
                    }
                    None => Err(EngineError::DeadlineExceeded),
                }
            }
        }
    }

    async fn pipeline(
        &self,
        request: &AnswerRequest,
        started: Instant,
        partial: Arc<std::sync::Mutex<Option<QaResponse>>>,
    ) -> Result<QaResponse> {
        let request_id = Uuid::new_v4().to_string();
        let mut state = RequestState::Received;
        let mut metadata = ResponseMetadata {
            request_id: request_id.clone(),
            ..Default::default()
        };

        let mut query = Query::parse(&request.question);
        debug!(request_id = %request_id, fingerprint = %query.fingerprint, "request received");

        // Step 1: adaptive cache probe
        if let Some(response) = self
            .try_cache(&query, request, started, &mut metadata)
            .await?
        {
            return Ok(response);
        }

        // Step 2: classify; never fails the request
        self.transition(&mut state, RequestState::Classifying, &request_id);
        let label = match self.classifier.classify(&request.question).await {
            Ok(record) => record.label,
            Err(e) => {
                warn!(error = %e, "classification failed, defaulting");
                metadata.degraded.push("classifier_failed".to_string());
                "general".to_string()
            }
        };
        query.label = Some(label.clone());
        metadata.classification_label = label.clone();

        let mut confidence_floor = request
            .options
            .confidence_floor
            .unwrap_or(self.config.gate.confidence_floor);
        if label == "definition" {
            // Definition lookups are cheap for the external source; gate
            // them more aggressively
            confidence_floor =
                (confidence_floor - self.config.gate.definition_floor_delta).max(0.0);
        }

        // Document must exist, be owned, and be fully indexed
        let record = self
            .ingestion
            .fetch_owned(&request.document_id, &request.user_id)
            .await?;
        if record.status != DocumentStatus::Indexed {
            return Err(EngineError::NotReady(
                request.document_id.clone(),
                record.status.to_string(),
            ));
        }

        // Step 3: retrieve
        self.transition(&mut state, RequestState::Retrieving, &request_id);
        let retrieval = match self
            .retriever
            .retrieve(
                &request.question,
                self.config.retrieval.top_k,
                Some(&request.document_id),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                // Degrade to empty evidence; fallback may still answer
                warn!(error = %e, "retrieval failed, degrading to empty evidence");
                metadata.degraded.push("retrieval_failed".to_string());
                crate::retriever::RetrievalResult::default()
            }
        };

        if retrieval.is_empty() {
            return self
                .answer_without_evidence(request, &query, started, metadata)
                .await;
        }

        // Step 4: rerank & condense
        self.transition(&mut state, RequestState::Reranking, &request_id);
        let rerank = self.reranker.rerank(&request.question, retrieval.hits).await?;
        metadata.rerank_applied = rerank.applied;
        if !rerank.applied && self.config.rerank.enabled {
            metadata.degraded.push("rerank_pass_through".to_string());
        }

        self.transition(&mut state, RequestState::Condensing, &request_id);
        let condensed = if request.options.skip_condensation {
            rerank.passages.iter().map(|p| p.hit.text.clone()).collect()
        } else {
            self.condense(&request.question, &rerank, &mut metadata).await
        };

        // Step 5: assemble context under the token budget
        let (context_sections, included) = self.assemble_context(&condensed);
        let context_text = context_sections.join("\n");

        // Step 6/7: generate N candidates, score, select
        self.transition(&mut state, RequestState::Generating, &request_id);
        let n = request
            .options
            .n_candidates
            .unwrap_or(self.config.generation.n_candidates);
        let prompt = build_prompt(&request.question, &context_sections);

        let candidates = {
            let _permit = self.generation_limiter.acquire().await?;
            self.bestofn
                .run(
                    &request.question,
                    &prompt,
                    &context_text,
                    n,
                    &self.config.gate.banned_phrases,
                )
                .await
        };

        self.transition(&mut state, RequestState::Scoring, &request_id);
        let candidates = match candidates {
            Ok(candidates) => candidates,
            Err(e) => {
                let fallback_permitted = request.options.allow_external_fallback
                    && self.config.fallback.enabled
                    && self.external.is_some();
                if !fallback_permitted {
                    // Every candidate failed and nothing can degrade further
                    return Err(e);
                }
                warn!(error = %e, "all candidates failed, degrading to external fallback");
                metadata.degraded.push("generation_failed".to_string());
                return self
                    .answer_without_evidence(request, &query, started, metadata)
                    .await;
            }
        };
        metadata.candidates_generated = candidates.len();
        let best = candidates[0].clone();

        // Stash a formatted local answer so deadline expiry can return it
        let sources = self.collect_sources(&rerank, &included, request.options.max_sources);
        let local_response = self.format_response(
            &best.text,
            best.scores.final_score,
            sources.clone(),
            Origin::Local,
            started,
            request.options.response_format,
            metadata.clone(),
        );
        if let Ok(mut slot) = partial.lock() {
            *slot = Some(local_response.clone());
        }

        // Step 8: quality gate
        self.transition(&mut state, RequestState::Gated, &request_id);
        let gate_triggered = should_trigger_fallback(
            best.scores.final_score,
            &best.text,
            confidence_floor,
            self.config.gate.min_answer_length,
            &self.poor_answer_regexes,
        );

        let mut response = if gate_triggered {
            self.transition(&mut state, RequestState::Fallback, &request_id);
            self.resolve_gated(
                request,
                &best,
                sources,
                &context_sections,
                started,
                &mut metadata,
            )
            .await
        } else {
            local_response
        };

        // Step 10/11: finalize, update cache exactly once
        self.transition(&mut state, RequestState::Formatted, &request_id);
        response.metadata = metadata.clone();
        response.processing_time_ms = started.elapsed().as_millis() as u64;

        self.cache
            .record_interaction(
                &query.fingerprint,
                &request.question,
                &response.answer,
                response.confidence,
                response.processing_time_ms,
                !gate_triggered,
            )
            .await?;

        self.transition(&mut state, RequestState::Completed, &request_id);
        info!(
            request_id = %request_id,
            origin = ?response.origin,
            confidence = response.confidence,
            elapsed_ms = response.processing_time_ms,
            "request completed"
        );
        Ok(response)
    }

    /// Step 1: serve from the adaptive cache when a serving-eligible entry
    /// is an exact or verified near-duplicate match
    async fn try_cache(
        &self,
        query: &Query,
        request: &AnswerRequest,
        started: Instant,
        metadata: &mut ResponseMetadata,
    ) -> Result<Option<QaResponse>> {
        let keywords = query.keywords();
        let Some(hit) = self.cache.lookup(&query.fingerprint, &keywords).await else {
            return Ok(None);
        };

        // An exact fingerprint match is the same normalized text, so the
        // embedding check is vacuous; the keyword path must verify
        if !hit.exact {
            let verified = match tokio::try_join!(
                self.embedder.embed(&request.question),
                self.embedder.embed(&hit.entry.canonical_question),
            ) {
                Ok((a, b)) => cosine_similarity(&a, &b) >= self.config.cache.near_duplicate_cosine,
                Err(e) => {
                    // Unverifiable near-duplicates are treated as misses
                    warn!(error = %e, "embedding check failed, skipping cache");
                    false
                }
            };
            if !verified {
                debug!("keyword candidate rejected by embedding check");
                return Ok(None);
            }
        }

        self.cache_hits.fetch_add(1, Ordering::SeqCst);
        metadata.cache_hit = true;
        metadata.classification_label = query.label.clone().unwrap_or_default();

        let elapsed = started.elapsed().as_millis() as u64;
        self.cache
            .record_interaction(
                &query.fingerprint,
                &request.question,
                &hit.entry.canonical_answer,
                hit.entry.canonical_confidence,
                elapsed,
                true,
            )
            .await?;

        info!(fingerprint = %query.fingerprint, exact = hit.exact, "cache hit");
        Ok(Some(QaResponse {
            answer: hit.entry.canonical_answer.clone(),
            confidence: hit.entry.canonical_confidence,
            sources: Vec::new(),
            origin: Origin::Local,
            processing_time_ms: started.elapsed().as_millis() as u64,
            metadata: metadata.clone(),
        }))
    }

    /// No local evidence: either the external source answers or the request
    /// terminates with a deterministic no-evidence response
    async fn answer_without_evidence(
        &self,
        request: &AnswerRequest,
        query: &Query,
        started: Instant,
        mut metadata: ResponseMetadata,
    ) -> Result<QaResponse> {
        let fallback_permitted = request.options.allow_external_fallback
            && self.config.fallback.enabled
            && self.external.is_some();

        let mut response = if fallback_permitted {
            match self.call_external(&request.question).await {
                Some(external) if !external.text.is_empty() => {
                    metadata.fallback_used = true;
                    self.fallbacks.fetch_add(1, Ordering::SeqCst);
                    let text = self.post_process(&external.text, request.options.response_format);
                    QaResponse {
                        answer: text,
                        confidence: external.confidence.clamp(0.0, 1.0),
                        sources: Vec::new(),
                        origin: Origin::External,
                        processing_time_ms: started.elapsed().as_millis() as u64,
                        metadata: metadata.clone(),
                    }
                }
                _ => {
                    metadata.fallback_used = true;
                    QaResponse::failure(
                        Origin::FallbackError,
                        FALLBACK_FAILED_MESSAGE,
                        started.elapsed().as_millis() as u64,
                        metadata.clone(),
                    )
                }
            }
        } else {
            QaResponse::failure(
                Origin::FallbackError,
                NO_EVIDENCE_MESSAGE,
                started.elapsed().as_millis() as u64,
                metadata.clone(),
            )
        };

        response.metadata = metadata;
        response.processing_time_ms = started.elapsed().as_millis() as u64;

        self.cache
            .record_interaction(
                &query.fingerprint,
                &request.question,
                &response.answer,
                response.confidence,
                response.processing_time_ms,
                response.origin == Origin::External,
            )
            .await?;
        Ok(response)
    }

    /// Step 9: the gate fired on a local candidate
    async fn resolve_gated(
        &self,
        request: &AnswerRequest,
        best: &Candidate,
        sources: Vec<SourceRef>,
        context_sections: &[String],
        started: Instant,
        metadata: &mut ResponseMetadata,
    ) -> QaResponse {
        let fallback_permitted = request.options.allow_external_fallback
            && self.config.fallback.enabled
            && self.external.is_some();

        if !fallback_permitted {
            // Gate decides fallback only; without it the local candidate
            // stands, low confidence and all
            return self.format_response(
                &best.text,
                best.scores.final_score,
                sources,
                Origin::Local,
                started,
                request.options.response_format,
                metadata.clone(),
            );
        }

        metadata.fallback_used = true;
        self.fallbacks.fetch_add(1, Ordering::SeqCst);

        match self.call_external(&request.question).await {
            Some(external) if !external.text.is_empty() => {
                let has_local_context = !context_sections.is_empty();
                let origin = if has_local_context {
                    Origin::Hybrid
                } else {
                    Origin::External
                };
                let merged = if has_local_context {
                    format!(
                        "{}\n\nAdditional context from external sources:\n{}",
                        best.text.trim(),
                        external.text.trim()
                    )
                } else {
                    external.text.clone()
                };

                // Confidence: the gate's score scaled by the fallback's
                // reported confidence, clamped
                let confidence = (best.scores.final_score.max(0.5) * external.confidence)
                    .clamp(0.0, 1.0);

                self.format_response(
                    &merged,
                    confidence,
                    sources,
                    origin,
                    started,
                    request.options.response_format,
                    metadata.clone(),
                )
            }
            _ => QaResponse::failure(
                Origin::FallbackError,
                FALLBACK_FAILED_MESSAGE,
                started.elapsed().as_millis() as u64,
                metadata.clone(),
            ),
        }
    }

    /// External call under its own limiter and deadline
    async fn call_external(&self, question: &str) -> Option<ExternalAnswer> {
        let external = self.external.as_ref()?;
        let permit = match self.fallback_limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "fallback limiter rejected the call");
                return None;
            }
        };

        let deadline = Duration::from_millis(self.config.deadlines.fallback_ms);
        let result = tokio::time::timeout(deadline, external.search_and_answer(question)).await;
        drop(permit);

        match result {
            Ok(Ok(answer)) => Some(answer),
            Ok(Err(e)) => {
                warn!(error = %e, "external source failed");
                None
            }
            Err(_) => {
                warn!("external source timed out");
                None
            }
        }
    }

    /// Condense each passage to 2-3 query-relevant sentences; failures keep
    /// the original passage text
    async fn condense(
        &self,
        question: &str,
        rerank: &RerankOutcome,
        metadata: &mut ResponseMetadata,
    ) -> Vec<String> {
        let mut condensed = Vec::with_capacity(rerank.passages.len());
        let mut failed = false;

        for (i, passage) in rerank.passages.iter().enumerate() {
            let prompt = condense_prompt(question, &passage.hit.text);
            let params = SamplingParams::new(0.3, 0.9, 1000 + i as u32, 160);
            let deadline = Duration::from_millis(self.config.deadlines.generator_ms);

            match tokio::time::timeout(deadline, self.generator.generate(&prompt, params)).await {
                Ok(Ok(output)) if !output.text.trim().is_empty() => {
                    condensed.push(output.text.trim().to_string());
                }
                _ => {
                    failed = true;
                    condensed.push(passage.hit.text.clone());
                }
            }
        }

        if failed {
            metadata.degraded.push("condensation_failed".to_string());
        }
        condensed
    }

    /// Concatenate condensed passages in reranker order until the token
    /// budget is reached; returns the sections and the passage indices used
    fn assemble_context(&self, condensed: &[String]) -> (Vec<String>, Vec<usize>) {
        let budget = self.config.generation.context_token_budget;
        let mut sections = Vec::new();
        let mut included = Vec::new();
        let mut used = 0usize;

        for (i, text) in condensed.iter().enumerate() {
            let tokens = text.split_whitespace().count();
            if used + tokens > budget && !sections.is_empty() {
                break;
            }
            used += tokens;
            sections.push(text.clone());
            included.push(i);
        }
        (sections, included)
    }

    /// Source references for the passages actually included in the context
    fn collect_sources(
        &self,
        rerank: &RerankOutcome,
        included: &[usize],
        max_sources: usize,
    ) -> Vec<SourceRef> {
        included
            .iter()
            .filter_map(|&i| rerank.passages.get(i))
            .take(max_sources)
            .map(|passage| SourceRef {
                document_id: passage.hit.chunk.document_id.clone(),
                chunk_ordinal: passage.hit.chunk.chunk_ordinal,
                snippet: snippet_of(&passage.hit.text),
                score: passage.rerank_score,
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn format_response(
        &self,
        text: &str,
        confidence: f32,
        sources: Vec<SourceRef>,
        origin: Origin,
        started: Instant,
        format: ResponseFormat,
        metadata: ResponseMetadata,
    ) -> QaResponse {
        QaResponse {
            answer: self.post_process(text, format),
            confidence: confidence.clamp(0.0, 1.0),
            sources,
            origin,
            processing_time_ms: started.elapsed().as_millis() as u64,
            metadata,
        }
    }

    /// Strip banned phrases, collapse space runs, apply the output format
    fn post_process(&self, text: &str, format: ResponseFormat) -> String {
        let mut cleaned = text.to_string();
        for phrase in &self.banned_phrase_regexes {
            cleaned = phrase.replace_all(&cleaned, "").into_owned();
        }

        // Collapse horizontal whitespace but keep line structure
        let cleaned = cleaned
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        match format {
            ResponseFormat::Detailed => cleaned,
            ResponseFormat::Brief => {
                let sentences: Vec<&str> = cleaned
                    .split_inclusive(['.', '!', '?'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .take(2)
                    .collect();
                if sentences.is_empty() {
                    cleaned
                } else {
                    sentences.join(" ")
                }
            }
            ResponseFormat::Bulleted => cleaned
                .split_inclusive(['.', '!', '?'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| format!("- {s}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn transition(&self, state: &mut RequestState, next: RequestState, request_id: &str) {
        debug!(request_id, from = ?state, to = ?next, "state transition");
        *state = next;
    }

    /// Record user feedback for a previously answered question
    pub async fn feedback(&self, fingerprint: &str, positive: bool) -> Result<()> {
        self.cache.record_feedback(fingerprint, positive).await
    }

    /// Queue a document for ingestion
    pub async fn ingest_text(
        &self,
        document_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<IngestReceipt> {
        self.ingestion
            .enqueue_text(document_id, user_id, text, None, None)
            .await
    }

    /// Current ingestion status
    pub async fn ingestion_status(&self, document_id: &str, user_id: &str) -> Result<IngestReceipt> {
        self.ingestion.status(document_id, user_id).await
    }

    /// Delete a document and its chunks
    pub async fn delete_document(&self, document_id: &str, user_id: &str) -> Result<()> {
        self.ingestion.delete(document_id, user_id).await
    }

    /// Wait for queued ingestion jobs; useful in tests and shutdown paths
    pub async fn drain_ingestion(&self) {
        self.ingestion.drain().await
    }

    /// Flush persistent state and stop background work
    pub async fn shutdown(&self) -> Result<()> {
        self.ingestion.shutdown().await;
        self.cache.shutdown().await
    }

    /// Engine counters
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests: self.requests.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            fallbacks: self.fallbacks.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    /// Adaptive cache statistics
    pub async fn cache_stats(&self) -> crate::cache::AdaptiveCacheStats {
        self.cache.stats().await
    }
}

fn snippet_of(text: &str) -> String {
    const SNIPPET_CHARS: usize = 160;
    if text.chars().count() <= SNIPPET_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(SNIPPET_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}
