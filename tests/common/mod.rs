//! Shared stubs and fixtures for the integration suites
#![allow(dead_code)]

use async_trait::async_trait;
use docqa::{
    AnswerEngine, EngineConfig, Embedder, ExternalAnswer, ExternalSource, GenerationOutput,
    Generator, Result, SamplingParams, SqliteDocumentStore, SqliteVectorIndex,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DIM: usize = 16;

/// Initialize tracing once per test binary; honors RUST_LOG
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic bag-of-words embedder; identical text embeds identically
pub struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; DIM];
        for word in text.to_lowercase().split_whitespace() {
            let mut h: usize = 5381;
            for b in word.bytes() {
                h = h.wrapping_mul(33).wrapping_add(b as usize);
            }
            v[h % DIM] += 1.0;
        }
        docqa::model::normalize_l2(&mut v);
        Ok(v)
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn version_tag(&self) -> String {
        "stub-embedder-v1".to_string()
    }
}

/// Decrements the active counter even when the owning task is aborted
pub struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    pub fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable generator stub
pub struct StubGenerator {
    /// Text returned per sampling seed (cycled); condensation calls
    /// (seed >= 1000) echo the passage-independent condense text
    pub answers: Vec<String>,
    pub condense_text: Option<String>,
    pub sleep: Option<Duration>,
    pub active: Arc<AtomicUsize>,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl StubGenerator {
    pub fn answering(answers: Vec<&str>) -> Self {
        Self {
            answers: answers.into_iter().map(String::from).collect(),
            condense_text: None,
            sleep: None,
            active: Arc::new(AtomicUsize::new(0)),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeper(duration: Duration) -> Self {
        let mut stub = Self::answering(vec!["slow answer that never arrives in time."]);
        stub.sleep = Some(duration);
        stub
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, prompt: &str, params: SamplingParams) -> Result<GenerationOutput> {
        let _guard = ActiveGuard::enter(&self.active);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().await.push(prompt.to_string());

        if let Some(duration) = self.sleep {
            tokio::time::sleep(duration).await;
        }

        let text = if params.seed >= 1000 {
            self.condense_text
                .clone()
                .unwrap_or_else(|| "A short condensed summary of the passage.".to_string())
        } else {
            self.answers[params.seed as usize % self.answers.len()].clone()
        };

        Ok(GenerationOutput {
            text,
            token_logprobs: None,
            model: "stub".to_string(),
            tokens_used: None,
        })
    }
}

/// External source stub with a call counter
pub struct StubExternalSource {
    pub text: String,
    pub confidence: f32,
    pub calls: AtomicUsize,
}

impl StubExternalSource {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExternalSource for StubExternalSource {
    async fn search_and_answer(&self, _query: &str) -> Result<ExternalAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExternalAnswer {
            text: self.text.clone(),
            confidence: self.confidence,
            sources: Vec::new(),
        })
    }
}

/// Build an engine over in-memory stores with the given stubs
pub async fn build_engine(
    config: EngineConfig,
    generator: Arc<StubGenerator>,
    external: Option<Arc<StubExternalSource>>,
) -> AnswerEngine {
    init_tracing();
    let index = Arc::new(SqliteVectorIndex::in_memory(DIM).await.unwrap());
    let store = Arc::new(SqliteDocumentStore::in_memory().await.unwrap());

    let mut builder = AnswerEngine::builder(config)
        .embedder(Arc::new(StubEmbedder))
        .generator(generator)
        .vector_index(index)
        .document_store(store);
    if let Some(external) = external {
        builder = builder.external_source(external);
    }
    builder.build().await.unwrap()
}

/// Ingest one document and wait until the background worker indexed it
pub async fn ingest(engine: &AnswerEngine, document_id: &str, user_id: &str, text: &str) {
    engine.ingest_text(document_id, user_id, text).await.unwrap();
    for _ in 0..100 {
        engine.drain_ingestion().await;
        if let Ok(receipt) = engine.ingestion_status(document_id, user_id).await {
            if receipt.status == docqa::DocumentStatus::Indexed {
                return;
            }
        }
    }
    panic!("document {document_id} never reached indexed");
}
