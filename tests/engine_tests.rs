//! End-to-end pipeline scenarios against stubbed capabilities

mod common;

use common::{build_engine, ingest, StubGenerator};
use docqa::{
    AnswerOptions, AnswerRequest, ClassifierRule, Classifier, ClassifierConfig, EngineConfig,
    LabelModel, LabelPrediction, Origin, ResponseFormat,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GROUNDED_ANSWER: &str =
    "According to the document, TypeScript is a strongly typed superset of JavaScript. \
     For example, it catches type errors early, because the compiler checks every assignment.";

fn request(question: &str) -> AnswerRequest {
    AnswerRequest {
        question: question.to_string(),
        document_id: "doc-1".to_string(),
        user_id: "user-1".to_string(),
        options: AnswerOptions::default(),
    }
}

/// Scenario 1: repeated questions get promoted and served from the cache
#[tokio::test]
async fn cache_serves_repeated_question_instantly() {
    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(EngineConfig::default(), generator, None).await;
    ingest(
        &engine,
        "doc-1",
        "user-1",
        "TypeScript is a strongly typed superset of JavaScript.",
    )
    .await;

    let mut warm_answer = String::new();
    for _ in 0..6 {
        let response = engine.answer(request("What is TypeScript?")).await.unwrap();
        assert!(response.confidence > 0.0);
        warm_answer = response.answer;
    }

    let started = Instant::now();
    let response = engine.answer(request("What is TypeScript?")).await.unwrap();
    let elapsed = started.elapsed();

    assert!(response.metadata.cache_hit, "seventh call must hit the cache");
    assert_eq!(response.origin, Origin::Local);
    assert_eq!(response.answer, warm_answer);
    assert!(
        elapsed < Duration::from_millis(50),
        "cache hit took {elapsed:?}"
    );

    let stats = engine.stats();
    assert!(stats.cache_hits >= 1);
}

/// Scenario 2: best-of-N selection is deterministic across runs
#[tokio::test]
async fn best_of_n_selection_is_deterministic() {
    let a = "Short answer.";
    let b = GROUNDED_ANSWER;
    let c = "no";

    let mut config = EngineConfig::default();
    config.generation.sampling_schedule = vec![(0.7, 0.9), (0.5, 0.9), (0.9, 0.9)];
    config.generation.n_candidates = 3;

    let generator = Arc::new(StubGenerator::answering(vec![a, b, c]));
    let engine = build_engine(config, generator, None).await;
    ingest(
        &engine,
        "doc-1",
        "user-1",
        "TypeScript is a strongly typed superset of JavaScript.",
    )
    .await;

    for run in 0..100 {
        let mut req = request(&format!("What is TypeScript exactly, run {run}?"));
        req.options.skip_condensation = true;
        let response = engine.answer(req).await.unwrap();
        assert_eq!(response.answer, b, "run {run} selected a different candidate");
        assert_eq!(response.metadata.candidates_generated, 3);
    }
}

/// Scenario 3: cross-encoder scores reorder passages and the context follows
#[tokio::test]
async fn rerank_reorders_passages_and_context() {
    use async_trait::async_trait;
    use docqa::CrossEncoder;

    struct SubstringCrossEncoder;

    #[async_trait]
    impl CrossEncoder for SubstringCrossEncoder {
        async fn score(&self, _query: &str, passage: &str) -> docqa::Result<f32> {
            Ok(if passage.contains("Pone") {
                0.9
            } else if passage.contains("Pthree") {
                0.8
            } else {
                0.1
            })
        }
    }

    let mut config = EngineConfig::default();
    config.chunking.chunk_size = 8;
    config.chunking.overlap = 0;
    config.chunking.min_chunk_size = 2;
    config.rerank.min_score = 0.0;
    config.retrieval.score_floor = 0.0;

    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let index = Arc::new(docqa::SqliteVectorIndex::in_memory(common::DIM).await.unwrap());
    let store = Arc::new(docqa::SqliteDocumentStore::in_memory().await.unwrap());
    let engine = docqa::AnswerEngine::builder(config)
        .embedder(Arc::new(common::StubEmbedder))
        .generator(Arc::clone(&generator) as Arc<dyn docqa::Generator>)
        .cross_encoder(Arc::new(SubstringCrossEncoder))
        .vector_index(index)
        .document_store(store)
        .build()
        .await
        .unwrap();

    // Three 8-token paragraphs become three chunks
    let text = "Pone alpha beta gamma delta epsilon zeta eta\n\n\
                Ptwo alpha beta gamma delta epsilon zeta eta\n\n\
                Pthree alpha beta gamma delta epsilon zeta eta";
    ingest(&engine, "doc-1", "user-1", text).await;

    let mut req = request("alpha beta gamma?");
    req.options.skip_condensation = true;
    let response = engine.answer(req).await.unwrap();

    assert!(response.metadata.rerank_applied);
    let ordinals: Vec<u32> = response.sources.iter().map(|s| s.chunk_ordinal).collect();
    assert_eq!(ordinals, vec![0, 2, 1], "expected rerank order Pone, Pthree, Ptwo");

    // The assembled context follows the rerank order
    let prompts = generator.prompts.lock().await;
    let answer_prompt = prompts
        .iter()
        .find(|p| p.contains("Question:"))
        .expect("no answering prompt captured");
    let pos1 = answer_prompt.find("Pone").unwrap();
    let pos3 = answer_prompt.find("Pthree").unwrap();
    let pos2 = answer_prompt.find("Ptwo").unwrap();
    assert!(pos1 < pos3 && pos3 < pos2);
}

/// Scenario 4: a low-confidence local answer triggers the external fallback
#[tokio::test]
async fn quality_gate_triggers_external_fallback() {
    let mut config = EngineConfig::default();
    config.gate.confidence_floor = 0.8;

    let generator = Arc::new(StubGenerator::answering(vec![
        "A mediocre answer lacking much grounding or detail whatsoever here.",
    ]));
    let external = Arc::new(common::StubExternalSource::new("X", 0.9));
    let engine = build_engine(config, generator, Some(Arc::clone(&external))).await;
    ingest(
        &engine,
        "doc-1",
        "user-1",
        "TypeScript is a strongly typed superset of JavaScript.",
    )
    .await;

    let mut req = request("What is the capital of something unrelated?");
    req.options.confidence_floor = Some(0.8);
    let response = engine.answer(req).await.unwrap();

    assert!(
        matches!(response.origin, Origin::External | Origin::Hybrid),
        "origin was {:?}",
        response.origin
    );
    assert!(response.answer.contains('X'));
    assert!(response.metadata.fallback_used);
    assert_eq!(external.calls.load(Ordering::SeqCst), 1);
    assert!(response.confidence <= 1.0);
}

/// Scenario 5: the deadline cancels outstanding generator work
#[tokio::test]
async fn deadline_cancels_generator_tasks() {
    let mut config = EngineConfig::default();
    config.deadlines.total_ms = 100;

    let generator = Arc::new(StubGenerator::sleeper(Duration::from_secs(1)));
    let active = Arc::clone(&generator.active);
    let engine = build_engine(config, generator, None).await;
    ingest(
        &engine,
        "doc-1",
        "user-1",
        "TypeScript is a strongly typed superset of JavaScript.",
    )
    .await;

    let started = Instant::now();
    let mut req = request("What is TypeScript?");
    req.options.skip_condensation = true;
    let result = engine.answer(req).await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(150),
        "request took {elapsed:?}"
    );
    match result {
        Err(e) => assert_eq!(e.kind(), "deadline_exceeded"),
        Ok(response) => assert!(response.metadata.deadline_exceeded),
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        active.load(Ordering::SeqCst),
        0,
        "generator tasks still running after cancellation"
    );
}

/// Scenario 6: a matching rule classifies without invoking the ML capability
#[tokio::test]
async fn classifier_rule_fires_before_ml() {
    use async_trait::async_trait;

    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LabelModel for CountingModel {
        async fn classify_batch(&self, texts: &[String]) -> docqa::Result<Vec<LabelPrediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|_| LabelPrediction {
                    label: "Other".to_string(),
                    confidence: 0.9,
                    distribution: vec![],
                })
                .collect())
        }
    }

    let ml = Arc::new(CountingModel {
        calls: AtomicUsize::new(0),
    });
    let rules = vec![ClassifierRule::new("Method", r"\busing\b.*\[CITATION\]").unwrap()];
    let classifier = Classifier::new(
        rules,
        "Other",
        Some(Arc::clone(&ml) as Arc<dyn LabelModel>),
        ClassifierConfig::default(),
    );

    let record = classifier
        .classify("Using [CITATION] we trained a sequence model")
        .await
        .unwrap();

    assert_eq!(record.label, "Method");
    assert_eq!(record.method, docqa::ClassifyMethod::Rule);
    assert!(record.confidence >= 0.9);
    assert_eq!(ml.calls.load(Ordering::SeqCst), 0, "ML must not be invoked");
}

/// Boundary: empty retrieval with fallback disabled terminates cleanly
#[tokio::test]
async fn empty_retrieval_without_fallback_is_fallback_error() {
    let mut config = EngineConfig::default();
    // Nothing clears this floor
    config.retrieval.score_floor = 0.999;

    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(config, generator, None).await;
    ingest(&engine, "doc-1", "user-1", "Completely unrelated content here.").await;

    let mut req = request("What is TypeScript?");
    req.options.allow_external_fallback = false;
    let response = engine.answer(req).await.unwrap();

    assert_eq!(response.origin, Origin::FallbackError);
    assert_eq!(response.confidence, 0.0);
    assert!(response.sources.is_empty());
    assert!(!response.answer.is_empty());
}

/// Boundary: a zero deadline fails immediately
#[tokio::test]
async fn zero_deadline_fails_immediately() {
    let mut config = EngineConfig::default();
    config.deadlines.total_ms = 0;

    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(config, generator, None).await;
    ingest(&engine, "doc-1", "user-1", "Some document text for the index.").await;

    let err = engine.answer(request("What is anything?")).await.unwrap_err();
    assert_eq!(err.kind(), "deadline_exceeded");
}

/// Boundary: a single candidate still runs scoring and selection
#[tokio::test]
async fn single_candidate_still_scored() {
    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(EngineConfig::default(), Arc::clone(&generator), None).await;
    ingest(
        &engine,
        "doc-1",
        "user-1",
        "TypeScript is a strongly typed superset of JavaScript.",
    )
    .await;

    let mut req = request("What is TypeScript?");
    req.options.n_candidates = Some(1);
    req.options.skip_condensation = true;
    let response = engine.answer(req).await.unwrap();

    assert_eq!(response.metadata.candidates_generated, 1);
    assert!(response.confidence > 0.0);
    assert_eq!(response.origin, Origin::Local);
    // One answering call, no condensation calls
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

/// Unknown documents and foreign owners surface as DocumentNotFound
#[tokio::test]
async fn unknown_document_surfaces() {
    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(EngineConfig::default(), generator, None).await;
    ingest(&engine, "doc-1", "user-1", "Some indexed text for the test.").await;

    let mut req = request("What is this?");
    req.document_id = "doc-missing".to_string();
    let err = engine.answer(req).await.unwrap_err();
    assert_eq!(err.kind(), "document_not_found");

    let mut req = request("What is this?");
    req.user_id = "intruder".to_string();
    let err = engine.answer(req).await.unwrap_err();
    assert_eq!(err.kind(), "document_not_found");
}

/// max_sources caps the returned source list
#[tokio::test]
async fn sources_capped_by_max_sources() {
    let mut config = EngineConfig::default();
    config.chunking.chunk_size = 8;
    config.chunking.overlap = 0;
    config.chunking.min_chunk_size = 2;
    config.retrieval.score_floor = 0.0;

    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(config, generator, None).await;

    let text = (0..5)
        .map(|i| format!("Paragraph{i} alpha beta gamma delta epsilon zeta eta"))
        .collect::<Vec<_>>()
        .join("\n\n");
    ingest(&engine, "doc-1", "user-1", &text).await;

    let mut req = request("alpha beta?");
    req.options.max_sources = 2;
    req.options.skip_condensation = true;
    let response = engine.answer(req).await.unwrap();

    assert!(response.sources.len() <= 2);
    assert!((0.0..=1.0).contains(&response.confidence));
}

/// Response formats shape the final text without changing evidence
#[tokio::test]
async fn response_formats_applied() {
    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(EngineConfig::default(), generator, None).await;
    ingest(
        &engine,
        "doc-1",
        "user-1",
        "TypeScript is a strongly typed superset of JavaScript.",
    )
    .await;

    let mut req = request("What is TypeScript number one?");
    req.options.response_format = ResponseFormat::Bulleted;
    let bulleted = engine.answer(req).await.unwrap();
    assert!(bulleted.answer.starts_with("- "));

    let mut req = request("What is TypeScript number two?");
    req.options.response_format = ResponseFormat::Brief;
    let brief = engine.answer(req).await.unwrap();
    let sentence_count = brief.answer.matches(['.', '!', '?']).count();
    assert!(sentence_count <= 2);
}

/// Negative feedback demotes a promoted answer
#[tokio::test]
async fn feedback_demotes_cached_answer() {
    let generator = Arc::new(StubGenerator::answering(vec![GROUNDED_ANSWER]));
    let engine = build_engine(EngineConfig::default(), generator, None).await;
    ingest(
        &engine,
        "doc-1",
        "user-1",
        "TypeScript is a strongly typed superset of JavaScript.",
    )
    .await;

    for _ in 0..6 {
        engine.answer(request("What is TypeScript?")).await.unwrap();
    }
    let response = engine.answer(request("What is TypeScript?")).await.unwrap();
    assert!(response.metadata.cache_hit);

    let fingerprint = docqa::query::fingerprint(&docqa::query::normalize("What is TypeScript?"));
    engine.feedback(&fingerprint, false).await.unwrap();

    let response = engine.answer(request("What is TypeScript?")).await.unwrap();
    assert!(
        !response.metadata.cache_hit,
        "demoted entry must not serve again"
    );
}
