//! Hybrid rule + ML query classification
//!
//! An ordered rule list gives a fast, high-confidence path; texts no rule
//! matches go to the ML capability in batches. ML predictions below the
//! confidence threshold are overwritten with the default label at 0.5,
//! explicitly flagging low certainty. When the ML capability is unavailable
//! the classifier degrades to rules only and never fails a request.
//!
//! Rule patterns are compiled case-insensitive and applied to the
//! normalized text (lower-cased, citation markers canonicalized to
//! `[CITATION]`).

use crate::config::ClassifierConfig;
use crate::error::Result;
use crate::model::LabelModel;
use crate::query;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How a classification was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyMethod {
    Rule,
    Ml,
}

/// A classification with its confidence and label distribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub fingerprint: String,
    pub label: String,
    pub confidence: f32,
    pub method: ClassifyMethod,
    pub distribution: Vec<(String, f32)>,
}

/// A single classification rule; first match wins
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub label: String,
    pub pattern: regex::Regex,
}

impl ClassifierRule {
    /// Compile a rule with case-insensitive matching
    pub fn new(label: &str, pattern: &str) -> Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                crate::error::EngineError::Config(format!("invalid rule pattern '{pattern}': {e}"))
            })?;
        Ok(Self {
            label: label.to_string(),
            pattern,
        })
    }
}

/// Bounded FIFO cache with deterministic eviction
struct FifoCache {
    map: HashMap<String, ClassificationRecord>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FifoCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<ClassificationRecord> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: String, record: ClassificationRecord) {
        if self.map.contains_key(&key) {
            self.map.insert(key, record);
            return;
        }
        if self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, record);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Hybrid rule + ML classifier
pub struct Classifier {
    rules: Vec<ClassifierRule>,
    labels: Vec<String>,
    default_label: String,
    ml: Option<Arc<dyn LabelModel>>,
    cache: Mutex<FifoCache>,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(
        rules: Vec<ClassifierRule>,
        default_label: &str,
        ml: Option<Arc<dyn LabelModel>>,
        config: ClassifierConfig,
    ) -> Self {
        let mut labels: Vec<String> = Vec::new();
        for rule in &rules {
            if !labels.contains(&rule.label) {
                labels.push(rule.label.clone());
            }
        }
        if !labels.contains(&default_label.to_string()) {
            labels.push(default_label.to_string());
        }

        Self {
            rules,
            labels,
            default_label: default_label.to_string(),
            ml,
            cache: Mutex::new(FifoCache::new(config.cache_capacity)),
            config,
        }
    }

    /// The default query-routing rule set
    pub fn with_default_rules(
        ml: Option<Arc<dyn LabelModel>>,
        config: ClassifierConfig,
    ) -> Result<Self> {
        let rules = vec![
            ClassifierRule::new(
                "comparison",
                r"\b(?:compare|compared to|versus|difference between)\b|\bvs\.?\b",
            )?,
            ClassifierRule::new("definition", r"^(?:what is|what are|define|definition of)\b|\bmeaning of\b")?,
            ClassifierRule::new("howto", r"^how (?:do|can|to|does one)\b|\bsteps to\b|\bguide to\b")?,
            ClassifierRule::new(
                "code",
                r"\b(?:code|function|implement|compile|syntax|snippet|error message)\b",
            )?,
            ClassifierRule::new("analytical", r"^why\b|\b(?:explain|analyz|impact of|implication)")?,
        ];
        Ok(Self::new(rules, "general", ml, config))
    }

    /// Classify one text
    pub async fn classify(&self, text: &str) -> Result<ClassificationRecord> {
        let mut records = self.batch_classify(&[text.to_string()]).await?;
        Ok(records.remove(0))
    }

    /// Classify a batch
    ///
    /// Duplicates within the batch and cached texts never reach the ML
    /// capability; the residue goes out in a single batched call.
    pub async fn batch_classify(&self, texts: &[String]) -> Result<Vec<ClassificationRecord>> {
        let normalized: Vec<String> = texts.iter().map(|t| query::normalize(t)).collect();
        let fingerprints: Vec<String> = normalized.iter().map(|n| query::fingerprint(n)).collect();

        let mut resolved: HashMap<String, ClassificationRecord> = HashMap::new();
        let mut residue: Vec<(String, String)> = Vec::new(); // (fingerprint, normalized)

        {
            let cache = self.cache.lock().await;
            for (fp, norm) in fingerprints.iter().zip(normalized.iter()) {
                if resolved.contains_key(fp) {
                    continue;
                }
                if let Some(record) = cache.get(fp) {
                    debug!(fingerprint = %fp, "classification cache hit");
                    resolved.insert(fp.clone(), record);
                } else if let Some(record) = self.apply_rules(fp, norm) {
                    resolved.insert(fp.clone(), record);
                } else if !residue.iter().any(|(f, _)| f == fp) {
                    residue.push((fp.clone(), norm.clone()));
                }
            }
        }

        if !residue.is_empty() {
            let ml_records = self.classify_residue(&residue).await;
            for record in ml_records {
                resolved.insert(record.fingerprint.clone(), record);
            }
        }

        {
            let mut cache = self.cache.lock().await;
            for record in resolved.values() {
                cache.insert(record.fingerprint.clone(), record.clone());
            }
        }

        Ok(fingerprints
            .iter()
            .map(|fp| {
                resolved
                    .get(fp)
                    .cloned()
                    .unwrap_or_else(|| self.degraded_record(fp))
            })
            .collect())
    }

    /// First matching rule wins and yields a high-confidence record
    fn apply_rules(&self, fingerprint: &str, normalized: &str) -> Option<ClassificationRecord> {
        for rule in &self.rules {
            if rule.pattern.is_match(normalized) {
                debug!(label = %rule.label, "rule-based classification");
                return Some(ClassificationRecord {
                    fingerprint: fingerprint.to_string(),
                    label: rule.label.clone(),
                    confidence: self.config.rule_confidence,
                    method: ClassifyMethod::Rule,
                    distribution: self.synthetic_distribution(&rule.label, self.config.rule_confidence),
                });
            }
        }
        None
    }

    /// Batched ML classification with threshold handling and degradation
    async fn classify_residue(&self, residue: &[(String, String)]) -> Vec<ClassificationRecord> {
        let Some(ml) = &self.ml else {
            return residue
                .iter()
                .map(|(fp, _)| self.degraded_record(fp))
                .collect();
        };

        let texts: Vec<String> = residue.iter().map(|(_, n)| n.clone()).collect();
        let predictions = match ml.classify_batch(&texts).await {
            Ok(p) if p.len() == texts.len() => p,
            Ok(p) => {
                warn!(
                    expected = texts.len(),
                    got = p.len(),
                    "label model returned wrong batch size, degrading to rules only"
                );
                return residue
                    .iter()
                    .map(|(fp, _)| self.degraded_record(fp))
                    .collect();
            }
            Err(e) => {
                warn!(error = %e, "label model unavailable, degrading to rules only");
                return residue
                    .iter()
                    .map(|(fp, _)| self.degraded_record(fp))
                    .collect();
            }
        };

        residue
            .iter()
            .zip(predictions)
            .map(|((fp, _), prediction)| {
                if prediction.confidence < self.config.ml_confidence_threshold {
                    // Uncertain prediction: flag it rather than trust it
                    ClassificationRecord {
                        fingerprint: fp.clone(),
                        label: self.default_label.clone(),
                        confidence: 0.5,
                        method: ClassifyMethod::Ml,
                        distribution: prediction.distribution,
                    }
                } else {
                    ClassificationRecord {
                        fingerprint: fp.clone(),
                        label: prediction.label,
                        confidence: prediction.confidence,
                        method: ClassifyMethod::Ml,
                        distribution: prediction.distribution,
                    }
                }
            })
            .collect()
    }

    /// No rule fired and no ML available
    fn degraded_record(&self, fingerprint: &str) -> ClassificationRecord {
        ClassificationRecord {
            fingerprint: fingerprint.to_string(),
            label: self.default_label.clone(),
            confidence: 0.0,
            method: ClassifyMethod::Rule,
            distribution: self.synthetic_distribution(&self.default_label, 0.0),
        }
    }

    /// Mass on the chosen label, remainder uniform over the others
    fn synthetic_distribution(&self, label: &str, confidence: f32) -> Vec<(String, f32)> {
        let others = self.labels.len().saturating_sub(1);
        let remainder = if others > 0 {
            (1.0 - confidence) / others as f32
        } else {
            0.0
        };
        self.labels
            .iter()
            .map(|l| {
                let mass = if l == label { confidence } else { remainder };
                (l.clone(), mass)
            })
            .collect()
    }

    /// Number of cached classifications
    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LabelPrediction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLabelModel {
        calls: AtomicUsize,
        texts_seen: Mutex<Vec<usize>>,
        label: String,
        confidence: f32,
    }

    impl CountingLabelModel {
        fn new(label: &str, confidence: f32) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_seen: Mutex::new(Vec::new()),
                label: label.to_string(),
                confidence,
            }
        }
    }

    #[async_trait]
    impl LabelModel for CountingLabelModel {
        async fn classify_batch(&self, texts: &[String]) -> Result<Vec<LabelPrediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.lock().await.push(texts.len());
            Ok(texts
                .iter()
                .map(|_| LabelPrediction {
                    label: self.label.clone(),
                    confidence: self.confidence,
                    distribution: vec![(self.label.clone(), self.confidence)],
                })
                .collect())
        }
    }

    fn config() -> ClassifierConfig {
        ClassifierConfig::default()
    }

    #[tokio::test]
    async fn test_rule_first_skips_ml() {
        let ml = Arc::new(CountingLabelModel::new("analytical", 0.9));
        let rules = vec![ClassifierRule::new("Method", r"\busing\b.*\[CITATION\]").unwrap()];
        let classifier = Classifier::new(rules, "Other", Some(ml.clone() as Arc<dyn LabelModel>), config());

        let record = classifier
            .classify("Using [Smith et al., 2020] we trained a model")
            .await
            .unwrap();

        assert_eq!(record.label, "Method");
        assert_eq!(record.method, ClassifyMethod::Rule);
        assert!(record.confidence >= 0.9);
        assert_eq!(ml.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ml_path_for_residue() {
        let ml = Arc::new(CountingLabelModel::new("analytical", 0.9));
        let classifier =
            Classifier::with_default_rules(Some(ml.clone() as Arc<dyn LabelModel>), config()).unwrap();

        let record = classifier
            .classify("something completely unmatched by rules")
            .await
            .unwrap();

        assert_eq!(record.label, "analytical");
        assert_eq!(record.method, ClassifyMethod::Ml);
        assert_eq!(ml.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_low_ml_confidence_falls_back_to_default() {
        let ml = Arc::new(CountingLabelModel::new("code", 0.4));
        let classifier =
            Classifier::with_default_rules(Some(ml as Arc<dyn LabelModel>), config()).unwrap();

        let record = classifier
            .classify("something completely unmatched by rules")
            .await
            .unwrap();

        assert_eq!(record.label, "general");
        assert!((record.confidence - 0.5).abs() < f32::EPSILON);
        assert_eq!(record.method, ClassifyMethod::Ml);
    }

    #[tokio::test]
    async fn test_ml_unavailable_degrades_to_rules() {
        let classifier = Classifier::with_default_rules(None, config()).unwrap();

        // Rule still authoritative
        let record = classifier.classify("What is TypeScript?").await.unwrap();
        assert_eq!(record.label, "definition");
        assert_eq!(record.method, ClassifyMethod::Rule);

        // No rule, no ML
        let record = classifier
            .classify("something completely unmatched by rules")
            .await
            .unwrap();
        assert_eq!(record.label, "general");
        assert_eq!(record.confidence, 0.0);
        assert_eq!(record.method, ClassifyMethod::Rule);
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let ml = Arc::new(CountingLabelModel::new("analytical", 0.9));
        let classifier =
            Classifier::with_default_rules(Some(ml.clone() as Arc<dyn LabelModel>), config()).unwrap();

        let first = classifier
            .classify("something completely unmatched by rules")
            .await
            .unwrap();
        let second = classifier
            .classify("something completely unmatched by rules")
            .await
            .unwrap();

        assert_eq!(first.label, second.label);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(ml.calls.load(Ordering::SeqCst), 1);
        assert_eq!(classifier.cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_batch_dedupes_and_batches_ml() {
        let ml = Arc::new(CountingLabelModel::new("analytical", 0.9));
        let classifier =
            Classifier::with_default_rules(Some(ml.clone() as Arc<dyn LabelModel>), config()).unwrap();

        let texts = vec![
            "unmatched question one".to_string(),
            "unmatched question one".to_string(), // duplicate
            "unmatched question two".to_string(),
            "What is TypeScript?".to_string(), // rule path
        ];
        let records = classifier.batch_classify(&texts).await.unwrap();

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].label, "analytical");
        assert_eq!(records[1].label, "analytical");
        assert_eq!(records[3].label, "definition");

        // One ML call covering only the two unique residue texts
        assert_eq!(ml.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*ml.texts_seen.lock().await, vec![2]);
    }

    #[tokio::test]
    async fn test_classification_is_deterministic() {
        let classifier = Classifier::with_default_rules(None, config()).unwrap();
        let a = classifier.classify("What is a monad?").await.unwrap();
        let b = classifier.classify("What is a monad?").await.unwrap();
        assert_eq!(a.label, b.label);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.confidence, b.confidence);
    }

    #[tokio::test]
    async fn test_fifo_eviction_is_bounded() {
        let mut cfg = config();
        cfg.cache_capacity = 2;
        let classifier = Classifier::with_default_rules(None, cfg).unwrap();

        classifier.classify("What is A?").await.unwrap();
        classifier.classify("What is B?").await.unwrap();
        classifier.classify("What is C?").await.unwrap();

        assert_eq!(classifier.cache_len().await, 2);
    }

    #[tokio::test]
    async fn test_synthetic_distribution_sums_to_one() {
        let classifier = Classifier::with_default_rules(None, config()).unwrap();
        let record = classifier.classify("What is TypeScript?").await.unwrap();
        let total: f32 = record.distribution.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}
