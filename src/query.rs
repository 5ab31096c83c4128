//! Query normalization, fingerprinting and keyword extraction
//!
//! Every cache and classifier lookup keys off the normalized form of the
//! question, so normalization must be deterministic: lower-case, collapsed
//! whitespace, citation markers canonicalized to a `[CITATION]` placeholder.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// A normalized query with its fingerprint and routing metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Raw text as supplied by the caller
    pub raw: String,
    /// Lower-cased, whitespace-collapsed, citation-canonicalized text
    pub normalized: String,
    /// Stable hash of the normalized text
    pub fingerprint: String,
    /// Label assigned by the classifier; empty until classified
    pub label: Option<String>,
    /// Rough complexity estimate in [0, 1]
    pub complexity: f32,
    /// Detected domain tag, if any
    pub domain: Option<String>,
}

impl Query {
    /// Normalize and fingerprint a raw question
    pub fn parse(raw: &str) -> Self {
        let normalized = normalize(raw);
        let fingerprint = fingerprint(&normalized);
        let complexity = complexity(&normalized);
        let domain = detect_domain(&normalized);

        Self {
            raw: raw.to_string(),
            normalized,
            fingerprint,
            label: None,
            complexity,
            domain,
        }
    }

    /// Keywords of the normalized question
    pub fn keywords(&self) -> Vec<String> {
        extract_keywords(&self.normalized)
    }
}

static CITATION_PATTERNS: OnceLock<Vec<regex::Regex>> = OnceLock::new();

fn citation_patterns() -> &'static [regex::Regex] {
    CITATION_PATTERNS.get_or_init(|| {
        [
            r"\[[A-Za-z]+\s+et\s+al\.?,?\s*\d{4}[a-z]?\]",
            r"\[[A-Za-z]+,?\s*\d{4}[a-z]?\]",
            r"\([A-Za-z]+\s+et\s+al\.?,?\s*\d{4}[a-z]?\)",
            r"\([A-Za-z]+,?\s*\d{4}[a-z]?\)",
            r"[A-Za-z]+\s+et\s+al\.?\s*\(\d{4}[a-z]?\)",
            r"\[\d+(?:,\s*\d+)*\]",
            r"\[\d+-\d+\]",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).expect("static citation pattern"))
        .collect()
    })
}

/// Normalize text: citation markers to a placeholder, lower-case, collapse
/// whitespace
pub fn normalize(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in citation_patterns() {
        out = pattern.replace_all(&out, "[CITATION]").into_owned();
    }
    out.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable hash of normalized text, as lowercase hex
pub fn fingerprint(normalized: &str) -> String {
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

const STOPWORDS: &[&str] = &[
    "what", "is", "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of",
    "with", "by", "how", "why", "when", "where", "who", "which", "are", "was", "were", "does",
    "do", "did", "can", "could", "will", "would", "this", "that", "it", "its",
];

/// Extract up to 10 keywords: stopwords removed, short tokens dropped
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .map(|w| w.to_string())
        .take(10)
        .collect()
}

/// Jaccard similarity of two keyword sets
pub fn keyword_jaccard(a: &[String], b: &[String]) -> f32 {
    let a: HashSet<&String> = a.iter().collect();
    let b: HashSet<&String> = b.iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(&b).count();
    intersection as f32 / union as f32
}

/// Bag of lowercase word tokens, for overlap scoring
pub fn token_bag(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Rough complexity in [0, 1] from question length and clause structure
fn complexity(normalized: &str) -> f32 {
    let words = normalized.split_whitespace().count() as f32;
    let clauses = normalized.matches([',', ';']).count() as f32;
    ((words / 40.0) + (clauses / 4.0)).min(1.0)
}

const DOMAIN_TAGS: &[(&str, &[&str])] = &[
    (
        "programming",
        &[
            "code",
            "function",
            "compile",
            "compiler",
            "typescript",
            "javascript",
            "python",
            "rust",
            "api",
            "algorithm",
        ],
    ),
    (
        "data",
        &["dataset", "database", "query", "table", "schema", "sql"],
    ),
    (
        "ml",
        &[
            "model",
            "training",
            "embedding",
            "neural",
            "classifier",
            "accuracy",
        ],
    ),
];

fn detect_domain(normalized: &str) -> Option<String> {
    let bag = token_bag(normalized);
    DOMAIN_TAGS
        .iter()
        .find(|(_, words)| words.iter().any(|w| bag.contains(*w)))
        .map(|(tag, _)| tag.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        let normalized = normalize("  What   is\tTypeScript? \n");
        assert_eq!(normalized, "what is typescript?");
    }

    #[test]
    fn test_normalize_citation_markers() {
        let normalized = normalize("Using [Smith et al., 2020] we trained a model [3]");
        assert_eq!(normalized, "using [citation] we trained a model [citation]");
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = fingerprint("what is typescript?");
        let b = fingerprint("what is typescript?");
        assert_eq!(a, b);

        let c = fingerprint("what is javascript?");
        assert_ne!(a, c);
    }

    #[test]
    fn test_same_question_same_fingerprint_after_normalization() {
        let q1 = Query::parse("What is TypeScript?");
        let q2 = Query::parse("  what IS   TypeScript?");
        assert_eq!(q1.fingerprint, q2.fingerprint);
    }

    #[test]
    fn test_extract_keywords() {
        let keywords = extract_keywords("what is the typescript type system");
        assert!(keywords.contains(&"typescript".to_string()));
        assert!(keywords.contains(&"type".to_string()));
        assert!(!keywords.contains(&"what".to_string()));
        assert!(!keywords.contains(&"is".to_string()));
    }

    #[test]
    fn test_keyword_jaccard() {
        let a = vec!["typescript".to_string(), "types".to_string()];
        let b = vec!["typescript".to_string(), "types".to_string()];
        assert!((keyword_jaccard(&a, &b) - 1.0).abs() < f32::EPSILON);

        let c = vec!["rust".to_string(), "ownership".to_string()];
        assert_eq!(keyword_jaccard(&a, &c), 0.0);

        let d = vec!["typescript".to_string(), "generics".to_string()];
        let sim = keyword_jaccard(&a, &d);
        assert!(sim > 0.3 && sim < 0.4); // 1 shared / 3 total
    }

    #[test]
    fn test_complexity_bounds() {
        let simple = Query::parse("What is X?");
        let complex = Query::parse(
            "Given the architecture described in section two, how does the \
             indexing subsystem interact with the cache, the retriever, and \
             the classifier, and what happens when one of them fails?",
        );
        assert!(simple.complexity < complex.complexity);
        assert!(complex.complexity <= 1.0);
    }

    #[test]
    fn test_domain_detection() {
        let q = Query::parse("How does the TypeScript compiler infer types in code?");
        assert_eq!(q.domain.as_deref(), Some("programming"));

        let q = Query::parse("Why is the sky blue?");
        assert_eq!(q.domain, None);
    }
}
