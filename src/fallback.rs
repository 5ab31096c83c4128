//! External knowledge fallback
//!
//! When local evidence is insufficient, the quality gate hands the query to
//! an external source client. The client translates the question into
//! source-appropriate search terms, requests a bounded number of hits,
//! cleans and caps their content, scores each by keyword overlap plus a
//! trust-weighted domain score, and synthesizes one reply with provenance.
//! The provider is injected; a Wikipedia REST client ships as the default.

use crate::config::FallbackConfig;
use crate::error::{EngineError, Result};
use crate::query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Provenance for one external source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSourceRef {
    pub title: String,
    pub url: String,
    pub score: f32,
}

/// Synthesized reply from the external source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAnswer {
    pub text: String,
    pub confidence: f32,
    pub sources: Vec<ExternalSourceRef>,
}

/// External knowledge source capability
#[async_trait]
pub trait ExternalSource: Send + Sync {
    async fn search_and_answer(&self, query: &str) -> Result<ExternalAnswer>;
}

/// Quality-gate predicate: should the external source be consulted
pub fn should_trigger_fallback(
    local_confidence: f32,
    answer_text: &str,
    confidence_floor: f32,
    min_answer_length: usize,
    poor_answer_regexes: &[regex::Regex],
) -> bool {
    if local_confidence < confidence_floor {
        return true;
    }
    if answer_text.trim().len() < min_answer_length {
        return true;
    }
    poor_answer_regexes
        .iter()
        .any(|re| re.is_match(answer_text))
}

static QUESTION_WORDS: OnceLock<regex::Regex> = OnceLock::new();
static PROPER_NOUNS: OnceLock<regex::Regex> = OnceLock::new();
static TECHNICAL_TERMS: OnceLock<Vec<regex::Regex>> = OnceLock::new();
static MARKUP_TAGS: OnceLock<regex::Regex> = OnceLock::new();

fn question_words() -> &'static regex::Regex {
    QUESTION_WORDS.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(?:what|how|why|when|where|who|which|is|are|was|were|does|do|did|can|could|will|would|the|a|an)\b",
        )
        .expect("static fallback pattern")
    })
}

fn proper_nouns() -> &'static regex::Regex {
    PROPER_NOUNS.get_or_init(|| {
        regex::Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").expect("static fallback pattern")
    })
}

fn technical_terms() -> &'static [regex::Regex] {
    TECHNICAL_TERMS.get_or_init(|| {
        [
            r"\b[A-Z][a-z]+(?:[A-Z][a-z]+)+\b",
            r"\b[a-z]+(?:-[a-z]+)+\b",
            r"\b[A-Z]{2,}\b",
        ]
        .iter()
        .map(|p| regex::Regex::new(p).expect("static fallback pattern"))
        .collect()
    })
}

fn markup_tags() -> &'static regex::Regex {
    MARKUP_TAGS
        .get_or_init(|| regex::Regex::new(r"<[^>]*>").expect("static fallback pattern"))
}

/// Translate a question into source-appropriate search terms: question
/// words removed, proper nouns and technical tokens extracted, capped at 5
pub fn clean_search_terms(question: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();

    let stripped = question_words().replace_all(question, " ");
    let cleaned: String = stripped
        .chars()
        .map(|c| if c.is_alphanumeric() || c == ' ' || c == '-' { c } else { ' ' })
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if !cleaned.is_empty() {
        terms.push(cleaned);
    }

    // Proper-noun phrases
    for m in proper_nouns().find_iter(question) {
        if m.as_str().len() > 3 {
            terms.push(m.as_str().to_string());
        }
    }

    // CamelCase, hyphenated terms, acronyms
    for pattern in technical_terms() {
        for m in pattern.find_iter(question) {
            terms.push(m.as_str().to_string());
        }
    }

    let mut unique = Vec::new();
    for term in terms {
        if term.len() > 2 && !unique.contains(&term) {
            unique.push(term);
        }
    }
    unique.truncate(5);
    unique
}

/// One raw hit from the provider before synthesis
#[derive(Debug, Clone)]
struct RawHit {
    title: String,
    url: String,
    body: String,
    rank: usize,
}

/// Wikipedia-backed external source
pub struct WikipediaClient {
    client: reqwest::Client,
    config: FallbackConfig,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct WikiSearchResponse {
    query: Option<WikiSearchQuery>,
}

#[derive(Debug, Deserialize)]
struct WikiSearchQuery {
    search: Vec<WikiSearchHit>,
}

#[derive(Debug, Deserialize)]
struct WikiSearchHit {
    title: String,
}

#[derive(Debug, Deserialize)]
struct WikiSummaryResponse {
    title: String,
    extract: String,
    #[serde(default)]
    content_urls: Option<WikiContentUrls>,
}

#[derive(Debug, Deserialize)]
struct WikiContentUrls {
    desktop: Option<WikiDesktopUrls>,
}

#[derive(Debug, Deserialize)]
struct WikiDesktopUrls {
    page: Option<String>,
}

impl WikipediaClient {
    pub fn new(config: FallbackConfig) -> Result<Self> {
        Self::with_base_url(config, "https://en.wikipedia.org")
    }

    /// Point the client at a different server; used by tests
    pub fn with_base_url(config: FallbackConfig, api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("docqa/0.3 (+https://github.com/engunity-ai/docqa)")
            .build()
            .map_err(|e| EngineError::DependencyUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            config,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn search_titles(&self, term: &str) -> Result<Vec<String>> {
        let url = format!("{}/w/api.php", self.api_base);
        let response = timeout(
            Duration::from_secs(self.config.search_timeout_secs),
            self.client
                .get(&url)
                .query(&[
                    ("action", "query"),
                    ("format", "json"),
                    ("list", "search"),
                    ("srsearch", term),
                    ("srlimit", &self.config.max_results.to_string()),
                ])
                .send(),
        )
        .await
        .map_err(|_| EngineError::DependencyUnavailable("external search timed out".to_string()))?
        .map_err(|e| EngineError::DependencyUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::DependencyUnavailable(format!(
                "external search returned {}",
                response.status()
            )));
        }

        let body: WikiSearchResponse = response
            .json()
            .await
            .map_err(|e| EngineError::DependencyUnavailable(e.to_string()))?;

        Ok(body
            .query
            .map(|q| q.search.into_iter().map(|h| h.title).collect())
            .unwrap_or_default())
    }

    async fn fetch_summary(&self, title: &str) -> Result<RawHit> {
        let encoded: String = title
            .chars()
            .map(|c| if c == ' ' { '_' } else { c })
            .collect();
        let url = format!("{}/api/rest_v1/page/summary/{}", self.api_base, encoded);

        let response = timeout(
            Duration::from_secs(self.config.fetch_timeout_secs),
            self.client.get(&url).send(),
        )
        .await
        .map_err(|_| EngineError::DependencyUnavailable("content fetch timed out".to_string()))?
        .map_err(|e| EngineError::DependencyUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::DependencyUnavailable(format!(
                "summary fetch returned {}",
                response.status()
            )));
        }

        let body: WikiSummaryResponse = response
            .json()
            .await
            .map_err(|e| EngineError::DependencyUnavailable(e.to_string()))?;

        let page_url = body
            .content_urls
            .and_then(|c| c.desktop)
            .and_then(|d| d.page)
            .unwrap_or_default();

        Ok(RawHit {
            title: body.title,
            url: page_url,
            body: clean_content(&body.extract, self.config.content_size_cap),
            rank: 0,
        })
    }

    /// Title + body keyword overlap, trust-weighted domain score, rank decay
    fn score_hit(&self, question: &str, hit: &RawHit) -> f32 {
        let weights = self.config.score_weights;
        let query_tokens = query::token_bag(question);
        if query_tokens.is_empty() {
            return 0.0;
        }

        let title_tokens = query::token_bag(&hit.title);
        let body_tokens = query::token_bag(&hit.body);

        let title_overlap =
            query_tokens.intersection(&title_tokens).count() as f32 / query_tokens.len() as f32;
        let body_overlap =
            query_tokens.intersection(&body_tokens).count() as f32 / query_tokens.len() as f32;

        let trust = self.domain_trust(&hit.url);
        let rank_score = 1.0 / (1.0 + hit.rank as f32);

        (weights.title_overlap * title_overlap
            + weights.body_overlap * body_overlap
            + weights.domain_trust * trust
            + weights.rank * rank_score)
            .clamp(0.0, 1.0)
    }

    fn domain_trust(&self, url: &str) -> f32 {
        let host = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or("");
        self.config
            .domain_trust
            .iter()
            .find(|(domain, _)| host.ends_with(domain.as_str()))
            .map(|(_, weight)| *weight)
            // Wikipedia content is uniformly curated; neutral-high default
            .unwrap_or(0.8)
    }
}

#[async_trait]
impl ExternalSource for WikipediaClient {
    async fn search_and_answer(&self, question: &str) -> Result<ExternalAnswer> {
        let terms = clean_search_terms(question);
        if terms.is_empty() {
            return Ok(ExternalAnswer {
                text: String::new(),
                confidence: 0.0,
                sources: Vec::new(),
            });
        }

        // First term with any hits wins; later terms are fallbacks
        let mut titles = Vec::new();
        for term in &terms {
            match self.search_titles(term).await {
                Ok(found) if !found.is_empty() => {
                    debug!(term = %term, hits = found.len(), "external search succeeded");
                    titles = found;
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(term = %term, error = %e, "external search failed");
                    continue;
                }
            }
        }

        if titles.is_empty() {
            return Ok(ExternalAnswer {
                text: String::new(),
                confidence: 0.0,
                sources: Vec::new(),
            });
        }

        titles.truncate(self.config.max_results);
        let mut hits = Vec::new();
        for (rank, title) in titles.iter().enumerate() {
            match self.fetch_summary(title).await {
                Ok(mut hit) => {
                    hit.rank = rank;
                    if !hit.body.is_empty() {
                        hits.push(hit);
                    }
                }
                Err(e) => warn!(title = %title, error = %e, "summary fetch failed"),
            }
        }

        if hits.is_empty() {
            return Ok(ExternalAnswer {
                text: String::new(),
                confidence: 0.0,
                sources: Vec::new(),
            });
        }

        let mut scored: Vec<(f32, RawHit)> = hits
            .into_iter()
            .map(|hit| (self.score_hit(question, &hit), hit))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        // Dedup by title, keep the best-scored occurrence
        let mut seen = std::collections::HashSet::new();
        scored.retain(|(_, hit)| seen.insert(hit.title.clone()));

        let confidence = scored[0].0;
        let text = synthesize(&scored);
        let sources = scored
            .iter()
            .map(|(score, hit)| ExternalSourceRef {
                title: hit.title.clone(),
                url: hit.url.clone(),
                score: *score,
            })
            .collect();

        info!(
            sources = scored.len(),
            confidence, "external fallback produced an answer"
        );
        Ok(ExternalAnswer {
            text,
            confidence,
            sources,
        })
    }
}

/// Strip residual markup, collapse whitespace, enforce the size cap
fn clean_content(raw: &str, size_cap: usize) -> String {
    let no_tags = markup_tags().replace_all(raw, " ");
    let mut text = no_tags.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() > size_cap {
        text = text.chars().take(size_cap).collect();
        // Cut at the last sentence end so the cap never splits a sentence
        if let Some(pos) = text.rfind(['.', '!', '?']) {
            text.truncate(pos + 1);
        }
    }
    text
}

/// Build one reply with per-sentence provenance markers
fn synthesize(scored: &[(f32, RawHit)]) -> String {
    let mut parts = Vec::new();
    for (_, hit) in scored {
        let sentences: Vec<&str> = hit
            .body
            .split_inclusive(['.', '!', '?'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(3)
            .collect();
        if !sentences.is_empty() {
            parts.push(format!("{} [{}]", sentences.join(" "), hit.title));
        }
    }
    parts.join("\n\n")
}
