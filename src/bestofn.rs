//! Best-of-N candidate generation and scoring
//!
//! N generator invocations run concurrently with distinct sampling
//! parameters drawn from a fixed schedule, so total latency tracks the
//! slowest single generation. Each candidate is scored on perplexity,
//! relevance, and quality; the weighted final score picks the winner with
//! deterministic tie-breaks (quality, then sampling seed).

use crate::config::GenerationConfig;
use crate::error::{EngineError, ModelError, Result};
use crate::model::{Generator, SamplingParams};
use crate::query;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Component scores for one candidate
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CandidateScores {
    pub perplexity: f32,
    pub relevance: f32,
    pub quality: f32,
    pub final_score: f32,
}

/// One generation trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    /// Raw sequence perplexity, when the generator reported log-probs
    pub raw_perplexity: Option<f64>,
    pub sampling: SamplingParams,
    pub scores: CandidateScores,
    /// Position after sorting by final score descending
    pub rank: usize,
}

/// Scores candidates against the query and assembled context
pub struct CandidateScorer<'a> {
    config: &'a GenerationConfig,
    banned_prefixes: &'a [String],
}

const COMPLETENESS_INDICATORS: &[&str] = &[
    "because",
    "therefore",
    "however",
    "additionally",
    "furthermore",
    "specifically",
    "for example",
    "such as",
];

impl<'a> CandidateScorer<'a> {
    pub fn new(config: &'a GenerationConfig, banned_prefixes: &'a [String]) -> Self {
        Self {
            config,
            banned_prefixes,
        }
    }

    /// Perplexity mapped into (0, 1]: `1 / (1 + ppl / 10)`; 0.5 when the
    /// generator reported no log-probs
    pub fn perplexity_score(&self, raw_perplexity: Option<f64>) -> f32 {
        match raw_perplexity {
            Some(ppl) => (1.0 / (1.0 + ppl / 10.0)) as f32,
            None => 0.5,
        }
    }

    /// Keyword overlap with the query, context-use overlap, and a bonus for
    /// explicit grounding phrases
    pub fn relevance_score(&self, question: &str, answer: &str, context: &str) -> f32 {
        let query_tokens = query::token_bag(question);
        let answer_tokens = query::token_bag(answer);

        let keyword_overlap = if query_tokens.is_empty() {
            0.0
        } else {
            query_tokens.intersection(&answer_tokens).count() as f32 / query_tokens.len() as f32
        };

        let context_tokens = query::token_bag(context);
        let context_use = if context_tokens.is_empty() || answer_tokens.is_empty() {
            0.0
        } else {
            let shared = answer_tokens.intersection(&context_tokens).count() as f32;
            shared / answer_tokens.len().min(context_tokens.len()) as f32
        };

        let answer_lower = answer.to_lowercase();
        let grounding: f32 = self
            .config
            .grounding_phrases
            .iter()
            .filter(|phrase| answer_lower.contains(phrase.to_lowercase().as_str()))
            .map(|_| 0.2)
            .sum::<f32>()
            .min(1.0);

        (keyword_overlap * 0.4 + context_use * 0.4 + grounding * 0.2).min(1.0)
    }

    /// Length band, sentence and structure markers, banned-prefix absence,
    /// completeness indicators
    pub fn quality_score(&self, answer: &str) -> f32 {
        let mut score = 0.0;

        let length = answer.chars().count();
        if (50..=2000).contains(&length) {
            score += 0.3;
        } else if (20..50).contains(&length) {
            score += 0.1;
        }

        if answer.contains('.') {
            score += 0.2;
        }

        if answer.contains('\n') || answer.contains("**") || answer.contains("- ") {
            score += 0.1;
        }

        let trimmed = answer.trim_start();
        let banned = self
            .banned_prefixes
            .iter()
            .any(|prefix| trimmed.to_lowercase().starts_with(prefix.to_lowercase().as_str()));
        if !banned {
            score += 0.2;
        }

        let answer_lower = answer.to_lowercase();
        let indicators = COMPLETENESS_INDICATORS
            .iter()
            .filter(|w| answer_lower.contains(*w))
            .count() as f32;
        score += (indicators * 0.05).min(0.2);

        score.min(1.0)
    }

    /// Fill in all scores for a candidate
    pub fn score(&self, candidate: &mut Candidate, question: &str, context: &str) {
        let w = self.config.weights;
        let perplexity = self.perplexity_score(candidate.raw_perplexity);
        let relevance = self.relevance_score(question, &candidate.text, context);
        let quality = self.quality_score(&candidate.text);

        candidate.scores = CandidateScores {
            perplexity,
            relevance,
            quality,
            final_score: w.perplexity * perplexity + w.relevance * relevance + w.quality * quality,
        };
    }
}

/// Sort candidates best-first and assign ranks; ties break on quality score
/// and then on sampling seed for determinism
pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.scores
            .final_score
            .partial_cmp(&a.scores.final_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.scores
                    .quality
                    .partial_cmp(&a.scores.quality)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.sampling.seed.cmp(&b.sampling.seed))
    });
    for (rank, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = rank;
    }
}

/// Best-of-N generation driver
pub struct BestOfN {
    generator: Arc<dyn Generator>,
    config: GenerationConfig,
    per_call_deadline: Duration,
}

impl BestOfN {
    pub fn new(
        generator: Arc<dyn Generator>,
        config: GenerationConfig,
        per_call_deadline: Duration,
    ) -> Self {
        Self {
            generator,
            config,
            per_call_deadline,
        }
    }

    /// The sampling parameters for an n-candidate run: the fixed schedule,
    /// cycled, with the position as the deterministic seed
    pub fn schedule(&self, n: usize) -> Vec<SamplingParams> {
        (0..n)
            .map(|i| {
                let (temperature, top_p) =
                    self.config.sampling_schedule[i % self.config.sampling_schedule.len()];
                SamplingParams::new(temperature, top_p, i as u32, self.config.max_tokens)
            })
            .collect()
    }

    /// Generate and score `n` candidates concurrently
    ///
    /// Individual failures drop that candidate; the call errors only when
    /// every candidate fails. Candidates are scored after all generations
    /// finish and returned best-first.
    pub async fn run(
        &self,
        question: &str,
        prompt: &str,
        context: &str,
        n: usize,
        banned_prefixes: &[String],
    ) -> Result<Vec<Candidate>> {
        let mut tasks: JoinSet<std::result::Result<Candidate, EngineError>> = JoinSet::new();

        for params in self.schedule(n) {
            let generator = Arc::clone(&self.generator);
            let prompt = prompt.to_string();
            let deadline = self.per_call_deadline;
            tasks.spawn(async move {
                let output = tokio::time::timeout(deadline, generator.generate(&prompt, params))
                    .await
                    .map_err(|_| EngineError::Model(ModelError::Timeout))??;
                Ok(Candidate {
                    raw_perplexity: output.perplexity(),
                    text: output.text,
                    sampling: params,
                    scores: CandidateScores::default(),
                    rank: 0,
                })
            });
        }

        let mut candidates = Vec::with_capacity(n);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(candidate)) => candidates.push(candidate),
                Ok(Err(e)) => warn!(error = %e, "candidate generation failed, dropping"),
                Err(e) => warn!(error = %e, "candidate task panicked, dropping"),
            }
        }

        if candidates.is_empty() {
            return Err(ModelError::AllCandidatesFailed.into());
        }

        // Scores are assigned only after all generations finish
        let scorer = CandidateScorer::new(&self.config, banned_prefixes);
        for candidate in &mut candidates {
            scorer.score(candidate, question, context);
        }
        rank_candidates(&mut candidates);

        debug!(
            generated = candidates.len(),
            requested = n,
            best_score = candidates[0].scores.final_score,
            "best-of-n complete"
        );
        Ok(candidates)
    }
}

/// Build the grounded answering prompt from the condensed context
pub fn build_prompt(question: &str, context_sections: &[String]) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant that answers questions using only the provided context.\n\n",
    );
    if context_sections.is_empty() {
        prompt.push_str("No context is available for this question.\n");
    } else {
        prompt.push_str("Context:\n");
        for (i, section) in context_sections.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", i + 1, section));
        }
    }
    prompt.push_str(&format!(
        "\nQuestion: {question}\n\n\
         Answer clearly and concisely. If the context does not contain the \
         answer, say so.\nAnswer:"
    ));
    prompt
}

/// Prompt for condensing one passage to 2-3 query-relevant sentences
pub fn condense_prompt(question: &str, passage: &str) -> String {
    format!(
        "Summarize the following passage in 2-3 sentences, keeping only facts \
         relevant to the question.\n\nQuestion: {question}\n\nPassage:\n{passage}\n\nSummary:"
    )
}
