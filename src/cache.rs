//! Adaptive cache and learning loop
//!
//! Learns from repeated interactions so common questions can be served
//! instantly. Three tables, each keyed by query fingerprint: question stats
//! (hit counts, keywords, latency samples), response feedback (votes per
//! canonical answer), and promoted entries (serving-eligible answers).
//!
//! An entry may serve iff `hit_count >= promotion_threshold`,
//! `positive_votes >= negative_votes`, and its canonical answer passed the
//! quality gate at promotion time. Updates land in memory synchronously and
//! flush to SQLite every `flush_every` interactions or on shutdown; a crash
//! loses at most the last unflushed batch.

use crate::config::CacheConfig;
use crate::error::{EngineError, Result};
use crate::query;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 1;
const MAX_LATENCY_SAMPLES: usize = 32;

/// Mutable per-fingerprint learning state
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryState {
    fingerprint: String,
    canonical_question: String,
    canonical_answer: String,
    canonical_confidence: f32,
    keywords: Vec<String>,
    hit_count: u64,
    positive_votes: u64,
    negative_votes: u64,
    gate_passed: bool,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    latency_samples_ms: Vec<u64>,
}

impl EntryState {
    fn avg_latency_ms(&self) -> f64 {
        if self.latency_samples_ms.is_empty() {
            return 0.0;
        }
        self.latency_samples_ms.iter().sum::<u64>() as f64 / self.latency_samples_ms.len() as f64
    }
}

/// Public snapshot of a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub canonical_question: String,
    pub canonical_answer: String,
    pub canonical_confidence: f32,
    pub hit_count: u64,
    pub positive_votes: u64,
    pub negative_votes: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub avg_latency_ms: f64,
}

/// A serving-path lookup hit
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    /// True for an exact fingerprint match; false for the keyword path
    pub exact: bool,
    /// Keyword Jaccard similarity that selected the entry (1.0 when exact)
    pub keyword_similarity: f32,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveCacheStats {
    pub tracked_questions: usize,
    pub promoted_entries: usize,
    pub interactions: u64,
    pub flushes: u64,
}

/// Adaptive cache shared across request workers
pub struct AdaptiveCache {
    config: CacheConfig,
    pool: SqlitePool,
    /// Per-fingerprint state; the inner mutex gives single-writer updates
    /// per fingerprint without blocking unrelated entries
    entries: RwLock<HashMap<String, Arc<Mutex<EntryState>>>>,
    /// Serving-eligible set: many readers, occasional writer
    promoted: RwLock<HashMap<String, ()>>,
    interactions: AtomicU64,
    flushes: AtomicU64,
}

impl AdaptiveCache {
    /// Open the cache, creating tables and loading persisted state
    pub async fn open(database_url: &str, config: CacheConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS question_stats (
                fingerprint TEXT PRIMARY KEY,
                canonical_question TEXT NOT NULL,
                canonical_answer TEXT NOT NULL,
                canonical_confidence REAL NOT NULL,
                keywords TEXT NOT NULL,
                hit_count INTEGER NOT NULL,
                gate_passed INTEGER NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                latency_samples TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS response_feedback (
                fingerprint TEXT PRIMARY KEY,
                positive_votes INTEGER NOT NULL,
                negative_votes INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS promoted_entries (
                fingerprint TEXT PRIMARY KEY
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO cache_meta (key, value) VALUES ('schema_version', ?1)",
        )
        .bind(SCHEMA_VERSION)
        .execute(&pool)
        .await?;

        let cache = Self {
            config,
            pool,
            entries: RwLock::new(HashMap::new()),
            promoted: RwLock::new(HashMap::new()),
            interactions: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        };
        cache.load().await?;
        Ok(cache)
    }

    /// In-memory-backed cache for tests
    pub async fn in_memory(config: CacheConfig) -> Result<Self> {
        Self::open("sqlite::memory:", config).await
    }

    async fn load(&self) -> Result<()> {
        let rows = sqlx::query("SELECT * FROM question_stats")
            .fetch_all(&self.pool)
            .await?;

        let feedback_rows = sqlx::query("SELECT * FROM response_feedback")
            .fetch_all(&self.pool)
            .await?;
        let mut votes: HashMap<String, (u64, u64)> = HashMap::new();
        for row in feedback_rows {
            let fp: String = row.get("fingerprint");
            let pos: i64 = row.get("positive_votes");
            let neg: i64 = row.get("negative_votes");
            votes.insert(fp, (pos as u64, neg as u64));
        }

        let mut entries = self.entries.write().await;
        for row in rows {
            let fingerprint: String = row.get("fingerprint");
            let keywords: String = row.get("keywords");
            let latency: String = row.get("latency_samples");
            let first_seen: String = row.get("first_seen_at");
            let last_seen: String = row.get("last_seen_at");
            let (positive_votes, negative_votes) =
                votes.get(&fingerprint).copied().unwrap_or((0, 0));

            let state = EntryState {
                fingerprint: fingerprint.clone(),
                canonical_question: row.get("canonical_question"),
                canonical_answer: row.get("canonical_answer"),
                canonical_confidence: row.get::<f64, _>("canonical_confidence") as f32,
                keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                hit_count: row.get::<i64, _>("hit_count") as u64,
                positive_votes,
                negative_votes,
                gate_passed: row.get::<i64, _>("gate_passed") != 0,
                first_seen_at: parse_time(&first_seen),
                last_seen_at: parse_time(&last_seen),
                latency_samples_ms: serde_json::from_str(&latency).unwrap_or_default(),
            };
            entries.insert(fingerprint, Arc::new(Mutex::new(state)));
        }

        let promoted_rows = sqlx::query("SELECT fingerprint FROM promoted_entries")
            .fetch_all(&self.pool)
            .await?;
        let mut promoted = self.promoted.write().await;
        for row in promoted_rows {
            promoted.insert(row.get("fingerprint"), ());
        }

        info!(
            tracked = entries.len(),
            promoted = promoted.len(),
            "adaptive cache loaded"
        );
        Ok(())
    }

    /// Record one completed interaction; called exactly once per request
    ///
    /// Lock order is always entry mutex first, released before touching the
    /// promoted set; no lock is held across the disk flush.
    pub async fn record_interaction(
        &self,
        fingerprint: &str,
        question: &str,
        answer: &str,
        confidence: f32,
        latency_ms: u64,
        passed_gate: bool,
    ) -> Result<()> {
        let entry = self.entry_handle(fingerprint, question).await;
        let eligible = {
            let mut state = entry.lock().await;
            state.hit_count += 1;
            state.last_seen_at = Utc::now();
            state.canonical_question = question.to_string();
            state.canonical_answer = answer.to_string();
            state.canonical_confidence = confidence.clamp(0.0, 1.0);
            state.gate_passed = passed_gate;
            state.latency_samples_ms.push(latency_ms);
            if state.latency_samples_ms.len() > MAX_LATENCY_SAMPLES {
                state.latency_samples_ms.remove(0);
            }
            debug!(fingerprint, hits = state.hit_count, "recorded interaction");
            self.serving_eligible(&state)
        };
        self.apply_promotion(fingerprint, eligible).await;

        let count = self.interactions.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.config.flush_every == 0 {
            if let Err(e) = self.flush().await {
                // A failed flush must never fail the request
                warn!(error = %e, "cache flush failed");
            }
        }
        Ok(())
    }

    /// Record user feedback for a fingerprint and re-evaluate eligibility
    pub async fn record_feedback(&self, fingerprint: &str, positive: bool) -> Result<()> {
        let entry = {
            let entries = self.entries.read().await;
            match entries.get(fingerprint) {
                Some(entry) => Arc::clone(entry),
                None => return Ok(()),
            }
        };

        let (eligible, demote) = {
            let mut state = entry.lock().await;
            if positive {
                state.positive_votes += 1;
            } else {
                state.negative_votes += 1;
            }
            (
                self.serving_eligible(&state),
                state.negative_votes > state.positive_votes,
            )
        };

        if demote {
            let mut promoted = self.promoted.write().await;
            if promoted.remove(fingerprint).is_some() {
                info!(fingerprint, "entry demoted after negative feedback");
            }
        } else {
            self.apply_promotion(fingerprint, eligible).await;
        }
        Ok(())
    }

    async fn apply_promotion(&self, fingerprint: &str, eligible: bool) {
        if !eligible {
            return;
        }
        let mut promoted = self.promoted.write().await;
        if promoted.insert(fingerprint.to_string(), ()).is_none() {
            info!(fingerprint, "entry promoted");
        }
    }

    /// Serving-path lookup: exact fingerprint first, then keyword-Jaccard
    /// nearest neighbor over promoted canonical questions
    pub async fn lookup(&self, fingerprint: &str, keywords: &[String]) -> Option<CacheHit> {
        let promoted: Vec<String> = {
            let promoted = self.promoted.read().await;
            promoted.keys().cloned().collect()
        };

        let handles: Vec<(String, Arc<Mutex<EntryState>>)> = {
            let entries = self.entries.read().await;
            promoted
                .iter()
                .filter_map(|fp| entries.get(fp).map(|e| (fp.clone(), Arc::clone(e))))
                .collect()
        };

        if let Some((_, entry)) = handles.iter().find(|(fp, _)| fp == fingerprint) {
            let state = entry.lock().await;
            if self.serving_eligible(&state) {
                return Some(CacheHit {
                    entry: snapshot(&state),
                    exact: true,
                    keyword_similarity: 1.0,
                });
            }
        }

        let mut best: Option<(f32, CacheEntry)> = None;
        for (fp, entry) in &handles {
            if fp == fingerprint {
                continue;
            }
            let state = entry.lock().await;
            if !self.serving_eligible(&state) {
                continue;
            }
            let similarity = query::keyword_jaccard(keywords, &state.keywords);
            if similarity >= self.config.keyword_similarity
                && best.as_ref().map_or(true, |(s, _)| similarity > *s)
            {
                best = Some((similarity, snapshot(&state)));
            }
        }

        best.map(|(similarity, entry)| CacheHit {
            entry,
            exact: false,
            keyword_similarity: similarity,
        })
    }

    fn serving_eligible(&self, state: &EntryState) -> bool {
        state.hit_count >= self.config.promotion_threshold
            && state.positive_votes >= state.negative_votes
            && state.gate_passed
    }

    /// Demote everything; called when the embedding-model version changes
    pub async fn invalidate_all_promotions(&self) {
        let mut promoted = self.promoted.write().await;
        let removed = promoted.len();
        promoted.clear();
        if removed > 0 {
            info!(removed, "promotions invalidated by embedding version change");
        }
    }

    async fn entry_handle(&self, fingerprint: &str, question: &str) -> Arc<Mutex<EntryState>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(fingerprint) {
                return Arc::clone(entry);
            }
        }

        // Snapshot the promoted set before taking the entries write lock to
        // keep a single lock order across the cache
        let promoted: std::collections::HashSet<String> = {
            let promoted = self.promoted.read().await;
            promoted.keys().cloned().collect()
        };

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(fingerprint) {
            return Arc::clone(entry);
        }

        // Capacity bound: evict the least recently seen unpromoted entry
        if entries.len() >= self.config.capacity {
            let mut oldest: Option<(String, DateTime<Utc>)> = None;
            for (fp, entry) in entries.iter() {
                if promoted.contains(fp) {
                    continue;
                }
                if let Ok(state) = entry.try_lock() {
                    if oldest.as_ref().map_or(true, |(_, t)| state.last_seen_at < *t) {
                        oldest = Some((fp.clone(), state.last_seen_at));
                    }
                }
            }
            if let Some((fp, _)) = oldest {
                entries.remove(&fp);
                debug!(evicted = %fp, "cache capacity eviction");
            }
        }

        let now = Utc::now();
        let state = EntryState {
            fingerprint: fingerprint.to_string(),
            canonical_question: question.to_string(),
            canonical_answer: String::new(),
            canonical_confidence: 0.0,
            keywords: query::extract_keywords(&query::normalize(question)),
            hit_count: 0,
            positive_votes: 0,
            negative_votes: 0,
            gate_passed: false,
            first_seen_at: now,
            last_seen_at: now,
            latency_samples_ms: Vec::new(),
        };
        let entry = Arc::new(Mutex::new(state));
        entries.insert(fingerprint.to_string(), Arc::clone(&entry));
        entry
    }

    /// Write all three tables to disk
    pub async fn flush(&self) -> Result<()> {
        let entries = self.entries.read().await;
        let promoted = self.promoted.read().await;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM question_stats").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM response_feedback").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM promoted_entries").execute(&mut *tx).await?;

        for entry in entries.values() {
            let state = entry.lock().await;
            sqlx::query(
                r#"
                INSERT INTO question_stats
                    (fingerprint, canonical_question, canonical_answer,
                     canonical_confidence, keywords, hit_count, gate_passed,
                     first_seen_at, last_seen_at, latency_samples)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(&state.fingerprint)
            .bind(&state.canonical_question)
            .bind(&state.canonical_answer)
            .bind(state.canonical_confidence as f64)
            .bind(serde_json::to_string(&state.keywords)?)
            .bind(state.hit_count as i64)
            .bind(state.gate_passed as i64)
            .bind(state.first_seen_at.to_rfc3339())
            .bind(state.last_seen_at.to_rfc3339())
            .bind(serde_json::to_string(&state.latency_samples_ms)?)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO response_feedback (fingerprint, positive_votes, negative_votes) \
                 VALUES (?1, ?2, ?3)",
            )
            .bind(&state.fingerprint)
            .bind(state.positive_votes as i64)
            .bind(state.negative_votes as i64)
            .execute(&mut *tx)
            .await?;
        }

        for fp in promoted.keys() {
            sqlx::query("INSERT INTO promoted_entries (fingerprint) VALUES (?1)")
                .bind(fp)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!(entries = entries.len(), "cache flushed to disk");
        Ok(())
    }

    /// Flush on graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        self.flush().await
    }

    /// Cache statistics
    pub async fn stats(&self) -> AdaptiveCacheStats {
        AdaptiveCacheStats {
            tracked_questions: self.entries.read().await.len(),
            promoted_entries: self.promoted.read().await.len(),
            interactions: self.interactions.load(Ordering::SeqCst),
            flushes: self.flushes.load(Ordering::SeqCst),
        }
    }

    /// Snapshot one entry, if tracked
    pub async fn entry(&self, fingerprint: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        let entry = entries.get(fingerprint)?;
        let state = entry.lock().await;
        Some(snapshot(&state))
    }
}

fn snapshot(state: &EntryState) -> CacheEntry {
    CacheEntry {
        fingerprint: state.fingerprint.clone(),
        canonical_question: state.canonical_question.clone(),
        canonical_answer: state.canonical_answer.clone(),
        canonical_confidence: state.canonical_confidence,
        hit_count: state.hit_count,
        positive_votes: state.positive_votes,
        negative_votes: state.negative_votes,
        first_seen_at: state.first_seen_at,
        last_seen_at: state.last_seen_at,
        avg_latency_ms: state.avg_latency_ms(),
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
