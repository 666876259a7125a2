//! Evaluation pipeline
//!
//! Produces one `ChallengeVerdict` per challenge for a project:
//! 1. Cache lookup per (project, challenge); hits skip everything below
//! 2. Persisted "already judged" re-check against the store
//! 3. Code retrieval (only when something is left to judge)
//! 4. Size check; oversized bundles are digested chunk by chunk
//! 5. Four dimension analyses run concurrently, each with its own retry
//! 6. Batched final synthesis for all pending challenges in one call
//! 7. Verdicts are cached
//!
//! Cache misses for the same key are single-flight within the process:
//! concurrent evaluations of one (project, challenge) wait on a per-key lock
//! and re-check the cache once they hold it.

pub mod cache;
pub mod prompts;

pub use cache::{cache_key, CacheError, MemoryCache, VerdictCache};

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::bundle::{BundleError, CodeRetrieval};
use crate::chunker::{estimate_tokens, ChunkAnalysis, ContentChunker, ProjectAnalysis};
use crate::config::{ChunkerConfig, PipelineConfig};
use crate::llm::{decode, LlmRequest, RequestExecutor, Structured};
use crate::storage::{StoreError, VerdictStore};
use crate::types::{Challenge, ChallengeVerdict, Dimension, DimensionResult, DimensionSet, Project};

use prompts::JUDGE_SYSTEM;

/// Review note recorded when a project exceeds the input ceiling
pub const TOO_LARGE_NOTE: &str =
    "Project Codebase is too large to be processed by the AI. Please review the project manually.";

const NO_SUMMARY: &str = "No summary available";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Project has no challenges to evaluate")]
    NoChallenges,
    #[error("Input too large: ~{tokens} tokens exceeds the {limit} token ceiling")]
    InputTooLarge { tokens: usize, limit: usize },
    #[error("Code retrieval failed: {0}")]
    Bundle(#[from] BundleError),
    #[error("Verdict store error: {0}")]
    Store(#[from] StoreError),
    #[error("Code preprocessing failed: {0}")]
    PreprocessFailed(String),
    #[error("{dimension} analysis failed: {reason}")]
    DimensionFailed { dimension: Dimension, reason: String },
    #[error("Final synthesis failed: {0}")]
    SynthesisFailed(String),
}

impl PipelineError {
    /// Whether running the same evaluation again can change the outcome
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::NoChallenges | PipelineError::InputTooLarge { .. }
        )
    }
}

/// What to do when a dimension exhausts its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Abort the whole evaluation
    Strict,
    /// Substitute a placeholder result and continue
    Degraded,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    /// Verdicts for every challenge that was not already judged, including cache hits
    pub verdicts: BTreeMap<String, ChallengeVerdict>,
    /// Challenge ids answered from the cache
    pub cache_hits: Vec<String>,
    /// Challenge ids skipped because the store already holds a verdict
    pub already_judged: Vec<String>,
    /// Merged chunk analysis when the source was digested
    pub analysis: Option<ProjectAnalysis>,
    /// Estimated size of the bundled source, when it was retrieved
    pub source_tokens: Option<usize>,
    /// SHA-256 of the judged source document
    pub source_fingerprint: Option<String>,
}

impl EvaluationOutcome {
    /// Ids of verdicts computed by this run
    pub fn computed(&self) -> Vec<&str> {
        self.verdicts
            .keys()
            .filter(|id| !self.cache_hits.contains(id))
            .map(String::as_str)
            .collect()
    }
}

/// Hex SHA-256 identifying the exact source that was judged
pub fn source_fingerprint(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// String value, or `field` of an object value
fn text_field(value: &Value, field: &str) -> Option<String> {
    let text = match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get(field).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }),
        _ => None,
    };
    text.filter(|t| !t.trim().is_empty())
}

/// Lenient score: numbers or numeric strings
fn score_field(value: &Value) -> Option<f64> {
    match value.get("score")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn build_digest(project: &Project, merged: &ProjectAnalysis, parts: &[(usize, ChunkAnalysis)], total: usize) -> String {
    let mut digest = format!(
        "# Technical digest of {}\n{}\n\n{}\n\nTechnologies: {}\n",
        project.name,
        merged.tagline,
        merged.description,
        merged.technologies.join(", ")
    );
    if !merged.features.is_empty() {
        digest.push_str("Features:\n");
        for feature in &merged.features {
            digest.push_str(&format!("- {}\n", feature));
        }
    }
    for (index, part) in parts {
        let body = if part.technical_digest.trim().is_empty() {
            part.description.trim()
        } else {
            part.technical_digest.trim()
        };
        digest.push_str(&format!("\n## Part {}/{}\n{}\n", index + 1, total, body));
    }
    digest
}

/// Per-key locks held for the duration of one evaluation
struct KeyLocks<'a> {
    registry: &'a DashMap<String, Arc<Mutex<()>>>,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for KeyLocks<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.keys {
            self.registry
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

pub struct EvaluationPipeline {
    executor: Arc<dyn RequestExecutor>,
    retrieval: Arc<dyn CodeRetrieval>,
    cache: Arc<dyn VerdictCache>,
    store: Option<Arc<dyn VerdictStore>>,
    chunker: ContentChunker,
    config: PipelineConfig,
    mode: FailureMode,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl EvaluationPipeline {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        retrieval: Arc<dyn CodeRetrieval>,
        cache: Arc<dyn VerdictCache>,
        config: PipelineConfig,
        chunker: ChunkerConfig,
    ) -> Self {
        let mode = if config.degraded_mode {
            FailureMode::Degraded
        } else {
            FailureMode::Strict
        };
        Self {
            executor,
            retrieval,
            cache,
            store: None,
            chunker: ContentChunker::new(chunker),
            config,
            mode,
            inflight: DashMap::new(),
        }
    }

    /// Re-check persisted state before recomputing
    pub fn with_store(mut self, store: Arc<dyn VerdictStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_mode(mut self, mode: FailureMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    /// Evaluate `project` against `challenges`, retrieving its code if needed
    pub async fn evaluate(&self, project: &Project, challenges: &[Challenge]) -> Result<EvaluationOutcome, PipelineError> {
        self.run(project, challenges, None).await
    }

    /// Evaluate against an already bundled source document
    pub async fn evaluate_document(
        &self,
        project: &Project,
        challenges: &[Challenge],
        document: &str,
    ) -> Result<EvaluationOutcome, PipelineError> {
        self.run(project, challenges, Some(document)).await
    }

    async fn lock_keys(&self, project: &Project, challenges: &[Challenge]) -> KeyLocks<'_> {
        // Sorted acquisition keeps overlapping evaluations deadlock-free
        let mut keys: Vec<String> = challenges.iter().map(|c| cache_key(&project.id, &c.id)).collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self
                .inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        KeyLocks {
            registry: &self.inflight,
            keys,
            guards,
        }
    }

    async fn cached(&self, key: &str) -> Option<ChallengeVerdict> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn run(
        &self,
        project: &Project,
        challenges: &[Challenge],
        document: Option<&str>,
    ) -> Result<EvaluationOutcome, PipelineError> {
        let mut seen = HashSet::new();
        let challenges: Vec<&Challenge> = challenges.iter().filter(|c| seen.insert(c.id.clone())).collect();
        if challenges.is_empty() {
            return Err(PipelineError::NoChallenges);
        }

        let owned: Vec<Challenge> = challenges.iter().map(|c| (*c).clone()).collect();
        let _locks = self.lock_keys(project, &owned).await;
        let mut outcome = EvaluationOutcome::default();

        let mut pending = Vec::new();
        for challenge in owned {
            match self.cached(&cache_key(&project.id, &challenge.id)).await {
                Some(verdict) => {
                    outcome.cache_hits.push(challenge.id.clone());
                    outcome.verdicts.insert(challenge.id, verdict);
                }
                None => pending.push(challenge),
            }
        }

        if !pending.is_empty() {
            if let Some(store) = &self.store {
                let ids: Vec<String> = pending.iter().map(|c| c.id.clone()).collect();
                let judged: HashSet<String> = store
                    .already_judged(&project.id, &ids)
                    .await?
                    .into_iter()
                    .filter(|s| s.judged)
                    .map(|s| s.challenge_id)
                    .collect();
                pending.retain(|c| !judged.contains(&c.id));
                outcome.already_judged = ids.into_iter().filter(|id| judged.contains(id)).collect();
            }
        }

        if pending.is_empty() {
            info!(
                "Project {}: nothing to judge ({} cached, {} already judged)",
                project.id,
                outcome.cache_hits.len(),
                outcome.already_judged.len()
            );
            return Ok(outcome);
        }

        let source = match document {
            Some(document) => Cow::Borrowed(document),
            None => {
                let bundle = self.retrieval.bundle_repository(&project.project_url).await?;
                Cow::Owned(bundle.read().await?)
            }
        };

        let verdicts = self.judge(project, &pending, &source, &mut outcome).await?;
        for (challenge_id, verdict) in verdicts {
            if let Err(e) = self.cache.set(&cache_key(&project.id, &challenge_id), &verdict).await {
                warn!("Cache write failed for {}/{}: {}", project.id, challenge_id, e);
            }
            outcome.verdicts.insert(challenge_id, verdict);
        }
        Ok(outcome)
    }

    async fn judge(
        &self,
        project: &Project,
        pending: &[Challenge],
        source: &str,
        outcome: &mut EvaluationOutcome,
    ) -> Result<BTreeMap<String, ChallengeVerdict>, PipelineError> {
        let tokens = estimate_tokens(source);
        outcome.source_tokens = Some(tokens);
        outcome.source_fingerprint = Some(source_fingerprint(source));
        if tokens > self.config.max_input_tokens {
            return Err(PipelineError::InputTooLarge {
                tokens,
                limit: self.config.max_input_tokens,
            });
        }

        let document: Cow<str> = if tokens > self.config.chunk_threshold_tokens {
            let (analysis, digest) = self.preprocess(project, pending, source).await?;
            outcome.analysis = Some(analysis);
            Cow::Owned(digest)
        } else {
            Cow::Borrowed(source)
        };

        info!(
            "Judging project {} for {} challenges (~{} tokens, mode={:?})",
            project.id,
            pending.len(),
            tokens,
            self.mode
        );

        let runs = Dimension::ALL.map(|d| self.run_dimension(d, project, pending, &document));
        let settled = join_all(runs).await;

        let mut by_dimension: HashMap<Dimension, BTreeMap<String, DimensionResult>> = HashMap::new();
        for (dimension, result) in Dimension::ALL.into_iter().zip(settled) {
            match result {
                Ok(results) => {
                    by_dimension.insert(dimension, results);
                }
                Err(e) if self.mode == FailureMode::Strict => return Err(e),
                Err(e) => {
                    warn!("Project {}: {}; continuing with placeholder", project.id, e);
                }
            }
        }

        let mut take = |dimension: Dimension, id: &str| {
            by_dimension
                .get_mut(&dimension)
                .and_then(|m| m.remove(id))
                .unwrap_or_else(DimensionResult::failed)
        };
        let mut sets = BTreeMap::new();
        for challenge in pending {
            let id = challenge.id.as_str();
            sets.insert(
                challenge.id.clone(),
                DimensionSet {
                    technical: take(Dimension::Technical, id),
                    ux: take(Dimension::Ux, id),
                    business: take(Dimension::Business, id),
                    innovation: take(Dimension::Innovation, id),
                },
            );
        }

        let mut finals = self.synthesize(project, &sets).await?;
        Ok(sets
            .into_iter()
            .map(|(id, dims)| {
                let final_result = finals.remove(&id).unwrap_or_else(DimensionResult::failed);
                (id, ChallengeVerdict::new(dims, final_result))
            })
            .collect())
    }

    async fn preprocess(
        &self,
        project: &Project,
        challenges: &[Challenge],
        source: &str,
    ) -> Result<(ProjectAnalysis, String), PipelineError> {
        let plan = self.chunker.plan(source, self.chunker.config().max_chunk_tokens);
        let total = plan.len();
        info!("Project {}: digesting source in {} chunks", project.id, total);

        let calls = plan.chunks().iter().enumerate().map(|(index, chunk)| async move {
            let prompt = prompts::chunk_analysis_prompt(project, challenges, chunk, index, total);
            let request = LlmRequest::new(prompt).with_system(JUDGE_SYSTEM).expect_json();
            match self.executor.execute(request).await {
                Ok(raw) => match decode::<ChunkAnalysis>(&raw) {
                    Structured::Parsed(analysis) => Some((index, analysis)),
                    Structured::Unstructured(_) => {
                        warn!("Chunk {}/{} of project {}: unparseable analysis", index + 1, total, project.id);
                        None
                    }
                },
                Err(e) => {
                    warn!("Chunk {}/{} of project {} failed: {}", index + 1, total, project.id, e);
                    None
                }
            }
        });

        let parts: Vec<(usize, ChunkAnalysis)> = join_all(calls).await.into_iter().flatten().collect();
        if parts.is_empty() {
            return Err(PipelineError::PreprocessFailed(format!("all {} chunks failed", total)));
        }

        let analyses: Vec<ChunkAnalysis> = parts.iter().map(|(_, a)| a.clone()).collect();
        let merged = self.chunker.merge_chunk_analyses(&analyses);
        let digest = build_digest(project, &merged, &parts, total);
        debug!(
            "Project {}: digest of {} parts, ~{} tokens",
            project.id,
            parts.len(),
            estimate_tokens(&digest)
        );
        Ok((merged, digest))
    }

    async fn analyze_once(
        &self,
        dimension: Dimension,
        prompt: &str,
        challenges: &[Challenge],
    ) -> Result<BTreeMap<String, String>, String> {
        let request = LlmRequest::new(prompt).with_system(JUDGE_SYSTEM).expect_json();
        let raw = self.executor.execute(request).await.map_err(|e| e.to_string())?;

        let Structured::Parsed(parsed) = decode::<HashMap<String, Value>>(&raw) else {
            return Err(format!("{} analysis was not a JSON object", dimension));
        };

        let mut analyses = BTreeMap::new();
        for challenge in challenges {
            let text = parsed
                .get(&challenge.id)
                .and_then(|v| text_field(v, "analysis"))
                .ok_or_else(|| format!("{} analysis missing challenge {}", dimension, challenge.id))?;
            analyses.insert(challenge.id.clone(), text);
        }
        Ok(analyses)
    }

    async fn run_dimension(
        &self,
        dimension: Dimension,
        project: &Project,
        challenges: &[Challenge],
        document: &str,
    ) -> Result<BTreeMap<String, DimensionResult>, PipelineError> {
        let prompt = prompts::dimension_prompt(dimension, project, challenges, document);
        let label = format!("{} analysis of project {}", dimension, project.id);

        let analyses = self
            .config
            .dimension_retry()
            .run(&label, |_| self.analyze_once(dimension, prompt.as_str(), challenges))
            .await
            .map_err(|reason| PipelineError::DimensionFailed { dimension, reason })?;

        debug!("Project {}: {} analysis done", project.id, dimension);
        Ok(self.summarize(dimension, &analyses).await)
    }

    /// Summary and score per analysis. Never fails: unusable output falls
    /// back to raw text with a score of 0.
    async fn summarize(
        &self,
        dimension: Dimension,
        analyses: &BTreeMap<String, String>,
    ) -> BTreeMap<String, DimensionResult> {
        let request = LlmRequest::new(prompts::summary_prompt(dimension, analyses)).expect_json();
        let raw = match self.executor.execute(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("{} summarization failed: {}", dimension, e);
                return analyses
                    .iter()
                    .map(|(id, text)| (id.clone(), DimensionResult::new(text.clone(), text.clone(), 0.0)))
                    .collect();
            }
        };

        match decode::<HashMap<String, Value>>(&raw) {
            Structured::Parsed(entries) => analyses
                .iter()
                .map(|(id, text)| {
                    let entry = entries.get(id);
                    let summary = entry
                        .and_then(|e| text_field(e, "summary"))
                        .unwrap_or_else(|| NO_SUMMARY.to_string());
                    let score = entry.and_then(score_field).unwrap_or(0.0);
                    (id.clone(), DimensionResult::new(text.clone(), summary, score))
                })
                .collect(),
            Structured::Unstructured(raw) => {
                debug!("{} summary was unstructured; using raw text", dimension);
                analyses
                    .iter()
                    .map(|(id, text)| (id.clone(), DimensionResult::new(text.clone(), raw.clone(), 0.0)))
                    .collect()
            }
        }
    }

    /// One batched call for every challenge. The final score is the local
    /// weighted score; the model contributes the written review.
    async fn synthesize(
        &self,
        project: &Project,
        sets: &BTreeMap<String, DimensionSet>,
    ) -> Result<BTreeMap<String, DimensionResult>, PipelineError> {
        let prompt = prompts::synthesis_prompt(project, sets);
        let label = format!("final synthesis of project {}", project.id);

        let prompt = prompt.as_str();
        let response = self
            .config
            .dimension_retry()
            .run(&label, |_| async move {
                let request = LlmRequest::new(prompt).with_system(JUDGE_SYSTEM).expect_json();
                let raw = self.executor.execute(request).await.map_err(|e| e.to_string())?;
                decode::<HashMap<String, Value>>(&raw)
                    .parsed()
                    .ok_or_else(|| "final synthesis was not a JSON object".to_string())
            })
            .await;

        let mut finals = BTreeMap::new();
        for (id, dims) in sets {
            let score = round2(dims.weighted_score());
            let entry = response.as_ref().ok().and_then(|m| m.get(id));
            let analysis = entry.and_then(|e| text_field(e, "analysis"));

            let result = match (analysis, &response) {
                (Some(analysis), _) => {
                    let summary = entry
                        .and_then(|e| text_field(e, "summary"))
                        .unwrap_or_else(|| NO_SUMMARY.to_string());
                    DimensionResult::new(
                        format!("{}\n\nThe final score is - {:.2}", analysis.trim(), score),
                        summary,
                        score,
                    )
                }
                (None, response) if self.mode == FailureMode::Strict => {
                    let reason = match response {
                        Err(e) => e.clone(),
                        Ok(_) => format!("no final review for challenge {}", id),
                    };
                    return Err(PipelineError::SynthesisFailed(reason));
                }
                (None, _) => {
                    warn!("Project {}: no final review for challenge {}; using weighted score", project.id, id);
                    let mut placeholder = DimensionResult::new(
                        format!("The final score is - {:.2}", score),
                        "Final review unavailable; score computed from dimension weights",
                        score,
                    );
                    placeholder.degraded = true;
                    placeholder
                }
            };
            finals.insert(id.clone(), result);
        }
        Ok(finals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_field_accepts_string_or_object() {
        assert_eq!(text_field(&json!("plain"), "analysis"), Some("plain".into()));
        assert_eq!(
            text_field(&json!({"analysis": "nested"}), "analysis"),
            Some("nested".into())
        );
        assert_eq!(text_field(&json!({"other": "x"}), "analysis"), None);
        assert_eq!(text_field(&json!("  "), "analysis"), None);
    }

    #[test]
    fn test_score_field_is_lenient() {
        assert_eq!(score_field(&json!({"score": 7})), Some(7.0));
        assert_eq!(score_field(&json!({"score": "6.5"})), Some(6.5));
        assert_eq!(score_field(&json!({"score": null})), None);
        assert_eq!(score_field(&json!("7")), None);
    }

    #[test]
    fn test_source_fingerprint_is_stable() {
        let a = source_fingerprint("<file>main.rs</file>");
        assert_eq!(a.len(), 64);
        assert_eq!(a, source_fingerprint("<file>main.rs</file>"));
        assert_ne!(a, source_fingerprint("<file>lib.rs</file>"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!PipelineError::InputTooLarge { tokens: 10, limit: 5 }.is_retryable());
        assert!(!PipelineError::NoChallenges.is_retryable());
        assert!(PipelineError::SynthesisFailed("x".into()).is_retryable());
    }

    #[test]
    fn test_digest_labels_parts() {
        let project = Project {
            id: "p".into(),
            name: "Orbit".into(),
            description: String::new(),
            project_url: String::new(),
            hackathon: Default::default(),
            challenges: vec![],
            code_type: None,
        };
        let parts = vec![
            (
                0,
                ChunkAnalysis {
                    technical_digest: "axum server".into(),
                    ..Default::default()
                },
            ),
            (
                2,
                ChunkAnalysis {
                    description: "react frontend".into(),
                    ..Default::default()
                },
            ),
        ];
        let merged = ContentChunker::default().merge_chunk_analyses(&[parts[0].1.clone(), parts[1].1.clone()]);
        let digest = build_digest(&project, &merged, &parts, 3);
        assert!(digest.contains("## Part 1/3\naxum server"));
        assert!(digest.contains("## Part 3/3\nreact frontend"));
    }
}
