//! Evaluation pipeline integration tests
//!
//! Drive `EvaluationPipeline` end to end with a scripted executor, an
//! in-memory cache and an in-memory verdict store.

mod common;

use common::{project, BrokenRetrieval, ScriptedExecutor, StaticRetrieval};
use judge_engine::config::{ChunkerConfig, PipelineConfig};
use judge_engine::{
    Challenge, Dimension, DimensionResult, EvaluationPipeline, FailureMode, LocalVerdictStore,
    MemoryCache, PipelineError, VerdictStore,
};
use std::sync::Arc;
use std::time::Duration;

const DOCUMENT: &str = "<file path=\"src/main.rs\">fn main() { println!(\"hello\"); }</file>";

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        dimension_backoff_ms: 1,
        ..Default::default()
    }
}

fn pipeline_with(
    executor: Arc<ScriptedExecutor>,
    retrieval: Arc<StaticRetrieval>,
    config: PipelineConfig,
    chunker: ChunkerConfig,
) -> EvaluationPipeline {
    EvaluationPipeline::new(
        executor,
        retrieval,
        Arc::new(MemoryCache::new(Duration::from_secs(3600))),
        config,
        chunker,
    )
}

fn pipeline(executor: Arc<ScriptedExecutor>) -> EvaluationPipeline {
    pipeline_with(
        executor,
        Arc::new(StaticRetrieval::new(DOCUMENT)),
        fast_config(),
        ChunkerConfig::default(),
    )
}

fn challenges(p: &judge_engine::Project) -> Vec<Challenge> {
    p.challenges.clone()
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ============================================================================
// VERDICTS
// ============================================================================

#[tokio::test]
async fn test_verdict_per_challenge_with_weighted_final() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1", "c2"]));
    let p = project("42", &["c1", "c2"]);
    let outcome = pipeline(executor.clone())
        .evaluate_document(&p, &challenges(&p), DOCUMENT)
        .await
        .unwrap();

    assert_eq!(outcome.verdicts.len(), 2);
    let verdict = &outcome.verdicts["c1"];
    assert!(approx(verdict.dimensions.technical.score, 8.0));
    assert!(approx(verdict.dimensions.ux.score, 6.0));
    assert_eq!(verdict.dimensions.technical.summary, "Short summary");
    assert!(verdict
        .dimensions
        .get(Dimension::Business)
        .full_analysis
        .contains("Business Potential analysis for challenge c1"));

    assert!(approx(verdict.score(), 7.2));
    assert!(verdict.final_result.full_analysis.starts_with("Final review for c1"));
    assert!(verdict.final_result.full_analysis.ends_with("The final score is - 7.20"));
    assert!(!verdict.is_degraded());

    // 4 analyses + 4 summaries + 1 synthesis, shared by both challenges
    assert_eq!(executor.calls(), 9);
    assert_eq!(outcome.source_tokens, Some(judge_engine::estimate_tokens(DOCUMENT)));
    assert!(outcome.source_fingerprint.is_some());
}

#[tokio::test]
async fn test_no_challenges_is_rejected() {
    let executor = Arc::new(ScriptedExecutor::new(&[]));
    let p = project("1", &[]);
    let err = pipeline(executor).evaluate(&p, &[]).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoChallenges));
}

// ============================================================================
// CACHE AND PERSISTED STATE
// ============================================================================

#[tokio::test]
async fn test_second_evaluation_is_served_from_cache() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1"]));
    let retrieval = Arc::new(StaticRetrieval::new(DOCUMENT));
    let pipeline = pipeline_with(executor.clone(), retrieval.clone(), fast_config(), ChunkerConfig::default());
    let p = project("7", &["c1"]);

    let first = pipeline.evaluate(&p, &challenges(&p)).await.unwrap();
    let calls = executor.calls();
    assert!(calls > 0);
    assert_eq!(retrieval.calls(), 1);
    assert_eq!(first.computed(), vec!["c1"]);

    let second = pipeline.evaluate(&p, &challenges(&p)).await.unwrap();
    assert_eq!(executor.calls(), calls);
    assert_eq!(retrieval.calls(), 1);
    assert_eq!(second.cache_hits, vec!["c1".to_string()]);
    assert_eq!(second.verdicts["c1"], first.verdicts["c1"]);
    assert!(second.computed().is_empty());
}

#[tokio::test]
async fn test_already_judged_challenges_are_skipped() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1", "c2"]));
    let store = Arc::new(LocalVerdictStore::in_memory().unwrap());
    let p = project("9", &["c1", "c2"]);

    let seeded = pipeline(Arc::new(ScriptedExecutor::new(&["c1"])))
        .evaluate_document(&p, &challenges(&p)[..1], DOCUMENT)
        .await
        .unwrap();
    store.upsert_verdict("9", "c1", &seeded.verdicts["c1"]).await.unwrap();

    let outcome = pipeline(executor.clone())
        .with_store(store)
        .evaluate_document(&p, &challenges(&p), DOCUMENT)
        .await
        .unwrap();

    assert_eq!(outcome.already_judged, vec!["c1".to_string()]);
    assert_eq!(outcome.verdicts.keys().collect::<Vec<_>>(), vec!["c2"]);
    // Only c2 appears in the synthesis prompt
    assert_eq!(executor.prompts_containing("<challenge id=\"c1\">"), 0);
    assert_eq!(executor.prompts_containing("<challenge id=\"c2\">"), 1);
}

#[tokio::test]
async fn test_concurrent_evaluations_compute_once() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1"]).with_delay(Duration::from_millis(10)));
    let pipeline = Arc::new(pipeline(executor.clone()));
    let p = project("5", &["c1"]);
    let list = challenges(&p);

    let (a, b) = tokio::join!(pipeline.evaluate(&p, &list), pipeline.evaluate(&p, &list));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(executor.analysis_calls("Innovation"), 1);
    assert_eq!(a.cache_hits.len() + b.cache_hits.len(), 1);
    assert_eq!(a.verdicts["c1"], b.verdicts["c1"]);
}

// ============================================================================
// PARTIAL FAILURE
// ============================================================================

#[tokio::test]
async fn test_degraded_mode_substitutes_failed_dimension() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1"]).failing("User Experience"));
    let p = project("3", &["c1"]);
    let outcome = pipeline(executor.clone())
        .evaluate_document(&p, &challenges(&p), DOCUMENT)
        .await
        .unwrap();

    let verdict = &outcome.verdicts["c1"];
    assert_eq!(verdict.dimensions.ux, DimensionResult::failed());
    assert!(approx(verdict.dimensions.technical.score, 8.0));
    // 8 * 0.3 + 0 * 0.2 + 6 * 0.2 + 8 * 0.3
    assert!(approx(verdict.score(), 6.0));
    assert!(verdict.is_degraded());
    assert_eq!(executor.analysis_calls("User Experience"), 3);
    assert_eq!(executor.analysis_calls("Technical Implementation"), 1);
}

#[tokio::test]
async fn test_strict_mode_aborts_on_failed_dimension() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1"]).failing("Business Potential"));
    let p = project("3", &["c1"]);
    let pipeline = pipeline(executor.clone()).with_mode(FailureMode::Strict);

    let err = pipeline
        .evaluate_document(&p, &challenges(&p), DOCUMENT)
        .await
        .unwrap_err();
    match err {
        PipelineError::DimensionFailed { dimension, .. } => assert_eq!(dimension, Dimension::Business),
        other => panic!("unexpected error: {}", other),
    }
    assert!(executor.prompts_containing("<assessments") == 0);
}

#[tokio::test]
async fn test_unstructured_summary_keeps_raw_text() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1"]).summary_text("Looks solid overall, 7/10"));
    let p = project("4", &["c1"]);
    let outcome = pipeline(executor)
        .evaluate_document(&p, &challenges(&p), DOCUMENT)
        .await
        .unwrap();

    let technical = &outcome.verdicts["c1"].dimensions.technical;
    assert_eq!(technical.summary, "Looks solid overall, 7/10");
    assert_eq!(technical.score, 0.0);
    assert!(!technical.degraded);
}

#[tokio::test]
async fn test_synthesis_failure_falls_back_to_weighted_score() {
    let p = project("6", &["c1"]);

    let executor = Arc::new(ScriptedExecutor::new(&["c1"]).failing_synthesis());
    let outcome = pipeline(executor.clone())
        .evaluate_document(&p, &challenges(&p), DOCUMENT)
        .await
        .unwrap();
    let final_result = &outcome.verdicts["c1"].final_result;
    assert!(final_result.degraded);
    assert!(approx(final_result.score, 7.2));
    assert_eq!(executor.prompts_containing("<assessments"), 3);

    let strict = pipeline(Arc::new(ScriptedExecutor::new(&["c1"]).failing_synthesis())).with_mode(FailureMode::Strict);
    let err = strict
        .evaluate_document(&p, &challenges(&p), DOCUMENT)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SynthesisFailed(_)));
}

#[tokio::test]
async fn test_retrieval_failure_is_retryable() {
    let pipeline = EvaluationPipeline::new(
        Arc::new(ScriptedExecutor::new(&["c1"])),
        Arc::new(BrokenRetrieval),
        Arc::new(MemoryCache::new(Duration::from_secs(60))),
        fast_config(),
        ChunkerConfig::default(),
    );
    let p = project("8", &["c1"]);
    let err = pipeline.evaluate(&p, &challenges(&p)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Bundle(_)));
    assert!(err.is_retryable());
}

// ============================================================================
// OVERSIZED INPUT
// ============================================================================

#[tokio::test]
async fn test_input_over_ceiling_is_rejected_without_calls() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1"]));
    let config = PipelineConfig {
        max_input_tokens: 10,
        ..fast_config()
    };
    let pipeline = pipeline_with(
        executor.clone(),
        Arc::new(StaticRetrieval::new(DOCUMENT)),
        config,
        ChunkerConfig::default(),
    );
    let p = project("10", &["c1"]);

    let err = pipeline
        .evaluate_document(&p, &challenges(&p), &"x".repeat(100))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InputTooLarge { tokens: 25, limit: 10 }));
    assert!(!err.is_retryable());
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_oversized_document_is_digested_per_chunk() {
    let executor = Arc::new(ScriptedExecutor::new(&["c1"]));
    let config = PipelineConfig {
        chunk_threshold_tokens: 50,
        ..fast_config()
    };
    let chunker = ChunkerConfig {
        max_chunk_tokens: 50,
        ..Default::default()
    };
    let pipeline = pipeline_with(executor.clone(), Arc::new(StaticRetrieval::new(DOCUMENT)), config, chunker);
    let p = project("11", &["c1"]);

    let document: String = (0..10)
        .map(|i| format!("<file path=\"src/mod{}.rs\">pub fn handler_{}() -> u32 {{ {} }}</file>\n", i, i, i))
        .collect();
    let outcome = pipeline
        .evaluate_document(&p, &challenges(&p), &document)
        .await
        .unwrap();

    let analysis = outcome.analysis.expect("chunk analysis");
    assert!(analysis.chunk_count > 1);
    assert!(analysis.technologies.contains(&"Rust".to_string()));
    assert_eq!(executor.prompts_containing("<code_part"), analysis.chunk_count);
    // The digest, not the raw code, is what the dimensions see
    assert_eq!(executor.prompts_containing("## Part 1/"), 4);
    assert_eq!(executor.prompts_containing("pub fn handler_0"), 1);
    assert!(outcome.verdicts.contains_key("c1"));
}
