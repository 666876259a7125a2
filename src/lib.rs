//! Hackathon judging engine
//!
//! Turns a backlog of hackathon submissions into judged verdicts with
//! bounded concurrency, retries and caching.
//!
//! ## Module Structure
//!
//! - `scheduler/`: job queue, worker pool, backlog refill, leases
//! - `pipeline/`: per-project evaluation (dimensions, synthesis, cache)
//! - `chunker`: size estimation, chunking and chunk-result merging
//! - `irregularity/`: commit-history anomaly detection
//! - `llm/`: rate-limited request executor and structured output decoding
//! - `storage/`: verdict persistence
//! - `judge`: the job processor wiring everything for one project

// ============================================================================
// CORE
// ============================================================================

/// Shared domain types
pub mod types;

/// Retry policy used by every retry site
pub mod retry;

/// Job scheduler and worker pool
pub mod scheduler;

/// Evaluation pipeline
pub mod pipeline;

/// Content chunking for oversized inputs
pub mod chunker;

/// Commit-history irregularity detection
pub mod irregularity;

// ============================================================================
// COLLABORATORS
// ============================================================================

/// LLM request execution
pub mod llm;

/// Verdict persistence
pub mod storage;

/// Repository bundling
pub mod bundle;

/// Backlog providers
pub mod backlog;

/// Submission validation
pub mod validation;

/// Judging events and sinks
pub mod events;

/// Project judging job processor
pub mod judge;

/// Configuration
pub mod config;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use backlog::{BacklogProvider, FileBacklog};
pub use bundle::{BundleError, CodeRetrieval, CommandBundler, SourceBundle};
pub use chunker::{estimate_tokens, ChunkAnalysis, ChunkPlan, ContentChunker, ProjectAnalysis, Truncation};
pub use config::{ConfigError, JudgeConfig};
pub use events::{EventDispatcher, EventSink, FallbackSheetSink, JudgeEvent, LogSink, WebhookSink};
pub use irregularity::{
    CommitRecord, FlagKind, GitHistorySource, HistoryError, HistorySource, IrregularityDetector,
    IrregularityFlag, IrregularityReport, Severity,
};
pub use judge::ProjectJudge;
pub use llm::{ExecutorError, HttpRequestExecutor, LlmProvider, LlmRequest, RequestExecutor, Structured};
pub use pipeline::{
    EvaluationOutcome, EvaluationPipeline, FailureMode, MemoryCache, PipelineError, VerdictCache,
};
pub use retry::{Backoff, RetryPolicy};
pub use scheduler::{
    Job, JobContext, JobJournal, JobProcessor, JobScheduler, JobState, SchedulerError, SchedulerStats,
};
pub use storage::{JudgedStatus, LocalVerdictStore, StoreError, VerdictStore};
pub use types::{
    Challenge, ChallengeVerdict, CodeType, Dimension, DimensionResult, DimensionSet, Hackathon,
    Project,
};
pub use validation::{validate_project, ValidationError};
