//! Project judging job
//!
//! `ProjectJudge` is the scheduler's processor: it runs one project through
//! validation, irregularity analysis and the evaluation pipeline, then
//! persists the verdicts. Projects it cannot judge get a review note, which
//! takes them out of the backlog.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::events::{EventDispatcher, JudgeEvent};
use crate::irregularity::{HistorySource, IrregularityDetector, IrregularityReport};
use crate::pipeline::{EvaluationPipeline, PipelineError, TOO_LARGE_NOTE};
use crate::scheduler::{Job, JobContext, JobProcessor};
use crate::storage::VerdictStore;
use crate::types::{Challenge, Project};
use crate::validation::{review_note, validate_project};

pub struct ProjectJudge {
    pipeline: Arc<EvaluationPipeline>,
    store: Arc<dyn VerdictStore>,
    history: Option<Arc<dyn HistorySource>>,
    detector: IrregularityDetector,
    events: EventDispatcher,
}

impl ProjectJudge {
    pub fn new(pipeline: Arc<EvaluationPipeline>, store: Arc<dyn VerdictStore>) -> Self {
        Self {
            pipeline,
            store,
            history: None,
            detector: IrregularityDetector::default(),
            events: EventDispatcher::disabled(),
        }
    }

    /// Enable commit-history analysis
    pub fn with_history(mut self, history: Arc<dyn HistorySource>, detector: IrregularityDetector) -> Self {
        self.history = Some(history);
        self.detector = detector;
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    async fn record_note(&self, project: &Project, challenges: &[Challenge], note: &str) -> Result<()> {
        for challenge in challenges {
            self.store
                .record_review_note(&project.id, &challenge.id, note)
                .await
                .with_context(|| format!("Failed to record review note for {}/{}", project.id, challenge.id))?;
        }
        self.events.emit(JudgeEvent::NeedsManualReview {
            project_id: project.id.clone(),
            reason: note.to_string(),
        });
        Ok(())
    }

    /// Never fails the job: a history error only means no flags
    async fn irregularities(&self, project: &Project) -> Option<IrregularityReport> {
        let history = self.history.as_ref().filter(|_| self.detector.is_enabled())?;
        match history.commits(&project.project_url).await {
            Ok(commits) => {
                let report = self
                    .detector
                    .analyze(&commits, &project.hackathon, project.code_type);
                if report.is_flagged() {
                    warn!(
                        "Project {}: {} irregularity flags (risk {:?})",
                        project.short_id(),
                        report.flags.len(),
                        report.risk_score
                    );
                }
                Some(report)
            }
            Err(e) => {
                warn!(
                    "Irregularity analysis failed for project {}: {}; continuing without flags",
                    project.short_id(),
                    e
                );
                None
            }
        }
    }

    async fn pending_challenges(&self, project: &Project) -> Result<Vec<Challenge>> {
        let judged: HashSet<String> = self
            .store
            .already_judged(&project.id, &project.challenge_ids())
            .await
            .context("Failed to check judged state")?
            .into_iter()
            .filter(|s| s.judged)
            .map(|s| s.challenge_id)
            .collect();
        Ok(project
            .challenges
            .iter()
            .filter(|c| !judged.contains(&c.id))
            .cloned()
            .collect())
    }
}

/// Report progress, or stop once another attempt owns the job
fn checkpoint(ctx: &JobContext, percent: u8, message: &str) -> Result<()> {
    if !ctx.report_progress(percent, message) {
        bail!(
            "Job {} lost its lease; abandoning attempt {}",
            &ctx.job_id[..8.min(ctx.job_id.len())],
            ctx.attempt
        );
    }
    Ok(())
}

#[async_trait]
impl JobProcessor for ProjectJudge {
    async fn process(&self, ctx: JobContext) -> Result<Value> {
        let project = &ctx.project;

        if !project.hackathon.use_judge_bot {
            info!("Project {}: automated judging disabled, skipping", project.short_id());
            return Ok(json!({ "status": "skipped" }));
        }

        checkpoint(&ctx, 10, "Validating submission")?;
        let errors = validate_project(project);
        if !errors.is_empty() {
            let note = review_note(&errors);
            warn!("Project {} is invalid: {}", project.short_id(), note);
            self.record_note(project, &project.challenges, &note).await?;
            return Ok(json!({ "status": "invalid", "note": note }));
        }

        let pending = self.pending_challenges(project).await?;
        if pending.is_empty() {
            info!("Project {}: every challenge already judged", project.short_id());
            return Ok(json!({ "status": "already_judged" }));
        }

        checkpoint(&ctx, 30, "Analyzing commit history")?;
        let report = self.irregularities(project).await;

        let outcome = match self.pipeline.evaluate(project, &pending).await {
            Ok(outcome) => outcome,
            Err(PipelineError::InputTooLarge { tokens, limit }) => {
                warn!(
                    "Project {} is too large (~{} tokens, limit {}); flagged for manual review",
                    project.short_id(),
                    tokens,
                    limit
                );
                self.record_note(project, &pending, TOO_LARGE_NOTE).await?;
                return Ok(json!({ "status": "too_large", "tokens": tokens }));
            }
            Err(PipelineError::Bundle(e)) if e.is_permanent() => {
                warn!("Project {}: repository unavailable: {}", project.short_id(), e);
                let note = format!(
                    "Repository could not be retrieved ({}). Please review the project manually.",
                    e
                );
                self.record_note(project, &pending, &note).await?;
                return Ok(json!({ "status": "unavailable", "note": note }));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Evaluation of project {} failed", project.short_id())));
            }
        };

        checkpoint(&ctx, 80, "Persisting verdicts")?;
        let mut scores = BTreeMap::new();
        let mut degraded = false;
        for (challenge_id, mut verdict) in outcome.verdicts {
            verdict.irregularities = report.clone();
            self.store
                .upsert_verdict(&project.id, &challenge_id, &verdict)
                .await
                .with_context(|| format!("Failed to persist verdict {}/{}", project.id, challenge_id))?;
            degraded |= verdict.is_degraded();
            scores.insert(challenge_id, verdict.score());
        }

        ctx.report_progress(90, "Notifying");
        let risk_score = report.as_ref().and_then(|r| r.risk_score);
        self.events.emit(JudgeEvent::ProjectJudged {
            project_id: project.id.clone(),
            job_id: ctx.job_id.clone(),
            scores: scores.clone(),
            degraded,
            risk_score,
        });

        ctx.report_progress(100, "Done");
        info!(
            "Project {} judged: {} verdicts ({} from cache, degraded={})",
            project.short_id(),
            scores.len(),
            outcome.cache_hits.len(),
            degraded
        );
        Ok(json!({
            "status": "judged",
            "scores": scores,
            "cached": outcome.cache_hits,
            "source_sha256": outcome.source_fingerprint,
            "degraded": degraded,
            "risk_score": risk_score,
        }))
    }

    /// Park the project for manual review so the backlog stops offering it
    async fn dead_lettered(&self, job: &Job) {
        let project = &job.project;
        let pending = match self.pending_challenges(project).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Project {}: cannot record dead-letter note: {:#}", project.short_id(), e);
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let note = format!(
            "Automated judging gave up after attempt {}: {}. Please review the project manually.",
            job.attempts,
            job.last_error.as_deref().unwrap_or("unknown error")
        );
        if let Err(e) = self.record_note(project, &pending, &note).await {
            error!("Project {}: {:#}", project.short_id(), e);
        }
    }
}
