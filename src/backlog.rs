//! Backlog providers
//!
//! The scheduler asks a `BacklogProvider` for more work whenever its queue
//! runs low. Providers return projects still awaiting automated judging;
//! the scheduler de-duplicates them against queued jobs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::{EventDispatcher, JudgeEvent};
use crate::storage::VerdictStore;
use crate::types::Project;
use crate::validation::{review_note, validate_project};

#[async_trait]
pub trait BacklogProvider: Send + Sync {
    async fn eligible_projects(&self) -> Result<Vec<Project>>;
}

/// Reads a JSON array of projects from disk on every refill.
///
/// Keeps projects whose event has automated judging enabled, records a
/// review note for invalid ones, and drops projects whose challenges are
/// all settled: judged already, or parked with a review note (too large,
/// unreachable repository, dead-lettered job).
pub struct FileBacklog {
    path: PathBuf,
    store: Option<Arc<dyn VerdictStore>>,
    events: EventDispatcher,
    /// (project id, note) pairs already reported
    reported: Mutex<HashSet<(String, String)>>,
}

impl FileBacklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: None,
            events: EventDispatcher::disabled(),
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn VerdictStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    async fn load(&self) -> Result<Vec<Project>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read backlog {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse backlog {}", self.path.display()))
    }

    async fn reject(&self, project: &Project, note: String) -> Result<()> {
        let first_report = self
            .reported
            .lock()
            .insert((project.id.clone(), note.clone()));
        if !first_report {
            return Ok(());
        }

        warn!("Project {} is invalid: {}", project.id, note);
        if let Some(store) = &self.store {
            for challenge in &project.challenges {
                store
                    .record_review_note(&project.id, &challenge.id, &note)
                    .await
                    .context("Failed to record review note")?;
            }
        }
        self.events.emit(JudgeEvent::NeedsManualReview {
            project_id: project.id.clone(),
            reason: note,
        });
        Ok(())
    }

    async fn settled(&self, project: &Project) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let statuses = store
            .already_judged(&project.id, &project.challenge_ids())
            .await
            .context("Failed to check judged state")?;
        Ok(!statuses.is_empty() && statuses.iter().all(|s| s.is_settled()))
    }
}

#[async_trait]
impl BacklogProvider for FileBacklog {
    async fn eligible_projects(&self) -> Result<Vec<Project>> {
        let projects = self.load().await?;
        let total = projects.len();
        let mut eligible = Vec::new();

        for project in projects {
            if !project.hackathon.use_judge_bot {
                debug!("Skipping project {}: automated judging disabled", project.id);
                continue;
            }

            let errors = validate_project(&project);
            if !errors.is_empty() {
                self.reject(&project, review_note(&errors)).await?;
                continue;
            }

            if self.settled(&project).await? {
                debug!("Skipping project {}: judged or awaiting manual review", project.id);
                continue;
            }
            eligible.push(project);
        }

        info!("Backlog: {} of {} projects eligible", eligible.len(), total);
        Ok(eligible)
    }
}
