//! Job model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::Project;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Allowed moves:
    /// - waiting -> active (claimed by a worker)
    /// - active -> completed | failed | waiting (retry with backoff, lease reclaim)
    /// - failed -> waiting (explicit retry only)
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Active) | (Active, Completed) | (Active, Failed) | (Active, Waiting) | (Failed, Waiting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Waiting or active
    pub fn is_queued(self) -> bool {
        !self.is_terminal()
    }
}

/// Exclusive processing right held by the worker running a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lease {
    pub token: u64,
    pub expires_at: Instant,
}

/// One unit of scheduler work: judging one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project: Project,
    pub state: JobState,
    /// 0-100, last write wins
    pub progress: u8,
    pub progress_message: Option<String>,
    /// Attempts started so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    #[serde(skip)]
    pub(crate) lease: Option<Lease>,
    /// Backoff: not claimable before this instant
    #[serde(skip)]
    pub(crate) available_at: Option<Instant>,
}

impl Job {
    pub fn new(project: Project, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project,
            state: JobState::Waiting,
            progress: 0,
            progress_message: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
            lease: None,
            available_at: None,
        }
    }

    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub(crate) fn set_state(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid job transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    pub(crate) fn is_available(&self, now: Instant) -> bool {
        self.available_at.map_or(true, |at| at <= now)
    }

    pub(crate) fn lease_token(&self) -> Option<u64> {
        self.lease.map(|l| l.token)
    }
}

/// Snapshot returned by `JobScheduler::stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub concurrency: usize,
    pub is_running: bool,
    pub is_paused: bool,
}
