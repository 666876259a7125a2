//! Verdict persistence
//!
//! The store is the single source of truth for "already judged". Every
//! write is keyed on `(project_id, challenge_id)` and is an upsert, so a
//! retried job can safely write again.

pub mod local;

pub use local::{LocalVerdictStore, StoredVerdict};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChallengeVerdict;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Judging state of one challenge for a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgedStatus {
    pub challenge_id: String,
    pub judged: bool,
    pub judged_at: Option<DateTime<Utc>>,
    /// Not judged, but a review note sends it to manual review
    #[serde(default)]
    pub needs_review: bool,
}

impl JudgedStatus {
    /// Judged, or parked for manual review; either way not automated work
    pub fn is_settled(&self) -> bool {
        self.judged || self.needs_review
    }
}

#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// One status per requested challenge id, in request order
    async fn already_judged(
        &self,
        project_id: &str,
        challenge_ids: &[String],
    ) -> Result<Vec<JudgedStatus>, StoreError>;

    async fn upsert_verdict(
        &self,
        project_id: &str,
        challenge_id: &str,
        verdict: &ChallengeVerdict,
    ) -> Result<(), StoreError>;

    /// Record why a project/challenge needs manual review
    async fn record_review_note(
        &self,
        project_id: &str,
        challenge_id: &str,
        note: &str,
    ) -> Result<(), StoreError>;
}
