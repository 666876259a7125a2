//! Local SQLite verdict store
//!
//! One row per (project, challenge):
//! - verdict JSON plus final and per-dimension scores
//! - `ai_judged` marker used by the already-judged check
//! - review note for projects that need manual review
//! - irregularity summary and risk score copied from the verdict

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{JudgedStatus, StoreError, VerdictStore};
use crate::types::ChallengeVerdict;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS verdicts (
    project_id TEXT NOT NULL,
    challenge_id TEXT NOT NULL,
    verdict_json TEXT,
    final_score REAL,
    technical_score REAL,
    ux_score REAL,
    business_score REAL,
    innovation_score REAL,
    ai_judged INTEGER NOT NULL DEFAULT 0,
    degraded INTEGER NOT NULL DEFAULT 0,
    review_note TEXT,
    irregularity_summary TEXT,
    risk_score INTEGER,
    judged_at INTEGER,
    updated_at INTEGER DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (project_id, challenge_id)
);

CREATE INDEX IF NOT EXISTS idx_verdicts_judged ON verdicts(ai_judged);
"#;

/// Row as stored, for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVerdict {
    pub project_id: String,
    pub challenge_id: String,
    pub verdict: Option<ChallengeVerdict>,
    pub final_score: Option<f64>,
    pub ai_judged: bool,
    pub degraded: bool,
    pub review_note: Option<String>,
    pub irregularity_summary: Option<String>,
    pub risk_score: Option<u32>,
    pub judged_at: Option<DateTime<Utc>>,
}

fn from_timestamp(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
}

pub struct LocalVerdictStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalVerdictStore {
    /// Create storage at the specified path
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // The store and the job journal share one database file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!("Verdict store initialized at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ========================================================================
    // VERDICTS
    // ========================================================================

    fn write_verdict(
        &self,
        project_id: &str,
        challenge_id: &str,
        verdict: &ChallengeVerdict,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(verdict)?;
        let dims = &verdict.dimensions;
        let (summary, risk) = match &verdict.irregularities {
            Some(report) => (report.summary.clone(), report.risk_score),
            None => (None, None),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO verdicts (project_id, challenge_id, verdict_json, final_score,
                technical_score, ux_score, business_score, innovation_score,
                ai_judged, degraded, irregularity_summary, risk_score, judged_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?11, strftime('%s', 'now'), strftime('%s', 'now'))
             ON CONFLICT(project_id, challenge_id) DO UPDATE SET
                verdict_json = excluded.verdict_json,
                final_score = excluded.final_score,
                technical_score = excluded.technical_score,
                ux_score = excluded.ux_score,
                business_score = excluded.business_score,
                innovation_score = excluded.innovation_score,
                ai_judged = 1,
                degraded = excluded.degraded,
                irregularity_summary = excluded.irregularity_summary,
                risk_score = excluded.risk_score,
                judged_at = excluded.judged_at,
                updated_at = excluded.updated_at",
            params![
                project_id,
                challenge_id,
                json,
                verdict.score(),
                dims.technical.score,
                dims.ux.score,
                dims.business.score,
                dims.innovation.score,
                verdict.is_degraded() as i32,
                summary,
                risk,
            ],
        )?;
        debug!("Stored verdict for {}/{}", project_id, challenge_id);
        Ok(())
    }

    fn write_review_note(&self, project_id: &str, challenge_id: &str, note: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO verdicts (project_id, challenge_id, review_note, ai_judged)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT(project_id, challenge_id) DO UPDATE SET
                review_note = excluded.review_note,
                updated_at = strftime('%s', 'now')",
            params![project_id, challenge_id, note],
        )?;
        Ok(())
    }

    fn read_judged(&self, project_id: &str, challenge_ids: &[String]) -> Result<Vec<JudgedStatus>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ai_judged, judged_at, review_note FROM verdicts WHERE project_id = ?1 AND challenge_id = ?2",
        )?;

        let mut statuses = Vec::with_capacity(challenge_ids.len());
        for challenge_id in challenge_ids {
            let row: Option<(bool, Option<i64>, Option<String>)> = stmt
                .query_row(params![project_id, challenge_id], |row| {
                    Ok((row.get::<_, i64>(0)? != 0, row.get(1)?, row.get(2)?))
                })
                .optional()?;
            let (judged, judged_at, note) = row.unwrap_or((false, None, None));
            statuses.push(JudgedStatus {
                challenge_id: challenge_id.clone(),
                judged,
                judged_at: if judged { from_timestamp(judged_at) } else { None },
                needs_review: !judged && note.is_some(),
            });
        }
        Ok(statuses)
    }

    /// Stored row for one project/challenge
    pub fn get(&self, project_id: &str, challenge_id: &str) -> Result<Option<StoredVerdict>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT verdict_json, final_score, ai_judged, degraded, review_note,
                        irregularity_summary, risk_score, judged_at
                 FROM verdicts WHERE project_id = ?1 AND challenge_id = ?2",
                params![project_id, challenge_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((json, final_score, ai_judged, degraded, note, summary, risk, judged_at)) = row else {
            return Ok(None);
        };
        let verdict = match json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Some(StoredVerdict {
            project_id: project_id.to_string(),
            challenge_id: challenge_id.to_string(),
            verdict,
            final_score,
            ai_judged: ai_judged != 0,
            degraded: degraded != 0,
            review_note: note,
            irregularity_summary: summary,
            risk_score: risk.map(|r| r as u32),
            judged_at: from_timestamp(judged_at),
        }))
    }

    /// Number of judged rows
    /// Drop the review notes of a project's unjudged challenges so the
    /// backlog offers it again. Returns the number of rows released.
    pub fn clear_review_notes(&self, project_id: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let released = conn.execute(
            "UPDATE verdicts SET review_note = NULL, updated_at = strftime('%s', 'now')
             WHERE project_id = ?1 AND ai_judged = 0 AND review_note IS NOT NULL",
            params![project_id],
        )?;
        debug!("Released {} noted challenges of project {}", released, project_id);
        Ok(released)
    }

    pub fn judged_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM verdicts WHERE ai_judged = 1", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}

#[async_trait]
impl VerdictStore for LocalVerdictStore {
    async fn already_judged(
        &self,
        project_id: &str,
        challenge_ids: &[String],
    ) -> Result<Vec<JudgedStatus>, StoreError> {
        self.read_judged(project_id, challenge_ids)
    }

    async fn upsert_verdict(
        &self,
        project_id: &str,
        challenge_id: &str,
        verdict: &ChallengeVerdict,
    ) -> Result<(), StoreError> {
        self.write_verdict(project_id, challenge_id, verdict)
    }

    async fn record_review_note(
        &self,
        project_id: &str,
        challenge_id: &str,
        note: &str,
    ) -> Result<(), StoreError> {
        self.write_review_note(project_id, challenge_id, note)
    }
}
