//! SQLite journal of scheduler jobs
//!
//! Every job state change is written through, so a restarted scheduler
//! gets back its queue, attempt counts and failed-job history.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::job::Job;
use crate::storage::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scheduler_jobs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    job_json TEXT NOT NULL,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_state ON scheduler_jobs(state);
"#;

pub struct JobJournal {
    conn: Arc<Mutex<Connection>>,
}

impl JobJournal {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // The store and the job journal share one database file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!("Job journal initialized at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create in-memory journal (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn save(&self, job: &Job) -> Result<(), StoreError> {
        let json = serde_json::to_string(job)?;
        self.conn.lock().execute(
            "INSERT INTO scheduler_jobs (id, project_id, state, attempts, job_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                attempts = excluded.attempts,
                job_json = excluded.job_json,
                updated_at = strftime('%s', 'now')",
            params![job.id, job.project.id, job.state.as_str(), job.attempts, json],
        )?;
        Ok(())
    }

    pub fn remove(&self, job_id: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM scheduler_jobs WHERE id = ?1", params![job_id])?;
        Ok(())
    }

    /// Every journaled job in insertion order. Unreadable rows are skipped.
    pub fn load(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, job_json FROM scheduler_jobs ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, json) in rows {
            match serde_json::from_str::<Job>(&json) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable journaled job {}: {}", id, e),
            }
        }
        debug!("Loaded {} journaled jobs", jobs.len());
        Ok(jobs)
    }
}
