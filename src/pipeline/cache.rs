//! Verdict cache
//!
//! Simple key-value cache for completed verdicts, keyed per
//! (project, challenge). Values are stored serialized, the way an external
//! key-value store would hold them.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::types::ChallengeVerdict;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Cached value is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Cache key for one project/challenge review
pub fn cache_key(project_id: &str, challenge_id: &str) -> String {
    format!("{}-{}-review", project_id, challenge_id)
}

#[async_trait]
pub trait VerdictCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ChallengeVerdict>, CacheError>;
    async fn set(&self, key: &str, verdict: &ChallengeVerdict) -> Result<(), CacheError>;
}

struct CacheEntry {
    json: String,
    stored_at: Instant,
}

/// In-process cache with a TTL
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }
}

#[async_trait]
impl VerdictCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<ChallengeVerdict>, CacheError> {
        // Guard must be released before `remove` touches the same shard
        let cached = self
            .entries
            .get(key)
            .map(|entry| (entry.json.clone(), entry.stored_at.elapsed() < self.ttl));

        match cached {
            Some((json, true)) => Ok(Some(serde_json::from_str(&json)?)),
            Some((_, false)) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, verdict: &ChallengeVerdict) -> Result<(), CacheError> {
        let json = serde_json::to_string(verdict)?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                json,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }
}
