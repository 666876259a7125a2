//! Judging events and their delivery
//!
//! The scheduler and the job processor emit `JudgeEvent`s into an
//! `EventDispatcher`; a background task hands each event to every sink.
//! Emission never blocks and delivery failures are only logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JudgeEvent {
    ProjectJudged {
        project_id: String,
        job_id: String,
        /// Final score per challenge id
        scores: BTreeMap<String, f64>,
        degraded: bool,
        risk_score: Option<u32>,
    },
    JobFailed {
        job_id: String,
        project_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    NeedsManualReview {
        project_id: String,
        reason: String,
    },
    /// Job exhausted its attempts
    DeadLetter {
        job_id: String,
        project_id: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl JudgeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            JudgeEvent::ProjectJudged { .. } => "project_judged",
            JudgeEvent::JobFailed { .. } => "job_failed",
            JudgeEvent::NeedsManualReview { .. } => "needs_manual_review",
            JudgeEvent::DeadLetter { .. } => "dead_letter",
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &JudgeEvent) -> Result<()>;
}

/// Non-blocking handle for emitting events
#[derive(Clone)]
pub struct EventDispatcher {
    tx: Option<mpsc::UnboundedSender<JudgeEvent>>,
}

impl EventDispatcher {
    /// Start delivering to `sinks` on a background task
    pub fn start(sinks: Vec<Arc<dyn EventSink>>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JudgeEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.deliver(&event).await {
                        warn!("Event sink {} failed on {}: {:#}", sink.name(), event.kind(), e);
                    }
                }
            }
            debug!("Event dispatcher stopped");
        });
        (Self { tx: Some(tx) }, handle)
    }

    /// Dispatcher that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: JudgeEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("Event dispatcher closed; event dropped");
            }
        }
    }
}

/// Logs every event through tracing
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &JudgeEvent) -> Result<()> {
        match event {
            JudgeEvent::ProjectJudged {
                project_id,
                scores,
                degraded,
                ..
            } => info!(
                "Project {} judged for {} challenges (degraded={})",
                project_id,
                scores.len(),
                degraded
            ),
            JudgeEvent::JobFailed {
                job_id,
                attempt,
                error,
                will_retry,
                ..
            } => warn!(
                "Job {} attempt {} failed: {} (will_retry={})",
                &job_id[..8.min(job_id.len())],
                attempt,
                error,
                will_retry
            ),
            JudgeEvent::NeedsManualReview { project_id, reason } => {
                warn!("Project {} needs manual review: {}", project_id, reason)
            }
            JudgeEvent::DeadLetter {
                project_id, error, ..
            } => error!("Project {} failed permanently: {}", project_id, error),
        }
        Ok(())
    }
}

/// POSTs every event as JSON to a notification endpoint
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &JudgeEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected event")?;
        Ok(())
    }
}

/// Dead-letter sink: appends `[[timestamp, projectId, error]]` rows to a
/// spreadsheet endpoint for manual follow-up
pub struct FallbackSheetSink {
    client: Client,
    url: String,
}

impl FallbackSheetSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventSink for FallbackSheetSink {
    fn name(&self) -> &str {
        "fallback-sheet"
    }

    async fn deliver(&self, event: &JudgeEvent) -> Result<()> {
        let JudgeEvent::DeadLetter {
            project_id,
            error,
            failed_at,
            ..
        } = event
        else {
            return Ok(());
        };

        let rows = serde_json::json!([[failed_at.to_rfc3339(), project_id, error]]);
        self.client
            .post(&self.url)
            .json(&rows)
            .send()
            .await
            .context("fallback sheet request failed")?
            .error_for_status()
            .context("fallback sheet rejected row")?;
        info!("Sent project {} to fallback sheet", project_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use parking_lot::Mutex;

    struct Collect(Arc<Mutex<Vec<JudgeEvent>>>);

    #[async_trait]
    impl EventSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }
        async fn deliver(&self, event: &JudgeEvent) -> Result<()> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl EventSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn deliver(&self, _event: &JudgeEvent) -> Result<()> {
            anyhow::bail!("sink down")
        }
    }

    fn dead_letter() -> JudgeEvent {
        JudgeEvent::DeadLetter {
            job_id: "job-1".into(),
            project_id: "42".into(),
            error: "boom".into(),
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (dispatcher, handle) =
            EventDispatcher::start(vec![Arc::new(Broken), Arc::new(Collect(seen.clone()))]);

        dispatcher.emit(dead_letter());
        dispatcher.emit(JudgeEvent::NeedsManualReview {
            project_id: "7".into(),
            reason: "too large".into(),
        });
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_disabled_dispatcher_drops_events() {
        EventDispatcher::disabled().emit(dead_letter());
    }

    #[test]
    fn test_event_serialization_tag() {
        let json = serde_json::to_value(JudgeEvent::NeedsManualReview {
            project_id: "7".into(),
            reason: "r".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "needs_manual_review");
    }

    #[tokio::test]
    async fn test_fallback_sheet_posts_rows() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/sheet").body_contains("\"42\",\"boom\"");
                then.status(200);
            })
            .await;

        let sink = FallbackSheetSink::new(server.url("/sheet")).unwrap();
        sink.deliver(&dead_letter()).await.unwrap();
        // Other events are ignored
        sink.deliver(&JudgeEvent::NeedsManualReview {
            project_id: "1".into(),
            reason: "r".into(),
        })
        .await
        .unwrap();
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(500);
            })
            .await;

        let sink = WebhookSink::new(server.url("/hook")).unwrap();
        assert!(sink.deliver(&dead_letter()).await.is_err());
    }
}
