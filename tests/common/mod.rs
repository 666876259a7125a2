//! Stub collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use judge_engine::bundle::BundleError;
use judge_engine::{
    Challenge, CodeRetrieval, ExecutorError, Hackathon, LlmRequest, Project, RequestExecutor,
    SourceBundle,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const LABELS: [&str; 4] = [
    "Technical Implementation",
    "User Experience",
    "Business Potential",
    "Innovation",
];

pub fn challenge(id: &str) -> Challenge {
    Challenge {
        id: id.to_string(),
        name: format!("Challenge {}", id),
        description: format!("Requirements of challenge {}", id),
    }
}

pub fn project(id: &str, challenge_ids: &[&str]) -> Project {
    Project {
        id: id.to_string(),
        name: format!("Project {}", id),
        description: "A wallet analytics dashboard".to_string(),
        project_url: format!("https://github.com/team/{}", id),
        hackathon: Hackathon {
            id: "hack".to_string(),
            use_judge_bot: true,
            ..Default::default()
        },
        challenges: challenge_ids.iter().map(|c| challenge(c)).collect(),
        code_type: None,
    }
}

fn label_of(prompt: &str) -> Option<&'static str> {
    LABELS.into_iter().find(|label| prompt.contains(label))
}

/// Answers each pipeline prompt with canned JSON and counts calls
pub struct ScriptedExecutor {
    ids: Vec<String>,
    calls: AtomicUsize,
    per_label: Mutex<HashMap<&'static str, usize>>,
    prompts: Mutex<Vec<String>>,
    failing_labels: Vec<&'static str>,
    summary_override: Option<String>,
    fail_synthesis: bool,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
            per_label: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            failing_labels: Vec::new(),
            summary_override: None,
            fail_synthesis: false,
            delay: Duration::ZERO,
        }
    }

    /// Every analysis call for this dimension label fails
    pub fn failing(mut self, label: &'static str) -> Self {
        self.failing_labels.push(label);
        self
    }

    /// Summaries come back as this raw text
    pub fn summary_text(mut self, raw: &str) -> Self {
        self.summary_override = Some(raw.to_string());
        self
    }

    pub fn failing_synthesis(mut self) -> Self {
        self.fail_synthesis = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Dimension analysis calls made for a label
    pub fn analysis_calls(&self, label: &str) -> usize {
        self.per_label.lock().get(label).copied().unwrap_or(0)
    }

    pub fn prompts_containing(&self, needle: &str) -> usize {
        self.prompts.lock().iter().filter(|p| p.contains(needle)).count()
    }

    fn keyed(&self, value: impl Fn(&str) -> Value) -> String {
        let map: Map<String, Value> = self.ids.iter().map(|id| (id.clone(), value(id))).collect();
        Value::Object(map).to_string()
    }

    fn score_for(label: &str) -> f64 {
        match label {
            "Technical Implementation" | "Innovation" => 8.0,
            _ => 6.0,
        }
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn execute(&self, request: LlmRequest) -> Result<String, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let prompt = request.prompt.as_str();

        if prompt.contains("<code_part") {
            let first = self.ids.first().cloned().unwrap_or_default();
            return Ok(json!({
                "technologies": ["Rust", "React"],
                "projectNameHints": ["Orbit"],
                "features": ["Portfolio view"],
                "potentialChallenges": [first],
                "description": "Part of the project",
                "technicalDigest": "Axum backend with a React frontend"
            })
            .to_string());
        }

        if prompt.contains("<assessments") {
            if self.fail_synthesis {
                return Err(ExecutorError::Network("connection reset".into()));
            }
            return Ok(self.keyed(|id| {
                json!({ "analysis": format!("Final review for {}", id), "summary": "Solid submission" })
            }));
        }

        if prompt.contains("<review challenge_id") {
            if let Some(raw) = &self.summary_override {
                return Ok(raw.clone());
            }
            let score = label_of(prompt).map(Self::score_for).unwrap_or(5.0);
            return Ok(self.keyed(|_| json!({ "summary": "Short summary", "score": score })));
        }

        if prompt.contains("<project_code>") {
            let label = label_of(prompt).unwrap_or("unknown");
            *self.per_label.lock().entry(label).or_insert(0) += 1;
            if self.failing_labels.contains(&label) {
                return Err(ExecutorError::Api {
                    status: 400,
                    message: "context length exceeded".into(),
                });
            }
            return Ok(self.keyed(|id| Value::String(format!("{} analysis for challenge {}", label, id))));
        }

        Err(ExecutorError::InvalidResponse("unexpected prompt".into()))
    }
}

/// Serves one fixed document for every repository
pub struct StaticRetrieval {
    _dir: TempDir,
    path: std::path::PathBuf,
    calls: AtomicUsize,
}

impl StaticRetrieval {
    pub fn new(document: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.xml");
        std::fs::write(&path, document).unwrap();
        Self {
            _dir: dir,
            path,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeRetrieval for StaticRetrieval {
    async fn bundle_repository(&self, _repo_url: &str) -> Result<SourceBundle, BundleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SourceBundle::from_path(&self.path))
    }
}

/// Always fails, like a private or deleted repository
pub struct BrokenRetrieval;

#[async_trait]
impl CodeRetrieval for BrokenRetrieval {
    async fn bundle_repository(&self, repo_url: &str) -> Result<SourceBundle, BundleError> {
        Err(BundleError::Command(format!("repository not found: {}", repo_url)))
    }
}
