//! Commit history irregularity detection
//!
//! Flags likely integrity violations from commit metadata alone:
//! - one commit carrying most of the code
//! - a handful of commits carrying a lot of code
//! - code added after the deadline
//! - a lot of code committed in a very short window
//! - "fresh code" projects whose history predates the event
//!
//! Only commits touching recognised source files are considered by the
//! threshold rules. Flags feed an aggregate risk score and summary that are
//! attached to each verdict; they are never persisted on their own.

pub mod commits;
pub mod git;

pub use commits::{is_code_file, parse_git_log, CommitRecord};
pub use git::{GitHistorySource, HistorySource};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::IrregularityConfig;
use crate::types::{CodeType, Hackathon};

/// Risk score ceiling
pub const MAX_RISK_SCORE: u32 = 100;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("git error: {0}")]
    Git(String),
    #[error("Failed to parse commit history: {0}")]
    Parse(String),
    #[error("History retrieval timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    LargeSingleCommit,
    SuspiciousTiming,
    MinimalHistoryDump,
    PostDeadlineDump,
}

/// Ordered most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Contribution of one flag to the risk score
    pub fn points(&self) -> u32 {
        match self {
            Severity::High => 40,
            Severity::Medium => 25,
            Severity::Low => 10,
        }
    }

    fn heading(&self) -> &'static str {
        match self {
            Severity::High => "Critical Issues",
            Severity::Medium => "Moderate Concerns",
            Severity::Low => "Minor Issues",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDeadlineCommit {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub lines_added: u64,
}

/// Supporting numbers for a flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FlagMetadata {
    LargeSingleCommit {
        lines_added: u64,
        percentage_of_total: u64,
        total_project_lines: u64,
    },
    MinimalHistoryDump {
        commit_count: usize,
        total_lines: u64,
        average_lines_per_commit: u64,
    },
    PostDeadlineDump {
        post_deadline_commits: usize,
        post_deadline_lines: u64,
        commits: Vec<PostDeadlineCommit>,
    },
    SuspiciousTiming {
        development_time_hours: f64,
        total_lines: u64,
        /// None when every commit shares one timestamp
        lines_per_hour: Option<u64>,
    },
    ExistingCode {
        first_commit_at: DateTime<Utc>,
        event_start: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrregularityFlag {
    pub kind: FlagKind,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: FlagMetadata,
}

impl IrregularityFlag {
    /// Description enriched with the flag's metadata
    pub fn detailed_description(&self) -> String {
        match &self.metadata {
            FlagMetadata::LargeSingleCommit {
                lines_added,
                percentage_of_total,
                total_project_lines,
            } => format!(
                "{} ({} lines in one commit, {}% of total {} lines)",
                self.description, lines_added, percentage_of_total, total_project_lines
            ),
            FlagMetadata::MinimalHistoryDump {
                average_lines_per_commit,
                ..
            } => format!(
                "{} (averaging {} lines per commit)",
                self.description, average_lines_per_commit
            ),
            FlagMetadata::PostDeadlineDump {
                post_deadline_commits,
                ..
            } => format!("{} across {} commits", self.description, post_deadline_commits),
            FlagMetadata::SuspiciousTiming {
                lines_per_hour: Some(rate),
                ..
            } => format!("{} ({} lines per hour)", self.description, rate),
            _ => self.description.clone(),
        }
    }
}

/// Sum of severity points, capped at `MAX_RISK_SCORE`
pub fn risk_score(flags: &[IrregularityFlag]) -> u32 {
    flags
        .iter()
        .map(|f| f.severity.points())
        .sum::<u32>()
        .min(MAX_RISK_SCORE)
}

/// Human-readable summary grouped by severity; `None` without flags
pub fn summarize(flags: &[IrregularityFlag]) -> Option<String> {
    if flags.is_empty() {
        return None;
    }

    let mut summary = String::from("Irregularities detected:\n\n");
    for severity in [Severity::High, Severity::Medium, Severity::Low] {
        let group: Vec<&IrregularityFlag> = flags.iter().filter(|f| f.severity == severity).collect();
        if group.is_empty() {
            continue;
        }
        summary.push_str(severity.heading());
        summary.push_str(":\n");
        for flag in group {
            summary.push_str("• ");
            summary.push_str(&flag.detailed_description());
            summary.push('\n');
        }
        summary.push('\n');
    }
    summary.push_str(&format!("Overall Risk Score: {}/{}", risk_score(flags), MAX_RISK_SCORE));
    Some(summary.trim().to_string())
}

/// Aggregate irregularity result for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrregularityReport {
    pub flags: Vec<IrregularityFlag>,
    /// Derived from the first commit versus the event start
    #[serde(default)]
    pub code_type: Option<CodeType>,
    /// `None` means nothing was detected, which is not the same as a score of 0
    pub risk_score: Option<u32>,
    pub summary: Option<String>,
}

impl IrregularityReport {
    pub fn from_flags(flags: Vec<IrregularityFlag>, code_type: Option<CodeType>) -> Self {
        let (score, summary) = if flags.is_empty() {
            (None, None)
        } else {
            (Some(risk_score(&flags)), summarize(&flags))
        };
        Self {
            flags,
            code_type,
            risk_score: score,
            summary,
        }
    }

    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    pub fn has(&self, kind: FlagKind) -> bool {
        self.flags.iter().any(|f| f.kind == kind)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `existing_code` when the first commit predates the event start
pub fn derive_code_type(commits: &[CommitRecord], event_start: Option<DateTime<Utc>>) -> Option<CodeType> {
    let start = event_start?;
    let first = commits.iter().map(|c| c.timestamp).min()?;
    Some(if first < start {
        CodeType::ExistingCode
    } else {
        CodeType::FreshCode
    })
}

#[derive(Debug, Clone, Default)]
pub struct IrregularityDetector {
    config: IrregularityConfig,
}

impl IrregularityDetector {
    pub fn new(config: IrregularityConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Threshold rules over the code commits of `commits`
    pub fn detect(&self, commits: &[CommitRecord], deadline: Option<DateTime<Utc>>) -> Vec<IrregularityFlag> {
        let cfg = &self.config;
        let mut flags = Vec::new();

        let code: Vec<&CommitRecord> = commits.iter().filter(|c| c.is_code_commit).collect();
        let Some(largest) = code.iter().max_by_key(|c| c.lines_added) else {
            return flags;
        };
        let total: u64 = code.iter().map(|c| c.lines_added).sum();

        // Large single commit
        if (largest.lines_added as f64) > (total as f64) * cfg.large_commit_ratio
            && total > cfg.large_commit_min_lines
        {
            let pct = ((largest.lines_added as f64 / total as f64) * 100.0).round() as u64;
            flags.push(IrregularityFlag {
                kind: FlagKind::LargeSingleCommit,
                severity: Severity::High,
                description: format!(
                    "Single commit contains {} lines ({}% of total code)",
                    largest.lines_added, pct
                ),
                commit_hash: Some(largest.hash.clone()),
                timestamp: Some(largest.timestamp),
                metadata: FlagMetadata::LargeSingleCommit {
                    lines_added: largest.lines_added,
                    percentage_of_total: pct,
                    total_project_lines: total,
                },
            });
        }

        // Minimal history followed by a dump
        if code.len() <= cfg.minimal_history_max_commits && total > cfg.minimal_history_min_lines {
            flags.push(IrregularityFlag {
                kind: FlagKind::MinimalHistoryDump,
                severity: Severity::Medium,
                description: format!("Only {} commits but {} lines of code", code.len(), total),
                commit_hash: None,
                timestamp: None,
                metadata: FlagMetadata::MinimalHistoryDump {
                    commit_count: code.len(),
                    total_lines: total,
                    average_lines_per_commit: (total as f64 / code.len() as f64).round() as u64,
                },
            });
        }

        // Code added after the deadline
        if let Some(deadline) = deadline {
            let late: Vec<&&CommitRecord> = code.iter().filter(|c| c.timestamp > deadline).collect();
            let late_lines: u64 = late.iter().map(|c| c.lines_added).sum();
            if late_lines > cfg.post_deadline_min_lines {
                flags.push(IrregularityFlag {
                    kind: FlagKind::PostDeadlineDump,
                    severity: Severity::High,
                    description: format!("{} lines of code added after deadline", late_lines),
                    commit_hash: None,
                    timestamp: None,
                    metadata: FlagMetadata::PostDeadlineDump {
                        post_deadline_commits: late.len(),
                        post_deadline_lines: late_lines,
                        commits: late
                            .iter()
                            .map(|c| PostDeadlineCommit {
                                hash: c.hash.clone(),
                                timestamp: c.timestamp,
                                lines_added: c.lines_added,
                            })
                            .collect(),
                    },
                });
            }
        }

        // Everything committed in a short window
        let first = code.iter().map(|c| c.timestamp).min();
        let last = code.iter().map(|c| c.timestamp).max();
        if let (Some(first), Some(last)) = (first, last) {
            let hours = (last - first).num_milliseconds() as f64 / 3_600_000.0;
            if hours < cfg.timing_window_hours && total > cfg.timing_min_lines && code.len() > 1 {
                let lines_per_hour = (hours > 0.0).then(|| (total as f64 / hours).round() as u64);
                flags.push(IrregularityFlag {
                    kind: FlagKind::SuspiciousTiming,
                    severity: Severity::Medium,
                    description: format!(
                        "{} lines of code committed in {} hours",
                        total,
                        round2(hours)
                    ),
                    commit_hash: None,
                    timestamp: None,
                    metadata: FlagMetadata::SuspiciousTiming {
                        development_time_hours: round2(hours),
                        total_lines: total,
                        lines_per_hour,
                    },
                });
            }
        }

        flags
    }

    /// Full analysis: threshold rules, derived code type and the fresh-code
    /// cross-check against the event start.
    pub fn analyze(
        &self,
        commits: &[CommitRecord],
        hackathon: &Hackathon,
        declared: Option<CodeType>,
    ) -> IrregularityReport {
        let mut flags = self.detect(commits, hackathon.end_date);
        let code_type = derive_code_type(commits, hackathon.start_date);

        if declared == Some(CodeType::FreshCode) {
            let first = commits.iter().min_by_key(|c| c.timestamp);
            if let (Some(first), Some(start)) = (first, hackathon.start_date) {
                if first.timestamp < start {
                    flags.push(IrregularityFlag {
                        kind: FlagKind::SuspiciousTiming,
                        severity: Severity::High,
                        description: format!(
                            "Project declared as fresh code but its first commit ({}) predates the event start ({})",
                            first.timestamp.format("%Y-%m-%d %H:%M UTC"),
                            start.format("%Y-%m-%d %H:%M UTC")
                        ),
                        commit_hash: Some(first.hash.clone()),
                        timestamp: Some(first.timestamp),
                        metadata: FlagMetadata::ExistingCode {
                            first_commit_at: first.timestamp,
                            event_start: start,
                        },
                    });
                }
            }
        }

        IrregularityReport::from_flags(flags, code_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hours: i64, minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(hours) + Duration::minutes(minutes)
    }

    fn commit(i: usize, ts: DateTime<Utc>, lines: u64) -> CommitRecord {
        CommitRecord {
            hash: format!("{:040x}", i),
            author: "dev".into(),
            timestamp: ts,
            message: format!("commit {}", i),
            lines_added: lines,
            lines_deleted: 0,
            files_changed: 1,
            is_code_commit: true,
        }
    }

    fn hackathon(start: DateTime<Utc>, end: DateTime<Utc>) -> Hackathon {
        Hackathon {
            id: "h1".into(),
            name: "Spring Hack".into(),
            start_date: Some(start),
            end_date: Some(end),
            use_judge_bot: true,
        }
    }

    fn detector() -> IrregularityDetector {
        IrregularityDetector::default()
    }

    #[test]
    fn test_single_huge_commit() {
        let commits = vec![commit(1, at(10, 0), 5000)];
        let report = detector().analyze(&commits, &hackathon(at(0, 0), at(48, 0)), None);

        let large = report
            .flags
            .iter()
            .find(|f| f.kind == FlagKind::LargeSingleCommit)
            .unwrap();
        assert_eq!(large.severity, Severity::High);
        assert!(report.risk_score.unwrap() >= 40);
        // minimal history fires too: 40 + 25
        assert_eq!(report.risk_score, Some(65));
    }

    #[test]
    fn test_two_commit_dump_in_ten_minutes() {
        let commits = vec![commit(1, at(5, 0), 600), commit(2, at(5, 10), 600)];
        let flags = detector().detect(&commits, None);

        let kinds: Vec<(FlagKind, Severity)> = flags.iter().map(|f| (f.kind, f.severity)).collect();
        assert_eq!(
            kinds,
            vec![
                (FlagKind::MinimalHistoryDump, Severity::Medium),
                (FlagKind::SuspiciousTiming, Severity::Medium),
            ]
        );
        assert_eq!(risk_score(&flags), 50);

        match &flags[1].metadata {
            FlagMetadata::SuspiciousTiming {
                development_time_hours,
                lines_per_hour,
                ..
            } => {
                assert_eq!(*development_time_hours, 0.17);
                assert_eq!(*lines_per_hour, Some(7200));
            }
            other => panic!("unexpected metadata {:?}", other),
        }
    }

    #[test]
    fn test_small_two_commit_history_is_large_single_commit() {
        // 540 + 60 lines: the 90% commit trips the 80% rule instead of timing
        let commits = vec![commit(1, at(5, 0), 540), commit(2, at(5, 10), 60)];
        let flags = detector().detect(&commits, None);
        let kinds: Vec<FlagKind> = flags.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FlagKind::LargeSingleCommit, FlagKind::MinimalHistoryDump]);
        assert_eq!(risk_score(&flags), 65);
    }

    #[test]
    fn test_healthy_history_has_no_flags() {
        let commits: Vec<CommitRecord> = (0..50).map(|i| commit(i, at(i as i64, 0), 40)).collect();
        let report = detector().analyze(&commits, &hackathon(at(0, 0), at(72, 0)), Some(CodeType::FreshCode));
        assert!(report.flags.is_empty());
        assert!(!report.is_flagged());
        assert_eq!(report.risk_score, None);
        assert_eq!(report.summary, None);
        assert_eq!(risk_score(&report.flags), 0);
        assert_eq!(report.code_type, Some(CodeType::FreshCode));
    }

    #[test]
    fn test_declared_fresh_code_with_older_history() {
        let commits: Vec<CommitRecord> = (0..50).map(|i| commit(i, at(i as i64, 0), 40)).collect();
        let event = hackathon(at(24, 0), at(96, 0));
        let report = detector().analyze(&commits, &event, Some(CodeType::FreshCode));

        assert_eq!(report.flags.len(), 1);
        assert_eq!(report.flags[0].kind, FlagKind::SuspiciousTiming);
        assert_eq!(report.flags[0].severity, Severity::High);
        assert_eq!(report.code_type, Some(CodeType::ExistingCode));
        assert_eq!(report.risk_score, Some(40));

        // Declared existing code is not contradicted
        let report = detector().analyze(&commits, &event, Some(CodeType::ExistingCode));
        assert!(report.flags.is_empty());
    }

    #[test]
    fn test_forced_flag_ignores_non_code_commits_filter() {
        let mut readme = commit(1, at(0, 0), 3);
        readme.is_code_commit = false;
        let commits = vec![readme, commit(2, at(30, 0), 50)];
        let report = detector().analyze(&commits, &hackathon(at(24, 0), at(96, 0)), Some(CodeType::FreshCode));
        assert!(report.has(FlagKind::SuspiciousTiming));
    }

    #[test]
    fn test_post_deadline_dump() {
        let commits = vec![
            commit(1, at(0, 0), 100),
            commit(2, at(10, 0), 100),
            commit(3, at(20, 0), 100),
            commit(4, at(30, 0), 100),
            commit(5, at(50, 0), 150),
            commit(6, at(51, 0), 100),
        ];
        let flags = detector().detect(&commits, Some(at(48, 0)));
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, FlagKind::PostDeadlineDump);
        assert_eq!(flags[0].description, "250 lines of code added after deadline");
        match &flags[0].metadata {
            FlagMetadata::PostDeadlineDump { commits, .. } => assert_eq!(commits.len(), 2),
            other => panic!("unexpected metadata {:?}", other),
        }
    }

    #[test]
    fn test_risk_score_is_capped() {
        let commits = vec![commit(1, at(50, 0), 5000), commit(2, at(50, 5), 10)];
        let report = detector().analyze(&commits, &hackathon(at(60, 0), at(48, 0)), Some(CodeType::FreshCode));
        // large (40) + minimal (25) + post-deadline (40) + timing (25) + forced (40)
        assert_eq!(report.flags.len(), 5);
        assert_eq!(report.risk_score, Some(100));
    }

    #[test]
    fn test_no_code_commits_no_flags() {
        let mut c = commit(1, at(0, 0), 10_000);
        c.is_code_commit = false;
        assert!(detector().detect(&[c], Some(at(-1, 0))).is_empty());
    }

    #[test]
    fn test_same_timestamp_has_no_rate() {
        let commits = vec![commit(1, at(3, 0), 700), commit(2, at(3, 0), 700)];
        let flags = detector().detect(&commits, None);
        let timing = flags.iter().find(|f| f.kind == FlagKind::SuspiciousTiming).unwrap();
        assert_eq!(timing.detailed_description(), "1400 lines of code committed in 0 hours");
    }

    #[test]
    fn test_summary_groups_by_severity() {
        let commits = vec![commit(1, at(10, 0), 5000)];
        let report = detector().analyze(&commits, &hackathon(at(0, 0), at(48, 0)), None);
        let summary = report.summary.unwrap();
        assert!(summary.starts_with("Irregularities detected:"));
        let critical = summary.find("Critical Issues:").unwrap();
        let moderate = summary.find("Moderate Concerns:").unwrap();
        assert!(critical < moderate);
        assert!(!summary.contains("Minor Issues"));
        assert!(summary.contains("(5000 lines in one commit, 100% of total 5000 lines)"));
        assert!(summary.contains("(averaging 5000 lines per commit)"));
        assert!(summary.ends_with("Overall Risk Score: 65/100"));
    }

    #[test]
    fn test_code_type_requires_event_start() {
        let commits = vec![commit(1, at(0, 0), 10)];
        assert_eq!(derive_code_type(&commits, None), None);
        assert_eq!(derive_code_type(&[], Some(at(0, 0))), None);
        assert_eq!(derive_code_type(&commits, Some(at(0, 0))), Some(CodeType::FreshCode));
    }
}
