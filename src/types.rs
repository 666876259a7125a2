//! Shared domain types
//!
//! Projects and challenges come from the backlog; dimension results and
//! verdicts are produced by the evaluation pipeline and persisted by the
//! verdict store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::irregularity::IrregularityReport;

/// Hackathon (event) a project was submitted to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hackathon {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Whether automated judging is enabled for this event
    #[serde(default)]
    pub use_judge_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Self-declared (or derived) origin of a project's code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeType {
    /// Written during the event
    FreshCode,
    /// Existed before the event started
    ExistingCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Repository URL
    pub project_url: String,
    #[serde(default)]
    pub hackathon: Hackathon,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub code_type: Option<CodeType>,
}

impl Project {
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }

    pub fn challenge_ids(&self) -> Vec<String> {
        self.challenges.iter().map(|c| c.id.clone()).collect()
    }
}

/// One of the four independent analysis axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Technical,
    Ux,
    Business,
    Innovation,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Technical,
        Dimension::Ux,
        Dimension::Business,
        Dimension::Innovation,
    ];

    /// Weight of this dimension in the final verdict
    pub fn weight(&self) -> f64 {
        match self {
            Dimension::Technical => 0.30,
            Dimension::Innovation => 0.30,
            Dimension::Ux => 0.20,
            Dimension::Business => 0.20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Technical => "technical",
            Dimension::Ux => "ux",
            Dimension::Business => "business",
            Dimension::Innovation => "innovation",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Dimension::Technical => "Technical Implementation",
            Dimension::Ux => "User Experience",
            Dimension::Business => "Business Potential",
            Dimension::Innovation => "Innovation",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one analysis dimension for one challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionResult {
    pub full_analysis: String,
    pub summary: String,
    /// Score on a 0-10 scale
    pub score: f64,
    /// Set when this result is a placeholder for a failed analysis
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl DimensionResult {
    pub fn new(full_analysis: impl Into<String>, summary: impl Into<String>, score: f64) -> Self {
        Self {
            full_analysis: full_analysis.into(),
            summary: summary.into(),
            score: score.clamp(0.0, 10.0),
            degraded: false,
        }
    }

    /// Placeholder used in degraded mode when a dimension exhausted its retries
    pub fn failed() -> Self {
        Self {
            full_analysis: String::new(),
            summary: "Analysis failed".to_string(),
            score: 0.0,
            degraded: true,
        }
    }
}

/// The four dimension results of one challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSet {
    pub technical: DimensionResult,
    pub ux: DimensionResult,
    pub business: DimensionResult,
    pub innovation: DimensionResult,
}

impl DimensionSet {
    pub fn get(&self, dimension: Dimension) -> &DimensionResult {
        match dimension {
            Dimension::Technical => &self.technical,
            Dimension::Ux => &self.ux,
            Dimension::Business => &self.business,
            Dimension::Innovation => &self.innovation,
        }
    }

    /// Weighted score computed locally from the four dimension scores
    pub fn weighted_score(&self) -> f64 {
        Dimension::ALL
            .iter()
            .map(|d| self.get(*d).score * d.weight())
            .sum()
    }

    pub fn is_degraded(&self) -> bool {
        Dimension::ALL.iter().any(|d| self.get(*d).degraded)
    }
}

/// Dimension results plus the synthesized final result for one challenge.
///
/// Only constructed from a complete `DimensionSet`, so the final result can
/// never exist without all four dimensions (or their placeholders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeVerdict {
    #[serde(flatten)]
    pub dimensions: DimensionSet,
    #[serde(rename = "final")]
    pub final_result: DimensionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub irregularities: Option<IrregularityReport>,
}

impl ChallengeVerdict {
    pub fn new(dimensions: DimensionSet, final_result: DimensionResult) -> Self {
        Self {
            dimensions,
            final_result,
            irregularities: None,
        }
    }

    pub fn score(&self) -> f64 {
        self.final_result.score
    }

    pub fn is_degraded(&self) -> bool {
        self.dimensions.is_degraded() || self.final_result.degraded
    }
}
