//! Content chunker
//!
//! Splits oversized documents into token-bounded chunks broken at
//! structural boundaries, and merges per-chunk analyses back into one
//! project analysis.
//!
//! Two paths exist and must not be confused:
//! - `plan` is lossless: concatenating the chunks gives back the input.
//! - `truncate` is lossy and labels its output with `TRUNCATION_MARKER`.

use indexmap::IndexSet;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::config::ChunkerConfig;

/// Characters per token used by the size heuristic
pub const CHARS_PER_TOKEN: usize = 4;

/// Appended to truncated documents
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Share of the character budget kept by `truncate`
const TRUNCATE_FILL: f64 = 0.8;

/// Split boundaries, most structural first. Cuts happen after the boundary.
const BOUNDARIES: &[&[&str]] = &[
    &["</file>"],
    &["\n\n"],
    &["\n"],
    &[". ", "! ", "? "],
    &[" "],
];

const FALLBACK_DESCRIPTION: &str = "A software project with multiple components and features.";
const FALLBACK_NAME: &str = "Analyzed Project";

/// Cheap token estimate: one token per four bytes, rounded up
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Ordered chunks of one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    chunks: Vec<String>,
}

impl ChunkPlan {
    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.chunks.len() == 1
    }

    pub fn into_chunks(self) -> Vec<String> {
        self.chunks
    }

    /// Concatenation of all chunks
    pub fn reconstruct(&self) -> String {
        self.chunks.concat()
    }
}

/// Result of the lossy truncation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Truncation {
    /// Input fit the budget and is returned as-is
    Intact(String),
    /// Input was cut; `text` ends with `TRUNCATION_MARKER`
    Truncated { text: String, dropped_bytes: usize },
}

impl Truncation {
    pub fn is_lossy(&self) -> bool {
        matches!(self, Truncation::Truncated { .. })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Truncation::Intact(text) => text,
            Truncation::Truncated { text, .. } => text,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Truncation::Intact(text) => text,
            Truncation::Truncated { text, .. } => text,
        }
    }
}

/// Structured analysis of one chunk, as returned by the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAnalysis {
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub project_name_hints: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Challenge ids this chunk suggests; accepts numbers or strings
    #[serde(default, deserialize_with = "challenge_ids")]
    pub potential_challenges: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Condensed technical notes used in place of the raw chunk
    #[serde(default)]
    pub technical_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeMatch {
    pub challenge_id: String,
    pub votes: usize,
}

/// Merged view over every chunk of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAnalysis {
    pub name: String,
    pub tagline: String,
    pub description: String,
    pub technologies: Vec<String>,
    pub features: Vec<String>,
    /// Accepted challenge matches, most votes first
    pub matched_challenges: Vec<ChallengeMatch>,
    pub chunk_count: usize,
}

fn challenge_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        })
        .collect())
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[derive(Debug, Clone)]
pub struct ContentChunker {
    config: ChunkerConfig,
}

impl Default for ContentChunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

impl ContentChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn estimate_size(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    /// Split `text` into chunks of at most `max_tokens` estimated tokens.
    ///
    /// Each cut is placed after the most structural boundary whose position
    /// keeps the chunk at least `min_fill_ratio` full; otherwise the chunk is
    /// cut at the byte budget (on a char boundary).
    pub fn plan(&self, text: &str, max_tokens: usize) -> ChunkPlan {
        if estimate_tokens(text) <= max_tokens {
            return ChunkPlan {
                chunks: vec![text.to_string()],
            };
        }

        let target = max_tokens.max(1) * CHARS_PER_TOKEN;
        let min_fill = ((target as f64) * self.config.min_fill_ratio).floor() as usize;

        let mut chunks = Vec::new();
        let mut rest = text;

        while rest.len() > target {
            let end = floor_char_boundary(rest, target);
            let window = &rest[..end];

            let cut = BOUNDARIES
                .iter()
                .find_map(|group| {
                    group
                        .iter()
                        .filter_map(|pat| window.rfind(pat).map(|i| i + pat.len()))
                        .max()
                        .filter(|cut| *cut >= min_fill && *cut > 0)
                })
                .unwrap_or(end);

            // A budget smaller than one char still has to make progress
            let cut = if cut == 0 { ceil_char_boundary(rest, 1) } else { cut };

            let (head, tail) = rest.split_at(cut);
            chunks.push(head.to_string());
            rest = tail;
        }

        if !rest.is_empty() {
            chunks.push(rest.to_string());
        }

        ChunkPlan { chunks }
    }

    /// Lossy fallback: keep 80% of the character budget and mark the cut
    pub fn truncate(&self, text: &str, max_tokens: usize) -> Truncation {
        if estimate_tokens(text) <= max_tokens {
            return Truncation::Intact(text.to_string());
        }
        let keep = ((max_tokens * CHARS_PER_TOKEN) as f64 * TRUNCATE_FILL).floor() as usize;
        let keep = floor_char_boundary(text, keep);
        Truncation::Truncated {
            text: format!("{}{}", &text[..keep], TRUNCATION_MARKER),
            dropped_bytes: text.len() - keep,
        }
    }

    /// Merge per-chunk analyses into one project analysis.
    ///
    /// Technologies are a sorted, deduplicated union, so the field does not
    /// depend on chunk order. A challenge is accepted when at least
    /// `ceil(chunks * vote_ratio)` chunks propose it.
    pub fn merge_chunk_analyses(&self, results: &[ChunkAnalysis]) -> ProjectAnalysis {
        let mut technologies = BTreeSet::new();
        let mut name_hints = IndexSet::new();
        let mut features = IndexSet::new();
        let mut votes: HashMap<String, usize> = HashMap::new();
        let mut descriptions = Vec::new();

        for result in results {
            technologies.extend(
                result
                    .technologies
                    .iter()
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
            name_hints.extend(
                result
                    .project_name_hints
                    .iter()
                    .map(|h| h.trim())
                    .filter(|h| !h.is_empty())
                    .map(str::to_string),
            );
            features.extend(
                result
                    .features
                    .iter()
                    .map(|f| f.trim())
                    .filter(|f| !f.is_empty())
                    .map(str::to_string),
            );

            let proposed: BTreeSet<&String> = result.potential_challenges.iter().collect();
            for id in proposed {
                *votes.entry(id.clone()).or_insert(0) += 1;
            }

            let description = result.description.trim();
            if !description.is_empty() {
                descriptions.push(description.to_string());
            }
        }

        // Epsilon keeps 10 * 0.3 at 3 rather than 3.0000000000000004
        let threshold = ((results.len() as f64) * self.config.vote_ratio - 1e-9).ceil() as usize;
        let mut matched_challenges: Vec<ChallengeMatch> = votes
            .into_iter()
            .filter(|(_, count)| *count >= threshold.max(1))
            .map(|(challenge_id, votes)| ChallengeMatch { challenge_id, votes })
            .collect();
        matched_challenges.sort_by(|a, b| {
            b.votes
                .cmp(&a.votes)
                .then_with(|| a.challenge_id.cmp(&b.challenge_id))
        });

        let technologies: Vec<String> = technologies.into_iter().collect();
        let tagline = if technologies.is_empty() {
            "A comprehensive software solution".to_string()
        } else {
            format!(
                "A comprehensive solution built with {}",
                technologies.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
            )
        };

        ProjectAnalysis {
            name: name_hints
                .first()
                .cloned()
                .unwrap_or_else(|| FALLBACK_NAME.to_string()),
            tagline,
            description: if descriptions.is_empty() {
                FALLBACK_DESCRIPTION.to_string()
            } else {
                descriptions.join(" ")
            },
            technologies,
            features: features.into_iter().collect(),
            matched_challenges,
            chunk_count: results.len(),
        }
    }
}
