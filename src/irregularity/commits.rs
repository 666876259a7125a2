//! Commit records and `git log --numstat` parsing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HistoryError;

/// Format string passed to `git log`; pair with `--numstat`
pub const GIT_LOG_FORMAT: &str = "%H|%aI|%an|%s";

/// File names (or fragments) that never count as source code
const NON_CODE_FILES: &[&str] = &[
    "readme",
    "license",
    "changelog",
    "contributing",
    "code_of_conduct",
    "gitignore",
    "gitattributes",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "composer.lock",
    "pipfile.lock",
    "poetry.lock",
    "cargo.lock",
    "go.sum",
];

/// Extensions recognised as source code
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "go", "py", "js", "jsx", "ts", "tsx", "mjs", "cjs", "java", "kt", "kts", "scala",
    "swift", "c", "h", "cc", "cpp", "hpp", "cs", "rb", "php", "sol", "move", "cairo", "vy",
    "dart", "ex", "exs", "erl", "hs", "ml", "clj", "lua", "r", "jl", "zig", "nim", "vue",
    "svelte", "astro", "html", "css", "scss", "sass", "less", "sql", "graphql", "proto", "sh",
    "bash", "ps1", "toml", "yaml", "yml", "json",
];

/// One repository commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub files_changed: usize,
    /// Touches at least one recognised source-code file
    pub is_code_commit: bool,
}

impl CommitRecord {
    pub fn short_hash(&self) -> &str {
        &self.hash[..8.min(self.hash.len())]
    }
}

/// Whether `path` is a recognised source-code file
pub fn is_code_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    if NON_CODE_FILES.iter().any(|name| lower.contains(name)) {
        return false;
    }
    match lower.rsplit_once('.') {
        Some((_, ext)) => CODE_EXTENSIONS.contains(&ext),
        None => false,
    }
}

fn parse_header(line: &str) -> Option<Result<CommitRecord, HistoryError>> {
    let parts: Vec<&str> = line.splitn(4, '|').collect();
    if parts.len() != 4 {
        return None;
    }
    let hash = parts[0].trim();
    if hash.len() < 7 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let timestamp = match DateTime::parse_from_rfc3339(parts[1].trim()) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            return Some(Err(HistoryError::Parse(format!(
                "bad timestamp '{}' for commit {}: {}",
                parts[1], hash, e
            ))))
        }
    };
    Some(Ok(CommitRecord {
        hash: hash.to_string(),
        author: parts[2].to_string(),
        timestamp,
        message: parts[3].to_string(),
        lines_added: 0,
        lines_deleted: 0,
        files_changed: 0,
        is_code_commit: false,
    }))
}

/// Parse `git log --format=GIT_LOG_FORMAT --numstat` output.
///
/// Returns commits oldest first. Binary files (`-` counts) add zero lines.
pub fn parse_git_log(output: &str) -> Result<Vec<CommitRecord>, HistoryError> {
    let mut commits = Vec::new();
    let mut current: Option<CommitRecord> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some(header) = parse_header(line) {
            if let Some(done) = current.take() {
                commits.push(done);
            }
            current = Some(header?);
            continue;
        }

        let Some(commit) = current.as_mut() else {
            continue;
        };

        let parts: Vec<&str> = line.trim().splitn(3, '\t').collect();
        if parts.len() < 3 {
            continue;
        }
        let added = parts[0].parse::<u64>().unwrap_or(0);
        let deleted = parts[1].parse::<u64>().unwrap_or(0);

        commit.lines_added += added;
        commit.lines_deleted += deleted;
        commit.files_changed += 1;
        if is_code_file(parts[2]) {
            commit.is_code_commit = true;
        }
    }

    if let Some(done) = current {
        commits.push(done);
    }

    // git log lists newest first
    commits.reverse();
    Ok(commits)
}
