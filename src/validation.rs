//! Submission validation
//!
//! Runs before any pipeline work. An invalid project is excluded from the
//! run and a review note is recorded; once corrected, clearing the note
//! makes it eligible again. A missing description is allowed.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Project;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Every problem found with `project`; empty when valid
pub fn validate_project(project: &Project) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if project.name.trim().is_empty() {
        errors.push(ValidationError::new("name", "must not be empty"));
    }

    match Url::parse(project.project_url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {}
        Ok(url) => errors.push(ValidationError::new(
            "project_url",
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new(
            "project_url",
            format!("not a valid URL ({})", e),
        )),
    }

    if project.challenges.is_empty() {
        errors.push(ValidationError::new("challenges", "no associated challenges"));
    }

    errors
}

/// `"field: reason, field: reason"` note recorded for invalid projects
pub fn review_note(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
