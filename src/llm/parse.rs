//! Structured decoding of model output

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::debug;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[a-zA-Z]*").expect("valid code fence regex"));

/// Outcome of decoding model text as `T`
#[derive(Debug, Clone, PartialEq)]
pub enum Structured<T> {
    Parsed(T),
    /// The text could not be decoded; carries it unchanged
    Unstructured(String),
}

impl<T> Structured<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Structured::Parsed(_))
    }

    pub fn parsed(self) -> Option<T> {
        match self {
            Structured::Parsed(value) => Some(value),
            Structured::Unstructured(_) => None,
        }
    }
}

/// Remove markdown code fences (```json ... ```)
pub fn strip_code_fences(text: &str) -> String {
    CODE_FENCE.replace_all(text, "").into_owned()
}

/// Outermost `{ ... }` span of `text`
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Decode `raw` as `T`, falling back to the raw text
pub fn decode<T: DeserializeOwned>(raw: &str) -> Structured<T> {
    let cleaned = strip_code_fences(raw);
    let Some(object) = extract_json_object(&cleaned) else {
        debug!("No JSON object in model output ({} bytes)", raw.len());
        return Structured::Unstructured(raw.to_string());
    };
    match serde_json::from_str(object) {
        Ok(value) => Structured::Parsed(value),
        Err(e) => {
            debug!("Failed to decode model output: {}", e);
            Structured::Unstructured(raw.to_string())
        }
    }
}
