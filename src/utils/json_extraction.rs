//! JSON extraction from raw transform output.
//!
//! Models often wrap the JSON they were asked for in markdown fences or
//! surround it with reasoning text. Every transform call site in the
//! pipeline expects a single JSON object, so extraction tries, in order:
//! 1. The whole text, when it is exactly one object
//! 2. A ```json fenced block
//! 3. Any fenced block containing an object
//! 4. A leading balanced object followed by trailing text
//! 5. The largest balanced object anywhere, preferring later ones
//!
//! ```
//! use onto_forge::utils::json_extraction::extract_json_object;
//!
//! let raw = "Sure, here it is:\n```json\n{\"confidence\": 90, \"problem\": \"\"}\n```";
//! let json = extract_json_object(raw).unwrap();
//! assert!(json.starts_with('{'));
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Why no usable JSON object could be taken from a response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces, {unclosed_brackets} unclosed brackets. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },

    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },

    #[error("Response does not match the expected schema: {0}")]
    Schema(String),
}

/// Brace/bracket balance of a piece of text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonStructureAnalysis {
    pub unclosed_braces: usize,
    pub unclosed_brackets: usize,
    /// Whether the scan ended inside a string literal.
    pub in_string: bool,
    /// Byte offset of the first '{' or '['.
    pub json_start: Option<usize>,
}

impl JsonStructureAnalysis {
    pub fn is_unbalanced(&self) -> bool {
        self.unclosed_braces > 0 || self.unclosed_brackets > 0 || self.in_string
    }
}

/// Tracks string literals and escapes while walking JSON-ish text.
struct Scanner {
    in_string: bool,
    escape_next: bool,
}

impl Scanner {
    fn new() -> Self {
        Self {
            in_string: false,
            escape_next: false,
        }
    }

    /// Returns the character if it is structural (outside a string).
    fn structural(&mut self, c: char) -> Option<char> {
        if self.escape_next {
            self.escape_next = false;
            return None;
        }
        match c {
            '\\' if self.in_string => {
                self.escape_next = true;
                None
            }
            '"' => {
                self.in_string = !self.in_string;
                None
            }
            _ if self.in_string => None,
            _ => Some(c),
        }
    }
}

/// Scans `s` and reports how many braces and brackets are left open.
pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let mut scanner = Scanner::new();
    let mut braces: isize = 0;
    let mut brackets: isize = 0;
    let mut json_start = None;

    for (i, c) in s.char_indices() {
        match scanner.structural(c) {
            Some('{') => {
                json_start.get_or_insert(i);
                braces += 1;
            }
            Some('}') => braces -= 1,
            Some('[') => {
                json_start.get_or_insert(i);
                brackets += 1;
            }
            Some(']') => brackets -= 1,
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: braces.max(0) as usize,
        unclosed_brackets: brackets.max(0) as usize,
        in_string: scanner.in_string,
        json_start,
    }
}

/// Index of the '}' closing the object that `s` starts with.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut scanner = Scanner::new();
    let mut depth = 0usize;

    for (i, c) in s.char_indices() {
        match scanner.structural(c) {
            Some('{') => depth += 1,
            Some('}') => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn json_fence() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").ok())
        .as_ref()
}

fn any_fence() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok())
        .as_ref()
}

fn is_json_object(candidate: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(candidate),
        Ok(serde_json::Value::Object(_))
    )
}

/// The first balanced object inside `block`, if it parses.
fn object_in(block: &str) -> Option<String> {
    let start = block.find('{')?;
    let end = find_matching_brace(&block[start..])?;
    let candidate = &block[start..=start + end];
    is_json_object(candidate).then(|| candidate.to_string())
}

/// The largest valid object in `content`; ties go to the later one.
///
/// Reasoning text before the answer can contain small example objects, while
/// the answer itself is usually the biggest and last.
fn largest_object(content: &str) -> Option<String> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            let end = find_matching_brace(&content[start..])?;
            let candidate = &content[start..=start + end];
            is_json_object(candidate).then_some((start, candidate))
        })
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json.to_string())
}

fn preview(s: &str) -> String {
    s.chars().take(100).collect()
}

/// Extracts a single JSON object from a raw response.
pub fn extract_json_object(content: &str) -> Result<String, JsonExtractionError> {
    let trimmed = content.trim();

    // A bare object may itself contain fenced markdown, so try it whole first.
    if is_json_object(trimmed) {
        return Ok(trimmed.to_string());
    }

    for fence in [json_fence(), any_fence()].into_iter().flatten() {
        if let Some(found) = fence
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .and_then(|block| object_in(block.as_str()))
        {
            return Ok(found);
        }
    }

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            if is_json_object(&trimmed[..=end]) {
                return Ok(trimmed[..=end].to_string());
            }
        }
    }

    if let Some(found) = largest_object(trimmed) {
        return Ok(found);
    }

    let analysis = analyze_json_structure(trimmed);
    if let Some(start) = analysis.json_start {
        if analysis.is_unbalanced() {
            return Err(JsonExtractionError::Truncated {
                partial_preview: preview(&trimmed[start..]),
                unclosed_braces: analysis.unclosed_braces,
                unclosed_brackets: analysis.unclosed_brackets,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: preview(trimmed),
    })
}

/// Extracts the JSON object from a response and deserializes it into `T`.
///
/// Unknown fields are ignored; missing required fields or wrong types are a
/// [`JsonExtractionError::Schema`] error.
pub fn parse_json_response<T: DeserializeOwned>(content: &str) -> Result<T, JsonExtractionError> {
    let json = extract_json_object(content)?;
    serde_json::from_str(&json).map_err(|e| JsonExtractionError::Schema(e.to_string()))
}
