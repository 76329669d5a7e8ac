//! Defensive extraction of JSON payloads embedded in model-generated text.
//!
//! Payloads are located by a character scanner that tracks string boundaries,
//! escape state, and a stack of open brackets, so nested objects and quoted
//! braces never terminate a payload early.

use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JsonExtractError {
    #[error("marker `{0}` not found")]
    MarkerNotFound(String),
    #[error("no JSON object or array follows the marker")]
    NoPayload,
    #[error("payload starting at byte {0} is not balanced")]
    Unbalanced(usize),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Returns the end offset (exclusive) of the balanced object/array opening at `start`.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut expected_closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => expected_closers.push('}'),
            '[' => expected_closers.push(']'),
            '}' | ']' => {
                if expected_closers.pop() != Some(ch) {
                    return None;
                }
                if expected_closers.is_empty() {
                    return Some(start + offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }

    None
}

fn payload_start(text: &str, from: usize) -> Option<usize> {
    text[from..]
        .find(['{', '['])
        .map(|offset| from + offset)
}

fn parse_span(text: &str, start: usize) -> Result<(Value, usize), JsonExtractError> {
    let end = balanced_end(text, start).ok_or(JsonExtractError::Unbalanced(start))?;
    let value = serde_json::from_str(&text[start..end])
        .map_err(|err| JsonExtractError::InvalidJson(err.to_string()))?;
    Ok((value, end))
}

/// Extract the JSON payload following the first occurrence of `marker`.
///
/// # Errors
/// Returns an error when the marker is absent, no payload follows it, or the
/// payload is unbalanced or invalid JSON.
pub fn extract_json_after_marker(text: &str, marker: &str) -> Result<Value, JsonExtractError> {
    let marker_at = text
        .find(marker)
        .ok_or_else(|| JsonExtractError::MarkerNotFound(marker.to_string()))?;
    let start =
        payload_start(text, marker_at + marker.len()).ok_or(JsonExtractError::NoPayload)?;
    parse_span(text, start).map(|(value, _)| value)
}

/// Split `text` into the prose and its last line when that line starts with
/// `marker`. Payload lines are compact JSON, so they never span lines.
fn split_trailing_line<'t>(text: &'t str, marker: &str) -> Option<(&'t str, &'t str)> {
    let trimmed = text.trim_end();
    let (prose, last) = trimmed.rsplit_once('\n').unwrap_or(("", trimmed));
    let last = last.trim_start();
    last.starts_with(marker).then_some((prose, last))
}

/// Extract the payload of the trailing `marker` line appended by the author
/// of `text`. Marker occurrences anywhere else are ordinary prose.
///
/// # Errors
/// Returns `MarkerNotFound` when the last line does not start with `marker`,
/// otherwise the errors of [`extract_json_after_marker`].
pub fn extract_trailing_payload(text: &str, marker: &str) -> Result<Value, JsonExtractError> {
    let (_, line) = split_trailing_line(text, marker)
        .ok_or_else(|| JsonExtractError::MarkerNotFound(marker.to_string()))?;
    extract_json_after_marker(line, marker)
}

/// Extract the first balanced `{...}` object in free text that parses as JSON.
///
/// # Errors
/// Returns the error of the last candidate tried, or `NoPayload` when the text
/// contains no opening brace.
pub fn extract_first_json_object(text: &str) -> Result<Value, JsonExtractError> {
    let mut last_err = JsonExtractError::NoPayload;
    for (start, _) in text.match_indices('{') {
        match parse_span(text, start) {
            Ok((value, _)) => return Ok(value),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

/// Remove `<think>...</think>` reasoning blocks. An unterminated block is
/// dropped through the end of the text.
#[must_use]
pub fn strip_thinking(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open_at) = rest.find(OPEN) {
        out.push_str(&rest[..open_at]);
        let after_open = &rest[open_at + OPEN.len()..];
        match after_open.find(CLOSE) {
            Some(close_at) => rest = &after_open[close_at + CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Drop trailing payload lines starting with any of `markers`, keeping all
/// prose above them.
#[must_use]
pub fn strip_trailing_payloads(text: &str, markers: &[&str]) -> String {
    let mut rest = text.trim_end();
    while let Some((prose, _)) = markers
        .iter()
        .find_map(|marker| split_trailing_line(rest, marker))
    {
        rest = prose.trim_end();
    }
    rest.to_string()
}
