//! Plain-text helpers shared by the template, wildcard, and registry readers.

use std::path::Path;

use crate::error::CoreError;

/// Strip a trailing `#` comment and surrounding whitespace from a line.
pub fn strip_comment(line: &str) -> &str {
    match line.split_once('#') {
        Some((before, _)) => before.trim(),
        None => line.trim(),
    }
}

/// Read a text file into its non-empty lines with comments removed.
pub fn read_lines(path: &Path) -> Result<Vec<String>, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
    Ok(content_lines(&contents))
}

/// Split already-loaded text into non-empty, comment-free lines.
pub fn content_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(strip_comment)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join prompt fragments with `delimiter`.
///
/// A fragment starting with `,` or `;` attaches directly to the previous
/// fragment. Empty fragments are skipped.
pub fn join_fragments<S: AsRef<str>>(fragments: &[S], delimiter: &str) -> String {
    let mut out = String::new();
    for fragment in fragments.iter().map(AsRef::as_ref) {
        if fragment.is_empty() {
            continue;
        }
        if !out.is_empty() && !(fragment.starts_with(',') || fragment.starts_with(';')) {
            out.push_str(delimiter);
        }
        out.push_str(fragment);
    }
    out
}

/// Tidy up punctuation left behind by token sampling.
pub fn clean_prompt(prompt: &str) -> String {
    let cleaned = prompt
        .replace(",,", ",")
        .replace(", ,", ",")
        .replace(" and,", ",")
        .replace(" by and ", " by ");
    cleaned.trim().trim_matches(',').trim().to_string()
}

/// Parse a `yes`/`no` flag (case-insensitive).
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" => Some(true),
        "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Remove one pair of surrounding double quotes, if present.
pub fn unquote(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}
