//! Prompt template file parsing.
//!
//! ```text
//! # comment
//! [config]
//! !MODE = standard
//! SCALE = 5-9
//!
//! [prompts 1-2 ", "]
//! a cat
//! a dog
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;
use crate::text;

/// Delimiter used when a section header names none.
pub const DEFAULT_DELIMITER: &str = " ";

static PROMPTS_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\[prompts(?:\s+(\d+)(?:\s*-\s*(\d+))?)?(?:\s+"([^"]*)")?\s*\]$"#)
        .expect("valid regex")
});

/// One `[prompts]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSection {
    pub tokens: Vec<String>,
    pub min_pick: usize,
    pub max_pick: usize,
    pub delimiter: String,
}

impl PromptSection {
    pub fn new(min_pick: usize, max_pick: usize, delimiter: impl Into<String>) -> Self {
        Self {
            tokens: Vec::new(),
            min_pick: min_pick.min(max_pick),
            max_pick: min_pick.max(max_pick),
            delimiter: delimiter.into(),
        }
    }

    pub fn is_fixed_pick(&self) -> bool {
        self.min_pick == self.max_pick
    }
}

/// A parsed template file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptTemplate {
    pub path: Option<PathBuf>,
    /// Raw `[config]` lines, in file order.
    pub config: Vec<String>,
    pub sections: Vec<PromptSection>,
    /// Problems found while parsing (unknown headers, stray lines).
    pub warnings: Vec<String>,
}

enum Block {
    None,
    Config,
    Prompts,
    Unknown,
}

impl PromptTemplate {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let mut template = Self::parse(&contents);
        template.path = Some(path.to_path_buf());
        Ok(template)
    }

    pub fn parse(contents: &str) -> Self {
        let mut template = Self::default();
        let mut block = Block::None;

        for raw in contents.lines() {
            let line = text::strip_comment(raw);
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                if line.eq_ignore_ascii_case("[config]") {
                    block = Block::Config;
                } else if let Some(section) = parse_prompts_header(line) {
                    template.sections.push(section);
                    block = Block::Prompts;
                } else {
                    template
                        .warnings
                        .push(format!("unrecognized section header {line}; its lines are ignored"));
                    block = Block::Unknown;
                }
                continue;
            }

            match block {
                Block::Config => template.config.push(line.to_string()),
                Block::Prompts => {
                    if let Some(section) = template.sections.last_mut() {
                        section.tokens.push(line.to_string());
                    }
                }
                Block::None => template
                    .warnings
                    .push(format!("line outside any section ignored: {line}")),
                Block::Unknown => {}
            }
        }

        template
    }
}

fn parse_prompts_header(line: &str) -> Option<PromptSection> {
    let caps = PROMPTS_HEADER_RE.captures(line)?;
    let min = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(1);
    let max = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(min);
    let delimiter = caps
        .get(3)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_DELIMITER.to_string());
    Some(PromptSection::new(min, max, delimiter))
}
