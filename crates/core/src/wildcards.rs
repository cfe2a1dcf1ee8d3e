//! `__name__` wildcard substitution.
//!
//! Wildcards are user files of one token per line; the file stem
//! (lowercased) is the wildcard name. Every name gets a working pool that
//! is flattened before any draw: a token that is itself exactly another
//! `__name__` is replaced by that table's tokens, recursively, with cycles
//! cut. Draws are uniform without replacement; an exhausted pool yields an
//! empty string.
//!
//! Several text fields can be expanded together with [`expand_fields`].
//! The k-th occurrence of a name resolves to the same draw in every field,
//! so a prompt and its descriptive metadata never disagree.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use rand::Rng;
use regex::{Captures, Regex};
use walkdir::WalkDir;

use crate::error::CoreError;
use crate::job::IptcFields;
use crate::text;

/// Upper bound on re-expansion passes for tokens that embed placeholders.
pub const MAX_EXPANSION_PASSES: usize = 16;

/// Reserved placeholder replaced by the job's IPTC title.
pub const IPTC_TITLE_PLACEHOLDER: &str = "__!iptc_title__";
/// Reserved placeholder replaced by the job's IPTC description.
pub const IPTC_DESCRIPTION_PLACEHOLDER: &str = "__!iptc_description__";
/// Reserved placeholder replaced by the job's IPTC keywords.
pub const IPTC_KEYWORDS_PLACEHOLDER: &str = "__!iptc_keywords__";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__([A-Za-z0-9][A-Za-z0-9_\-]*?)__").expect("valid regex"));

/// Name -> token list.
#[derive(Debug, Clone, Default)]
pub struct WildcardTable {
    entries: HashMap<String, Vec<String>>,
}

impl WildcardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.txt` file under `dir`. A missing directory yields an
    /// empty table.
    pub fn load_dir(dir: &Path) -> Result<Self, CoreError> {
        let mut table = Self::new();
        if !dir.is_dir() {
            return Ok(table);
        }

        for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            let is_txt = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("txt"));
            if !entry.file_type().is_file() || !is_txt {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            table.insert(stem, text::read_lines(path)?);
        }
        Ok(table)
    }

    pub fn insert(&mut self, name: &str, tokens: Vec<String>) {
        self.entries.insert(name.to_lowercase(), tokens);
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries.get(&name.to_lowercase()).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The flattened working pool for `name`.
    pub fn pool(&self, name: &str) -> Vec<String> {
        let name = name.to_lowercase();
        let mut visited = HashSet::from([name.clone()]);
        let mut out = Vec::new();
        self.flatten_into(&name, &mut visited, &mut out);
        out
    }

    fn flatten_into(&self, name: &str, visited: &mut HashSet<String>, out: &mut Vec<String>) {
        let Some(tokens) = self.entries.get(name) else {
            return;
        };
        for token in tokens {
            match whole_reference(token) {
                Some(inner) if self.entries.contains_key(&inner) => {
                    if visited.insert(inner.clone()) {
                        self.flatten_into(&inner, visited, out);
                        visited.remove(&inner);
                    }
                }
                _ => out.push(token.clone()),
            }
        }
    }
}

/// If `token` is exactly one `__name__` placeholder, return the name.
fn whole_reference(token: &str) -> Option<String> {
    let token = token.trim();
    let caps = PLACEHOLDER_RE.captures(token)?;
    let whole = caps.get(0)?;
    (whole.start() == 0 && whole.end() == token.len()).then(|| caps[1].to_lowercase())
}

/// Draw state shared by all fields of one expansion.
struct DrawState<'a> {
    table: &'a WildcardTable,
    pools: HashMap<String, Vec<String>>,
    draws: HashMap<String, Vec<String>>,
}

impl<'a> DrawState<'a> {
    fn new(table: &'a WildcardTable) -> Self {
        Self {
            table,
            pools: HashMap::new(),
            draws: HashMap::new(),
        }
    }

    /// The `occurrence`-th draw for `name`, drawing more as needed.
    fn draw<R: Rng + ?Sized>(&mut self, name: &str, occurrence: usize, rng: &mut R) -> String {
        let table = self.table;
        let pool = self
            .pools
            .entry(name.to_string())
            .or_insert_with(|| table.pool(name));
        let draws = self.draws.entry(name.to_string()).or_default();

        while draws.len() <= occurrence {
            if pool.is_empty() {
                draws.push(String::new());
            } else {
                let idx = rng.random_range(0..pool.len());
                draws.push(pool.swap_remove(idx));
            }
        }
        draws[occurrence].clone()
    }

    /// Expand one field, re-passing over drawn tokens that embed further
    /// placeholders.
    fn expand_field<R: Rng + ?Sized>(&mut self, text: &str, rng: &mut R) -> String {
        let mut occurrences: HashMap<String, usize> = HashMap::new();
        let mut current = text.to_string();

        for _ in 0..MAX_EXPANSION_PASSES {
            if !self.has_known_placeholder(&current) {
                break;
            }
            current = PLACEHOLDER_RE
                .replace_all(&current, |caps: &Captures| {
                    let name = caps[1].to_lowercase();
                    if !self.table.contains(&name) {
                        return caps[0].to_string();
                    }
                    let counter = occurrences.entry(name.clone()).or_insert(0);
                    let occurrence = *counter;
                    *counter += 1;
                    self.draw(&name, occurrence, &mut *rng)
                })
                .into_owned();
        }
        current
    }

    fn has_known_placeholder(&self, text: &str) -> bool {
        PLACEHOLDER_RE
            .captures_iter(text)
            .any(|caps| self.table.contains(&caps[1]))
    }
}

/// Expand the wildcards in a single string.
pub fn expand<R: Rng + ?Sized>(text: &str, table: &WildcardTable, rng: &mut R) -> String {
    DrawState::new(table).expand_field(text, rng)
}

/// Expand several fields in lock-step: the k-th occurrence of a name gets
/// the same token in every field.
pub fn expand_fields<R: Rng + ?Sized>(fields: &mut [&mut String], table: &WildcardTable, rng: &mut R) {
    if table.is_empty() {
        return;
    }
    let mut state = DrawState::new(table);
    for field in fields.iter_mut() {
        let expanded = state.expand_field(field, rng);
        **field = expanded;
    }
}

/// Replace the reserved `__!iptc_*__` placeholders with whole field values.
pub fn substitute_reserved(text: &str, iptc: &IptcFields) -> String {
    if !text.contains("__!") {
        return text.to_string();
    }
    replace_ci(
        &replace_ci(
            &replace_ci(text, IPTC_TITLE_PLACEHOLDER, &iptc.title),
            IPTC_DESCRIPTION_PLACEHOLDER,
            &iptc.description,
        ),
        IPTC_KEYWORDS_PLACEHOLDER,
        &iptc.keywords,
    )
}

fn replace_ci(text: &str, needle: &str, replacement: &str) -> String {
    let pattern = format!("(?i){}", regex::escape(needle));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, regex::NoExpand(replacement)).into_owned(),
        Err(_) => text.to_string(),
    }
}
