//! Model trigger-phrase registry and prompt insertion.
//!
//! The registry file holds one `model-name, trigger-phrase` line per
//! checkpoint. It is synced against the backend's model list at bootstrap:
//! new models are added with an empty phrase, removed models are dropped,
//! and phrases the user has filled in are preserved.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capabilities::ModelInfo;
use crate::error::CoreError;
use crate::text;

// ---------------------------------------------------------------------------
// Placement policy
// ---------------------------------------------------------------------------

/// Where a model's trigger phrase is inserted into a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPlacement {
    #[default]
    Off,
    Start,
    End,
    FirstComma,
    /// Replace the first occurrence of the keyword.
    Keyword(String),
}

impl FromStr for TriggerPlacement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let lowered = value.to_ascii_lowercase();
        match lowered.as_str() {
            "off" | "no" | "" => Ok(Self::Off),
            "start" | "yes" => Ok(Self::Start),
            "end" => Ok(Self::End),
            "first_comma" => Ok(Self::FirstComma),
            _ if lowered.starts_with("keyword:") => {
                let keyword = value["keyword:".len()..].trim();
                if keyword.is_empty() {
                    Err("keyword placement needs a word".to_string())
                } else {
                    Ok(Self::Keyword(keyword.to_string()))
                }
            }
            _ => Err(format!("unknown trigger placement '{value}'")),
        }
    }
}

impl fmt::Display for TriggerPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::Start => f.write_str("start"),
            Self::End => f.write_str("end"),
            Self::FirstComma => f.write_str("first_comma"),
            Self::Keyword(word) => write!(f, "keyword:{word}"),
        }
    }
}

/// Insert `trigger` into `prompt` according to `placement`.
///
/// Prompts that already contain the phrase (case-insensitive) are returned
/// unchanged. `first_comma` without a comma appends at the end; a missing
/// keyword falls back to prepending.
pub fn insert_trigger(prompt: &str, trigger: &str, placement: &TriggerPlacement) -> String {
    let trigger = trigger.trim();
    if trigger.is_empty()
        || *placement == TriggerPlacement::Off
        || prompt.to_lowercase().contains(&trigger.to_lowercase())
    {
        return prompt.to_string();
    }

    let prompt = prompt.trim();
    if prompt.is_empty() {
        return trigger.to_string();
    }

    match placement {
        TriggerPlacement::Off => prompt.to_string(),
        TriggerPlacement::Start => format!("{trigger}, {prompt}"),
        TriggerPlacement::End => format!("{prompt}, {trigger}"),
        TriggerPlacement::FirstComma => match prompt.find(',') {
            Some(idx) => {
                let (head, tail) = prompt.split_at(idx + 1);
                format!("{head} {trigger},{tail}")
            }
            None => format!("{prompt}, {trigger}"),
        },
        TriggerPlacement::Keyword(word) => match find_ci(prompt, word) {
            Some(idx) => format!(
                "{}{}{}",
                &prompt[..idx],
                trigger,
                &prompt[idx + word.len()..]
            ),
            None => format!("{trigger}, {prompt}"),
        },
    }
}

/// Byte offset of the first case-insensitive occurrence of `needle`.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| {
            haystack
                .get(i..i + needle.len())
                .is_some_and(|s| s.eq_ignore_ascii_case(needle))
        })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One registry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEntry {
    pub model: String,
    pub trigger: String,
}

/// The on-disk model to trigger-phrase mapping.
#[derive(Debug, Clone, Default)]
pub struct TriggerRegistry {
    path: PathBuf,
    entries: Vec<TriggerEntry>,
}

impl TriggerRegistry {
    /// Load the registry; a missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let entries = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(CoreError::io(path, e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn parse(contents: &str) -> Vec<TriggerEntry> {
        text::content_lines(contents)
            .into_iter()
            .map(|line| match line.split_once(',') {
                Some((model, trigger)) => TriggerEntry {
                    model: model.trim().to_string(),
                    trigger: trigger.trim().to_string(),
                },
                None => TriggerEntry {
                    model: line.trim().to_string(),
                    trigger: String::new(),
                },
            })
            .filter(|e| !e.model.is_empty())
            .collect()
    }

    pub fn entries(&self) -> &[TriggerEntry] {
        &self.entries
    }

    /// The non-empty trigger phrase for `model`, if any.
    ///
    /// Matches the stored name exactly (case-insensitive) or with the
    /// backend's ` [hash]` suffix removed.
    pub fn lookup(&self, model: &str) -> Option<&str> {
        let short = strip_hash(model);
        self.entries
            .iter()
            .find(|e| e.model.eq_ignore_ascii_case(model) || e.model.eq_ignore_ascii_case(short))
            .map(|e| e.trigger.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Reconcile with the backend's model list. Returns `true` if the
    /// registry changed and should be saved.
    pub fn sync(&mut self, models: &[ModelInfo]) -> bool {
        let names: Vec<&str> = models.iter().map(|m| strip_hash(&m.title)).collect();

        let mut synced = Vec::with_capacity(names.len());
        for name in &names {
            let existing = self
                .entries
                .iter()
                .find(|e| e.model.eq_ignore_ascii_case(name));
            synced.push(TriggerEntry {
                model: name.to_string(),
                trigger: existing.map(|e| e.trigger.clone()).unwrap_or_default(),
            });
        }
        synced.sort_by_key(|e| e.model.to_lowercase());

        let changed = synced != self.entries;
        self.entries = synced;
        changed
    }

    pub fn to_text(&self) -> String {
        let mut out = String::from("# model-name, trigger-phrase\n");
        for entry in &self.entries {
            out.push_str(&entry.model);
            out.push_str(", ");
            out.push_str(&entry.trigger);
            out.push('\n');
        }
        out
    }

    pub fn save(&self) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        std::fs::write(&self.path, self.to_text()).map_err(|e| CoreError::io(&self.path, e))
    }
}

/// `name.safetensors [abc123]` -> `name.safetensors`
pub fn strip_hash(title: &str) -> &str {
    match title.rfind(" [") {
        Some(idx) if title.ends_with(']') => title[..idx].trim(),
        _ => title.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- placement -----------------------------------------------------------

    #[test]
    fn placement_parsing() {
        assert_eq!("start".parse(), Ok(TriggerPlacement::Start));
        assert_eq!("FIRST_COMMA".parse(), Ok(TriggerPlacement::FirstComma));
        assert_eq!(
            "keyword:Portrait".parse(),
            Ok(TriggerPlacement::Keyword("Portrait".into()))
        );
        assert!("keyword:".parse::<TriggerPlacement>().is_err());
        assert!("middle".parse::<TriggerPlacement>().is_err());
    }

    #[test]
    fn inserts_at_start_and_end() {
        assert_eq!(
            insert_trigger("a cat", "mdjrny", &TriggerPlacement::Start),
            "mdjrny, a cat"
        );
        assert_eq!(
            insert_trigger("a cat", "mdjrny", &TriggerPlacement::End),
            "a cat, mdjrny"
        );
    }

    #[test]
    fn first_comma_and_fallback() {
        assert_eq!(
            insert_trigger("a cat, sitting", "trg", &TriggerPlacement::FirstComma),
            "a cat, trg, sitting"
        );
        assert_eq!(
            insert_trigger("a cat", "trg", &TriggerPlacement::FirstComma),
            "a cat, trg"
        );
    }

    #[test]
    fn keyword_replace_and_fallback() {
        let placement = TriggerPlacement::Keyword("woman".into());
        assert_eq!(
            insert_trigger("portrait of a Woman, oil", "sks person", &placement),
            "portrait of a sks person, oil"
        );
        assert_eq!(
            insert_trigger("a landscape", "sks person", &placement),
            "sks person, a landscape"
        );
    }

    #[test]
    fn never_inserts_twice() {
        let once = insert_trigger("a cat", "mdjrny", &TriggerPlacement::Start);
        let twice = insert_trigger(&once, "mdjrny", &TriggerPlacement::Start);
        assert_eq!(once, twice);
        assert_eq!(
            insert_trigger("a cat", "mdjrny", &TriggerPlacement::Off),
            "a cat"
        );
    }

    // -- registry -------------------------------------------------------------

    fn model(title: &str) -> ModelInfo {
        ModelInfo {
            title: title.to_string(),
            filename: None,
        }
    }

    #[test]
    fn sync_preserves_phrases_and_drops_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/model-triggers.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "alpha.ckpt, alpha style\nold.ckpt, gone\n").unwrap();

        let mut registry = TriggerRegistry::load(&path).unwrap();
        let changed = registry.sync(&[model("beta.safetensors [1234]"), model("alpha.ckpt [abcd]")]);
        assert!(changed);
        assert_eq!(
            registry.entries(),
            &[
                TriggerEntry {
                    model: "alpha.ckpt".into(),
                    trigger: "alpha style".into()
                },
                TriggerEntry {
                    model: "beta.safetensors".into(),
                    trigger: String::new()
                },
            ]
        );

        registry.save().unwrap();
        let reloaded = TriggerRegistry::load(&path).unwrap();
        assert_eq!(reloaded.entries(), registry.entries());
        assert!(!registry.clone().sync(&[model("alpha.ckpt"), model("beta.safetensors")]));
    }

    #[test]
    fn lookup_ignores_hash_suffix_and_empty_phrases() {
        let registry = TriggerRegistry {
            path: PathBuf::new(),
            entries: TriggerRegistry::parse("alpha.ckpt, alpha style\nbeta.ckpt,\n"),
        };
        assert_eq!(registry.lookup("alpha.ckpt [abcd]"), Some("alpha style"));
        assert_eq!(registry.lookup("beta.ckpt"), None);
        assert_eq!(registry.lookup("missing"), None);
    }

    #[test]
    fn missing_registry_file_is_empty() {
        let registry = TriggerRegistry::load(Path::new("/no/such/registry.txt")).unwrap();
        assert!(registry.entries().is_empty());
    }
}
