//! Generation records stored next to output images.
//!
//! Every persisted image gets a `<stem>.json` sidecar describing how it was
//! made. Process mode reads these back to recover the prompt and the model
//! an image was rendered with.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::IptcFields;

static SEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Seed:\s*(-?\d+)").expect("valid regex"));
static MODEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Model:\s*([^,\n]+)").expect("valid regex"));

/// What a rendered image was made from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub prompt: String,
    pub negative_prompt: String,
    pub model: Option<String>,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub scale: f64,
    pub sampler: String,
    /// Backend "parameters" text for the image.
    pub infotext: String,
    #[serde(default, skip_serializing_if = "IptcFields::is_empty")]
    pub iptc: IptcFields,
    pub template: Option<String>,
    pub source_image: Option<PathBuf>,
    pub upscaled: bool,
    pub created_at: DateTime<Utc>,
}

impl GenerationRecord {
    /// The model recorded for the image, falling back to the infotext.
    pub fn model_name(&self) -> Option<String> {
        self.model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| model_from_infotext(&self.infotext))
    }
}

/// `out/a.png` -> `out/a.json`
pub fn sidecar_path(image: &Path) -> PathBuf {
    image.with_extension("json")
}

pub fn write_record(image: &Path, record: &GenerationRecord) -> Result<(), CoreError> {
    let path = sidecar_path(image);
    let json = serde_json::to_vec_pretty(record).map_err(|e| CoreError::Json {
        path: path.clone(),
        source: e,
    })?;
    std::fs::write(&path, json).map_err(|e| CoreError::io(&path, e))
}

pub fn read_record(image: &Path) -> Result<GenerationRecord, CoreError> {
    let path = sidecar_path(image);
    let bytes = std::fs::read(&path).map_err(|e| CoreError::io(&path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| CoreError::Json { path, source: e })
}

/// Parse the `Seed: N,` field of backend infotext.
pub fn seed_from_infotext(info: &str) -> Option<i64> {
    SEED_RE.captures(info)?.get(1)?.as_str().parse().ok()
}

/// Parse the `Model: name,` field of backend infotext.
pub fn model_from_infotext(info: &str) -> Option<String> {
    let name = MODEL_RE.captures(info)?.get(1)?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}
