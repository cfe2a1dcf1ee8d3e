//! Render backend capability sets.
//!
//! Populated once per run by the capability bootstrap and used by the
//! directive resolver to validate enum-valued directives.

use serde::{Deserialize, Serialize};

/// Script name the Ultimate SD Upscale extension registers.
pub const ULTIMATE_UPSCALE_SCRIPT: &str = "ultimate sd upscale";

/// Script name the ADetailer extension registers.
pub const ADETAILER_SCRIPT: &str = "adetailer";

/// Script name the ControlNet extension registers.
pub const CONTROLNET_SCRIPT: &str = "controlnet";

/// A checkpoint advertised by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Backend title, e.g. `sd_xl_base_1.0.safetensors [31e35c80fc]`.
    pub title: String,
    pub filename: Option<String>,
}

/// A saved prompt style.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleInfo {
    pub name: String,
    pub prompt: String,
    pub negative_prompt: String,
}

/// Everything the backend reported during bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub samplers: Vec<String>,
    pub models: Vec<ModelInfo>,
    pub hypernetworks: Vec<String>,
    pub loras: Vec<String>,
    pub vaes: Vec<String>,
    pub styles: Vec<StyleInfo>,
    pub upscalers: Vec<String>,
    pub txt2img_scripts: Vec<String>,
    pub img2img_scripts: Vec<String>,
    pub controlnet_models: Vec<String>,
    pub controlnet_preprocessors: Vec<String>,
}

impl Capabilities {
    /// True until the bootstrap has reported anything.
    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty() && self.models.is_empty()
    }

    pub fn model_titles(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.title.as_str())
    }

    pub fn style_names(&self) -> impl Iterator<Item = &str> {
        self.styles.iter().map(|s| s.name.as_str())
    }

    /// Whether the ControlNet extension is installed.
    pub fn controlnet_extension(&self) -> bool {
        contains_ci(&self.txt2img_scripts, CONTROLNET_SCRIPT)
            || contains_ci(&self.img2img_scripts, CONTROLNET_SCRIPT)
    }

    /// ControlNet is usable only with at least one model installed.
    pub fn controlnet_available(&self) -> bool {
        !self.controlnet_models.is_empty()
    }

    pub fn ultimate_upscale_available(&self) -> bool {
        contains_ci(&self.img2img_scripts, ULTIMATE_UPSCALE_SCRIPT)
    }

    pub fn adetailer_available(&self) -> bool {
        contains_ci(&self.txt2img_scripts, ADETAILER_SCRIPT)
            || contains_ci(&self.img2img_scripts, ADETAILER_SCRIPT)
    }
}

fn contains_ci(list: &[String], name: &str) -> bool {
    list.iter().any(|s| s.eq_ignore_ascii_case(name))
}

/// Match `value` against `candidates`, case-insensitively.
///
/// An exact match wins; otherwise the first candidate containing `value`
/// is returned. The candidate's own casing is returned either way.
pub fn match_capability<'a, I>(value: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let needle = value.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    let mut partial = None;
    for candidate in candidates {
        let lowered = candidate.to_lowercase();
        if lowered == needle {
            return Some(candidate);
        }
        if partial.is_none() && lowered.contains(&needle) {
            partial = Some(candidate);
        }
    }
    partial
}
