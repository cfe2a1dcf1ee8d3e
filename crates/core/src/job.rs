//! Typed render job model.
//!
//! A [`JobSpec`] is produced by the prompt compiler, moved into the
//! scheduler's queue, and handed by value to the executor. Numeric
//! parameters that may be given as `min-max` ranges stay ranges until
//! [`JobSpec::resolve_late`] runs at dispatch time.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::distr::uniform::SampleUniform;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::images;
use crate::triggers::TriggerPlacement;

/// Default width and height of a generated image.
pub const DEFAULT_DIMENSION: u32 = 512;

/// Default sampling step count.
pub const DEFAULT_STEPS: u32 = 20;

/// Default classifier-free guidance scale.
pub const DEFAULT_SCALE: f64 = 7.5;

/// Default img2img denoising strength.
pub const DEFAULT_STRENGTH: f64 = 0.75;

/// Default sampler name before capabilities are discovered.
pub const DEFAULT_SAMPLER: &str = "Euler a";

/// Seed value that lets the render backend choose.
pub const RANDOM_SEED: i64 = -1;

// ---------------------------------------------------------------------------
// Prompt mode
// ---------------------------------------------------------------------------

/// How a template's prompt sections are turned into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Exhaustive cartesian product of section draws.
    #[default]
    Standard,
    /// Endless independent sampling, refilled when drained.
    Random,
    /// Batch post-processing of existing images.
    Process,
}

impl PromptMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Random => "random",
            Self::Process => "process",
        }
    }
}

impl FromStr for PromptMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "combination" => Ok(Self::Standard),
            "random" => Ok(Self::Random),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

/// An inclusive numeric range, or a single value when `min == max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumberRange<T> {
    pub min: T,
    pub max: T,
}

impl<T: Copy> NumberRange<T> {
    pub fn fixed(value: T) -> Self {
        Self {
            min: value,
            max: value,
        }
    }
}

impl<T: SampleUniform + PartialOrd + Copy> NumberRange<T> {
    /// True unless `min < max`; a NaN bound counts as fixed.
    pub fn is_fixed(&self) -> bool {
        self.min.partial_cmp(&self.max) != Some(Ordering::Less)
    }

    /// Draw a value from the range. A fixed range returns `min`.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> T {
        if self.is_fixed() {
            self.min
        } else {
            rng.random_range(self.min..=self.max)
        }
    }

    /// The value of a range that has already been resolved.
    pub fn value(&self) -> T {
        self.min
    }
}

/// Parse `"7.5"` or `"5-9"` into a range. Reversed bounds are swapped.
pub fn parse_range<T>(value: &str) -> Option<NumberRange<T>>
where
    T: FromStr + PartialOrd + Copy,
{
    let value = value.trim();
    match value.split_once('-') {
        Some((lo, hi)) => {
            let lo: T = parse_finite(lo)?;
            let hi: T = parse_finite(hi)?;
            if lo <= hi {
                Some(NumberRange { min: lo, max: hi })
            } else {
                Some(NumberRange { min: hi, max: lo })
            }
        }
        None => parse_finite(value).map(NumberRange::fixed),
    }
}

/// Parse a number, rejecting `nan`, `inf` and values that overflow to
/// infinity.
pub fn parse_finite<T: FromStr>(value: &str) -> Option<T> {
    let value = value.trim();
    if value.parse::<f64>().is_ok_and(|v| !v.is_finite()) {
        return None;
    }
    value.parse().ok()
}

/// Round `value` to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Optional stages
// ---------------------------------------------------------------------------

/// Two-pass high resolution fix, applied inside the primary request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighresSettings {
    pub enabled: bool,
    pub scale_factor: f64,
    /// Second-pass steps; `0` reuses the primary step count.
    pub steps: u32,
    pub denoising_strength: f64,
    pub upscaler: String,
    pub ckpt_file: Option<String>,
    pub sampler: Option<String>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
}

impl Default for HighresSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_factor: 2.0,
            steps: 0,
            denoising_strength: 0.5,
            upscaler: "Latent".to_string(),
            ckpt_file: None,
            sampler: None,
            prompt: None,
            negative_prompt: None,
        }
    }
}

/// ControlNet weighting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlMode {
    #[default]
    Balanced,
    PromptImportant,
    ControlImportant,
}

impl ControlMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "balanced" | "0" => Some(Self::Balanced),
            "prompt" | "1" => Some(Self::PromptImportant),
            "controlnet" | "2" => Some(Self::ControlImportant),
            _ => None,
        }
    }

    /// The label the ControlNet extension expects.
    pub fn api_label(&self) -> &'static str {
        match self {
            Self::Balanced => "Balanced",
            Self::PromptImportant => "My prompt is more important",
            Self::ControlImportant => "ControlNet is more important",
        }
    }
}

/// Guided generation from a reference image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetSettings {
    pub input_image: Option<PathBuf>,
    pub model: Option<String>,
    pub preprocessor: String,
    pub weight: f64,
    pub guidance_start: f64,
    pub guidance_end: f64,
    pub pixel_perfect: bool,
    pub low_vram: bool,
    pub control_mode: ControlMode,
}

impl Default for ControlNetSettings {
    fn default() -> Self {
        Self {
            input_image: None,
            model: None,
            preprocessor: "none".to_string(),
            weight: 1.0,
            guidance_start: 0.0,
            guidance_end: 1.0,
            pixel_perfect: false,
            low_vram: false,
            control_mode: ControlMode::Balanced,
        }
    }
}

impl ControlNetSettings {
    /// ControlNet runs only with both a reference image and a model.
    pub fn is_active(&self) -> bool {
        self.input_image.is_some() && self.model.is_some()
    }
}

/// Automatic region refinement (ADetailer) pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ADetailerSettings {
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub confidence: f64,
    pub denoising_strength: f64,
}

impl Default for ADetailerSettings {
    fn default() -> Self {
        Self {
            model: None,
            prompt: None,
            negative_prompt: None,
            confidence: 0.3,
            denoising_strength: 0.4,
        }
    }
}

impl ADetailerSettings {
    pub fn is_active(&self) -> bool {
        self.model.is_some()
    }
}

/// How an image is enlarged after the primary render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum UpscaleMethod {
    /// A named upscaler via the single-image enhancement endpoint.
    Upscaler(String),
    /// A second img2img render at the enlarged size.
    Sd,
    /// img2img through the tiled "Ultimate SD Upscale" script.
    Ultimate,
}

impl UpscaleMethod {
    /// Whether the method re-renders through a diffusion model.
    pub fn is_generative(&self) -> bool {
        matches!(self, Self::Sd | Self::Ultimate)
    }
}

/// Post-render enlargement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleSettings {
    pub enabled: bool,
    pub method: UpscaleMethod,
    pub amount: f64,
    pub codeformer_visibility: f64,
    pub gfpgan_visibility: f64,
    pub keep_original: bool,
    pub sd_strength: f64,
    pub ckpt_file: Option<String>,
    pub sampler: Option<String>,
    pub steps: Option<u32>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
}

impl Default for UpscaleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            method: UpscaleMethod::Upscaler("ESRGAN_4x".to_string()),
            amount: 2.0,
            codeformer_visibility: 0.0,
            gfpgan_visibility: 0.0,
            keep_original: false,
            sd_strength: 0.3,
            ckpt_file: None,
            sampler: None,
            steps: None,
            prompt: None,
            negative_prompt: None,
        }
    }
}

/// Descriptive fields attached to outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IptcFields {
    pub title: String,
    pub description: String,
    /// Comma-separated keyword list.
    pub keywords: String,
    pub copyright: String,
}

impl IptcFields {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.description.is_empty()
            && self.keywords.is_empty()
            && self.copyright.is_empty()
    }

    pub fn keyword_list(&self) -> Vec<String> {
        self.keywords
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    #[default]
    Template,
    /// Ad-hoc enlargement of an existing image (priority queue).
    Upscale,
}

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// One fully-resolved request to render and post-process an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub origin: JobOrigin,
    pub mode: PromptMode,
    pub template_path: Option<PathBuf>,
    /// 1-based position within the compiled queue.
    pub sequence: usize,
    /// Sweep loop this job was compiled in.
    pub loop_index: u32,

    pub prompt: String,
    pub negative_prompt: String,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub steps: NumberRange<u32>,
    pub scale: NumberRange<f64>,
    pub strength: NumberRange<f64>,
    pub samples: u32,
    pub batch_size: u32,
    pub sampler: String,
    pub ckpt_file: Option<String>,
    pub vae: Option<String>,
    pub styles: Vec<String>,
    pub clip_skip: Option<u32>,

    pub input_image: Option<PathBuf>,
    pub random_input_image_dir: Option<PathBuf>,

    pub highres: HighresSettings,
    pub controlnet: ControlNetSettings,
    pub adetailer: ADetailerSettings,
    pub upscale: UpscaleSettings,

    /// Output filename template; `None` uses the default naming scheme.
    pub filename: Option<String>,
    pub trigger_placement: TriggerPlacement,
    pub iptc: IptcFields,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            origin: JobOrigin::Template,
            mode: PromptMode::Standard,
            template_path: None,
            sequence: 0,
            loop_index: 0,
            prompt: String::new(),
            negative_prompt: String::new(),
            seed: RANDOM_SEED,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            steps: NumberRange::fixed(DEFAULT_STEPS),
            scale: NumberRange::fixed(DEFAULT_SCALE),
            strength: NumberRange::fixed(DEFAULT_STRENGTH),
            samples: 1,
            batch_size: 1,
            sampler: DEFAULT_SAMPLER.to_string(),
            ckpt_file: None,
            vae: None,
            styles: Vec::new(),
            clip_skip: None,
            input_image: None,
            random_input_image_dir: None,
            highres: HighresSettings::default(),
            controlnet: ControlNetSettings::default(),
            adetailer: ADetailerSettings::default(),
            upscale: UpscaleSettings::default(),
            filename: None,
            trigger_placement: TriggerPlacement::Off,
            iptc: IptcFields::default(),
        }
    }
}

impl JobSpec {
    /// Build a priority job that enlarges an existing image.
    pub fn upscale_request(image: PathBuf, settings: UpscaleSettings, defaults: &JobSpec) -> Self {
        Self {
            origin: JobOrigin::Upscale,
            mode: PromptMode::Process,
            input_image: Some(image),
            upscale: UpscaleSettings {
                enabled: true,
                ..settings
            },
            ..defaults.clone()
        }
    }

    /// Whether the executor issues a primary txt2img/img2img request.
    ///
    /// Process-mode and ad-hoc upscale jobs start from an existing image.
    pub fn renders_primary(&self) -> bool {
        self.mode != PromptMode::Process && self.origin != JobOrigin::Upscale
    }

    pub fn highres(&self) -> Option<&HighresSettings> {
        self.highres.enabled.then_some(&self.highres)
    }

    pub fn upscale(&self) -> Option<&UpscaleSettings> {
        self.upscale.enabled.then_some(&self.upscale)
    }

    pub fn controlnet(&self) -> Option<&ControlNetSettings> {
        self.controlnet.is_active().then_some(&self.controlnet)
    }

    pub fn adetailer(&self) -> Option<&ADetailerSettings> {
        self.adetailer.is_active().then_some(&self.adetailer)
    }

    /// File stem of the template this job was compiled from.
    pub fn template_stem(&self) -> String {
        self.template_path
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "adhoc".to_string())
    }

    /// Settle late-bound randomness: numeric ranges and the random input
    /// image. The seed is never touched.
    ///
    /// Scale is rounded to one decimal place, strength to two.
    pub fn resolve_late<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.steps = NumberRange::fixed(self.steps.resolve(rng));
        self.scale = NumberRange::fixed(round_to(self.scale.resolve(rng), 1));
        self.strength = NumberRange::fixed(round_to(self.strength.resolve(rng), 2));

        if let Some(dir) = &self.random_input_image_dir {
            if let Some(image) = images::pick_random(dir, rng) {
                self.input_image = Some(image);
            }
        }
    }
}
