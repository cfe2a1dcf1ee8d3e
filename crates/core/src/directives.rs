//! `KEY = VALUE` directive resolution.
//!
//! Directives mutate a [`JobTemplate`]: the job defaults every compiled job
//! is copied from, plus the run-control settings (mode, repeat, chaining,
//! model sweeps). A rejected directive leaves the template untouched and
//! comes back as a [`DirectiveError`] for the caller to report; nothing
//! here aborts compilation.
//!
//! Enum-valued directives are validated against the backend's
//! [`Capabilities`] with [`match_capability`]. Before capabilities are
//! known the raw value is accepted as-is.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::capabilities::{match_capability, Capabilities};
use crate::job::{
    parse_finite, parse_range, ControlMode, JobSpec, NumberRange, PromptMode, UpscaleMethod,
};
use crate::template::DEFAULT_DELIMITER;
use crate::text;
use crate::triggers::TriggerPlacement;

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(!)?\s*([A-Za-z][A-Za-z0-9_]*)\s*=(.*)$").expect("valid regex")
});

/// Settings that steer the run rather than individual jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunControl {
    pub mode: PromptMode,
    pub repeat: bool,
    pub next_template: Option<PathBuf>,
    /// Joins fragments from different `[prompts]` sections.
    pub delimiter: String,
    /// Checkpoints to sweep; empty when no sweep is configured.
    pub model_sweep: Vec<String>,
    /// High-res checkpoints to sweep (inner loop of the model sweep).
    pub highres_sweep: Vec<String>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            mode: PromptMode::Standard,
            repeat: false,
            next_template: None,
            delimiter: DEFAULT_DELIMITER.to_string(),
            model_sweep: Vec::new(),
            highres_sweep: Vec::new(),
        }
    }
}

/// The mutable state directives act on.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub job: JobSpec,
    pub control: RunControl,
}

impl JobTemplate {
    pub fn new(defaults: JobSpec) -> Self {
        let control = RunControl {
            mode: defaults.mode,
            ..RunControl::default()
        };
        Self {
            job: defaults,
            control,
        }
    }
}

/// A directive parsed from a line or token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Upper-cased key without the leading `!`.
    pub key: String,
    pub value: String,
    /// Whether the line carried the leading `!`.
    pub marked: bool,
}

/// Parse a `[config]` line. The leading `!` is optional.
pub fn parse_line(line: &str) -> Option<Directive> {
    let caps = DIRECTIVE_RE.captures(line.trim())?;
    Some(Directive {
        key: caps[2].to_ascii_uppercase(),
        value: caps[3].trim().to_string(),
        marked: caps.get(1).is_some(),
    })
}

/// Parse a prompt-section token. Only `!KEY = VALUE` counts as a directive.
pub fn parse_embedded(token: &str) -> Option<Directive> {
    parse_line(token).filter(|d| d.marked)
}

/// Why a directive was not (fully) applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("directive not recognized: {0} (it will be ignored)")]
    Unknown(String),

    #[error("{key} expects a number, got '{value}' (ignored)")]
    NotNumeric { key: String, value: String },

    #[error("{key} expects yes or no, got '{value}' (ignored)")]
    NotFlag { key: String, value: String },

    /// Enum value(s) the backend does not advertise. For list-valued
    /// directives the matched entries are still applied.
    #[error("{key}: '{value}' is not available on the render backend")]
    Unavailable { key: String, value: String },

    #[error("{key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Apply one directive to `template`.
pub fn apply(
    template: &mut JobTemplate,
    key: &str,
    value: &str,
    caps: &Capabilities,
) -> Result<(), DirectiveError> {
    let key = key.trim().trim_start_matches('!').trim().to_ascii_uppercase();
    let key = key.as_str();
    let value = value.trim();
    let job = &mut template.job;
    let control = &mut template.control;

    match key {
        // -- core sampling parameters ----------------------------------------
        "WIDTH" => job.width = dimension(key, value)?,
        "HEIGHT" => job.height = dimension(key, value)?,
        "SEED" => job.seed = number(key, value)?,
        "STEPS" => job.steps = range(key, value)?,
        "SCALE" => job.scale = range(key, value)?,
        "MIN_SCALE" => set_min(&mut job.scale, number(key, value)?),
        "MAX_SCALE" => set_max(&mut job.scale, number(key, value)?),
        "STRENGTH" => job.strength = range(key, value)?,
        "MIN_STRENGTH" => set_min(&mut job.strength, number(key, value)?),
        "MAX_STRENGTH" => set_max(&mut job.strength, number(key, value)?),
        "SAMPLES" => job.samples = number(key, value)?,
        "BATCH_SIZE" => job.batch_size = number(key, value)?,
        "CLIP_SKIP" => job.clip_skip = optional_number(key, value)?,
        "NEG_PROMPT" => job.negative_prompt = value.to_string(),

        // -- backend-validated selectors -------------------------------------
        "SAMPLER" => job.sampler = choose(key, value, &caps.samplers)?,
        "CKPT_FILE" => {
            let selection = models(key, value, caps)?;
            apply_models(key, selection, &mut job.ckpt_file, &mut control.model_sweep)?
        }
        "VAE" => {
            job.vae = if is_none(value) {
                None
            } else {
                Some(choose(key, value, &caps.vaes)?)
            }
        }
        "STYLE" => job.styles = styles(key, value, caps)?,

        // -- run control -------------------------------------------------------
        "MODE" => {
            let mode = PromptMode::from_str(value).map_err(|reason| invalid(key, reason))?;
            control.mode = mode;
            job.mode = mode;
        }
        "REPEAT" => control.repeat = flag(key, value)?,
        "NEXT_PROMPT_FILE" => control.next_template = optional_path(value),
        "DELIM" => {
            control.delimiter = text::unquote(value)
                .ok_or_else(|| invalid(key, "value must be enclosed in double quotes"))?
                .to_string()
        }

        // -- inputs --------------------------------------------------------------
        "INPUT_IMAGE" => job.input_image = optional_path(value),
        "RANDOM_INPUT_IMAGE_DIR" => job.random_input_image_dir = optional_path(value),

        // -- output ----------------------------------------------------------------
        "FILENAME" => job.filename = optional_text(value),
        "AUTO_INSERT_MODEL_TRIGGER" => {
            job.trigger_placement =
                TriggerPlacement::from_str(value).map_err(|reason| invalid(key, reason))?
        }
        "IPTC_TITLE" => job.iptc.title = value.to_string(),
        "IPTC_DESCRIPTION" => job.iptc.description = value.to_string(),
        "IPTC_KEYWORDS" => job.iptc.keywords = value.to_string(),
        "IPTC_COPYRIGHT" => job.iptc.copyright = value.to_string(),

        // -- high resolution fix -------------------------------------------------
        "HIGHRES_FIX" => job.highres.enabled = flag(key, value)?,
        "HIGHRES_SCALE_FACTOR" => job.highres.scale_factor = positive(key, value)?,
        "HIGHRES_STEPS" => job.highres.steps = number(key, value)?,
        "HIGHRES_DENOISING_STRENGTH" => job.highres.denoising_strength = number(key, value)?,
        "HIGHRES_UPSCALER" => {
            job.highres.upscaler = if value.to_ascii_lowercase().starts_with("latent") {
                value.to_string()
            } else {
                choose(key, value, &caps.upscalers)?
            }
        }
        "HIGHRES_CKPT_FILE" => {
            let selection = models(key, value, caps)?;
            apply_models(
                key,
                selection,
                &mut job.highres.ckpt_file,
                &mut control.highres_sweep,
            )?
        }
        "HIGHRES_SAMPLER" => {
            job.highres.sampler = if is_none(value) {
                None
            } else {
                Some(choose(key, value, &caps.samplers)?)
            }
        }
        "HIGHRES_PROMPT" => job.highres.prompt = optional_text(value),
        "HIGHRES_NEG_PROMPT" => job.highres.negative_prompt = optional_text(value),

        // -- upscaling -------------------------------------------------------------
        "USE_UPSCALE" => job.upscale.enabled = flag(key, value)?,
        "UPSCALE_AMOUNT" => job.upscale.amount = positive(key, value)?,
        "UPSCALE_MODEL" => {
            job.upscale.method = match value.to_ascii_lowercase().as_str() {
                "sd" => UpscaleMethod::Sd,
                "ultimate" => UpscaleMethod::Ultimate,
                _ => UpscaleMethod::Upscaler(choose(key, value, &caps.upscalers)?),
            }
        }
        "UPSCALE_CODEFORMER_AMOUNT" => job.upscale.codeformer_visibility = unit(key, value)?,
        "UPSCALE_GFPGAN_AMOUNT" => job.upscale.gfpgan_visibility = unit(key, value)?,
        "UPSCALE_FACE_ENH" => {
            job.upscale.gfpgan_visibility = if flag(key, value)? { 1.0 } else { 0.0 }
        }
        "UPSCALE_KEEP_ORG" => job.upscale.keep_original = flag(key, value)?,
        "UPSCALE_SD_STRENGTH" => job.upscale.sd_strength = unit(key, value)?,
        "UPSCALE_CKPT_FILE" => {
            job.upscale.ckpt_file = if is_none(value) {
                None
            } else {
                Some(choose(key, value, caps.model_titles())?)
            }
        }
        "UPSCALE_SAMPLER" => {
            job.upscale.sampler = if is_none(value) {
                None
            } else {
                Some(choose(key, value, &caps.samplers)?)
            }
        }
        "UPSCALE_STEPS" => job.upscale.steps = optional_number(key, value)?,
        "UPSCALE_PROMPT" => job.upscale.prompt = optional_text(value),
        "UPSCALE_NEG_PROMPT" => job.upscale.negative_prompt = optional_text(value),

        // -- ControlNet --------------------------------------------------------------
        "CONTROLNET_INPUT_IMAGE" => job.controlnet.input_image = optional_path(value),
        "CONTROLNET_MODEL" => {
            job.controlnet.model = if is_none(value) {
                None
            } else {
                Some(choose(key, value, &caps.controlnet_models)?)
            }
        }
        "CONTROLNET_PRE" => {
            job.controlnet.preprocessor = choose(key, value, &caps.controlnet_preprocessors)?
        }
        "CONTROLNET_WEIGHT" => job.controlnet.weight = number(key, value)?,
        "CONTROLNET_GUIDANCE_START" => job.controlnet.guidance_start = unit(key, value)?,
        "CONTROLNET_GUIDANCE_END" => job.controlnet.guidance_end = unit(key, value)?,
        "CONTROLNET_PIXELPERFECT" => job.controlnet.pixel_perfect = flag(key, value)?,
        "CONTROLNET_LOWVRAM" => job.controlnet.low_vram = flag(key, value)?,
        "CONTROLNET_CONTROLMODE" => {
            job.controlnet.control_mode = ControlMode::parse(value)
                .ok_or_else(|| invalid(key, "expected balanced, prompt, or controlnet"))?
        }

        // -- ADetailer -----------------------------------------------------------------
        "ADETAILER_MODEL" => job.adetailer.model = optional_text(value).filter(|v| !is_none(v)),
        "ADETAILER_PROMPT" => job.adetailer.prompt = optional_text(value),
        "ADETAILER_NEG_PROMPT" => job.adetailer.negative_prompt = optional_text(value),
        "ADETAILER_STRENGTH" => job.adetailer.denoising_strength = unit(key, value)?,
        "ADETAILER_CONFIDENCE" => job.adetailer.confidence = unit(key, value)?,

        _ => return Err(DirectiveError::Unknown(key.to_string())),
    }

    Ok(())
}

// ---- private helpers ----

fn invalid(key: &str, reason: impl Into<String>) -> DirectiveError {
    DirectiveError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T, DirectiveError> {
    parse_finite(value).ok_or_else(|| DirectiveError::NotNumeric {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn optional_number<T: FromStr>(key: &str, value: &str) -> Result<Option<T>, DirectiveError> {
    if is_none(value) {
        Ok(None)
    } else {
        number(key, value).map(Some)
    }
}

fn positive(key: &str, value: &str) -> Result<f64, DirectiveError> {
    let v: f64 = number(key, value)?;
    if v > 0.0 {
        Ok(v)
    } else {
        Err(invalid(key, format!("{v} must be greater than zero")))
    }
}

fn unit(key: &str, value: &str) -> Result<f64, DirectiveError> {
    let v: f64 = number(key, value)?;
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(invalid(key, format!("{v} must be between 0 and 1")))
    }
}

fn dimension(key: &str, value: &str) -> Result<u32, DirectiveError> {
    let v: u32 = number(key, value)?;
    if v == 0 {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(v)
}

fn range<T>(key: &str, value: &str) -> Result<NumberRange<T>, DirectiveError>
where
    T: FromStr + PartialOrd + Copy,
{
    parse_range(value).ok_or_else(|| DirectiveError::NotNumeric {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn set_min<T: PartialOrd + Copy>(range: &mut NumberRange<T>, min: T) {
    range.min = min;
    if range.max < min {
        range.max = min;
    }
}

fn set_max<T: PartialOrd + Copy>(range: &mut NumberRange<T>, max: T) {
    range.max = max;
    if range.min > max {
        range.min = max;
    }
}

fn flag(key: &str, value: &str) -> Result<bool, DirectiveError> {
    text::parse_flag(value).ok_or_else(|| DirectiveError::NotFlag {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn is_none(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("none") || value.eq_ignore_ascii_case("default")
}

fn optional_text(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn optional_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

/// Validate one enum value. An empty candidate list accepts anything.
fn choose<'a, I, S>(key: &str, value: &str, candidates: I) -> Result<String, DirectiveError>
where
    I: IntoIterator<Item = &'a S>,
    S: AsRef<str> + ?Sized + 'a,
{
    let candidates: Vec<&str> = candidates
        .into_iter()
        .map(|c| <S as AsRef<str>>::as_ref(c))
        .collect();
    if value.is_empty() {
        return Err(invalid(key, "a value is required"));
    }
    if candidates.is_empty() {
        return Ok(value.to_string());
    }
    match_capability(value, candidates)
        .map(str::to_string)
        .ok_or_else(|| DirectiveError::Unavailable {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Checkpoint directive outcome.
struct ModelSelection {
    first: Option<String>,
    /// Set only when at least two models were named.
    sweep: Vec<String>,
    /// Requested names the backend does not know.
    missing: Vec<String>,
}

/// Resolve a checkpoint directive into a single model or a sweep list.
fn models(key: &str, value: &str, caps: &Capabilities) -> Result<ModelSelection, DirectiveError> {
    if is_none(value) {
        return Ok(ModelSelection {
            first: None,
            sweep: Vec::new(),
            missing: Vec::new(),
        });
    }

    let titles: Vec<&str> = caps.model_titles().collect();
    let mut found = Vec::new();
    let mut missing = Vec::new();

    if value.eq_ignore_ascii_case("all") {
        if titles.is_empty() {
            return Err(invalid(key, "'all' needs the backend model list"));
        }
        found = titles.iter().map(|t| t.to_string()).collect();
    } else {
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match choose(key, name, titles.iter().copied()) {
                Ok(model) if !found.contains(&model) => found.push(model),
                Ok(_) => {}
                Err(_) => missing.push(name.to_string()),
            }
        }
    }

    if found.is_empty() {
        return Err(DirectiveError::Unavailable {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    let (first, sweep) = split_sweep(found);
    Ok(ModelSelection {
        first,
        sweep,
        missing,
    })
}

/// Apply a checkpoint selection, reporting any names that were dropped.
fn apply_models(
    key: &str,
    selection: ModelSelection,
    single: &mut Option<String>,
    sweep: &mut Vec<String>,
) -> Result<(), DirectiveError> {
    *single = selection.first;
    *sweep = selection.sweep;
    if selection.missing.is_empty() {
        Ok(())
    } else {
        Err(DirectiveError::Unavailable {
            key: key.to_string(),
            value: selection.missing.join(", "),
        })
    }
}

fn split_sweep(models: Vec<String>) -> (Option<String>, Vec<String>) {
    let first = models.first().cloned();
    let sweep = if models.len() > 1 { models } else { Vec::new() };
    (first, sweep)
}

fn styles(key: &str, value: &str, caps: &Capabilities) -> Result<Vec<String>, DirectiveError> {
    if is_none(value) {
        return Ok(Vec::new());
    }
    let names: Vec<&str> = caps.style_names().collect();
    let mut found = Vec::new();
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let style = choose(key, name, names.iter().copied())?;
        if !found.contains(&style) {
            found.push(style);
        }
    }
    Ok(found)
}
