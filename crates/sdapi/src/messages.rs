//! Request and response types for the render backend's REST API.
//!
//! Field names follow the Automatic1111 `sdapi/v1` JSON schema. Optional
//! fields are omitted from the request body when unset so the backend's own
//! defaults apply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body for `POST /sdapi/v1/txt2img` and `POST /sdapi/v1/img2img`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub n_iter: u32,
    pub batch_size: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub styles: Vec<String>,

    /// img2img source images as base64 strings. Empty for txt2img.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub init_images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f64>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub enable_hr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_second_pass_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_upscaler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_checkpoint_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_sampler_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_negative_prompt: Option<String>,

    /// Per-request settings such as `sd_vae` or `CLIP_stop_at_last_layers`.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub override_settings: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub script_args: Vec<Value>,

    /// Extension payloads keyed by script name (ControlNet, ADetailer).
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub alwayson_scripts: Map<String, Value>,
}

impl GenerationRequest {
    /// Attach an always-on extension payload.
    pub fn add_alwayson(&mut self, script: &str, args: Vec<Value>) {
        self.alwayson_scripts
            .insert(script.to_string(), serde_json::json!({ "args": args }));
    }
}

/// Body for `POST /sdapi/v1/extra-single-image`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtraSingleImageRequest {
    /// Base64 image.
    pub image: String,
    /// `0` scales by [`Self::upscaling_resize`].
    pub resize_mode: u8,
    pub upscaling_resize: f64,
    pub upscaler_1: String,
    pub codeformer_visibility: f64,
    pub gfpgan_visibility: f64,
}

/// The kind of render request a device can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Txt2Img,
    Img2Img,
    ExtraSingleImage,
}

impl RequestKind {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Txt2Img => "/sdapi/v1/txt2img",
            Self::Img2Img => "/sdapi/v1/img2img",
            Self::ExtraSingleImage => "/sdapi/v1/extra-single-image",
        }
    }

    /// Whether the request's outputs are upscales of an existing image.
    pub fn is_upscale(&self) -> bool {
        matches!(self, Self::ExtraSingleImage)
    }
}

/// A request together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderRequest {
    Txt2Img(GenerationRequest),
    Img2Img(GenerationRequest),
    ExtraSingleImage(ExtraSingleImageRequest),
}

impl RenderRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Txt2Img(_) => RequestKind::Txt2Img,
            Self::Img2Img(_) => RequestKind::Img2Img,
            Self::ExtraSingleImage(_) => RequestKind::ExtraSingleImage,
        }
    }
}

// ---------------------------------------------------------------------------
// Extension payloads
// ---------------------------------------------------------------------------

/// One ControlNet unit for `alwayson_scripts.controlnet.args`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlNetUnit {
    pub enabled: bool,
    /// Base64 reference image.
    pub image: String,
    pub module: String,
    pub model: String,
    pub weight: f64,
    pub guidance_start: f64,
    pub guidance_end: f64,
    pub pixel_perfect: bool,
    pub low_vram: bool,
    pub control_mode: String,
}

/// ADetailer settings for `alwayson_scripts.ADetailer.args`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ADetailerArgs {
    pub ad_model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ad_prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ad_negative_prompt: String,
    pub ad_confidence: f64,
    pub ad_denoising_strength: f64,
}

impl ADetailerArgs {
    /// Positional args: enable flag, skip-img2img flag, unit settings.
    pub fn into_args(self) -> Vec<Value> {
        vec![
            Value::Bool(true),
            Value::Bool(false),
            serde_json::to_value(self).unwrap_or(Value::Null),
        ]
    }
}

/// Script args for "Ultimate SD upscale" rendering to a custom size.
pub fn ultimate_upscale_args(upscaler_index: usize, width: u32, height: u32) -> Vec<Value> {
    use serde_json::json;
    vec![
        Value::Null, // info
        json!(512),  // tile_width
        json!(512),  // tile_height
        json!(8),    // mask_blur
        json!(32),   // padding
        json!(64),   // seams_fix_width
        json!(0.35), // seams_fix_denoise
        json!(32),   // seams_fix_padding
        json!(upscaler_index),
        json!(false), // save_upscaled_image
        json!(1),     // redraw_mode: chess
        json!(false), // save_seams_fix_image
        json!(4),     // seams_fix_mask_blur
        json!(0),     // seams_fix_type: none
        json!(1),     // target_size_type: custom size
        json!(width),
        json!(height),
        json!(2),     // custom_scale (unused with a custom size)
    ]
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Response of txt2img / img2img.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub images: Vec<String>,
    /// JSON-encoded generation info.
    #[serde(default)]
    pub info: Option<String>,
}

/// Response of extra-single-image.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtraSingleImageResponse {
    pub image: String,
}

/// Response of `POST /sdapi/v1/png-info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PngInfoResponse {
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerItem {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SdModelItem {
    pub title: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedPathItem {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StyleItem {
    pub name: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaeItem {
    pub model_name: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptsResponse {
    #[serde(default)]
    pub txt2img: Vec<String>,
    #[serde(default)]
    pub img2img: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlNetModelList {
    #[serde(default)]
    pub model_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlNetModuleList {
    #[serde(default)]
    pub module_list: Vec<String>,
}

/// Strip a `data:image/...;base64,` prefix if present.
pub fn strip_data_url(image: &str) -> &str {
    match image.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image,
    }
}

/// Wrap raw base64 PNG data in a data URL.
pub fn png_data_url(image: &str) -> String {
    format!("data:image/png;base64,{}", strip_data_url(image))
}
