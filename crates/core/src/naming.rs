//! Output naming convention engine.
//!
//! Output folders are `<output root>/<YYYY-MM-DD>-<template stem>`.
//! Filenames come from a template of `<placeholder>` tokens (default
//! [`DEFAULT_FILENAME_TEMPLATE`]); substituted values are slugified and the
//! result is truncated to [`MAX_FILENAME_LEN`] characters. Collisions get a
//! numeric `-N` suffix.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::{Captures, Regex};

use crate::triggers::strip_hash;

/// Filename template used when a job names none.
pub const DEFAULT_FILENAME_TEMPLATE: &str = "<seed>-<prompt>";

/// Longest stem produced, in characters.
pub const MAX_FILENAME_LEN: usize = 180;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([a-zA-Z\-]+)>").expect("valid regex"));
static NON_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
static DASH_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-\s]+").expect("valid regex"));

/// Values available to a filename template.
#[derive(Debug, Clone)]
pub struct NamingContext<'a> {
    pub prompt: &'a str,
    pub model: Option<&'a str>,
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub scale: f64,
    pub sampler: &'a str,
    pub input_image: Option<&'a Path>,
    pub timestamp: DateTime<Local>,
}

/// Filesystem-safe, lowercase, dash-separated form of `value`.
///
/// Non-ASCII characters are dropped.
pub fn slugify(value: &str) -> String {
    let ascii: String = value.chars().filter(char::is_ascii).collect();
    let lowered = ascii.to_lowercase();
    let stripped = NON_WORD_RE.replace_all(&lowered, "");
    let dashed = DASH_SPACE_RE.replace_all(&stripped, "-");
    let trimmed = dashed.trim_matches(|c| c == '-' || c == '_');
    truncate(trimmed, MAX_FILENAME_LEN)
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Checkpoint title without hash suffix or extension.
pub fn model_short_name(title: &str) -> String {
    let name = strip_hash(title);
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match name.rsplit_once('.') {
        Some((stem, ext)) if matches!(ext, "ckpt" | "safetensors" | "pt" | "bin") => {
            stem.to_string()
        }
        _ => name.to_string(),
    }
}

/// Render a filename stem (no extension) from `template`.
///
/// Unknown placeholders are removed.
pub fn render_filename(template: &str, ctx: &NamingContext<'_>) -> String {
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &Captures| {
        let value = match caps[1].to_ascii_lowercase().as_str() {
            "prompt" => ctx.prompt.to_string(),
            "model" => ctx.model.map(model_short_name).unwrap_or_default(),
            "seed" => ctx.seed.to_string(),
            "width" => ctx.width.to_string(),
            "height" => ctx.height.to_string(),
            "steps" => ctx.steps.to_string(),
            "scale" => format!("{}", ctx.scale).replace('.', "_"),
            "sampler" => ctx.sampler.to_string(),
            "date" => ctx.timestamp.format("%Y-%m-%d").to_string(),
            "time" => ctx.timestamp.format("%H-%M-%S").to_string(),
            "date-year" => ctx.timestamp.format("%Y").to_string(),
            "date-month" => ctx.timestamp.format("%m").to_string(),
            "date-day" => ctx.timestamp.format("%d").to_string(),
            "input-img" => ctx
                .input_image
                .and_then(Path::file_stem)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            _ => String::new(),
        };
        slugify(&value)
    });

    let cleaned: String = rendered
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '-' || c == '_' || c.is_whitespace());
    let stem = truncate(cleaned, MAX_FILENAME_LEN);
    if stem.is_empty() {
        ctx.seed.to_string()
    } else {
        stem
    }
}

/// `<root>/<date>-<template stem>`
pub fn output_folder(root: &Path, template_stem: &str, date: DateTime<Local>) -> PathBuf {
    root.join(format!("{}-{}", date.format("%Y-%m-%d"), template_stem))
}

/// First free path `dir/stem.ext`, `dir/stem-1.ext`, `dir/stem-2.ext`, ...
pub fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}-{n}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx<'a>(prompt: &'a str) -> NamingContext<'a> {
        NamingContext {
            prompt,
            model: Some("dreamshaper_8.safetensors [879db523c3]"),
            seed: 1234,
            width: 512,
            height: 768,
            steps: 30,
            scale: 7.5,
            sampler: "DPM++ 2M Karras",
            input_image: None,
            timestamp: Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap(),
        }
    }

    // -- slugify ----------------------------------------------------------------

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("A Cat, Sitting!"), "a-cat-sitting");
        assert_eq!(slugify("  --caf\u{e9} au lait--  "), "caf-au-lait");
    }

    #[test]
    fn slugify_truncates() {
        let long = "word ".repeat(100);
        assert_eq!(slugify(&long).chars().count(), MAX_FILENAME_LEN);
    }

    // -- templates --------------------------------------------------------------

    #[test]
    fn default_template() {
        assert_eq!(
            render_filename(DEFAULT_FILENAME_TEMPLATE, &ctx("a cat, oil painting")),
            "1234-a-cat-oil-painting"
        );
    }

    #[test]
    fn model_date_and_scale_placeholders() {
        assert_eq!(
            render_filename("<date>_<model>_<scale>_<width>x<height>", &ctx("x")),
            "2024-03-09_dreamshaper_8_7_5_512x768"
        );
        assert_eq!(
            render_filename("<date-year>/<time>", &ctx("x")),
            "202414-05-06"
        );
    }

    #[test]
    fn empty_render_falls_back_to_seed() {
        assert_eq!(render_filename("<unknown>", &ctx("x")), "1234");
    }

    #[test]
    fn model_short_names() {
        assert_eq!(model_short_name("sdxl/base_1.0.safetensors [31e3]"), "base_1.0");
        assert_eq!(model_short_name("plain"), "plain");
    }

    // -- paths ------------------------------------------------------------------

    #[test]
    fn folder_and_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let date = Local.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(
            output_folder(dir.path(), "landscapes", date),
            dir.path().join("2024-03-09-landscapes")
        );

        let first = unique_path(dir.path(), "img", "png");
        assert_eq!(first, dir.path().join("img.png"));
        std::fs::write(&first, b"x").unwrap();
        let second = unique_path(dir.path(), "img", "png");
        assert_eq!(second, dir.path().join("img-1.png"));
        std::fs::write(&second, b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "img", "png"), dir.path().join("img-2.png"));
    }
}
