//! Moving rendered images from a device scratch directory into the output
//! tree, with a JSON generation record beside each one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use dreamfactory_core::error::CoreError;
use dreamfactory_core::job::JobSpec;
use dreamfactory_core::naming::{
    output_folder, render_filename, unique_path, NamingContext, DEFAULT_FILENAME_TEMPLATE,
};
use dreamfactory_core::record::{model_from_infotext, write_record, GenerationRecord};
use dreamfactory_sdapi::supervisor::RenderedImage;

/// Subfolder that receives pre-upscale originals.
pub const ORIGINALS_DIR: &str = "original";

/// Size and model of an image as it will be recorded.
#[derive(Debug, Clone, Copy)]
pub struct ImageFacts<'a> {
    pub width: u32,
    pub height: u32,
    pub model: Option<&'a str>,
    pub upscaled: bool,
}

/// Persist `image` for `job` under `output_root` and return its final path.
///
/// The image is moved out of the scratch directory unless it is the job's
/// own input (process mode), which is copied.
pub fn persist(
    job: &JobSpec,
    image: &RenderedImage,
    facts: ImageFacts<'_>,
    output_root: &Path,
    now: DateTime<Local>,
) -> Result<PathBuf, CoreError> {
    let mut folder = output_folder(output_root, &job.template_stem(), now);
    if job.upscale.keep_original && job.upscale.enabled && !facts.upscaled {
        folder = folder.join(ORIGINALS_DIR);
    }
    std::fs::create_dir_all(&folder).map_err(|e| CoreError::io(&folder, e))?;

    let seed = image.seed.unwrap_or(job.seed);
    let model = model_from_infotext(&image.infotext)
        .or_else(|| facts.model.map(str::to_string));
    let naming = NamingContext {
        prompt: &job.prompt,
        model: model.as_deref(),
        seed,
        width: facts.width,
        height: facts.height,
        steps: job.steps.value(),
        scale: job.scale.value(),
        sampler: &job.sampler,
        input_image: job.input_image.as_deref(),
        timestamp: now,
    };
    let template = job.filename.as_deref().unwrap_or(DEFAULT_FILENAME_TEMPLATE);
    let stem = render_filename(template, &naming);
    let extension = image
        .path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "png".to_string());
    let target = unique_path(&folder, &stem, &extension);

    if job.input_image.as_deref() == Some(image.path.as_path()) {
        std::fs::copy(&image.path, &target).map_err(|e| CoreError::io(&target, e))?;
    } else {
        move_file(&image.path, &target)?;
    }

    let record = GenerationRecord {
        prompt: job.prompt.clone(),
        negative_prompt: job.negative_prompt.clone(),
        model,
        seed,
        width: facts.width,
        height: facts.height,
        steps: job.steps.value(),
        scale: job.scale.value(),
        sampler: job.sampler.clone(),
        infotext: image.infotext.clone(),
        iptc: job.iptc.clone(),
        template: job
            .template_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        source_image: job.input_image.clone(),
        upscaled: facts.upscaled,
        created_at: Utc::now(),
    };
    write_record(&target, &record)?;
    Ok(target)
}

/// Remove every file left in a scratch directory, keeping the directory.
pub fn clear_scratch(dir: &Path) -> Result<(), CoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CoreError::io(dir, e)),
    };
    for entry in entries {
        let path = entry.map_err(|e| CoreError::io(dir, e))?.path();
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|e| CoreError::io(&path, e))?;
        }
    }
    Ok(())
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<(), CoreError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to).map_err(|e| CoreError::io(to, e))?;
    std::fs::remove_file(from).map_err(|e| CoreError::io(from, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dreamfactory_core::record::read_record;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    fn scratch_image(dir: &Path, name: &str) -> RenderedImage {
        let path = dir.join(name);
        std::fs::write(&path, b"png").unwrap();
        RenderedImage {
            path,
            infotext: "a cat\nSteps: 20, Seed: 77, Model: dreamshaper_8".into(),
            seed: Some(77),
        }
    }

    fn facts() -> ImageFacts<'static> {
        ImageFacts {
            width: 512,
            height: 512,
            model: None,
            upscaled: false,
        }
    }

    #[test]
    fn persists_with_record_and_collision_suffix() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let job = JobSpec {
            prompt: "a cat".into(),
            template_path: Some(PathBuf::from("prompts/cats.prompts")),
            filename: Some("<model>-<prompt>".into()),
            ..JobSpec::default()
        };

        let first = persist(&job, &scratch_image(scratch.path(), "seed_77.png"), facts(), out.path(), now())
            .unwrap();
        let second = persist(&job, &scratch_image(scratch.path(), "seed_77-1.png"), facts(), out.path(), now())
            .unwrap();

        let folder = out.path().join("2024-03-09-cats");
        assert_eq!(first, folder.join("dreamshaper_8-a-cat.png"));
        assert_eq!(second, folder.join("dreamshaper_8-a-cat-1.png"));
        assert!(!scratch.path().join("seed_77.png").exists());

        let record = read_record(&first).unwrap();
        assert_eq!(record.seed, 77);
        assert_eq!(record.model.as_deref(), Some("dreamshaper_8"));
        assert_eq!(record.template.as_deref(), Some("prompts/cats.prompts"));
    }

    #[test]
    fn kept_originals_go_to_subfolder() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut job = JobSpec::default();
        job.upscale.enabled = true;
        job.upscale.keep_original = true;

        let path = persist(&job, &scratch_image(scratch.path(), "seed_77.png"), facts(), out.path(), now())
            .unwrap();
        assert_eq!(path.parent().unwrap().file_name().unwrap(), ORIGINALS_DIR);
    }

    #[test]
    fn process_inputs_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let image = scratch_image(dir.path(), "source.png");
        let job = JobSpec {
            input_image: Some(image.path.clone()),
            ..JobSpec::default()
        };

        persist(&job, &image, facts(), out.path(), now()).unwrap();
        assert!(image.path.exists());
    }

    #[test]
    fn clear_scratch_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seed_1.png"), b"x").unwrap();
        clear_scratch(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        clear_scratch(&dir.path().join("missing")).unwrap();
    }
}
