//! Per-job render pipeline.
//!
//! A job runs on one device, one request at a time:
//!
//! 1. late resolution of ranges and the random input image,
//! 2. model hot-swap when the wanted checkpoint is not loaded,
//! 3. trigger phrase insertion,
//! 4. the primary txt2img / img2img request (skipped for jobs that start
//!    from an existing image),
//! 5. the optional upscale request,
//! 6. persisting outputs and clearing the scratch directory,
//! 7. a [`JobReport`] for the scheduler.
//!
//! Failures end the job, never the run.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Local;
use dreamfactory_core::capabilities::{Capabilities, ULTIMATE_UPSCALE_SCRIPT};
use dreamfactory_core::error::CoreError;
use dreamfactory_core::images;
use dreamfactory_core::job::{
    ADetailerSettings, ControlNetSettings, HighresSettings, JobOrigin, JobSpec, UpscaleMethod,
    UpscaleSettings,
};
use dreamfactory_core::record;
use dreamfactory_core::triggers::{insert_trigger, strip_hash, TriggerPlacement, TriggerRegistry};
use dreamfactory_core::upscale::{fit_to_pixel_budget, DEFAULT_MAX_PIXELS};
use dreamfactory_sdapi::messages::{
    ultimate_upscale_args, ADetailerArgs, ControlNetUnit, ExtraSingleImageRequest,
    GenerationRequest, RenderRequest,
};
use dreamfactory_sdapi::supervisor::{
    DispatchOutput, RenderSupervisor, RenderedImage, SupervisorError,
};
use rand::Rng;
use serde_json::json;

use crate::output::{self, ImageFacts};

/// Alwayson script key of the ControlNet extension.
const CONTROLNET_KEY: &str = "controlnet";

/// Alwayson script key of the ADetailer extension.
const ADETAILER_KEY: &str = "ADetailer";

/// The device operations a job needs.
pub trait RenderDevice: Send + Sync {
    fn device_id(&self) -> &str;

    fn loaded_model(&self) -> Option<String>;

    /// Directory the device writes rendered images into.
    fn scratch_dir(&self) -> PathBuf;

    fn dispatch(
        &self,
        request: RenderRequest,
    ) -> impl Future<Output = Result<DispatchOutput, SupervisorError>> + Send;

    fn load_model(&self, title: &str) -> impl Future<Output = Result<(), SupervisorError>> + Send;
}

impl RenderDevice for RenderSupervisor {
    fn device_id(&self) -> &str {
        RenderSupervisor::device_id(self)
    }

    fn loaded_model(&self) -> Option<String> {
        RenderSupervisor::loaded_model(self)
    }

    fn scratch_dir(&self) -> PathBuf {
        RenderSupervisor::scratch_dir(self)
    }

    fn dispatch(
        &self,
        request: RenderRequest,
    ) -> impl Future<Output = Result<DispatchOutput, SupervisorError>> + Send {
        RenderSupervisor::dispatch(self, request)
    }

    fn load_model(&self, title: &str) -> impl Future<Output = Result<(), SupervisorError>> + Send {
        RenderSupervisor::load_model(self, title)
    }
}

/// Run-wide inputs shared by every job.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub capabilities: Capabilities,
    pub triggers: TriggerRegistry,
    pub output_root: PathBuf,
    /// Checkpoint for jobs that name none.
    pub default_ckpt_file: Option<String>,
    pub upscale_max_pixels: u64,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::default(),
            triggers: TriggerRegistry::default(),
            output_root: PathBuf::from("output"),
            default_ckpt_file: None,
            upscale_max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

/// Outcome of one job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub device: String,
    pub sequence: usize,
    pub origin: JobOrigin,
    pub success: bool,
    pub elapsed: Duration,
    pub outputs: Vec<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Device(#[from] SupervisorError),

    #[error(transparent)]
    Output(#[from] CoreError),

    #[error("job has no input image")]
    MissingInput,

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run `job` on `device`.
///
/// Ranges and the random input image are resolved with `rng` before the
/// returned future is first polled, so `rng` need not be `Send`.
pub fn execute<'a, D, R>(
    device: &'a D,
    mut job: JobSpec,
    ctx: &'a ExecutionContext,
    rng: &mut R,
) -> impl Future<Output = JobReport> + Send + 'a
where
    D: RenderDevice + ?Sized,
    R: Rng + ?Sized,
{
    job.resolve_late(rng);

    async move {
        let started = Instant::now();
        let device_id = device.device_id();
        tracing::info!(
            device = device_id,
            job = job.sequence,
            prompt = %job.prompt,
            "Starting job",
        );

        let result = run(device, &mut job, ctx).await;

        let scratch = device.scratch_dir();
        if let Err(e) = output::clear_scratch(&scratch) {
            tracing::warn!(device = device_id, error = %e, "Failed to clear scratch directory");
        }

        let elapsed = started.elapsed();
        let (success, outputs, error) = match result {
            Ok(outputs) => {
                tracing::info!(
                    device = device_id,
                    job = job.sequence,
                    images = outputs.len(),
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Job complete",
                );
                (true, outputs, None)
            }
            Err(e) => {
                tracing::error!(device = device_id, job = job.sequence, error = %e, "Job failed");
                (false, Vec::new(), Some(e.to_string()))
            }
        };

        JobReport {
            device: device_id.to_string(),
            sequence: job.sequence,
            origin: job.origin,
            success,
            elapsed,
            outputs,
            error,
        }
    }
}

async fn run<D: RenderDevice + ?Sized>(
    device: &D,
    job: &mut JobSpec,
    ctx: &ExecutionContext,
) -> Result<Vec<PathBuf>, ExecutorError> {
    let device_id = device.device_id();
    if let (Some(dir), None) = (&job.random_input_image_dir, &job.input_image) {
        tracing::warn!(device = device_id, dir = %dir.display(), "No images found in random input directory");
    }

    let wanted = job
        .ckpt_file
        .clone()
        .or_else(|| ctx.default_ckpt_file.clone());
    if job.renders_primary() {
        ensure_model(device, wanted.as_deref()).await?;
    }

    let model = wanted.or_else(|| device.loaded_model());
    insert_triggers(job, model.as_deref(), &ctx.triggers);

    let sources = if job.renders_primary() {
        let request = primary_request(device_id, job, &ctx.capabilities).await?;
        device.dispatch(request).await?.images
    } else {
        let input = job.input_image.clone().ok_or(ExecutorError::MissingInput)?;
        vec![existing_image(input, job.seed)]
    };

    let now = Local::now();
    let mut outputs = Vec::new();
    for image in sources {
        let (width, height) = images::dimensions(&image.path).unwrap_or((job.width, job.height));
        let facts = ImageFacts {
            width,
            height,
            model: model.as_deref(),
            upscaled: false,
        };

        let Some(settings) = job.upscale().cloned() else {
            outputs.push(output::persist(job, &image, facts, &ctx.output_root, now)?);
            continue;
        };

        if settings.keep_original && job.renders_primary() {
            outputs.push(output::persist(job, &image, facts, &ctx.output_root, now)?);
        }
        let upscaled =
            upscale(device, job, &image, (width, height), &settings, ctx, model.as_deref()).await?;
        for up in upscaled {
            let (width, height) = images::dimensions(&up.path).unwrap_or((width, height));
            let facts = ImageFacts {
                width,
                height,
                model: model.as_deref(),
                upscaled: true,
            };
            outputs.push(output::persist(job, &up, facts, &ctx.output_root, now)?);
        }
    }
    Ok(outputs)
}

/// Switch checkpoints if `wanted` is set and not already loaded.
async fn ensure_model<D: RenderDevice + ?Sized>(
    device: &D,
    wanted: Option<&str>,
) -> Result<(), ExecutorError> {
    let Some(wanted) = wanted else {
        return Ok(());
    };
    if device
        .loaded_model()
        .is_some_and(|loaded| same_model(&loaded, wanted))
    {
        return Ok(());
    }
    device.load_model(wanted).await?;
    Ok(())
}

fn same_model(a: &str, b: &str) -> bool {
    strip_hash(a).eq_ignore_ascii_case(strip_hash(b))
}

fn insert_triggers(job: &mut JobSpec, model: Option<&str>, triggers: &TriggerRegistry) {
    if job.trigger_placement == TriggerPlacement::Off {
        return;
    }
    let Some(trigger) = model.and_then(|m| triggers.lookup(m)) else {
        return;
    };
    let placement = job.trigger_placement.clone();
    job.prompt = insert_trigger(&job.prompt, trigger, &placement);
    if let Some(prompt) = job.highres.prompt.as_mut() {
        let updated = insert_trigger(prompt, trigger, &placement);
        *prompt = updated;
    }
}

/// An input image treated as if the device had just rendered it.
fn existing_image(path: PathBuf, seed: i64) -> RenderedImage {
    let infotext = record::read_record(&path)
        .map(|r| r.infotext)
        .unwrap_or_default();
    RenderedImage {
        path,
        infotext,
        seed: (seed >= 0).then_some(seed),
    }
}

async fn primary_request(
    device_id: &str,
    job: &JobSpec,
    caps: &Capabilities,
) -> Result<RenderRequest, ExecutorError> {
    let mut req = GenerationRequest {
        prompt: job.prompt.clone(),
        negative_prompt: job.negative_prompt.clone(),
        seed: job.seed,
        width: job.width,
        height: job.height,
        steps: job.steps.value(),
        cfg_scale: job.scale.value(),
        sampler_name: job.sampler.clone(),
        n_iter: job.samples.max(1),
        batch_size: job.batch_size.max(1),
        styles: job.styles.clone(),
        ..Default::default()
    };
    if let Some(vae) = &job.vae {
        req.override_settings.insert("sd_vae".to_string(), json!(vae));
    }
    if let Some(clip_skip) = job.clip_skip {
        req.override_settings
            .insert("CLIP_stop_at_last_layers".to_string(), json!(clip_skip));
    }

    if let Some(controlnet) = job.controlnet() {
        if caps.is_empty() || caps.controlnet_available() {
            let unit = controlnet_unit(controlnet).await?;
            req.add_alwayson(CONTROLNET_KEY, vec![serde_json::to_value(unit).unwrap_or_default()]);
        } else {
            tracing::warn!(device = device_id, "ControlNet is not available; rendering without it");
        }
    }
    attach_adetailer(device_id, &mut req, job.adetailer(), caps);

    match &job.input_image {
        Some(path) => {
            req.init_images = vec![encode_file(path).await?];
            req.denoising_strength = Some(job.strength.value());
            Ok(RenderRequest::Img2Img(req))
        }
        None => {
            if let Some(highres) = job.highres() {
                apply_highres(&mut req, highres);
            }
            Ok(RenderRequest::Txt2Img(req))
        }
    }
}

fn apply_highres(req: &mut GenerationRequest, highres: &HighresSettings) {
    req.enable_hr = true;
    req.hr_scale = Some(highres.scale_factor);
    req.hr_second_pass_steps = Some(highres.steps);
    req.hr_upscaler = Some(highres.upscaler.clone());
    req.denoising_strength = Some(highres.denoising_strength);
    req.hr_checkpoint_name = highres.ckpt_file.clone();
    req.hr_sampler_name = highres.sampler.clone();
    req.hr_prompt = highres.prompt.clone();
    req.hr_negative_prompt = highres.negative_prompt.clone();
}

async fn controlnet_unit(settings: &ControlNetSettings) -> Result<ControlNetUnit, ExecutorError> {
    let image = match &settings.input_image {
        Some(path) => encode_file(path).await?,
        None => String::new(),
    };
    Ok(ControlNetUnit {
        enabled: true,
        image,
        module: settings.preprocessor.clone(),
        model: settings.model.clone().unwrap_or_default(),
        weight: settings.weight,
        guidance_start: settings.guidance_start,
        guidance_end: settings.guidance_end,
        pixel_perfect: settings.pixel_perfect,
        low_vram: settings.low_vram,
        control_mode: settings.control_mode.api_label().to_string(),
    })
}

fn attach_adetailer(
    device_id: &str,
    req: &mut GenerationRequest,
    settings: Option<&ADetailerSettings>,
    caps: &Capabilities,
) {
    let Some(settings) = settings else {
        return;
    };
    if !caps.is_empty() && !caps.adetailer_available() {
        tracing::warn!(device = device_id, "ADetailer is not available; skipping detail pass");
        return;
    }
    let args = ADetailerArgs {
        ad_model: settings.model.clone().unwrap_or_default(),
        ad_prompt: settings.prompt.clone().unwrap_or_default(),
        ad_negative_prompt: settings.negative_prompt.clone().unwrap_or_default(),
        ad_confidence: settings.confidence,
        ad_denoising_strength: settings.denoising_strength,
    };
    req.add_alwayson(ADETAILER_KEY, args.into_args());
}

async fn upscale<D: RenderDevice + ?Sized>(
    device: &D,
    job: &JobSpec,
    image: &RenderedImage,
    size: (u32, u32),
    settings: &UpscaleSettings,
    ctx: &ExecutionContext,
    model: Option<&str>,
) -> Result<Vec<RenderedImage>, ExecutorError> {
    let device_id = device.device_id();
    let caps = &ctx.capabilities;
    let encoded = encode_file(&image.path).await?;

    let method = match &settings.method {
        UpscaleMethod::Ultimate if !caps.is_empty() && !caps.ultimate_upscale_available() => {
            tracing::warn!(
                device = device_id,
                "Ultimate SD upscale script is not installed; using sd upscale",
            );
            UpscaleMethod::Sd
        }
        method => method.clone(),
    };

    let request = match method {
        UpscaleMethod::Upscaler(name) => RenderRequest::ExtraSingleImage(ExtraSingleImageRequest {
            image: encoded,
            resize_mode: 0,
            upscaling_resize: settings.amount,
            upscaler_1: name,
            codeformer_visibility: settings.codeformer_visibility,
            gfpgan_visibility: settings.gfpgan_visibility,
        }),
        generative => {
            ensure_model(device, settings.ckpt_file.as_deref().or(model)).await?;

            let (width, height) =
                fit_to_pixel_budget(size.0, size.1, settings.amount, ctx.upscale_max_pixels);
            let mut req = GenerationRequest {
                prompt: settings.prompt.clone().unwrap_or_else(|| job.prompt.clone()),
                negative_prompt: settings
                    .negative_prompt
                    .clone()
                    .unwrap_or_else(|| job.negative_prompt.clone()),
                seed: image.seed.unwrap_or(job.seed),
                width,
                height,
                steps: settings.steps.unwrap_or_else(|| job.steps.value()),
                cfg_scale: job.scale.value(),
                sampler_name: settings.sampler.clone().unwrap_or_else(|| job.sampler.clone()),
                n_iter: 1,
                batch_size: 1,
                init_images: vec![encoded],
                denoising_strength: Some(settings.sd_strength),
                ..Default::default()
            };
            if generative == UpscaleMethod::Ultimate {
                req.script_name = Some(ULTIMATE_UPSCALE_SCRIPT.to_string());
                req.script_args = ultimate_upscale_args(ultimate_upscaler_index(caps), width, height);
            }
            attach_adetailer(device_id, &mut req, job.adetailer(), caps);
            tracing::info!(device = device_id, width, height, "Upscaling");
            RenderRequest::Img2Img(req)
        }
    };

    Ok(device.dispatch(request).await?.images)
}

/// Index of the upscaler the tiled script enlarges tiles with.
fn ultimate_upscaler_index(caps: &Capabilities) -> usize {
    caps.upscalers
        .iter()
        .position(|u| u.to_ascii_lowercase().contains("esrgan_4x"))
        .unwrap_or(0)
}

async fn encode_file(path: &Path) -> Result<String, ExecutorError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| ExecutorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use dreamfactory_core::job::PromptMode;
    use dreamfactory_sdapi::messages::RequestKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct FakeDevice {
        scratch: PathBuf,
        loaded: Mutex<Option<String>>,
        loads: Mutex<Vec<String>>,
        requests: Mutex<Vec<RenderRequest>>,
        fail: bool,
        counter: AtomicU32,
    }

    impl FakeDevice {
        fn new(scratch: &Path) -> Self {
            std::fs::create_dir_all(scratch).unwrap();
            Self {
                scratch: scratch.to_path_buf(),
                loaded: Mutex::new(Some("alpha.safetensors [111]".into())),
                loads: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                fail: false,
                counter: AtomicU32::new(0),
            }
        }

        fn requests(&self) -> Vec<RenderRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl RenderDevice for FakeDevice {
        fn device_id(&self) -> &str {
            "0"
        }

        fn loaded_model(&self) -> Option<String> {
            self.loaded.lock().unwrap().clone()
        }

        fn scratch_dir(&self) -> PathBuf {
            self.scratch.clone()
        }

        fn dispatch(
            &self,
            request: RenderRequest,
        ) -> impl Future<Output = Result<DispatchOutput, SupervisorError>> + Send {
            async move {
                let kind = request.kind();
                self.requests.lock().unwrap().push(request);
                if self.fail {
                    return Err(SupervisorError::EmptyResponse);
                }
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                let path = self.scratch.join(format!("seed_{n}.png"));
                std::fs::write(&path, b"not really a png").unwrap();
                Ok(DispatchOutput {
                    kind,
                    images: vec![RenderedImage {
                        path,
                        infotext: "Seed: 42".into(),
                        seed: Some(42),
                    }],
                })
            }
        }

        fn load_model(&self, title: &str) -> impl Future<Output = Result<(), SupervisorError>> + Send {
            let title = title.to_string();
            async move {
                self.loads.lock().unwrap().push(title.clone());
                *self.loaded.lock().unwrap() = Some(title);
                Ok(())
            }
        }
    }

    fn context(root: &Path) -> ExecutionContext {
        let triggers_path = root.join("triggers.txt");
        std::fs::write(&triggers_path, "beta.safetensors, btrig\n").unwrap();
        ExecutionContext {
            triggers: TriggerRegistry::load(&triggers_path).unwrap(),
            output_root: root.join("out"),
            ..ExecutionContext::default()
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(3)
    }

    // -- primary render -------------------------------------------------------------

    #[tokio::test]
    async fn swaps_model_inserts_trigger_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(&dir.path().join("scratch"));
        let ctx = context(dir.path());
        let job = JobSpec {
            prompt: "a castle, at dusk".into(),
            ckpt_file: Some("beta.safetensors [222]".into()),
            trigger_placement: TriggerPlacement::Start,
            sequence: 4,
            ..JobSpec::default()
        };

        let report = execute(&device, job, &ctx, &mut rng()).await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.sequence, 4);
        assert_eq!(report.outputs.len(), 1);
        assert!(report.outputs[0].exists());

        assert_eq!(*device.loads.lock().unwrap(), vec!["beta.safetensors [222]"]);
        match &device.requests()[0] {
            RenderRequest::Txt2Img(req) => {
                assert_eq!(req.prompt, "btrig, a castle, at dusk");
                assert_eq!(req.seed, -1);
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert_eq!(std::fs::read_dir(&device.scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn loaded_model_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(&dir.path().join("scratch"));
        let ctx = context(dir.path());
        let job = JobSpec {
            ckpt_file: Some("ALPHA.safetensors".into()),
            ..JobSpec::default()
        };

        execute(&device, job, &ctx, &mut rng()).await;
        assert!(device.loads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn input_image_selects_img2img_and_drops_missing_controlnet() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(&dir.path().join("scratch"));
        let mut ctx = context(dir.path());
        ctx.capabilities.samplers = vec!["Euler a".into()];

        let input = dir.path().join("in.png");
        std::fs::write(&input, b"pixels").unwrap();
        let mut job = JobSpec {
            input_image: Some(input.clone()),
            ..JobSpec::default()
        };
        job.controlnet.input_image = Some(input);
        job.controlnet.model = Some("control_canny".into());

        let report = execute(&device, job, &ctx, &mut rng()).await;
        assert!(report.success);
        match &device.requests()[0] {
            RenderRequest::Img2Img(req) => {
                assert_eq!(req.init_images, vec![BASE64.encode(b"pixels")]);
                assert_eq!(req.denoising_strength, Some(0.75));
                assert!(req.alwayson_scripts.is_empty());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    // -- upscale ------------------------------------------------------------------------

    #[tokio::test]
    async fn ultimate_without_script_downgrades_to_sd() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(&dir.path().join("scratch"));
        let mut ctx = context(dir.path());
        ctx.capabilities.samplers = vec!["Euler a".into()];

        let mut job = JobSpec::default();
        job.upscale.enabled = true;
        job.upscale.method = UpscaleMethod::Ultimate;
        job.upscale.amount = 2.0;

        let report = execute(&device, job, &ctx, &mut rng()).await;
        assert!(report.success);
        assert_eq!(report.outputs.len(), 1);

        let requests = device.requests();
        assert_eq!(requests.len(), 2);
        match &requests[1] {
            RenderRequest::Img2Img(req) => {
                assert_eq!(req.script_name, None);
                assert_eq!((req.width, req.height), (1024, 1024));
                assert_eq!(req.seed, 42);
                assert_eq!(req.denoising_strength, Some(0.3));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn process_job_only_upscales_its_input() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(&dir.path().join("scratch"));
        let ctx = context(dir.path());

        let input = dir.path().join("old.png");
        std::fs::write(&input, b"old").unwrap();
        let mut job = JobSpec {
            mode: PromptMode::Process,
            input_image: Some(input.clone()),
            seed: 9,
            ..JobSpec::default()
        };
        job.upscale.enabled = true;
        job.upscale.keep_original = true;

        let report = execute(&device, job, &ctx, &mut rng()).await;
        assert!(report.success);
        assert_eq!(report.outputs.len(), 1);

        let requests = device.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind(), RequestKind::ExtraSingleImage);
        assert!(input.exists());
    }

    // -- failures -----------------------------------------------------------------------

    #[tokio::test]
    async fn device_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new(&dir.path().join("scratch"));
        device.fail = true;
        let ctx = context(dir.path());

        let report = execute(&device, JobSpec::default(), &ctx, &mut rng()).await;
        assert!(!report.success);
        assert!(report.outputs.is_empty());
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn process_job_without_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(&dir.path().join("scratch"));
        let ctx = context(dir.path());
        let job = JobSpec {
            mode: PromptMode::Process,
            ..JobSpec::default()
        };

        let report = execute(&device, job, &ctx, &mut rng()).await;
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("job has no input image"));
    }
}
