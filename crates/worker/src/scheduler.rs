//! Run controller.
//!
//! One task owns the queues, the loaded template and the sweep state.
//! Device tasks report back over the same command channel the
//! [`SchedulerHandle`] writes to, so every state change happens inside
//! [`Scheduler::run`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dreamfactory_core::capabilities::Capabilities;
use dreamfactory_core::compiler::{self, CompileContext, CompiledQueue};
use dreamfactory_core::directives::RunControl;
use dreamfactory_core::job::{JobSpec, PromptMode};
use dreamfactory_core::queue::WorkQueue;
use dreamfactory_core::sweep::{ModelSweepState, SweepOverrides, SweepStep};
use dreamfactory_core::template::PromptTemplate;
use dreamfactory_core::triggers::TriggerRegistry;
use dreamfactory_core::wildcards::WildcardTable;
use dreamfactory_sdapi::supervisor::SupervisorError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};

use crate::config::WorkerConfig;
use crate::executor::{ExecutionContext, JobReport};

/// Interval between dispatch passes when no command arrives.
const DEFAULT_TICK: Duration = Duration::from_millis(100);

const COMMAND_BUFFER: usize = 64;

/// The set of render devices a scheduler drives, addressed by slot index.
pub trait RenderPool: Send + Sync + 'static {
    fn device_ids(&self) -> Vec<String>;

    /// Launch the device and wait until it accepts requests.
    fn start(&self, slot: usize) -> impl Future<Output = Result<(), SupervisorError>> + Send;

    fn discover(
        &self,
        slot: usize,
    ) -> impl Future<Output = Result<Capabilities, SupervisorError>> + Send;

    fn execute(
        &self,
        slot: usize,
        job: JobSpec,
        ctx: Arc<ExecutionContext>,
    ) -> impl Future<Output = JobReport> + Send;

    /// Stop every device. Called once when the run loop exits.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    /// Waiting for the first device and capability discovery.
    #[default]
    Bootstrapping,
    Dispatching,
    Paused,
    /// No more main-queue work; waiting for running jobs.
    Draining,
    Idle,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Starting,
    Idle,
    Discovering,
    Busy,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub id: String,
    pub state: DeviceState,
    /// Sequence number of the running job.
    pub current_job: Option<usize>,
    pub jobs_done: u64,
}

/// Snapshot published after every scheduler pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStatus {
    pub phase: RunPhase,
    pub main_queue: usize,
    pub priority_queue: usize,
    pub devices: Vec<DeviceStatus>,
    pub jobs_done: u64,
    pub jobs_failed: u64,
    pub template: Option<PathBuf>,
    pub model: Option<String>,
    pub loops: u32,
}

/// Totals returned by [`Scheduler::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub jobs_done: u64,
    pub jobs_failed: u64,
    pub loops: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no render device could be started")]
    NoDevices,

    #[error("scheduler has stopped")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub job_defaults: JobSpec,
    pub output_root: PathBuf,
    pub wildcard_dir: PathBuf,
    pub trigger_file: PathBuf,
    pub default_ckpt_file: Option<String>,
    pub upscale_max_pixels: u64,
    pub random_queue_size: usize,
    /// Template loaded once the first device is ready.
    pub initial_template: Option<PathBuf>,
    pub tick: Duration,
    /// Return from [`Scheduler::run`] once all work is done.
    pub exit_when_idle: bool,
}

impl From<&WorkerConfig> for SchedulerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            job_defaults: config.job_defaults.clone(),
            output_root: config.output_location.clone(),
            wildcard_dir: config.wildcard_location.clone(),
            trigger_file: config.model_trigger_file.clone(),
            default_ckpt_file: config.default_ckpt_file.clone(),
            upscale_max_pixels: config.upscale_max_pixels,
            random_queue_size: config.random_queue_size,
            initial_template: config.prompt_file.clone(),
            tick: DEFAULT_TICK,
            exit_when_idle: false,
        }
    }
}

#[derive(Debug)]
enum Command {
    DeviceReady { slot: usize },
    DeviceFailed { slot: usize, error: String },
    CapabilitiesDiscovered {
        slot: usize,
        result: Result<Capabilities, String>,
    },
    JobFinished { slot: usize, report: JobReport },
    LoadTemplate(PathBuf),
    EnqueueUpscale(PathBuf),
    Pause,
    Resume,
    Shutdown,
}

/// Cloneable control surface for a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<SchedulerStatus>,
}

impl SchedulerHandle {
    /// Replace the main queue with a fresh compile of `path`.
    pub async fn load_template(&self, path: impl Into<PathBuf>) -> Result<(), SchedulerError> {
        self.send(Command::LoadTemplate(path.into())).await
    }

    /// Queue an enlargement of an existing image ahead of template work.
    pub async fn enqueue_upscale(&self, image: impl Into<PathBuf>) -> Result<(), SchedulerError> {
        self.send(Command::EnqueueUpscale(image.into())).await
    }

    /// Stop taking main-queue jobs. Priority jobs still run.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send(Command::Resume).await
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send(Command::Shutdown).await
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bootstrap {
    Pending,
    Requested,
    Done,
}

#[derive(Debug)]
struct DeviceSlot {
    id: String,
    state: DeviceState,
    current_job: Option<usize>,
    jobs_done: u64,
}

pub struct Scheduler<P: RenderPool> {
    pool: Arc<P>,
    settings: SchedulerSettings,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    status: watch::Sender<SchedulerStatus>,
    devices: Vec<DeviceSlot>,
    queue: WorkQueue,
    template: Option<PromptTemplate>,
    pending_template: Option<PathBuf>,
    control: RunControl,
    sweep: ModelSweepState,
    last_pass_jobs: usize,
    wildcards: WildcardTable,
    triggers: TriggerRegistry,
    capabilities: Capabilities,
    exec_ctx: Arc<ExecutionContext>,
    bootstrap: Bootstrap,
    phase: RunPhase,
    paused: bool,
    jobs_done: u64,
    jobs_failed: u64,
    upscale_requests: usize,
    rng: StdRng,
}

impl<P: RenderPool> Scheduler<P> {
    pub fn new(pool: P, settings: SchedulerSettings) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());

        let devices = pool
            .device_ids()
            .into_iter()
            .map(|id| DeviceSlot {
                id,
                state: DeviceState::Starting,
                current_job: None,
                jobs_done: 0,
            })
            .collect();

        let triggers = TriggerRegistry::load(&settings.trigger_file).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read model trigger file");
            TriggerRegistry::default()
        });

        let handle = SchedulerHandle {
            tx: tx.clone(),
            status: status_rx,
        };
        let mut scheduler = Self {
            pool: Arc::new(pool),
            pending_template: settings.initial_template.clone(),
            settings,
            tx,
            rx,
            status: status_tx,
            devices,
            queue: WorkQueue::new(),
            template: None,
            control: RunControl::default(),
            sweep: ModelSweepState::default(),
            last_pass_jobs: 0,
            wildcards: WildcardTable::new(),
            triggers,
            capabilities: Capabilities::default(),
            exec_ctx: Arc::default(),
            bootstrap: Bootstrap::Pending,
            phase: RunPhase::Bootstrapping,
            paused: false,
            jobs_done: 0,
            jobs_failed: 0,
            upscale_requests: 0,
            rng: StdRng::from_rng(&mut rand::rng()),
        };
        scheduler.rebuild_context();
        (scheduler, handle)
    }

    /// Drive the run until shutdown (or until idle, if configured), then
    /// stop every device.
    pub async fn run(mut self) -> Result<RunSummary, SchedulerError> {
        tracing::info!(devices = self.devices.len(), "Scheduler started");
        self.start_devices();

        let mut ticker = tokio::time::interval(self.settings.tick);
        let outcome = loop {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                _ = ticker.tick() => None,
            };
            if let Some(command) = command {
                self.handle(command);
            }

            if self.all_failed() {
                tracing::error!("Every render device failed to start");
                break Err(SchedulerError::NoDevices);
            }

            self.dispatch();
            self.publish();

            if self.phase == RunPhase::ShuttingDown {
                break Ok(self.summary());
            }
            if self.phase == RunPhase::Idle && self.settings.exit_when_idle {
                tracing::info!("All work finished");
                break Ok(self.summary());
            }
        };

        self.pool.shutdown().await;
        tracing::info!(
            jobs_done = self.jobs_done,
            jobs_failed = self.jobs_failed,
            "Scheduler stopped",
        );
        outcome
    }

    fn start_devices(&self) {
        for slot in 0..self.devices.len() {
            let pool = Arc::clone(&self.pool);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let command = match pool.start(slot).await {
                    Ok(()) => Command::DeviceReady { slot },
                    Err(e) => Command::DeviceFailed {
                        slot,
                        error: e.to_string(),
                    },
                };
                let _ = tx.send(command).await;
            });
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::DeviceReady { slot } => {
                self.set_state(slot, DeviceState::Idle);
                tracing::info!(device = %self.device_id(slot), "Device ready");
            }
            Command::DeviceFailed { slot, error } => {
                self.set_state(slot, DeviceState::Failed);
                tracing::error!(device = %self.device_id(slot), error = %error, "Device failed to start");
            }
            Command::CapabilitiesDiscovered { slot, result } => self.finish_bootstrap(slot, result),
            Command::JobFinished { slot, report } => self.finish_job(slot, report),
            Command::LoadTemplate(path) => {
                if self.bootstrap == Bootstrap::Done {
                    self.load_template(&path);
                } else {
                    self.pending_template = Some(path);
                }
            }
            Command::EnqueueUpscale(path) => self.enqueue_upscale(path),
            Command::Pause => {
                self.paused = true;
                tracing::info!("Paused");
            }
            Command::Resume => {
                self.paused = false;
                tracing::info!("Resumed");
            }
            Command::Shutdown => {
                self.phase = RunPhase::ShuttingDown;
                tracing::info!("Shutdown requested");
            }
        }
    }

    fn dispatch(&mut self) {
        if self.phase == RunPhase::ShuttingDown {
            return;
        }

        if self.bootstrap != Bootstrap::Done {
            if self.bootstrap == Bootstrap::Pending {
                if let Some(slot) = self.idle_slot() {
                    self.request_discovery(slot);
                }
            }
            return;
        }

        while let Some(slot) = self.idle_slot() {
            let Some(job) = self.next_job() else {
                break;
            };
            self.start_job(slot, job);
        }

        if self.phase == RunPhase::Draining && self.queue.is_empty() && !self.any_busy() {
            self.phase = RunPhase::Idle;
            tracing::info!(
                jobs_done = self.jobs_done,
                jobs_failed = self.jobs_failed,
                "Queue finished",
            );
        }
    }

    fn next_job(&mut self) -> Option<JobSpec> {
        if let Some(job) = self.queue.pop_priority() {
            return Some(job);
        }
        if self.paused || self.phase != RunPhase::Dispatching {
            return None;
        }
        if self.queue.main_len() == 0 {
            self.advance_run();
        }
        self.queue.pop_next().map(|(job, _)| job)
    }

    /// Refill the main queue once it runs dry: random refill, next sweep
    /// step, repeat, or the chained template. Anything else drains the run.
    fn advance_run(&mut self) {
        if self.template.is_none() || self.last_pass_jobs == 0 {
            self.begin_draining();
            return;
        }

        if self.control.mode == PromptMode::Random {
            self.compile_pass();
            return;
        }

        match self.sweep.advance() {
            SweepStep::Highres | SweepStep::Model => {
                self.sweep.record_loop();
                self.compile_pass();
                return;
            }
            SweepStep::Complete => {}
        }

        if self.control.repeat {
            self.sweep.restart();
            self.sweep.record_loop();
            tracing::info!(loop_index = self.sweep.total_loops(), "Repeating template");
            self.compile_pass();
            return;
        }

        if let Some(next) = self.control.next_template.clone() {
            let next = self.resolve_next(next);
            tracing::info!(template = %next.display(), "Continuing with next template");
            self.load_template(&next);
            return;
        }

        self.begin_draining();
    }

    fn begin_draining(&mut self) {
        if self.phase == RunPhase::Dispatching {
            tracing::info!("No more queued work; waiting for running jobs");
            self.phase = RunPhase::Draining;
        }
    }

    /// Relative chained paths are tried as given, then next to the current
    /// template.
    fn resolve_next(&self, next: PathBuf) -> PathBuf {
        if next.is_absolute() || next.exists() {
            return next;
        }
        self.template
            .as_ref()
            .and_then(|t| t.path.as_deref())
            .and_then(Path::parent)
            .map(|dir| dir.join(&next))
            .unwrap_or(next)
    }

    fn load_template(&mut self, path: &Path) {
        let template = match PromptTemplate::load(path) {
            Ok(template) => template,
            Err(e) => {
                tracing::error!(template = %path.display(), error = %e, "Failed to load template");
                self.begin_draining();
                return;
            }
        };

        self.wildcards = WildcardTable::load_dir(&self.settings.wildcard_dir).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read wildcard files");
            WildcardTable::new()
        });

        let dropped = self.queue.clear_main();
        if dropped > 0 {
            tracing::info!(dropped, "Discarded pending jobs");
        }

        self.template = Some(template);
        self.control = RunControl::default();
        self.sweep = ModelSweepState::default();
        tracing::info!(template = %path.display(), wildcards = self.wildcards.len(), "Template loaded");

        if matches!(self.phase, RunPhase::Bootstrapping | RunPhase::Draining | RunPhase::Idle) {
            self.phase = RunPhase::Dispatching;
        }
        self.compile_pass();
    }

    /// Compile the current template into the main queue. The first pass
    /// of a template that configures a sweep is recompiled with the
    /// sweep's first checkpoint.
    fn compile_pass(&mut self) {
        let mut compiled = self.compile_with(self.sweep.overrides());
        let sweep_configured =
            !compiled.control.model_sweep.is_empty() || !compiled.control.highres_sweep.is_empty();
        if sweep_configured && !self.sweep.is_active() {
            self.sweep = ModelSweepState::new(
                compiled.control.model_sweep.clone(),
                compiled.control.highres_sweep.clone(),
            );
            tracing::info!(
                models = self.sweep.model_count(),
                highres_models = compiled.control.highres_sweep.len(),
                "Model sweep started",
            );
            compiled = self.compile_with(self.sweep.overrides());
        }

        let template = self
            .template
            .as_ref()
            .and_then(|t| t.path.as_deref())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        for warning in &compiled.warnings {
            tracing::warn!(template = %template, "{warning}");
        }

        self.last_pass_jobs = compiled.jobs.len();
        tracing::info!(
            jobs = self.last_pass_jobs,
            loop_index = self.sweep.total_loops(),
            model = self.sweep.current_model().unwrap_or("-"),
            "Queue compiled",
        );
        self.queue.extend_main(compiled.jobs);
        self.control = compiled.control;
    }

    fn compile_with(&mut self, overrides: SweepOverrides) -> CompiledQueue {
        let Some(template) = &self.template else {
            return CompiledQueue::default();
        };
        let ctx = CompileContext {
            template,
            defaults: &self.settings.job_defaults,
            capabilities: &self.capabilities,
            wildcards: &self.wildcards,
            overrides,
            loop_index: self.sweep.total_loops(),
            seed_offset: self.sweep.seed_offset(),
            queue_depth: self.settings.random_queue_size,
        };
        compiler::compile(&ctx, &mut self.rng)
    }

    fn enqueue_upscale(&mut self, image: PathBuf) {
        if !image.is_file() {
            tracing::warn!(image = %image.display(), "Upscale source not found");
            return;
        }
        self.upscale_requests += 1;
        let mut job = JobSpec::upscale_request(
            image,
            self.settings.job_defaults.upscale.clone(),
            &self.settings.job_defaults,
        );
        job.sequence = self.upscale_requests;
        tracing::info!(
            image = %job.input_image.as_deref().unwrap_or(Path::new("")).display(),
            "Upscale request queued",
        );
        self.queue.push_priority(job);
    }

    fn request_discovery(&mut self, slot: usize) {
        self.bootstrap = Bootstrap::Requested;
        self.set_state(slot, DeviceState::Discovering);
        tracing::info!(device = %self.device_id(slot), "Querying backend capabilities");

        let pool = Arc::clone(&self.pool);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = pool.discover(slot).await.map_err(|e| e.to_string());
            let _ = tx
                .send(Command::CapabilitiesDiscovered { slot, result })
                .await;
        });
    }

    fn finish_bootstrap(&mut self, slot: usize, result: Result<Capabilities, String>) {
        let device = self.device_id(slot);
        let capabilities = match result {
            Ok(capabilities) => {
                tracing::info!(
                    device = %device,
                    models = capabilities.models.len(),
                    samplers = capabilities.samplers.len(),
                    upscalers = capabilities.upscalers.len(),
                    "Capabilities discovered",
                );
                capabilities
            }
            Err(error) => {
                tracing::warn!(
                    device = %device,
                    error = %error,
                    "Capability discovery failed; templates will not be validated",
                );
                Capabilities::default()
            }
        };

        if !capabilities.models.is_empty() && self.triggers.sync(&capabilities.models) {
            match self.triggers.save() {
                Ok(()) => tracing::info!(entries = self.triggers.entries().len(), "Model trigger file updated"),
                Err(e) => tracing::warn!(error = %e, "Failed to write model trigger file"),
            }
        }

        self.capabilities = capabilities;
        self.rebuild_context();
        self.set_state(slot, DeviceState::Idle);
        self.bootstrap = Bootstrap::Done;
        if self.phase == RunPhase::Bootstrapping {
            self.phase = RunPhase::Dispatching;
        }

        if let Some(path) = self.pending_template.take() {
            self.load_template(&path);
        }
    }

    fn start_job(&mut self, slot: usize, job: JobSpec) {
        self.set_state(slot, DeviceState::Busy);
        if let Some(device) = self.devices.get_mut(slot) {
            device.current_job = Some(job.sequence);
        }

        let pool = Arc::clone(&self.pool);
        let tx = self.tx.clone();
        let ctx = Arc::clone(&self.exec_ctx);
        let device = self.device_id(slot);
        let (sequence, origin) = (job.sequence, job.origin);
        tokio::spawn(async move {
            // The device must be released even if the job task panics.
            let run = tokio::spawn(async move { pool.execute(slot, job, ctx).await });
            let report = match run.await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(device = %device, job = sequence, error = %e, "Job task aborted");
                    JobReport {
                        device,
                        sequence,
                        origin,
                        success: false,
                        elapsed: Duration::ZERO,
                        outputs: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            let _ = tx.send(Command::JobFinished { slot, report }).await;
        });
    }

    fn finish_job(&mut self, slot: usize, report: JobReport) {
        if report.success {
            self.jobs_done += 1;
        } else {
            self.jobs_failed += 1;
        }
        if let Some(device) = self.devices.get_mut(slot) {
            device.current_job = None;
            device.jobs_done += 1;
        }
        self.set_state(slot, DeviceState::Idle);
        tracing::debug!(
            device = %report.device,
            job = report.sequence,
            success = report.success,
            "Device released",
        );
    }

    fn rebuild_context(&mut self) {
        self.exec_ctx = Arc::new(ExecutionContext {
            capabilities: self.capabilities.clone(),
            triggers: self.triggers.clone(),
            output_root: self.settings.output_root.clone(),
            default_ckpt_file: self.settings.default_ckpt_file.clone(),
            upscale_max_pixels: self.settings.upscale_max_pixels,
        });
    }

    fn set_state(&mut self, slot: usize, state: DeviceState) {
        if let Some(device) = self.devices.get_mut(slot) {
            device.state = state;
        }
    }

    fn device_id(&self, slot: usize) -> String {
        self.devices
            .get(slot)
            .map(|d| d.id.clone())
            .unwrap_or_default()
    }

    fn idle_slot(&self) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.state == DeviceState::Idle)
    }

    fn any_busy(&self) -> bool {
        self.devices
            .iter()
            .any(|d| matches!(d.state, DeviceState::Busy | DeviceState::Discovering))
    }

    fn all_failed(&self) -> bool {
        self.devices.iter().all(|d| d.state == DeviceState::Failed)
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            jobs_done: self.jobs_done,
            jobs_failed: self.jobs_failed,
            loops: self.sweep.total_loops(),
        }
    }

    fn publish(&self) {
        let phase = if self.paused && self.phase != RunPhase::ShuttingDown {
            RunPhase::Paused
        } else {
            self.phase
        };
        self.status.send_replace(SchedulerStatus {
            phase,
            main_queue: self.queue.main_len(),
            priority_queue: self.queue.priority_len(),
            devices: self
                .devices
                .iter()
                .map(|d| DeviceStatus {
                    id: d.id.clone(),
                    state: d.state,
                    current_job: d.current_job,
                    jobs_done: d.jobs_done,
                })
                .collect(),
            jobs_done: self.jobs_done,
            jobs_failed: self.jobs_failed,
            template: self.template.as_ref().and_then(|t| t.path.clone()),
            model: self.sweep.current_model().map(str::to_string),
            loops: self.sweep.total_loops(),
        });
    }
}
