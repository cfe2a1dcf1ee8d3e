//! Render process supervisor.
//!
//! [`RenderSupervisor`] owns one external render process bound to one
//! compute device. It writes the device's launch script, spawns the process
//! in its own process group with output redirected to per-device log files,
//! waits for the API to come up, and then serves requests one at a time.
//!
//! Lifecycle: `Uninitialized -> Launching -> PollingReady -> Ready`, or
//! `Failed` when startup does not complete. `Stopped` after shutdown.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dreamfactory_core::capabilities::Capabilities;
use dreamfactory_core::naming::unique_path;
use dreamfactory_core::record::seed_from_infotext;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::{SdApi, SdApiError};
use crate::launch::{write_launch_script, LaunchError, Platform};
use crate::messages::{png_data_url, strip_data_url, RenderRequest, RequestKind};
use crate::readiness::{poll_until_ready, Readiness, ReadinessConfig};

/// Lifecycle state of a supervised render process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Uninitialized,
    Launching,
    PollingReady,
    Ready,
    Failed,
    Stopped,
}

/// Errors from process lifecycle management and request dispatch.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A request is already outstanding on this device.
    #[error("device is busy with another request")]
    Busy,

    #[error("device is not ready (state {0:?})")]
    NotReady(SupervisorState),

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("failed to spawn render process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("render process exited during startup (exit code {0:?})")]
    Exited(Option<i32>),

    #[error("render process not ready after {0} seconds")]
    StartupTimeout(u64),

    #[error(transparent)]
    Api(#[from] SdApiError),

    #[error("invalid image payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("render backend returned no images")]
    EmptyResponse,

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Static settings for one device.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub device_id: String,
    pub port: u16,
    /// Render backend installation directory.
    pub sd_location: PathBuf,
    pub log_dir: PathBuf,
    /// Parent of the per-device scratch directories.
    pub scratch_root: PathBuf,
    pub platform: Platform,
    pub readiness: ReadinessConfig,
    /// Use the backend's legacy high-res fix sizing.
    pub legacy_highres_fix: bool,
    /// Longest wait for an interrupt request during shutdown.
    pub interrupt_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when stopping the process group.
    pub kill_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(device_id: impl Into<String>, port: u16, sd_location: impl Into<PathBuf>) -> Self {
        Self {
            device_id: device_id.into(),
            port,
            sd_location: sd_location.into(),
            log_dir: PathBuf::from("logs"),
            scratch_root: PathBuf::from("output").join(".scratch"),
            platform: Platform::current(),
            readiness: ReadinessConfig::default(),
            legacy_highres_fix: false,
            interrupt_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_root.join(format!("gpu-{}", self.device_id))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("gpu-{}-log.txt", self.device_id))
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.log_dir.join(format!("gpu-{}-errors.txt", self.device_id))
    }
}

/// One image written to the scratch directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub path: PathBuf,
    /// Backend "parameters" text for the image.
    pub infotext: String,
    /// Seed the backend actually used.
    pub seed: Option<i64>,
}

/// Result of one dispatched request.
#[derive(Debug, Clone)]
pub struct DispatchOutput {
    pub kind: RequestKind,
    pub images: Vec<RenderedImage>,
}

/// Supervises one render process. Share it behind an `Arc`.
pub struct RenderSupervisor {
    config: SupervisorConfig,
    api: SdApi,
    state: watch::Sender<SupervisorState>,
    process: tokio::sync::Mutex<Option<RenderProcess>>,
    /// Held for the duration of every backend request.
    request_lock: tokio::sync::Mutex<()>,
    busy: AtomicBool,
    loaded_model: Mutex<Option<String>>,
    pending_model: Mutex<Option<String>>,
    requests: AtomicU64,
    cancel: CancellationToken,
}

/// Clears the busy flag when a request finishes, however it finishes.
#[derive(Debug)]
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    _lock: tokio::sync::MutexGuard<'a, ()>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl RenderSupervisor {
    /// `parent` is the run-wide shutdown token; the supervisor watches a
    /// child of it.
    pub fn new(config: SupervisorConfig, parent: &CancellationToken) -> Self {
        let api = SdApi::new(config.api_url());
        let (state, _) = watch::channel(SupervisorState::Uninitialized);
        Self {
            config,
            api,
            state,
            process: tokio::sync::Mutex::new(None),
            request_lock: tokio::sync::Mutex::new(()),
            busy: AtomicBool::new(false),
            loaded_model: Mutex::new(None),
            pending_model: Mutex::new(None),
            requests: AtomicU64::new(0),
            cancel: parent.child_token(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn api(&self) -> &SdApi {
        &self.api
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SupervisorState::Ready
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn loaded_model(&self) -> Option<String> {
        lock(&self.loaded_model).clone()
    }

    /// The checkpoint a [`RenderSupervisor::load_model`] call is switching to.
    pub fn pending_model(&self) -> Option<String> {
        lock(&self.pending_model).clone()
    }

    /// Number of completed dispatches.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.config.scratch_dir()
    }

    /// Launch the render process and wait until its API answers.
    ///
    /// On failure the state is `Failed` and the process (if any) has been
    /// stopped; the device should not be used for the rest of the run.
    pub async fn initialize(&self) -> Result<(), SupervisorError> {
        let result = self.launch_and_wait().await;
        if let Err(e) = &result {
            self.set_state(SupervisorState::Failed);
            tracing::error!(device = %self.config.device_id, error = %e, "Render process startup failed");
        }
        result
    }

    /// Send one request and collect its images into the scratch directory.
    ///
    /// At most one request is outstanding per device; a concurrent call
    /// gets [`SupervisorError::Busy`]. Responses that arrive after shutdown
    /// began are discarded.
    pub async fn dispatch(&self, request: RenderRequest) -> Result<DispatchOutput, SupervisorError> {
        let _guard = self.begin_request()?;
        let kind = request.kind();

        let images = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SupervisorError::ShuttingDown),
            result = self.send(&request) => result?,
        };
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        let images = self.store_images(kind, images).await?;
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(DispatchOutput { kind, images })
    }

    /// Switch the loaded checkpoint.
    ///
    /// [`RenderSupervisor::pending_model`] reports `title` until the backend
    /// answers; the loaded model is updated only on success.
    pub async fn load_model(&self, title: &str) -> Result<(), SupervisorError> {
        let _guard = self.begin_request()?;
        let device = self.config.device_id.as_str();

        *lock(&self.pending_model) = Some(title.to_string());
        tracing::info!(device, model = title, "Requesting model load");

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(SupervisorError::ShuttingDown),
            result = self.api.set_model(title) => result.map_err(SupervisorError::from),
        };

        *lock(&self.pending_model) = None;
        match &result {
            Ok(()) => {
                *lock(&self.loaded_model) = Some(title.to_string());
                tracing::info!(device, model = title, "Model loaded");
            }
            Err(e) => tracing::warn!(device, model = title, error = %e, "Model load failed"),
        }
        result
    }

    /// Query every backend capability list.
    pub async fn discover_capabilities(&self) -> Result<Capabilities, SupervisorError> {
        let _guard = self.begin_request()?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SupervisorError::ShuttingDown),
            result = self.api.discover_capabilities() => Ok(result?),
        }
    }

    /// Ask the backend to abandon its current render.
    pub async fn interrupt(&self) -> Result<(), SupervisorError> {
        Ok(self.api.interrupt().await?)
    }

    /// Interrupt any outstanding request, stop the process group, and
    /// remove the scratch directory.
    pub async fn shutdown(&self) {
        let device = self.config.device_id.as_str();
        // Cancelling drops the in-flight request guard, so sample first.
        let was_busy = self.is_busy();
        self.cancel.cancel();

        if was_busy {
            tracing::info!(device, "Interrupting in-flight request");
            match tokio::time::timeout(self.config.interrupt_timeout, self.api.interrupt()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(device, error = %e, "Interrupt request failed"),
                Err(_) => tracing::warn!(device, "Interrupt request timed out"),
            }
        }

        if let Some(mut process) = self.process.lock().await.take() {
            tracing::info!(device, "Stopping render process");
            process.terminate(self.config.kill_grace).await;
        }

        let scratch = self.scratch_dir();
        match tokio::fs::remove_dir_all(&scratch).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(device, error = %e, "Failed to remove scratch directory"),
        }

        self.set_state(SupervisorState::Stopped);
    }

    // ---- private helpers ----

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    fn begin_request(&self) -> Result<BusyGuard<'_>, SupervisorError> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let state = self.state();
        if state != SupervisorState::Ready {
            return Err(SupervisorError::NotReady(state));
        }
        let lock = self
            .request_lock
            .try_lock()
            .map_err(|_| SupervisorError::Busy)?;
        self.busy.store(true, Ordering::SeqCst);
        Ok(BusyGuard {
            busy: &self.busy,
            _lock: lock,
        })
    }

    async fn launch_and_wait(&self) -> Result<(), SupervisorError> {
        let device = self.config.device_id.as_str();
        self.set_state(SupervisorState::Launching);

        let script = write_launch_script(
            &self.config.sd_location,
            self.config.platform,
            self.config.port,
            device,
        )?;
        let (stdout, stderr) = self.open_logs()?;

        let mut cmd = launch_command(self.config.platform, &script);
        cmd.current_dir(&self.config.sd_location)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut process = RenderProcess::new(cmd.spawn().map_err(SupervisorError::Spawn)?);
        tracing::info!(
            device,
            pid = process.pid,
            port = self.config.port,
            script = %script.display(),
            "Started render process",
        );

        self.set_state(SupervisorState::PollingReady);
        let api = &self.api;
        let readiness = poll_until_ready(
            || async move { api.probe_ready().await.unwrap_or(false) },
            || match process.child.try_wait() {
                Ok(Some(status)) => Some(status.code()),
                _ => None,
            },
            &self.config.readiness,
            &self.cancel,
        )
        .await;

        match readiness {
            Readiness::Ready => {}
            Readiness::Exited(code) => {
                // The launcher may have left children behind in its group.
                process.terminate(self.config.kill_grace).await;
                return Err(SupervisorError::Exited(code));
            }
            Readiness::TimedOut => {
                process.terminate(self.config.kill_grace).await;
                return Err(SupervisorError::StartupTimeout(
                    self.config.readiness.timeout.as_secs(),
                ));
            }
            Readiness::Cancelled => {
                process.terminate(self.config.kill_grace).await;
                return Err(SupervisorError::ShuttingDown);
            }
        }

        *self.process.lock().await = Some(process);
        self.after_ready().await?;
        self.set_state(SupervisorState::Ready);
        tracing::info!(device, "Render process ready");
        Ok(())
    }

    /// One-time setup once the API is up.
    async fn after_ready(&self) -> Result<(), SupervisorError> {
        let device = self.config.device_id.as_str();
        let scratch = self.scratch_dir();
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|source| SupervisorError::Io {
                path: scratch.clone(),
                source,
            })?;

        let options = serde_json::json!({
            "use_old_hires_fix_width_height": self.config.legacy_highres_fix,
        });
        if let Err(e) = self.api.set_options(&options).await {
            tracing::warn!(device, error = %e, "Failed to set initial options");
        }

        match self.api.current_model().await {
            Ok(model) => *lock(&self.loaded_model) = model,
            Err(e) => tracing::warn!(device, error = %e, "Failed to read loaded model"),
        }
        Ok(())
    }

    fn open_logs(&self) -> Result<(Stdio, Stdio), SupervisorError> {
        let dir = &self.config.log_dir;
        std::fs::create_dir_all(dir).map_err(|source| SupervisorError::Io {
            path: dir.clone(),
            source,
        })?;
        let open = |path: PathBuf| {
            std::fs::File::create(&path)
                .map(Stdio::from)
                .map_err(|source| SupervisorError::Io { path, source })
        };
        Ok((
            open(self.config.log_path())?,
            open(self.config.error_log_path())?,
        ))
    }

    async fn send(&self, request: &RenderRequest) -> Result<Vec<String>, SdApiError> {
        match request {
            RenderRequest::Txt2Img(req) => Ok(self.api.txt2img(req).await?.images),
            RenderRequest::Img2Img(req) => Ok(self.api.img2img(req).await?.images),
            RenderRequest::ExtraSingleImage(req) => {
                Ok(vec![self.api.extra_single_image(req).await?.image])
            }
        }
    }

    async fn store_images(
        &self,
        kind: RequestKind,
        images: Vec<String>,
    ) -> Result<Vec<RenderedImage>, SupervisorError> {
        if images.is_empty() {
            return Err(SupervisorError::EmptyResponse);
        }
        let dir = self.scratch_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SupervisorError::Io {
                path: dir.clone(),
                source,
            })?;

        let mut out = Vec::with_capacity(images.len());
        for image in images {
            let data = strip_data_url(&image);
            let bytes = BASE64.decode(data)?;

            let infotext = match self.api.png_info(&png_data_url(data)).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(device = %self.config.device_id, error = %e, "PNG info request failed");
                    String::new()
                }
            };
            let seed = seed_from_infotext(&infotext);
            let path = unique_path(&dir, &scratch_stem(seed, kind), "png");
            write_file(&path, &bytes).await?;
            out.push(RenderedImage {
                path,
                infotext,
                seed,
            });
        }
        Ok(out)
    }
}

/// `seed_<seed>` for renders, `seed_<seed>_u` for upscales.
fn scratch_stem(seed: Option<i64>, kind: RequestKind) -> String {
    let seed = seed.unwrap_or(0);
    if kind.is_upscale() {
        format!("seed_{seed}_u")
    } else {
        format!("seed_{seed}")
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), SupervisorError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| SupervisorError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn launch_command(platform: Platform, script: &Path) -> Command {
    match platform {
        Platform::Windows => {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
            cmd
        }
        Platform::Unix => {
            let mut cmd = Command::new("bash");
            cmd.arg(script);
            cmd
        }
    }
}

/// A launched render process. The pid is kept from spawn time; [`Child::id`]
/// returns `None` once the group leader has been reaped.
struct RenderProcess {
    child: Child,
    pid: Option<u32>,
}

impl RenderProcess {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    /// Stop the render process and everything it spawned.
    async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let pgid = pid as libc::pid_t;
            // SAFETY: killpg only sends a signal; the child leads its own group.
            unsafe {
                libc::killpg(pgid, libc::SIGTERM);
            }
            let _ = tokio::time::timeout(grace, self.child.wait()).await;
            // SAFETY: as above; stragglers that ignored SIGTERM.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }

        #[cfg(windows)]
        if let Some(pid) = self.pid {
            let _ = Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .status()
                .await;
            let _ = grace;
        }

        let _ = self.child.kill().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::messages::GenerationRequest;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Backend stand-in: reports each request line, answers interrupts and
    /// never answers anything else.
    async fn stalling_backend() -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap();
                    let head = String::from_utf8_lossy(&buf[..n]);
                    let line = head.lines().next().unwrap_or_default().to_string();
                    let interrupt = line.contains("/sdapi/v1/interrupt");
                    let _ = tx.send(line);
                    if interrupt {
                        socket
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                                  content-length: 2\r\n\r\n{}",
                            )
                            .await
                            .unwrap();
                    } else {
                        std::future::pending::<()>().await;
                    }
                });
            }
        });
        (port, rx)
    }

    fn supervisor(root: &Path) -> RenderSupervisor {
        supervisor_on(root, 9)
    }

    fn supervisor_on(root: &Path, port: u16) -> RenderSupervisor {
        let mut config = SupervisorConfig::new("0", port, root.join("sd"));
        config.log_dir = root.join("logs");
        config.scratch_root = root.join("scratch");
        config.platform = Platform::Unix;
        RenderSupervisor::new(config, &CancellationToken::new())
    }

    // -- config -------------------------------------------------------------------

    #[test]
    fn per_device_paths() {
        let config = SupervisorConfig::new("1", 7862, "/opt/sd");
        assert_eq!(config.api_url(), "http://127.0.0.1:7862");
        assert_eq!(config.log_path(), PathBuf::from("logs/gpu-1-log.txt"));
        assert_eq!(config.error_log_path(), PathBuf::from("logs/gpu-1-errors.txt"));
        assert!(config.scratch_dir().ends_with("gpu-1"));
    }

    #[test]
    fn scratch_names() {
        assert_eq!(scratch_stem(Some(42), RequestKind::Txt2Img), "seed_42");
        assert_eq!(scratch_stem(Some(42), RequestKind::ExtraSingleImage), "seed_42_u");
        assert_eq!(scratch_stem(None, RequestKind::Img2Img), "seed_0");
    }

    // -- dispatch guard -------------------------------------------------------------

    #[tokio::test]
    async fn dispatch_before_ready_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let result = sup
            .dispatch(RenderRequest::Txt2Img(GenerationRequest::default()))
            .await;
        assert_matches!(
            result,
            Err(SupervisorError::NotReady(SupervisorState::Uninitialized))
        );
    }

    #[tokio::test]
    async fn second_request_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.set_state(SupervisorState::Ready);

        let guard = sup.begin_request().unwrap();
        assert!(sup.is_busy());
        assert_matches!(sup.begin_request(), Err(SupervisorError::Busy));
        assert_matches!(sup.load_model("x").await, Err(SupervisorError::Busy));

        drop(guard);
        assert!(!sup.is_busy());
        assert!(sup.begin_request().is_ok());
    }

    #[tokio::test]
    async fn failed_model_load_clears_pending() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.set_state(SupervisorState::Ready);

        // Nothing listens on port 9.
        assert!(sup.load_model("alpha").await.is_err());
        assert_eq!(sup.pending_model(), None);
        assert_eq!(sup.loaded_model(), None);
        assert!(!sup.is_busy());
    }

    // -- lifecycle ------------------------------------------------------------------

    #[tokio::test]
    async fn missing_install_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sd")).unwrap();
        let sup = supervisor(dir.path());

        assert_matches!(sup.initialize().await, Err(SupervisorError::Launch(_)));
        assert_eq!(sup.state(), SupervisorState::Failed);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn exited_launcher_takes_its_group_down() {
        let dir = tempfile::tempdir().unwrap();
        let sd = dir.path().join("sd");
        std::fs::create_dir_all(&sd).unwrap();
        std::fs::write(
            sd.join("webui-user.sh"),
            "#!/bin/bash\nsleep 30 &\necho $! > straggler.pid\nexit 3\n",
        )
        .unwrap();
        let mut sup = supervisor(dir.path());
        sup.config.readiness.poll_interval = Duration::from_millis(20);
        sup.config.kill_grace = Duration::from_millis(200);

        assert_matches!(sup.initialize().await, Err(SupervisorError::Exited(Some(3))));

        let pid = std::fs::read_to_string(sd.join("straggler.pid")).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let running = || match std::fs::read_to_string(&stat) {
            Ok(line) => !line.rsplit(')').next().unwrap_or_default().trim_start().starts_with('Z'),
            Err(_) => false,
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while running() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running(), "background child outlived the launcher");
    }

    #[tokio::test]
    async fn shutdown_removes_scratch_and_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        std::fs::create_dir_all(sup.scratch_dir()).unwrap();
        std::fs::write(sup.scratch_dir().join("seed_1.png"), b"x").unwrap();
        sup.set_state(SupervisorState::Ready);

        sup.shutdown().await;
        assert!(!sup.scratch_dir().exists());
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert_matches!(
            sup.dispatch(RenderRequest::Txt2Img(GenerationRequest::default()))
                .await,
            Err(SupervisorError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_running_request() {
        let dir = tempfile::tempdir().unwrap();
        let (port, mut seen) = stalling_backend().await;
        let sup = Arc::new(supervisor_on(dir.path(), port));
        sup.set_state(SupervisorState::Ready);

        let running = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move {
                sup.dispatch(RenderRequest::Txt2Img(GenerationRequest::default()))
                    .await
            }
        });
        let first = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.starts_with("POST /sdapi/v1/txt2img"), "{first}");
        assert!(sup.is_busy());

        sup.shutdown().await;
        let next = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(next.starts_with("POST /sdapi/v1/interrupt"), "{next}");
        assert_matches!(running.await.unwrap(), Err(SupervisorError::ShuttingDown));
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }
}
