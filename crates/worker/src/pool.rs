//! [`RenderPool`] over real render processes, one supervisor per GPU.

use std::sync::Arc;

use dreamfactory_core::capabilities::Capabilities;
use dreamfactory_core::job::JobSpec;
use dreamfactory_sdapi::readiness::ReadinessConfig;
use dreamfactory_sdapi::supervisor::{RenderSupervisor, SupervisorConfig, SupervisorError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::executor::{self, ExecutionContext, JobReport};
use crate::scheduler::RenderPool;

/// Directory under the output root holding per-device scratch folders.
const SCRATCH_DIR: &str = ".scratch";

pub struct SupervisorPool {
    devices: Vec<Arc<RenderSupervisor>>,
    cancel: CancellationToken,
}

impl SupervisorPool {
    /// One supervisor per configured device; ports count up from
    /// `START_PORT` in device order.
    pub fn from_config(config: &WorkerConfig) -> Self {
        let cancel = CancellationToken::new();
        let devices = config
            .devices
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let mut sc = SupervisorConfig::new(
                    id.clone(),
                    config.port_for(index),
                    config.sd_location.clone(),
                );
                sc.log_dir = config.log_location.clone();
                sc.scratch_root = config.output_location.join(SCRATCH_DIR);
                sc.readiness = ReadinessConfig {
                    poll_interval: config.readiness_poll_interval,
                    timeout: config.startup_timeout,
                };
                Arc::new(RenderSupervisor::new(sc, &cancel))
            })
            .collect();
        Self { devices, cancel }
    }

    pub fn devices(&self) -> &[Arc<RenderSupervisor>] {
        &self.devices
    }

    fn device(&self, slot: usize) -> Result<&Arc<RenderSupervisor>, SupervisorError> {
        self.devices.get(slot).ok_or(SupervisorError::ShuttingDown)
    }
}

impl RenderPool for SupervisorPool {
    fn device_ids(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| d.device_id().to_string())
            .collect()
    }

    async fn start(&self, slot: usize) -> Result<(), SupervisorError> {
        self.device(slot)?.initialize().await
    }

    async fn discover(&self, slot: usize) -> Result<Capabilities, SupervisorError> {
        self.device(slot)?.discover_capabilities().await
    }

    async fn execute(&self, slot: usize, job: JobSpec, ctx: Arc<ExecutionContext>) -> JobReport {
        let device = match self.device(slot) {
            Ok(device) => Arc::clone(device),
            Err(e) => {
                return JobReport {
                    device: slot.to_string(),
                    sequence: job.sequence,
                    origin: job.origin,
                    success: false,
                    elapsed: Default::default(),
                    outputs: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };
        let mut rng = StdRng::from_rng(&mut rand::rng());
        executor::execute(device.as_ref(), job, &ctx, &mut rng).await
    }

    async fn shutdown(&self) {
        // Supervisors read their busy flag before cancelling; the shared
        // token goes last.
        futures::future::join_all(self.devices.iter().map(|d| d.shutdown())).await;
        self.cancel.cancel();
    }
}
