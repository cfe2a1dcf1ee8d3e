//! `dreamfactory` -- batch image generation across local GPUs.
//!
//! Starts one render process per configured GPU, compiles the prompt
//! template and runs every job it yields, then shuts the processes down.
//!
//! # Environment variables
//!
//! | Variable                   | Default      | Description                              |
//! |----------------------------|--------------|------------------------------------------|
//! | `DREAMFACTORY_CONFIG`      | `config.txt` | Controller configuration file            |
//! | `DREAMFACTORY_PROMPT_FILE` | --           | Template to run; the first CLI argument wins |
//! | `RUST_LOG`                 | `dreamfactory=info,...` | Log filter                    |

use std::path::PathBuf;

use anyhow::Context;
use dreamfactory_worker::config::WorkerConfig;
use dreamfactory_worker::observe::{self, LogBuffer};
use dreamfactory_worker::pool::SupervisorPool;
use dreamfactory_worker::scheduler::{Scheduler, SchedulerError, SchedulerSettings};
use dreamfactory_worker::shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let loaded = WorkerConfig::from_env();
    let capacity = loaded
        .as_ref()
        .map(|(config, _)| config.log_buffer_size)
        .unwrap_or_else(|_| WorkerConfig::default().log_buffer_size);
    observe::init_tracing(LogBuffer::new(capacity)).context("failed to install logging")?;

    let (mut config, problems) = loaded.context("failed to load configuration")?;
    for problem in &problems {
        tracing::warn!("{problem}");
    }
    if let Some(arg) = std::env::args().nth(1) {
        config.prompt_file = Some(PathBuf::from(arg));
    }

    tracing::info!(
        devices = ?config.devices,
        start_port = config.start_port,
        sd_location = %config.sd_location.display(),
        "Starting dreamfactory",
    );
    match &config.prompt_file {
        Some(path) => tracing::info!(template = %path.display(), "Prompt file selected"),
        None => tracing::warn!("No prompt file given; only capability discovery will run"),
    }

    let pool = SupervisorPool::from_config(&config);
    let mut settings = SchedulerSettings::from(&config);
    settings.exit_when_idle = true;
    let (scheduler, handle) = Scheduler::new(pool, settings);
    tokio::spawn(shutdown::forward_signals(handle));

    match scheduler.run().await {
        Ok(summary) => {
            tracing::info!(
                jobs_done = summary.jobs_done,
                jobs_failed = summary.jobs_failed,
                loops = summary.loops,
                "Run complete",
            );
            Ok(())
        }
        Err(SchedulerError::NoDevices) => {
            tracing::error!(
                log_dir = %config.log_location.display(),
                "No render device started; check the per-device error logs",
            );
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
