use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use dreamfactory_core::capabilities::{Capabilities, ModelInfo};
use dreamfactory_core::job::{JobOrigin, JobSpec};
use dreamfactory_sdapi::supervisor::SupervisorError;
use dreamfactory_worker::config::WorkerConfig;
use dreamfactory_worker::executor::{ExecutionContext, JobReport};
use dreamfactory_worker::scheduler::{
    RenderPool, RunPhase, Scheduler, SchedulerError, SchedulerSettings,
};

/// Records every job it is asked to run instead of rendering.
#[derive(Clone, Default)]
struct FakePool {
    devices: usize,
    failing: bool,
    models: Vec<&'static str>,
    /// Jobs with this prompt panic inside `execute`.
    panic_on: Option<&'static str>,
    executed: Arc<Mutex<Vec<(usize, JobSpec)>>>,
}

impl FakePool {
    fn new(devices: usize) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    fn executed(&self) -> Vec<(usize, JobSpec)> {
        self.executed.lock().unwrap().clone()
    }
}

impl RenderPool for FakePool {
    fn device_ids(&self) -> Vec<String> {
        (0..self.devices).map(|i| i.to_string()).collect()
    }

    async fn start(&self, _slot: usize) -> Result<(), SupervisorError> {
        if self.failing {
            Err(SupervisorError::Exited(Some(1)))
        } else {
            Ok(())
        }
    }

    async fn discover(&self, _slot: usize) -> Result<Capabilities, SupervisorError> {
        Ok(Capabilities {
            samplers: vec!["Euler a".into()],
            models: self
                .models
                .iter()
                .map(|title| ModelInfo {
                    title: title.to_string(),
                    filename: None,
                })
                .collect(),
            ..Capabilities::default()
        })
    }

    async fn execute(&self, slot: usize, job: JobSpec, _ctx: Arc<ExecutionContext>) -> JobReport {
        self.executed.lock().unwrap().push((slot, job.clone()));
        if self.panic_on == Some(job.prompt.as_str()) {
            panic!("render crashed on {}", job.prompt);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        JobReport {
            device: slot.to_string(),
            sequence: job.sequence,
            origin: job.origin,
            success: true,
            elapsed: Duration::from_millis(5),
            outputs: Vec::new(),
            error: None,
        }
    }

    async fn shutdown(&self) {}
}

fn settings(dir: &Path, template: Option<PathBuf>) -> SchedulerSettings {
    let mut settings = SchedulerSettings::from(&WorkerConfig::default());
    settings.output_root = dir.join("output");
    settings.wildcard_dir = dir.join("wildcards");
    settings.trigger_file = dir.join("model-triggers.txt");
    settings.initial_template = template;
    settings.tick = Duration::from_millis(5);
    settings.exit_when_idle = true;
    settings
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn priority_upscale_runs_before_main_queue() {
    let dir = tempfile::tempdir().unwrap();
    let template = write(dir.path(), "cats.prompts", "[prompts 1]\na cat\na dog\nan owl\n");
    let image = write(dir.path(), "old.png", "png");

    let pool = FakePool::new(2);
    let (scheduler, handle) = Scheduler::new(pool.clone(), settings(dir.path(), Some(template)));
    handle.enqueue_upscale(&image).await.unwrap();

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.jobs_done, 4);

    let executed = pool.executed();
    assert_eq!(executed.len(), 4);
    let (slot, first) = &executed[0];
    assert_eq!(*slot, 0);
    assert_eq!(first.origin, JobOrigin::Upscale);
    assert_eq!(first.input_image.as_deref(), Some(image.as_path()));
    assert!(executed[1..].iter().all(|(_, job)| job.origin == JobOrigin::Template));
}

#[tokio::test]
async fn model_sweep_runs_each_model_once() {
    let dir = tempfile::tempdir().unwrap();
    let template = write(
        dir.path(),
        "sweep.prompts",
        "[config]\n!CKPT_FILE = all\n!SEED = 100\n!REPEAT = no\n\
         [prompts 1]\none\ntwo\nthree\nfour\nfive\n",
    );

    let mut pool = FakePool::new(1);
    pool.models = vec!["alpha.safetensors [a1]", "beta.safetensors [b2]"];
    let (scheduler, handle) = Scheduler::new(pool.clone(), settings(dir.path(), Some(template)));

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.jobs_done, 10);
    assert_eq!(handle.status().phase, RunPhase::Idle);

    let models: Vec<Option<String>> = pool
        .executed()
        .into_iter()
        .map(|(_, job)| job.ckpt_file)
        .collect();
    assert!(models[..5]
        .iter()
        .all(|m| m.as_deref() == Some("alpha.safetensors [a1]")));
    assert!(models[5..]
        .iter()
        .all(|m| m.as_deref() == Some("beta.safetensors [b2]")));

    // Both checkpoints render the same seed in one sweep round.
    assert!(pool.executed().iter().all(|(_, job)| job.seed == 100));

    // The trigger file is seeded from the discovered model list.
    let triggers = std::fs::read_to_string(dir.path().join("model-triggers.txt")).unwrap();
    assert!(triggers.contains("alpha.safetensors"));
}

#[tokio::test]
async fn chained_template_runs_after_the_first() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "second.prompts", "[prompts 1]\nthird\n");
    let first = write(
        dir.path(),
        "first.prompts",
        "[config]\n!NEXT_PROMPT_FILE = second.prompts\n[prompts 1]\nfirst\nsecond\n",
    );

    let pool = FakePool::new(1);
    let (scheduler, _handle) = Scheduler::new(pool.clone(), settings(dir.path(), Some(first)));
    scheduler.run().await.unwrap();

    let prompts: Vec<String> = pool.executed().into_iter().map(|(_, j)| j.prompt).collect();
    assert_eq!(prompts, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn no_template_finishes_after_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let pool = FakePool::new(1);
    let (scheduler, _handle) = Scheduler::new(pool.clone(), settings(dir.path(), None));

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.jobs_done, 0);
    assert!(pool.executed().is_empty());
}

#[tokio::test]
async fn all_devices_failing_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let template = write(dir.path(), "t.prompts", "[prompts 1]\na\n");
    let pool = FakePool {
        devices: 2,
        failing: true,
        ..FakePool::default()
    };
    let (scheduler, _handle) = Scheduler::new(pool.clone(), settings(dir.path(), Some(template)));

    assert_matches!(scheduler.run().await, Err(SchedulerError::NoDevices));
    assert!(pool.executed().is_empty());
}

#[tokio::test]
async fn shutdown_stops_a_repeating_run() {
    let dir = tempfile::tempdir().unwrap();
    let template = write(dir.path(), "loop.prompts", "[config]\n!REPEAT = yes\n[prompts 1]\na\n");
    let pool = FakePool::new(1);
    let (scheduler, handle) = Scheduler::new(pool.clone(), settings(dir.path(), Some(template)));

    let run = tokio::spawn(scheduler.run());
    let mut status = handle.subscribe();
    while status.borrow().jobs_done < 3 {
        status.changed().await.unwrap();
    }
    handle.shutdown().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert!(summary.jobs_done >= 3);
    assert!(summary.loops >= 2);
}

#[tokio::test]
async fn panicking_job_releases_its_device() {
    let dir = tempfile::tempdir().unwrap();
    let template = write(dir.path(), "t.prompts", "[prompts 1]\nboom\nfine\n");
    let pool = FakePool {
        devices: 1,
        panic_on: Some("boom"),
        ..FakePool::default()
    };
    let (scheduler, handle) = Scheduler::new(pool.clone(), settings(dir.path(), Some(template)));

    let summary = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("run should finish")
        .unwrap();
    assert_eq!(summary.jobs_failed, 1);
    assert_eq!(summary.jobs_done, 1);
    assert_eq!(pool.executed().len(), 2);

    let status = handle.status();
    assert_eq!(status.phase, RunPhase::Idle);
    assert_eq!(status.devices[0].current_job, None);
}
