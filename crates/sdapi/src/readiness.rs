//! Startup readiness polling for a freshly launched render process.
//!
//! The backend takes a while to load its first checkpoint. [`poll_until_ready`]
//! probes it on a fixed interval until it answers, the child process
//! exits, the startup timeout elapses, or the [`CancellationToken`] fires.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Tunable parameters for readiness polling.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Delay between probes.
    pub poll_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// How readiness polling ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The child exited first, with this exit code if it had one.
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// Poll `probe` until it reports ready.
///
/// `exited` is checked before every probe and returns `Some(code)` once
/// the child process has terminated.
pub async fn poll_until_ready<P, Fut, E>(
    mut probe: P,
    mut exited: E,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> Readiness
where
    P: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    E: FnMut() -> Option<Option<i32>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Readiness::Cancelled;
        }
        if let Some(code) = exited() {
            return Readiness::Exited(code);
        }

        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return Readiness::Cancelled,
            ready = probe() => {
                if ready {
                    tracing::debug!(attempt, "Render backend answered readiness probe");
                    return Readiness::Ready;
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Readiness::TimedOut;
        }
        let wait = config.poll_interval.min(deadline - now);

        tokio::select! {
            _ = cancel.cancelled() => return Readiness::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
