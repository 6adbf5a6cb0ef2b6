//! Process shutdown: one cancellation token fans out to the hub, gateway
//! connections and HTTP listeners, then named background tasks are drained
//! against a single deadline. Tasks still running at the deadline are
//! aborted and reported.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drain deadline when none is configured.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Background task tracked for draining.
pub struct NamedTask {
    /// Label used in logs and the drain report.
    pub name: &'static str,
    /// The task.
    pub handle: JoinHandle<()>,
}

impl NamedTask {
    /// Track `handle` as `name`.
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }
}

/// Outcome of [`ShutdownCoordinator::drain`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that finished (or panicked) before the deadline.
    pub finished: usize,
    /// Tasks aborted at the deadline.
    pub aborted: Vec<&'static str>,
}

impl DrainReport {
    /// Whether every task finished on its own.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Owns the process-wide cancellation token and the drain deadline.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator with the default drain deadline.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Coordinator that waits at most `drain_timeout` for tasks.
    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Token every long-running component watches.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token, then wait for `tasks` until the deadline. Stragglers
    /// are aborted.
    pub async fn drain(&self, tasks: Vec<NamedTask>) -> DrainReport {
        self.token.cancel();
        let deadline = Instant::now() + self.drain_timeout;
        info!(
            task_count = tasks.len(),
            timeout_ms = u64::try_from(self.drain_timeout.as_millis()).unwrap_or(u64::MAX),
            "draining background tasks"
        );

        let mut report = DrainReport::default();
        for NamedTask { name, mut handle } in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = name, "task finished");
                    report.finished += 1;
                }
                Ok(Err(e)) => {
                    warn!(task = name, error = %e, "task ended abnormally");
                    report.finished += 1;
                }
                Err(_) => {
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }

        if !report.is_clean() {
            warn!(aborted = ?report.aborted, "drain deadline reached, tasks aborted");
        }
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                let _ = sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_cancels_and_collects_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let tasks = ["ingestor", "dispatcher"]
            .into_iter()
            .map(|name| {
                let token = coord.token();
                NamedTask::new(name, tokio::spawn(async move { token.cancelled().await }))
            })
            .collect();

        assert!(!coord.is_shutting_down());
        let report = coord.drain(tasks).await;
        assert!(coord.is_shutting_down());
        assert_eq!(report.finished, 2);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn stragglers_are_aborted_at_the_deadline() {
        let coord = ShutdownCoordinator::with_timeout(Duration::from_secs(2));
        let token = coord.token();
        let tasks = vec![
            NamedTask::new("server", tokio::spawn(async move { token.cancelled().await })),
            NamedTask::new(
                "presence",
                tokio::spawn(tokio::time::sleep(Duration::from_secs(300))),
            ),
        ];

        let report = coord.drain(tasks).await;
        assert_eq!(report.finished, 1);
        assert_eq!(report.aborted, vec!["presence"]);
    }

    #[tokio::test]
    async fn panicked_task_counts_as_finished() {
        let coord = ShutdownCoordinator::new();
        let report = coord
            .drain(vec![NamedTask::new("sweeper", tokio::spawn(async { panic!("boom") }))])
            .await;
        assert_eq!(report, DrainReport { finished: 1, aborted: Vec::new() });
    }
}
