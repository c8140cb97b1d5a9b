//! Task Waiter: polls a set of tasks until every one is terminal.

use crate::metrics::Metrics;
use crate::platform::{Platform, PlatformError, TaskHandle, TaskState, TaskStatus};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// Upper bound on the whole wait. `None` waits indefinitely.
    pub max_wait: Option<Duration>,
    /// Count CANCELLED as done instead of as an error.
    pub accept_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WaitSummary {
    pub completed: usize,
    pub cancelled: usize,
    /// Status sweeps performed.
    pub sweeps: usize,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("The following tasks failed: {}", .descriptions.join(", "))]
    TasksFailed { descriptions: Vec<String> },

    #[error("The following tasks were cancelled: {}", .descriptions.join(", "))]
    TasksCancelled { descriptions: Vec<String> },

    #[error("gave up after {waited:?} with {pending} task(s) still running")]
    TimedOut { waited: Duration, pending: usize },

    #[error("wait aborted with {pending} task(s) still running")]
    Aborted { pending: usize },

    #[error("failed to poll task status: {0}")]
    Platform(#[from] PlatformError),
}

/// Blocks until every task is COMPLETED, FAILED or CANCELLED.
///
/// Statuses are polled one task after the other, then the waiter sleeps for
/// `poll_interval` before the next sweep. The sleep ends early on
/// cancellation or when `max_wait` runs out.
pub async fn wait_for_tasks<P: Platform>(
    platform: &P,
    tasks: &[TaskHandle],
    options: &WaitOptions,
    cancel: &CancellationToken,
    metrics: &Metrics,
) -> Result<WaitSummary, WaitError> {
    let started = Instant::now();
    let deadline = options.max_wait.map(|d| started + d);
    let mut sweeps = 0;

    let statuses = loop {
        let mut statuses = Vec::with_capacity(tasks.len());
        for task in tasks {
            metrics.task_polls_total.inc();
            statuses.push(platform.task_status(task).await?);
        }
        sweeps += 1;

        let pending = statuses.iter().filter(|s| !s.state.is_terminal()).count();
        if pending == 0 {
            break statuses;
        }
        tracing::debug!(pending, total = tasks.len(), sweeps, "Tasks still running");

        let mut wake = Instant::now() + options.poll_interval;
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(WaitError::TimedOut {
                    waited: started.elapsed(),
                    pending,
                });
            }
            wake = wake.min(deadline);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Aborted { pending }),
            _ = sleep_until(wake) => {}
        }
    };

    classify(statuses, options.accept_cancelled, sweeps, metrics)
}

fn classify(
    statuses: Vec<TaskStatus>,
    accept_cancelled: bool,
    sweeps: usize,
    metrics: &Metrics,
) -> Result<WaitSummary, WaitError> {
    let mut summary = WaitSummary {
        sweeps,
        ..Default::default()
    };
    let mut failed = Vec::new();
    let mut cancelled = Vec::new();

    for status in statuses {
        match status.state {
            TaskState::Completed => summary.completed += 1,
            TaskState::Failed => {
                tracing::error!(
                    description = %status.description,
                    error = status.error.as_deref().unwrap_or(""),
                    "Task failed"
                );
                failed.push(status.description);
            }
            TaskState::Cancelled => {
                tracing::warn!(description = %status.description, "Task was cancelled");
                summary.cancelled += 1;
                cancelled.push(status.description);
            }
            _ => {}
        }
    }

    if !failed.is_empty() {
        metrics.tasks_failed_total.inc_by(failed.len() as u64);
        return Err(WaitError::TasksFailed {
            descriptions: failed,
        });
    }
    if !cancelled.is_empty() && !accept_cancelled {
        return Err(WaitError::TasksCancelled {
            descriptions: cancelled,
        });
    }
    Ok(summary)
}
