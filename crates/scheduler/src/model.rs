use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use pagepilot_core_types::CommandId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::QueueError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on one command's run time; `None` lets commands run until
    /// their own page waits expire.
    pub command_timeout_ms: Option<u64>,
}

impl QueueConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

/// Resolves to the command's return value or its failure.
pub struct CommandHandle<T> {
    pub id: CommandId,
    pub(crate) receiver: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> Future for CommandHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(QueueError::Dropped)))
    }
}

#[derive(Clone, Debug)]
pub struct CommandTimeline {
    pub enqueued_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl Default for CommandTimeline {
    fn default() -> Self {
        Self {
            enqueued_at: Instant::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

impl CommandTimeline {
    pub fn mark_started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn mark_finished(&mut self) {
        self.finished_at = Some(Instant::now());
    }

    /// `(queue wait, run time)` in milliseconds.
    pub fn durations(&self) -> (u64, u64) {
        let wait_ms = self
            .started_at
            .map(|start| start.duration_since(self.enqueued_at).as_millis() as u64)
            .unwrap_or(0);
        let run_ms = match (self.started_at, self.finished_at) {
            (Some(start), Some(finish)) => finish.duration_since(start).as_millis() as u64,
            _ => 0,
        };
        (wait_ms, run_ms)
    }
}
