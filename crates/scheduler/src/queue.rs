//! Single-consumer command queue for one page key.
//!
//! Every mutating interaction with a key's page goes through its queue. One
//! worker drains the queue in submission order and runs each command to
//! completion before taking the next, so page operations never interleave.

use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use page_broker::{PageBroker, PageHandle};
use pagepilot_core_types::{CommandId, PageKey, PilotError};

use crate::error::QueueError;
use crate::metrics;
use crate::model::{CommandHandle, CommandTimeline, QueueConfig};

enum Outcome {
    Completed,
    Failed(String),
}

/// Type-erased command body plus its completion slot.
trait Job: Send {
    fn run(self: Box<Self>, page: PageHandle, timeout: Option<Duration>) -> BoxFuture<'static, Outcome>;

    fn reject(self: Box<Self>, err: QueueError);
}

struct TypedJob<T, F> {
    op: F,
    completion: oneshot::Sender<Result<T, QueueError>>,
}

impl<T, E, F, Fut> Job for TypedJob<T, F>
where
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
    F: FnOnce(PageHandle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    fn run(self: Box<Self>, page: PageHandle, timeout: Option<Duration>) -> BoxFuture<'static, Outcome> {
        let TypedJob { op, completion } = *self;
        Box::pin(async move {
            let guarded = AssertUnwindSafe(op(page)).catch_unwind();
            let finished = match timeout {
                Some(limit) => tokio::time::timeout(limit, guarded)
                    .await
                    .map_err(|_| PilotError::new(format!("timed out after {limit:?}"))),
                None => Ok(guarded.await),
            };

            let delivered = match finished {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(err))) => Err(QueueError::failed(err)),
                Ok(Err(panic)) => Err(QueueError::failed(PilotError::new(format!(
                    "command panicked: {}",
                    panic_message(panic.as_ref())
                )))),
                Err(timed_out) => Err(QueueError::failed(timed_out)),
            };
            let outcome = match &delivered {
                Ok(_) => Outcome::Completed,
                Err(err) => Outcome::Failed(err.to_string()),
            };
            let _ = completion.send(delivered);
            outcome
        })
    }

    fn reject(self: Box<Self>, err: QueueError) {
        let _ = self.completion.send(Err(err));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Command {
    id: CommandId,
    name: String,
    timeline: CommandTimeline,
    job: Box<dyn Job>,
}

pub struct CommandQueue {
    key: PageKey,
    broker: Arc<PageBroker>,
    config: QueueConfig,
    sender: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl CommandQueue {
    pub fn new(key: PageKey, broker: Arc<PageBroker>, config: QueueConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            key,
            broker,
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn key(&self) -> &PageKey {
        &self.key
    }

    /// Commands queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Enqueues `op` against this key's page. The worker starts on the first
    /// submission; must be called inside a tokio runtime.
    pub fn submit<T, E, F, Fut>(
        &self,
        name: impl Into<String>,
        op: F,
    ) -> Result<CommandHandle<T>, QueueError>
    where
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce(PageHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = name.into();
        if self.is_closed() {
            metrics::record_rejected(&name);
            return Err(QueueError::QueueClosed);
        }

        let (completion, receiver) = oneshot::channel();
        let id = CommandId::new();
        let command = Command {
            id: id.clone(),
            name: name.clone(),
            timeline: CommandTimeline::default(),
            job: Box::new(TypedJob { op, completion }),
        };

        self.ensure_worker();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(command).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            metrics::record_rejected(&name);
            return Err(QueueError::QueueClosed);
        }
        metrics::record_enqueued(&name);
        debug!(target: "scheduler", key = %self.key, command = %name, id = %id, "command enqueued");
        Ok(CommandHandle { id, receiver })
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        let key = self.key.clone();
        let broker = Arc::clone(&self.broker);
        let timeout = self.config.command_timeout();
        let shutdown = self.shutdown.clone();
        let pending = Arc::clone(&self.pending);
        *worker = Some(tokio::spawn(worker_loop(
            key, broker, timeout, shutdown, pending, receiver,
        )));
        debug!(target: "scheduler", key = %self.key, "worker started");
    }

    /// Stops accepting commands. The running command finishes; commands
    /// still queued resolve with `QueueClosed`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(target: "scheduler", key = %self.key, "queue shut down");
    }
}

async fn worker_loop(
    key: PageKey,
    broker: Arc<PageBroker>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
    pending: Arc<AtomicUsize>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };
        run_command(&key, &broker, timeout, command).await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }

    receiver.close();
    while let Ok(command) = receiver.try_recv() {
        metrics::record_rejected(&command.name);
        command.job.reject(QueueError::QueueClosed);
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_command(
    key: &PageKey,
    broker: &PageBroker,
    timeout: Option<Duration>,
    command: Command,
) {
    let Command {
        id,
        name,
        mut timeline,
        job,
    } = command;
    timeline.mark_started();

    let page = match broker.get_page(key).await {
        Ok(page) => page,
        Err(err) => {
            warn!(target: "scheduler", key = %key, command = %name, id = %id, error = %err, "page unavailable");
            timeline.mark_finished();
            let (wait_ms, run_ms) = timeline.durations();
            metrics::record_finished(&name, false, wait_ms, run_ms);
            job.reject(QueueError::Broker(err));
            return;
        }
    };

    let outcome = job.run(page, timeout).await;
    timeline.mark_finished();
    let (wait_ms, run_ms) = timeline.durations();
    match outcome {
        Outcome::Completed => {
            metrics::record_finished(&name, true, wait_ms, run_ms);
            info!(
                target: "scheduler",
                key = %key,
                command = %name,
                id = %id,
                wait_ms,
                run_ms,
                "command completed"
            );
        }
        Outcome::Failed(error) => {
            metrics::record_finished(&name, false, wait_ms, run_ms);
            warn!(
                target: "scheduler",
                key = %key,
                command = %name,
                id = %id,
                wait_ms,
                run_ms,
                %error,
                "command failed"
            );
        }
    }
}
