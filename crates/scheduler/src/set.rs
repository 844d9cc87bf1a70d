use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use page_broker::{PageBroker, PageHandle};
use pagepilot_core_types::PageKey;

use crate::error::QueueError;
use crate::model::{CommandHandle, QueueConfig};
use crate::queue::CommandQueue;

/// One [`CommandQueue`] per page key. Keys never wait on each other.
pub struct QueueSet {
    broker: Arc<PageBroker>,
    config: QueueConfig,
    queues: DashMap<PageKey, Arc<CommandQueue>>,
    closed: AtomicBool,
}

impl QueueSet {
    pub fn new(broker: Arc<PageBroker>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            config,
            queues: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn broker(&self) -> Arc<PageBroker> {
        Arc::clone(&self.broker)
    }

    pub fn queue(&self, key: &PageKey) -> Arc<CommandQueue> {
        self.queues
            .entry(key.clone())
            .or_insert_with(|| {
                CommandQueue::new(key.clone(), Arc::clone(&self.broker), self.config.clone())
            })
            .clone()
    }

    pub fn submit<T, E, F, Fut>(
        &self,
        key: &PageKey,
        name: impl Into<String>,
        op: F,
    ) -> Result<CommandHandle<T>, QueueError>
    where
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
        F: FnOnce(PageHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::QueueClosed);
        }
        self.queue(key).submit(name, op)
    }

    pub fn pending(&self, key: &PageKey) -> usize {
        self.queues
            .get(key)
            .map(|queue| queue.pending())
            .unwrap_or(0)
    }

    pub async fn shutdown_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let queues: Vec<Arc<CommandQueue>> = self
            .queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for queue in queues {
            queue.shutdown().await;
        }
        info!(target: "scheduler", "all queues shut down");
    }
}
