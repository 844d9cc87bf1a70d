use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

use pagepilot_core_types::{PageKey, PilotError};

use crate::chromium::ChromiumContext;
use crate::config::BrowserSettings;
use crate::driver::{BrowserContext, PageError, PageHandle};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("browser context unavailable: {0}")]
    Unavailable(String),
    #[error("page creation failed: {0}")]
    Page(#[from] PageError),
}

impl From<BrokerError> for PilotError {
    fn from(value: BrokerError) -> Self {
        PilotError::new(value.to_string())
    }
}

/// Lifecycle of the shared browser context.
#[derive(Clone)]
pub enum ContextState {
    Starting,
    Ready(Arc<dyn BrowserContext>),
    /// Fatal: the context never came up. Every caller sees `Unavailable`.
    Failed(String),
    Closed,
}

impl ContextState {
    fn label(&self) -> &'static str {
        match self {
            ContextState::Starting => "starting",
            ContextState::Ready(_) => "ready",
            ContextState::Failed(_) => "failed",
            ContextState::Closed => "closed",
        }
    }
}

/// Owns the browser context and at most one page per key.
pub struct PageBroker {
    state: watch::Sender<ContextState>,
    pages: DashMap<PageKey, Arc<OnceCell<PageHandle>>>,
    startup_timeout: Duration,
    created: AtomicUsize,
}

impl PageBroker {
    pub fn new(startup_timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ContextState::Starting);
        Arc::new(Self {
            state,
            pages: DashMap::new(),
            startup_timeout,
            created: AtomicUsize::new(0),
        })
    }

    /// Creates a broker and launches Chromium in the background. Pages
    /// requested before the launch finishes wait for it.
    pub fn launch(settings: BrowserSettings) -> Arc<Self> {
        let broker = Self::new(settings.startup_timeout());
        let pending = Arc::clone(&broker);
        tokio::spawn(async move {
            match ChromiumContext::launch(&settings).await {
                Ok(context) => pending.attach(Arc::new(context)),
                Err(err) => pending.fail(err.to_string()),
            }
        });
        broker
    }

    pub fn attach(&self, context: Arc<dyn BrowserContext>) {
        info!(target: "page-broker", "browser context ready");
        self.state.send_replace(ContextState::Ready(context));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(target: "page-broker", %reason, "browser context failed to initialize");
        self.state.send_replace(ContextState::Failed(reason));
    }

    pub fn state_label(&self) -> &'static str {
        self.state.borrow().label()
    }

    /// Number of tabs created over the broker's lifetime.
    pub fn pages_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn pages(&self) -> Vec<PageKey> {
        let mut keys: Vec<PageKey> = self
            .pages
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Returns the page for `key`, creating its tab on first use.
    ///
    /// Concurrent first calls for one key create a single tab and all receive
    /// the same handle. A failed creation is not cached.
    pub async fn get_page(&self, key: &PageKey) -> Result<PageHandle, BrokerError> {
        if let Some(page) = self.cached(key) {
            return Ok(page);
        }

        let context = self.ready_context().await?;
        let cell = self
            .pages
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let page = cell
            .get_or_try_init(|| async {
                info!(target: "page-broker", key = %key, "creating page");
                let page = context.new_page(key).await?;
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BrokerError>(page)
            })
            .await
            .map_err(|err| {
                warn!(target: "page-broker", key = %key, error = %err, "page creation failed");
                err
            })?;
        Ok(Arc::clone(page))
    }

    fn cached(&self, key: &PageKey) -> Option<PageHandle> {
        let entry = self.pages.get(key)?;
        entry.value().get().cloned()
    }

    async fn ready_context(&self) -> Result<Arc<dyn BrowserContext>, BrokerError> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ContextState::Ready(context) => return Ok(context),
                    ContextState::Failed(reason) => return Err(BrokerError::Unavailable(reason)),
                    ContextState::Closed => {
                        return Err(BrokerError::Unavailable("browser context closed".into()))
                    }
                    ContextState::Starting => {
                        debug!(target: "page-broker", "waiting for browser context");
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(BrokerError::Unavailable("broker dropped".into()));
                }
            }
        };

        match tokio::time::timeout(self.startup_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Unavailable(format!(
                "browser context not ready after {:?}",
                self.startup_timeout
            ))),
        }
    }

    /// Resolves with the failure reason once the context is marked failed.
    /// Returns `None` if the broker closes first.
    pub async fn wait_fatal(&self) -> Option<String> {
        let mut rx = self.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ContextState::Failed(reason) => return Some(reason),
                ContextState::Closed => return None,
                ContextState::Starting | ContextState::Ready(_) => {}
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Closes the browser context. Later `get_page` calls fail fast.
    pub async fn shutdown(&self) {
        let previous = self.state.send_replace(ContextState::Closed);
        self.pages.clear();
        if let ContextState::Ready(context) = previous {
            if let Err(err) = context.close().await {
                warn!(target: "page-broker", error = %err, "browser close failed");
            }
        }
        info!(target: "page-broker", "broker shut down");
    }
}
