use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use pagepilot_core_types::PageKey;

/// Interval between presence checks while waiting on a selector.
pub const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("selector not found: {0}")]
    SelectorNotFound(String),
    #[error("page operation timed out: {0}")]
    Timeout(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(String),
}

/// One browser tab. Borrowed by commands through a [`PageHandle`].
#[async_trait]
pub trait PageDriver: Send + Sync {
    fn key(&self) -> &PageKey;

    async fn goto(&self, url: &str) -> Result<(), PageError>;

    /// Current document URL; `None` before the first navigation.
    async fn url(&self) -> Result<Option<String>, PageError>;

    async fn cookie(&self, name: &str) -> Result<Option<String>, PageError>;

    /// Sets a secure cookie on `domain` with path `/`, replacing any previous value.
    async fn set_cookie(&self, name: &str, value: &str, domain: &str) -> Result<(), PageError>;

    /// Returns whether `selector` is present right now.
    async fn exists(&self, selector: &str) -> Result<bool, PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError>;

    async fn press_enter(&self, selector: &str) -> Result<(), PageError>;

    /// Shift+Enter: a line break inside the field rather than a submit.
    async fn press_newline(&self, selector: &str) -> Result<(), PageError>;

    async fn set_input_files(&self, selector: &str, files: &[PathBuf]) -> Result<(), PageError>;

    /// Number of elements matching `selector`.
    async fn count(&self, selector: &str) -> Result<usize, PageError>;

    /// Text content of the last element matching `selector`.
    async fn last_text(&self, selector: &str) -> Result<Option<String>, PageError>;

    async fn evaluate(&self, script: &str) -> Result<Value, PageError>;

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, PageError>;

    async fn screenshot_element(&self, selector: &str, path: &Path) -> Result<(), PageError>;

    /// Exposes `window.<name>(payload)` to page scripts; payloads arrive on
    /// the returned channel as raw strings.
    async fn expose_callback(&self, name: &str)
        -> Result<mpsc::UnboundedReceiver<String>, PageError>;

    /// Waits up to `timeout` for `selector` to appear. Expiry is `Ok(false)`.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, PageError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exists(selector).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(SELECTOR_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

pub type PageHandle = Arc<dyn PageDriver>;

/// The shared browser context that owns every tab.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self, key: &PageKey) -> Result<PageHandle, PageError>;

    async fn close(&self) -> Result<(), PageError>;
}
