//! In-memory browser context for tests and dry runs.
//!
//! Pages record every action, answer selector probes from a settable set and
//! let tests push payloads through exposed callbacks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;

use pagepilot_core_types::PageKey;

use crate::driver::{BrowserContext, PageDriver, PageError, PageHandle};

#[derive(Default)]
pub struct MemoryContext {
    pages: DashMap<PageKey, Arc<MemoryPage>>,
    created: AtomicUsize,
    creation_delay: Mutex<Duration>,
    fail_next_creation: AtomicBool,
    closed: AtomicBool,
}

impl MemoryContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_creation_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.creation_delay.lock() = delay;
        self
    }

    pub fn fail_next_creation(&self) {
        self.fail_next_creation.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn page(&self, key: &PageKey) -> Option<Arc<MemoryPage>> {
        self.pages.get(key).map(|entry| Arc::clone(entry.value()))
    }
}

#[async_trait]
impl BrowserContext for MemoryContext {
    async fn new_page(&self, key: &PageKey) -> Result<PageHandle, PageError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let delay = *self.creation_delay.lock();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.fail_next_creation.swap(false, Ordering::SeqCst) {
            return Err(PageError::Protocol("target crashed".into()));
        }
        let page = Arc::new(MemoryPage::new(key.clone()));
        self.pages.insert(key.clone(), Arc::clone(&page));
        Ok(page)
    }

    async fn close(&self) -> Result<(), PageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryPage {
    key: PageKey,
    present: Mutex<HashSet<String>>,
    attributes: Mutex<HashMap<(String, String), String>>,
    counts: Mutex<HashMap<String, usize>>,
    texts: Mutex<HashMap<String, String>>,
    url: Mutex<Option<String>>,
    cookies: Mutex<HashMap<String, String>>,
    actions: Mutex<Vec<String>>,
    callbacks: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    evaluate_result: Mutex<Value>,
    action_delay: Mutex<Duration>,
}

impl MemoryPage {
    pub fn new(key: PageKey) -> Self {
        Self {
            key,
            present: Mutex::new(HashSet::new()),
            attributes: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            texts: Mutex::new(HashMap::new()),
            url: Mutex::new(None),
            cookies: Mutex::new(HashMap::new()),
            actions: Mutex::new(Vec::new()),
            callbacks: Mutex::new(HashMap::new()),
            evaluate_result: Mutex::new(Value::Null),
            action_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn show(&self, selector: &str) {
        self.present.lock().insert(selector.to_string());
    }

    pub fn hide(&self, selector: &str) {
        self.present.lock().remove(selector);
    }

    pub fn set_attribute(&self, selector: &str, name: &str, value: &str) {
        self.attributes
            .lock()
            .insert((selector.to_string(), name.to_string()), value.to_string());
    }

    /// Overrides how many elements match `selector` (otherwise 1 if shown).
    pub fn set_count(&self, selector: &str, count: usize) {
        self.counts.lock().insert(selector.to_string(), count);
    }

    pub fn set_text(&self, selector: &str, text: &str) {
        self.texts.lock().insert(selector.to_string(), text.to_string());
    }

    pub fn cookie_value(&self, name: &str) -> Option<String> {
        self.cookies.lock().get(name).cloned()
    }

    pub fn set_evaluate_result(&self, value: Value) {
        *self.evaluate_result.lock() = value;
    }

    pub fn set_action_delay(&self, delay: Duration) {
        *self.action_delay.lock() = delay;
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    /// Delivers `payload` as if page script had called `window.<name>(payload)`.
    pub fn emit(&self, name: &str, payload: &str) -> bool {
        self.callbacks
            .lock()
            .get(name)
            .map(|tx| tx.send(payload.to_string()).is_ok())
            .unwrap_or(false)
    }

    async fn record(&self, action: String) {
        let delay = *self.action_delay.lock();
        self.actions.lock().push(action);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl PageDriver for MemoryPage {
    fn key(&self) -> &PageKey {
        &self.key
    }

    async fn goto(&self, url: &str) -> Result<(), PageError> {
        *self.url.lock() = Some(url.to_string());
        self.record(format!("goto {url}")).await;
        Ok(())
    }

    async fn url(&self) -> Result<Option<String>, PageError> {
        Ok(self.url.lock().clone())
    }

    async fn cookie(&self, name: &str) -> Result<Option<String>, PageError> {
        Ok(self.cookie_value(name))
    }

    async fn set_cookie(&self, name: &str, value: &str, _domain: &str) -> Result<(), PageError> {
        self.cookies.lock().insert(name.to_string(), value.to_string());
        self.record(format!("cookie {name}={value}")).await;
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, PageError> {
        Ok(self.present.lock().contains(selector))
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        if !self.present.lock().contains(selector) {
            return Err(PageError::SelectorNotFound(selector.to_string()));
        }
        self.record(format!("click {selector}")).await;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError> {
        if !self.present.lock().contains(selector) {
            return Err(PageError::SelectorNotFound(selector.to_string()));
        }
        self.record(format!("type {selector} {text}")).await;
        Ok(())
    }

    async fn press_enter(&self, selector: &str) -> Result<(), PageError> {
        self.record(format!("enter {selector}")).await;
        Ok(())
    }

    async fn press_newline(&self, selector: &str) -> Result<(), PageError> {
        self.record(format!("newline {selector}")).await;
        Ok(())
    }

    async fn set_input_files(&self, selector: &str, files: &[PathBuf]) -> Result<(), PageError> {
        if !self.present.lock().contains(selector) {
            return Err(PageError::SelectorNotFound(selector.to_string()));
        }
        let names: Vec<String> = files.iter().map(|file| file.display().to_string()).collect();
        self.record(format!("files {selector} {}", names.join(","))).await;
        Ok(())
    }

    async fn count(&self, selector: &str) -> Result<usize, PageError> {
        if let Some(count) = self.counts.lock().get(selector) {
            return Ok(*count);
        }
        Ok(usize::from(self.present.lock().contains(selector)))
    }

    async fn last_text(&self, selector: &str) -> Result<Option<String>, PageError> {
        Ok(self.texts.lock().get(selector).cloned())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, PageError> {
        self.record(format!("evaluate {}", script.len())).await;
        Ok(self.evaluate_result.lock().clone())
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, PageError> {
        Ok(self
            .attributes
            .lock()
            .get(&(selector.to_string(), name.to_string()))
            .cloned())
    }

    async fn screenshot_element(&self, selector: &str, path: &Path) -> Result<(), PageError> {
        if !self.present.lock().contains(selector) {
            return Err(PageError::SelectorNotFound(selector.to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| PageError::Io(err.to_string()))?;
        }
        tokio::fs::write(path, b"png")
            .await
            .map_err(|err| PageError::Io(err.to_string()))?;
        self.record(format!("screenshot {selector}")).await;
        Ok(())
    }

    async fn expose_callback(
        &self,
        name: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, PageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.callbacks.lock().insert(name.to_string(), tx);
        self.record(format!("expose {name}")).await;
        Ok(rx)
    }
}
