//! Chromium-backed context driven through chromiumoxide.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pagepilot_core_types::PageKey;

use crate::config::BrowserSettings;
use crate::driver::{BrowserContext, PageDriver, PageError, PageHandle};

impl From<CdpError> for PageError {
    fn from(value: CdpError) -> Self {
        match value {
            CdpError::Timeout => PageError::Timeout("cdp request".into()),
            other => PageError::Protocol(other.to_string()),
        }
    }
}

pub struct ChromiumContext {
    browser: Mutex<Option<Browser>>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl ChromiumContext {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self, PageError> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(&settings.profile_dir)
            .window_size(settings.window_width, settings.window_height);
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = settings.resolve_executable() {
            builder = builder.chrome_executable(executable);
        }
        let config = builder.build().map_err(PageError::Protocol)?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    warn!(target: "page-broker", error = %err, "browser handler stopped");
                    break;
                }
            }
        });
        info!(
            target: "page-broker",
            headless = settings.headless,
            profile = %settings.profile_dir.display(),
            "chromium launched"
        );

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            handler: Mutex::new(Some(handler_task)),
        })
    }
}

#[async_trait]
impl BrowserContext for ChromiumContext {
    async fn new_page(&self, key: &PageKey) -> Result<PageHandle, PageError> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| PageError::Protocol("browser closed".into()))?;
        let page = browser.new_page("about:blank").await?;
        Ok(Arc::new(ChromiumPage {
            key: key.clone(),
            page,
        }))
    }

    async fn close(&self) -> Result<(), PageError> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            browser.close().await?;
            let _ = browser.wait().await;
        }
        if let Some(handle) = self.handler.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

pub struct ChromiumPage {
    key: PageKey,
    page: Page,
}

/// `Input.dispatchKeyEvent` modifier bit for Shift.
const SHIFT_MODIFIER: i64 = 8;

fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

impl ChromiumPage {
    async fn element(&self, selector: &str) -> Result<chromiumoxide::Element, PageError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| PageError::SelectorNotFound(selector.to_string()))
    }

    async fn shift_enter(&self, key_down: bool) -> Result<(), PageError> {
        let kind = if key_down {
            DispatchKeyEventType::KeyDown
        } else {
            DispatchKeyEventType::KeyUp
        };
        let mut builder = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .native_virtual_key_code(13)
            .modifiers(SHIFT_MODIFIER);
        if key_down {
            builder = builder.text("\r");
        }
        let params = builder.build().map_err(PageError::Protocol)?;
        self.page.execute(params).await?;
        Ok(())
    }
}

#[async_trait]
impl PageDriver for ChromiumPage {
    fn key(&self) -> &PageKey {
        &self.key
    }

    async fn goto(&self, url: &str) -> Result<(), PageError> {
        debug!(target: "page-broker", key = %self.key, url, "navigate");
        self.page.goto(url).await?;
        Ok(())
    }

    async fn url(&self) -> Result<Option<String>, PageError> {
        Ok(self.page.url().await?)
    }

    async fn cookie(&self, name: &str) -> Result<Option<String>, PageError> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .find(|cookie| cookie.name == name)
            .map(|cookie| cookie.value))
    }

    async fn set_cookie(&self, name: &str, value: &str, domain: &str) -> Result<(), PageError> {
        let cookie = CookieParam::builder()
            .name(name)
            .value(value)
            .domain(domain)
            .path("/")
            .secure(true)
            .build()
            .map_err(PageError::Protocol)?;
        self.page.set_cookie(cookie).await?;
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, PageError> {
        let script = format!("document.querySelector({}) !== null", js_string(selector));
        Ok(self.evaluate(&script).await?.as_bool().unwrap_or(false))
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        let element = self.element(selector).await?;
        element.click().await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), PageError> {
        // Focus keeps the caret where earlier lines left it.
        let element = self.element(selector).await?;
        element.focus().await?.type_str(text).await?;
        Ok(())
    }

    async fn press_enter(&self, selector: &str) -> Result<(), PageError> {
        let element = self.element(selector).await?;
        element.press_key("Enter").await?;
        Ok(())
    }

    async fn press_newline(&self, selector: &str) -> Result<(), PageError> {
        self.element(selector).await?.focus().await?;
        self.shift_enter(true).await?;
        self.shift_enter(false).await
    }

    async fn set_input_files(&self, selector: &str, files: &[PathBuf]) -> Result<(), PageError> {
        let element = self.element(selector).await?;
        let files: Vec<String> = files.iter().map(|file| file.display().to_string()).collect();
        let params = SetFileInputFilesParams::builder()
            .files(files)
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(PageError::Protocol)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn count(&self, selector: &str) -> Result<usize, PageError> {
        let script = format!("document.querySelectorAll({}).length", js_string(selector));
        let count = self.evaluate(&script).await?.as_u64().unwrap_or(0);
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    async fn last_text(&self, selector: &str) -> Result<Option<String>, PageError> {
        let script = format!(
            "(() => {{ const all = document.querySelectorAll({}); return all.length ? all[all.length - 1].textContent : null; }})()",
            js_string(selector)
        );
        Ok(self
            .evaluate(&script)
            .await?
            .as_str()
            .map(|value| value.to_string()))
    }

    async fn evaluate(&self, script: &str) -> Result<Value, PageError> {
        let result = self.page.evaluate(script).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, PageError> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.getAttribute({}) : null; }})()",
            js_string(selector),
            js_string(name)
        );
        Ok(self
            .evaluate(&script)
            .await?
            .as_str()
            .map(|value| value.to_string()))
    }

    async fn screenshot_element(&self, selector: &str, path: &Path) -> Result<(), PageError> {
        let element = self.element(selector).await?;
        let bytes = element.screenshot(CaptureScreenshotFormat::Png).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| PageError::Io(err.to_string()))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .map_err(|err| PageError::Io(err.to_string()))
    }

    async fn expose_callback(
        &self,
        name: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, PageError> {
        let mut events = self.page.event_listener::<EventBindingCalled>().await?;
        self.page.execute(AddBindingParams::new(name)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let binding = name.to_string();
        let key = self.key.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.name != binding {
                    continue;
                }
                if tx.send(event.payload.clone()).is_err() {
                    break;
                }
            }
            debug!(target: "page-broker", key = %key, binding, "binding stream closed");
        });
        Ok(rx)
    }
}
