//! WhatsApp Web: QR-code login, chat-list observer and the chat commands
//! (open a chat, send text or media, wait for a reply, log out).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use message_cache::MessageDedupCache;
use page_broker::driver::SELECTOR_POLL_INTERVAL;
use page_broker::{PageError, PageHandle};
use pagepilot_core_types::{EventKind, LoginStatus, ObservedMessage, PageKey, PilotEvent};
use pagepilot_event_bus::{listener_fn, EventBus, SubscriptionId};
use pagepilot_scheduler::{CommandHandle, QueueError, QueueSet};
use pagepilot_session::{Confirmation, LoginRequest, LoginSite, Session};

use super::{Automation, AutomationDeps};
use crate::config::WhatsAppConfig;
use crate::entities::{
    Entity, LastMessageSensor, LoginButton, LoginStatusSensor, LogoutButton, Notify, QrImage,
};

pub const KEY: &str = "whatsapp";

const LANG_COOKIE: &str = "wa_web_lang_pref";
const LANGUAGE: &str = "en_US";
const COOKIE_DOMAIN: &str = ".web.whatsapp.com";

const CHAT_PANE: &str = "#pane-side";
const QR_CODE: &str = "div[data-ref]";
const QR_MARKER_ATTRIBUTE: &str = "data-ref";
const SEARCH_BOX: &str = "div[contenteditable='true'][data-tab='3']";
const MESSAGE_BOX: &str = "footer div[contenteditable='true']";
const ATTACH_BUTTON: &str = "div[title='Attach']";
const MEDIA_INPUT: &str = "input[type='file'][accept*='image']";
const DOCUMENT_INPUT: &str = "input[type='file'][accept='*']";
const CAPTION_BOX: &str = "div[contenteditable='true'][aria-label='Add a caption']";
const SEND_MEDIA_BUTTON: &str = "div[role='button'][aria-label='Send']";
const SETTINGS_BUTTON: &str = "div[role='button'][aria-label='Settings']";
const LOGOUT_ENTRY: &str = "div[role='button'][aria-label='Log out']";
const CONFIRM_LOGOUT: &str = "div[role='dialog'] button:last-of-type";
const CONVERSATION_ROWS: &str = "div[role='application'] div[role='row']";
const LAST_ROW_TEXT: &str = "div[role='application'] div[role='row']:last-child span.selectable-text";

const CHAT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const PHONE_CHAT_TIMEOUT: Duration = Duration::from_secs(60);

pub const OBSERVER_CALLBACK: &str = "pagepilotObserved";

/// Watches the chat list and reports the visible head of every changed row
/// through `window.pagepilotObserved(json)`. The rows present when the
/// observer attaches are reported once as `{ snapshot: [...] }`.
const OBSERVER_SCRIPT: &str = r#"
(() => {
  const pane = document.querySelector('#pane-side');
  if (!pane) { return false; }
  if (window.__pagepilotObserver) {
    if (window.__pagepilotPane === pane && pane.isConnected) { return true; }
    window.__pagepilotObserver.disconnect();
  }
  const text = (node) => (node ? (node.getAttribute('title') || node.textContent || '').trim() : '');
  const read = (row) => {
    const sender = text(row.querySelector('span[title]'));
    if (!sender) { return null; }
    const unread = row.querySelector('span[aria-label*="unread"]');
    const count = unread ? parseInt(unread.textContent, 10) || 1 : 0;
    return {
      sender,
      isSelf: !!row.querySelector('[data-icon="status-dblcheck"], [data-icon="status-check"]'),
      time: text(row.querySelector('div[role="gridcell"] + div, ._ak8i')),
      body: text(row.querySelector('span[dir="ltr"], span[dir="auto"]:not([title])')),
      hasUnread: count > 0,
      unreadCount: count,
    };
  };
  const report = (rows, snapshot) => {
    const records = rows.map(read).filter(Boolean);
    if (!records.length) { return; }
    window.pagepilotObserved(JSON.stringify(snapshot ? { snapshot: records } : records));
  };
  window.__pagepilotPane = pane;
  window.__pagepilotObserver = new MutationObserver((mutations) => {
    const rows = new Set();
    for (const mutation of mutations) {
      const target = mutation.target.nodeType === 1 ? mutation.target : mutation.target.parentElement;
      const row = target && target.closest('[role="listitem"]');
      if (row) { rows.add(row); }
    }
    report([...rows], false);
  });
  window.__pagepilotObserver.observe(pane, { subtree: true, childList: true, characterData: true });
  report([...pane.querySelectorAll('[role="listitem"]')], true);
  return true;
})()
"#;

/// Observer payloads: the attach-time snapshot, a batch, or one record.
#[derive(Deserialize)]
#[serde(untagged)]
enum ObserverPayload {
    Snapshot { snapshot: Vec<ObservedMessage> },
    Batch(Vec<ObservedMessage>),
    Single(ObservedMessage),
}

/// Which chat a command acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatTarget {
    /// The account's own chat.
    Me,
    /// A chat found through the search box by its title.
    Name(String),
    /// A chat opened directly by phone number (digits only).
    Phone(String),
}

impl ChatTarget {
    /// `me` or an empty string is the own chat; `+` followed by digits, or
    /// only digits and separators, is a phone number; anything else a name.
    pub fn parse(to: &str) -> Self {
        let to = to.trim();
        if to.is_empty() || to.eq_ignore_ascii_case("me") {
            return ChatTarget::Me;
        }
        let phone_like = to
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
        let digits: String = to.chars().filter(char::is_ascii_digit).collect();
        if phone_like && digits.len() >= 6 {
            ChatTarget::Phone(digits)
        } else {
            ChatTarget::Name(to.to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Document,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" => MediaKind::Image,
            "mp4" | "3gp" | "mov" | "mkv" | "avi" => MediaKind::Video,
            _ => MediaKind::Document,
        }
    }

    fn input(self) -> &'static str {
        match self {
            MediaKind::Image | MediaKind::Video => MEDIA_INPUT,
            MediaKind::Document => DOCUMENT_INPUT,
        }
    }
}

pub struct WhatsAppSite {
    url: String,
    screenshot_path: PathBuf,
}

impl WhatsAppSite {
    pub fn new(config: &WhatsAppConfig) -> Self {
        Self {
            url: config.url.clone(),
            screenshot_path: config.screenshot_path.clone(),
        }
    }
}

fn same_page(current: &str, base: &str) -> bool {
    current.trim_end_matches('/') == base.trim_end_matches('/')
}

#[async_trait]
impl LoginSite for WhatsAppSite {
    fn authenticated_marker(&self) -> &str {
        CHAT_PANE
    }

    fn unauthenticated_marker(&self) -> &str {
        QR_CODE
    }

    fn confirmation(&self) -> Confirmation {
        Confirmation::ScanCode
    }

    /// Navigates only when the page is elsewhere or in another language, so
    /// a live chat list (and its observer) survives a login request.
    async fn open(&self, page: &PageHandle) -> Result<(), PageError> {
        let at_base = page
            .url()
            .await?
            .is_some_and(|current| same_page(&current, &self.url));
        let other_language = page
            .cookie(LANG_COOKIE)
            .await?
            .is_some_and(|value| value != LANGUAGE);
        if at_base && !other_language {
            debug!(target: "whatsapp", "already on WhatsApp Web");
            return Ok(());
        }
        page.set_cookie(LANG_COOKIE, LANGUAGE, COOKIE_DOMAIN).await?;
        page.goto(&self.url).await
    }

    async fn artifact_marker(&self, page: &PageHandle) -> Result<Option<String>, PageError> {
        page.attribute(QR_CODE, QR_MARKER_ATTRIBUTE).await
    }

    async fn capture_artifact(&self, page: &PageHandle) -> Result<PathBuf, PageError> {
        page.screenshot_element(QR_CODE, &self.screenshot_path).await?;
        Ok(self.screenshot_path.clone())
    }
}

async fn click_when_ready(page: &PageHandle, selector: &str) -> Result<(), PageError> {
    if !page.wait_for(selector, CHAT_LOOKUP_TIMEOUT).await? {
        return Err(PageError::SelectorNotFound(selector.to_string()));
    }
    page.click(selector).await
}

async fn search_and_open(page: &PageHandle, query: &str, result: &str) -> Result<(), PageError> {
    page.click(SEARCH_BOX).await?;
    page.type_text(SEARCH_BOX, query).await?;
    click_when_ready(page, result).await
}

/// Types `body` line by line with soft line breaks, then sends it.
async fn type_message(page: &PageHandle, body: &str) -> Result<(), PageError> {
    for (index, line) in body.lines().enumerate() {
        if index > 0 {
            page.press_newline(MESSAGE_BOX).await?;
        }
        if !line.is_empty() {
            page.type_text(MESSAGE_BOX, line).await?;
        }
    }
    page.press_enter(MESSAGE_BOX).await
}

/// Polls until the conversation has at least `rows` rows.
async fn wait_for_rows(page: &PageHandle, rows: usize, limit: Duration) -> Result<bool, PageError> {
    let deadline = Instant::now() + limit;
    loop {
        if page.count(CONVERSATION_ROWS).await? >= rows {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        sleep(SELECTOR_POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Chat side of the automation: the observer pump and the queued chat
/// commands.
pub struct WhatsAppChat {
    key: PageKey,
    base_url: String,
    self_chat: String,
    reply_timeout: Duration,
    session: Arc<Session>,
    queues: Arc<QueueSet>,
    bus: Arc<dyn EventBus<PilotEvent>>,
    cache: MessageDedupCache,
    callback_exposed: AtomicBool,
}

impl WhatsAppChat {
    pub fn new(
        key: PageKey,
        config: &WhatsAppConfig,
        session: Arc<Session>,
        queues: Arc<QueueSet>,
        bus: Arc<dyn EventBus<PilotEvent>>,
    ) -> Self {
        Self {
            key,
            base_url: config.url.clone(),
            self_chat: config.self_chat.clone(),
            reply_timeout: config.reply_timeout(),
            session,
            queues,
            bus,
            cache: MessageDedupCache::new(),
            callback_exposed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &PageKey {
        &self.key
    }

    /// Makes `target` the open conversation.
    pub fn open_chat(self: &Arc<Self>, target: ChatTarget) -> Result<CommandHandle<()>, QueueError> {
        let chat = Arc::clone(self);
        self.queues.submit(&self.key, "open_chat", move |page| async move {
            chat.select_chat(&page, &target).await
        })
    }

    /// Opens `target` and sends `body`; newlines become soft line breaks.
    pub fn send_message(
        self: &Arc<Self>,
        target: ChatTarget,
        body: &str,
    ) -> Result<CommandHandle<()>, QueueError> {
        let chat = Arc::clone(self);
        let body = body.to_string();
        self.queues.submit(&self.key, "send_message", move |page| async move {
            chat.select_chat(&page, &target).await?;
            type_message(&page, &body).await?;
            info!(target: "whatsapp", chat = ?target, "message sent");
            Ok::<(), PageError>(())
        })
    }

    /// Attaches `path` in `target` and sends it with an optional caption.
    pub fn send_media(
        self: &Arc<Self>,
        target: ChatTarget,
        path: PathBuf,
        caption: Option<String>,
        kind: MediaKind,
    ) -> Result<CommandHandle<()>, QueueError> {
        let chat = Arc::clone(self);
        self.queues.submit(&self.key, "send_media", move |page| async move {
            tokio::fs::metadata(&path)
                .await
                .map_err(|err| PageError::Io(format!("{}: {err}", path.display())))?;
            chat.select_chat(&page, &target).await?;
            page.click(ATTACH_BUTTON).await?;
            if !page.wait_for(kind.input(), CHAT_LOOKUP_TIMEOUT).await? {
                return Err(PageError::SelectorNotFound(kind.input().to_string()));
            }
            page.set_input_files(kind.input(), std::slice::from_ref(&path)).await?;
            if let Some(caption) = caption.filter(|caption| !caption.trim().is_empty()) {
                if !page.wait_for(CAPTION_BOX, CHAT_LOOKUP_TIMEOUT).await? {
                    return Err(PageError::SelectorNotFound(CAPTION_BOX.to_string()));
                }
                page.type_text(CAPTION_BOX, &caption).await?;
            }
            click_when_ready(&page, SEND_MEDIA_BUTTON).await?;
            info!(target: "whatsapp", chat = ?target, ?kind, file = %path.display(), "media sent");
            Ok::<(), PageError>(())
        })
    }

    /// Sends `body` to the own chat and resolves with the text of the next
    /// row that shows up after it.
    pub fn send_me_and_wait(self: &Arc<Self>, body: &str) -> Result<CommandHandle<String>, QueueError> {
        let chat = Arc::clone(self);
        let body = body.to_string();
        self.queues.submit(&self.key, "send_me_and_wait", move |page| async move {
            chat.select_chat(&page, &ChatTarget::Me).await?;
            let before = page.count(CONVERSATION_ROWS).await?;
            type_message(&page, &body).await?;
            if !wait_for_rows(&page, before + 1, CHAT_LOOKUP_TIMEOUT).await? {
                debug!(target: "whatsapp", "sent row not rendered; counting from here");
            }
            let sent = page.count(CONVERSATION_ROWS).await?;
            if !wait_for_rows(&page, sent + 1, chat.reply_timeout).await? {
                return Err(PageError::Timeout(format!(
                    "no reply within {:?}",
                    chat.reply_timeout
                )));
            }
            Ok::<_, PageError>(page.last_text(LAST_ROW_TEXT).await?.unwrap_or_default())
        })
    }

    /// Logs the account out of WhatsApp Web and marks the session logged out.
    pub fn logout(self: &Arc<Self>) -> Result<CommandHandle<()>, QueueError> {
        let chat = Arc::clone(self);
        self.queues.submit(&self.key, "logout", move |page| async move {
            click_when_ready(&page, SETTINGS_BUTTON).await?;
            click_when_ready(&page, LOGOUT_ENTRY).await?;
            click_when_ready(&page, CONFIRM_LOGOUT).await?;
            chat.session.mark_logged_out();
            info!(target: "whatsapp", "logged out");
            Ok::<(), PageError>(())
        })
    }

    async fn select_chat(&self, page: &PageHandle, target: &ChatTarget) -> Result<(), PageError> {
        match target {
            ChatTarget::Name(name) => search_and_open(page, name, &chat_selector(name)).await,
            ChatTarget::Me => {
                search_and_open(page, &self.self_chat, &own_chat_selector(&self.self_chat)).await
            }
            ChatTarget::Phone(number) => {
                page.goto(&phone_url(&self.base_url, number)).await?;
                if !page.wait_for(MESSAGE_BOX, PHONE_CHAT_TIMEOUT).await? {
                    return Err(PageError::Timeout(format!("no chat opened for {number}")));
                }
                // The navigation dropped the in-page observer.
                if self.callback_exposed.load(Ordering::SeqCst) {
                    self.arm_observer(page).await?;
                }
                Ok(())
            }
        }
    }

    /// Feeds one observer payload through the dedup cache and publishes the
    /// survivors. Returns how many were published.
    pub fn ingest(&self, payload: &str) -> usize {
        let messages = match serde_json::from_str::<ObserverPayload>(payload) {
            Ok(ObserverPayload::Snapshot { snapshot }) => {
                // Rows already on screen when the observer attached are old news.
                for message in &snapshot {
                    self.cache.observe(message);
                }
                debug!(target: "whatsapp", rows = snapshot.len(), "chat list baseline recorded");
                return 0;
            }
            Ok(ObserverPayload::Batch(messages)) => messages,
            Ok(ObserverPayload::Single(message)) => vec![message],
            Err(err) => {
                warn!(target: "whatsapp", error = %err, "unreadable observer payload");
                return 0;
            }
        };

        let mut published = 0;
        for message in messages {
            if !self.cache.observe(&message) {
                continue;
            }
            debug!(target: "whatsapp", sender = %message.sender, "message observed");
            self.bus.publish(PilotEvent::MessageArrived {
                key: self.key.clone(),
                message,
            });
            published += 1;
        }
        published
    }

    pub fn last_message(&self, sender: &str) -> Option<ObservedMessage> {
        self.cache.last(sender)
    }

    async fn arm_observer(&self, page: &PageHandle) -> Result<(), PageError> {
        if !page.wait_for(CHAT_PANE, CHAT_LOOKUP_TIMEOUT).await? {
            return Err(PageError::SelectorNotFound(CHAT_PANE.to_string()));
        }
        page.evaluate(OBSERVER_SCRIPT).await?;
        Ok(())
    }

    /// Exposes the observer callback once per page and (re)injects the
    /// observer script.
    fn install_observer(self: &Arc<Self>) {
        let chat = Arc::clone(self);
        let submitted = self
            .queues
            .submit(&self.key, "install_observer", move |page| async move {
                let inbox = if chat.callback_exposed.swap(true, Ordering::SeqCst) {
                    None
                } else {
                    match page.expose_callback(OBSERVER_CALLBACK).await {
                        Ok(inbox) => Some(inbox),
                        Err(err) => {
                            chat.callback_exposed.store(false, Ordering::SeqCst);
                            return Err(err);
                        }
                    }
                };
                chat.arm_observer(&page).await?;
                Ok::<_, PageError>(inbox)
            });
        let handle = match submitted {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "whatsapp", error = %err, "observer not queued");
                return;
            }
        };

        let chat = Arc::clone(self);
        tokio::spawn(async move {
            match handle.await {
                Ok(Some(inbox)) => {
                    info!(target: "whatsapp", "chat observer installed");
                    chat.pump(inbox).await;
                    chat.callback_exposed.store(false, Ordering::SeqCst);
                }
                Ok(None) => debug!(target: "whatsapp", "chat observer re-armed"),
                Err(err) => error!(target: "whatsapp", error = %err, "chat observer failed"),
            }
        });
    }

    async fn pump(&self, mut inbox: mpsc::UnboundedReceiver<String>) {
        while let Some(payload) = inbox.recv().await {
            self.ingest(&payload);
        }
        debug!(target: "whatsapp", "observer channel closed");
    }
}

fn escape_attribute(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn chat_selector(name: &str) -> String {
    format!("span[title=\"{}\"]", escape_attribute(name))
}

/// The own chat's title ends with the "(You)" label.
fn own_chat_selector(label: &str) -> String {
    format!("span[title$=\"{}\"]", escape_attribute(label))
}

fn phone_url(base: &str, number: &str) -> String {
    format!(
        "{}/send?phone={number}&text&type=phone_number&app_absent=1",
        base.trim_end_matches('/')
    )
}

pub struct WhatsAppAutomation {
    key: PageKey,
    config: WhatsAppConfig,
    session: Arc<Session>,
    chat: Arc<WhatsAppChat>,
    queues: Arc<QueueSet>,
    bus: Arc<dyn EventBus<PilotEvent>>,
    entities: Vec<Arc<dyn Entity>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl WhatsAppAutomation {
    pub fn new(deps: &AutomationDeps) -> Self {
        let key = PageKey::new(KEY);
        let config = deps.config.whatsapp.clone();
        let session = Session::new(
            key.clone(),
            Arc::new(WhatsAppSite::new(&config)),
            Arc::clone(&deps.bus),
            deps.config.session.clone(),
        );
        let chat = Arc::new(WhatsAppChat::new(
            key.clone(),
            &config,
            Arc::clone(&session),
            Arc::clone(&deps.queues),
            Arc::clone(&deps.bus),
        ));
        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(LoginButton::new(
                "button.whatsapp_login",
                Arc::clone(&session),
                Arc::clone(&deps.queues),
            )),
            Arc::new(LoginStatusSensor::new(
                "sensor.whatsapp_login_status",
                Arc::clone(&session),
                Arc::clone(&deps.bus),
            )),
            Arc::new(QrImage::new(
                "image.whatsapp_qr",
                key.clone(),
                config.static_url.clone(),
                Arc::clone(&deps.bus),
            )),
            Arc::new(LastMessageSensor::new(
                "sensor.whatsapp_last_message",
                key.clone(),
                Arc::clone(&deps.bus),
            )),
            Arc::new(LogoutButton::new(
                "button.whatsapp_logout",
                Arc::clone(&chat),
            )),
            Arc::new(Notify::new("notify.whatsapp", Arc::clone(&chat))),
        ];
        Self {
            key,
            config,
            session,
            chat,
            queues: Arc::clone(&deps.queues),
            bus: Arc::clone(&deps.bus),
            entities,
            subscription: Mutex::new(None),
        }
    }

    pub fn chat(&self) -> Arc<WhatsAppChat> {
        Arc::clone(&self.chat)
    }
}

pub fn factory(deps: &AutomationDeps) -> Option<Arc<dyn Automation>> {
    if !deps.config.whatsapp.enabled {
        return None;
    }
    Some(Arc::new(WhatsAppAutomation::new(deps)))
}

#[async_trait]
impl Automation for WhatsAppAutomation {
    fn key(&self) -> &PageKey {
        &self.key
    }

    fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    fn entities(&self) -> Vec<Arc<dyn Entity>> {
        self.entities.clone()
    }

    async fn start(&self) -> Result<()> {
        let chat = Arc::clone(&self.chat);
        let listener = listener_fn(move |event: PilotEvent| {
            let chat = Arc::clone(&chat);
            async move {
                let PilotEvent::LoginStatusChanged { key, status } = event else {
                    return;
                };
                if key != chat.key {
                    return;
                }
                if status == LoginStatus::LoggedIn {
                    chat.install_observer();
                }
            }
        });
        let id = self.bus.subscribe(EventKind::LoginStatusChanged, listener);
        if let Some(previous) = self.subscription.lock().replace(id) {
            self.bus.unsubscribe(previous);
        }

        if self.config.login_on_start {
            if let LoginRequest::Queued(handle) = self.session.request_login(&self.queues)? {
                tokio::spawn(async move {
                    if let Err(err) = handle.await {
                        warn!(target: "whatsapp", error = %err, "startup login failed");
                    }
                });
            }
        }
        info!(target: "whatsapp", "automation started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use page_broker::memory::{MemoryContext, MemoryPage};
    use page_broker::PageBroker;
    use pagepilot_event_bus::InMemoryBus;
    use pagepilot_scheduler::QueueConfig;
    use pagepilot_session::SessionConfig;

    use super::*;

    async fn chat_on_memory_page(config: WhatsAppConfig) -> (Arc<WhatsAppChat>, Arc<MemoryPage>) {
        let context = MemoryContext::new();
        let broker = PageBroker::new(Duration::from_secs(1));
        broker.attach(context.clone());
        let queues = QueueSet::new(Arc::clone(&broker), QueueConfig::default());
        let bus: Arc<dyn EventBus<PilotEvent>> = InMemoryBus::<PilotEvent>::new();
        let key = PageKey::new(KEY);
        let session = Session::new(
            key.clone(),
            Arc::new(WhatsAppSite::new(&config)),
            Arc::clone(&bus),
            SessionConfig::default(),
        );
        let chat = Arc::new(WhatsAppChat::new(key.clone(), &config, session, queues, bus));
        broker.get_page(&key).await.unwrap();
        let page = context.page(&key).unwrap();
        (chat, page)
    }

    async fn wait_for_action(page: &MemoryPage, prefix: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !page.actions().iter().any(|action| action.starts_with(prefix)) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("action not performed");
    }

    fn observed(sender: &str, time: &str, body: &str) -> ObservedMessage {
        serde_json::from_value(serde_json::json!({ "sender": sender, "time": time, "body": body }))
            .unwrap()
    }

    #[tokio::test]
    async fn snapshot_rows_are_a_baseline_not_news() {
        let (chat, _page) = chat_on_memory_page(WhatsAppConfig::default()).await;
        let snapshot = serde_json::json!({ "snapshot": [
            { "sender": "SAT", "time": "8:15", "body": "Su codigo es 111111" },
            { "sender": "Ana", "time": "8:20", "body": "hola" },
        ]})
        .to_string();
        assert_eq!(chat.ingest(&snapshot), 0);
        assert_eq!(chat.last_message("SAT").unwrap().body, "Su codigo es 111111");

        // The same rows reported again by the live observer stay quiet.
        let replay = serde_json::to_string(&vec![observed("SAT", "8:15", "Su codigo es 111111")])
            .unwrap();
        assert_eq!(chat.ingest(&replay), 0);

        let fresh = serde_json::to_string(&observed("SAT", "8:30", "Su codigo es 222222")).unwrap();
        assert_eq!(chat.ingest(&fresh), 1);
    }

    #[tokio::test]
    async fn send_me_and_wait_returns_the_next_row() {
        let mut config = WhatsAppConfig::default();
        config.reply_timeout_ms = 3_000;
        let (chat, page) = chat_on_memory_page(config).await;
        for selector in [SEARCH_BOX, "span[title$=\"(You)\"]", MESSAGE_BOX] {
            page.show(selector);
        }
        page.set_count(CONVERSATION_ROWS, 3);

        let handle = chat.send_me_and_wait("ping").unwrap();
        wait_for_action(&page, "enter footer").await;
        assert!(page.actions().contains(&format!("type {SEARCH_BOX} (You)")));
        page.set_count(CONVERSATION_ROWS, 4);
        sleep(Duration::from_millis(600)).await;
        page.set_text(LAST_ROW_TEXT, "pong");
        page.set_count(CONVERSATION_ROWS, 5);

        assert_eq!(handle.await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn send_me_and_wait_gives_up_after_the_reply_timeout() {
        let mut config = WhatsAppConfig::default();
        config.reply_timeout_ms = 300;
        let (chat, page) = chat_on_memory_page(config).await;
        for selector in [SEARCH_BOX, "span[title$=\"(You)\"]", MESSAGE_BOX] {
            page.show(selector);
        }
        page.set_count(CONVERSATION_ROWS, 3);

        let handle = chat.send_me_and_wait("ping").unwrap();
        wait_for_action(&page, "enter footer").await;
        page.set_count(CONVERSATION_ROWS, 4);

        let err = handle.await.unwrap_err();
        assert!(err.to_string().contains("no reply"), "{err}");
    }

    #[tokio::test]
    async fn open_chat_searches_and_clicks_the_result() {
        let (chat, page) = chat_on_memory_page(WhatsAppConfig::default()).await;
        page.show(SEARCH_BOX);
        page.show("span[title=\"Nadie\"]");

        chat.open_chat(ChatTarget::Name("Nadie".into()))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(
            page.actions().last().map(String::as_str),
            Some("click span[title=\"Nadie\"]")
        );
    }

    #[tokio::test]
    async fn phone_chat_navigation_rearms_the_observer() {
        let (chat, page) = chat_on_memory_page(WhatsAppConfig::default()).await;
        page.show(CHAT_PANE);
        page.show(MESSAGE_BOX);
        chat.install_observer();
        wait_for_action(&page, "evaluate").await;

        chat.send_message(ChatTarget::parse("+502 5555 1234"), "hola")
            .unwrap()
            .await
            .unwrap();
        let actions = page.actions();
        let goto = actions
            .iter()
            .position(|action| action.contains("send?phone=50255551234"))
            .expect("phone chat opened");
        let rearmed = actions
            .iter()
            .rposition(|action| action.starts_with("evaluate"))
            .unwrap();
        assert!(rearmed > goto, "{actions:?}");
        assert_eq!(
            actions.iter().filter(|action| action.starts_with("expose")).count(),
            1
        );
    }

    #[test]
    fn chat_selector_escapes_quotes() {
        assert_eq!(chat_selector("Ana"), "span[title=\"Ana\"]");
        assert_eq!(
            chat_selector("Taller \"El Sol\""),
            "span[title=\"Taller \\\"El Sol\\\"\"]"
        );
    }

    #[test]
    fn observer_script_reports_through_the_callback() {
        assert!(OBSERVER_SCRIPT.contains(&format!("window.{OBSERVER_CALLBACK}(")));
        assert!(OBSERVER_SCRIPT.contains(CHAT_PANE));
    }

    #[test]
    fn payload_accepts_snapshot_single_and_batch() {
        let single = r#"{"sender":"Ana","time":"3:45 p. m.","body":"hola"}"#;
        assert!(matches!(
            serde_json::from_str::<ObserverPayload>(single),
            Ok(ObserverPayload::Single(_))
        ));
        let batch = r#"[{"sender":"Ana","body":"hola"},{"sender":"Luis","body":"hey"}]"#;
        match serde_json::from_str::<ObserverPayload>(batch) {
            Ok(ObserverPayload::Batch(messages)) => assert_eq!(messages.len(), 2),
            _ => panic!("expected a batch"),
        }
        let snapshot = r#"{"snapshot":[{"sender":"Ana","body":"hola"}]}"#;
        match serde_json::from_str::<ObserverPayload>(snapshot) {
            Ok(ObserverPayload::Snapshot { snapshot }) => assert_eq!(snapshot.len(), 1),
            _ => panic!("expected a snapshot"),
        }
    }

    #[test]
    fn chat_targets_parse_from_the_notify_recipient() {
        assert_eq!(ChatTarget::parse(""), ChatTarget::Me);
        assert_eq!(ChatTarget::parse("Me"), ChatTarget::Me);
        assert_eq!(
            ChatTarget::parse("+502 5555-1234"),
            ChatTarget::Phone("50255551234".into())
        );
        assert_eq!(ChatTarget::parse("Ana"), ChatTarget::Name("Ana".into()));
        assert_eq!(ChatTarget::parse("Taller 7"), ChatTarget::Name("Taller 7".into()));
    }

    #[test]
    fn media_kind_follows_the_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a/cat.JPG")), MediaKind::Image);
        assert_eq!(MediaKind::from_path(Path::new("clip.mp4")), MediaKind::Video);
        assert_eq!(MediaKind::from_path(Path::new("factura.pdf")), MediaKind::Document);
        assert_eq!(MediaKind::from_path(Path::new("README")), MediaKind::Document);
    }

    #[test]
    fn phone_chats_open_through_the_send_link() {
        assert_eq!(
            phone_url("https://web.whatsapp.com/", "50255551234"),
            "https://web.whatsapp.com/send?phone=50255551234&text&type=phone_number&app_absent=1"
        );
        assert_eq!(own_chat_selector("(You)"), "span[title$=\"(You)\"]");
    }

    #[test]
    fn base_url_comparison_ignores_trailing_slash() {
        assert!(same_page("https://web.whatsapp.com", "https://web.whatsapp.com/"));
        assert!(!same_page(
            "https://web.whatsapp.com/send?phone=1",
            "https://web.whatsapp.com/"
        ));
    }
}
