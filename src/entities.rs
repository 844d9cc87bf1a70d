//! Host-facing entities.
//!
//! The host platform calls into entities (`on_added`, `on_press`, ...);
//! entities turn those calls into queued commands and push state back out
//! through a [`HostSink`]. Nothing here returns an error to the host: a
//! failed action is logged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use pagepilot_core_types::{EventKind, PageKey, PilotEvent};
use pagepilot_event_bus::{listener_fn, EventBus, SubscriptionId};
use pagepilot_scheduler::{CommandHandle, QueueError, QueueSet};
use pagepilot_session::{LoginRequest, Session};

use crate::automations::whatsapp::{ChatTarget, MediaKind, WhatsAppChat};

/// State pushed to the host for one entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityUpdate {
    pub entity_id: String,
    pub state: String,
    pub attributes: BTreeMap<String, Value>,
}

impl EntityUpdate {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

pub trait HostSink: Send + Sync {
    fn update(&self, update: EntityUpdate);
}

/// Sink used by the standalone binary: state updates become log lines.
pub struct LoggingSink;

impl HostSink for LoggingSink {
    fn update(&self, update: EntityUpdate) {
        let attributes = serde_json::to_string(&update.attributes).unwrap_or_default();
        info!(
            target: "host",
            entity = %update.entity_id,
            state = %update.state,
            %attributes,
            "entity state"
        );
    }
}

#[async_trait]
pub trait Entity: Send + Sync {
    fn entity_id(&self) -> &str;

    async fn on_added(&self, _sink: Arc<dyn HostSink>) {}

    async fn on_press(&self) {}

    /// Host asked for a refresh of the published state.
    async fn on_update(&self) {}

    async fn on_send_message(&self, _to: &str, _body: &str) {}

    async fn on_send_media(&self, _to: &str, _path: &Path, _caption: Option<&str>) {}
}

/// Logs the outcome of a queued entity action once it finishes.
fn report_outcome<T: Send + 'static>(
    entity: &str,
    action: &'static str,
    queued: Result<CommandHandle<T>, QueueError>,
) {
    let handle = match queued {
        Ok(handle) => handle,
        Err(err) => {
            error!(target: "host", %entity, action, error = %err, "action not queued");
            return;
        }
    };
    let entity = entity.to_string();
    tokio::spawn(async move {
        if let Err(err) = handle.await {
            warn!(target: "host", %entity, action, error = %err, "action failed");
        }
    });
}

/// Bus subscription owned by an entity, dropped on the next `on_added`.
struct Binding {
    bus: Arc<dyn EventBus<PilotEvent>>,
    subscription: Mutex<Option<SubscriptionId>>,
    sink: Mutex<Option<Arc<dyn HostSink>>>,
}

impl Binding {
    fn new(bus: Arc<dyn EventBus<PilotEvent>>) -> Self {
        Self {
            bus,
            subscription: Mutex::new(None),
            sink: Mutex::new(None),
        }
    }

    fn bind<F>(&self, sink: Arc<dyn HostSink>, kind: EventKind, key: PageKey, render: F)
    where
        F: Fn(&PilotEvent) -> Option<EntityUpdate> + Send + Sync + 'static,
    {
        *self.sink.lock() = Some(Arc::clone(&sink));
        let listener = listener_fn(move |event: PilotEvent| {
            let update = (event.key() == &key).then(|| render(&event)).flatten();
            let sink = Arc::clone(&sink);
            async move {
                if let Some(update) = update {
                    sink.update(update);
                }
            }
        });
        let id = self.bus.subscribe(kind, listener);
        if let Some(previous) = self.subscription.lock().replace(id) {
            self.bus.unsubscribe(previous);
        }
    }

    fn push(&self, update: EntityUpdate) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.update(update);
        }
    }
}

pub struct LoginButton {
    id: String,
    session: Arc<Session>,
    queues: Arc<QueueSet>,
}

impl LoginButton {
    pub fn new(id: impl Into<String>, session: Arc<Session>, queues: Arc<QueueSet>) -> Self {
        Self {
            id: id.into(),
            session,
            queues,
        }
    }
}

#[async_trait]
impl Entity for LoginButton {
    fn entity_id(&self) -> &str {
        &self.id
    }

    async fn on_press(&self) {
        match self.session.request_login(&self.queues) {
            Ok(LoginRequest::Queued(handle)) => {
                let entity = self.id.clone();
                tokio::spawn(async move {
                    match handle.await {
                        Ok(status) => info!(target: "host", %entity, %status, "login finished"),
                        Err(err) => error!(target: "host", %entity, error = %err, "login failed"),
                    }
                });
            }
            Ok(LoginRequest::AlreadyInProgress) => {
                info!(target: "host", entity = %self.id, "login already running");
            }
            Err(err) => error!(target: "host", entity = %self.id, error = %err, "login not queued"),
        }
    }
}

pub struct LoginStatusSensor {
    id: String,
    session: Arc<Session>,
    binding: Binding,
}

impl LoginStatusSensor {
    pub fn new(
        id: impl Into<String>,
        session: Arc<Session>,
        bus: Arc<dyn EventBus<PilotEvent>>,
    ) -> Self {
        Self {
            id: id.into(),
            session,
            binding: Binding::new(bus),
        }
    }

    fn current(&self) -> EntityUpdate {
        EntityUpdate::new(&self.id, self.session.status().as_str())
    }
}

#[async_trait]
impl Entity for LoginStatusSensor {
    fn entity_id(&self) -> &str {
        &self.id
    }

    async fn on_added(&self, sink: Arc<dyn HostSink>) {
        let id = self.id.clone();
        self.binding.bind(
            Arc::clone(&sink),
            EventKind::LoginStatusChanged,
            self.session.key().clone(),
            move |event| match event {
                PilotEvent::LoginStatusChanged { status, .. } => {
                    Some(EntityUpdate::new(&id, status.as_str()))
                }
                _ => None,
            },
        );
        sink.update(self.current());
    }

    async fn on_update(&self) {
        self.binding.push(self.current());
    }
}

/// Latest login QR code, published as a static URL with a cache buster.
pub struct QrImage {
    id: String,
    key: PageKey,
    static_url: String,
    binding: Binding,
}

impl QrImage {
    pub fn new(
        id: impl Into<String>,
        key: PageKey,
        static_url: impl Into<String>,
        bus: Arc<dyn EventBus<PilotEvent>>,
    ) -> Self {
        Self {
            id: id.into(),
            key,
            static_url: static_url.into(),
            binding: Binding::new(bus),
        }
    }
}

pub fn cache_busted_url(static_url: &str, millis: i64) -> String {
    let separator = if static_url.contains('?') { '&' } else { '?' };
    format!("{static_url}{separator}t={millis}")
}

fn render_qr(id: &str, static_url: &str, path: &Path) -> EntityUpdate {
    let url = cache_busted_url(static_url, Utc::now().timestamp_millis());
    EntityUpdate::new(id, url.clone())
        .with_attribute("entity_picture", json!(url))
        .with_attribute("path", json!(path.display().to_string()))
}

#[async_trait]
impl Entity for QrImage {
    fn entity_id(&self) -> &str {
        &self.id
    }

    async fn on_added(&self, sink: Arc<dyn HostSink>) {
        let id = self.id.clone();
        let static_url = self.static_url.clone();
        self.binding.bind(
            sink,
            EventKind::NewQrScreenshot,
            self.key.clone(),
            move |event| match event {
                PilotEvent::NewQrScreenshot { path, .. } => Some(render_qr(&id, &static_url, path)),
                _ => None,
            },
        );
    }
}

pub struct LastMessageSensor {
    id: String,
    key: PageKey,
    binding: Binding,
}

impl LastMessageSensor {
    pub fn new(id: impl Into<String>, key: PageKey, bus: Arc<dyn EventBus<PilotEvent>>) -> Self {
        Self {
            id: id.into(),
            key,
            binding: Binding::new(bus),
        }
    }
}

#[async_trait]
impl Entity for LastMessageSensor {
    fn entity_id(&self) -> &str {
        &self.id
    }

    async fn on_added(&self, sink: Arc<dyn HostSink>) {
        let id = self.id.clone();
        self.binding.bind(
            sink,
            EventKind::MessageArrived,
            self.key.clone(),
            move |event| match event {
                PilotEvent::MessageArrived { message, .. } => Some(
                    EntityUpdate::new(&id, message.body.clone())
                        .with_attribute("sender", json!(message.sender))
                        .with_attribute("time", json!(message.time_text))
                        .with_attribute("is_self", json!(message.is_self))
                        .with_attribute("unread_count", json!(message.unread_count)),
                ),
                _ => None,
            },
        );
    }
}

/// Logs the WhatsApp page out.
pub struct LogoutButton {
    id: String,
    chat: Arc<WhatsAppChat>,
}

impl LogoutButton {
    pub fn new(id: impl Into<String>, chat: Arc<WhatsAppChat>) -> Self {
        Self {
            id: id.into(),
            chat,
        }
    }
}

#[async_trait]
impl Entity for LogoutButton {
    fn entity_id(&self) -> &str {
        &self.id
    }

    async fn on_press(&self) {
        report_outcome(&self.id, "logout", self.chat.logout());
    }
}

/// Sends chat messages and files through the WhatsApp page. The recipient
/// is a chat name, a phone number, or `me`.
pub struct Notify {
    id: String,
    chat: Arc<WhatsAppChat>,
}

impl Notify {
    pub fn new(id: impl Into<String>, chat: Arc<WhatsAppChat>) -> Self {
        Self {
            id: id.into(),
            chat,
        }
    }
}

#[async_trait]
impl Entity for Notify {
    fn entity_id(&self) -> &str {
        &self.id
    }

    async fn on_send_message(&self, to: &str, body: &str) {
        report_outcome(
            &self.id,
            "send_message",
            self.chat.send_message(ChatTarget::parse(to), body),
        );
    }

    async fn on_send_media(&self, to: &str, path: &Path, caption: Option<&str>) {
        let path = PathBuf::from(path);
        let kind = MediaKind::from_path(&path);
        report_outcome(
            &self.id,
            "send_media",
            self.chat.send_media(
                ChatTarget::parse(to),
                path,
                caption.map(str::to_string),
                kind,
            ),
        );
    }
}
