//! DeclaraGuate portal: credential form plus a one-time code that arrives as
//! a WhatsApp message.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use page_broker::{PageDriver, PageError, PageHandle};
use pagepilot_core_types::{EventKind, LoginStatus, PageKey, PilotEvent};
use pagepilot_event_bus::{listener_fn, EventBus, SubscriptionId};
use pagepilot_scheduler::QueueSet;
use pagepilot_session::{Confirmation, LoginRequest, LoginSite, Session};

use super::{whatsapp, Automation, AutomationDeps};
use crate::config::DeclaraGuateConfig;
use crate::entities::{Entity, LoginButton, LoginStatusSensor};

pub const KEY: &str = "declaraguate";

const DASHBOARD: &str = "a[href*='cerrarSesion']";
const LOGIN_FORM: &str = "form#loginForm";
const USERNAME: &str = "#username";
const PASSWORD: &str = "#password";
const SUBMIT: &str = "#btnIngresar";
const CODE_INPUT: &str = "#codigoVerificacion";
const CODE_SUBMIT: &str = "#btnVerificar";

pub struct DeclaraGuateSite {
    url: String,
    username: String,
    password: String,
    otp_sender: String,
}

impl DeclaraGuateSite {
    pub fn new(config: &DeclaraGuateConfig) -> Self {
        Self {
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            otp_sender: config.otp_sender.clone(),
        }
    }
}

#[async_trait]
impl LoginSite for DeclaraGuateSite {
    fn authenticated_marker(&self) -> &str {
        DASHBOARD
    }

    fn unauthenticated_marker(&self) -> &str {
        LOGIN_FORM
    }

    fn confirmation(&self) -> Confirmation {
        Confirmation::MessagedCode {
            sender: self.otp_sender.clone(),
        }
    }

    async fn open(&self, page: &PageHandle) -> Result<(), PageError> {
        page.goto(&self.url).await
    }

    async fn prepare(&self, page: &PageHandle) -> Result<(), PageError> {
        page.type_text(USERNAME, &self.username).await?;
        page.type_text(PASSWORD, &self.password).await?;
        page.click(SUBMIT).await?;
        info!(target: "declaraguate", "credentials submitted; waiting for code");
        Ok(())
    }

    async fn enter_code(&self, page: &PageHandle, code: &str) -> Result<(), PageError> {
        page.type_text(CODE_INPUT, code).await?;
        page.click(CODE_SUBMIT).await
    }
}

pub struct DeclaraGuateAutomation {
    key: PageKey,
    config: DeclaraGuateConfig,
    session: Arc<Session>,
    queues: Arc<QueueSet>,
    bus: Arc<dyn EventBus<PilotEvent>>,
    entities: Vec<Arc<dyn Entity>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl DeclaraGuateAutomation {
    pub fn new(deps: &AutomationDeps) -> Self {
        let key = PageKey::new(KEY);
        let config = deps.config.declaraguate.clone();
        if config.username.is_empty() || config.password.is_empty() {
            warn!(target: "declaraguate", "credentials are not configured");
        }
        let session = Session::new(
            key.clone(),
            Arc::new(DeclaraGuateSite::new(&config)),
            Arc::clone(&deps.bus),
            deps.config.session.clone(),
        );
        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(LoginButton::new(
                "button.declaraguate_login",
                Arc::clone(&session),
                Arc::clone(&deps.queues),
            )),
            Arc::new(LoginStatusSensor::new(
                "sensor.declaraguate_login_status",
                Arc::clone(&session),
                Arc::clone(&deps.bus),
            )),
        ];
        Self {
            key,
            config,
            session,
            queues: Arc::clone(&deps.queues),
            bus: Arc::clone(&deps.bus),
            entities,
            subscription: Mutex::new(None),
        }
    }
}

pub fn factory(deps: &AutomationDeps) -> Option<Arc<dyn Automation>> {
    if !deps.config.declaraguate.enabled {
        return None;
    }
    Some(Arc::new(DeclaraGuateAutomation::new(deps)))
}

#[async_trait]
impl Automation for DeclaraGuateAutomation {
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
        if !self.config.login_after_whatsapp {
            return Ok(());
        }

        // The code arrives over WhatsApp, so a login only makes sense once
        // that session is up.
        let session = Arc::clone(&self.session);
        let queues = Arc::clone(&self.queues);
        let listener = listener_fn(move |event: PilotEvent| {
            let session = Arc::clone(&session);
            let queues = Arc::clone(&queues);
            async move {
                let PilotEvent::LoginStatusChanged { key, status } = event else {
                    return;
                };
                if key.as_str() != whatsapp::KEY
                    || status != LoginStatus::LoggedIn
                    || session.status() == LoginStatus::LoggedIn
                {
                    return;
                }
                match session.request_login(&queues) {
                    Ok(LoginRequest::Queued(handle)) => {
                        if let Err(err) = handle.await {
                            warn!(target: "declaraguate", error = %err, "login failed");
                        }
                    }
                    Ok(LoginRequest::AlreadyInProgress) => {}
                    Err(err) => warn!(target: "declaraguate", error = %err, "login not queued"),
                }
            }
        });
        let id = self.bus.subscribe(EventKind::LoginStatusChanged, listener);
        if let Some(previous) = self.subscription.lock().replace(id) {
            self.bus.unsubscribe(previous);
        }
        info!(target: "declaraguate", "waiting for WhatsApp login");
        Ok(())
    }
}
