use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use message_cache::extract_code;
use page_broker::PageHandle;
use pagepilot_core_types::{EventKind, LoginStatus, PageKey, PilotEvent};
use pagepilot_event_bus::{BusError, EventBus};
use pagepilot_scheduler::{CommandHandle, QueueError, QueueSet};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::site::{Confirmation, LoginSite};

pub enum LoginRequest {
    Queued(CommandHandle<LoginStatus>),
    /// A login flow is already queued or running; nothing was submitted.
    AlreadyInProgress,
}

enum Probe {
    Authenticated,
    Unauthenticated,
}

enum Wake {
    Authenticated,
    ArtifactChanged,
    NotYet,
}

/// Login state of one page key.
pub struct Session {
    key: PageKey,
    site: Arc<dyn LoginSite>,
    bus: Arc<dyn EventBus<PilotEvent>>,
    config: SessionConfig,
    status: watch::Sender<LoginStatus>,
    flow_active: AtomicBool,
    last_marker: Mutex<Option<String>>,
    /// Last one-time code typed into the page; never entered twice.
    used_code: Mutex<Option<String>>,
}

/// Clears the active-flow flag when the login command finishes, fails,
/// panics or is dropped unrun. A flow dropped mid-confirmation (queue
/// timeout, shutdown) leaves no `LoginInProgress` behind.
struct FlowGuard(Arc<Session>);

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.0.settle_abandoned();
        self.0.flow_active.store(false, Ordering::SeqCst);
    }
}

impl Session {
    pub fn new(
        key: PageKey,
        site: Arc<dyn LoginSite>,
        bus: Arc<dyn EventBus<PilotEvent>>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(LoginStatus::NotLoggedIn);
        Arc::new(Self {
            key,
            site,
            bus,
            config,
            status,
            flow_active: AtomicBool::new(false),
            last_marker: Mutex::new(None),
            used_code: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &PageKey {
        &self.key
    }

    pub fn status(&self) -> LoginStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<LoginStatus> {
        self.status.subscribe()
    }

    pub fn last_marker(&self) -> Option<String> {
        self.last_marker.lock().clone()
    }

    /// Queues a login command unless one is already queued or running.
    pub fn request_login(self: &Arc<Self>, queues: &QueueSet) -> Result<LoginRequest, QueueError> {
        if self
            .flow_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(target: "session", key = %self.key, "login already in progress; request ignored");
            return Ok(LoginRequest::AlreadyInProgress);
        }

        let guard = FlowGuard(Arc::clone(self));
        let handle = queues.submit(&self.key, "login", move |page| async move {
            let session = Arc::clone(&guard.0);
            let outcome = session.run_login(page).await;
            drop(guard);
            outcome
        })?;
        Ok(LoginRequest::Queued(handle))
    }

    /// The page was logged out (logout command, device unlinked).
    pub fn mark_logged_out(&self) {
        self.transition(LoginStatus::NotLoggedIn);
    }

    /// Waits until the session reports `LoggedIn`. Returns false on expiry.
    pub async fn wait_logged_in(&self, limit: Duration) -> bool {
        let mut status = self.status.subscribe();
        let reached = timeout(limit, status.wait_for(|s| *s == LoginStatus::LoggedIn))
            .await
            .is_ok_and(|waited| waited.is_ok());
        reached
    }

    async fn run_login(&self, page: PageHandle) -> Result<LoginStatus, SessionError> {
        if self.status() == LoginStatus::LoggedIn {
            if page.exists(self.site.authenticated_marker()).await? {
                debug!(target: "session", key = %self.key, "already logged in");
                return Ok(LoginStatus::LoggedIn);
            }
            info!(target: "session", key = %self.key, "authenticated UI is gone; logging in again");
            self.transition(LoginStatus::NotLoggedIn);
        }

        self.site.open(&page).await?;
        match self.probe(&page).await? {
            Probe::Authenticated => {
                self.transition(LoginStatus::LoggedIn);
                return Ok(LoginStatus::LoggedIn);
            }
            Probe::Unauthenticated => {}
        }

        self.transition(LoginStatus::LoginInProgress);
        let deadline = Instant::now() + self.config.login_deadline();
        let confirmed = match self.site.confirmation() {
            Confirmation::ScanCode => self.confirm_scan(&page, deadline).await,
            Confirmation::MessagedCode { sender } => {
                self.confirm_messaged_code(&page, &sender, deadline).await
            }
        };

        match confirmed {
            Ok(()) => {
                self.transition(LoginStatus::LoggedIn);
                Ok(LoginStatus::LoggedIn)
            }
            Err(err) => {
                warn!(target: "session", key = %self.key, error = %err, "login attempt failed");
                self.transition(LoginStatus::NotLoggedIn);
                Err(err)
            }
        }
    }

    async fn probe(&self, page: &PageHandle) -> Result<Probe, SessionError> {
        let limit = self.config.probe_timeout();
        let authenticated = page.wait_for(self.site.authenticated_marker(), limit);
        let unauthenticated = page.wait_for(self.site.unauthenticated_marker(), limit);
        tokio::pin!(authenticated, unauthenticated);

        let mut authenticated_done = false;
        let mut unauthenticated_done = false;
        loop {
            tokio::select! {
                found = &mut authenticated, if !authenticated_done => {
                    if found? {
                        debug!(target: "session", key = %self.key, "probe: authenticated");
                        return Ok(Probe::Authenticated);
                    }
                    authenticated_done = true;
                }
                found = &mut unauthenticated, if !unauthenticated_done => {
                    if found? {
                        debug!(target: "session", key = %self.key, "probe: unauthenticated");
                        return Ok(Probe::Unauthenticated);
                    }
                    unauthenticated_done = true;
                }
                else => return Err(SessionError::SessionProbeTimeout(limit)),
            }
        }
    }

    async fn confirm_scan(&self, page: &PageHandle, deadline: Instant) -> Result<(), SessionError> {
        self.site.prepare(page).await?;
        *self.last_marker.lock() = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::LoginTimedOut(self.config.login_deadline()));
            }

            let marker = self.site.artifact_marker(page).await?;
            let changed = {
                let mut last = self.last_marker.lock();
                if marker.is_some() && *last != marker {
                    *last = marker.clone();
                    true
                } else {
                    false
                }
            };
            if changed {
                let path = self.site.capture_artifact(page).await?;
                info!(target: "session", key = %self.key, path = %path.display(), "new login code rendered");
                self.bus.publish(PilotEvent::NewQrScreenshot {
                    key: self.key.clone(),
                    path,
                });
            }

            let window = self.config.poll_timeout().min(deadline - now);
            match self.await_progress(page, marker.as_deref(), window).await? {
                Wake::Authenticated => return Ok(()),
                Wake::ArtifactChanged => {
                    debug!(target: "session", key = %self.key, "login code refreshed");
                }
                Wake::NotYet => {}
            }
        }
    }

    /// Polls for authentication or a different artifact marker within `window`.
    async fn await_progress(
        &self,
        page: &PageHandle,
        marker: Option<&str>,
        window: Duration,
    ) -> Result<Wake, SessionError> {
        let until = Instant::now() + window;
        loop {
            if page.exists(self.site.authenticated_marker()).await? {
                return Ok(Wake::Authenticated);
            }
            if self.site.artifact_marker(page).await?.as_deref() != marker {
                return Ok(Wake::ArtifactChanged);
            }
            let now = Instant::now();
            if now >= until {
                return Ok(Wake::NotYet);
            }
            sleep(self.config.poll_interval().min(until - now)).await;
        }
    }

    async fn confirm_messaged_code(
        &self,
        page: &PageHandle,
        sender: &str,
        deadline: Instant,
    ) -> Result<(), SessionError> {
        let (subscription, mut inbox) = self.bus.subscribe_channel(EventKind::MessageArrived);
        let received = match self.site.prepare(page).await {
            Ok(()) => self.await_code(&mut inbox, sender, deadline).await,
            Err(err) => Err(err.into()),
        };
        // Off the bus before the code is typed, so a late duplicate message
        // cannot start a second entry.
        self.bus.unsubscribe(subscription);
        let code = received?;

        info!(target: "session", key = %self.key, "one-time code received");
        *self.used_code.lock() = Some(code.clone());
        self.site.enter_code(page, &code).await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if page
            .wait_for(self.site.authenticated_marker(), remaining)
            .await?
        {
            Ok(())
        } else {
            Err(SessionError::LoginTimedOut(self.config.login_deadline()))
        }
    }

    async fn await_code(
        &self,
        inbox: &mut mpsc::UnboundedReceiver<PilotEvent>,
        sender: &str,
        deadline: Instant,
    ) -> Result<String, SessionError> {
        loop {
            let event = match timeout_at(deadline, inbox.recv()).await {
                Err(_) => return Err(SessionError::LoginTimedOut(self.config.login_deadline())),
                Ok(None) => return Err(SessionError::Bus(BusError::Closed)),
                Ok(Some(event)) => event,
            };
            let PilotEvent::MessageArrived { message, .. } = event else {
                continue;
            };
            if message.is_self || message.sender != sender {
                continue;
            }
            let Some(code) = extract_code(&message.body) else {
                debug!(target: "session", key = %self.key, "message from code sender had no code");
                continue;
            };
            let reused = self.used_code.lock().as_deref() == Some(code.as_str());
            if reused {
                debug!(target: "session", key = %self.key, "ignoring an already used code");
                continue;
            }
            return Ok(code);
        }
    }

    fn transition(&self, next: LoginStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.announce(next);
        }
    }

    fn settle_abandoned(&self) {
        let reset = self.status.send_if_modified(|current| {
            if *current == LoginStatus::LoginInProgress {
                *current = LoginStatus::NotLoggedIn;
                true
            } else {
                false
            }
        });
        if reset {
            warn!(target: "session", key = %self.key, "login flow stopped before confirmation");
            self.announce(LoginStatus::NotLoggedIn);
        }
    }

    fn announce(&self, status: LoginStatus) {
        info!(target: "session", key = %self.key, %status, "login status changed");
        self.bus.publish(PilotEvent::LoginStatusChanged {
            key: self.key.clone(),
            status,
        });
    }
}
