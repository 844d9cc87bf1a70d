use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use page_broker::memory::{MemoryContext, MemoryPage};
use page_broker::{PageBroker, PageDriver, PageError, PageHandle};
use pagepilot_core_types::{EventKind, LoginStatus, ObservedMessage, PageKey, PilotEvent};
use pagepilot_event_bus::{EventBus, InMemoryBus};
use pagepilot_scheduler::{QueueConfig, QueueSet};
use pagepilot_session::{Confirmation, LoginRequest, LoginSite, Session, SessionConfig, SessionError};
use tokio::time::{sleep, timeout};

struct QrSite {
    dir: PathBuf,
}

#[async_trait]
impl LoginSite for QrSite {
    fn authenticated_marker(&self) -> &str {
        "#chats"
    }

    fn unauthenticated_marker(&self) -> &str {
        "#qr"
    }

    fn confirmation(&self) -> Confirmation {
        Confirmation::ScanCode
    }

    async fn open(&self, page: &PageHandle) -> Result<(), PageError> {
        page.goto("https://chat.test/").await
    }

    async fn artifact_marker(&self, page: &PageHandle) -> Result<Option<String>, PageError> {
        page.attribute("#qr", "data-ref").await
    }

    async fn capture_artifact(&self, page: &PageHandle) -> Result<PathBuf, PageError> {
        let path = self.dir.join("qr.png");
        page.screenshot_element("#qr", &path).await?;
        Ok(path)
    }
}

struct CodeSite;

#[async_trait]
impl LoginSite for CodeSite {
    fn authenticated_marker(&self) -> &str {
        "#dashboard"
    }

    fn unauthenticated_marker(&self) -> &str {
        "#login-form"
    }

    fn confirmation(&self) -> Confirmation {
        Confirmation::MessagedCode {
            sender: "DeclaraGuate".into(),
        }
    }

    async fn open(&self, page: &PageHandle) -> Result<(), PageError> {
        page.goto("https://portal.test/login").await
    }

    async fn prepare(&self, page: &PageHandle) -> Result<(), PageError> {
        page.type_text("#user", "ana").await?;
        page.click("#submit").await
    }

    async fn enter_code(&self, page: &PageHandle, code: &str) -> Result<(), PageError> {
        page.type_text("#otp", code).await?;
        page.click("#verify").await
    }
}

struct Harness {
    queues: Arc<QueueSet>,
    bus: Arc<InMemoryBus<PilotEvent>>,
    page: Arc<MemoryPage>,
    session: Arc<Session>,
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        probe_timeout_ms: 1_000,
        poll_timeout_ms: 60,
        poll_interval_ms: 10,
        login_deadline_ms: 5_000,
    }
}

async fn harness(site: Arc<dyn LoginSite>, config: SessionConfig) -> Harness {
    harness_with_queue(site, config, QueueConfig::default()).await
}

async fn harness_with_queue(
    site: Arc<dyn LoginSite>,
    config: SessionConfig,
    queue: QueueConfig,
) -> Harness {
    let key = PageKey::new("whatsapp");
    let context = MemoryContext::new();
    let broker = PageBroker::new(Duration::from_secs(1));
    broker.attach(context.clone());
    broker.get_page(&key).await.unwrap();
    let page = context.page(&key).unwrap();

    let queues = QueueSet::new(broker, queue);
    let bus = InMemoryBus::<PilotEvent>::new();
    let session = Session::new(key, site, bus.clone(), config);
    Harness {
        queues,
        bus,
        page,
        session,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn statuses_seen(inbox: &mut tokio::sync::mpsc::UnboundedReceiver<PilotEvent>) -> Vec<LoginStatus> {
    let mut seen = Vec::new();
    while let Ok(event) = inbox.try_recv() {
        if let PilotEvent::LoginStatusChanged { status, .. } = event {
            seen.push(status);
        }
    }
    seen
}

fn gotos(page: &MemoryPage) -> usize {
    page.actions()
        .iter()
        .filter(|action| action.starts_with("goto"))
        .count()
}

fn queued(request: LoginRequest) -> pagepilot_scheduler::CommandHandle<LoginStatus> {
    match request {
        LoginRequest::Queued(handle) => handle,
        LoginRequest::AlreadyInProgress => panic!("expected a queued login"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_code_is_not_re_announced() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        Arc::new(QrSite {
            dir: dir.path().to_path_buf(),
        }),
        fast_config(),
    )
    .await;
    h.page.show("#qr");
    h.page.set_attribute("#qr", "data-ref", "ref1");
    let (_, mut screenshots) = h.bus.subscribe_channel(EventKind::NewQrScreenshot);

    let handle = queued(h.session.request_login(&h.queues).unwrap());

    let first = timeout(Duration::from_secs(2), screenshots.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, PilotEvent::NewQrScreenshot { ref path, .. } if path.ends_with("qr.png")));

    // Several iterations observe ref1 again.
    sleep(Duration::from_millis(200)).await;
    assert!(screenshots.try_recv().is_err());

    h.page.set_attribute("#qr", "data-ref", "ref2");
    timeout(Duration::from_secs(2), screenshots.recv())
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(150)).await;

    h.page.show("#chats");
    assert_eq!(handle.await.unwrap(), LoginStatus::LoggedIn);
    assert!(screenshots.try_recv().is_err());

    let captured = h
        .page
        .actions()
        .iter()
        .filter(|action| action.starts_with("screenshot"))
        .count();
    assert_eq!(captured, 2);
    assert_eq!(h.session.last_marker().as_deref(), Some("ref2"));
    assert!(dir.path().join("qr.png").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_request_during_login_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        Arc::new(QrSite {
            dir: dir.path().to_path_buf(),
        }),
        fast_config(),
    )
    .await;
    h.page.show("#qr");
    h.page.set_attribute("#qr", "data-ref", "ref1");
    let (_, mut statuses) = h.bus.subscribe_channel(EventKind::LoginStatusChanged);

    let handle = queued(h.session.request_login(&h.queues).unwrap());
    let mut watch = h.session.watch_status();
    timeout(
        Duration::from_secs(2),
        watch.wait_for(|s| *s == LoginStatus::LoginInProgress),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(
        h.session.request_login(&h.queues).unwrap(),
        LoginRequest::AlreadyInProgress
    ));
    assert_eq!(h.queues.pending(h.session.key()), 1);

    h.page.show("#chats");
    assert_eq!(handle.await.unwrap(), LoginStatus::LoggedIn);
    assert!(h.session.wait_logged_in(Duration::from_millis(10)).await);

    assert_eq!(
        statuses_seen(&mut statuses),
        vec![LoginStatus::LoginInProgress, LoginStatus::LoggedIn]
    );

    // Already logged in and the chats still show: no navigation, no new flow.
    let again = queued(h.session.request_login(&h.queues).unwrap());
    assert_eq!(again.await.unwrap(), LoginStatus::LoggedIn);
    assert!(statuses.try_recv().is_err());
    assert_eq!(gotos(&h.page), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_authenticated_ui_starts_a_fresh_login() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        Arc::new(QrSite {
            dir: dir.path().to_path_buf(),
        }),
        fast_config(),
    )
    .await;
    h.page.show("#chats");
    queued(h.session.request_login(&h.queues).unwrap())
        .await
        .unwrap();

    let (_, mut statuses) = h.bus.subscribe_channel(EventKind::LoginStatusChanged);
    h.page.hide("#chats");
    h.page.show("#qr");
    h.page.set_attribute("#qr", "data-ref", "ref9");
    let handle = queued(h.session.request_login(&h.queues).unwrap());
    let session = h.session.clone();
    wait_until(|| session.status() == LoginStatus::LoginInProgress).await;

    h.page.show("#chats");
    assert_eq!(handle.await.unwrap(), LoginStatus::LoggedIn);
    assert_eq!(
        statuses_seen(&mut statuses),
        vec![
            LoginStatus::NotLoggedIn,
            LoginStatus::LoginInProgress,
            LoginStatus::LoggedIn
        ]
    );
    assert_eq!(gotos(&h.page), 2);
}

#[tokio::test]
async fn queue_timeout_mid_confirmation_leaves_no_login_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with_queue(
        Arc::new(QrSite {
            dir: dir.path().to_path_buf(),
        }),
        fast_config(),
        QueueConfig {
            command_timeout_ms: Some(200),
        },
    )
    .await;
    h.page.show("#qr");
    h.page.set_attribute("#qr", "data-ref", "ref1");
    let (_, mut statuses) = h.bus.subscribe_channel(EventKind::LoginStatusChanged);

    let err = queued(h.session.request_login(&h.queues).unwrap())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));
    assert_eq!(h.session.status(), LoginStatus::NotLoggedIn);
    assert_eq!(
        statuses_seen(&mut statuses),
        vec![LoginStatus::LoginInProgress, LoginStatus::NotLoggedIn]
    );

    // The flow flag was released with it.
    let retry = h.session.request_login(&h.queues).unwrap();
    assert!(matches!(retry, LoginRequest::Queued(_)));
}

#[tokio::test]
async fn probe_timeout_aborts_and_allows_retry() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        probe_timeout_ms: 100,
        ..fast_config()
    };
    let h = harness(
        Arc::new(QrSite {
            dir: dir.path().to_path_buf(),
        }),
        config,
    )
    .await;

    let err = queued(h.session.request_login(&h.queues).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err.cause::<SessionError>(),
        Some(SessionError::SessionProbeTimeout(_))
    ));
    assert_eq!(h.session.status(), LoginStatus::NotLoggedIn);

    h.page.show("#chats");
    let retried = queued(h.session.request_login(&h.queues).unwrap());
    assert_eq!(retried.await.unwrap(), LoginStatus::LoggedIn);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messaged_code_is_typed_after_unsubscribing() {
    let h = harness(Arc::new(CodeSite), fast_config()).await;
    for selector in ["#login-form", "#user", "#submit", "#otp", "#verify"] {
        h.page.show(selector);
    }

    let handle = queued(h.session.request_login(&h.queues).unwrap());
    let bus = h.bus.clone();
    wait_until(|| bus.subscriber_count(EventKind::MessageArrived) == 1).await;

    let message = |sender: &str, body: &str| PilotEvent::MessageArrived {
        key: PageKey::new("whatsapp"),
        message: ObservedMessage {
            sender: sender.into(),
            body: body.into(),
            time_text: "10:00".into(),
            ..Default::default()
        },
    };
    h.bus.publish(message("Ana", "mi pin es 1111"));
    h.bus.publish(message("DeclaraGuate", "Bienvenido"));
    h.bus.publish(message("DeclaraGuate", "Su codigo es 482913"));

    let page = h.page.clone();
    wait_until(|| page.actions().iter().any(|a| a == "click #verify")).await;
    assert_eq!(h.bus.subscriber_count(EventKind::MessageArrived), 0);
    assert!(h.page.actions().contains(&"type #otp 482913".to_string()));
    assert!(!h.page.actions().iter().any(|a| a.contains("1111")));

    h.page.show("#dashboard");
    assert_eq!(handle.await.unwrap(), LoginStatus::LoggedIn);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn code_from_a_previous_attempt_is_not_entered_again() {
    let config = SessionConfig {
        login_deadline_ms: 700,
        ..fast_config()
    };
    let h = harness(Arc::new(CodeSite), config).await;
    for selector in ["#login-form", "#user", "#submit", "#otp", "#verify"] {
        h.page.show(selector);
    }
    let code = |body: &str| PilotEvent::MessageArrived {
        key: PageKey::new("whatsapp"),
        message: ObservedMessage {
            sender: "DeclaraGuate".into(),
            body: body.into(),
            time_text: "10:00".into(),
            ..Default::default()
        },
    };

    // First attempt: the code is typed but the portal never confirms.
    let first = queued(h.session.request_login(&h.queues).unwrap());
    let bus = h.bus.clone();
    wait_until(|| bus.subscriber_count(EventKind::MessageArrived) == 1).await;
    h.bus.publish(code("Su codigo es 482913"));
    assert!(first.await.is_err());
    assert_eq!(h.session.status(), LoginStatus::NotLoggedIn);

    // Second attempt: the old message is re-reported before the new one.
    let second = queued(h.session.request_login(&h.queues).unwrap());
    wait_until(|| bus.subscriber_count(EventKind::MessageArrived) == 1).await;
    h.bus.publish(code("Su codigo es 482913"));
    h.bus.publish(code("Su codigo es 551177"));
    let page = h.page.clone();
    wait_until(|| page.actions().contains(&"type #otp 551177".to_string())).await;
    let typed_old = h
        .page
        .actions()
        .iter()
        .filter(|action| action.as_str() == "type #otp 482913")
        .count();
    assert_eq!(typed_old, 1);

    h.page.show("#dashboard");
    assert_eq!(second.await.unwrap(), LoginStatus::LoggedIn);
}

#[tokio::test]
async fn missing_code_times_out_back_to_not_logged_in() {
    let config = SessionConfig {
        login_deadline_ms: 150,
        ..fast_config()
    };
    let h = harness(Arc::new(CodeSite), config).await;
    for selector in ["#login-form", "#user", "#submit"] {
        h.page.show(selector);
    }

    let err = queued(h.session.request_login(&h.queues).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err.cause::<SessionError>(),
        Some(SessionError::LoginTimedOut(_))
    ));
    assert_eq!(h.session.status(), LoginStatus::NotLoggedIn);
    assert_eq!(h.bus.subscriber_count(EventKind::MessageArrived), 0);
}

#[tokio::test]
async fn mark_logged_out_publishes_transition() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        Arc::new(QrSite {
            dir: dir.path().to_path_buf(),
        }),
        fast_config(),
    )
    .await;
    h.page.show("#chats");
    queued(h.session.request_login(&h.queues).unwrap())
        .await
        .unwrap();

    let (_, mut statuses) = h.bus.subscribe_channel(EventKind::LoginStatusChanged);
    h.session.mark_logged_out();
    h.session.mark_logged_out();
    assert_eq!(h.session.status(), LoginStatus::NotLoggedIn);
    assert!(matches!(
        statuses.try_recv(),
        Ok(PilotEvent::LoginStatusChanged {
            status: LoginStatus::NotLoggedIn,
            ..
        })
    ));
    assert!(statuses.try_recv().is_err());
    assert!(!h.session.wait_logged_in(Duration::from_millis(20)).await);
}
