//! Typed publish/subscribe bus.
//!
//! Every subscriber owns an unbounded FIFO and a delivery task, so `publish`
//! never waits on listeners and successive events reach one subscriber in
//! publish order. Subscribers of a kind are scheduled in registration order.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pagepilot_core_types::{EventKind, PilotEvent};

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + fmt::Debug + 'static {
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

impl Event for PilotEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        PilotEvent::kind(self)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("timed out waiting for event")]
    Timeout,
    #[error("bus closed")]
    Closed,
}

/// Token returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(pub u64);

#[async_trait]
pub trait Listener<E>: Send + Sync
where
    E: Event,
{
    async fn on_event(&self, event: E);
}

/// Adapts an async closure into a [`Listener`].
pub struct FnListener<E, F> {
    func: F,
    _event: PhantomData<fn(E)>,
}

pub fn listener_fn<E, F, Fut>(func: F) -> Arc<dyn Listener<E>>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnListener {
        func,
        _event: PhantomData,
    })
}

#[async_trait]
impl<E, F, Fut> Listener<E> for FnListener<E, F>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_event(&self, event: E) {
        (self.func)(event).await
    }
}

pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    /// Schedules delivery to every subscriber of the event's kind and returns
    /// how many were scheduled.
    fn publish(&self, event: E) -> usize;

    /// Registers a listener; must be called inside a tokio runtime.
    fn subscribe(&self, kind: E::Kind, listener: Arc<dyn Listener<E>>) -> SubscriptionId;

    fn subscribe_channel(&self, kind: E::Kind) -> (SubscriptionId, mpsc::UnboundedReceiver<E>);

    /// Deregisters a subscription. Once this returns no further invocation of
    /// the listener starts, even for events already queued to it.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

struct Subscriber<E>
where
    E: Event,
{
    id: SubscriptionId,
    kind: E::Kind,
    sender: mpsc::UnboundedSender<E>,
    active: Arc<AtomicBool>,
}

/// In-memory bus used by the composition root and tests.
pub struct InMemoryBus<E>
where
    E: Event,
{
    subscribers: Mutex<Vec<Subscriber<E>>>,
    next_id: AtomicU64,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn subscriber_count(&self, kind: E::Kind) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|sub| sub.kind == kind)
            .count()
    }

    fn register(
        &self,
        kind: E::Kind,
        sender: mpsc::UnboundedSender<E>,
        active: Arc<AtomicBool>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push(Subscriber {
            id,
            kind,
            sender,
            active,
        });
        debug!(target: "event-bus", subscription = id.0, ?kind, "subscribed");
        id
    }
}

impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    fn publish(&self, event: E) -> usize {
        let kind = event.kind();
        let mut scheduled = 0;
        let mut guard = self.subscribers.lock();
        guard.retain(|sub| {
            if sub.kind != kind {
                return true;
            }
            match sub.sender.send(event.clone()) {
                Ok(()) => {
                    scheduled += 1;
                    true
                }
                Err(_) => {
                    debug!(target: "event-bus", subscription = sub.id.0, "dropping closed subscriber");
                    false
                }
            }
        });
        drop(guard);
        debug!(target: "event-bus", ?kind, scheduled, "published");
        scheduled
    }

    fn subscribe(&self, kind: E::Kind, listener: Arc<dyn Listener<E>>) -> SubscriptionId {
        let (tx, mut rx) = mpsc::unbounded_channel::<E>();
        let active = Arc::new(AtomicBool::new(true));
        let id = self.register(kind, tx, Arc::clone(&active));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !active.load(Ordering::Acquire) {
                    break;
                }
                let outcome = AssertUnwindSafe(listener.on_event(event))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    warn!(target: "event-bus", subscription = id.0, "listener panicked; event skipped");
                }
            }
        });
        id
    }

    fn subscribe_channel(&self, kind: E::Kind) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(kind, tx, Arc::new(AtomicBool::new(true)));
        (id, rx)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.subscribers.lock();
        let Some(pos) = guard.iter().position(|sub| sub.id == id) else {
            return false;
        };
        let removed = guard.remove(pos);
        drop(guard);
        removed.active.store(false, Ordering::Release);
        debug!(target: "event-bus", subscription = id.0, "unsubscribed");
        true
    }
}

impl<E, B> EventBus<E> for Arc<B>
where
    E: Event,
    B: EventBus<E> + ?Sized,
{
    fn publish(&self, event: E) -> usize {
        (**self).publish(event)
    }

    fn subscribe(&self, kind: E::Kind, listener: Arc<dyn Listener<E>>) -> SubscriptionId {
        (**self).subscribe(kind, listener)
    }

    fn subscribe_channel(&self, kind: E::Kind) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        (**self).subscribe_channel(kind)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        (**self).unsubscribe(id)
    }
}

/// Waits for the first event of `kind` that satisfies `predicate`.
///
/// The temporary subscription is removed before returning, on every path.
pub async fn wait_for<E, B, P>(
    bus: &B,
    kind: E::Kind,
    timeout: Duration,
    mut predicate: P,
) -> Result<E, BusError>
where
    E: Event,
    B: EventBus<E> + ?Sized,
    P: FnMut(&E) -> bool,
{
    let (id, mut rx) = bus.subscribe_channel(kind);
    let outcome = tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if predicate(&event) {
                return Ok(event);
            }
        }
        Err(BusError::Closed)
    })
    .await;
    bus.unsubscribe(id);
    outcome.unwrap_or(Err(BusError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepilot_core_types::{LoginStatus, ObservedMessage, PageKey};
    use std::time::Duration;
    use tokio::time::sleep;

    fn status(status: LoginStatus) -> PilotEvent {
        PilotEvent::LoginStatusChanged {
            key: PageKey::from("whatsapp"),
            status,
        }
    }

    fn message(body: &str) -> PilotEvent {
        PilotEvent::MessageArrived {
            key: PageKey::from("whatsapp"),
            message: ObservedMessage {
                sender: "Ana".into(),
                body: body.into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn publish_only_reaches_matching_kind() {
        let bus = InMemoryBus::<PilotEvent>::new();
        let (_status_id, mut status_rx) = bus.subscribe_channel(EventKind::LoginStatusChanged);
        let (_msg_id, mut msg_rx) = bus.subscribe_channel(EventKind::MessageArrived);

        assert_eq!(bus.publish(status(LoginStatus::LoggedIn)), 1);
        assert_eq!(status_rx.recv().await, Some(status(LoginStatus::LoggedIn)));
        assert!(msg_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listener_sees_events_in_publish_order() {
        let bus = InMemoryBus::<PilotEvent>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            EventKind::MessageArrived,
            listener_fn(move |event: PilotEvent| {
                let sink = Arc::clone(&sink);
                async move {
                    // Slow listener; publish must not wait on it.
                    sleep(Duration::from_millis(5)).await;
                    if let PilotEvent::MessageArrived { message, .. } = event {
                        sink.lock().push(message.body);
                    }
                }
            }),
        );

        for i in 0..10 {
            bus.publish(message(&i.to_string()));
        }
        sleep(Duration::from_millis(200)).await;
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let bus = InMemoryBus::<PilotEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = bus.subscribe(
            EventKind::LoginStatusChanged,
            listener_fn(move |_event: PilotEvent| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        bus.publish(status(LoginStatus::LoginInProgress));
        sleep(Duration::from_millis(20)).await;
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(status(LoginStatus::LoggedIn)), 0);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_may_unsubscribe_itself() {
        let bus = InMemoryBus::<PilotEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let bus_ref = Arc::clone(&bus);
        let slot_ref = Arc::clone(&slot);
        let counter = Arc::clone(&count);
        let id = bus.subscribe(
            EventKind::LoginStatusChanged,
            listener_fn(move |_event: PilotEvent| {
                let bus = Arc::clone(&bus_ref);
                let slot = Arc::clone(&slot_ref);
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(id) = slot.lock().take() {
                        bus.unsubscribe(id);
                    }
                }
            }),
        );
        *slot.lock() = Some(id);

        bus.publish(status(LoginStatus::LoginInProgress));
        bus.publish(status(LoginStatus::LoggedIn));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::LoginStatusChanged), 0);
    }

    #[tokio::test]
    async fn panicking_listener_keeps_receiving() {
        let bus = InMemoryBus::<PilotEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        bus.subscribe(
            EventKind::MessageArrived,
            listener_fn(move |event: PilotEvent| {
                let counter = Arc::clone(&counter);
                async move {
                    if let PilotEvent::MessageArrived { message, .. } = &event {
                        if message.body == "boom" {
                            panic!("listener failure");
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        bus.publish(message("boom"));
        bus.publish(message("ok"));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_times_out_and_cleans_up() {
        let bus = InMemoryBus::<PilotEvent>::new();
        let result = wait_for::<PilotEvent, _, _>(
            &bus,
            EventKind::LoginStatusChanged,
            Duration::from_millis(20),
            |_| true,
        )
        .await;
        assert_eq!(result, Err(BusError::Timeout));
        assert_eq!(bus.subscriber_count(EventKind::LoginStatusChanged), 0);
    }

    #[tokio::test]
    async fn wait_for_returns_matching_event() {
        let bus = InMemoryBus::<PilotEvent>::new();
        let publisher = Arc::clone(&bus);
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            publisher.publish(status(LoginStatus::LoginInProgress));
            publisher.publish(status(LoginStatus::LoggedIn));
        });
        let event = wait_for::<PilotEvent, _, _>(
            &bus,
            EventKind::LoginStatusChanged,
            Duration::from_secs(1),
            |event| {
                matches!(
                    event,
                    PilotEvent::LoginStatusChanged {
                        status: LoginStatus::LoggedIn,
                        ..
                    }
                )
            },
        )
        .await
        .unwrap();
        assert_eq!(event, status(LoginStatus::LoggedIn));
    }
}
