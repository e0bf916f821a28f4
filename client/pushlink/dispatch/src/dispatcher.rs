//! Ordered event delivery.
//!
//! Every registered listener gets its own unbounded queue and a dedicated
//! worker task, so enqueueing never stalls the network-reading path and no
//! two events for the same listener execute concurrently. Per listener,
//! events are observed in exactly the order they were posted.
//!
//! Removal is immediate for not-yet-delivered events: the worker re-checks
//! the listener's alive flag before each delivery and drops anything queued
//! behind the removal. A listener added mid-stream only observes events
//! posted after its registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{ClientEvent, Event, MessageEvent, SubscriptionEvent};
use crate::listener::{ClientListener, MessageListener, SubscriptionListener};

/// Opaque registration key, used to remove a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Client,
    Subscription(u64),
    Message(u64),
}

impl Scope {
    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Scope::Client, Event::Client(_)) => true,
            (Scope::Subscription(id), Event::Subscription { sub_id, .. }) => id == sub_id,
            (Scope::Message(p), Event::Message { prog, .. }) => p == prog,
            _ => false,
        }
    }
}

struct Registration {
    scope: Scope,
    tx: mpsc::UnboundedSender<Event>,
    alive: Arc<AtomicBool>,
}

struct Inner {
    listeners: DashMap<u64, Registration>,
    next_key: AtomicU64,
}

/// Routes posted events to matching listeners, serialized per listener.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// A dispatcher with no listeners.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: DashMap::new(),
                next_key: AtomicU64::new(1),
            }),
        }
    }

    fn register(&self, scope: Scope) -> (ListenerKey, mpsc::UnboundedReceiver<Event>, Arc<AtomicBool>) {
        let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        self.inner.listeners.insert(
            key,
            Registration {
                scope,
                tx,
                alive: Arc::clone(&alive),
            },
        );
        (ListenerKey(key), rx, alive)
    }

    /// Attach a client listener; it observes only events posted after this
    /// call.
    pub fn add_client_listener(&self, listener: Arc<dyn ClientListener>) -> ListenerKey {
        let (key, mut rx, alive) = self.register(Scope::Client);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if let Event::Client(ev) = event {
                    deliver_client(listener.as_ref(), &ev);
                }
            }
        });
        key
    }

    /// Attach a subscription listener for one subscription id.
    pub fn add_subscription_listener(
        &self,
        sub_id: u64,
        listener: Arc<dyn SubscriptionListener>,
    ) -> ListenerKey {
        let (key, mut rx, alive) = self.register(Scope::Subscription(sub_id));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if let Event::Subscription { event: ev, .. } = event {
                    deliver_subscription(listener.as_ref(), &ev);
                }
            }
        });
        key
    }

    /// Attach a message listener for one message progressive number.
    ///
    /// Message outcomes are terminal, so the registration retires itself
    /// after delivering one.
    pub fn add_message_listener(
        &self,
        prog: u64,
        listener: Arc<dyn MessageListener>,
    ) -> ListenerKey {
        let (key, mut rx, alive) = self.register(Scope::Message(prog));
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if let Event::Message { event: ev, .. } = event {
                    let terminal = ev.is_terminal();
                    deliver_message(listener.as_ref(), &ev);
                    if terminal {
                        retire(&inner, key);
                        break;
                    }
                }
            }
        });
        key
    }

    /// Detach a listener. Effective immediately: events already queued but
    /// not yet delivered are dropped.
    pub fn remove(&self, key: ListenerKey) {
        if let Some((_, registration)) = self.inner.listeners.remove(&key.0) {
            registration.alive.store(false, Ordering::SeqCst);
            debug!("listener {:?} removed", key);
        }
    }

    /// Post one event; never blocks. The matching listener set is
    /// snapshotted before fan-out so delivery is independent of concurrent
    /// registration changes.
    pub fn post(&self, event: Event) {
        let targets: Vec<mpsc::UnboundedSender<Event>> = self
            .inner
            .listeners
            .iter()
            .filter(|entry| entry.scope.matches(&event))
            .map(|entry| entry.tx.clone())
            .collect();

        for tx in targets {
            tx.send(event.clone()).ok();
        }
    }

    /// Number of live registrations (test observability).
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn retire(inner: &Weak<Inner>, key: ListenerKey) {
    if let Some(inner) = inner.upgrade() {
        inner.listeners.remove(&key.0);
    }
}

fn deliver_client(listener: &dyn ClientListener, event: &ClientEvent) {
    match event {
        ClientEvent::StatusChange(status) => listener.on_status_change(status),
        ClientEvent::ServerError { code, message } => listener.on_server_error(*code, message),
        ClientEvent::PropertyChange(property) => listener.on_property_change(property),
    }
}

fn deliver_subscription(listener: &dyn SubscriptionListener, event: &SubscriptionEvent) {
    match event {
        SubscriptionEvent::Subscribed => listener.on_subscribed(),
        SubscriptionEvent::Unsubscribed => listener.on_unsubscribed(),
        SubscriptionEvent::Update(update) => listener.on_item_update(update),
        SubscriptionEvent::LostUpdates { item, lost } => {
            listener.on_item_lost_updates(item, *lost)
        }
        SubscriptionEvent::EndOfSnapshot { item } => listener.on_end_of_snapshot(item),
        SubscriptionEvent::ClearSnapshot { item } => listener.on_clear_snapshot(item),
        SubscriptionEvent::Error { code, message } => {
            listener.on_subscription_error(*code, message)
        }
        SubscriptionEvent::Configuration { max_frequency } => {
            listener.on_configuration(max_frequency)
        }
    }
}

fn deliver_message(listener: &dyn MessageListener, event: &MessageEvent) {
    match event {
        MessageEvent::Processed => listener.on_processed(),
        MessageEvent::Denied { code, message } => listener.on_denied(*code, message),
        MessageEvent::Aborted => listener.on_abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ClientListener for Recorder {
        fn on_status_change(&self, status: &str) {
            self.seen.lock().unwrap().push(status.to_string());
        }
    }

    impl SubscriptionListener for Recorder {
        fn on_subscribed(&self) {
            self.seen.lock().unwrap().push("subscribed".to_string());
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_listener_order_preserved() {
        let dispatcher = Dispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_client_listener(recorder.clone());

        for i in 0..100 {
            dispatcher.post(Event::Client(ClientEvent::StatusChange(format!("S{}", i))));
        }

        settle().await;
        let seen = recorder.seen();
        assert_eq!(seen.len(), 100);
        for (i, status) in seen.iter().enumerate() {
            assert_eq!(status, &format!("S{}", i));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scope_routing() {
        let dispatcher = Dispatcher::new();
        let sub_a = Arc::new(Recorder::default());
        let sub_b = Arc::new(Recorder::default());
        dispatcher.add_subscription_listener(1, sub_a.clone());
        dispatcher.add_subscription_listener(2, sub_b.clone());

        dispatcher.post(Event::Subscription {
            sub_id: 1,
            event: SubscriptionEvent::Subscribed,
        });

        settle().await;
        assert_eq!(sub_a.seen(), vec!["subscribed"]);
        assert!(sub_b.seen().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removal_drops_undelivered_events() {
        struct Gated {
            entered: std_mpsc::Sender<()>,
            gate: Mutex<std_mpsc::Receiver<()>>,
            seen: Mutex<Vec<String>>,
        }

        impl ClientListener for Gated {
            fn on_status_change(&self, status: &str) {
                self.entered.send(()).unwrap();
                self.gate.lock().unwrap().recv().unwrap();
                self.seen.lock().unwrap().push(status.to_string());
            }
        }

        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let listener = Arc::new(Gated {
            entered: entered_tx,
            gate: Mutex::new(release_rx),
            seen: Mutex::new(Vec::new()),
        });

        let dispatcher = Dispatcher::new();
        let key = dispatcher.add_client_listener(listener.clone());

        dispatcher.post(Event::Client(ClientEvent::StatusChange("first".to_string())));
        dispatcher.post(Event::Client(ClientEvent::StatusChange("second".to_string())));

        // Wait until "first" is mid-delivery, then remove while "second" is
        // still queued.
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        dispatcher.remove(key);
        release_tx.send(()).unwrap();
        release_tx.send(()).ok();

        settle().await;
        assert_eq!(listener.seen.lock().unwrap().clone(), vec!["first"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_listener_added_mid_stream_sees_only_later_events() {
        let dispatcher = Dispatcher::new();
        let early = Arc::new(Recorder::default());
        dispatcher.add_client_listener(early.clone());

        dispatcher.post(Event::Client(ClientEvent::StatusChange("one".to_string())));

        let late = Arc::new(Recorder::default());
        dispatcher.add_client_listener(late.clone());

        dispatcher.post(Event::Client(ClientEvent::StatusChange("two".to_string())));

        settle().await;
        assert_eq!(early.seen(), vec!["one", "two"]);
        assert_eq!(late.seen(), vec!["two"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_message_listener_retires_after_terminal_outcome() {
        #[derive(Default)]
        struct Outcome {
            seen: Mutex<Vec<String>>,
        }
        impl MessageListener for Outcome {
            fn on_processed(&self) {
                self.seen.lock().unwrap().push("processed".to_string());
            }
            fn on_abort(&self) {
                self.seen.lock().unwrap().push("aborted".to_string());
            }
        }

        let dispatcher = Dispatcher::new();
        let outcome = Arc::new(Outcome::default());
        dispatcher.add_message_listener(5, outcome.clone());
        assert_eq!(dispatcher.listener_count(), 1);

        dispatcher.post(Event::Message {
            prog: 5,
            event: MessageEvent::Processed,
        });
        settle().await;

        // Exactly one terminal outcome, then the registration is gone and
        // later events for the same progressive are dropped.
        assert_eq!(dispatcher.listener_count(), 0);
        dispatcher.post(Event::Message {
            prog: 5,
            event: MessageEvent::Aborted,
        });
        settle().await;
        assert_eq!(outcome.seen.lock().unwrap().clone(), vec!["processed"]);
    }
}
