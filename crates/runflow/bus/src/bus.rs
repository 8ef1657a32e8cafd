//! Scoped publish/subscribe with isolated, concurrent handlers

use crate::errors::{BusError, BusResult};
use crate::event::Event;
use crate::pattern::TopicPattern;
use async_trait::async_trait;
use parking_lot::RwLock;
use runflow_types::Scope;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// Capacity of the observation stream returned by [`EventBus::tap`]
const TAP_CAPACITY: usize = 1024;

/// Receives events for a subscription
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> BusResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = BusResult<()>> + Send,
{
    async fn handle(&self, event: Event) -> BusResult<()> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BusResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Subscription identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    scope: Scope,
    pattern: TopicPattern,
    handler: Arc<dyn EventHandler>,
}

/// Outcome of one publish
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub matched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Bus counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub subscriptions: usize,
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub in_flight: usize,
}

struct Inner {
    subscriptions: RwLock<Vec<Subscription>>,
    accepting: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    drained: Notify,
    tap: broadcast::Sender<Event>,
}

/// Decrements the in-flight count when a publish finishes, however it ends
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(inner.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

/// In-process event bus.
///
/// Every handler matching a publish runs in its own task. A handler that
/// fails or panics is logged and counted; it never affects the others.
/// Fan-out has no ordering guarantee.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                subscriptions: RwLock::new(Vec::new()),
                accepting: AtomicBool::new(true),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
                tap,
            }),
        }
    }

    /// Register a handler for events in `scope` whose type matches `pattern`.
    ///
    /// A platform-scope (`*`) subscriber sees events from every scope.
    pub fn subscribe(
        &self,
        scope: Scope,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<SubscriptionId> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = SubscriptionId::generate();
        debug!(subscription_id = %id, scope = %scope, pattern = %pattern, "Subscribed");
        self.inner.subscriptions.write().push(Subscription {
            id: id.clone(),
            scope,
            pattern,
            handler,
        });
        Ok(id)
    }

    /// Remove a subscription; false if it was not registered
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| &s.id != id);
        before != subscriptions.len()
    }

    /// Deliver an event to every matching handler and wait for all of them
    pub async fn publish(&self, event: Event) -> BusResult<PublishReport> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        let _guard = InFlight::enter(&self.inner);
        Ok(self.dispatch(event).await)
    }

    /// Publish without waiting for handlers
    pub fn emit(&self, event: Event) -> BusResult<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(BusError::ShuttingDown);
        }
        let guard = InFlight::enter(&self.inner);
        let bus = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            bus.dispatch(event).await;
        });
        Ok(())
    }

    async fn dispatch(&self, event: Event) -> PublishReport {
        let targets: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.scope.covers(&event.scope) && s.pattern.matches(&event.event_type))
            .map(|s| (s.id.clone(), s.handler.clone()))
            .collect();

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.tap.send(event.clone());

        let mut report = PublishReport {
            matched: targets.len(),
            ..PublishReport::default()
        };
        if targets.is_empty() {
            debug!(topic = %event.event_type, scope = %event.scope, "No subscribers");
            return report;
        }

        let tasks = targets.into_iter().map(|(id, handler)| {
            let event = event.clone();
            let task = tokio::spawn(async move { handler.handle(event).await });
            async move { (id, task.await) }
        });

        for (id, outcome) in futures::future::join_all(tasks).await {
            match outcome {
                Ok(Ok(())) => report.succeeded += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(subscription_id = %id, topic = %event.event_type, error = %err, "Event handler failed");
                }
                Err(join_err) => {
                    report.failed += 1;
                    warn!(subscription_id = %id, topic = %event.event_type, error = %join_err, "Event handler panicked");
                }
            }
        }

        self.inner
            .delivered
            .fetch_add(report.succeeded as u64, Ordering::Relaxed);
        self.inner
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Observe every published event (lossy under load)
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.inner.tap.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting publishes and wait up to `grace` for in-flight
    /// handlers; true if everything drained
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.inner.drained.notified();
            let remaining = self.inner.in_flight.load(Ordering::SeqCst);
            if remaining == 0 {
                info!("Event bus drained");
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let remaining = self.inner.in_flight.load(Ordering::SeqCst);
                if remaining > 0 {
                    warn!(in_flight = remaining, "Event bus shutdown grace period elapsed");
                }
                return remaining == 0;
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscriptions: self.inner.subscriptions.read().len(),
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder(bus: &EventBus, scope: Scope, pattern: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            scope,
            pattern,
            handler_fn(move |event: Event| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(event.event_type);
                    Ok(())
                }
            }),
        )
        .unwrap();
        seen
    }

    fn event(topic: &str) -> Event {
        Event::new(Scope::tenant("acme"), topic)
    }

    #[tokio::test]
    async fn test_topic_matching() {
        let bus = EventBus::new();
        let all = recorder(&bus, Scope::platform(), "*");
        let records = recorder(&bus, Scope::platform(), "record.*");
        let exact = recorder(&bus, Scope::platform(), "workflow.started");

        for topic in ["record.before_insert", "record.after_update", "workflow.started"] {
            bus.publish(event(topic)).await.unwrap();
        }

        assert_eq!(all.lock().len(), 3);
        assert_eq!(
            *records.lock(),
            vec!["record.before_insert".to_string(), "record.after_update".to_string()]
        );
        assert_eq!(*exact.lock(), vec!["workflow.started".to_string()]);
    }

    #[tokio::test]
    async fn test_scope_filtering() {
        let bus = EventBus::new();
        let acme = recorder(&bus, Scope::tenant("acme"), "*");
        let globex = recorder(&bus, Scope::tenant("globex"), "*");
        let platform = recorder(&bus, Scope::platform(), "*");

        bus.publish(event("run.started")).await.unwrap();

        assert_eq!(acme.lock().len(), 1);
        assert!(globex.lock().is_empty());
        assert_eq!(platform.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new();
        bus.subscribe(
            Scope::platform(),
            "*",
            handler_fn(|_event| async { Err(BusError::handler("boom")) }),
        )
        .unwrap();
        bus.subscribe(
            Scope::platform(),
            "*",
            handler_fn(|event: Event| async move {
                if event.event_type == "run.started" {
                    panic!("handler panic");
                }
                Ok(())
            }),
        )
        .unwrap();
        let healthy = recorder(&bus, Scope::platform(), "*");

        let report = bus.publish(event("run.started")).await.unwrap();

        assert_eq!(report, PublishReport { matched: 3, succeeded: 1, failed: 2 });
        assert_eq!(healthy.lock().len(), 1);
        let stats = bus.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = bus
            .subscribe(
                Scope::platform(),
                "*",
                handler_fn(move |_event| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        bus.publish(event("a")).await.unwrap();
        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
        bus.publish(event("a")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capability_reply_round_trip() {
        let bus = EventBus::new();
        bus.subscribe(
            Scope::platform(),
            "http.request",
            handler_fn(|event: Event| async move {
                let url = event.payload["url"].clone();
                event.reply(Ok(json!({"status": 200, "url": url})));
                Ok(())
            }),
        )
        .unwrap();

        let (handle, rx) = crate::ReplyHandle::channel();
        bus.emit(
            event("http.request")
                .with_payload(json!({"url": "https://example.com"}))
                .with_reply(handle),
        )
        .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.unwrap()["status"], json!(200));
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_handlers() {
        let bus = EventBus::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        bus.subscribe(
            Scope::platform(),
            "*",
            handler_fn(move |_event| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        bus.emit(event("slow")).unwrap();
        assert!(bus.shutdown(Duration::from_secs(2)).await);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(bus.publish(event("late")).await, Err(BusError::ShuttingDown));
        assert!(bus.emit(event("late")).is_err());
    }

    #[tokio::test]
    async fn test_tap_observes_published_events() {
        let bus = EventBus::new();
        let mut tap = bus.tap();
        bus.publish(event("run.completed")).await.unwrap();
        assert_eq!(tap.recv().await.unwrap().event_type, "run.completed");
    }
}
