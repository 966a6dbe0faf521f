//! Subjects: per-type broadcast channels with isolated subscribers.

use std::any::{type_name, Any, TypeId};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, SelectAll, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, warn};

use crate::error::SubscriberError;
use crate::sync::lock;

/// Callback invoked inline, on the notifying thread, for each delivery.
pub type SubscriberFn<T> =
    Box<dyn Fn(&Arc<T>) -> Result<(), SubscriberError> + Send + Sync>;

enum Sink<T: ?Sized> {
    Callback(SubscriberFn<T>),
    Channel(mpsc::UnboundedSender<Arc<T>>),
    Bounded(mpsc::Sender<Arc<T>>),
}

enum Delivery {
    Delivered,
    /// Bounded buffer full; this one value is dropped, the observer stays.
    Lagged,
    /// Subscriber failed or went away; it is removed from the subject.
    Failed(SubscriberError),
}

impl<T: ?Sized> Sink<T> {
    fn deliver(&self, event: &Arc<T>) -> Delivery {
        match self {
            Self::Callback(f) => match f(event) {
                Ok(()) => Delivery::Delivered,
                Err(e) => Delivery::Failed(e),
            },
            Self::Channel(tx) => match tx.send(Arc::clone(event)) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Failed("stream receiver dropped".into()),
            },
            Self::Bounded(tx) => match tx.try_send(Arc::clone(event)) {
                Ok(()) => Delivery::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => Delivery::Lagged,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Delivery::Failed("stream receiver dropped".into())
                }
            },
        }
    }
}

struct Entry<T: ?Sized> {
    id: u64,
    sink: Arc<Sink<T>>,
    failure: Arc<OnceLock<SubscriberError>>,
}

fn ingest_concrete<T: Any + Send + Sync>(
    value: Box<dyn Any + Send + Sync>,
) -> Option<Arc<T>> {
    value.downcast::<T>().ok().map(Arc::from)
}

/// Broadcast channel for one observed event type.
///
/// Created lazily on first observe and kept for the bus lifetime. Push is
/// synchronous and runs subscriber code inline on the caller's thread; the
/// subscriber list is snapshotted first, so subscribers may re-entrantly
/// subscribe or unsubscribe.
pub struct Subject<T: ?Sized> {
    subscribers: Mutex<Vec<Entry<T>>>,
    next_id: AtomicU64,
    /// Set only when `T` is a concrete type; turns structurally converted
    /// values back into typed events. Capability subjects cannot ingest.
    ingest: Option<fn(Box<dyn Any + Send + Sync>) -> Option<Arc<T>>>,
    warn_on_failure: bool,
}

impl<T: Any + Send + Sync> Subject<T> {
    pub(crate) fn for_concrete(warn_on_failure: bool) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            ingest: Some(ingest_concrete::<T>),
            warn_on_failure,
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Subject<T> {
    pub(crate) fn for_capability(warn_on_failure: bool) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            ingest: None,
            warn_on_failure,
        }
    }

    /// Attach a callback subscriber.
    pub(crate) fn subscribe(self: &Arc<Self>, f: SubscriberFn<T>) -> Subscription {
        self.attach(Sink::Callback(f))
    }

    /// Attach a channel subscriber, returning its stream half.
    pub(crate) fn channel(
        self: &Arc<Self>,
        capacity: Option<usize>,
    ) -> (BoxStream<'static, Arc<T>>, Subscription) {
        match capacity {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let subscription = self.attach(Sink::Channel(tx));
                (UnboundedReceiverStream::new(rx).boxed(), subscription)
            }
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let subscription = self.attach(Sink::Bounded(tx));
                (ReceiverStream::new(rx).boxed(), subscription)
            }
        }
    }

    /// Deliver one event to every current subscriber.
    ///
    /// A failing subscriber is removed and its error routed to its own
    /// subscription; delivery to the others continues. No ordering is
    /// guaranteed among independent subscribers.
    pub(crate) fn push(&self, event: &Arc<T>) {
        let snapshot: Vec<(u64, Arc<Sink<T>>, Arc<OnceLock<SubscriberError>>)> = lock(
            &self.subscribers,
        )
        .iter()
        .map(|entry| (entry.id, Arc::clone(&entry.sink), Arc::clone(&entry.failure)))
        .collect();

        let mut failed = Vec::new();
        for (id, sink, failure) in snapshot {
            match sink.deliver(event) {
                Delivery::Delivered => {}
                Delivery::Lagged => {
                    warn!(
                        event_type = type_name::<T>(),
                        subscriber_id = id,
                        "Stream buffer full; event dropped for lagging observer"
                    );
                }
                Delivery::Failed(error) => {
                    if self.warn_on_failure {
                        warn!(
                            event_type = type_name::<T>(),
                            subscriber_id = id,
                            error = %error,
                            "Subscriber failed; removing it"
                        );
                    } else {
                        debug!(
                            event_type = type_name::<T>(),
                            subscriber_id = id,
                            error = %error,
                            "Subscriber failed; removing it"
                        );
                    }
                    let _ = failure.set(error);
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            lock(&self.subscribers).retain(|entry| !failed.contains(&entry.id));
        }
    }

    fn attach(self: &Arc<Self>, sink: Sink<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let failure = Arc::new(OnceLock::new());
        lock(&self.subscribers).push(Entry {
            id,
            sink: Arc::new(sink),
            failure: Arc::clone(&failure),
        });
        let weak = Arc::downgrade(self);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(subject) = weak.upgrade() {
                    subject.remove(id);
                }
            })),
            failure,
        }
    }

    fn remove(&self, id: u64) {
        lock(&self.subscribers).retain(|entry| entry.id != id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Erased view of a subject, used by the compatibility index.
pub(crate) trait AnySubject: Send + Sync + 'static {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn observed_type(&self) -> TypeId;
    fn observed_name(&self) -> &'static str;
    /// Whether structurally converted values can be delivered here.
    fn accepts_converted(&self) -> bool;
    /// Deliver a structurally converted value. Returns false when the
    /// subject observes a capability type or the value has the wrong type.
    fn push_converted(&self, value: Box<dyn Any + Send + Sync>) -> bool;
}

impl<T: ?Sized + Send + Sync + 'static> AnySubject for Subject<T> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn observed_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn observed_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn accepts_converted(&self) -> bool {
        self.ingest.is_some()
    }

    fn push_converted(&self, value: Box<dyn Any + Send + Sync>) -> bool {
        let Some(ingest) = self.ingest else {
            return false;
        };
        let Some(event) = ingest(value) else {
            return false;
        };
        self.push(&event);
        true
    }
}

/// Disposal handle removing exactly one observer from its subject.
///
/// Dropping the handle unsubscribes. The subject itself lives on for the
/// bus lifetime.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
    failure: Arc<OnceLock<SubscriberError>>,
}

impl Subscription {
    /// The error that detached this subscriber, if it has failed.
    pub fn failure(&self) -> Option<&SubscriberError> {
        self.failure.get()
    }

    /// Remove the observer now instead of on drop.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

/// Merged stream of one observed type: the subject's own channel plus any
/// external producers. Dropping the stream tears down every underlying
/// subscription.
pub struct EventStream<T: ?Sized> {
    inner: SelectAll<BoxStream<'static, Arc<T>>>,
    subscription: Subscription,
}

impl<T: ?Sized> EventStream<T> {
    pub(crate) fn merge(
        streams: Vec<BoxStream<'static, Arc<T>>>,
        subscription: Subscription,
    ) -> Self {
        Self {
            inner: stream::select_all(streams),
            subscription,
        }
    }

    /// The error that detached the subject subscription, if any.
    pub fn failure(&self) -> Option<&SubscriberError> {
        self.subscription.failure()
    }
}

impl<T: ?Sized> Stream for EventStream<T> {
    type Item = Arc<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct Tick(u32);

    fn subject() -> Arc<Subject<Tick>> {
        Arc::new(Subject::for_concrete(true))
    }

    #[test]
    fn test_push_reaches_all_subscribers() {
        let subject = subject();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let _a = subject.subscribe(Box::new(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let c2 = Arc::clone(&count);
        let _b = subject.subscribe(Box::new(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        subject.push(&Arc::new(Tick(1)));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_subscriber_is_removed_and_isolated() {
        let subject = subject();
        let good = Arc::new(AtomicUsize::new(0));
        let bad = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&bad);
        let failing = subject.subscribe(Box::new(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
            Err("intentional failure".into())
        }));
        let g = Arc::clone(&good);
        let _ok = subject.subscribe(Box::new(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        subject.push(&Arc::new(Tick(1)));
        subject.push(&Arc::new(Tick(2)));

        assert_eq!(bad.load(Ordering::SeqCst), 1);
        assert_eq!(good.load(Ordering::SeqCst), 2);
        assert!(failing.failure().is_some());
    }

    #[test]
    fn test_drop_subscription_unsubscribes() {
        let subject = subject();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let subscription = subject.subscribe(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        subject.push(&Arc::new(Tick(1)));
        drop(subscription);
        subject.push(&Arc::new(Tick(2)));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[test]
    fn test_reentrant_subscribe_does_not_deadlock() {
        let subject = subject();
        let inner = Arc::clone(&subject);
        let extra: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&extra);

        let _outer = subject.subscribe(Box::new(move |_| {
            let added = inner.subscribe(Box::new(|_| Ok(())));
            lock(&slot).push(added);
            Ok(())
        }));

        subject.push(&Arc::new(Tick(1)));
        assert_eq!(subject.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_channel_subscriber_receives_stream() {
        let subject = subject();
        let (mut stream, _subscription) = subject.channel(None);

        subject.push(&Arc::new(Tick(7)));
        let got = stream.next().await.unwrap();
        assert_eq!(got.0, 7);
    }

    #[test]
    fn test_bounded_channel_lag_drops_value_but_keeps_subscriber() {
        let subject = subject();
        let (_stream, _subscription) = subject.channel(Some(1));

        subject.push(&Arc::new(Tick(1)));
        subject.push(&Arc::new(Tick(2)));

        assert_eq!(subject.subscriber_count(), 1);
    }

    #[test]
    fn test_push_converted_on_concrete_subject() {
        let subject = subject();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _s = subject.subscribe(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(subject.push_converted(Box::new(Tick(3))));
        assert!(!subject.push_converted(Box::new("wrong type".to_string())));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
