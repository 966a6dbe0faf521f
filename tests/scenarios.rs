//! End-to-end bus behavior: dispatch contracts, supertype broadcast,
//! subscriber isolation, external producers, structural bridging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use futures::StreamExt;

use crossbus::{
    AsyncCommand, AsyncHandler, CancelSource, CancelToken, Command, Event, EventCast, EventSource,
    Handler, HandlerError, HandlerRegistry, MappingProvider, MessageBus, StructuralMap,
    SyncCommand,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------

struct Greet(String);
impl Command for Greet {
    type Output = String;
}
impl SyncCommand for Greet {}

struct EchoHandler;
impl Handler<Greet> for EchoHandler {
    fn execute(&self, command: Greet) -> Result<String, HandlerError> {
        Ok(command.0)
    }
}

struct Ping;
impl Command for Ping {
    type Output = &'static str;
}
impl AsyncCommand for Ping {}

struct PingHandler;
#[async_trait::async_trait]
impl AsyncHandler<Ping> for PingHandler {
    async fn execute(&self, _command: Ping, cancel: CancelToken) -> Result<&'static str, HandlerError> {
        if cancel.is_cancelled() {
            return Err("cancelled before start".into());
        }
        Ok("pong")
    }
}

// ----------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------

trait Animal: Send + Sync {
    fn species(&self) -> &'static str;
}

#[derive(Debug)]
struct Dog;
impl Animal for Dog {
    fn species(&self) -> &'static str {
        "dog"
    }
}
impl Event for Dog {
    fn casts() -> Vec<EventCast> {
        vec![EventCast::to::<Dog, dyn Animal>(|dog| dog)]
    }
}

#[derive(Debug)]
struct Cat;
impl Animal for Cat {
    fn species(&self) -> &'static str {
        "cat"
    }
}
impl Event for Cat {
    fn casts() -> Vec<EventCast> {
        vec![EventCast::to::<Cat, dyn Animal>(|cat| cat)]
    }
}

#[derive(Debug)]
struct Plant;
impl Event for Plant {}

// ----------------------------------------------------------------------
// Scenario 1 & 2: bound and unbound command dispatch
// ----------------------------------------------------------------------

#[test]
fn test_bound_greet_echoes_message() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.bind::<Greet, _>(EchoHandler).unwrap();
    let bus = MessageBus::new(registry);

    assert!(bus.can_handle::<Greet>());
    assert_eq!(bus.execute(Greet("hi".to_string())).unwrap(), "hi");
}

#[test]
fn test_unbound_greet_fails_unhandled() {
    let bus = MessageBus::new(Arc::new(HandlerRegistry::new()));

    assert!(!bus.can_handle::<Greet>());
    assert!(!bus.can_execute(&Greet("hi".to_string())));
    let err = bus.execute(Greet("hi".to_string())).unwrap_err();
    assert!(matches!(err, crossbus::BusError::Unhandled(_)));
}

#[test]
fn test_repeated_dispatch_matches_cold_bus() {
    let make = || {
        let registry = Arc::new(HandlerRegistry::new());
        registry.bind::<Greet, _>(EchoHandler).unwrap();
        MessageBus::new(registry)
    };

    let warm = make();
    let warm_results: Vec<_> = (0..5)
        .map(|i| warm.execute(Greet(format!("m{i}"))).unwrap())
        .collect();

    let cold_results: Vec<_> = (0..5)
        .map(|i| make().execute(Greet(format!("m{i}"))).unwrap())
        .collect();

    assert_eq!(warm_results, cold_results);
}

// ----------------------------------------------------------------------
// Async dispatch and cancellation passthrough
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_async_dispatch_roundtrip() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.bind_async::<Ping, _>(PingHandler).unwrap();
    let bus = MessageBus::new(registry);

    assert!(bus.can_handle_async::<Ping>());
    let pong = bus.execute_async(Ping, CancelToken::none()).await.unwrap();
    assert_eq!(pong, "pong");
}

#[tokio::test]
async fn test_cancellation_is_forwarded_verbatim() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.bind_async::<Ping, _>(PingHandler).unwrap();
    let bus = MessageBus::new(registry);

    let source = CancelSource::new();
    source.cancel();
    let err = bus.execute_async(Ping, source.token()).await.unwrap_err();
    assert_eq!(err.to_string(), "cancelled before start");
}

#[tokio::test]
async fn test_erased_shape_mismatch_fails_fast() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.bind::<Greet, _>(EchoHandler).unwrap();
    let bus = MessageBus::new(registry);
    assert!(bus.can_handle::<Greet>());

    let err = bus
        .execute_message_async(Box::new(Greet("hi".to_string())), CancelToken::none())
        .await
        .unwrap_err();
    assert!(matches!(err, crossbus::BusError::ShapeMismatch { .. }));
}

// ----------------------------------------------------------------------
// Scenario 3: supertype delivery
// ----------------------------------------------------------------------

#[test]
fn test_capability_subscriber_sees_all_implementations() {
    let bus = MessageBus::new(Arc::new(HandlerRegistry::new()));

    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _animals = bus.subscribe_dyn::<dyn Animal, _>(move |animal| {
        sink.lock().unwrap().push(animal.species());
        Ok(())
    });

    let plants = Arc::new(AtomicUsize::new(0));
    let p = Arc::clone(&plants);
    let _plants = bus.subscribe::<Plant, _>(move |_| {
        p.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.notify(Dog).unwrap();
    bus.notify(Cat).unwrap();
    bus.notify(Plant).unwrap();

    let mut species = seen.lock().unwrap().clone();
    species.sort_unstable();
    assert_eq!(species, vec!["cat", "dog"]);
    assert_eq!(plants.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_observe_dyn_streams_capability_events() {
    let bus = MessageBus::new(Arc::new(HandlerRegistry::new()));
    let mut animals = bus.observe_dyn::<dyn Animal>();

    bus.notify(Dog).unwrap();
    bus.notify(Cat).unwrap();

    assert_eq!(animals.next().await.unwrap().species(), "dog");
    assert_eq!(animals.next().await.unwrap().species(), "cat");
}

#[test]
fn test_subject_created_after_first_notify_still_matches() {
    // A new capability subject must widen matches for concrete types the
    // compatibility index has already seen.
    let bus = MessageBus::new(Arc::new(HandlerRegistry::new()));

    bus.notify(Dog).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let _animals = bus.subscribe_dyn::<dyn Animal, _>(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.notify(Dog).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ----------------------------------------------------------------------
// Scenario 4: subscriber isolation
// ----------------------------------------------------------------------

#[test]
fn test_throwing_subscriber_is_isolated_and_removed() {
    #[derive(Debug)]
    struct Shipped;
    impl Event for Shipped {}

    init_tracing();
    let bus = MessageBus::new(Arc::new(HandlerRegistry::new()));

    let first_calls = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&first_calls);
    let failing = bus.subscribe::<Shipped, _>(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
        Err("subscriber one is broken".into())
    });

    let second_calls = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&second_calls);
    let _healthy = bus.subscribe::<Shipped, _>(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.notify(Shipped).unwrap();
    bus.notify(Shipped).unwrap();

    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        failing.failure().map(ToString::to_string),
        Some("subscriber one is broken".to_string())
    );
}

// ----------------------------------------------------------------------
// Observation streams and external producers
// ----------------------------------------------------------------------

#[derive(Debug, PartialEq)]
struct Tick(u32);
impl Event for Tick {}

struct TickSource(Vec<u32>);
impl EventSource<Tick> for TickSource {
    fn stream(&self) -> BoxStream<'static, Arc<Tick>> {
        futures::stream::iter(self.0.clone().into_iter().map(|n| Arc::new(Tick(n)))).boxed()
    }
}

#[tokio::test]
async fn test_observe_streams_notifications() {
    #[derive(Debug)]
    struct Beat(u8);
    impl Event for Beat {}

    let bus = MessageBus::new(Arc::new(HandlerRegistry::new()));
    let mut stream = bus.observe::<Beat>();

    bus.notify(Beat(1)).unwrap();
    bus.notify(Beat(2)).unwrap();

    assert_eq!(stream.next().await.unwrap().0, 1);
    assert_eq!(stream.next().await.unwrap().0, 2);
}

#[tokio::test]
async fn test_observe_merges_external_sources() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.add_source::<Tick, _>(TickSource(vec![1, 2, 3]));
    let bus = MessageBus::new(registry);

    let ticks: Vec<u32> = bus
        .observe::<Tick>()
        .take(3)
        .map(|tick| tick.0)
        .collect()
        .await;
    assert_eq!(ticks, vec![1, 2, 3]);
}

#[test]
fn test_notify_of_externally_produced_type_is_rejected() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.add_source::<Tick, _>(TickSource(vec![]));
    let bus = MessageBus::new(registry);

    let err = bus.notify(Tick(9)).unwrap_err();
    assert!(matches!(err, crossbus::BusError::ExternallyProduced(_)));

    // Unrelated types are unaffected by the single-writer rule.
    #[derive(Debug)]
    struct Other;
    impl Event for Other {}
    assert!(bus.notify(Other).is_ok());
}

#[test]
fn test_dropping_stream_unsubscribes() {
    #[derive(Debug)]
    struct Blip;
    impl Event for Blip {}

    let bus = MessageBus::new(Arc::new(HandlerRegistry::new()));
    let stream = bus.observe::<Blip>();
    drop(stream);

    // Push into the now-empty subject; nothing to deliver to, no error.
    assert!(bus.notify(Blip).is_ok());
}

// ----------------------------------------------------------------------
// Scenario 5 and identity fast path: structural bridging
// ----------------------------------------------------------------------

mod module_x {
    pub struct Echo2 {
        pub message: String,
        pub times: u32,
    }
}

mod module_y {
    use crossbus::{Command, SyncCommand};

    pub struct Echo2 {
        pub message: String,
        pub times: u32,
    }
    impl Command for Echo2 {
        type Output = (String, u32);
    }
    impl SyncCommand for Echo2 {}
}

struct Echo2Handler;
impl Handler<module_y::Echo2> for Echo2Handler {
    fn execute(&self, command: module_y::Echo2) -> Result<(String, u32), HandlerError> {
        Ok((command.message, command.times))
    }
}

#[test]
fn test_cross_module_command_converts_structurally() {
    init_tracing();
    let mapping = StructuralMap::new();
    mapping.add::<module_x::Echo2, module_y::Echo2>(|source| module_y::Echo2 {
        message: source.message.clone(),
        times: source.times,
    });

    let registry = Arc::new(HandlerRegistry::new());
    registry.bind::<module_y::Echo2, _>(Echo2Handler).unwrap();

    let bus = MessageBus::new(registry).with_mapping(Arc::new(mapping));
    // Resolve the target type once so its adapter exists.
    assert!(bus.can_handle::<module_y::Echo2>());

    let output = bus
        .execute_message(Box::new(module_x::Echo2 {
            message: "echo".to_string(),
            times: 5,
        }))
        .unwrap();
    let (message, times) = *output.downcast::<(String, u32)>().unwrap();
    assert_eq!(message, "echo");
    assert_eq!(times, 5);
}

/// Wraps a provider and counts how often it is consulted.
struct CountingProvider {
    inner: StructuralMap,
    calls: Arc<AtomicUsize>,
}

impl MappingProvider for CountingProvider {
    fn resolve(
        &self,
        source: std::any::TypeId,
        target: std::any::TypeId,
    ) -> Option<crossbus::ConvertFn> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(source, target)
    }

    fn candidates(&self, source: std::any::TypeId) -> Vec<std::any::TypeId> {
        self.inner.candidates(source)
    }
}

#[test]
fn test_identity_delivery_never_consults_provider() {
    #[derive(Debug)]
    struct Exact;
    impl Event for Exact {}

    let calls = Arc::new(AtomicUsize::new(0));
    let provider = CountingProvider {
        inner: StructuralMap::new(),
        calls: Arc::clone(&calls),
    };

    let bus = MessageBus::new(Arc::new(HandlerRegistry::new())).with_mapping(Arc::new(provider));

    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    let _subscription = bus.subscribe::<Exact, _>(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.notify(Exact).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_structurally_compatible_event_reaches_foreign_subscriber() {
    struct ForeignAlert {
        code: u16,
    }
    impl Event for ForeignAlert {}

    #[derive(Debug)]
    struct LocalAlert {
        code: u16,
    }
    impl Event for LocalAlert {}

    let mapping = StructuralMap::new();
    mapping.add::<ForeignAlert, LocalAlert>(|alert| LocalAlert { code: alert.code });

    let bus =
        MessageBus::new(Arc::new(HandlerRegistry::new())).with_mapping(Arc::new(mapping));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = bus.subscribe::<LocalAlert, _>(move |alert| {
        sink.lock().unwrap().push(alert.code);
        Ok(())
    });

    bus.notify(ForeignAlert { code: 503 }).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![503]);
}
