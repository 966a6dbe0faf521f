//! The message bus: command dispatch and event broadcast over one
//! passive, thread-safe instance.
//!
//! All caches are owned by the instance, so independent buses (for example
//! under test) never observe each other. The bus never registers anything
//! into its locator; handlers and external producers are only read.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use futures::stream::BoxStream;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::command::adapter::{
    async_handler, sync_handler, AnyMessage, AnyOutput, DispatchAdapters, ErasedAdapter,
};
use crate::command::{AsyncCommand, SyncCommand};
use crate::config::BusOptions;
use crate::error::{BusError, Result};
use crate::event::registry::SubjectRegistry;
use crate::event::subject::{EventStream, SubscriberFn, Subscription};
use crate::event::{Event, EventCast, EventSource};
use crate::locator::ServiceLocator;
use crate::structural::{ConvertFn, MappingProvider, NoMapping, StructuralAdapters};

/// In-process message bus.
///
/// Safe to share and call concurrently from any thread without external
/// locking. Synchronous operations never suspend; asynchronous execution
/// resolves its handler synchronously and performs no thread marshaling.
pub struct MessageBus {
    locator: Arc<dyn ServiceLocator>,
    adapters: DispatchAdapters,
    subjects: SubjectRegistry,
    structural: StructuralAdapters,
    options: BusOptions,
}

impl MessageBus {
    /// Create a bus over a locator, with no structural mappings.
    pub fn new(locator: Arc<dyn ServiceLocator>) -> Self {
        Self {
            locator,
            adapters: DispatchAdapters::new(),
            subjects: SubjectRegistry::new(),
            structural: StructuralAdapters::new(Arc::new(NoMapping)),
            options: BusOptions::default(),
        }
    }

    /// Use a structural mapping provider for cross-module delivery.
    pub fn with_mapping(mut self, provider: Arc<dyn MappingProvider>) -> Self {
        self.structural = StructuralAdapters::new(provider);
        self
    }

    /// Apply instance options.
    pub fn with_options(mut self, options: BusOptions) -> Self {
        self.options = options;
        self
    }

    // ------------------------------------------------------------------
    // Command dispatch, typed
    // ------------------------------------------------------------------

    /// Whether a handler is currently bound for sync command type `C`.
    pub fn can_handle<C: SyncCommand>(&self) -> bool {
        self.adapters.warm_sync::<C>();
        sync_handler::<C>(self.locator.as_ref()).is_some()
    }

    /// Whether a handler is currently bound for async command type `C`.
    pub fn can_handle_async<C: AsyncCommand>(&self) -> bool {
        self.adapters.warm_async::<C>();
        async_handler::<C>(self.locator.as_ref()).is_some()
    }

    /// Whether a handler is bound and currently willing to execute.
    /// Returns false, never an error, for unbound command types.
    pub fn can_execute<C: SyncCommand>(&self, command: &C) -> bool {
        self.adapters.warm_sync::<C>();
        sync_handler::<C>(self.locator.as_ref())
            .is_some_and(|handler| handler.can_execute(command))
    }

    /// Execute a synchronous command inline on the calling thread.
    ///
    /// Fails with [`BusError::Unhandled`] when no handler is bound; a
    /// handler failure propagates unmodified. Never returns a fabricated
    /// default in place of either.
    pub fn execute<C: SyncCommand>(&self, command: C) -> Result<C::Output> {
        self.adapters.warm_sync::<C>();
        let handler = sync_handler::<C>(self.locator.as_ref())
            .ok_or_else(|| BusError::Unhandled(type_name::<C>().to_string()))?;
        handler.execute(command).map_err(BusError::Handler)
    }

    /// Execute an asynchronous command.
    ///
    /// The handler is resolved synchronously; `cancel` is forwarded to it
    /// verbatim. Scheduling onto specific threads is the caller's concern.
    pub async fn execute_async<C: AsyncCommand>(
        &self,
        command: C,
        cancel: CancelToken,
    ) -> Result<C::Output> {
        self.adapters.warm_async::<C>();
        let handler = async_handler::<C>(self.locator.as_ref())
            .ok_or_else(|| BusError::Unhandled(type_name::<C>().to_string()))?;
        handler
            .execute(command, cancel)
            .await
            .map_err(BusError::Handler)
    }

    // ------------------------------------------------------------------
    // Command dispatch, type-erased
    // ------------------------------------------------------------------

    /// Instance form of `can_handle` for type-erased call sites.
    pub fn can_handle_message(&self, command: &dyn Any) -> bool {
        self.erased_route(command.type_id())
            .is_some_and(|(adapter, _)| adapter.can_handle(self.locator.as_ref()))
    }

    /// Instance form of `can_execute` for type-erased call sites.
    pub fn can_execute_message(&self, command: &(dyn Any + Send + Sync)) -> bool {
        let Some((adapter, convert)) = self.erased_route(command.type_id()) else {
            return false;
        };
        match convert {
            None => adapter.can_execute(self.locator.as_ref(), command),
            Some(convert) => convert(command, &self.structural)
                .is_some_and(|converted| {
                    adapter.can_execute(self.locator.as_ref(), converted.as_ref())
                }),
        }
    }

    /// Dispatch a command whose static type is unknown at the call site.
    ///
    /// The payload's runtime type selects the cached adapter; when none
    /// exists, a structurally compatible already-resolved command type is
    /// tried through the mapping provider. Async-shaped commands are
    /// rejected here with [`BusError::ShapeMismatch`].
    pub fn execute_message(&self, command: AnyMessage) -> Result<AnyOutput> {
        let (adapter, convert) = self
            .erased_route((*command).type_id())
            .ok_or_else(|| BusError::Unhandled("unresolved message type".to_string()))?;
        let command = self.apply_conversion(command, convert, adapter.command_name())?;
        adapter.execute(self.locator.as_ref(), command)
    }

    /// Async counterpart of [`MessageBus::execute_message`]. Sync-shaped
    /// commands are rejected with [`BusError::ShapeMismatch`].
    pub async fn execute_message_async(
        &self,
        command: AnyMessage,
        cancel: CancelToken,
    ) -> Result<AnyOutput> {
        let (adapter, convert) = self
            .erased_route((*command).type_id())
            .ok_or_else(|| BusError::Unhandled("unresolved message type".to_string()))?;
        let command = self.apply_conversion(command, convert, adapter.command_name())?;
        adapter
            .execute_async(self.locator.as_ref(), command, cancel)
            .await
    }

    /// Find the adapter serving a runtime type: the exact adapter when one
    /// is cached (identity fast path, no conversion), otherwise the first
    /// structural candidate with a resolvable conversion.
    fn erased_route(&self, source: TypeId) -> Option<(Arc<dyn ErasedAdapter>, Option<ConvertFn>)> {
        if let Some(adapter) = self.adapters.get(source) {
            return Some((adapter, None));
        }
        for target in self.structural.candidates(source) {
            if target == source {
                continue;
            }
            let Some(adapter) = self.adapters.get(target) else {
                continue;
            };
            if let Some(convert) = self.structural.resolve(source, target) {
                debug!(
                    command_type = adapter.command_name(),
                    "Erased dispatch using structural adapter"
                );
                return Some((adapter, Some(convert)));
            }
        }
        None
    }

    fn apply_conversion(
        &self,
        command: AnyMessage,
        convert: Option<ConvertFn>,
        target_name: &str,
    ) -> Result<AnyMessage> {
        match convert {
            None => Ok(command),
            Some(convert) => convert(command.as_ref(), &self.structural)
                .ok_or_else(|| BusError::Unhandled(target_name.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Event notification
    // ------------------------------------------------------------------

    /// Broadcast an event to every subject its type is assignable to:
    /// the exact-type subject, every declared capability subject, and any
    /// subject reachable through a structural conversion.
    ///
    /// Delivery is synchronous and inline; a failing subscriber is
    /// isolated and removed without affecting the rest. Rejected when the
    /// exact type is produced externally (single-writer invariant).
    pub fn notify<E: Event>(&self, event: E) -> Result<()> {
        if !self
            .locator
            .get_all(TypeId::of::<dyn EventSource<E>>())
            .is_empty()
        {
            return Err(BusError::ExternallyProduced(type_name::<E>().to_string()));
        }

        let mut casts = vec![EventCast::to::<E, E>(|event| event)];
        casts.extend(E::casts());

        let routes = self
            .subjects
            .routes_for(TypeId::of::<E>(), &casts, &self.structural);
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(event);
        for route in routes.iter() {
            route.deliver(&erased, &self.structural);
        }
        Ok(())
    }

    /// Observe a concrete event type as a stream.
    ///
    /// Lazily creates the type's subject and merges in every external
    /// producer of the type supplied by the locator. Dropping the stream
    /// tears down all underlying subscriptions.
    pub fn observe<T: Event>(&self) -> EventStream<T> {
        let subject = self.subjects.concrete::<T>(&self.options);
        let (stream, subscription) = subject.channel(self.options.stream_capacity);
        self.merged_stream(stream, subscription)
    }

    /// Observe a capability (trait object) type as a stream; every
    /// concrete event declaring a cast to `T` is delivered here.
    pub fn observe_dyn<T: ?Sized + Send + Sync + 'static>(&self) -> EventStream<T> {
        let subject = self.subjects.capability::<T>(&self.options);
        let (stream, subscription) = subject.channel(self.options.stream_capacity);
        self.merged_stream(stream, subscription)
    }

    /// Subscribe a callback to a concrete event type. The callback runs
    /// inline on the notifying thread; returning an error removes this
    /// subscriber only.
    pub fn subscribe<T, F>(&self, callback: F) -> Subscription
    where
        T: Event,
        F: Fn(&Arc<T>) -> std::result::Result<(), crate::error::SubscriberError>
            + Send
            + Sync
            + 'static,
    {
        let subject = self.subjects.concrete::<T>(&self.options);
        subject.subscribe(Box::new(callback) as SubscriberFn<T>)
    }

    /// Subscribe a callback to a capability (trait object) type.
    pub fn subscribe_dyn<T, F>(&self, callback: F) -> Subscription
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Arc<T>) -> std::result::Result<(), crate::error::SubscriberError>
            + Send
            + Sync
            + 'static,
    {
        let subject = self.subjects.capability::<T>(&self.options);
        subject.subscribe(Box::new(callback) as SubscriberFn<T>)
    }

    fn merged_stream<T: ?Sized + Send + Sync + 'static>(
        &self,
        own: BoxStream<'static, Arc<T>>,
        subscription: Subscription,
    ) -> EventStream<T> {
        let mut streams = vec![own];
        for slot in self.locator.get_all(TypeId::of::<dyn EventSource<T>>()) {
            if let Some(source) = slot.downcast_ref::<Arc<dyn EventSource<T>>>() {
                streams.push(source.stream());
            }
        }
        EventStream::merge(streams, subscription)
    }
}
