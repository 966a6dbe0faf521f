//! Type-erased dispatch adapters.
//!
//! The first dispatch for a command runtime type builds a small stateless
//! adapter closed over the handler contract and stores it keyed by that
//! type; later type-erased dispatches of the same type reuse it and skip
//! re-resolution. Typed calls resolve the handler contract directly per
//! call (the fast path) and warm this cache as a side effect, so both
//! paths are externally indistinguishable.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use futures::future::{BoxFuture, FutureExt};

use crate::cancel::CancelToken;
use crate::command::{AsyncCommand, AsyncHandler, Command, Handler, Shape, SyncCommand};
use crate::error::{BusError, Result};
use crate::locator::ServiceLocator;
use crate::sync::{read, write};

/// Type-erased command payload entering the erased dispatch path.
pub type AnyMessage = Box<dyn Any + Send + Sync>;

/// Type-erased handler output leaving the erased dispatch path.
pub type AnyOutput = Box<dyn Any + Send>;

/// Look up the sync handler bound for `C` through the locator.
pub(crate) fn sync_handler<C: SyncCommand>(
    locator: &dyn ServiceLocator,
) -> Option<Arc<dyn Handler<C>>> {
    locator
        .get_handler(TypeId::of::<dyn Handler<C>>())
        .and_then(|slot| slot.downcast_ref::<Arc<dyn Handler<C>>>().cloned())
}

/// Look up the async handler bound for `C` through the locator.
pub(crate) fn async_handler<C: AsyncCommand>(
    locator: &dyn ServiceLocator,
) -> Option<Arc<dyn AsyncHandler<C>>> {
    locator
        .get_handler(TypeId::of::<dyn AsyncHandler<C>>())
        .and_then(|slot| slot.downcast_ref::<Arc<dyn AsyncHandler<C>>>().cloned())
}

/// Stateless per-command-type invoker, reused for the bus lifetime.
///
/// Handler lookup stays live through the locator on every call; only the
/// type analysis is cached, so binding or rebinding a handler after the
/// adapter exists is observed immediately.
pub(crate) trait ErasedAdapter: Send + Sync {
    fn shape(&self) -> Shape;
    fn command_name(&self) -> &'static str;
    fn can_handle(&self, locator: &dyn ServiceLocator) -> bool;
    fn can_execute(&self, locator: &dyn ServiceLocator, command: &dyn Any) -> bool;
    fn execute(&self, locator: &dyn ServiceLocator, command: AnyMessage) -> Result<AnyOutput>;
    fn execute_async(
        &self,
        locator: &dyn ServiceLocator,
        command: AnyMessage,
        cancel: CancelToken,
    ) -> BoxFuture<'static, Result<AnyOutput>>;
}

pub(crate) struct SyncAdapter<C: SyncCommand>(PhantomData<fn(C)>);

impl<C: SyncCommand> ErasedAdapter for SyncAdapter<C> {
    fn shape(&self) -> Shape {
        Shape::Sync
    }

    fn command_name(&self) -> &'static str {
        type_name::<C>()
    }

    fn can_handle(&self, locator: &dyn ServiceLocator) -> bool {
        sync_handler::<C>(locator).is_some()
    }

    fn can_execute(&self, locator: &dyn ServiceLocator, command: &dyn Any) -> bool {
        let Some(command) = command.downcast_ref::<C>() else {
            return false;
        };
        sync_handler::<C>(locator).is_some_and(|handler| handler.can_execute(command))
    }

    fn execute(&self, locator: &dyn ServiceLocator, command: AnyMessage) -> Result<AnyOutput> {
        let command = command
            .downcast::<C>()
            .map_err(|_| BusError::InvalidArgument("payload does not match adapter type"))?;
        let handler = sync_handler::<C>(locator)
            .ok_or_else(|| BusError::Unhandled(type_name::<C>().to_string()))?;
        let output = handler.execute(*command).map_err(BusError::Handler)?;
        Ok(Box::new(output))
    }

    fn execute_async(
        &self,
        _locator: &dyn ServiceLocator,
        _command: AnyMessage,
        _cancel: CancelToken,
    ) -> BoxFuture<'static, Result<AnyOutput>> {
        futures::future::ready(Err(BusError::ShapeMismatch {
            type_name: type_name::<C>().to_string(),
            declared: Shape::Sync,
            routed: Shape::Async,
        }))
        .boxed()
    }
}

pub(crate) struct AsyncAdapter<C: AsyncCommand>(PhantomData<fn(C)>);

impl<C: AsyncCommand> ErasedAdapter for AsyncAdapter<C> {
    fn shape(&self) -> Shape {
        Shape::Async
    }

    fn command_name(&self) -> &'static str {
        type_name::<C>()
    }

    fn can_handle(&self, locator: &dyn ServiceLocator) -> bool {
        async_handler::<C>(locator).is_some()
    }

    fn can_execute(&self, locator: &dyn ServiceLocator, command: &dyn Any) -> bool {
        let Some(command) = command.downcast_ref::<C>() else {
            return false;
        };
        async_handler::<C>(locator).is_some_and(|handler| handler.can_execute(command))
    }

    fn execute(&self, _locator: &dyn ServiceLocator, _command: AnyMessage) -> Result<AnyOutput> {
        Err(BusError::ShapeMismatch {
            type_name: type_name::<C>().to_string(),
            declared: Shape::Async,
            routed: Shape::Sync,
        })
    }

    fn execute_async(
        &self,
        locator: &dyn ServiceLocator,
        command: AnyMessage,
        cancel: CancelToken,
    ) -> BoxFuture<'static, Result<AnyOutput>> {
        let command = match command.downcast::<C>() {
            Ok(command) => command,
            Err(_) => {
                return futures::future::ready(Err(BusError::InvalidArgument(
                    "payload does not match adapter type",
                )))
                .boxed()
            }
        };
        let Some(handler) = async_handler::<C>(locator) else {
            return futures::future::ready(Err(BusError::Unhandled(
                type_name::<C>().to_string(),
            )))
            .boxed();
        };
        async move {
            handler
                .execute(*command, cancel)
                .await
                .map(|output| Box::new(output) as AnyOutput)
                .map_err(BusError::Handler)
        }
        .boxed()
    }
}

/// Instance-owned map of command runtime type to dispatch adapter.
///
/// A command type declares exactly one capability shape, so each type has
/// exactly one adapter; the cache is keyed by the type alone. A type that
/// declares both marker traits violates that contract, and the first warm
/// would silently fix the shape seen by erased dispatch; warming asserts
/// the cached shape to surface the conflict in debug builds.
pub(crate) struct DispatchAdapters {
    map: RwLock<HashMap<TypeId, Arc<dyn ErasedAdapter>>>,
}

impl DispatchAdapters {
    pub(crate) fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure the adapter for sync command `C` exists.
    ///
    /// Two threads racing here both build equivalent stateless adapters;
    /// the loser's copy is discarded.
    pub(crate) fn warm_sync<C: SyncCommand>(&self) -> Arc<dyn ErasedAdapter> {
        let adapter = self.get_or_insert(TypeId::of::<C>(), || {
            Arc::new(SyncAdapter::<C>(PhantomData))
        });
        debug_assert_eq!(
            adapter.shape(),
            Shape::Sync,
            "command type '{}' declares both capability shapes",
            type_name::<C>()
        );
        adapter
    }

    /// Ensure the adapter for async command `C` exists.
    pub(crate) fn warm_async<C: AsyncCommand>(&self) -> Arc<dyn ErasedAdapter> {
        let adapter = self.get_or_insert(TypeId::of::<C>(), || {
            Arc::new(AsyncAdapter::<C>(PhantomData))
        });
        debug_assert_eq!(
            adapter.shape(),
            Shape::Async,
            "command type '{}' declares both capability shapes",
            type_name::<C>()
        );
        adapter
    }

    pub(crate) fn get(&self, command_type: TypeId) -> Option<Arc<dyn ErasedAdapter>> {
        read(&self.map).get(&command_type).cloned()
    }

    fn get_or_insert(
        &self,
        command_type: TypeId,
        make: impl FnOnce() -> Arc<dyn ErasedAdapter>,
    ) -> Arc<dyn ErasedAdapter> {
        if let Some(existing) = read(&self.map).get(&command_type) {
            return Arc::clone(existing);
        }
        let fresh = make();
        let mut guard = write(&self.map);
        Arc::clone(guard.entry(command_type).or_insert(fresh))
    }
}
