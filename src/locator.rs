//! Service locator collaborator and the provided in-memory registry.
//!
//! The bus only reads through [`ServiceLocator`]; handlers and external
//! event producers stay owned by the host application. [`HandlerRegistry`]
//! is the batteries-included implementation for applications and tests
//! that have no container of their own.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::command::{AsyncCommand, AsyncHandler, Handler, SyncCommand};
use crate::event::EventSource;
use crate::sync::{read, write};

/// Read-only lookup the bus performs against its host application.
pub trait ServiceLocator: Send + Sync {
    /// The single instance bound for a contract type, if any.
    fn get_handler(&self, contract: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Every producer bound for an observable contract type.
    fn get_all(&self, contract: TypeId) -> Vec<Arc<dyn Any + Send + Sync>>;
}

/// Errors raised while binding into the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A handler is already bound for this command type. Binding fails
    /// hard; the existing handler keeps serving dispatches.
    #[error("handler already bound for command type '{0}'")]
    DuplicateHandler(&'static str),
}

/// In-memory [`ServiceLocator`] with typed registration.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    sources: RwLock<HashMap<TypeId, Vec<Arc<dyn Any + Send + Sync>>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the handler for a synchronous command type.
    pub fn bind<C: SyncCommand, H: Handler<C>>(&self, handler: H) -> Result<(), RegistryError> {
        let slot: Arc<dyn Any + Send + Sync> = Arc::new(Arc::new(handler) as Arc<dyn Handler<C>>);
        self.insert::<C>(TypeId::of::<dyn Handler<C>>(), slot)
    }

    /// Bind the handler for an asynchronous command type.
    pub fn bind_async<C: AsyncCommand, H: AsyncHandler<C>>(
        &self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let slot: Arc<dyn Any + Send + Sync> =
            Arc::new(Arc::new(handler) as Arc<dyn AsyncHandler<C>>);
        self.insert::<C>(TypeId::of::<dyn AsyncHandler<C>>(), slot)
    }

    /// Register an external producer for an observed event type.
    ///
    /// Multiple sources per type are allowed; they are merged into every
    /// `observe` stream of that type. Registering a source makes direct
    /// `notify` of exactly that type a single-writer violation.
    pub fn add_source<T, S>(&self, source: S)
    where
        T: ?Sized + Send + Sync + 'static,
        S: EventSource<T> + 'static,
    {
        let slot: Arc<dyn Any + Send + Sync> = Arc::new(Arc::new(source) as Arc<dyn EventSource<T>>);
        write(&self.sources)
            .entry(TypeId::of::<dyn EventSource<T>>())
            .or_default()
            .push(slot);
        info!(event_type = type_name::<T>(), "Registered external event source");
    }

    fn insert<C: 'static>(
        &self,
        contract: TypeId,
        slot: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), RegistryError> {
        let mut guard = write(&self.handlers);
        if guard.contains_key(&contract) {
            return Err(RegistryError::DuplicateHandler(type_name::<C>()));
        }
        guard.insert(contract, slot);
        info!(command_type = type_name::<C>(), "Bound handler");
        Ok(())
    }
}

impl ServiceLocator for HandlerRegistry {
    fn get_handler(&self, contract: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        read(&self.handlers).get(&contract).cloned()
    }

    fn get_all(&self, contract: TypeId) -> Vec<Arc<dyn Any + Send + Sync>> {
        read(&self.sources).get(&contract).cloned().unwrap_or_default()
    }
}
