//! Event capability model.
//!
//! Events are immutable occurrences broadcast to any number of observers.
//! A concrete event type declares which capability types it is assignable
//! to through [`Event::casts`]; observers of those capabilities (usually
//! trait objects) then receive every concrete implementation.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::event::subject::Subject;

pub mod registry;
pub mod subject;

/// An immutable occurrence broadcast to zero or more subscribers.
pub trait Event: Any + Send + Sync + 'static {
    /// Capability types this concrete event is assignable to.
    ///
    /// The exact-type route is always present and does not need declaring.
    fn casts() -> Vec<EventCast>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// Erased delivery function: pushes a concrete event into one subject.
pub(crate) type DeliverFn =
    Arc<dyn Fn(&Arc<dyn Any + Send + Sync>, &dyn subject::AnySubject) + Send + Sync>;

/// Declared assignability from a concrete event type to one capability type.
#[derive(Clone)]
pub struct EventCast {
    pub(crate) target: TypeId,
    pub(crate) target_name: &'static str,
    pub(crate) deliver: DeliverFn,
}

impl EventCast {
    /// Declare that concrete event `C` is assignable to capability `T`.
    ///
    /// `T` is typically a trait object (`dyn SomeEventCapability`); the
    /// upcast is usually just an unsizing coercion, e.g. `|e| e`.
    pub fn to<C, T>(upcast: fn(Arc<C>) -> Arc<T>) -> Self
    where
        C: Event,
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            target: TypeId::of::<T>(),
            target_name: type_name::<T>(),
            deliver: Arc::new(move |event, subject| {
                let Ok(event) = Arc::clone(event).downcast::<C>() else {
                    return;
                };
                let Some(subject) = subject.as_any().downcast_ref::<Subject<T>>() else {
                    return;
                };
                subject.push(&upcast(event));
            }),
        }
    }
}

/// Externally owned event producer, merged into `observe` streams of its
/// declared type by the bus.
pub trait EventSource<T: ?Sized + Send + Sync>: Send + Sync {
    /// A fresh stream of produced values.
    fn stream(&self) -> BoxStream<'static, Arc<T>>;
}
