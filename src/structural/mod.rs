//! Structural ("duck typing") adapters.
//!
//! Delivers a value whose runtime type differs from, but is structurally
//! compatible with, the statically expected type - same shape defined in a
//! different module - without a shared type dependency. Assignability is
//! always checked first by the callers; the mapping provider is consulted
//! only on that cache miss, and resolved conversions are cached for the
//! bus lifetime.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::sync::{read, write};

/// Type-erased converted value.
pub type AnyValue = Box<dyn Any + Send + Sync>;

/// Pure conversion from one type's shape to another's.
///
/// The resolver is threaded through so conversions of nested fields can
/// resolve their own pairs transitively via [`StructuralAdapters::convert`].
/// Returning `None` declines the conversion; the caller skips that one
/// delivery without raising.
pub type ConvertFn =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &StructuralAdapters) -> Option<AnyValue> + Send + Sync>;

/// Pluggable provider of structural mappings.
///
/// Consulted only when the runtime type is not already assignable to the
/// expected type; never for identical pairs.
pub trait MappingProvider: Send + Sync {
    /// Produce a conversion for the pair, or `None` when the shapes do
    /// not map.
    fn resolve(&self, source: TypeId, target: TypeId) -> Option<ConvertFn>;

    /// Target types this provider may map the source to. Used by erased
    /// command dispatch to enumerate candidate handler types.
    fn candidates(&self, _source: TypeId) -> Vec<TypeId> {
        Vec::new()
    }
}

/// Provider that never maps anything.
pub struct NoMapping;

impl MappingProvider for NoMapping {
    fn resolve(&self, _source: TypeId, _target: TypeId) -> Option<ConvertFn> {
        None
    }
}

/// Instance-owned cache of resolved conversions, keyed by type pair.
pub struct StructuralAdapters {
    provider: Arc<dyn MappingProvider>,
    cache: RwLock<HashMap<(TypeId, TypeId), ConvertFn>>,
}

impl StructuralAdapters {
    pub(crate) fn new(provider: Arc<dyn MappingProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a conversion for the pair, caching on success.
    ///
    /// Callers check assignability first, so identical pairs never reach
    /// the provider. Entries, once resolved, are stable for the bus
    /// lifetime.
    pub fn resolve(&self, source: TypeId, target: TypeId) -> Option<ConvertFn> {
        if let Some(convert) = read(&self.cache).get(&(source, target)) {
            return Some(Arc::clone(convert));
        }
        let convert = self.provider.resolve(source, target)?;
        self.register(source, target, Arc::clone(&convert));
        Some(convert)
    }

    /// Register a resolved conversion for a pair. The first registration
    /// wins; a racing duplicate is discarded.
    pub fn register(&self, source: TypeId, target: TypeId, convert: ConvertFn) {
        write(&self.cache).entry((source, target)).or_insert(convert);
    }

    /// Convert one typed value, resolving the pair on first use.
    ///
    /// This is the recursion point for nested structures: a mapping closure
    /// converts a mismatched field with `adapters.convert::<FieldS, FieldT>`.
    pub fn convert<S, T>(&self, value: &S) -> Option<T>
    where
        S: Any + Send + Sync,
        T: Any + Send + Sync,
    {
        let convert = self.resolve(TypeId::of::<S>(), TypeId::of::<T>())?;
        let converted = convert(value, self)?;
        converted.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub(crate) fn candidates(&self, source: TypeId) -> Vec<TypeId> {
        self.provider.candidates(source)
    }
}

/// Default [`MappingProvider`] with typed registration.
///
/// Duplicate registrations for a pair follow a deterministic rule: the
/// first successful registration wins, later ones are ignored. Candidate
/// targets are reported in registration order, so erased dispatch over
/// multiple mappings from one source type is deterministic.
#[derive(Default)]
pub struct StructuralMap {
    state: RwLock<MapState>,
}

#[derive(Default)]
struct MapState {
    entries: HashMap<(TypeId, TypeId), ConvertFn>,
    /// Pair keys in first-registration order.
    order: Vec<(TypeId, TypeId)>,
}

impl StructuralMap {
    /// Create an empty mapping table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `S` to `T` with a pure field-wise conversion.
    pub fn add<S, T>(&self, map: impl Fn(&S) -> T + Send + Sync + 'static)
    where
        S: Any + Send + Sync,
        T: Any + Send + Sync,
    {
        self.add_with::<S, T>(move |source, _| Some(map(source)));
    }

    /// Map `S` to `T` with access to the resolver, for nested pairs.
    ///
    /// Returning `None` declines the conversion for that value.
    pub fn add_with<S, T>(
        &self,
        map: impl Fn(&S, &StructuralAdapters) -> Option<T> + Send + Sync + 'static,
    ) where
        S: Any + Send + Sync,
        T: Any + Send + Sync,
    {
        let key = (TypeId::of::<S>(), TypeId::of::<T>());
        let convert: ConvertFn = Arc::new(move |value, adapters| {
            let source = value.downcast_ref::<S>()?;
            map(source, adapters).map(|target| Box::new(target) as AnyValue)
        });

        let mut guard = write(&self.state);
        if guard.entries.contains_key(&key) {
            warn!(
                source = type_name::<S>(),
                target = type_name::<T>(),
                "Mapping already registered for this pair; first registration wins"
            );
            return;
        }
        guard.entries.insert(key, convert);
        guard.order.push(key);
    }
}

impl MappingProvider for StructuralMap {
    fn resolve(&self, source: TypeId, target: TypeId) -> Option<ConvertFn> {
        read(&self.state).entries.get(&(source, target)).cloned()
    }

    fn candidates(&self, source: TypeId) -> Vec<TypeId> {
        read(&self.state)
            .order
            .iter()
            .filter(|(from, _)| *from == source)
            .map(|(_, to)| *to)
            .collect()
    }
}
