//! Subject registry and the compatibility index.
//!
//! The registry owns one subject per observed type. The compatibility
//! index caches, per concrete event type, the delivery routes into every
//! subject the type is assignable to; it is invalidated wholesale whenever
//! a new subject appears, since a new observed type may widen the match
//! set for previously seen concrete types.

use std::any::{type_name, Any, TypeId};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::config::BusOptions;
use crate::event::subject::{AnySubject, Subject};
use crate::event::{DeliverFn, EventCast};
use crate::structural::StructuralAdapters;
use crate::sync::{read, write};

/// One delivery path from a concrete event type into one subject.
pub(crate) struct Route {
    subject: Arc<dyn AnySubject>,
    kind: RouteKind,
}

enum RouteKind {
    /// Identity or declared upcast; no conversion cost.
    Cast(DeliverFn),
    /// Structural conversion resolved for this (concrete, observed) pair.
    Structural(crate::structural::ConvertFn),
}

impl Route {
    pub(crate) fn deliver(
        &self,
        event: &Arc<dyn Any + Send + Sync>,
        structural: &StructuralAdapters,
    ) {
        match &self.kind {
            RouteKind::Cast(deliver) => deliver(event, self.subject.as_ref()),
            RouteKind::Structural(convert) => {
                match convert(event.as_ref(), structural) {
                    Some(converted) => {
                        if !self.subject.push_converted(converted) {
                            debug!(
                                observed_type = self.subject.observed_name(),
                                "Structural conversion produced an undeliverable value; skipped"
                            );
                        }
                    }
                    // No mapping for this value; skip this one subject.
                    None => debug!(
                        observed_type = self.subject.observed_name(),
                        "Structural conversion declined; delivery skipped"
                    ),
                }
            }
        }
    }
}

struct SubjectSlot {
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn AnySubject>,
}

struct CompatEntry {
    version: u64,
    routes: Arc<Vec<Route>>,
}

/// Instance-owned registry of subjects plus the derived compatibility index.
pub(crate) struct SubjectRegistry {
    subjects: RwLock<HashMap<TypeId, SubjectSlot>>,
    /// Bumped on every subject creation; stale index entries are rebuilt.
    version: AtomicU64,
    compat: RwLock<HashMap<TypeId, CompatEntry>>,
}

impl SubjectRegistry {
    pub(crate) fn new() -> Self {
        Self {
            subjects: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            compat: RwLock::new(HashMap::new()),
        }
    }

    /// Subject for a concrete event type, created lazily.
    pub(crate) fn concrete<T: Any + Send + Sync>(&self, options: &BusOptions) -> Arc<Subject<T>> {
        let warn = options.warn_on_subscriber_failure;
        self.get_or_create(|| Subject::for_concrete(warn))
    }

    /// Subject for a capability (trait object) type, created lazily.
    pub(crate) fn capability<T: ?Sized + Send + Sync + 'static>(
        &self,
        options: &BusOptions,
    ) -> Arc<Subject<T>> {
        let warn = options.warn_on_subscriber_failure;
        self.get_or_create(|| Subject::for_capability(warn))
    }

    /// Delivery routes for a concrete event type.
    ///
    /// `casts` must start with the identity cast; declared upcasts follow.
    /// A cached entry is reused while no subject has been created since it
    /// was built. A notify racing a subject creation may use the previous
    /// routes; that relaxed consistency is intentional.
    pub(crate) fn routes_for(
        &self,
        concrete: TypeId,
        casts: &[EventCast],
        structural: &StructuralAdapters,
    ) -> Arc<Vec<Route>> {
        let version = self.version.load(Ordering::Acquire);
        if let Some(entry) = read(&self.compat).get(&concrete) {
            if entry.version == version {
                return Arc::clone(&entry.routes);
            }
        }

        let subjects: Vec<Arc<dyn AnySubject>> = read(&self.subjects)
            .values()
            .map(|slot| Arc::clone(&slot.erased))
            .collect();

        let mut routes = Vec::new();
        for subject in subjects {
            let observed = subject.observed_type();
            if let Some(cast) = casts.iter().find(|cast| cast.target == observed) {
                routes.push(Route {
                    subject,
                    kind: RouteKind::Cast(Arc::clone(&cast.deliver)),
                });
            } else if subject.accepts_converted() {
                // Assignability already failed; only now consult the
                // structural resolver for this type pair.
                if let Some(convert) = structural.resolve(concrete, observed) {
                    routes.push(Route {
                        subject,
                        kind: RouteKind::Structural(convert),
                    });
                }
            }
        }

        let routes = Arc::new(routes);
        write(&self.compat).insert(
            concrete,
            CompatEntry {
                version,
                routes: Arc::clone(&routes),
            },
        );
        routes
    }

    fn get_or_create<T, F>(&self, make: F) -> Arc<Subject<T>>
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce() -> Subject<T>,
    {
        let key = TypeId::of::<T>();
        if let Some(slot) = read(&self.subjects).get(&key) {
            if let Ok(subject) = Arc::clone(&slot.typed).downcast::<Subject<T>>() {
                return subject;
            }
        }

        let fresh = Arc::new(make());
        let mut guard = write(&self.subjects);
        match guard.entry(key) {
            MapEntry::Occupied(slot) => {
                // Lost the creation race; use the winner's subject.
                match Arc::clone(&slot.get().typed).downcast::<Subject<T>>() {
                    Ok(subject) => subject,
                    Err(_) => fresh,
                }
            }
            MapEntry::Vacant(slot) => {
                slot.insert(SubjectSlot {
                    typed: Arc::clone(&fresh) as Arc<dyn Any + Send + Sync>,
                    erased: Arc::clone(&fresh) as Arc<dyn AnySubject>,
                });
                // Wholesale invalidation: the new observed type may be a
                // match for concrete types already in the index.
                self.version.fetch_add(1, Ordering::Release);
                debug!(observed_type = type_name::<T>(), "Created subject");
                fresh
            }
        }
    }
}
