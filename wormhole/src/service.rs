//! Pluggable services built on the manager's typed streams.
//!
//! A service kind is listed once when the [`Manager`] is built. On
//! [`Manager::activate`] one instance of every kind is constructed in list
//! order and activated exactly once. Outside code never talks to a service
//! directly; it asks the manager for a [`Client`], a narrow capability
//! wrapping the live instance.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::Manager;

/// A running service instance.
pub trait Service: Send + Sync + 'static {
    /// Starts the service.
    ///
    /// Called once per manager activation. By the time it returns the
    /// service must already be subscribed to every payload it handles.
    fn activate(self: Arc<Self>);
}

/// A concrete service type the manager can construct.
pub trait ServiceKind: Service + Sized {
    /// Unique identifier used for registry lookups.
    const ID: &'static str;

    /// Builds the service. The manager is not yet activated.
    fn new(manager: &Manager) -> Self;
}

/// A narrow, use-case specific handle on a service.
pub trait Client: Sized {
    /// The service this client wraps.
    type Service: ServiceKind;

    /// Wraps a live service instance.
    fn bind(service: Arc<Self::Service>) -> Self;
}

/// One entry in a manager's ordered list of service kinds.
#[derive(Clone, Copy)]
pub struct ServiceDescriptor {
    /// [`ServiceKind::ID`] of the described kind.
    id: &'static str,
    /// Monomorphized constructor.
    build: fn(&Manager) -> ServiceSlot,
}

impl ServiceDescriptor {
    /// Describes the service kind `S`.
    pub fn of<S: ServiceKind>() -> Self {
        Self {
            id: S::ID,
            build: build::<S>,
        }
    }

    /// Identifier of the described kind.
    pub const fn id(&self) -> &'static str {
        self.id
    }

    /// Constructs an instance.
    pub(crate) fn build(&self, manager: &Manager) -> ServiceSlot {
        (self.build)(manager)
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceDescriptor").field(&self.id).finish()
    }
}

/// A constructed service, viewable both as a [`Service`] and as its
/// concrete type.
#[derive(Clone)]
pub(crate) struct ServiceSlot {
    /// [`ServiceKind::ID`] of the instance.
    pub(crate) id: &'static str,
    /// The instance, for activation.
    pub(crate) service: Arc<dyn Service>,
    /// The same instance, for typed lookups.
    any: Arc<dyn Any + Send + Sync>,
}

impl ServiceSlot {
    /// Returns the instance if it is an `S`.
    pub(crate) fn downcast<S: ServiceKind>(&self) -> Option<Arc<S>> {
        Arc::clone(&self.any).downcast::<S>().ok()
    }
}

/// Constructor behind [`ServiceDescriptor::of`].
fn build<S: ServiceKind>(manager: &Manager) -> ServiceSlot {
    let service = Arc::new(S::new(manager));
    ServiceSlot {
        id: S::ID,
        service: Arc::clone(&service) as Arc<dyn Service>,
        any: service,
    }
}
