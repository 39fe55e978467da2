//! Peer registry, routing, keepalive, and the typed publish/subscribe API.
//!
//! A [`Manager`] is built once per process role. It owns every [`Channel`]
//! (keyed by [`PeerId`]), a router task that fans received packets out to
//! subscribers and relays propagating packets between guests, and a
//! keepalive task that pings all peers at a fixed interval.
//!
//! Services built by the manager hold a clone of it, so a manager lives until
//! [`Manager::shutdown`] is called.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use wormhole_proto::{Packet, Payload};

use crate::channel::{Channel, Inbound};
use crate::config::{Config, Keepalive};
use crate::service::{Client, ServiceDescriptor, ServiceKind, ServiceSlot};
use crate::{Error, PeerId, Result, lock};

/// Which end of the wormhole this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Role {
    /// The VM host; talks to any number of guests and relays between them.
    Host,
    /// A process inside a VM; talks to the host only.
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Guest => "guest",
        })
    }
}

/// Builder for a [`Manager`].
///
/// # Example
///
/// ```no_run
/// use wormhole::{Manager, Role, StatusService};
///
/// # async fn run() -> wormhole::Result<()> {
/// let manager = Manager::builder(Role::Guest)
///     .service::<StatusService>()
///     .build()?;
/// manager.connect_serial()?;
/// manager.activate();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use = "a ManagerBuilder does nothing until .build() is called"]
pub struct ManagerBuilder {
    /// Host or guest.
    role: Role,
    /// Runtime configuration.
    config: Config,
    /// Service kinds, in activation order.
    services: Vec<ServiceDescriptor>,
    /// Whether contract violations panic.
    strict_faults: bool,
}

impl ManagerBuilder {
    /// Replaces the default configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Makes contract violations (see [`Error::Fault`]) panic instead of
    /// only being logged and returned.
    ///
    /// Defaults to `true` in debug builds and `false` in release builds.
    pub fn strict_faults(mut self, strict: bool) -> Self {
        self.strict_faults = strict;
        self
    }

    /// Appends a service kind. Kinds are constructed in the order added.
    pub fn service<S: ServiceKind>(mut self) -> Self {
        if self.services.iter().any(|d| d.id() == S::ID) {
            tracing::warn!(service = S::ID, "service listed twice, ignoring");
        } else {
            self.services.push(ServiceDescriptor::of::<S>());
        }
        self
    }

    /// Validates the configuration and starts the router.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Manager> {
        self.config.validate()?;

        let (inbound, inbound_rx) = mpsc::channel(self.config.queues.inbound);
        let (bus, _) = broadcast::channel(self.config.queues.subscriber);
        let (connected, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            role: self.role,
            config: self.config,
            created: Instant::now(),
            epochs: AtomicU64::new(1),
            peers: Mutex::new(HashMap::new()),
            inbound,
            bus: Mutex::new(Some(bus)),
            connected,
            descriptors: self.services,
            strict_faults: self.strict_faults,
            services: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            activated: AtomicBool::new(false),
            bootstrapped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let router = tokio::spawn(route(Arc::downgrade(&inner), inbound_rx));
        lock(&inner.tasks).push(router.abort_handle());
        tracing::debug!(role = %inner.role, "manager created");

        Ok(Manager { inner })
    }
}

/// Owner of all channels of one process, and the entry point for sending
/// and subscribing.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Manager {
    /// Shared state.
    inner: Arc<Inner>,
}

/// State shared by manager clones and (weakly) by its tasks.
struct Inner {
    /// Host or guest.
    role: Role,
    /// Runtime configuration.
    config: Config,
    /// Creation time, for uptime reports.
    created: Instant,
    /// Source of channel epochs.
    epochs: AtomicU64,
    /// The registry.
    peers: Mutex<HashMap<PeerId, Arc<Channel>>>,
    /// Handed to every channel for received application packets.
    inbound: mpsc::Sender<Inbound>,
    /// Fan-out to subscribers; `None` after shutdown.
    bus: Mutex<Option<broadcast::Sender<Delivery>>>,
    /// Whether any registered channel is connected.
    connected: watch::Sender<bool>,
    /// Service kinds, in activation order.
    descriptors: Vec<ServiceDescriptor>,
    /// Panic on contract violations.
    strict_faults: bool,
    /// Live service instances.
    services: Mutex<Vec<ServiceSlot>>,
    /// Router and keepalive.
    tasks: Mutex<Vec<AbortHandle>>,
    /// Set by the first [`Manager::activate`].
    activated: AtomicBool,
    /// Set once the guest serial link is registered.
    bootstrapped: AtomicBool,
    /// Set by [`Manager::shutdown`].
    closed: AtomicBool,
}

/// A received application packet on the subscriber bus.
#[derive(Debug, Clone)]
struct Delivery {
    /// Sender.
    peer: PeerId,
    /// The packet, shared by all subscribers.
    packet: Arc<Packet>,
}

impl Manager {
    /// Starts building a manager for `role`.
    pub fn builder(role: Role) -> ManagerBuilder {
        ManagerBuilder {
            role,
            config: Config::default(),
            services: Vec::new(),
            strict_faults: cfg!(debug_assertions),
        }
    }

    /// Host or guest.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Time since the manager was built.
    pub fn uptime(&self) -> Duration {
        self.inner.created.elapsed()
    }

    /// Binds a transport to `peer` and starts its channel.
    ///
    /// A channel already registered for `peer` is invalidated first, so at
    /// most one live channel exists per peer.
    pub fn register(
        &self,
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
        peer: impl Into<PeerId>,
    ) {
        let peer = peer.into();
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::warn!(%peer, "manager is shut down, not registering");
            return;
        }

        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(Channel::new(
            peer.clone(),
            epoch,
            input,
            output,
            self.inner.config.keepalive,
            self.inner.inbound.clone(),
        ));
        let previous = lock(&self.inner.peers).insert(peer.clone(), Arc::clone(&channel));

        // Invalidation takes channel locks that connected callbacks hold
        // while looking up the registry, so never invalidate under `peers`.
        if let Some(previous) = previous {
            previous.invalidate();
            tracing::info!(%peer, "replaced existing channel");
        }

        self.watch_link(&channel);
        channel.activate();
        tracing::info!(%peer, epoch, "peer registered");
    }

    /// Invalidates and removes the channel of `peer`, if any.
    pub fn unregister(&self, peer: &PeerId) {
        let removed = lock(&self.inner.peers).remove(peer);
        if let Some(channel) = removed {
            channel.invalidate();
            self.inner.refresh_connected();
            tracing::info!(%peer, "peer unregistered");
        }
    }

    /// Identities of all registered peers, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = lock(&self.inner.peers).keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Returns `true` if `peer` is registered and answering heartbeats.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.channel(peer).is_some_and(|c| c.is_connected())
    }

    /// Aggregate connectivity: `true` while any registered peer is
    /// connected. On a guest this is the link to the host.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Waits until `peer` is connected.
    pub async fn wait_connected(&self, peer: &PeerId) -> Result<()> {
        let channel = self
            .inner
            .channel(peer)
            .ok_or_else(|| Error::UnknownPeer(peer.clone()))?;
        let connected = channel.wait_connected();
        drop(channel);
        connected.await.map_err(|source| Error::Channel {
            peer: peer.clone(),
            source,
        })
    }

    /// Runs `callback` whenever `peer` becomes connected (now, if it is).
    ///
    /// See [`Channel::on_connected`]. The registration ends with the
    /// current channel of `peer`.
    pub fn on_connected<F>(&self, peer: &PeerId, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let channel = self
            .inner
            .channel(peer)
            .ok_or_else(|| Error::UnknownPeer(peer.clone()))?;
        channel.on_connected(callback);
        Ok(())
    }

    /// Sends `payload` to `to`, or to every peer when `to` is `None`.
    ///
    /// Broadcasts are best effort: a peer whose write fails, or does not
    /// finish within the connection timeout, is logged and skipped. A
    /// unicast fails if the peer is unknown or its write fails.
    ///
    /// Payloads with [`Payload::RESEND_ON_RECONNECT`] are not written now;
    /// they are encoded afresh and sent each time the target becomes
    /// connected, starting immediately if it already is.
    ///
    /// A guest may only address the host; anything else is rejected as
    /// [`Error::Fault`] without transmitting.
    pub async fn send<T>(&self, payload: &T, to: Option<&PeerId>) -> Result<()>
    where
        T: Payload + Clone + Sync,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let targets = self.targets(to)?;

        if T::RESEND_ON_RECONNECT {
            for channel in &targets {
                self.send_on_connect(channel, payload.clone());
            }
            return Ok(());
        }

        let stall = self.inner.config.keepalive.connection_timeout();
        for channel in targets {
            let packet = Packet::from_payload(payload)?;
            if let Some(peer) = to {
                return channel.send(&packet).await.map_err(|source| Error::Channel {
                    peer: peer.clone(),
                    source,
                });
            }
            match tokio::time::timeout(stall, channel.send(&packet)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        peer = %channel.peer(),
                        tag = T::TAG,
                        error = %e,
                        "broadcast delivery failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(peer = %channel.peer(), tag = T::TAG, "broadcast delivery stalled");
                }
            }
        }
        Ok(())
    }

    /// Subscribes to every received payload of type `T`.
    ///
    /// Only packets arriving after this call are seen. Dropping the
    /// subscription unsubscribes.
    pub fn stream<T: Payload>(&self) -> Subscription<T> {
        let rx = match lock(&self.inner.bus).as_ref() {
            Some(bus) => bus.subscribe(),
            None => broadcast::channel(1).1,
        };
        Subscription {
            rx,
            _payload: PhantomData,
        }
    }

    /// Starts the keepalive driver and all services.
    ///
    /// Only the first call has an effect.
    pub fn activate(&self) {
        if self.inner.closed.load(Ordering::SeqCst)
            || self.inner.activated.swap(true, Ordering::SeqCst)
        {
            return;
        }

        let pinger = tokio::spawn(keepalive(
            Arc::downgrade(&self.inner),
            self.inner.config.keepalive,
        ));
        lock(&self.inner.tasks).push(pinger.abort_handle());

        let slots: Vec<ServiceSlot> = self
            .inner
            .descriptors
            .iter()
            .map(|d| d.build(self))
            .collect();
        *lock(&self.inner.services) = slots.clone();
        for slot in slots {
            tracing::debug!(service = slot.id, "activating service");
            slot.service.activate();
        }
        tracing::info!(role = %self.inner.role, "manager activated");
    }

    /// Returns the live instance of service kind `S`.
    pub fn service<S: ServiceKind>(&self) -> Result<Arc<S>> {
        lock(&self.inner.services)
            .iter()
            .filter(|slot| slot.id == S::ID)
            .find_map(ServiceSlot::downcast::<S>)
            .ok_or(Error::ServiceUnavailable(S::ID))
    }

    /// Binds a client to its live service.
    pub fn client<C: Client>(&self) -> Result<C> {
        self.service::<C::Service>().map(C::bind)
    }

    /// Opens the configured serial device and registers it as the host.
    ///
    /// Guest only. Succeeds at most once; a failure leaves the manager
    /// untouched so the caller can retry.
    #[cfg(unix)]
    pub fn connect_serial(&self) -> Result<()> {
        if self.inner.role != Role::Guest {
            return Err(self.fault("only a guest manager owns a serial link".into()));
        }
        if self.inner.bootstrapped.load(Ordering::SeqCst) {
            return Err(Error::AlreadyBootstrapped);
        }

        let serial = &self.inner.config.serial;
        let (input, output) = crate::serial::open(serial)?;
        if self.inner.bootstrapped.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyBootstrapped);
        }
        tracing::info!(path = %serial.path.display(), baud = serial.baud, "serial link open");
        self.register(input, output, PeerId::host());
        Ok(())
    }

    /// Stops every task, invalidates every channel and drops the services.
    ///
    /// Open subscriptions end. The manager cannot be reactivated.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        let channels: Vec<Arc<Channel>> = lock(&self.inner.peers).drain().map(|(_, c)| c).collect();
        for channel in &channels {
            channel.invalidate();
        }
        lock(&self.inner.services).clear();
        lock(&self.inner.bus).take();
        self.inner.connected.send_replace(false);
        tracing::info!(role = %self.inner.role, "manager shut down");
    }

    /// Resolves the channels a send goes to.
    fn targets(&self, to: Option<&PeerId>) -> Result<Vec<Arc<Channel>>> {
        match (self.inner.role, to) {
            (Role::Guest, Some(peer)) if !peer.is_host() => {
                Err(self.fault(format!("guest cannot address peer {peer}")))
            }
            (Role::Guest, None) => Ok(self.inner.channel(&PeerId::host()).into_iter().collect()),
            (_, Some(peer)) => self
                .inner
                .channel(peer)
                .map(|c| vec![c])
                .ok_or_else(|| Error::UnknownPeer(peer.clone())),
            (Role::Host, None) => Ok(self.inner.snapshot()),
        }
    }

    /// Defers `payload` until `channel` is connected, and repeats it on
    /// every reconnect.
    ///
    /// Replaces the payload of type `T` previously deferred on the same
    /// channel, so only the latest one is resent.
    fn send_on_connect<T>(&self, channel: &Channel, payload: T)
    where
        T: Payload + Clone + Sync,
    {
        let inner = Arc::downgrade(&self.inner);
        let peer = channel.peer().clone();
        let epoch = channel.epoch();
        channel.replace_on_connected(T::TAG, move || {
            tokio::spawn(resend(
                Weak::clone(&inner),
                peer.clone(),
                epoch,
                payload.clone(),
            ));
        });
    }

    /// Mirrors a channel's liveness into the aggregate state.
    fn watch_link(&self, channel: &Channel) {
        let inner = Arc::downgrade(&self.inner);
        let mut rx = channel.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.refresh_connected();
                if rx.borrow_and_update().invalidated {
                    return;
                }
            }
        });
    }

    /// Logs and returns a contract violation.
    ///
    /// # Panics
    ///
    /// When built with [`ManagerBuilder::strict_faults`] (the debug build
    /// default).
    fn fault(&self, what: String) -> Error {
        tracing::error!(role = %self.inner.role, "{what}");
        assert!(!self.inner.strict_faults, "contract violation: {what}");
        Error::Fault(what)
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("role", &self.inner.role)
            .field("peers", &self.peers())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Registered channel of `peer`.
    fn channel(&self, peer: &PeerId) -> Option<Arc<Channel>> {
        lock(&self.peers).get(peer).cloned()
    }

    /// Consistent copy of the registry for cross-peer operations.
    fn snapshot(&self) -> Vec<Arc<Channel>> {
        lock(&self.peers).values().cloned().collect()
    }

    /// Recomputes the aggregate connectivity.
    fn refresh_connected(&self) {
        let any = lock(&self.peers).values().any(|c| c.is_connected());
        self.connected
            .send_if_modified(|c| std::mem::replace(c, any) != any);
    }

    /// Relays and publishes one received packet.
    ///
    /// Relayed copies are queued on each destination channel and never
    /// awaited here.
    fn dispatch(&self, inbound: Inbound) {
        let Inbound {
            peer,
            epoch,
            packet,
        } = inbound;
        let peers = self.snapshot();

        // Packets decoded by a channel that has since been replaced or
        // removed are dropped.
        if !peers.iter().any(|c| *c.peer() == peer && c.epoch() == epoch) {
            tracing::trace!(%peer, epoch, tag = packet.tag(), "dropping packet from stale channel");
            return;
        }

        if self.role == Role::Host && self.config.propagation && packet.propagate() {
            for channel in peers.iter().filter(|c| *c.peer() != peer) {
                if let Err(e) = channel.forward(packet.clone()) {
                    tracing::warn!(
                        from = %peer,
                        to = %channel.peer(),
                        tag = packet.tag(),
                        error = %e,
                        "propagation failed"
                    );
                }
            }
        }

        if let Some(bus) = lock(&self.bus).as_ref() {
            // No subscribers is fine.
            let _ = bus.send(Delivery {
                peer,
                packet: Arc::new(packet),
            });
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// A typed view of received packets.
///
/// Yields `(sender, payload)` for every packet tagged [`Payload::TAG`] that
/// decodes as `T`; others are skipped.
pub struct Subscription<T> {
    /// Subscriber end of the bus.
    rx: broadcast::Receiver<Delivery>,
    /// Decoded type.
    _payload: PhantomData<fn() -> T>,
}

impl<T: Payload> Subscription<T> {
    /// Waits for the next matching payload.
    ///
    /// Returns `None` once the manager has shut down.
    pub async fn next(&mut self) -> Option<(PeerId, T)> {
        loop {
            let delivery = match self.rx.recv().await {
                Ok(delivery) => delivery,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(tag = T::TAG, skipped, "subscriber lagged, packets lost");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };
            match delivery.packet.decode::<T>() {
                Some(Ok(payload)) => return Some((delivery.peer, payload)),
                Some(Err(e)) => {
                    tracing::warn!(peer = %delivery.peer, tag = T::TAG, error = %e, "undecodable payload");
                }
                None => {}
            }
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("payload", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

/// Router task: drains the inbound queue in arrival order.
async fn route(inner: Weak<Inner>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(packet) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(packet);
    }
}

/// Keepalive task: the only source of pings.
async fn keepalive(inner: Weak<Inner>, timing: Keepalive) {
    let mut ticker = tokio::time::interval(timing.ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let scheduled = ticker.tick().await;
        let late = scheduled.elapsed();
        if late > timing.ping_tolerance() {
            tracing::debug!(late_ms = late.as_millis(), "keepalive tick late");
        }

        let Some(channels) = inner.upgrade().map(|i| i.snapshot()) else {
            return;
        };
        for channel in channels {
            // A stalled transport must not hold up pings to the others.
            match tokio::time::timeout(timing.ping_interval(), channel.send(&Packet::ping())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(peer = %channel.peer(), error = %e, "ping failed"),
                Err(_) => tracing::debug!(peer = %channel.peer(), "ping write stalled"),
            }
        }
    }
}

/// One resend-on-reconnect transmission, encoded at send time.
async fn resend<T: Payload>(inner: Weak<Inner>, peer: PeerId, epoch: u64, payload: T) {
    let Some(channel) = inner
        .upgrade()
        .and_then(|i| i.channel(&peer))
        .filter(|c| c.epoch() == epoch)
    else {
        return;
    };
    let packet = match Packet::from_payload(&payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::error!(%peer, tag = T::TAG, error = %e, "payload serialization failed");
            return;
        }
    };
    match channel.send(&packet).await {
        Ok(()) => tracing::debug!(%peer, tag = T::TAG, "sent on connect"),
        Err(e) => tracing::warn!(%peer, tag = T::TAG, error = %e, "send on connect failed"),
    }
}
