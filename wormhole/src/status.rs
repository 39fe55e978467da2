//! Built-in status service: every manager can be asked for its version and
//! uptime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use wormhole_proto::{StatusReport, StatusRequest};

use crate::service::{Client, Service, ServiceKind};
use crate::{Error, Manager, PeerId, Result, Role, lock};

/// Answers [`StatusRequest`]s and matches incoming [`StatusReport`]s to
/// outstanding queries.
#[derive(Debug)]
pub struct StatusService {
    /// Owning manager.
    manager: Manager,
    /// Queries waiting for a report, by nonce.
    pending: Mutex<HashMap<u64, oneshot::Sender<StatusReport>>>,
    /// Next query nonce.
    nonce: AtomicU64,
}

impl StatusService {
    /// This side's report, answering `nonce`.
    pub fn report(&self, nonce: u64) -> StatusReport {
        StatusReport {
            nonce,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            guest: self.manager.role() == Role::Guest,
            uptime_ms: u64::try_from(self.manager.uptime().as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Replies to one request.
    async fn answer(&self, peer: PeerId, request: StatusRequest) {
        let report = self.report(request.nonce);
        if let Err(e) = self.manager.send(&report, Some(&peer)).await {
            tracing::warn!(%peer, error = %e, "status reply failed");
        }
    }

    /// Hands a report to its waiting query, if any.
    fn resolve(&self, peer: &PeerId, report: StatusReport) {
        match lock(&self.pending).remove(&report.nonce) {
            Some(waiter) => {
                let _ = waiter.send(report);
            }
            None => tracing::debug!(%peer, nonce = report.nonce, "unsolicited status report"),
        }
    }
}

impl Service for StatusService {
    fn activate(self: Arc<Self>) {
        let mut requests = self.manager.stream::<StatusRequest>();
        let mut reports = self.manager.stream::<StatusReport>();

        let service = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some((peer, request)) = requests.next().await {
                service.answer(peer, request).await;
            }
        });
        tokio::spawn(async move {
            while let Some((peer, report)) = reports.next().await {
                self.resolve(&peer, report);
            }
        });
    }
}

impl ServiceKind for StatusService {
    const ID: &'static str = "wormhole.status";

    fn new(manager: &Manager) -> Self {
        Self {
            manager: manager.clone(),
            pending: Mutex::new(HashMap::new()),
            nonce: AtomicU64::new(1),
        }
    }
}

/// Queries the status of remote peers.
///
/// Obtained with [`Manager::client`].
#[derive(Debug, Clone)]
pub struct StatusClient {
    /// The live service.
    service: Arc<StatusService>,
}

impl Client for StatusClient {
    type Service = StatusService;

    fn bind(service: Arc<StatusService>) -> Self {
        Self { service }
    }
}

impl StatusClient {
    /// Asks `peer` for its status and waits up to `timeout` for the report.
    pub async fn query(&self, peer: &PeerId, timeout: Duration) -> Result<StatusReport> {
        let nonce = self.service.nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.service.pending).insert(nonce, tx);

        let sent = self
            .service
            .manager
            .send(&StatusRequest { nonce }, Some(peer))
            .await;
        if let Err(e) = sent {
            lock(&self.service.pending).remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                lock(&self.service.pending).remove(&nonce);
                Err(Error::Timeout("status report"))
            }
        }
    }

    /// This side's own report.
    pub fn local(&self) -> StatusReport {
        self.service.report(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Remote, crossover};

    fn manager(role: Role) -> Manager {
        Manager::builder(role)
            .service::<StatusService>()
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn host_queries_guest() {
        let host = manager(Role::Host);
        let guest = manager(Role::Guest);
        let (host_in, host_out, guest_in, guest_out) = crossover();
        host.register(host_in, host_out, "guest-1");
        guest.register(guest_in, guest_out, PeerId::host());
        host.activate();
        guest.activate();

        let peer = PeerId::new("guest-1");
        host.wait_connected(&peer).await.unwrap();

        let status = host.client::<StatusClient>().unwrap();
        let report = status.query(&peer, Duration::from_secs(1)).await.unwrap();
        assert!(report.guest);
        assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
        assert!(!status.local().guest);

        let reverse = guest.client::<StatusClient>().unwrap();
        let report = reverse
            .query(&PeerId::host(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!report.guest);

        host.shutdown();
        guest.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let host = manager(Role::Host);
        let (input, output, _remote) = Remote::pair();
        host.register(input, output, "guest-1");
        host.activate();

        let status = host.client::<StatusClient>().unwrap();
        let err = status
            .query(&PeerId::new("guest-1"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(lock(&status.service.pending).is_empty());
        host.shutdown();
    }

    #[tokio::test]
    async fn unknown_peer_fails_fast() {
        let host = manager(Role::Host);
        host.activate();
        let status = host.client::<StatusClient>().unwrap();
        let err = status
            .query(&PeerId::new("nobody"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
        host.shutdown();
    }
}
