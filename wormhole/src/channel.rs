//! Per-peer channel: one transport, one receive loop, one liveness watchdog.
//!
//! ```text
//! inactive ──activate──> active, not connected ──ping/pong──> active, connected
//!                              ^                                    │
//!                              └──────────── timeout ───────────────┘
//!             any state ──invalidate──> invalidated (terminal)
//! ```
//!
//! The receive loop answers pings, feeds the watchdog and forwards
//! application packets to the manager. A read failure (including EOF, e.g.
//! while the VM has not booted yet) restarts the loop after a fixed backoff
//! until the channel is invalidated.
//!
//! Packets relayed on behalf of other peers go through a bounded queue
//! drained by a writer task of their own, so a peer that stops reading only
//! ever stalls its own queue.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::AbortHandle;
use wormhole_proto::{DecodeError, FrameReader, Packet, PacketKind};

use crate::config::Keepalive;
use crate::error::ChannelError;
use crate::{PeerId, lock};

/// Boxed input half of a transport.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed output half of a transport.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Relayed packets buffered per channel before new ones are dropped.
pub const RELAY_QUEUE: usize = 256;

/// An application packet received on a channel.
#[derive(Debug)]
pub struct Inbound {
    /// Sender of the packet.
    pub peer: PeerId,
    /// Registration epoch of the channel that decoded it.
    pub epoch: u64,
    /// The packet, as decoded.
    pub packet: Packet,
}

/// Observable liveness of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    /// A ping or pong arrived within the connection timeout.
    pub connected: bool,
    /// Number of transitions to connected so far.
    pub sessions: u64,
    /// The channel has been torn down.
    pub invalidated: bool,
}

/// Live transport binding and protocol state for exactly one peer.
///
/// Channels are owned by the [`Manager`](crate::Manager) registry. Dropping
/// a channel invalidates it.
pub struct Channel {
    /// State shared with the background tasks.
    shared: Arc<Shared>,
    /// Input stream, moved into the receive loop on activation.
    reader: Mutex<Option<BoxReader>>,
    /// Producer end of the relay queue.
    relay: mpsc::Sender<Packet>,
    /// Consumer end of the relay queue, moved into the relay writer on
    /// activation.
    relayed: Mutex<Option<mpsc::Receiver<Packet>>>,
    /// Receive loop, watchdog, relay writer and callback watchers.
    tasks: Mutex<Vec<AbortHandle>>,
    /// Callback watchers registered under a key; a new one replaces the old.
    keyed: Mutex<HashMap<&'static str, AbortHandle>>,
}

/// Channel state reachable from its background tasks.
struct Shared {
    /// Remote peer.
    peer: PeerId,
    /// Registration epoch.
    epoch: u64,
    /// Timing parameters.
    keepalive: Keepalive,
    /// Output stream. Writers serialize on this lock.
    writer: tokio::sync::Mutex<BoxWriter>,
    /// Liveness, published to observers.
    state: watch::Sender<LinkState>,
    /// Held while a connected callback runs; invalidation takes it to fence
    /// callbacks off.
    gate: Mutex<()>,
    /// Signalled on every ping or pong.
    heartbeat: Notify,
    /// Application packets towards the manager.
    inbound: mpsc::Sender<Inbound>,
}

impl Channel {
    /// Creates an inactive channel over a transport.
    pub fn new(
        peer: PeerId,
        epoch: u64,
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
        keepalive: Keepalive,
        inbound: mpsc::Sender<Inbound>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::default());
        let (relay, relayed) = mpsc::channel(RELAY_QUEUE);
        Self {
            shared: Arc::new(Shared {
                peer,
                epoch,
                keepalive,
                writer: tokio::sync::Mutex::new(Box::new(output)),
                state,
                gate: Mutex::new(()),
                heartbeat: Notify::new(),
                inbound,
            }),
            reader: Mutex::new(Some(Box::new(input))),
            relay,
            relayed: Mutex::new(Some(relayed)),
            tasks: Mutex::new(Vec::new()),
            keyed: Mutex::new(HashMap::new()),
        }
    }

    /// Remote peer of this channel.
    pub fn peer(&self) -> &PeerId {
        &self.shared.peer
    }

    /// Registration epoch; differs for every channel a manager creates.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch
    }

    /// Starts the receive loop, the watchdog and the relay writer.
    ///
    /// Idempotent. Does nothing once the channel is invalidated.
    pub fn activate(&self) {
        let Some(reader) = lock(&self.reader).take() else {
            return;
        };
        let relayed = lock(&self.relayed).take();
        let mut tasks = lock(&self.tasks);
        if self.shared.state.borrow().invalidated {
            return;
        }
        tasks.push(tokio::spawn(receive_loop(Arc::clone(&self.shared), reader)).abort_handle());
        tasks.push(tokio::spawn(watchdog(Arc::clone(&self.shared))).abort_handle());
        if let Some(relayed) = relayed {
            tasks.push(tokio::spawn(relay_loop(Arc::clone(&self.shared), relayed)).abort_handle());
        }
        tracing::debug!(peer = %self.shared.peer, epoch = self.shared.epoch, "channel activated");
    }

    /// Frames `packet` and writes it to the output stream.
    ///
    /// Failures are returned as-is; the channel never retries.
    pub async fn send(&self, packet: &Packet) -> Result<(), ChannelError> {
        self.shared.write(packet).await
    }

    /// Queues `packet` for the relay writer without waiting for the
    /// transport.
    ///
    /// Fails with [`ChannelError::Backlogged`] when [`RELAY_QUEUE`] packets
    /// are already waiting; the packet is dropped. Write failures of queued
    /// packets are logged by the writer.
    pub fn forward(&self, packet: Packet) -> Result<(), ChannelError> {
        if self.shared.state.borrow().invalidated {
            return Err(ChannelError::Invalidated);
        }
        self.relay.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Backlogged,
            TrySendError::Closed(_) => ChannelError::Invalidated,
        })
    }

    /// Returns `true` while the peer answers heartbeats.
    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().connected
    }

    /// Current liveness snapshot.
    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Observes liveness changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the peer is connected (immediately if it already is).
    ///
    /// Fails with [`ChannelError::Invalidated`] if the channel is torn down
    /// first. The future does not borrow the channel.
    pub fn wait_connected(&self) -> impl Future<Output = Result<(), ChannelError>> + Send + 'static {
        let mut rx = self.subscribe();
        async move {
            let invalidated = rx
                .wait_for(|s| s.connected || s.invalidated)
                .await
                .map_err(|_| ChannelError::Invalidated)?
                .invalidated;
            if invalidated {
                Err(ChannelError::Invalidated)
            } else {
                Ok(())
            }
        }
    }

    /// Runs `callback` now if connected, and again on every reconnect.
    ///
    /// Stops for good when the channel is invalidated; once
    /// [`invalidate`](Self::invalidate) returns the callback never runs
    /// again. The callback runs on a runtime worker and must not block or
    /// invalidate this channel.
    pub fn on_connected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut tasks = lock(&self.tasks);
        if let Some(watcher) = self.watch_connected(callback) {
            tasks.push(watcher);
        }
    }

    /// Like [`on_connected`](Self::on_connected), but replaces the callback
    /// previously registered under `key`, so at most one callback per key
    /// stays alive.
    pub fn replace_on_connected<F>(&self, key: &'static str, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        // Held so invalidation cannot drain the keyed watchers in between.
        let _tasks = lock(&self.tasks);
        let Some(watcher) = self.watch_connected(callback) else {
            return;
        };
        if let Some(previous) = lock(&self.keyed).insert(key, watcher) {
            previous.abort();
        }
    }

    /// Spawns a watcher running `callback` on every new session.
    ///
    /// Callers hold the `tasks` lock. Returns `None` once invalidated.
    fn watch_connected<F>(&self, callback: F) -> Option<AbortHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.shared.state.borrow().invalidated {
            return None;
        }
        let shared = Arc::clone(&self.shared);
        let mut rx = self.subscribe();
        let watcher = tokio::spawn(async move {
            let mut seen = 0;
            loop {
                let Ok(state) = rx
                    .wait_for(|s| s.invalidated || (s.connected && s.sessions > seen))
                    .await
                    .map(|s| *s)
                else {
                    return;
                };
                if state.invalidated || !shared.fire(&callback) {
                    return;
                }
                seen = state.sessions;
            }
        });
        Some(watcher.abort_handle())
    }

    /// Tears the channel down: cancels every background task, drops the
    /// transport and forces `connected` to false.
    ///
    /// Idempotent. After it returns no callback fires and no I/O happens.
    pub fn invalidate(&self) {
        {
            let _gate = lock(&self.shared.gate);
            let first = self.shared.state.send_if_modified(|s| {
                if s.invalidated {
                    return false;
                }
                s.invalidated = true;
                s.connected = false;
                true
            });
            if !first {
                return;
            }
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        for (_, watcher) in lock(&self.keyed).drain() {
            watcher.abort();
        }
        lock(&self.reader).take();
        lock(&self.relayed).take();
        tracing::debug!(peer = %self.shared.peer, epoch = self.shared.epoch, "channel invalidated");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.shared.peer)
            .field("epoch", &self.shared.epoch)
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Encodes and writes one frame.
    async fn write(&self, packet: &Packet) -> Result<(), ChannelError> {
        let frame = wormhole_proto::encode(packet)?;
        let mut writer = self.writer.lock().await;
        if self.state.borrow().invalidated {
            return Err(ChannelError::Invalidated);
        }
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Decodes packets until the stream fails; returns that failure.
    async fn receive<R: AsyncRead + Unpin>(&self, mut frames: FrameReader<R>) -> DecodeError {
        loop {
            match frames.next_packet().await {
                Ok(packet) => self.dispatch(packet).await,
                Err(e) if e.is_fatal() => return e,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "dropping malformed frame");
                }
            }
        }
    }

    /// Handles one decoded packet.
    async fn dispatch(&self, packet: Packet) {
        match packet.kind() {
            PacketKind::Ping => {
                self.mark_alive();
                if let Err(e) = self.write(&Packet::pong()).await {
                    tracing::debug!(peer = %self.peer, error = %e, "pong failed");
                }
            }
            PacketKind::Pong => self.mark_alive(),
            PacketKind::Message => {
                let inbound = Inbound {
                    peer: self.peer.clone(),
                    epoch: self.epoch,
                    packet,
                };
                if self.inbound.send(inbound).await.is_err() {
                    tracing::debug!(peer = %self.peer, "inbound queue closed, dropping packet");
                }
            }
            kind => tracing::trace!(peer = %self.peer, ?kind, "ignoring frame"),
        }
    }

    /// Records a heartbeat and re-arms the watchdog.
    fn mark_alive(&self) {
        let reconnected = self.state.send_if_modified(|s| {
            if s.connected || s.invalidated {
                return false;
            }
            s.connected = true;
            s.sessions += 1;
            true
        });
        if reconnected {
            tracing::info!(peer = %self.peer, "peer connected");
        }
        self.heartbeat.notify_one();
    }

    /// Watchdog expiry.
    fn mark_lost(&self) {
        if self
            .state
            .send_if_modified(|s| std::mem::replace(&mut s.connected, false))
        {
            tracing::warn!(
                peer = %self.peer,
                timeout_ms = self.keepalive.connection_timeout_ms,
                "peer timed out"
            );
        }
    }

    /// Runs a connected callback unless the channel is invalidated.
    fn fire(&self, callback: &impl Fn()) -> bool {
        let _gate = lock(&self.gate);
        if self.state.borrow().invalidated {
            return false;
        }
        callback();
        true
    }
}

/// Restarts decoding from scratch after every read failure.
async fn receive_loop(shared: Arc<Shared>, mut reader: BoxReader) {
    loop {
        match shared.receive(FrameReader::new(&mut reader)).await {
            DecodeError::Eof => tracing::debug!(peer = %shared.peer, "transport closed, retrying"),
            e => tracing::warn!(peer = %shared.peer, error = %e, "transport read failed, retrying"),
        }
        tokio::time::sleep(shared.keepalive.read_backoff()).await;
    }
}

/// Drains the relay queue into the transport, one packet at a time.
async fn relay_loop(shared: Arc<Shared>, mut queue: mpsc::Receiver<Packet>) {
    while let Some(packet) = queue.recv().await {
        if let Err(e) = shared.write(&packet).await {
            tracing::warn!(peer = %shared.peer, tag = packet.tag(), error = %e, "relay write failed");
        }
    }
}

/// Flips `connected` to false when heartbeats stop.
///
/// Arms on the first heartbeat, fires at most once per silent window, then
/// waits for the next heartbeat.
async fn watchdog(shared: Arc<Shared>) {
    let timeout = shared.keepalive.connection_timeout();
    loop {
        shared.heartbeat.notified().await;
        while tokio::time::timeout(timeout, shared.heartbeat.notified())
            .await
            .is_ok()
        {}
        shared.mark_lost();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::duplex;

    use super::*;
    use crate::testing::{BrokenPipe, FlakyReader, Remote};

    fn keepalive() -> Keepalive {
        Keepalive::default()
    }

    fn open(peer: &str) -> (Channel, Remote, mpsc::Receiver<Inbound>) {
        let (input, output, remote) = Remote::pair();
        let (tx, rx) = mpsc::channel(64);
        let channel = Channel::new(PeerId::new(peer), 7, input, output, keepalive(), tx);
        channel.activate();
        (channel, remote, rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn every_ping_gets_one_pong() {
        let (channel, mut remote, _rx) = open("guest-1");
        channel.activate();

        for _ in 0..3 {
            remote.send(&Packet::ping()).await;
        }
        for _ in 0..3 {
            assert_eq!(remote.recv().await.kind(), PacketKind::Pong);
        }
        assert!(remote.silent(Duration::from_secs(1)).await);

        remote.send(&Packet::pong()).await;
        assert!(remote.silent(Duration::from_secs(1)).await);
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_channel_connected() {
        let (channel, mut remote, _rx) = open("guest-1");
        assert!(!channel.is_connected());

        remote.send(&Packet::ping()).await;
        channel.wait_connected().await.unwrap();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(channel.is_connected());
            remote.send(&Packet::ping()).await;
        }
        assert_eq!(channel.state().sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_disconnects_once_per_window() {
        let (channel, mut remote, _rx) = open("guest-1");
        let mut rx = channel.subscribe();

        remote.send(&Packet::pong()).await;
        channel.wait_connected().await.unwrap();
        rx.borrow_and_update();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!channel.is_connected());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!rx.has_changed().unwrap());

        remote.send(&Packet::pong()).await;
        channel.wait_connected().await.unwrap();
        assert_eq!(channel.state().sessions, 2);
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (channel, mut remote, mut rx) = open("guest-1");

        for i in 0u8..10 {
            remote.send(&Packet::message("test.seq", vec![i], false)).await;
        }
        for i in 0u8..10 {
            let inbound = rx.recv().await.unwrap();
            assert_eq!(inbound.peer, "guest-1");
            assert_eq!(inbound.epoch, channel.epoch());
            assert_eq!(inbound.packet.payload(), &[i]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn on_connected_fires_now_and_on_reconnect() {
        let (channel, mut remote, _rx) = open("guest-1");
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&early);
        channel.on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;
        assert_eq!(early.load(Ordering::SeqCst), 0);

        remote.send(&Packet::ping()).await;
        channel.wait_connected().await.unwrap();
        settle().await;
        assert_eq!(early.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&late);
        channel.on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;
        assert_eq!(late.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!channel.is_connected());
        remote.send(&Packet::ping()).await;
        channel.wait_connected().await.unwrap();
        settle().await;
        assert_eq!(early.load(Ordering::SeqCst), 2);
        assert_eq!(late.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_stops_all_activity() {
        let (channel, mut remote, mut rx) = open("guest-1");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        remote.send(&Packet::ping()).await;
        channel.wait_connected().await.unwrap();
        assert_eq!(remote.recv().await.kind(), PacketKind::Pong);
        settle().await;

        channel.invalidate();
        channel.invalidate();
        let state = channel.state();
        assert!(state.invalidated);
        assert!(!state.connected);
        assert!(matches!(
            channel.send(&Packet::ping()).await,
            Err(ChannelError::Invalidated)
        ));
        assert!(channel.wait_connected().await.is_err());

        // The input half may already be gone, so writes are allowed to fail.
        let _ = remote.try_send(&Packet::ping()).await;
        let _ = remote
            .try_send(&Packet::message("test.late", vec![1], false))
            .await;
        assert!(remote.silent(Duration::from_secs(1)).await);
        assert!(rx.try_recv().is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        channel.activate();
        assert!(remote.silent(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_a_callback_drops_the_previous_one() {
        let (channel, mut remote, _rx) = open("guest-1");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        channel.replace_on_connected("test.hello", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&second);
        channel.replace_on_connected("test.hello", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;

        remote.send(&Packet::ping()).await;
        channel.wait_connected().await.unwrap();
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(lock(&channel.keyed).len(), 1);

        channel.invalidate();
        assert!(lock(&channel.keyed).is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_reading_continues() {
        let (channel, mut remote, mut rx) = open("guest-1");

        let mut bad = wormhole_proto::MAGIC.to_vec();
        bad.extend_from_slice(&3u32.to_be_bytes());
        bad.extend_from_slice(&wormhole_proto::header_check(3).to_be_bytes());
        bad.extend_from_slice(&[0xff, 0xff, 0xff]);
        remote.send_raw(&bad).await;
        remote.send(&Packet::ping()).await;

        assert_eq!(remote.recv().await.kind(), PacketKind::Pong);
        channel.wait_connected().await.unwrap();
        assert!(rx.try_recv().is_err());

        remote.send(&Packet::message("test.after", vec![9], false)).await;
        assert_eq!(rx.recv().await.unwrap().packet.payload(), &[9]);
    }

    #[tokio::test]
    async fn forwarded_packets_are_written_in_order() {
        let (channel, mut remote, _rx) = open("guest-1");

        for i in 0u8..5 {
            channel
                .forward(Packet::message("test.seq", vec![i], true))
                .unwrap();
        }
        for i in 0u8..5 {
            assert_eq!(remote.recv().await.payload(), &[i]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_backlogs_without_blocking_forward() {
        let (input, mut to_channel) = duplex(64);
        // Kept alive but never read, so the output fills after 64 bytes.
        let (output, _from_channel) = duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        let channel = Channel::new(PeerId::new("stuck"), 1, input, output, keepalive(), tx);
        channel.activate();

        let bulk = Packet::message("test.bulk", vec![7; 1024], true);
        let mut backlogged = 0;
        for _ in 0..RELAY_QUEUE + 8 {
            match channel.forward(bulk.clone()) {
                Ok(()) => {}
                Err(ChannelError::Backlogged) => backlogged += 1,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(backlogged > 0);

        // Reading is unaffected by the stalled writer.
        let frame = wormhole_proto::encode(&Packet::message("test.in", vec![1], false)).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut to_channel, &frame)
            .await
            .unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.packet.payload(), &[1]);

        channel.invalidate();
        assert!(matches!(
            channel.forward(bulk),
            Err(ChannelError::Invalidated)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_restarts_receive_loop() {
        let (input, to_channel) = duplex(1024);
        let (output, from_channel) = duplex(1024);
        let (tx, _rx) = mpsc::channel(8);
        let channel = Channel::new(
            PeerId::host(),
            1,
            FlakyReader::new(input, 3),
            output,
            keepalive(),
            tx,
        );
        channel.activate();

        let mut remote = Remote::from_parts(to_channel, from_channel);
        remote.send(&Packet::pong()).await;
        channel.wait_connected().await.unwrap();
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let (input, _to_channel) = duplex(64);
        let (tx, _rx) = mpsc::channel(8);
        let channel = Channel::new(PeerId::host(), 1, input, BrokenPipe, keepalive(), tx);
        channel.activate();

        let err = channel.send(&Packet::ping()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)));
    }
}
